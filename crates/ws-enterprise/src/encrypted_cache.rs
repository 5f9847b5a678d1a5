//! Per-project encrypted disk cache and the tmpfs materializer sitting in
//! front of it.
//!
//! Checkout in enterprise mode is two-step: copy decrypted bodies out of a
//! persistent, AES-GCM-encrypted on-disk cache into the fast scratch
//! location the session actually runs against, refreshing the cache from
//! the object store first if its manifest generation lags the remote.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::model::ManifestEntry;
use ws_core::Result;
use ws_crypto::{ciphertext, KeyProvider};

const DEK_TTL: Duration = Duration::from_secs(600);

struct MemoizedDek {
    dek: [u8; 32],
    fetched_at: Instant,
}

/// Keeps a project's unwrapped DEK in memory for a bounded TTL so the cache
/// doesn't round-trip to the key provider on every file.
#[derive(Default)]
pub struct DekMemo {
    entries: RwLock<BTreeMap<String, MemoizedDek>>,
}

impl DekMemo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch<F, Fut>(&self, project_id: &str, fetch: F) -> Result<[u8; 32]>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<[u8; 32]>>,
    {
        if let Some(entry) = self.entries.read().await.get(project_id) {
            if entry.fetched_at.elapsed() < DEK_TTL {
                return Ok(entry.dek);
            }
        }
        let dek = fetch().await?;
        self.entries.write().await.insert(project_id.to_string(), MemoizedDek { dek, fetched_at: Instant::now() });
        Ok(dek)
    }
}

/// A per-project cache directory: `<cacheDir>/<user>/<project>/{files, .meta/cache-manifest.json}`.
pub struct EncryptedDiskCache {
    root: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Default)]
struct CacheManifest {
    generation: u64,
    files: BTreeMap<String, ManifestEntry>,
}

impl EncryptedDiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_dir(&self, user_id: &str, project_id: &str) -> PathBuf {
        self.root.join(user_id).join(project_id)
    }

    fn manifest_path(&self, user_id: &str, project_id: &str) -> PathBuf {
        self.project_dir(user_id, project_id).join(".meta").join("cache-manifest.json")
    }

    async fn read_manifest(&self, user_id: &str, project_id: &str) -> Result<CacheManifest> {
        let path = self.manifest_path(user_id, project_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheManifest::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, user_id: &str, project_id: &str, manifest: &CacheManifest) -> Result<()> {
        let path = self.manifest_path(user_id, project_id);
        tokio::fs::create_dir_all(path.parent().unwrap()).await?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(manifest)?).await?;
        Ok(())
    }

    pub async fn cached_generation(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<u64> {
        bail_if_canceled(ctx, "cache manifest read")?;
        Ok(self.read_manifest(user_id, project_id).await?.generation)
    }

    /// Refresh the cache from `hydrate`, which yields every (relative path,
    /// plaintext) pair under the project's `files/` prefix, then re-encrypt
    /// each under `dek` and persist.
    pub async fn refresh<I>(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, generation: u64, dek: &[u8; 32], files: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Vec<u8>)>,
    {
        let files_dir = self.project_dir(user_id, project_id).join("files");
        tokio::fs::create_dir_all(&files_dir).await?;

        let mut manifest = CacheManifest { generation, files: BTreeMap::new() };
        for (rel_path, plaintext) in files {
            bail_if_canceled(ctx, "cache refresh")?;
            let sha256 = hex_sha256(&plaintext);
            let ciphertext = ciphertext::encrypt(dek, &plaintext)?;
            let dest = files_dir.join(&rel_path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, &ciphertext).await?;
            manifest.files.insert(rel_path, ManifestEntry { size: plaintext.len() as u64, sha256, etag: String::new(), last_modified: chrono::Utc::now() });
        }
        self.write_manifest(user_id, project_id, &manifest).await?;
        Ok(())
    }

    /// Copy decrypted bodies from the cache into `dest_dir` (the tmpfs
    /// session directory).
    pub async fn materialize(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, dek: &[u8; 32], dest_dir: &Path) -> Result<()> {
        let manifest = self.read_manifest(user_id, project_id).await?;
        let files_dir = self.project_dir(user_id, project_id).join("files");
        tokio::fs::create_dir_all(dest_dir).await?;
        for rel_path in manifest.files.keys() {
            bail_if_canceled(ctx, "cache materialize")?;
            let encrypted = tokio::fs::read(files_dir.join(rel_path)).await?;
            let plaintext = ciphertext::decrypt(dek, &encrypted)?;
            let dest = dest_dir.join(rel_path);
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&dest, &plaintext).await?;
        }
        Ok(())
    }

    /// Re-encrypt `changed` paths (relative path -> new plaintext) into the
    /// cache after a commit, bumping the cache manifest's generation.
    pub async fn sync_back(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, generation: u64, dek: &[u8; 32], changed: Vec<(String, Option<Vec<u8>>)>) -> Result<()> {
        let mut manifest = self.read_manifest(user_id, project_id).await?;
        let files_dir = self.project_dir(user_id, project_id).join("files");
        for (rel_path, plaintext) in changed {
            bail_if_canceled(ctx, "cache sync-back")?;
            match plaintext {
                Some(data) => {
                    let sha256 = hex_sha256(&data);
                    let ciphertext = ciphertext::encrypt(dek, &data)?;
                    let dest = files_dir.join(&rel_path);
                    if let Some(parent) = dest.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&dest, &ciphertext).await?;
                    manifest.files.insert(rel_path, ManifestEntry { size: data.len() as u64, sha256, etag: String::new(), last_modified: chrono::Utc::now() });
                }
                None => {
                    let _ = tokio::fs::remove_file(files_dir.join(&rel_path)).await;
                    manifest.files.remove(&rel_path);
                }
            }
        }
        manifest.generation = generation;
        self.write_manifest(user_id, project_id, &manifest).await?;
        Ok(())
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Resolves a [`KeyProvider`] DEK with memoization; shared across cache
/// instances for a process.
pub async fn unwrap_memoized(ctx: &CancellationToken, memo: &DekMemo, provider: &Arc<dyn KeyProvider>, project_id: &str, envelope: &ws_core::model::EncryptionEnvelope) -> Result<[u8; 32]> {
    let ctx = ctx.clone();
    let provider = provider.clone();
    let envelope = envelope.clone();
    let project_id_owned = project_id.to_string();
    memo.get_or_fetch(project_id, move || async move { ws_crypto::unwrap_active(&ctx, provider.as_ref(), &project_id_owned, &envelope).await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ws_crypto::generate_dek;

    #[tokio::test]
    async fn refresh_then_materialize_roundtrips_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EncryptedDiskCache::new(dir.path());
        let dek = generate_dek();
        let ctx = CancellationToken::new();

        cache.refresh(&ctx, "u1", "p1", 3, &dek, vec![("a.txt".to_string(), b"hello".to_vec())]).await.unwrap();
        assert_eq!(cache.cached_generation(&ctx, "u1", "p1").await.unwrap(), 3);

        let dest = dir.path().join("session");
        cache.materialize(&ctx, "u1", "p1", &dek, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(dest.join("a.txt")).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn sync_back_applies_edits_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EncryptedDiskCache::new(dir.path());
        let dek = generate_dek();
        let ctx = CancellationToken::new();
        cache.refresh(&ctx, "u1", "p1", 1, &dek, vec![("a.txt".into(), b"one".to_vec()), ("b.txt".into(), b"two".to_vec())]).await.unwrap();

        cache
            .sync_back(&ctx, "u1", "p1", 2, &dek, vec![("a.txt".to_string(), Some(b"changed".to_vec())), ("b.txt".to_string(), None)])
            .await
            .unwrap();

        let dest = dir.path().join("session2");
        cache.materialize(&ctx, "u1", "p1", &dek, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(dest.join("a.txt")).await.unwrap(), b"changed");
        assert!(!dest.join("b.txt").exists());
        assert_eq!(cache.cached_generation(&ctx, "u1", "p1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn dek_memo_reuses_cached_value_within_ttl() {
        let memo = DekMemo::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls2 = calls.clone();
        let dek = memo
            .get_or_fetch("p1", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(generate_dek())
                }
            })
            .await
            .unwrap();
        let calls3 = calls.clone();
        let dek2 = memo
            .get_or_fetch("p1", move || {
                let calls = calls3.clone();
                async move {
                    calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(generate_dek())
                }
            })
            .await
            .unwrap();
        assert_eq!(dek, dek2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
