//! `ObjectStoreProjectsService`: the same contract as `FsProjectsService`,
//! implemented over a `ws_store::ObjectStore` with a bounded-TTL
//! `listProjects` cache.

use crate::contract::ProjectsService;
use crate::crypto_support;
use crate::meta_io::MetaIo;
use crate::paths;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::model::{FileEntry, FileKind, Project};
use ws_core::validate::validate_id;
use ws_core::{Error, Result};
use ws_store::{ListOptions, ObjectStore, PutOptions};
use ws_crypto::KeyProvider;

struct ListCache {
    entries: Vec<Project>,
    fetched_at: Instant,
}

pub struct ObjectStoreProjectsService {
    store: Arc<dyn ObjectStore>,
    skills_prefixes: Vec<String>,
    key_provider: RwLock<Option<Arc<dyn KeyProvider>>>,
    fallback_master_key_path: std::path::PathBuf,
    list_cache_ttl: Duration,
    list_cache: RwLock<HashMap<String, ListCache>>,
    meta_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ObjectStoreProjectsService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        skills_prefixes: Vec<String>,
        key_provider: Option<Arc<dyn KeyProvider>>,
        fallback_master_key_path: impl Into<std::path::PathBuf>,
        list_cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            skills_prefixes,
            key_provider: RwLock::new(key_provider),
            fallback_master_key_path: fallback_master_key_path.into(),
            list_cache_ttl,
            list_cache: RwLock::new(HashMap::new()),
            meta_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn invalidate_list_cache(&self, user_id: &str) {
        self.list_cache.write().await.remove(user_id);
    }

    async fn load_project(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<Project> {
        let key = paths::project_meta_key(user_id, project_id);
        let (data, _) = self
            .store
            .get(ctx, &key)
            .await
            .map_err(|e| if e.is_not_found() { Error::ProjectNotFound(project_id.to_string()) } else { e })?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn save_project(&self, ctx: &CancellationToken, user_id: &str, project: &Project) -> Result<()> {
        let key = paths::project_meta_key(user_id, &project.id.to_string());
        self.store
            .put(ctx, &key, serde_json::to_vec_pretty(project)?, PutOptions::default())
            .await?;
        Ok(())
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.meta_locks.lock().await;
        locks.entry(project_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Read-modify-write of `project.json` under the per-project lock so
    /// the monotonic generation counters never regress under concurrent
    /// mutations.
    async fn bump_and_save(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, touched: &[String]) -> Result<()> {
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;
        let mut project = self.load_project(ctx, user_id, project_id).await?;
        project.bump(touched, &self.skills_prefixes);
        self.save_project(ctx, user_id, &project).await?;
        self.invalidate_list_cache(user_id).await;
        Ok(())
    }

    async fn provider(&self) -> Option<Arc<dyn KeyProvider>> {
        self.key_provider.read().await.clone()
    }

    fn file_key(&self, user_id: &str, project_id: &str, rel_path: &str) -> Result<String> {
        if rel_path.is_empty() || rel_path.starts_with('/') || rel_path.contains('\\') {
            return Err(Error::InvalidPath { path: rel_path.to_string(), reason: "must be a relative, forward-slash path".into() });
        }
        if rel_path.split('/').any(|seg| seg == "..") {
            return Err(Error::InvalidPath { path: rel_path.to_string(), reason: "must not contain '..' segments".into() });
        }
        Ok(paths::file_key(user_id, project_id, rel_path))
    }
}

#[async_trait]
impl MetaIo for ObjectStoreProjectsService {
    async fn read_meta(&self, ctx: &CancellationToken, key: &str) -> Result<Option<Vec<u8>>> {
        match self.store.get(ctx, key).await {
            Ok((data, _)) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_meta(&self, ctx: &CancellationToken, key: &str, data: Vec<u8>) -> Result<()> {
        self.store.put(ctx, key, data, PutOptions::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl ProjectsService for ObjectStoreProjectsService {
    async fn create_project(&self, ctx: &CancellationToken, user_id: &str, name: &str) -> Result<Project> {
        validate_id(user_id)?;
        let mut project = Project::new(user_id, name);
        let pid = project.id.to_string();

        let readme_key = paths::file_key(user_id, &pid, "README.md");
        self.store
            .put(ctx, &readme_key, paths::seed_readme(name).into_bytes(), PutOptions::default())
            .await?;

        project.bump(&["README.md".to_string()], &self.skills_prefixes);
        self.save_project(ctx, user_id, &project).await?;
        self.invalidate_list_cache(user_id).await;
        info!(user_id, project_id = %pid, "project created");
        Ok(project)
    }

    async fn delete_project(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<()> {
        validate_id(project_id)?;
        let prefix = paths::project_prefix(user_id, project_id);
        self.store.delete_prefix(ctx, &prefix).await?;
        self.invalidate_list_cache(user_id).await;
        Ok(())
    }

    async fn list_projects(&self, ctx: &CancellationToken, user_id: &str) -> Result<Vec<Project>> {
        bail_if_canceled(ctx, "list_projects")?;
        if let Some(cached) = self.list_cache.read().await.get(user_id) {
            if cached.fetched_at.elapsed() < self.list_cache_ttl {
                return Ok(cached.entries.clone());
            }
        }

        let prefix = format!("users/{user_id}/projects/");
        let listing = self
            .store
            .list(ctx, ListOptions { prefix, delimiter: Some("/".to_string()), max_keys: None, continuation_token: None })
            .await?;

        let mut projects = Vec::new();
        for pseudo_dir in listing.common_prefixes {
            let pid = pseudo_dir
                .trim_start_matches(&format!("users/{user_id}/projects/"))
                .trim_end_matches('/')
                .to_string();
            if let Ok(mut project) = self.load_project(ctx, user_id, &pid).await {
                let (bytes, file_count) = self.tree_stats(ctx, user_id, &pid).await;
                project.bytes = bytes;
                project.file_count = file_count;
                projects.push(project);
            }
        }
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.name.cmp(&b.name)));

        self.list_cache.write().await.insert(
            user_id.to_string(),
            ListCache { entries: projects.clone(), fetched_at: Instant::now() },
        );
        Ok(projects)
    }

    async fn head_project(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<Project> {
        self.load_project(ctx, user_id, project_id).await
    }

    async fn list_tree(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let base = paths::files_prefix(user_id, project_id);
        let prefix = if path.is_empty() { base.clone() } else { format!("{base}{path}/") };

        let listing = self
            .store
            .list(ctx, ListOptions { prefix: prefix.clone(), delimiter: Some("/".to_string()), max_keys: None, continuation_token: None })
            .await?;

        let mut entries = Vec::new();
        for common in listing.common_prefixes {
            let name = common.trim_start_matches(&prefix).trim_end_matches('/').to_string();
            let rel_path = if path.is_empty() { name.clone() } else { format!("{path}/{name}") };
            entries.push(FileEntry { path: rel_path, name, kind: FileKind::Dir, size: 0, modified: chrono::Utc::now() });
        }
        for (key, attrs) in listing.objects {
            let name = key.trim_start_matches(&prefix).to_string();
            if name.is_empty() {
                continue;
            }
            let rel_path = if path.is_empty() { name.clone() } else { format!("{path}/{name}") };
            entries.push(FileEntry { path: rel_path, name, kind: FileKind::File, size: attrs.size, modified: attrs.last_modified });
        }

        entries.sort_by(|a, b| match (a.kind, b.kind) {
            (FileKind::Dir, FileKind::File) => std::cmp::Ordering::Less,
            (FileKind::File, FileKind::Dir) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });
        Ok(entries)
    }

    async fn upload_file(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, dir: &str, name: &str, content: Vec<u8>) -> Result<()> {
        if name.contains('/') || name.contains('\\') || name.is_empty() {
            return Err(Error::InvalidPath { path: name.to_string(), reason: "name must not contain path separators".into() });
        }
        let rel_path = if dir.is_empty() { name.to_string() } else { format!("{dir}/{name}") };
        let key = self.file_key(user_id, project_id, &rel_path)?;

        let provider = self.provider().await;
        let data = crypto_support::encrypt_if_enabled(ctx, self, provider.as_ref(), user_id, project_id, content).await?;
        self.store.put(ctx, &key, data, PutOptions::default()).await?;

        self.bump_and_save(ctx, user_id, project_id, &[rel_path]).await?;
        Ok(())
    }

    async fn delete_file(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<()> {
        let key = self.file_key(user_id, project_id, path)?;
        if self.store.exists(ctx, &key).await? {
            self.store.delete(ctx, &key).await?;
        } else {
            self.store.delete_prefix(ctx, &format!("{key}/")).await?;
        }
        self.bump_and_save(ctx, user_id, project_id, &[path.to_string()]).await?;
        Ok(())
    }

    async fn move_path(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, from: &str, to: &str) -> Result<()> {
        let src_key = self.file_key(user_id, project_id, from)?;
        let dst_key = self.file_key(user_id, project_id, to)?;

        // Compare path components, not raw key strings — `a` → `ab` is a
        // legitimate sibling rename, not a move into a descendant.
        if Path::new(&dst_key).starts_with(Path::new(&src_key)) {
            return Err(Error::InvalidPath { path: to.to_string(), reason: "destination is a descendant of source".into() });
        }
        if self.store.exists(ctx, &dst_key).await? {
            return Err(Error::Conflict(format!("destination {to} already exists")));
        }
        self.store.copy(ctx, &src_key, &dst_key).await?;
        self.store.delete(ctx, &src_key).await?;
        self.bump_and_save(ctx, user_id, project_id, &[from.to_string(), to.to_string()]).await?;
        Ok(())
    }

    async fn create_dir(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<()> {
        // Directories are implicit in object storage; record an empty
        // marker so an otherwise-empty directory still lists.
        let key = self.file_key(user_id, project_id, &format!("{}/.keep", path.trim_end_matches('/')))?;
        self.store.put(ctx, &key, vec![], PutOptions::default()).await?;
        self.bump_and_save(ctx, user_id, project_id, &[path.to_string()]).await?;
        Ok(())
    }

    async fn read_file(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<Vec<u8>> {
        let key = self.file_key(user_id, project_id, path)?;
        let (data, _) = self
            .store
            .get(ctx, &key)
            .await
            .map_err(|e| if e.is_not_found() { Error::FileNotFound(path.to_string()) } else { e })?;
        let provider = self.provider().await;
        crypto_support::decrypt_if_needed(ctx, self, provider.as_ref(), user_id, project_id, data).await
    }

    async fn enable_encryption(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, enabled: bool) -> Result<()> {
        let provider = self.provider().await;
        let fallback = crypto_support::enable_encryption(
            ctx,
            self,
            provider.as_ref(),
            &self.fallback_master_key_path,
            user_id,
            project_id,
            enabled,
        )
        .await?;
        if let Some(fallback) = fallback {
            *self.key_provider.write().await = Some(fallback);
        }
        Ok(())
    }

    async fn rotate_project_dek(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<()> {
        let provider = self.provider().await.ok_or_else(|| Error::Internal("no key provider configured".into()))?;
        let store = self.store.clone();
        let files_prefix = paths::files_prefix(user_id, project_id);
        let walk_ctx = ctx.clone();

        crypto_support::rotate_project_dek(ctx, self, provider.as_ref(), user_id, project_id, move |old_dek, new_dek| {
            let store = store.clone();
            let files_prefix = files_prefix.clone();
            async move { reencrypt_all_objects(&walk_ctx, store.as_ref(), &files_prefix, &old_dek, &new_dek).await }
        })
        .await
    }
}

impl ObjectStoreProjectsService {
    async fn tree_stats(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> (u64, u64) {
        let prefix = paths::files_prefix(user_id, project_id);
        let mut bytes = 0u64;
        let mut count = 0u64;
        let mut token = None;
        loop {
            let Ok(listing) = self
                .store
                .list(ctx, ListOptions { prefix: prefix.clone(), delimiter: None, max_keys: None, continuation_token: token.clone() })
                .await
            else {
                break;
            };
            for (_, attrs) in &listing.objects {
                bytes += attrs.size;
                count += 1;
            }
            if !listing.is_truncated {
                break;
            }
            token = listing.next_continuation_token;
        }
        (bytes, count)
    }
}

async fn reencrypt_all_objects(ctx: &CancellationToken, store: &dyn ObjectStore, prefix: &str, old_dek: &ws_crypto::Dek, new_dek: &ws_crypto::Dek) -> Result<()> {
    let mut token = None;
    loop {
        let listing = store
            .list(ctx, ListOptions { prefix: prefix.to_string(), delimiter: None, max_keys: None, continuation_token: token.clone() })
            .await?;
        for (key, _) in &listing.objects {
            let (data, _) = store.get(ctx, key).await?;
            if !ws_crypto::is_encrypted(&data) {
                continue;
            }
            let plaintext = ws_crypto::decrypt(old_dek, &data)?;
            let fresh = ws_crypto::encrypt(new_dek, &plaintext)?;
            store.put(ctx, key, fresh, PutOptions::default()).await?;
        }
        if !listing.is_truncated {
            break;
        }
        token = listing.next_continuation_token;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ws_core::model::{EncryptionEnvelope, CIPHERTEXT_MAGIC};
    use ws_store::memory::InMemoryStore;

    fn service(store: Arc<InMemoryStore>, keystore: &Path) -> ObjectStoreProjectsService {
        ObjectStoreProjectsService::new(
            store,
            vec!["skills/".to_string()],
            None,
            keystore.join("master.key"),
            Duration::from_secs(5),
        )
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn create_project_lists_with_readme_stats() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store, dir.path());
        let ctx = ctx();

        svc.create_project(&ctx, "1", "My Project").await.unwrap();
        let listed = svc.list_projects(&ctx, "1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "My Project");
        assert_eq!(listed[0].file_count, 1);
        assert_eq!(listed[0].bytes, paths::seed_readme("My Project").len() as u64);
    }

    #[tokio::test]
    async fn encrypted_upload_stores_ciphertext_and_reads_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store.clone(), dir.path());
        let ctx = ctx();
        let pid = svc.create_project(&ctx, "u1", "demo").await.unwrap().id.to_string();

        svc.enable_encryption(&ctx, "u1", &pid, true).await.unwrap();
        svc.upload_file(&ctx, "u1", &pid, "", "s.txt", b"top secret".to_vec()).await.unwrap();

        let key = paths::file_key("u1", &pid, "s.txt");
        let (raw, _) = store.get(&ctx, &key).await.unwrap();
        assert_eq!(&raw[..5], &CIPHERTEXT_MAGIC);
        assert!(!raw.windows(b"top secret".len()).any(|w| w == b"top secret"));

        assert_eq!(svc.read_file(&ctx, "u1", &pid, "s.txt").await.unwrap(), b"top secret");
    }

    #[tokio::test]
    async fn enable_without_provider_writes_legacy_v1_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store.clone(), dir.path());
        let ctx = ctx();
        let pid = svc.create_project(&ctx, "u1", "demo").await.unwrap().id.to_string();

        svc.enable_encryption(&ctx, "u1", &pid, true).await.unwrap();

        let (env_raw, _) = store.get(&ctx, &paths::enc_meta_key("u1", &pid)).await.unwrap();
        let env: EncryptionEnvelope = serde_json::from_slice(&env_raw).unwrap();
        assert_eq!(env.wrap_version, 1);
        assert!(env.nonce.is_some());

        svc.upload_file(&ctx, "u1", &pid, "", "s.txt", b"top secret".to_vec()).await.unwrap();
        assert_eq!(svc.read_file(&ctx, "u1", &pid, "s.txt").await.unwrap(), b"top secret");
    }

    #[tokio::test]
    async fn rotate_dek_drops_prev_wrapped_key_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store.clone(), dir.path());
        let ctx = ctx();
        let pid = svc.create_project(&ctx, "u1", "demo").await.unwrap().id.to_string();

        svc.enable_encryption(&ctx, "u1", &pid, true).await.unwrap();
        svc.upload_file(&ctx, "u1", &pid, "", "s.txt", b"top secret".to_vec()).await.unwrap();
        svc.rotate_project_dek(&ctx, "u1", &pid).await.unwrap();

        let (env_raw, _) = store.get(&ctx, &paths::enc_meta_key("u1", &pid)).await.unwrap();
        let env: EncryptionEnvelope = serde_json::from_slice(&env_raw).unwrap();
        assert!(env.prev_wrapped_dek.is_none());
        assert_eq!(env.wrap_version, 2);

        assert_eq!(svc.read_file(&ctx, "u1", &pid, "s.txt").await.unwrap(), b"top secret");
    }

    #[tokio::test]
    async fn skills_upload_bumps_skills_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store, dir.path());
        let ctx = ctx();
        let pid = svc.create_project(&ctx, "u1", "demo").await.unwrap().id.to_string();

        svc.upload_file(&ctx, "u1", &pid, "src", "main.rs", b"fn main() {}".to_vec()).await.unwrap();
        let project = svc.head_project(&ctx, "u1", &pid).await.unwrap();
        assert_eq!(project.generation, 2);
        assert_eq!(project.skills_generation, 0);

        svc.upload_file(&ctx, "u1", &pid, "skills", "howto.md", b"# Howto".to_vec()).await.unwrap();
        let project = svc.head_project(&ctx, "u1", &pid).await.unwrap();
        assert_eq!(project.generation, 3);
        assert_eq!(project.skills_generation, 3);
    }

    #[tokio::test]
    async fn move_path_allows_sibling_sharing_a_name_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store, dir.path());
        let ctx = ctx();
        let pid = svc.create_project(&ctx, "u1", "demo").await.unwrap().id.to_string();
        svc.upload_file(&ctx, "u1", &pid, "", "a", b"payload".to_vec()).await.unwrap();

        // `ab` shares `a` as a string prefix but is a sibling, not a child.
        svc.move_path(&ctx, "u1", &pid, "a", "ab").await.unwrap();
        assert_eq!(svc.read_file(&ctx, "u1", &pid, "ab").await.unwrap(), b"payload");
        assert!(svc.read_file(&ctx, "u1", &pid, "a").await.is_err());
    }

    #[tokio::test]
    async fn move_path_rejects_descendant_destination() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store, dir.path());
        let ctx = ctx();
        let pid = svc.create_project(&ctx, "u1", "demo").await.unwrap().id.to_string();
        svc.upload_file(&ctx, "u1", &pid, "sub", "a.txt", b"1".to_vec()).await.unwrap();

        let err = svc.move_path(&ctx, "u1", &pid, "sub", "sub/inner").await.unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn delete_file_is_idempotent_and_list_tree_hides_meta() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store, dir.path());
        let ctx = ctx();
        let pid = svc.create_project(&ctx, "u1", "demo").await.unwrap().id.to_string();
        svc.upload_file(&ctx, "u1", &pid, "sub", "a.txt", b"1".to_vec()).await.unwrap();

        let entries = svc.list_tree(&ctx, "u1", &pid, "").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sub", "README.md"]);
        assert!(entries.iter().all(|e| e.name != ".meta"));

        svc.delete_file(&ctx, "u1", &pid, "sub/a.txt").await.unwrap();
        svc.delete_file(&ctx, "u1", &pid, "sub/a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn delete_project_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store, dir.path());
        let ctx = ctx();
        let pid = svc.create_project(&ctx, "u1", "demo").await.unwrap().id.to_string();

        svc.delete_project(&ctx, "u1", &pid).await.unwrap();
        svc.delete_project(&ctx, "u1", &pid).await.unwrap();
        assert!(svc.head_project(&ctx, "u1", &pid).await.is_err());
    }
}
