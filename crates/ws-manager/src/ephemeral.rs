//! The ephemeral manager: checkout hydrates a session working directory
//! from durable storage, commit diffs it back by content hash, cleanup
//! discards it. Durable state is wholly in the object store; the working
//! directory is disposable.

use crate::callbacks;
use crate::contract::{Workspace, WorkspaceManager};
use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::info;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::model::{ManifestEntry, Project, SyncManifest, WorkspaceMode};
use ws_core::validate::{contained_in, validate_id};
use ws_core::{Error, Result};
use ws_crypto::KeyProvider;
use ws_projects::meta_io::MetaIo;
use ws_store::{ListOptions, ObjectStore, PutOptions};

const MANIFEST_FILE: &str = "sync-manifest.json";

struct SessionState {
    base_dir: PathBuf,
    manifest: SyncManifest,
    dirty: Vec<String>,
}

pub struct EphemeralWorkspaceManager {
    root: PathBuf,
    store: Arc<dyn ObjectStore>,
    skills_prefixes: Vec<String>,
    key_provider: Option<Arc<dyn KeyProvider>>,
    sessions: DashMap<(String, String, String), Arc<Mutex<SessionState>>>,
    meta_locks: DashMap<String, Arc<Mutex<()>>>,
}

struct StoreMetaIo<'a>(&'a dyn ObjectStore);

#[async_trait]
impl<'a> MetaIo for StoreMetaIo<'a> {
    async fn read_meta(&self, ctx: &CancellationToken, key: &str) -> Result<Option<Vec<u8>>> {
        match self.0.get(ctx, key).await {
            Ok((data, _)) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write_meta(&self, ctx: &CancellationToken, key: &str, data: Vec<u8>) -> Result<()> {
        self.0.put(ctx, key, data, PutOptions::default()).await?;
        Ok(())
    }
}

impl EphemeralWorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn ObjectStore>, skills_prefixes: Vec<String>, key_provider: Option<Arc<dyn KeyProvider>>) -> Self {
        Self {
            root: root.into(),
            store,
            skills_prefixes,
            key_provider,
            sessions: DashMap::new(),
            meta_locks: DashMap::new(),
        }
    }

    /// Declare `path` dirty outside the normal local-write flow — e.g. a
    /// build step that materializes generated files directly. The next
    /// `commit` includes it in the changed set even if its content hash
    /// happens to coincide with a stale manifest entry.
    pub async fn mark_dirty(&self, ws: &Workspace, path: &str) -> Result<()> {
        let key = session_key(ws);
        if let Some(state) = self.sessions.get(&key).map(|e| e.value().clone()) {
            state.lock().await.dirty.push(path.to_string());
        }
        Ok(())
    }

    /// Return the already-checked-out workspace for `(user, project,
    /// session)` if its manifest is at least as new as the supplied
    /// counters, without any object-store round trip. Used by the
    /// enterprise wrapper's generation-cache fast path.
    pub async fn reuse_if_current(
        &self,
        user_id: &str,
        project_id: &str,
        session_id: &str,
        generation: u64,
        skills_generation: u64,
    ) -> Option<Workspace> {
        let key = (user_id.to_string(), project_id.to_string(), session_id.to_string());
        let state = self.sessions.get(&key).map(|e| e.value().clone())?;
        let state = state.lock().await;
        if state.manifest.generation >= generation && state.manifest.skills_generation >= skills_generation {
            Some(Workspace {
                user_id: user_id.to_string(),
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
                base_dir: state.base_dir.clone(),
                mode: WorkspaceMode::Ephemeral,
            })
        } else {
            None
        }
    }

    fn meta_lock(&self, user_id: &str, project_id: &str) -> Arc<Mutex<()>> {
        self.meta_locks
            .entry(format!("{user_id}/{project_id}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_project(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<Project> {
        let key = ws_projects::paths::project_meta_key(user_id, project_id);
        let (data, _) = self
            .store
            .get(ctx, &key)
            .await
            .map_err(|e| if e.is_not_found() { Error::ProjectNotFound(project_id.to_string()) } else { e })?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn save_project(&self, ctx: &CancellationToken, user_id: &str, project: &Project) -> Result<()> {
        let key = ws_projects::paths::project_meta_key(user_id, &project.id.to_string());
        self.store.put(ctx, &key, serde_json::to_vec_pretty(project)?, PutOptions::default()).await?;
        Ok(())
    }

    async fn encrypt_if_enabled(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let io = StoreMetaIo(self.store.as_ref());
        ws_projects::crypto_support::encrypt_if_enabled(ctx, &io, self.key_provider.as_ref(), user_id, project_id, data).await
    }

    async fn decrypt_if_needed(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        let io = StoreMetaIo(self.store.as_ref());
        ws_projects::crypto_support::decrypt_if_needed(ctx, &io, self.key_provider.as_ref(), user_id, project_id, data).await
    }

    async fn hydrate(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, base_dir: &Path, project: &Project) -> Result<SyncManifest> {
        tokio::fs::create_dir_all(base_dir).await?;
        let result: Result<BTreeMap<String, ManifestEntry>> = async {
            let files_prefix = ws_projects::paths::files_prefix(user_id, project_id);
            let mut files = BTreeMap::new();
            let mut token = None;
            loop {
                let listing = self
                    .store
                    .list(ctx, ListOptions { prefix: files_prefix.clone(), delimiter: None, max_keys: None, continuation_token: token.clone() })
                    .await?;
                for (key, attrs) in &listing.objects {
                    bail_if_canceled(ctx, "hydrate")?;
                    let rel_path = key.trim_start_matches(&files_prefix);
                    if rel_path.is_empty() || rel_path.contains("..") || rel_path.starts_with('/') || rel_path.contains('\\') {
                        return Err(Error::InvalidPath { path: rel_path.to_string(), reason: "unsafe relative path in object key".into() });
                    }
                    let local_path = contained_in(base_dir, &base_dir.join(rel_path))
                        .ok()
                        .map(|_| base_dir.join(rel_path))
                        .ok_or_else(|| Error::PathOutsideRoot { root: base_dir.display().to_string(), path: rel_path.to_string() })?;

                    let (data, _) = self.store.get(ctx, key).await?;
                    let plaintext = self.decrypt_if_needed(ctx, user_id, project_id, data).await?;
                    if let Some(parent) = local_path.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&local_path, &plaintext).await?;

                    let sha256 = sha256_hex(&plaintext);
                    files.insert(rel_path.to_string(), ManifestEntry {
                        size: plaintext.len() as u64,
                        sha256,
                        etag: attrs.etag.clone(),
                        last_modified: attrs.last_modified,
                    });
                }
                if !listing.is_truncated {
                    break;
                }
                token = listing.next_continuation_token;
            }
            Ok(files)
        }
        .await;

        let files = match result {
            Ok(files) => files,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(base_dir).await;
                return Err(e);
            }
        };

        let manifest = SyncManifest {
            version: 1,
            checkout_time: chrono::Utc::now(),
            generation: project.generation,
            skills_generation: project.skills_generation,
            files,
        };
        write_manifest(base_dir, &manifest).await?;
        Ok(manifest)
    }
}

fn session_key(ws: &Workspace) -> (String, String, String) {
    (ws.user_id.clone(), ws.project_id.clone(), ws.session_id.clone())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

async fn read_manifest(base_dir: &Path) -> Option<SyncManifest> {
    let bytes = tokio::fs::read(base_dir.join(".meta").join(MANIFEST_FILE)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

async fn write_manifest(base_dir: &Path, manifest: &SyncManifest) -> Result<()> {
    let meta_dir = base_dir.join(".meta");
    tokio::fs::create_dir_all(&meta_dir).await?;
    let data = serde_json::to_vec_pretty(manifest)?;
    let tmp = meta_dir.join(format!("{MANIFEST_FILE}.tmp"));
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, meta_dir.join(MANIFEST_FILE)).await?;
    Ok(())
}

async fn walk_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&d).await else { continue };
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            let path = entry.path();
            if path.file_name().map(|n| n == ".meta").unwrap_or(false) {
                continue;
            }
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                out.push(path);
            }
        }
    }
    Ok(out)
}

#[async_trait]
impl WorkspaceManager for EphemeralWorkspaceManager {
    async fn checkout(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, session_id: Option<&str>) -> Result<Workspace> {
        bail_if_canceled(ctx, "checkout")?;
        validate_id(user_id)?;
        validate_id(project_id)?;
        let session_id = match session_id {
            Some(s) if !s.is_empty() => validate_id(s)?,
            _ => synthesize_session_id(),
        };

        let base_dir = self
            .root
            .join("users")
            .join(user_id)
            .join("projects")
            .join(project_id)
            .join("sessions")
            .join(&session_id);
        contained_in(&self.root, &base_dir)?;

        let key = (user_id.to_string(), project_id.to_string(), session_id.clone());

        if let Some(state) = self.sessions.get(&key).map(|e| e.value().clone()) {
            let state = state.lock().await;
            if let Ok(project) = self.load_project(ctx, user_id, project_id).await {
                if state.manifest.generation >= project.generation && state.manifest.skills_generation >= project.skills_generation {
                    return Ok(Workspace { user_id: user_id.to_string(), project_id: project_id.to_string(), session_id, base_dir: state.base_dir.clone(), mode: WorkspaceMode::Ephemeral });
                }
            }
        }

        let project = self.load_project(ctx, user_id, project_id).await?;

        // A manifest persisted by an earlier process (the CLI runs one
        // process per invocation) lets us adopt the on-disk working copy
        // as-is instead of re-hydrating over it, as long as it is still
        // current with respect to the remote counters.
        let manifest = match read_manifest(&base_dir).await {
            Some(m) if m.generation >= project.generation && m.skills_generation >= project.skills_generation => {
                info!(user_id, project_id, session_id = %session_id, "CHECKOUT: resumed workspace from on-disk manifest");
                m
            }
            _ => {
                let m = self.hydrate(ctx, user_id, project_id, &base_dir, &project).await?;
                info!(user_id, project_id, session_id = %session_id, "CHECKOUT: hydrated workspace");
                m
            }
        };

        self.sessions.insert(key, Arc::new(Mutex::new(SessionState { base_dir: base_dir.clone(), manifest, dirty: Vec::new() })));

        callbacks::invoke_checkout(user_id, project_id, &session_id);

        Ok(Workspace { user_id: user_id.to_string(), project_id: project_id.to_string(), session_id, base_dir, mode: WorkspaceMode::Ephemeral })
    }

    async fn commit(&self, ctx: &CancellationToken, ws: &Workspace) -> Result<()> {
        self.commit_with_changes(ctx, ws).await.map(|_| ())
    }

    async fn cleanup(&self, ctx: &CancellationToken, ws: &Workspace) -> Result<()> {
        bail_if_canceled(ctx, "cleanup")?;
        let key = session_key(ws);
        self.sessions.remove(&key);

        contained_in(&self.root, &ws.base_dir)?;
        match tokio::fs::remove_dir_all(&ws.base_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl EphemeralWorkspaceManager {
    /// The full commit pass, returning the set of changed (uploaded or
    /// deleted) relative paths. The [`WorkspaceManager::commit`] impl
    /// discards the list; the enterprise wrapper uses it to publish
    /// precise invalidation events and sync its encrypted cache.
    ///
    /// A cancellation observed mid-pass aborts before the manifest rewrite,
    /// so the manifest still describes the last fully reconciled state and
    /// any already-uploaded objects are re-matched by hash next time.
    pub async fn commit_with_changes(&self, ctx: &CancellationToken, ws: &Workspace) -> Result<Vec<String>> {
        bail_if_canceled(ctx, "commit")?;
        let key = session_key(ws);
        let Some(state) = self.sessions.get(&key).map(|e| e.value().clone()) else {
            return Err(Error::Internal(format!("no active session for {ws:?}")));
        };
        let mut state = state.lock().await;

        // Work on a copy of the manifest; the session's own copy is only
        // replaced after the metadata bump succeeds, so an error (or
        // cancellation) mid-pass leaves it describing the last fully
        // reconciled state and the next commit re-detects the diff by hash.
        let mut files = state.manifest.files.clone();
        let mut changed: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let local_files = walk_files(&ws.base_dir).await?;
        for path in &local_files {
            bail_if_canceled(ctx, "commit")?;
            let rel_path = path.strip_prefix(&ws.base_dir).unwrap().to_string_lossy().replace('\\', "/");
            seen.insert(rel_path.clone());

            let data = tokio::fs::read(path).await?;
            let sha256 = sha256_hex(&data);
            let unchanged = files.get(&rel_path).map(|e| e.sha256 == sha256).unwrap_or(false);
            if unchanged {
                continue;
            }

            let key_name = ws_projects::paths::file_key(&ws.user_id, &ws.project_id, &rel_path);
            let ciphertext = self.encrypt_if_enabled(ctx, &ws.user_id, &ws.project_id, data.clone()).await?;
            let etag = self.store.put(ctx, &key_name, ciphertext, PutOptions::default()).await?;

            files.insert(rel_path.clone(), ManifestEntry { size: data.len() as u64, sha256, etag, last_modified: chrono::Utc::now() });
            changed.push(rel_path);
        }

        let stale: Vec<String> = files.keys().filter(|p| !seen.contains(*p)).cloned().collect();
        for rel_path in &stale {
            let key_name = ws_projects::paths::file_key(&ws.user_id, &ws.project_id, rel_path);
            self.store.delete(ctx, &key_name).await?;
            files.remove(rel_path);
            changed.push(rel_path.clone());
        }

        changed.extend(state.dirty.iter().cloned());

        if changed.is_empty() {
            state.dirty.clear();
            return Ok(changed);
        }

        let meta_lock = self.meta_lock(&ws.user_id, &ws.project_id);
        let _meta_guard = meta_lock.lock().await;

        let mut project = self.load_project(ctx, &ws.user_id, &ws.project_id).await?;
        project.bump(&changed, &self.skills_prefixes);
        self.save_project(ctx, &ws.user_id, &project).await?;

        if project.skills_generation > state.manifest.skills_generation {
            callbacks::invoke_skills_invalidation(&ws.user_id, &ws.project_id, project.skills_generation);
        }

        state.dirty.clear();
        state.manifest.files = files;
        state.manifest.generation = project.generation;
        state.manifest.skills_generation = project.skills_generation;
        state.manifest.checkout_time = chrono::Utc::now();
        write_manifest(&ws.base_dir, &state.manifest).await?;

        info!(user_id = %ws.user_id, project_id = %ws.project_id, session_id = %ws.session_id, changed = changed.len(), "COMMIT: reconciled workspace");
        Ok(changed)
    }
}

fn synthesize_session_id() -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("sess-{nanos:x}")
}
