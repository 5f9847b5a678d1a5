//! `EnterpriseWorkspaceManager`: the ephemeral manager plus generation
//! caching, an optional encrypted tmpfs materializer, commit publication,
//! and lazy invalidation subscriptions. Delegates all actual hydrate/diff
//! logic to the wrapped `EphemeralWorkspaceManager` — this type only adds
//! multi-tenant coordination around it.

use crate::commit_log::CommitLog;
use crate::encrypted_cache::{unwrap_memoized, DekMemo, EncryptedDiskCache};
use crate::generation_cache::{GenerationCache, GenerationMark};
use crate::pubsub::InvalidationBus;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use ws_core::cancel::{bail_if_canceled, run_cancellable, CancellationToken};
use ws_core::model::{CommitEvent, InvalidationEvent, WorkspaceMode};
use ws_core::Result;
use ws_crypto::KeyProvider;
use ws_manager::{EphemeralWorkspaceManager, Workspace, WorkspaceManager};
use ws_store::{ObjectStore, PutOptions};

/// Rollback valve for the checkout-time generation-cache fast path: set to
/// any non-empty value to force every checkout through the object store.
const SKIP_GEN_CACHE_ENV: &str = "WORKSPACE_SKIP_GEN_CACHE";

pub type InvalidationSink = Arc<dyn Fn(InvalidationEvent) + Send + Sync>;

pub struct EnterpriseWorkspaceManager {
    inner: Arc<EphemeralWorkspaceManager>,
    generation_cache: Arc<dyn GenerationCache>,
    invalidation_bus: Arc<InvalidationBus>,
    commit_log: Arc<dyn CommitLog>,
    tmpfs: Option<TmpfsLayer>,
    skills_sink: Option<InvalidationSink>,
    watchers: Mutex<HashMap<String, Watcher>>,
}

struct TmpfsLayer {
    cache: EncryptedDiskCache,
    dek_memo: DekMemo,
    key_provider: Arc<dyn KeyProvider>,
    store: Arc<dyn ObjectStore>,
}

/// One forwarding task per `(tenant, project)`, shared by every live
/// session of that project and torn down when the last one cleans up.
/// Sessions are tracked by id so a repeated checkout of the same session
/// cannot skew the count.
struct Watcher {
    sessions: std::collections::HashSet<String>,
    task: tokio::task::JoinHandle<()>,
}

struct StoreMetaIo<'a>(&'a dyn ObjectStore);

#[async_trait]
impl<'a> ws_projects::meta_io::MetaIo for StoreMetaIo<'a> {
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

impl EnterpriseWorkspaceManager {
    pub fn new(inner: Arc<EphemeralWorkspaceManager>, generation_cache: Arc<dyn GenerationCache>, invalidation_bus: Arc<InvalidationBus>, commit_log: Arc<dyn CommitLog>) -> Self {
        Self {
            inner,
            generation_cache,
            invalidation_bus,
            commit_log,
            tmpfs: None,
            skills_sink: None,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_tmpfs_cache(mut self, cache_dir: impl Into<std::path::PathBuf>, key_provider: Arc<dyn KeyProvider>, store: Arc<dyn ObjectStore>) -> Self {
        self.tmpfs = Some(TmpfsLayer { cache: EncryptedDiskCache::new(cache_dir), dek_memo: DekMemo::new(), key_provider, store });
        self
    }

    /// Register the sink invalidation events are forwarded to (typically a
    /// skills-cache invalidator). With a sink set, the first checkout of a
    /// `(tenant, project)` lazily starts the forwarding task and cleanup of
    /// the last session tears it down.
    pub fn with_skills_invalidation_sink(mut self, sink: InvalidationSink) -> Self {
        self.skills_sink = Some(sink);
        self
    }

    /// Forward invalidation events for `(tenant, project)` to an ad hoc
    /// sink. The subscription is reference-counted by [`InvalidationBus`];
    /// it unsubscribes when the returned task ends (or is aborted).
    pub fn watch_invalidations(&self, tenant_id: &str, project_id: &str, sink: InvalidationSink) -> tokio::task::JoinHandle<()> {
        let mut sub = self.invalidation_bus.subscribe(tenant_id, project_id);
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                sink(event);
            }
        })
    }

    fn tenant_of(user_id: &str) -> String {
        // Tenant scoping mirrors user scoping in this service: each user's
        // projects are tenant-isolated by construction, so the tenant key
        // used for cross-node coordination is the user id itself.
        user_id.to_string()
    }

    fn gen_cache_enabled() -> bool {
        std::env::var(SKIP_GEN_CACHE_ENV).map(|v| v.is_empty()).unwrap_or(true)
    }

    async fn retain_watcher(&self, tenant_id: &str, project_id: &str, session_id: &str) {
        let Some(sink) = self.skills_sink.clone() else {
            return;
        };
        let key = format!("{tenant_id}:{project_id}");
        let mut watchers = self.watchers.lock().await;
        match watchers.get_mut(&key) {
            Some(watcher) => {
                watcher.sessions.insert(session_id.to_string());
            }
            None => {
                let task = self.watch_invalidations(tenant_id, project_id, sink);
                watchers.insert(key, Watcher { sessions: [session_id.to_string()].into(), task });
            }
        }
    }

    async fn release_watcher(&self, tenant_id: &str, project_id: &str, session_id: &str) {
        let key = format!("{tenant_id}:{project_id}");
        let mut watchers = self.watchers.lock().await;
        let Some(watcher) = watchers.get_mut(&key) else {
            return;
        };
        watcher.sessions.remove(session_id);
        if watcher.sessions.is_empty() {
            let watcher = watchers.remove(&key).unwrap();
            watcher.task.abort();
            // Awaiting the aborted task guarantees its subscription guard
            // has dropped (and the bus channel with it) before we return.
            let _ = watcher.task.await;
        }
    }
}

#[async_trait]
impl WorkspaceManager for EnterpriseWorkspaceManager {
    async fn checkout(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, session_id: Option<&str>) -> Result<Workspace> {
        bail_if_canceled(ctx, "checkout")?;
        let tenant_id = Self::tenant_of(user_id);

        // Fast path: if the cached counters say the already-materialized
        // session is current, hand it back without a single store RPC.
        if Self::gen_cache_enabled() {
            if let (Some(sid), Ok(Some(mark))) = (session_id, self.generation_cache.get(ctx, &tenant_id, project_id).await) {
                if let Some(mut ws) = self.inner.reuse_if_current(user_id, project_id, sid, mark.generation, mark.skills_generation).await {
                    info!(user_id, project_id, session_id = sid, generation = mark.generation, "CHECKOUT: generation cache hit, reusing workspace");
                    ws.mode = WorkspaceMode::Enterprise;
                    self.retain_watcher(&tenant_id, project_id, &ws.session_id).await;
                    return Ok(ws);
                }
            }
        }

        let mut ws = self.inner.checkout(ctx, user_id, project_id, session_id).await?;
        ws.mode = WorkspaceMode::Enterprise;

        if let Some(tmpfs) = &self.tmpfs {
            // Tmpfs materialization failures are non-fatal — the ephemeral
            // manager already hydrated `base_dir` directly, so the session
            // is usable even if the scratch-copy optimization fails.
            if let Err(e) = self.materialize_tmpfs(ctx, tmpfs, user_id, project_id, &ws).await {
                warn!(user_id, project_id, error = %e, "tmpfs materialization failed, continuing with base hydrate");
            }
        }

        self.retain_watcher(&tenant_id, project_id, &ws.session_id).await;
        Ok(ws)
    }

    async fn commit(&self, ctx: &CancellationToken, ws: &Workspace) -> Result<()> {
        let tenant_id = Self::tenant_of(&ws.user_id);
        let lock = self.generation_cache.commit_lock(&tenant_id, &ws.project_id).await;
        let _guard = run_cancellable(ctx, "commit lock", async { Ok(lock.lock().await) }).await?;

        let changed = self.inner.commit_with_changes(ctx, ws).await?;
        if changed.is_empty() {
            return Ok(());
        }

        // The ephemeral manager just wrote the authoritative generation
        // counters back to the manifest; re-read them so the cache and
        // published events reflect exactly what was persisted.
        let manifest_path = ws.base_dir.join(".meta").join("sync-manifest.json");
        let manifest_bytes = tokio::fs::read(&manifest_path).await?;
        let manifest: ws_core::model::SyncManifest = serde_json::from_slice(&manifest_bytes)?;

        self.generation_cache
            .set(ctx, &tenant_id, &ws.project_id, GenerationMark { generation: manifest.generation, skills_generation: manifest.skills_generation })
            .await?;

        if let Some(tmpfs) = &self.tmpfs {
            if let Err(e) = self.sync_back_tmpfs(ctx, tmpfs, ws, manifest.generation, &changed).await {
                warn!(user_id = %ws.user_id, project_id = %ws.project_id, error = %e, "encrypted cache sync-back failed, cache will refresh on next checkout");
            }
        }

        let project_uuid: Uuid = ws.project_id.parse().unwrap_or_else(|_| Uuid::nil());

        self.invalidation_bus.publish(
            &tenant_id,
            &ws.project_id,
            InvalidationEvent { project_id: project_uuid, generation: manifest.generation, skills_generation: manifest.skills_generation, changed_paths: changed.clone() },
        );

        self.commit_log
            .publish(ctx, CommitEvent {
                commit_id: Uuid::new_v4(),
                tenant_id,
                project_id: project_uuid,
                user_id: ws.user_id.clone(),
                session_id: ws.session_id.clone(),
                generation: manifest.generation,
                skills_generation: manifest.skills_generation,
                changed_paths: changed,
                timestamp: chrono::Utc::now(),
            })
            .await?;

        Ok(())
    }

    async fn cleanup(&self, ctx: &CancellationToken, ws: &Workspace) -> Result<()> {
        let tenant_id = Self::tenant_of(&ws.user_id);
        self.release_watcher(&tenant_id, &ws.project_id, &ws.session_id).await;
        self.inner.cleanup(ctx, ws).await
    }
}

impl EnterpriseWorkspaceManager {
    async fn materialize_tmpfs(&self, ctx: &CancellationToken, tmpfs: &TmpfsLayer, user_id: &str, project_id: &str, ws: &Workspace) -> Result<()> {
        let manifest_path = ws.base_dir.join(".meta").join("sync-manifest.json");
        let manifest_bytes = tokio::fs::read(&manifest_path).await?;
        let manifest: ws_core::model::SyncManifest = serde_json::from_slice(&manifest_bytes)?;

        let cached_generation = tmpfs.cache.cached_generation(ctx, user_id, project_id).await?;
        if cached_generation < manifest.generation {
            let mut files = Vec::new();
            for rel_path in manifest.files.keys() {
                let data = tokio::fs::read(ws.base_dir.join(rel_path)).await?;
                files.push((rel_path.clone(), data));
            }
            if let Some(dek) = self.current_dek(ctx, tmpfs, user_id, project_id).await? {
                tmpfs.cache.refresh(ctx, user_id, project_id, manifest.generation, &dek, files).await?;
            } else {
                return Ok(());
            }
        }

        if let Some(dek) = self.current_dek(ctx, tmpfs, user_id, project_id).await? {
            tmpfs.cache.materialize(ctx, user_id, project_id, &dek, &ws.base_dir).await?;
        }
        Ok(())
    }

    async fn sync_back_tmpfs(&self, ctx: &CancellationToken, tmpfs: &TmpfsLayer, ws: &Workspace, generation: u64, changed: &[String]) -> Result<()> {
        let Some(dek) = self.current_dek(ctx, tmpfs, &ws.user_id, &ws.project_id).await? else {
            return Ok(());
        };
        let mut payload = Vec::with_capacity(changed.len());
        for rel_path in changed {
            match tokio::fs::read(ws.base_dir.join(rel_path)).await {
                Ok(data) => payload.push((rel_path.clone(), Some(data))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => payload.push((rel_path.clone(), None)),
                Err(e) => return Err(e.into()),
            }
        }
        tmpfs.cache.sync_back(ctx, &ws.user_id, &ws.project_id, generation, &dek, payload).await
    }

    async fn current_dek(&self, ctx: &CancellationToken, tmpfs: &TmpfsLayer, user_id: &str, project_id: &str) -> Result<Option<[u8; 32]>> {
        let io = StoreMetaIo(tmpfs.store.as_ref());
        let envelope = match ws_projects::crypto_support::load_envelope(ctx, &io, user_id, project_id).await {
            Ok(Some(env)) => env,
            _ => return Ok(None),
        };
        let dek = unwrap_memoized(ctx, &tmpfs.dek_memo, &tmpfs.key_provider, project_id, &envelope).await?;
        Ok(Some(dek))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_log::InMemoryCommitLog;
    use crate::generation_cache::InMemoryGenerationCache;
    use ws_core::model::Project;
    use ws_store::memory::InMemoryStore;

    async fn seed_project(store: &dyn ObjectStore, user_id: &str, project_id: &str) {
        let project = Project {
            id: project_id.parse().unwrap(),
            user_id: user_id.to_string(),
            name: "demo".into(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            generation: 1,
            skills_generation: 0,
            bytes: 0,
            file_count: 0,
        };
        let ctx = CancellationToken::new();
        let key = ws_projects::paths::project_meta_key(user_id, project_id);
        store.put(&ctx, &key, serde_json::to_vec(&project).unwrap(), PutOptions::default()).await.unwrap();
        let file_key = ws_projects::paths::file_key(user_id, project_id, "a.txt");
        store.put(&ctx, &file_key, b"hello".to_vec(), PutOptions::default()).await.unwrap();
    }

    fn manager(root: &std::path::Path, store: Arc<dyn ObjectStore>) -> (EnterpriseWorkspaceManager, Arc<InvalidationBus>, Arc<InMemoryCommitLog>, Arc<InMemoryGenerationCache>) {
        let inner = Arc::new(EphemeralWorkspaceManager::new(root, store, vec!["skills/".into()], None));
        let bus = InvalidationBus::new();
        let log = Arc::new(InMemoryCommitLog::new());
        let cache = Arc::new(InMemoryGenerationCache::new());
        let mgr = EnterpriseWorkspaceManager::new(inner, cache.clone(), bus.clone(), log.clone());
        (mgr, bus, log, cache)
    }

    #[tokio::test]
    async fn commit_publishes_event_and_updates_generation_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let pid = Uuid::new_v4().to_string();
        seed_project(store.as_ref(), "u1", &pid).await;

        let (mgr, bus, log, cache) = manager(dir.path(), store);
        let mut sub = bus.subscribe("u1", &pid);
        let ctx = CancellationToken::new();

        let ws = mgr.checkout(&ctx, "u1", &pid, Some("sess-a")).await.unwrap();
        assert_eq!(ws.mode, WorkspaceMode::Enterprise);

        tokio::fs::write(ws.base_dir.join("a.txt"), b"changed").await.unwrap();
        mgr.commit(&ctx, &ws).await.unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.generation, 2);
        assert_eq!(event.changed_paths, vec!["a.txt".to_string()]);

        assert_eq!(log.events().await.len(), 1);

        let mark = cache.get(&ctx, "u1", &pid).await.unwrap().unwrap();
        assert_eq!(mark.generation, 2);
    }

    #[tokio::test]
    async fn commit_without_changes_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let pid = Uuid::new_v4().to_string();
        seed_project(store.as_ref(), "u1", &pid).await;

        let (mgr, _bus, log, _cache) = manager(dir.path(), store);
        let ctx = CancellationToken::new();
        let ws = mgr.checkout(&ctx, "u1", &pid, Some("sess-a")).await.unwrap();
        mgr.commit(&ctx, &ws).await.unwrap();
        assert!(log.events().await.is_empty());
    }

    #[tokio::test]
    async fn checkout_reuses_session_via_generation_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let pid = Uuid::new_v4().to_string();
        seed_project(store.as_ref(), "u1", &pid).await;

        let (mgr, _bus, _log, _cache) = manager(dir.path(), store);
        let ctx = CancellationToken::new();
        let ws = mgr.checkout(&ctx, "u1", &pid, Some("sess-a")).await.unwrap();
        tokio::fs::write(ws.base_dir.join("a.txt"), b"changed").await.unwrap();
        mgr.commit(&ctx, &ws).await.unwrap();

        // Uncommitted scratch state must survive a cache-hit checkout — the
        // fast path hands the live session back without re-hydrating.
        tokio::fs::write(ws.base_dir.join("scratch.txt"), b"wip").await.unwrap();
        let ws2 = mgr.checkout(&ctx, "u1", &pid, Some("sess-a")).await.unwrap();
        assert_eq!(ws2.base_dir, ws.base_dir);
        assert!(ws2.base_dir.join("scratch.txt").exists());
    }

    #[tokio::test]
    async fn invalidation_watcher_is_refcounted_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let pid = Uuid::new_v4().to_string();
        seed_project(store.as_ref(), "u1", &pid).await;

        let inner = Arc::new(EphemeralWorkspaceManager::new(dir.path(), store, vec!["skills/".into()], None));
        let bus = InvalidationBus::new();
        let mgr = EnterpriseWorkspaceManager::new(inner, Arc::new(InMemoryGenerationCache::new()), bus.clone(), Arc::new(InMemoryCommitLog::new()))
            .with_skills_invalidation_sink(Arc::new(|_| {}));

        let ctx = CancellationToken::new();
        let ws_a = mgr.checkout(&ctx, "u1", &pid, Some("sess-a")).await.unwrap();
        let ws_b = mgr.checkout(&ctx, "u1", &pid, Some("sess-b")).await.unwrap();
        assert_eq!(bus.subscriber_count("u1", &pid), 1);

        mgr.cleanup(&ctx, &ws_a).await.unwrap();
        assert_eq!(bus.subscriber_count("u1", &pid), 1);

        mgr.cleanup(&ctx, &ws_b).await.unwrap();
        assert_eq!(bus.subscriber_count("u1", &pid), 0);
    }
}
