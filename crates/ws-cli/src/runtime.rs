//! Builds the object store, projects service, and workspace manager a
//! command needs from the loaded [`ws_core::Config`].

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use ws_core::config::{Backend, KeyProviderKind, WorkspaceModeConfig};
use ws_core::Config;
use ws_crypto::{FileKeyProvider, KeyProvider, KmsKeyProvider, TransitKeyProvider};
use ws_enterprise::{
    CommitLog, EnterpriseWorkspaceManager, GenerationCache, InMemoryCommitLog, InMemoryGenerationCache, InvalidationBus, RedisCommitLog, RedisGenerationCache,
};
use ws_manager::{EphemeralWorkspaceManager, LegacyWorkspaceManager, WorkspaceManager};
use ws_projects::{FsProjectsService, ObjectStoreProjectsService, ProjectsService};
use ws_store::fs::FsStore;
use ws_store::ObjectStore;

const LIST_CACHE_TTL: Duration = Duration::from_secs(5);

fn master_key_path(cfg: &Config) -> PathBuf {
    cfg.workspace.root.clone().unwrap_or_else(|| PathBuf::from(".")).join(".keystore").join("master.key")
}

pub async fn build_key_provider(cfg: &Config) -> Result<Option<Arc<dyn KeyProvider>>> {
    if !cfg.encrypt {
        return Ok(None);
    }
    let provider: Arc<dyn KeyProvider> = match cfg.encryption.provider {
        KeyProviderKind::File => Arc::new(FileKeyProvider::open(master_key_path(cfg)).await?),
        KeyProviderKind::Vault => {
            let endpoint = cfg.encryption.transit_endpoint.clone().context("encryption.transit_endpoint is required for the vault provider")?;
            let token = cfg.encryption.transit_token.clone().context("encryption.transit_token is required for the vault provider")?;
            Arc::new(TransitKeyProvider::new(endpoint, token, cfg.encryption.transit_namespace.clone()))
        }
        KeyProviderKind::AwsKms => {
            let endpoint = cfg.encryption.kms_endpoint.clone().context("encryption.kms_endpoint is required for the awskms provider")?;
            let key_id = cfg.encryption.kms_key_id.clone().context("encryption.kms_key_id is required for the awskms provider")?;
            let api_key = cfg.encryption.kms_api_key.clone().context("encryption.kms_api_key is required for the awskms provider")?;
            Arc::new(KmsKeyProvider::new(endpoint, key_id, api_key))
        }
    };
    Ok(Some(provider))
}

pub fn build_object_store(cfg: &Config) -> Result<Arc<dyn ObjectStore>> {
    match cfg.backend {
        Backend::Filesystem => {
            let root = cfg.workspace.root.clone().unwrap_or_else(|| PathBuf::from("./data"));
            Ok(Arc::new(FsStore::new(root)))
        }
        Backend::S3 => {
            let bucket = cfg.s3.bucket.clone().context("s3.bucket is required for the s3 backend")?;
            let store_cfg = ws_store::s3::S3StoreConfig {
                bucket,
                region: cfg.s3.region.clone(),
                endpoint: cfg.s3.endpoint.clone(),
                prefix: cfg.s3.prefix.clone(),
                use_path_style: cfg.s3.use_path_style,
                access_key: cfg.s3.access_key.clone(),
                secret_key: cfg.s3.secret_key.clone(),
                sse: match cfg.s3.sse.mode {
                    ws_core::config::SseMode::None => None,
                    ws_core::config::SseMode::Aes256 => Some("AES256".to_string()),
                    ws_core::config::SseMode::KmsManaged => Some("aws:kms".to_string()),
                },
                sse_kms_key_id: cfg.s3.sse.kms_key_id.clone(),
            };
            Ok(Arc::new(ws_store::s3::S3Store::new(store_cfg)?))
        }
    }
}

pub async fn build_projects_service(cfg: &Config) -> Result<Box<dyn ProjectsService>> {
    let key_provider = build_key_provider(cfg).await?;
    match cfg.backend {
        Backend::Filesystem => {
            let root = cfg.workspace.root.clone().unwrap_or_else(|| PathBuf::from("./data"));
            Ok(Box::new(FsProjectsService::new(root, cfg.reserved_skills_prefixes.clone(), key_provider)))
        }
        Backend::S3 => {
            let store = build_object_store(cfg)?;
            Ok(Box::new(ObjectStoreProjectsService::new(store, cfg.reserved_skills_prefixes.clone(), key_provider, master_key_path(cfg), LIST_CACHE_TTL)))
        }
    }
}

pub async fn build_workspace_manager(cfg: &Config) -> Result<Box<dyn WorkspaceManager>> {
    let root = cfg.workspace.root.clone().unwrap_or_else(|| PathBuf::from("./data"));
    match cfg.workspace.mode {
        WorkspaceModeConfig::Legacy => Ok(Box::new(LegacyWorkspaceManager::new(root))),
        WorkspaceModeConfig::Ephemeral => {
            let store = build_object_store(cfg)?;
            let key_provider = build_key_provider(cfg).await?;
            Ok(Box::new(EphemeralWorkspaceManager::new(root, store, cfg.reserved_skills_prefixes.clone(), key_provider)))
        }
        WorkspaceModeConfig::Enterprise => {
            let store = build_object_store(cfg)?;
            let key_provider = build_key_provider(cfg).await?;
            // Sessions land on the fast scratch mount when one is configured.
            let session_root = cfg.workspace.tmpfs_dir.clone().unwrap_or(root);
            let inner = Arc::new(EphemeralWorkspaceManager::new(session_root, store.clone(), cfg.reserved_skills_prefixes.clone(), key_provider.clone()));

            let generation_cache: Arc<dyn GenerationCache> = if cfg.redis.enabled {
                let url = redis_url(cfg)?;
                Arc::new(RedisGenerationCache::connect(&url).await.context("failed to connect to redis for the generation cache")?)
            } else {
                Arc::new(InMemoryGenerationCache::new())
            };

            let commit_log: Arc<dyn CommitLog> = if cfg.events.enabled {
                // Commit events ride a Redis stream; `events.brokers` names
                // the transport when set, else the generation cache's addr.
                let url = cfg.events.brokers.clone().map(Ok).unwrap_or_else(|| redis_url(cfg))?;
                let topic = cfg.events.topic.as_deref().unwrap_or("workspace-commits");
                Arc::new(RedisCommitLog::connect(&url, topic).await.context("failed to connect to redis for the commit log")?)
            } else {
                Arc::new(InMemoryCommitLog::new())
            };

            let mut manager = EnterpriseWorkspaceManager::new(inner, generation_cache, InvalidationBus::new(), commit_log);
            if let (Some(cache_dir), Some(provider)) = (cfg.workspace.cache_dir.clone(), key_provider) {
                manager = manager.with_tmpfs_cache(cache_dir, provider, store);
            }
            Ok(Box::new(manager))
        }
    }
}

/// Assemble a `redis://` connection URL from the `[redis]` config table.
/// An `addr` that already carries a scheme is passed through untouched.
pub fn redis_url(cfg: &Config) -> Result<String> {
    let addr = cfg.redis.addr.clone().context("redis.addr is required when redis is enabled")?;
    if addr.starts_with("redis://") || addr.starts_with("rediss://") {
        return Ok(addr);
    }
    let auth = cfg.redis.password.as_deref().map(|p| format!(":{p}@")).unwrap_or_default();
    Ok(format!("redis://{auth}{addr}/{}", cfg.redis.db))
}
