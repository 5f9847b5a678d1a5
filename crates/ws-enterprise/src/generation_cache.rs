//! Generation cache: lets a checkout skip re-listing the object store when
//! the caller's local manifest is already current.
//!
//! Keyed by `(tenant, project)`. Redis-backed when the `redis` feature is
//! enabled and configured (uses `redis::aio::ConnectionManager`, which
//! reconnects transparently on transient failures); an in-process
//! `DashMap` otherwise, for single-node deployments and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::Result;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationMark {
    pub generation: u64,
    pub skills_generation: u64,
}

fn cache_key(tenant_id: &str, project_id: &str) -> String {
    format!("{tenant_id}:{project_id}")
}

/// Tracks the last known generation counters per project, and hands out a
/// commit lock per project so two commits never race each other.
#[async_trait]
pub trait GenerationCache: Send + Sync {
    async fn get(&self, ctx: &CancellationToken, tenant_id: &str, project_id: &str) -> Result<Option<GenerationMark>>;
    async fn set(&self, ctx: &CancellationToken, tenant_id: &str, project_id: &str, mark: GenerationMark) -> Result<()>;

    /// Acquire the commit lock for this project. Held for the lifetime of
    /// the returned guard.
    async fn commit_lock(&self, tenant_id: &str, project_id: &str) -> Arc<Mutex<()>>;
}

/// In-process cache. The default when Redis is not configured.
#[derive(Default)]
pub struct InMemoryGenerationCache {
    marks: DashMap<String, GenerationMark>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InMemoryGenerationCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GenerationCache for InMemoryGenerationCache {
    async fn get(&self, ctx: &CancellationToken, tenant_id: &str, project_id: &str) -> Result<Option<GenerationMark>> {
        bail_if_canceled(ctx, "generation cache get")?;
        Ok(self.marks.get(&cache_key(tenant_id, project_id)).map(|m| *m))
    }

    async fn set(&self, ctx: &CancellationToken, tenant_id: &str, project_id: &str, mark: GenerationMark) -> Result<()> {
        bail_if_canceled(ctx, "generation cache set")?;
        self.marks.insert(cache_key(tenant_id, project_id), mark);
        Ok(())
    }

    async fn commit_lock(&self, tenant_id: &str, project_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(cache_key(tenant_id, project_id)).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[cfg(feature = "redis")]
pub mod redis_backed {
    use super::*;
    use tracing::warn;
    use ws_core::cancel::run_cancellable;
    use ws_core::Error;

    const KEY_PREFIX: &str = "ws:gen:";

    /// Redis-backed generation cache. Commit locks stay in-process — a
    /// distributed lock is unnecessary here because each project's commits
    /// are already serialized by the ephemeral manager's own active-session
    /// discipline within a node; this only adds cross-node visibility of
    /// the last known counters.
    pub struct RedisGenerationCache {
        conn: redis::aio::ConnectionManager,
        locks: DashMap<String, Arc<Mutex<()>>>,
    }

    impl RedisGenerationCache {
        pub async fn connect(addr: &str) -> std::result::Result<Self, redis::RedisError> {
            let client = redis::Client::open(addr)?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            Ok(Self { conn, locks: DashMap::new() })
        }

        fn redis_key(tenant_id: &str, project_id: &str) -> String {
            format!("{KEY_PREFIX}{}", cache_key(tenant_id, project_id))
        }
    }

    #[async_trait]
    impl GenerationCache for RedisGenerationCache {
        async fn get(&self, ctx: &CancellationToken, tenant_id: &str, project_id: &str) -> Result<Option<GenerationMark>> {
            use redis::AsyncCommands;
            let mut conn = self.conn.clone();
            let key = Self::redis_key(tenant_id, project_id);
            let fetched = run_cancellable(ctx, "generation cache get", async {
                conn.get::<_, Option<String>>(&key)
                    .await
                    .map_err(|e| Error::Transient(e.to_string()))
            })
            .await;
            let json = match fetched {
                Ok(v) => v,
                Err(Error::Canceled(op)) => return Err(Error::Canceled(op)),
                Err(e) => {
                    warn!(tenant_id, project_id, error = %e, "generation cache GET failed, treating as miss");
                    return Ok(None);
                }
            };
            Ok(json.and_then(|j| serde_json::from_str(&j).ok()))
        }

        async fn set(&self, ctx: &CancellationToken, tenant_id: &str, project_id: &str, mark: GenerationMark) -> Result<()> {
            use redis::AsyncCommands;
            let mut conn = self.conn.clone();
            let key = Self::redis_key(tenant_id, project_id);
            let json = serde_json::to_string(&mark)?;
            let stored = run_cancellable(ctx, "generation cache set", async {
                conn.set::<_, _, ()>(&key, json)
                    .await
                    .map_err(|e| Error::Transient(e.to_string()))
            })
            .await;
            match stored {
                Ok(()) => Ok(()),
                Err(Error::Canceled(op)) => Err(Error::Canceled(op)),
                Err(e) => {
                    warn!(tenant_id, project_id, error = %e, "generation cache SET failed");
                    Ok(())
                }
            }
        }

        async fn commit_lock(&self, tenant_id: &str, project_id: &str) -> Arc<Mutex<()>> {
            self.locks.entry(cache_key(tenant_id, project_id)).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_backed::RedisGenerationCache;

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn get_returns_none_until_set() {
        let cache = InMemoryGenerationCache::new();
        let ctx = ctx();
        assert!(cache.get(&ctx, "t1", "p1").await.unwrap().is_none());
        cache.set(&ctx, "t1", "p1", GenerationMark { generation: 3, skills_generation: 1 }).await.unwrap();
        let mark = cache.get(&ctx, "t1", "p1").await.unwrap().unwrap();
        assert_eq!(mark.generation, 3);
        assert_eq!(mark.skills_generation, 1);
    }

    #[tokio::test]
    async fn commit_lock_is_shared_per_project() {
        let cache = InMemoryGenerationCache::new();
        let a = cache.commit_lock("t1", "p1").await;
        let b = cache.commit_lock("t1", "p1").await;
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.commit_lock("t1", "p2").await;
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    #[ignore = "needs a live redis; set WS_TEST_REDIS_URL and run with --ignored"]
    async fn redis_cache_round_trips_marks() {
        let url = std::env::var("WS_TEST_REDIS_URL").expect("WS_TEST_REDIS_URL");
        let cache = RedisGenerationCache::connect(&url).await.unwrap();
        let ctx = ctx();
        cache.set(&ctx, "t1", "p1", GenerationMark { generation: 7, skills_generation: 2 }).await.unwrap();
        let mark = cache.get(&ctx, "t1", "p1").await.unwrap().unwrap();
        assert_eq!(mark.generation, 7);
        assert_eq!(mark.skills_generation, 2);
    }
}
