//! Per-project invalidation pub/sub.
//!
//! Each `(tenant, project)` gets its own `tokio::sync::broadcast` channel,
//! created lazily on first subscription and torn down once the last
//! subscriber drops — no channel lingers for a project nobody is watching.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;
use ws_core::model::InvalidationEvent;

const CHANNEL_CAPACITY: usize = 256;

struct Channel {
    tx: broadcast::Sender<InvalidationEvent>,
    subscriber_count: std::sync::atomic::AtomicUsize,
}

/// Reference-counted, lazily-created broadcast bus per project.
#[derive(Default)]
pub struct InvalidationBus {
    channels: Arc<DashMap<String, Arc<Channel>>>,
}

/// A live subscription. Dropping it decrements the channel's subscriber
/// count; when it reaches zero the channel entry is removed.
pub struct Subscription {
    key: String,
    channels: Arc<DashMap<String, Arc<Channel>>>,
    rx: broadcast::Receiver<InvalidationEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<InvalidationEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "invalidation subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(entry) = self.channels.get(&self.key) {
            if entry.subscriber_count.fetch_sub(1, std::sync::atomic::Ordering::AcqRel) == 1 {
                drop(entry);
                self.channels.remove(&self.key);
            }
        }
    }
}

impl InvalidationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { channels: Arc::new(DashMap::new()) })
    }

    fn key(tenant_id: &str, project_id: &str) -> String {
        format!("{tenant_id}:{project_id}")
    }

    pub fn publish(self: &Arc<Self>, tenant_id: &str, project_id: &str, event: InvalidationEvent) {
        if let Some(ch) = self.channels.get(&Self::key(tenant_id, project_id)) {
            let _ = ch.tx.send(event);
        }
    }

    /// Subscribe, creating the channel if this is the first subscriber for
    /// the project. The returned [`Subscription`] keeps the channel alive
    /// until dropped.
    pub fn subscribe(self: &Arc<Self>, tenant_id: &str, project_id: &str) -> Subscription {
        let key = Self::key(tenant_id, project_id);
        let channel = self
            .channels
            .entry(key.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                Arc::new(Channel { tx, subscriber_count: std::sync::atomic::AtomicUsize::new(0) })
            })
            .clone();
        channel.subscriber_count.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        let rx = channel.tx.subscribe();
        Subscription { key, channels: self.channels.clone(), rx }
    }

    pub fn subscriber_count(&self, tenant_id: &str, project_id: &str) -> usize {
        self.channels
            .get(&Self::key(tenant_id, project_id))
            .map(|c| c.subscriber_count.load(std::sync::atomic::Ordering::Acquire))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_event(project_id: Uuid) -> InvalidationEvent {
        InvalidationEvent { project_id, generation: 2, skills_generation: 1, changed_paths: vec!["a.txt".into()] }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = InvalidationBus::new();
        let mut sub = bus.subscribe("t1", "p1");
        let project_id = Uuid::new_v4();
        bus.publish("t1", "p1", sample_event(project_id));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.project_id, project_id);
    }

    #[tokio::test]
    async fn channel_is_removed_after_last_subscriber_drops() {
        let bus = InvalidationBus::new();
        let sub = bus.subscribe("t1", "p1");
        assert_eq!(bus.subscriber_count("t1", "p1"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("t1", "p1"), 0);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_noop() {
        let bus = InvalidationBus::new();
        bus.publish("t1", "p1", sample_event(Uuid::new_v4()));
    }
}
