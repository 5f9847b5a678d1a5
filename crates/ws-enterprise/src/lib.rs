//! Multi-tenant coordination layered over the ephemeral workspace manager:
//! a generation cache that lets checkout skip redundant listing, an
//! optional encrypted tmpfs materializer, commit-event publication, and
//! reference-counted invalidation pub/sub.

pub mod commit_log;
pub mod encrypted_cache;
pub mod generation_cache;
pub mod manager;
pub mod pubsub;

pub use commit_log::{CommitLog, InMemoryCommitLog};
pub use encrypted_cache::{DekMemo, EncryptedDiskCache};
pub use generation_cache::{GenerationCache, GenerationMark, InMemoryGenerationCache};
pub use manager::{EnterpriseWorkspaceManager, InvalidationSink};
pub use pubsub::{InvalidationBus, Subscription};

#[cfg(feature = "redis")]
pub use commit_log::RedisCommitLog;
#[cfg(feature = "redis")]
pub use generation_cache::RedisGenerationCache;
