//! The `ObjectStore` trait and its supporting types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use ws_core::cancel::CancellationToken;
use ws_core::Result;

/// Metadata about an object, returned by `head` and alongside `get`.
#[derive(Debug, Clone)]
pub struct ObjectAttrs {
    pub size: u64,
    pub etag: String,
    pub content_type: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub prefix: String,
    /// When set (conventionally `"/"`), results below the first delimiter
    /// past `prefix` are rolled up into `common_prefixes` instead of being
    /// listed individually — the pseudo-directory idiom.
    pub delimiter: Option<String>,
    pub max_keys: Option<usize>,
    pub continuation_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListResult {
    pub objects: Vec<(String, ObjectAttrs)>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    /// Opaque outside this crate's own in-memory implementation — treat as
    /// a bare continuation cookie, never parse it.
    pub next_continuation_token: Option<String>,
}

/// Narrow object storage contract. Implementations MUST be safe for
/// concurrent use, MUST normalize backend-specific errors to the taxonomy
/// in `ws_core::Error` (`NotFound`, `AccessDenied`, `InvalidKey`,
/// `BucketMissing`), and MUST observe `ctx` promptly — a canceled token
/// surfaces as `Error::Canceled` rather than letting an RPC run on.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch the full object body and its attributes. Fails with
    /// `Error::NotFound` if `key` does not exist.
    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<(Vec<u8>, ObjectAttrs)>;

    /// Write `data` to `key`, fully consuming it. Overwrite semantics:
    /// an existing object at `key` is replaced. Returns the new etag.
    async fn put(&self, ctx: &CancellationToken, key: &str, data: Vec<u8>, opts: PutOptions) -> Result<String>;

    /// Remove `key`. Idempotent — MUST NOT fail when the key is absent.
    async fn delete(&self, ctx: &CancellationToken, key: &str) -> Result<()>;

    /// List objects, optionally grouped into `common_prefixes` when a
    /// delimiter is supplied.
    async fn list(&self, ctx: &CancellationToken, opts: ListOptions) -> Result<ListResult>;

    /// Metadata-only fetch. Fails with `Error::NotFound` if absent.
    async fn head(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectAttrs>;

    /// Copy `src` to `dst`, server-side where the backend supports it.
    async fn copy(&self, ctx: &CancellationToken, src: &str, dst: &str) -> Result<()>;

    /// Whether `key` currently exists.
    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        match self.head(ctx, key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Recursively remove every object under `prefix`. Idempotent.
    async fn delete_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<()> {
        let mut deleted = 0usize;
        let mut token = None;
        loop {
            let page = self
                .list(
                    ctx,
                    ListOptions {
                        prefix: prefix.to_string(),
                        delimiter: None,
                        max_keys: Some(1000),
                        continuation_token: token.take(),
                    },
                )
                .await?;
            for (key, _) in &page.objects {
                self.delete(ctx, key).await?;
                deleted += 1;
            }
            if !page.is_truncated {
                break;
            }
            token = page.next_continuation_token;
            if token.is_none() {
                break;
            }
        }
        tracing::debug!(prefix, deleted, "deleted objects under prefix");
        Ok(())
    }
}
