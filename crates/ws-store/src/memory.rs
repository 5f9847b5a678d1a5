//! In-memory `ObjectStore`, used by every unit test in this workspace that
//! needs object-store semantics without a real backend.

use crate::store::{ListOptions, ListResult, ObjectAttrs, ObjectStore, PutOptions};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::{Error, Result};

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    attrs: ObjectAttrs,
}

/// In-memory object store. Keys are sorted lexically for `list`, matching
/// the ordering a real S3-compatible backend returns.
#[derive(Default)]
pub struct InMemoryStore {
    objects: DashMap<String, StoredObject>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<(Vec<u8>, ObjectAttrs)> {
        bail_if_canceled(ctx, "get")?;
        self.objects
            .get(key)
            .map(|entry| (entry.data.clone(), entry.attrs.clone()))
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn put(&self, ctx: &CancellationToken, key: &str, data: Vec<u8>, opts: PutOptions) -> Result<String> {
        bail_if_canceled(ctx, "put")?;
        if key.is_empty() {
            return Err(Error::InvalidKey(key.to_string()));
        }
        let etag = format!("{:x}", md5_like(&data));
        let attrs = ObjectAttrs {
            size: data.len() as u64,
            etag: etag.clone(),
            content_type: opts.content_type,
            last_modified: Utc::now(),
            metadata: opts.metadata,
        };
        self.objects
            .insert(key.to_string(), StoredObject { data, attrs });
        Ok(etag)
    }

    async fn delete(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        bail_if_canceled(ctx, "delete")?;
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, ctx: &CancellationToken, opts: ListOptions) -> Result<ListResult> {
        bail_if_canceled(ctx, "list")?;
        // BTreeMap snapshot gives deterministic lexical order for pagination.
        let snapshot: BTreeMap<String, ObjectAttrs> = self
            .objects
            .iter()
            .filter(|e| e.key().starts_with(&opts.prefix))
            .map(|e| (e.key().clone(), e.value().attrs.clone()))
            .collect();

        let mut objects = Vec::new();
        let mut common_prefixes = Vec::new();
        let mut seen_prefixes = std::collections::HashSet::new();

        let start = match &opts.continuation_token {
            Some(tok) => snapshot
                .range(tok.clone()..)
                .next()
                .map(|(k, _)| k.clone()),
            None => snapshot.keys().next().cloned(),
        };

        let mut iter = match &start {
            Some(start_key) => snapshot.range(start_key.clone()..),
            None => snapshot.range(String::new()..),
        };

        let max_keys = opts.max_keys.unwrap_or(usize::MAX);
        let mut emitted = 0usize;
        let mut next_token = None;

        while let Some((key, attrs)) = iter.next() {
            if emitted >= max_keys {
                next_token = Some(key.clone());
                break;
            }

            if let Some(delim) = &opts.delimiter {
                let rest = &key[opts.prefix.len()..];
                if let Some(idx) = rest.find(delim.as_str()) {
                    let pseudo_dir = format!("{}{}{}", opts.prefix, &rest[..idx], delim);
                    if seen_prefixes.insert(pseudo_dir.clone()) {
                        common_prefixes.push(pseudo_dir);
                        emitted += 1;
                    }
                    continue;
                }
            }

            objects.push((key.clone(), attrs.clone()));
            emitted += 1;
        }

        let is_truncated = next_token.is_some();

        Ok(ListResult {
            objects,
            common_prefixes,
            is_truncated,
            next_continuation_token: next_token,
        })
    }

    async fn head(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectAttrs> {
        bail_if_canceled(ctx, "head")?;
        self.objects
            .get(key)
            .map(|entry| entry.attrs.clone())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn copy(&self, ctx: &CancellationToken, src: &str, dst: &str) -> Result<()> {
        bail_if_canceled(ctx, "copy")?;
        let entry = self
            .objects
            .get(src)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(src.to_string()))?;
        self.objects.insert(dst.to_string(), entry);
        Ok(())
    }
}

/// Cheap content fingerprint for etags; not cryptographically meaningful,
/// only used to detect "did this blob change" in tests.
fn md5_like(data: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn roundtrip_put_get_delete() {
        let store = InMemoryStore::new();
        let ctx = ctx();
        store
            .put(&ctx, "a/b.txt", b"hello".to_vec(), PutOptions::default())
            .await
            .unwrap();
        assert!(store.exists(&ctx, "a/b.txt").await.unwrap());

        let (data, attrs) = store.get(&ctx, "a/b.txt").await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(attrs.size, 5);

        store.delete(&ctx, "a/b.txt").await.unwrap();
        assert!(!store.exists(&ctx, "a/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryStore::new();
        let ctx = ctx();
        store.delete(&ctx, "missing").await.unwrap();
        store.delete(&ctx, "missing").await.unwrap();
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get(&ctx(), "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn canceled_token_short_circuits_every_op() {
        let store = InMemoryStore::new();
        let ctx = CancellationToken::new();
        store
            .put(&ctx, "k", b"v".to_vec(), PutOptions::default())
            .await
            .unwrap();
        ctx.cancel();

        assert!(matches!(store.get(&ctx, "k").await, Err(Error::Canceled(_))));
        assert!(matches!(store.put(&ctx, "k", vec![], PutOptions::default()).await, Err(Error::Canceled(_))));
        assert!(matches!(store.delete(&ctx, "k").await, Err(Error::Canceled(_))));
        assert!(matches!(store.list(&ctx, ListOptions::default()).await, Err(Error::Canceled(_))));
    }

    #[tokio::test]
    async fn list_with_delimiter_groups_common_prefixes() {
        let store = InMemoryStore::new();
        let ctx = ctx();
        for key in [
            "proj/files/README.md",
            "proj/files/src/main.rs",
            "proj/files/src/lib.rs",
            "proj/.meta/project.json",
        ] {
            store
                .put(&ctx, key, b"x".to_vec(), PutOptions::default())
                .await
                .unwrap();
        }

        let result = store
            .list(
                &ctx,
                ListOptions {
                    prefix: "proj/files/".to_string(),
                    delimiter: Some("/".to_string()),
                    max_keys: None,
                    continuation_token: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(result.objects.len(), 1);
        assert_eq!(result.objects[0].0, "proj/files/README.md");
        assert_eq!(result.common_prefixes, vec!["proj/files/src/".to_string()]);
    }

    #[tokio::test]
    async fn list_paginates_with_continuation_token() {
        let store = InMemoryStore::new();
        let ctx = ctx();
        for i in 0..5 {
            store
                .put(&ctx, &format!("k{i}"), b"x".to_vec(), PutOptions::default())
                .await
                .unwrap();
        }

        let page1 = store
            .list(
                &ctx,
                ListOptions {
                    prefix: String::new(),
                    delimiter: None,
                    max_keys: Some(2),
                    continuation_token: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(page1.objects.len(), 2);
        assert!(page1.is_truncated);
        let token = page1.next_continuation_token.clone().unwrap();

        let page2 = store
            .list(
                &ctx,
                ListOptions {
                    prefix: String::new(),
                    delimiter: None,
                    max_keys: Some(10),
                    continuation_token: Some(token),
                },
            )
            .await
            .unwrap();
        assert_eq!(page2.objects.len(), 3);
        assert!(!page2.is_truncated);
    }

    #[tokio::test]
    async fn copy_duplicates_object() {
        let store = InMemoryStore::new();
        let ctx = ctx();
        store
            .put(&ctx, "src", b"payload".to_vec(), PutOptions::default())
            .await
            .unwrap();
        store.copy(&ctx, "src", "dst").await.unwrap();
        let (data, _) = store.get(&ctx, "dst").await.unwrap();
        assert_eq!(data, b"payload");
    }

    #[tokio::test]
    async fn delete_prefix_removes_recursively() {
        let store = InMemoryStore::new();
        let ctx = ctx();
        store
            .put(&ctx, "proj/a", b"1".to_vec(), PutOptions::default())
            .await
            .unwrap();
        store
            .put(&ctx, "proj/b", b"2".to_vec(), PutOptions::default())
            .await
            .unwrap();
        store
            .put(&ctx, "other/c", b"3".to_vec(), PutOptions::default())
            .await
            .unwrap();

        store.delete_prefix(&ctx, "proj/").await.unwrap();

        assert!(!store.exists(&ctx, "proj/a").await.unwrap());
        assert!(!store.exists(&ctx, "proj/b").await.unwrap());
        assert!(store.exists(&ctx, "other/c").await.unwrap());
    }
}
