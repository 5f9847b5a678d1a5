//! Filesystem-backed `ObjectStore` — the `backend = "filesystem"` wiring.
//!
//! Object keys map directly onto relative paths under `root`; directories
//! are implicit (there is no empty-marker file unless one was explicitly
//! `put` with a trailing `/`).

use crate::store::{ListOptions, ListResult, ObjectAttrs, ObjectStore, PutOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::{Error, Result};

pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(Error::InvalidKey(key.to_string()));
        }
        ws_core::validate::join_contained(&self.root, key)
    }
}

async fn file_attrs(path: &Path) -> Result<ObjectAttrs> {
    let meta = tokio::fs::metadata(path).await?;
    let last_modified: DateTime<Utc> = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
    Ok(ObjectAttrs {
        size: meta.len(),
        etag: format!("{:x}-{}", meta.len(), last_modified.timestamp_nanos_opt().unwrap_or(0)),
        content_type: None,
        last_modified,
        metadata: Default::default(),
    })
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<(Vec<u8>, ObjectAttrs)> {
        bail_if_canceled(ctx, "get")?;
        let path = self.resolve(key)?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| map_io(e, key))?;
        let attrs = file_attrs(&path).await?;
        Ok((data, attrs))
    }

    async fn put(&self, ctx: &CancellationToken, key: &str, data: Vec<u8>, _opts: PutOptions) -> Result<String> {
        bail_if_canceled(ctx, "put")?;
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!(
            "tmp-{}",
            uuid::Uuid::new_v4().simple()
        ));
        {
            let mut f = tokio::fs::File::create(&tmp).await?;
            f.write_all(&data).await?;
            f.flush().await?;
        }
        // A cancellation observed past this point would leave the rename
        // half-done; the write is committed or not at the rename boundary.
        if ctx.is_cancelled() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Canceled("put".into()));
        }
        tokio::fs::rename(&tmp, &path).await?;
        let attrs = file_attrs(&path).await?;
        Ok(attrs.etag)
    }

    async fn delete(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        bail_if_canceled(ctx, "delete")?;
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, ctx: &CancellationToken, opts: ListOptions) -> Result<ListResult> {
        bail_if_canceled(ctx, "list")?;
        let prefix_path = if opts.prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(&opts.prefix).unwrap_or_else(|_| self.root.join(&opts.prefix))
        };

        let mut objects = Vec::new();
        let mut common_prefixes = Vec::new();

        if !prefix_path.exists() {
            return Ok(ListResult::default());
        }

        let walker = walkdir_flat(&prefix_path);
        for entry in walker {
            bail_if_canceled(ctx, "list")?;
            let rel = entry
                .strip_prefix(&self.root)
                .unwrap_or(&entry)
                .to_string_lossy()
                .replace('\\', "/");

            if opts.delimiter.is_some() {
                let within = rel
                    .strip_prefix(&opts.prefix)
                    .unwrap_or(&rel);
                if let Some(idx) = within.find('/') {
                    let pseudo = format!("{}{}/", opts.prefix, &within[..idx]);
                    if !common_prefixes.contains(&pseudo) {
                        common_prefixes.push(pseudo);
                    }
                    continue;
                }
            }

            let attrs = file_attrs(&entry).await?;
            objects.push((rel, attrs));
        }

        objects.sort_by(|a, b| a.0.cmp(&b.0));
        common_prefixes.sort();

        Ok(ListResult {
            objects,
            common_prefixes,
            is_truncated: false,
            next_continuation_token: None,
        })
    }

    async fn head(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectAttrs> {
        bail_if_canceled(ctx, "head")?;
        let path = self.resolve(key)?;
        if !path.is_file() {
            return Err(Error::NotFound(key.to_string()));
        }
        file_attrs(&path).await
    }

    async fn copy(&self, ctx: &CancellationToken, src: &str, dst: &str) -> Result<()> {
        bail_if_canceled(ctx, "copy")?;
        let src_path = self.resolve(src)?;
        let dst_path = self.resolve(dst)?;
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src_path, &dst_path)
            .await
            .map_err(|e| map_io(e, src))?;
        Ok(())
    }
}

fn map_io(e: std::io::Error, key: &str) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(key.to_string())
    } else {
        Error::Io(e)
    }
}

/// Recursively walk `dir` (symlinks never followed), returning file paths
/// only. Small synchronous helper; project trees checked out by this
/// service are not large enough to warrant an async walker.
fn walkdir_flat(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&d) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                out.push(entry.path());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let ctx = ctx();

        store
            .put(&ctx, "a/b.txt", b"hello".to_vec(), PutOptions::default())
            .await
            .unwrap();
        let (data, _) = store.get(&ctx, "a/b.txt").await.unwrap();
        assert_eq!(data, b"hello");

        store.delete(&ctx, "a/b.txt").await.unwrap();
        assert!(!store.exists(&ctx, "a/b.txt").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_keys_escaping_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        assert!(store.put(&ctx(), "../escape", vec![], PutOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn canceled_token_rejects_puts() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(matches!(
            store.put(&ctx, "a.txt", b"x".to_vec(), PutOptions::default()).await,
            Err(Error::Canceled(_))
        ));
    }

    #[tokio::test]
    async fn list_with_delimiter() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::new(dir.path());
        let ctx = ctx();
        store.put(&ctx, "proj/files/a.txt", b"1".to_vec(), PutOptions::default()).await.unwrap();
        store.put(&ctx, "proj/files/sub/b.txt", b"2".to_vec(), PutOptions::default()).await.unwrap();

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
        assert_eq!(result.common_prefixes, vec!["proj/files/sub/".to_string()]);
    }
}
