//! S3-compatible `ObjectStore`, backed by `opendal`'s `services-s3`.

use crate::store::{ListOptions, ListResult, ObjectAttrs, ObjectStore, PutOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opendal::{Metadata, Operator};
use ws_core::cancel::{run_cancellable, CancellationToken};
use ws_core::{Error, Result};

pub struct S3Store {
    op: Operator,
    prefix: String,
}

#[derive(Debug, Clone, Default)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub use_path_style: bool,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// `"AES256"` or `"aws:kms"`; unset disables server-side encryption.
    pub sse: Option<String>,
    pub sse_kms_key_id: Option<String>,
}

impl S3Store {
    pub fn new(cfg: S3StoreConfig) -> Result<Self> {
        let mut builder = opendal::services::S3::default().bucket(&cfg.bucket);
        if let Some(region) = &cfg.region {
            builder = builder.region(region);
        }
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint(endpoint);
        }
        // opendal's S3 service defaults to path-style addressing; only flip
        // to virtual-host style when path style was NOT requested.
        if !cfg.use_path_style {
            builder = builder.enable_virtual_host_style();
        }
        if let (Some(ak), Some(sk)) = (&cfg.access_key, &cfg.secret_key) {
            builder = builder.access_key_id(ak).secret_access_key(sk);
        }
        if let Some(sse) = &cfg.sse {
            builder = builder.server_side_encryption(sse);
        }
        if let Some(kms_key_id) = &cfg.sse_kms_key_id {
            builder = builder.server_side_encryption_aws_kms_key_id(kms_key_id);
        }

        let op = Operator::new(builder)
            .map_err(|e| Error::Internal(format!("failed to build s3 operator: {e}")))?
            .finish();

        Ok(Self {
            op,
            prefix: cfg.prefix.unwrap_or_default(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), key)
        }
    }
}

fn attrs_from_meta(meta: &Metadata) -> ObjectAttrs {
    let last_modified: DateTime<Utc> = meta
        .last_modified()
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    ObjectAttrs {
        size: meta.content_length(),
        etag: meta.etag().unwrap_or_default().to_string(),
        content_type: meta.content_type().map(|s| s.to_string()),
        last_modified,
        metadata: Default::default(),
    }
}

fn map_opendal_err(e: opendal::Error, key: &str) -> Error {
    use opendal::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => Error::NotFound(key.to_string()),
        ErrorKind::PermissionDenied => Error::AccessDenied(key.to_string()),
        ErrorKind::ConfigInvalid => Error::BucketMissing(key.to_string()),
        _ => Error::Transient(e.to_string()),
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<(Vec<u8>, ObjectAttrs)> {
        let full = self.full_key(key);
        let data = run_cancellable(ctx, "get", async {
            self.op.read(&full).await.map_err(|e| map_opendal_err(e, key))
        })
        .await?;
        let meta = run_cancellable(ctx, "get", async {
            self.op.stat(&full).await.map_err(|e| map_opendal_err(e, key))
        })
        .await?;
        Ok((data.to_vec(), attrs_from_meta(&meta)))
    }

    async fn put(&self, ctx: &CancellationToken, key: &str, data: Vec<u8>, opts: PutOptions) -> Result<String> {
        let full = self.full_key(key);
        run_cancellable(ctx, "put", async {
            let mut write = self.op.write_with(&full, data);
            if let Some(ct) = &opts.content_type {
                write = write.content_type(ct);
            }
            write.await.map_err(|e| map_opendal_err(e, key))?;
            Ok(())
        })
        .await?;
        let meta = run_cancellable(ctx, "put", async {
            self.op.stat(&full).await.map_err(|e| map_opendal_err(e, key))
        })
        .await?;
        Ok(meta.etag().unwrap_or_default().to_string())
    }

    async fn delete(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        let full = self.full_key(key);
        run_cancellable(ctx, "delete", async {
            match self.op.delete(&full).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(map_opendal_err(e, key)),
            }
        })
        .await
    }

    async fn list(&self, ctx: &CancellationToken, opts: ListOptions) -> Result<ListResult> {
        let full_prefix = self.full_key(&opts.prefix);
        run_cancellable(ctx, "list", async {
            let mut lister = self
                .op
                .lister_with(&full_prefix)
                .recursive(opts.delimiter.is_none())
                .await
                .map_err(|e| map_opendal_err(e, &opts.prefix))?;

            let mut objects = Vec::new();
            let mut common_prefixes = Vec::new();

            use futures::StreamExt;
            while let Some(entry) = lister.next().await {
                let entry = entry.map_err(|e| map_opendal_err(e, &opts.prefix))?;
                let path = entry.path().trim_start_matches(&self.prefix).trim_start_matches('/');
                if entry.metadata().is_dir() {
                    common_prefixes.push(path.to_string());
                } else {
                    objects.push((path.to_string(), attrs_from_meta(entry.metadata())));
                }
            }

            Ok(ListResult {
                objects,
                common_prefixes,
                is_truncated: false,
                next_continuation_token: None,
            })
        })
        .await
    }

    async fn head(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectAttrs> {
        let full = self.full_key(key);
        let meta = run_cancellable(ctx, "head", async {
            self.op.stat(&full).await.map_err(|e| map_opendal_err(e, key))
        })
        .await?;
        Ok(attrs_from_meta(&meta))
    }

    async fn copy(&self, ctx: &CancellationToken, src: &str, dst: &str) -> Result<()> {
        let full_src = self.full_key(src);
        let full_dst = self.full_key(dst);
        run_cancellable(ctx, "copy", async {
            self.op
                .copy(&full_src, &full_dst)
                .await
                .map_err(|e| map_opendal_err(e, src))
        })
        .await
    }
}
