//! `KmsKeyProvider`: wraps/unwraps DEKs through a cloud KMS-style
//! generate-data-key/decrypt API, binding each call to the owning project
//! via an encryption context so a wrapped key can't be replayed against a
//! different project.

use crate::provider::KeyProvider;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;
use ws_core::cancel::{run_cancellable, CancellationToken};
use ws_core::model::ProviderType;
use ws_core::{Error, Result};

pub struct KmsKeyProvider {
    client: reqwest::Client,
    endpoint: String,
    key_id: String,
    api_key: String,
}

#[derive(Serialize)]
struct EncryptRequest<'a> {
    key_id: &'a str,
    plaintext: String,
    encryption_context: HashMap<&'static str, &'a str>,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext_blob: String,
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    key_id: &'a str,
    ciphertext_blob: &'a str,
    encryption_context: HashMap<&'static str, &'a str>,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

impl KmsKeyProvider {
    pub fn new(endpoint: impl Into<String>, key_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            key_id: key_id.into(),
            api_key: api_key.into(),
        }
    }

    fn encryption_context<'a>(&self, project_id: &'a str) -> HashMap<&'static str, &'a str> {
        let mut ctx = HashMap::new();
        ctx.insert("project_id", project_id);
        ctx
    }
}

#[async_trait]
impl KeyProvider for KmsKeyProvider {
    async fn wrap(&self, ctx: &CancellationToken, project_id: &str, dek: &[u8; 32]) -> Result<String> {
        let resp = run_cancellable(ctx, "kms encrypt", async {
            self.client
                .post(format!("{}/encrypt", self.endpoint.trim_end_matches('/')))
                .bearer_auth(&self.api_key)
                .json(&EncryptRequest {
                    key_id: &self.key_id,
                    plaintext: BASE64.encode(dek),
                    encryption_context: self.encryption_context(project_id),
                })
                .send()
                .await
                .map_err(|e| Error::Transient(format!("kms encrypt: {e}")))
        })
        .await?;

        if !resp.status().is_success() {
            warn!(project_id, status = %resp.status(), "kms encrypt failed");
            return Err(Error::Transient(format!("kms encrypt returned {}", resp.status())));
        }
        let body: EncryptResponse = resp
            .json()
            .await
            .map_err(|e| Error::Internal(format!("kms encrypt response: {e}")))?;
        Ok(body.ciphertext_blob)
    }

    async fn unwrap(&self, ctx: &CancellationToken, project_id: &str, wrapped: &str) -> Result<[u8; 32]> {
        let resp = run_cancellable(ctx, "kms decrypt", async {
            self.client
                .post(format!("{}/decrypt", self.endpoint.trim_end_matches('/')))
                .bearer_auth(&self.api_key)
                .json(&DecryptRequest {
                    key_id: &self.key_id,
                    ciphertext_blob: wrapped,
                    encryption_context: self.encryption_context(project_id),
                })
                .send()
                .await
                .map_err(|e| Error::Transient(format!("kms decrypt: {e}")))
        })
        .await?;

        if !resp.status().is_success() {
            warn!(project_id, status = %resp.status(), "kms decrypt failed");
            return Err(Error::UnwrapFailed(format!("kms decrypt returned {}", resp.status())));
        }
        let body: DecryptResponse = resp
            .json()
            .await
            .map_err(|e| Error::Internal(format!("kms decrypt response: {e}")))?;
        let dek_bytes = BASE64
            .decode(&body.plaintext)
            .map_err(|_| Error::UnwrapFailed("invalid base64 in kms response".into()))?;
        if dek_bytes.len() != 32 {
            return Err(Error::UnwrapFailed("unexpected dek length".into()));
        }
        let mut dek = [0u8; 32];
        dek.copy_from_slice(&dek_bytes);
        Ok(dek)
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AwsKms
    }

    async fn health_check(&self, ctx: &CancellationToken) -> Result<()> {
        let resp = run_cancellable(ctx, "kms health check", async {
            self.client
                .get(format!("{}/health", self.endpoint.trim_end_matches('/')))
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_err(|e| Error::Transient(format!("kms health check: {e}")))
        })
        .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Transient(format!("kms health check returned {}", resp.status())))
        }
    }
}
