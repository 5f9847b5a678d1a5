//! `TransitKeyProvider`: wraps/unwraps DEKs through a remote transit-style
//! encryption endpoint (e.g. Vault's `transit` secrets engine). The KEK
//! never leaves the remote service; only wrapped ciphertext crosses the
//! wire.

use crate::provider::KeyProvider;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;
use ws_core::cancel::{run_cancellable, CancellationToken};
use ws_core::model::ProviderType;
use ws_core::{Error, Result};

pub struct TransitKeyProvider {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    namespace: Option<String>,
}

#[derive(Serialize)]
struct EncryptRequest<'a> {
    plaintext: String,
    context: Option<&'a str>,
}

#[derive(Deserialize)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    ciphertext: &'a str,
    context: Option<&'a str>,
}

#[derive(Deserialize)]
struct DecryptResponse {
    plaintext: String,
}

impl TransitKeyProvider {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>, namespace: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token: token.into(),
            namespace,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl KeyProvider for TransitKeyProvider {
    async fn wrap(&self, ctx: &CancellationToken, project_id: &str, dek: &[u8; 32]) -> Result<String> {
        let mut req = self
            .client
            .post(self.url("encrypt"))
            .bearer_auth(&self.token)
            .json(&EncryptRequest {
                plaintext: BASE64.encode(dek),
                context: Some(project_id),
            });
        if let Some(ns) = &self.namespace {
            req = req.header("X-Vault-Namespace", ns);
        }

        let resp = run_cancellable(ctx, "transit encrypt", async {
            req.send()
                .await
                .map_err(|e| Error::Transient(format!("transit encrypt: {e}")))
        })
        .await?;
        if !resp.status().is_success() {
            warn!(project_id, status = %resp.status(), "transit encrypt failed");
            return Err(Error::Transient(format!(
                "transit encrypt returned {}",
                resp.status()
            )));
        }
        let body: EncryptResponse = resp
            .json()
            .await
            .map_err(|e| Error::Internal(format!("transit encrypt response: {e}")))?;
        Ok(body.ciphertext)
    }

    async fn unwrap(&self, ctx: &CancellationToken, project_id: &str, wrapped: &str) -> Result<[u8; 32]> {
        let mut req = self
            .client
            .post(self.url("decrypt"))
            .bearer_auth(&self.token)
            .json(&DecryptRequest {
                ciphertext: wrapped,
                context: Some(project_id),
            });
        if let Some(ns) = &self.namespace {
            req = req.header("X-Vault-Namespace", ns);
        }

        let resp = run_cancellable(ctx, "transit decrypt", async {
            req.send()
                .await
                .map_err(|e| Error::Transient(format!("transit decrypt: {e}")))
        })
        .await?;
        if !resp.status().is_success() {
            warn!(project_id, status = %resp.status(), "transit decrypt failed");
            return Err(Error::UnwrapFailed(format!(
                "transit decrypt returned {}",
                resp.status()
            )));
        }
        let body: DecryptResponse = resp
            .json()
            .await
            .map_err(|e| Error::Internal(format!("transit decrypt response: {e}")))?;
        let dek_bytes = BASE64
            .decode(&body.plaintext)
            .map_err(|_| Error::UnwrapFailed("invalid base64 in transit response".into()))?;
        if dek_bytes.len() != 32 {
            return Err(Error::UnwrapFailed("unexpected dek length".into()));
        }
        let mut dek = [0u8; 32];
        dek.copy_from_slice(&dek_bytes);
        Ok(dek)
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::Vault
    }

    async fn health_check(&self, ctx: &CancellationToken) -> Result<()> {
        let resp = run_cancellable(ctx, "transit health check", async {
            self.client
                .get(self.url("health"))
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| Error::Transient(format!("transit health check: {e}")))
        })
        .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Transient(format!(
                "transit health check returned {}",
                resp.status()
            )))
        }
    }
}
