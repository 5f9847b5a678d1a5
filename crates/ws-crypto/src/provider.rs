//! Key providers: the boundary between this crate's DEK machinery and
//! wherever the KEK that wraps a DEK actually lives.

use async_trait::async_trait;
use ws_core::cancel::CancellationToken;
use ws_core::model::ProviderType;
use ws_core::{Error, Result};

/// Wraps and unwraps per-project data encryption keys under a key-encryption
/// key the provider holds. Implementations never see plaintext file bodies —
/// only 32-byte DEKs. Remote providers observe `ctx` on every wire call.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Wrap `dek` for `project_id`, returning an opaque, provider-defined
    /// wrapped-key string safe to store alongside the project's metadata.
    async fn wrap(&self, ctx: &CancellationToken, project_id: &str, dek: &[u8; 32]) -> Result<String>;

    /// Unwrap a value previously produced by [`wrap`](Self::wrap) for the
    /// same `project_id`.
    async fn unwrap(&self, ctx: &CancellationToken, project_id: &str, wrapped: &str) -> Result<[u8; 32]>;

    /// Wrap `dek` in the legacy v1 shape: AES-GCM under a local master key
    /// with the nonce returned separately (it is stored in the envelope,
    /// not prepended to the ciphertext). Returns `(nonce, wrapped)`, both
    /// base64. Only the file provider holds a local master key; remote
    /// providers never wrote this shape.
    async fn wrap_v1(&self, _ctx: &CancellationToken, _dek: &[u8; 32]) -> Result<(String, String)> {
        Err(Error::Internal(format!(
            "{:?} provider cannot write legacy v1 envelopes",
            self.provider_type()
        )))
    }

    /// Unwrap a legacy v1 `(nonce, wrapped)` pair written by
    /// [`wrap_v1`](Self::wrap_v1).
    async fn unwrap_v1(&self, _ctx: &CancellationToken, _nonce: &str, _wrapped: &str) -> Result<[u8; 32]> {
        Err(Error::UnwrapFailed(format!(
            "{:?} provider holds no local master key for legacy v1 envelopes",
            self.provider_type()
        )))
    }

    fn provider_type(&self) -> ProviderType;

    /// Cheap reachability probe, used by `ws-cli doctor` and by the
    /// enterprise wrapper's readiness checks.
    async fn health_check(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Release any held resources (connections, file handles). A no-op for
    /// providers that don't hold any.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
