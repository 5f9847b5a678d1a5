//! Glue between a project's `.meta/enc.json` envelope and the file bodies
//! it guards. Backend-agnostic: operates purely through [`MetaIo`] and
//! [`KeyProvider`].

use crate::meta_io::MetaIo;
use crate::paths::enc_meta_key;
use std::sync::Arc;
use tracing::info;
use ws_core::cancel::CancellationToken;
use ws_core::model::EncryptionEnvelope;
use ws_core::{Error, Result};
use ws_crypto::{ciphertext, envelope, Dek, FileKeyProvider, KeyProvider};

/// Load the envelope for a project, if encryption is enabled.
pub async fn load_envelope(ctx: &CancellationToken, io: &dyn MetaIo, user_id: &str, project_id: &str) -> Result<Option<EncryptionEnvelope>> {
    let key = enc_meta_key(user_id, project_id);
    match io.read_meta(ctx, &key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn save_envelope(ctx: &CancellationToken, io: &dyn MetaIo, user_id: &str, project_id: &str, envelope: &EncryptionEnvelope) -> Result<()> {
    let key = enc_meta_key(user_id, project_id);
    let bytes = serde_json::to_vec_pretty(envelope)?;
    io.write_meta(ctx, &key, bytes).await
}

/// Encrypt `data` under the project's active DEK, if encryption is enabled.
/// Returns `data` unchanged when it is not.
pub async fn encrypt_if_enabled(
    ctx: &CancellationToken,
    io: &dyn MetaIo,
    provider: Option<&Arc<dyn KeyProvider>>,
    user_id: &str,
    project_id: &str,
    data: Vec<u8>,
) -> Result<Vec<u8>> {
    let Some(env) = load_envelope(ctx, io, user_id, project_id).await? else {
        return Ok(data);
    };
    let provider = provider.ok_or_else(|| Error::Internal("encryption enabled but no key provider configured".into()))?;
    let dek = envelope::unwrap_active(ctx, provider.as_ref(), project_id, &env).await?;
    ciphertext::encrypt(&dek, &data)
}

/// Decrypt `data` if it carries the ciphertext magic header; otherwise
/// return it unchanged (supports incremental migration of a project from
/// plaintext to encrypted). During a rotation's dual-wrapped window a file
/// nobody has re-encrypted yet still decrypts under the `prev` key.
pub async fn decrypt_if_needed(
    ctx: &CancellationToken,
    io: &dyn MetaIo,
    provider: Option<&Arc<dyn KeyProvider>>,
    user_id: &str,
    project_id: &str,
    data: Vec<u8>,
) -> Result<Vec<u8>> {
    if !ciphertext::is_encrypted(&data) {
        return Ok(data);
    }
    let env = load_envelope(ctx, io, user_id, project_id)
        .await?
        .ok_or_else(|| Error::DecryptFailed("ciphertext present but no encryption envelope".into()))?;
    let provider = provider.ok_or_else(|| Error::Internal("ciphertext present but no key provider configured".into()))?;
    let dek = envelope::unwrap_active(ctx, provider.as_ref(), project_id, &env).await?;
    match ciphertext::decrypt(&dek, &data) {
        Ok(plaintext) => Ok(plaintext),
        Err(_) if env.is_rotating() => {
            let prev = envelope::unwrap_prev(ctx, provider.as_ref(), project_id, &env).await?;
            ciphertext::decrypt(&prev, &data)
        }
        Err(e) => Err(e),
    }
}

/// Enable (or confirm already-enabled) encryption for a project. With a
/// configured provider this writes the v2 opaque-wrapped envelope; without
/// one it falls back to a file-backed master key at `<master_key_path>`
/// (creating it if absent) and writes the legacy v1 nonce-in-envelope
/// shape that key has always used.
pub async fn enable_encryption(
    ctx: &CancellationToken,
    io: &dyn MetaIo,
    provider: Option<&Arc<dyn KeyProvider>>,
    fallback_master_key_path: &std::path::Path,
    user_id: &str,
    project_id: &str,
    enabled: bool,
) -> Result<Option<Arc<dyn KeyProvider>>> {
    if !enabled {
        return Ok(None);
    }
    if load_envelope(ctx, io, user_id, project_id).await?.is_some() {
        info!(user_id, project_id, "encryption already enabled");
        return Ok(None);
    }

    let (env, owned_fallback) = match provider {
        Some(p) => {
            let (env, _dek) = envelope::create_envelope(ctx, p.as_ref(), project_id).await?;
            (env, None)
        }
        None => {
            let fallback = Arc::new(FileKeyProvider::open(fallback_master_key_path).await?) as Arc<dyn KeyProvider>;
            let (env, _dek) = envelope::create_envelope_v1(ctx, fallback.as_ref(), project_id).await?;
            (env, Some(fallback))
        }
    };

    save_envelope(ctx, io, user_id, project_id, &env).await?;
    info!(user_id, project_id, wrap_version = env.wrap_version, "encryption enabled");
    Ok(owned_fallback)
}

/// Runs the full dual-wrap rotation protocol against `reencrypt_all`, a
/// caller-supplied closure that walks every file under the project (except
/// `.meta`, never following symlinks) decrypting each under `old_dek` and
/// re-encrypting under `new_dek` via sibling-temp + atomic rename.
pub async fn rotate_project_dek<F, Fut>(
    ctx: &CancellationToken,
    io: &dyn MetaIo,
    provider: &dyn KeyProvider,
    user_id: &str,
    project_id: &str,
    reencrypt_all: F,
) -> Result<()>
where
    F: FnOnce(Dek, Dek) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let env = load_envelope(ctx, io, user_id, project_id)
        .await?
        .ok_or_else(|| Error::Internal("cannot rotate: encryption not enabled".into()))?;

    let (rotating, old_dek, new_dek) = envelope::begin_rotation(ctx, provider, project_id, &env).await?;
    save_envelope(ctx, io, user_id, project_id, &rotating).await?;
    info!(user_id, project_id, "dek rotation: dual-wrapped envelope written");

    reencrypt_all(old_dek, new_dek).await?;

    let finalized = envelope::finalize_rotation(&rotating);
    save_envelope(ctx, io, user_id, project_id, &finalized).await?;
    info!(user_id, project_id, "dek rotation: finalized");
    Ok(())
}
