//! Envelope lifecycle: creating a project's first DEK, unwrapping the
//! active one, and driving the dual-wrap rotation protocol.
//!
//! Two envelope shapes exist on disk. v2 carries an opaque provider-wrapped
//! DEK; v1 is the legacy file-master-key shape whose AES-GCM nonce lives in
//! the envelope itself rather than inside the wrapped blob. Both are read
//! transparently; v1 is only ever written by the no-provider fallback path.
//!
//! The envelope is agnostic to *where* it's persisted — callers in
//! `ws-projects` read/write `<project>/.meta/enc.json` themselves and pass
//! the deserialized [`EncryptionEnvelope`] in and out of these functions.

use crate::ciphertext::{generate_dek, Dek};
use crate::provider::KeyProvider;
use ws_core::cancel::CancellationToken;
use ws_core::model::{ActiveDek, EncryptionEnvelope, EnvelopeAlg};
use ws_core::{Error, Result};

/// Generate a fresh DEK and wrap it opaquely, producing the v2 envelope
/// written whenever a configured `KeyProvider` is available.
pub async fn create_envelope(ctx: &CancellationToken, provider: &dyn KeyProvider, project_id: &str) -> Result<(EncryptionEnvelope, Dek)> {
    let dek = generate_dek();
    let wrapped = provider.wrap(ctx, project_id, &dek).await?;
    let envelope = EncryptionEnvelope {
        alg: EnvelopeAlg::Envelope,
        wrap_version: 2,
        wrapped_dek: wrapped,
        prev_wrapped_dek: None,
        active: None,
        nonce: None,
        provider_type: Some(provider.provider_type()),
    };
    Ok((envelope, dek))
}

/// Generate a fresh DEK and wrap it in the legacy v1 shape, with the wrap
/// nonce carried in the envelope. Written only when encryption is enabled
/// with no provider configured and the file master key is the fallback.
pub async fn create_envelope_v1(ctx: &CancellationToken, provider: &dyn KeyProvider, _project_id: &str) -> Result<(EncryptionEnvelope, Dek)> {
    let dek = generate_dek();
    let (nonce, wrapped) = provider.wrap_v1(ctx, &dek).await?;
    let envelope = EncryptionEnvelope {
        alg: EnvelopeAlg::Aes256Gcm,
        wrap_version: 1,
        wrapped_dek: wrapped,
        prev_wrapped_dek: None,
        active: None,
        nonce: Some(nonce),
        provider_type: None,
    };
    Ok((envelope, dek))
}

/// Unwrap whichever DEK is currently active per the envelope's `active`
/// flag — this is what every file read/write goes through, including
/// mid-rotation when readers must still be able to decrypt files nobody has
/// re-encrypted yet.
///
/// Version dispatch: a v1 envelope (or the still-v1 `prev` key inside an
/// upgrade-in-flight v2 envelope) is decrypted from `nonce` + `wrapped_dek`
/// directly; everything else goes through the provider's opaque unwrap.
pub async fn unwrap_active(ctx: &CancellationToken, provider: &dyn KeyProvider, project_id: &str, envelope: &EncryptionEnvelope) -> Result<Dek> {
    let selecting_prev = matches!(envelope.active, Some(ActiveDek::Prev));
    if envelope.wrap_version < 2 || (selecting_prev && envelope.nonce.is_some()) {
        let nonce = envelope
            .nonce
            .as_deref()
            .ok_or_else(|| Error::UnwrapFailed("v1 envelope missing nonce".into()))?;
        return provider.unwrap_v1(ctx, nonce, envelope.active_wrapped()).await;
    }
    provider.unwrap(ctx, project_id, envelope.active_wrapped()).await
}

/// Unwrap the *previous* DEK of a rotation-in-flight envelope, for readers
/// hitting a file nobody has re-encrypted yet.
pub async fn unwrap_prev(ctx: &CancellationToken, provider: &dyn KeyProvider, project_id: &str, envelope: &EncryptionEnvelope) -> Result<Dek> {
    let wrapped = envelope
        .prev_wrapped_dek
        .as_deref()
        .ok_or_else(|| Error::UnwrapFailed("no previous wrapped key in envelope".into()))?;
    if let Some(nonce) = envelope.nonce.as_deref() {
        return provider.unwrap_v1(ctx, nonce, wrapped).await;
    }
    provider.unwrap(ctx, project_id, wrapped).await
}

/// Step 1 of rotation: generate a new DEK, wrap both it and the still-active
/// old one, and mark the new one active. Existing files remain decryptable
/// under the old (now `prev`) key until each is walked and re-encrypted.
///
/// Rotating a legacy v1 envelope upgrades it to v2: the new key is always
/// provider-wrapped, while the old v1 nonce rides along so the `prev` key
/// stays decryptable through the dual-wrapped window.
pub async fn begin_rotation(
    ctx: &CancellationToken,
    provider: &dyn KeyProvider,
    project_id: &str,
    envelope: &EncryptionEnvelope,
) -> Result<(EncryptionEnvelope, Dek, Dek)> {
    if envelope.is_rotating() {
        return Err(Error::Conflict("rotation already in progress".into()));
    }
    let old_dek = unwrap_active(ctx, provider, project_id, envelope).await?;
    let new_dek = generate_dek();
    let new_wrapped = provider.wrap(ctx, project_id, &new_dek).await?;

    let rotated = EncryptionEnvelope {
        alg: EnvelopeAlg::Envelope,
        wrap_version: 2,
        wrapped_dek: new_wrapped,
        prev_wrapped_dek: Some(envelope.wrapped_dek.clone()),
        active: Some(ActiveDek::New),
        nonce: envelope.nonce.clone(),
        provider_type: Some(provider.provider_type()),
    };
    Ok((rotated, old_dek, new_dek))
}

/// Step 2 of rotation: once every file has been re-encrypted under the new
/// DEK, drop the previous wrapped key and clear the rotation markers.
pub fn finalize_rotation(envelope: &EncryptionEnvelope) -> EncryptionEnvelope {
    EncryptionEnvelope {
        alg: envelope.alg,
        wrap_version: envelope.wrap_version,
        wrapped_dek: envelope.wrapped_dek.clone(),
        prev_wrapped_dek: None,
        active: None,
        nonce: None,
        provider_type: envelope.provider_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_provider::FileKeyProvider;

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    async fn provider() -> FileKeyProvider {
        let dir = tempfile::tempdir().unwrap();
        FileKeyProvider::open(dir.path().join("master.key")).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_unwrap_roundtrips() {
        let p = provider().await;
        let ctx = ctx();
        let (envelope, dek) = create_envelope(&ctx, &p, "proj-1").await.unwrap();
        assert_eq!(envelope.wrap_version, 2);
        assert!(envelope.nonce.is_none());
        let unwrapped = unwrap_active(&ctx, &p, "proj-1", &envelope).await.unwrap();
        assert_eq!(dek, unwrapped);
    }

    #[tokio::test]
    async fn v1_envelope_roundtrips_through_its_inline_nonce() {
        let p = provider().await;
        let ctx = ctx();
        let (envelope, dek) = create_envelope_v1(&ctx, &p, "proj-1").await.unwrap();
        assert_eq!(envelope.wrap_version, 1);
        assert!(envelope.nonce.is_some());
        assert!(envelope.provider_type.is_none());

        let unwrapped = unwrap_active(&ctx, &p, "proj-1", &envelope).await.unwrap();
        assert_eq!(dek, unwrapped);
    }

    #[tokio::test]
    async fn rotation_keeps_old_key_readable_until_finalized() {
        let p = provider().await;
        let ctx = ctx();
        let (envelope, old_created) = create_envelope(&ctx, &p, "proj-1").await.unwrap();

        let (rotated, old_dek, new_dek) = begin_rotation(&ctx, &p, "proj-1", &envelope).await.unwrap();
        assert!(rotated.is_rotating());
        assert_eq!(old_dek, old_created);
        assert_ne!(old_dek, new_dek);

        let active = unwrap_active(&ctx, &p, "proj-1", &rotated).await.unwrap();
        assert_eq!(active, new_dek);
        let prev = unwrap_prev(&ctx, &p, "proj-1", &rotated).await.unwrap();
        assert_eq!(prev, old_dek);

        let finalized = finalize_rotation(&rotated);
        assert!(!finalized.is_rotating());
        let active_after = unwrap_active(&ctx, &p, "proj-1", &finalized).await.unwrap();
        assert_eq!(active_after, new_dek);
    }

    #[tokio::test]
    async fn rotating_a_v1_envelope_upgrades_it_to_v2() {
        let p = provider().await;
        let ctx = ctx();
        let (envelope, old_dek) = create_envelope_v1(&ctx, &p, "proj-1").await.unwrap();

        let (rotated, unwrapped_old, new_dek) = begin_rotation(&ctx, &p, "proj-1", &envelope).await.unwrap();
        assert_eq!(rotated.wrap_version, 2);
        assert_eq!(unwrapped_old, old_dek);

        // The old v1 key stays reachable through the carried nonce until
        // the walk finishes.
        let prev = unwrap_prev(&ctx, &p, "proj-1", &rotated).await.unwrap();
        assert_eq!(prev, old_dek);

        let finalized = finalize_rotation(&rotated);
        assert!(finalized.nonce.is_none());
        let active = unwrap_active(&ctx, &p, "proj-1", &finalized).await.unwrap();
        assert_eq!(active, new_dek);
    }

    #[tokio::test]
    async fn begin_rotation_rejects_already_rotating_envelope() {
        let p = provider().await;
        let ctx = ctx();
        let (envelope, _) = create_envelope(&ctx, &p, "proj-1").await.unwrap();
        let (rotated, _, _) = begin_rotation(&ctx, &p, "proj-1", &envelope).await.unwrap();
        assert!(begin_rotation(&ctx, &p, "proj-1", &rotated).await.is_err());
    }
}
