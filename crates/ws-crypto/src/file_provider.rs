//! `FileKeyProvider`: a local master key held in a single file, used for
//! single-node and development deployments where no external KMS is
//! available. The master key never leaves the process.

use crate::provider::KeyProvider;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::model::ProviderType;
use ws_core::{Error, Result};

const NONCE_LEN: usize = 12;

pub struct FileKeyProvider {
    path: PathBuf,
    master_key: RwLock<[u8; 32]>,
}

impl FileKeyProvider {
    /// Load the master key from `path`, generating and persisting a fresh
    /// one (with owner-only permissions) if the file doesn't exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let master_key = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                key
            }
            Ok(_) => return Err(Error::Internal(format!("{}: corrupt master key", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = generate_master_key();
                write_master_key(&path, &key).await?;
                key
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            master_key: RwLock::new(master_key),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn seal(&self, dek: &[u8; 32]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
        let master = self.master_key.read().await;
        let key = Key::<Aes256Gcm>::from_slice(&*master);
        let cipher = Aes256Gcm::new(key);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, dek.as_slice())
            .map_err(|e| Error::Internal(format!("wrap failed: {e}")))?;
        Ok((nonce_bytes, ciphertext))
    }

    async fn unseal(&self, nonce_bytes: &[u8], ciphertext: &[u8]) -> Result<[u8; 32]> {
        let master = self.master_key.read().await;
        let key = Key::<Aes256Gcm>::from_slice(&*master);
        let cipher = Aes256Gcm::new(key);
        let nonce = Nonce::from_slice(nonce_bytes);

        let dek_bytes = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::UnwrapFailed("authentication failed".into()))?;
        if dek_bytes.len() != 32 {
            return Err(Error::UnwrapFailed("unexpected dek length".into()));
        }
        let mut dek = [0u8; 32];
        dek.copy_from_slice(&dek_bytes);
        Ok(dek)
    }
}

fn generate_master_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    key
}

async fn write_master_key(path: &Path, key: &[u8; 32]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, key).await?;
    set_owner_only_perms(path).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_owner_only_perms(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_owner_only_perms(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl KeyProvider for FileKeyProvider {
    async fn wrap(&self, ctx: &CancellationToken, _project_id: &str, dek: &[u8; 32]) -> Result<String> {
        bail_if_canceled(ctx, "wrap")?;
        let (nonce_bytes, ciphertext) = self.seal(dek).await?;
        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce_bytes);
        wire.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(wire))
    }

    async fn unwrap(&self, ctx: &CancellationToken, _project_id: &str, wrapped: &str) -> Result<[u8; 32]> {
        bail_if_canceled(ctx, "unwrap")?;
        let wire = BASE64
            .decode(wrapped)
            .map_err(|_| Error::UnwrapFailed("invalid base64".into()))?;
        if wire.len() < NONCE_LEN {
            return Err(Error::UnwrapFailed("truncated wrapped key".into()));
        }
        let (nonce_bytes, ciphertext) = wire.split_at(NONCE_LEN);
        self.unseal(nonce_bytes, ciphertext).await
    }

    async fn wrap_v1(&self, ctx: &CancellationToken, dek: &[u8; 32]) -> Result<(String, String)> {
        bail_if_canceled(ctx, "wrap_v1")?;
        let (nonce_bytes, ciphertext) = self.seal(dek).await?;
        Ok((BASE64.encode(nonce_bytes), BASE64.encode(ciphertext)))
    }

    async fn unwrap_v1(&self, ctx: &CancellationToken, nonce: &str, wrapped: &str) -> Result<[u8; 32]> {
        bail_if_canceled(ctx, "unwrap_v1")?;
        let nonce_bytes = BASE64
            .decode(nonce)
            .map_err(|_| Error::UnwrapFailed("invalid base64 nonce".into()))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(Error::UnwrapFailed("unexpected nonce length".into()));
        }
        let ciphertext = BASE64
            .decode(wrapped)
            .map_err(|_| Error::UnwrapFailed("invalid base64".into()))?;
        self.unseal(&nonce_bytes, &ciphertext).await
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::File
    }

    async fn health_check(&self, ctx: &CancellationToken) -> Result<()> {
        bail_if_canceled(ctx, "health_check")?;
        tokio::fs::metadata(&self.path).await?;
        Ok(())
    }
}
