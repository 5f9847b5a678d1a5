//! File ciphertext format: `"MGCM" ‖ version=1 ‖ nonce(12B) ‖ AES-GCM(plaintext)`.
//!
//! A file is "encrypted" iff its first five bytes equal [`MAGIC`]; anything
//! else is treated as plaintext, which is what makes migrating an
//! unencrypted project to an encrypted one safe to do incrementally.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use ws_core::model::{CIPHERTEXT_MAGIC, NONCE_LEN};
use ws_core::{Error, Result};

pub type Dek = [u8; 32];

/// Generate a fresh 32-byte data encryption key.
pub fn generate_dek() -> Dek {
    let mut dek = [0u8; 32];
    OsRng.fill_bytes(&mut dek);
    dek
}

/// True iff `data` begins with the ciphertext magic header.
pub fn is_encrypted(data: &[u8]) -> bool {
    data.len() >= CIPHERTEXT_MAGIC.len() && data[..CIPHERTEXT_MAGIC.len()] == CIPHERTEXT_MAGIC
}

/// Encrypt `plaintext` under `dek`, producing the on-disk/on-object wire
/// format: magic, a fresh random nonce, then the AES-GCM ciphertext
/// (which already carries its 16-byte authentication tag).
pub fn encrypt(dek: &Dek, plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = Key::<Aes256Gcm>::from_slice(dek);
    let cipher = Aes256Gcm::new(key);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::Internal(format!("encrypt failed: {e}")))?;

    let mut out = Vec::with_capacity(CIPHERTEXT_MAGIC.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&CIPHERTEXT_MAGIC);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a ciphertext body produced by [`encrypt`]. Returns
/// `Error::DecryptFailed` on a bad magic header, malformed framing, or an
/// authentication failure — never falls back to returning the raw bytes.
pub fn decrypt(dek: &Dek, data: &[u8]) -> Result<Vec<u8>> {
    if !is_encrypted(data) {
        return Err(Error::DecryptFailed("missing ciphertext magic".into()));
    }
    let rest = &data[CIPHERTEXT_MAGIC.len()..];
    if rest.len() < NONCE_LEN {
        return Err(Error::DecryptFailed("truncated ciphertext".into()));
    }
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key = Key::<Aes256Gcm>::from_slice(dek);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::DecryptFailed("authentication failed".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plaintext() {
        let dek = generate_dek();
        let plaintext = b"top secret";
        let ct = encrypt(&dek, plaintext).unwrap();

        assert!(is_encrypted(&ct));
        assert_eq!(&ct[..5], &CIPHERTEXT_MAGIC);
        assert!(!ct.windows(plaintext.len()).any(|w| w == plaintext));

        let pt = decrypt(&dek, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn plaintext_without_magic_is_not_encrypted() {
        assert!(!is_encrypted(b"hello world"));
        assert!(!is_encrypted(b""));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let dek = generate_dek();
        let other = generate_dek();
        let ct = encrypt(&dek, b"data").unwrap();
        assert!(decrypt(&other, &ct).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let dek = generate_dek();
        let mut ct = encrypt(&dek, b"data").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(decrypt(&dek, &ct).is_err());
    }
}
