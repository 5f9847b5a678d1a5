//! Envelope encryption for project files: key providers, DEK wrap/unwrap,
//! the on-disk ciphertext format, and the dual-wrap rotation protocol.

pub mod ciphertext;
pub mod envelope;
pub mod file_provider;
pub mod kms_provider;
pub mod provider;
pub mod transit_provider;

pub use ciphertext::{decrypt, encrypt, generate_dek, is_encrypted, Dek};
pub use envelope::{begin_rotation, create_envelope, create_envelope_v1, finalize_rotation, unwrap_active, unwrap_prev};
pub use file_provider::FileKeyProvider;
pub use kms_provider::KmsKeyProvider;
pub use provider::KeyProvider;
pub use transit_provider::TransitKeyProvider;
