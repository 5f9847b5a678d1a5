//! Typed operational configuration. Loaded from TOML by `ws-cli`; every
//! other crate only ever sees this struct, never a raw string map.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceModeConfig {
    #[default]
    Legacy,
    Ephemeral,
    Enterprise,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub mode: WorkspaceModeConfig,
    /// Base directory for ephemeral/enterprise sessions.
    pub root: Option<PathBuf>,
    /// Enterprise-only: per-tenant encrypted cache on persistent disk.
    pub cache_dir: Option<PathBuf>,
    /// Enterprise-only: fast scratch storage the session is materialized onto.
    pub tmpfs_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Filesystem,
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SseMode {
    #[default]
    None,
    Aes256,
    KmsManaged,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct S3Config {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    #[serde(default)]
    pub use_path_style: bool,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default)]
    pub sse: SseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SseConfig {
    #[serde(default)]
    pub mode: SseMode,
    pub kms_key_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyProviderKind {
    #[default]
    File,
    Vault,
    #[serde(rename = "awskms")]
    AwsKms,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub provider: KeyProviderKind,
    pub transit_endpoint: Option<String>,
    pub transit_token: Option<String>,
    pub transit_namespace: Option<String>,
    pub kms_key_id: Option<String>,
    pub kms_region: Option<String>,
    pub kms_endpoint: Option<String>,
    pub kms_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RedisConfig {
    #[serde(default)]
    pub enabled: bool,
    pub addr: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub tls_insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub brokers: Option<String>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub events: EventsConfig,
    /// Path prefixes whose writes bump `skills_generation` in addition to
    /// `generation`.
    #[serde(default = "default_skills_prefixes")]
    pub reserved_skills_prefixes: Vec<String>,
}

// Hand-written so a missing config file and an empty config file yield the
// same settings (the derive would leave `reserved_skills_prefixes` empty).
impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig::default(),
            backend: Backend::default(),
            s3: S3Config::default(),
            encrypt: false,
            encryption: EncryptionConfig::default(),
            redis: RedisConfig::default(),
            events: EventsConfig::default(),
            reserved_skills_prefixes: default_skills_prefixes(),
        }
    }
}

fn default_skills_prefixes() -> Vec<String> {
    vec!["skills/".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_legacy_filesystem_unencrypted() {
        let cfg = Config::default();
        assert_eq!(cfg.workspace.mode, WorkspaceModeConfig::Legacy);
        assert_eq!(cfg.backend, Backend::Filesystem);
        assert!(!cfg.encrypt);
        assert_eq!(cfg.reserved_skills_prefixes, vec!["skills/".to_string()]);
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg: Config = toml::from_str(
            r#"
            encrypt = true
            backend = "s3"

            [workspace]
            mode = "ephemeral"
            root = "/var/lib/ws"

            [s3]
            bucket = "my-bucket"
        "#,
        )
        .unwrap();
        assert!(cfg.encrypt);
        assert_eq!(cfg.backend, Backend::S3);
        assert_eq!(cfg.workspace.mode, WorkspaceModeConfig::Ephemeral);
        assert_eq!(cfg.s3.bucket.as_deref(), Some("my-bucket"));
    }
}
