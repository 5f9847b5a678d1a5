//! Data model shared by the storage, manager, and enterprise layers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A user-scoped project. `id` is a single path segment (validated via
/// [`crate::validate::validate_id`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub user_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub generation: u64,
    pub skills_generation: u64,
    /// Derived on list/stat; not persisted in `project.json`.
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub file_count: u64,
}

impl Project {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            generation: 0,
            skills_generation: 0,
            bytes: 0,
            file_count: 0,
        }
    }

    /// Bump `generation` (always) and `skills_generation` (iff any of the
    /// touched paths lies under a reserved skills prefix).
    pub fn bump(&mut self, touched_paths: &[String], skills_prefixes: &[String]) {
        self.generation += 1;
        if touched_paths
            .iter()
            .any(|p| skills_prefixes.iter().any(|pfx| p.starts_with(pfx.as_str())))
        {
            self.skills_generation = self.generation;
        }
        self.updated_at = Utc::now();
        debug_assert!(self.skills_generation <= self.generation);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

/// A leaf (or pseudo-directory) in a project tree listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// `wrap_version` distinguishes the v1 nonce-in-envelope shape from the v2
/// opaque-wrapped shape written when a `KeyProvider` is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeAlg {
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    Envelope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveDek {
    New,
    Prev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    File,
    Vault,
    #[serde(rename = "awskms")]
    AwsKms,
}

/// Stored at `<project>/.meta/enc.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionEnvelope {
    pub alg: EnvelopeAlg,
    pub wrap_version: u8,
    pub wrapped_dek: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_wrapped_dek: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<ActiveDek>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_type: Option<ProviderType>,
}

impl EncryptionEnvelope {
    /// True while a rotation is mid-flight (both keys wrapped).
    pub fn is_rotating(&self) -> bool {
        self.prev_wrapped_dek.is_some()
    }

    /// Which wrapped DEK string a reader should unwrap right now.
    pub fn active_wrapped(&self) -> &str {
        match self.active {
            Some(ActiveDek::Prev) => self
                .prev_wrapped_dek
                .as_deref()
                .unwrap_or(&self.wrapped_dek),
            _ => &self.wrapped_dek,
        }
    }
}

/// Magic prefix identifying an encrypted file body: `"MGCM"` + version `1`.
pub const CIPHERTEXT_MAGIC: [u8; 5] = [0x4D, 0x47, 0x43, 0x4D, 0x01];
pub const NONCE_LEN: usize = 12;

/// A single entry in a workspace [`SyncManifest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub size: u64,
    pub sha256: String,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Stored at `<workspace>/.meta/sync-manifest.json`. Describes the
/// *expected* object-store state as of the last hydrate/commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncManifest {
    pub version: u32,
    pub checkout_time: DateTime<Utc>,
    pub generation: u64,
    pub skills_generation: u64,
    pub files: BTreeMap<String, ManifestEntry>,
}

impl SyncManifest {
    pub fn empty(generation: u64, skills_generation: u64) -> Self {
        Self {
            version: 1,
            checkout_time: Utc::now(),
            generation,
            skills_generation,
            files: BTreeMap::new(),
        }
    }
}

/// Lifetime semantics of a checked-out workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    Legacy,
    Ephemeral,
    Enterprise,
}

/// `{generation, skillsGeneration, changedPaths}` published per project on
/// commit, for cross-node cache coherency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub project_id: Uuid,
    pub generation: u64,
    pub skills_generation: u64,
    pub changed_paths: Vec<String>,
}

/// Published to a durable log after a successful commit. Consumers must
/// dedupe on `commit_id` (at-least-once delivery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitEvent {
    pub commit_id: Uuid,
    pub tenant_id: String,
    pub project_id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub generation: u64,
    pub skills_generation: u64,
    pub changed_paths: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_increments_generation_and_skills_conditionally() {
        let mut p = Project::new("u1", "demo");
        p.bump(&["src/main.rs".into()], &["skills/".into()]);
        assert_eq!(p.generation, 1);
        assert_eq!(p.skills_generation, 0);

        p.bump(&["skills/a.md".into()], &["skills/".into()]);
        assert_eq!(p.generation, 2);
        assert_eq!(p.skills_generation, 2);
        assert!(p.skills_generation <= p.generation);
    }

    #[test]
    fn envelope_active_wrapped_defaults_to_new() {
        let env = EncryptionEnvelope {
            alg: EnvelopeAlg::Envelope,
            wrap_version: 2,
            wrapped_dek: "new-wrapped".into(),
            prev_wrapped_dek: Some("old-wrapped".into()),
            active: None,
            nonce: None,
            provider_type: Some(ProviderType::File),
        };
        assert_eq!(env.active_wrapped(), "new-wrapped");
        assert!(env.is_rotating());

        let env_prev = EncryptionEnvelope {
            active: Some(ActiveDek::Prev),
            ..env
        };
        assert_eq!(env_prev.active_wrapped(), "old-wrapped");
    }
}
