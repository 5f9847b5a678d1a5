//! The shared contract both the filesystem- and object-store-backed
//! implementations satisfy.

use async_trait::async_trait;
use ws_core::cancel::CancellationToken;
use ws_core::model::{FileEntry, Project};
use ws_core::Result;

/// Per-user project CRUD with envelope encryption and DEK rotation.
///
/// Both implementations (`FsProjectsService` over a local WORKDIR,
/// `ObjectStoreProjectsService` over an `ObjectStore`) satisfy this same
/// contract so the workspace manager above can be agnostic to which one is
/// configured. Every operation observes `ctx`; a canceled token surfaces
/// as `Error::Canceled` with no partial metadata update.
#[async_trait]
pub trait ProjectsService: Send + Sync {
    async fn create_project(&self, ctx: &CancellationToken, user_id: &str, name: &str) -> Result<Project>;

    /// Recursively removes all objects/files under the project prefix.
    /// Idempotent — deleting an already-deleted project is not an error.
    async fn delete_project(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<()>;

    /// Projects sorted by `updated_at` desc, then `name` asc.
    async fn list_projects(&self, ctx: &CancellationToken, user_id: &str) -> Result<Vec<Project>>;

    /// Cheap single-project metadata fetch, distinct from `list_projects` —
    /// used by checkout's cache-vs-remote comparison.
    async fn head_project(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<Project>;

    /// Directory-style listing under `path`. `.meta` is hidden at root;
    /// directories sort before files, names ascending.
    async fn list_tree(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<Vec<FileEntry>>;

    /// Rejects `name` containing path separators. Creates intermediate
    /// directories. Bumps `Generation` (and `SkillsGeneration` iff under a
    /// reserved skills prefix).
    async fn upload_file(
        &self,
        ctx: &CancellationToken,
        user_id: &str,
        project_id: &str,
        dir: &str,
        name: &str,
        content: Vec<u8>,
    ) -> Result<()>;

    /// Removes a file or directory subtree. Never follows symlinks.
    /// Idempotent.
    async fn delete_file(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<()>;

    /// `to` must not exist and must not be a descendant of `from`. Symlinks
    /// refused.
    async fn move_path(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, from: &str, to: &str) -> Result<()>;

    /// Creates all intermediate directories. Idempotent.
    async fn create_dir(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<()>;

    /// Returns plaintext, transparently decrypting if the project has
    /// encryption enabled.
    async fn read_file(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Idempotent toggle. Enabling without a `KeyProvider` configured falls
    /// back to the file master key, creating `.keystore/master.key` if
    /// absent.
    async fn enable_encryption(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, enabled: bool) -> Result<()>;

    /// Runs the full dual-wrap rotation protocol.
    async fn rotate_project_dek(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<()>;
}
