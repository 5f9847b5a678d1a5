//! The checkout/commit/cleanup contract both manager variants satisfy.

use async_trait::async_trait;
use std::path::PathBuf;
use ws_core::cancel::CancellationToken;
use ws_core::model::WorkspaceMode;
use ws_core::Result;

/// A materialized session working copy.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub user_id: String,
    pub project_id: String,
    pub session_id: String,
    pub base_dir: PathBuf,
    pub mode: WorkspaceMode,
}

/// Every operation observes `ctx`. A canceled checkout removes its
/// partially created session directory; a canceled commit leaves the
/// manifest unchanged (stray uploads self-heal on the next commit).
#[async_trait]
pub trait WorkspaceManager: Send + Sync {
    /// Resolve or create the working directory for `(user, project,
    /// session)`. `session` may be empty, in which case a session ID is
    /// synthesized.
    async fn checkout(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, session_id: Option<&str>) -> Result<Workspace>;

    /// Reconcile the working directory's current state back to durable
    /// storage. A no-op for the legacy manager.
    async fn commit(&self, ctx: &CancellationToken, ws: &Workspace) -> Result<()>;

    /// Discard the working directory. A no-op for the legacy manager.
    async fn cleanup(&self, ctx: &CancellationToken, ws: &Workspace) -> Result<()>;
}
