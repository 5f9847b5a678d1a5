//! The legacy manager: the project directory under `<root>/users/<uid>/
//! projects/<pid>` IS the source of truth, so checkout just has to confirm
//! it exists. `commit`/`cleanup` are no-ops.

use crate::contract::{Workspace, WorkspaceManager};
use async_trait::async_trait;
use std::path::PathBuf;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::model::WorkspaceMode;
use ws_core::validate::validate_id;
use ws_core::{Error, Result};

pub struct LegacyWorkspaceManager {
    root: PathBuf,
}

impl LegacyWorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl WorkspaceManager for LegacyWorkspaceManager {
    async fn checkout(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, _session_id: Option<&str>) -> Result<Workspace> {
        bail_if_canceled(ctx, "checkout")?;
        validate_id(user_id)?;
        validate_id(project_id)?;
        let base_dir = self
            .root
            .join("users")
            .join(user_id)
            .join("projects")
            .join(project_id);

        if !tokio::fs::try_exists(&base_dir).await? {
            return Err(Error::ProjectNotFound(project_id.to_string()));
        }

        Ok(Workspace {
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            session_id: String::new(),
            base_dir,
            mode: WorkspaceMode::Legacy,
        })
    }

    async fn commit(&self, _ctx: &CancellationToken, _ws: &Workspace) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _ctx: &CancellationToken, _ws: &Workspace) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkout_requires_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LegacyWorkspaceManager::new(dir.path());
        let ctx = CancellationToken::new();
        assert!(mgr.checkout(&ctx, "u1", "p1", None).await.is_err());

        let project_dir = dir.path().join("users/u1/projects/p1");
        tokio::fs::create_dir_all(&project_dir).await.unwrap();
        let ws = mgr.checkout(&ctx, "u1", "p1", None).await.unwrap();
        assert_eq!(ws.base_dir, project_dir);
    }

    #[tokio::test]
    async fn commit_and_cleanup_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("users/u1/projects/p1");
        tokio::fs::create_dir_all(&project_dir).await.unwrap();
        let mgr = LegacyWorkspaceManager::new(dir.path());
        let ctx = CancellationToken::new();
        let ws = mgr.checkout(&ctx, "u1", "p1", None).await.unwrap();
        mgr.commit(&ctx, &ws).await.unwrap();
        mgr.cleanup(&ctx, &ws).await.unwrap();
        assert!(project_dir.exists());
    }
}
