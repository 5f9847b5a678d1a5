//! `FsProjectsService`: the Projects Service contract implemented directly
//! over local paths under a WORKDIR, without going through the
//! `ObjectStore` abstraction at all.

use crate::contract::ProjectsService;
use crate::crypto_support;
use crate::meta_io::MetaIo;
use crate::paths;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;
use ws_core::cancel::{bail_if_canceled, CancellationToken};
use ws_core::model::{FileEntry, FileKind, Project};
use ws_core::validate::{join_contained, validate_id};
use ws_core::{Error, Result};
use ws_crypto::KeyProvider;

pub struct FsProjectsService {
    root: PathBuf,
    skills_prefixes: Vec<String>,
    key_provider: RwLock<Option<Arc<dyn KeyProvider>>>,
    meta_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FsProjectsService {
    pub fn new(root: impl Into<PathBuf>, skills_prefixes: Vec<String>, key_provider: Option<Arc<dyn KeyProvider>>) -> Self {
        Self {
            root: root.into(),
            skills_prefixes,
            key_provider: RwLock::new(key_provider),
            meta_locks: Mutex::new(HashMap::new()),
        }
    }

    fn project_dir(&self, user_id: &str, project_id: &str) -> PathBuf {
        self.root
            .join("users")
            .join(user_id)
            .join("projects")
            .join(project_id)
    }

    fn files_dir(&self, user_id: &str, project_id: &str) -> PathBuf {
        self.project_dir(user_id, project_id).join(paths::FILES_DIR)
    }

    fn master_key_path(&self) -> PathBuf {
        self.root.join(".keystore").join("master.key")
    }

    async fn load_project(&self, user_id: &str, project_id: &str) -> Result<Project> {
        let meta_path = self.project_dir(user_id, project_id).join(paths::PROJECT_META_FILE);
        let bytes = tokio::fs::read(&meta_path)
            .await
            .map_err(|e| if e.kind() == std::io::ErrorKind::NotFound {
                Error::ProjectNotFound(project_id.to_string())
            } else {
                e.into()
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save_project(&self, user_id: &str, project: &Project) -> Result<()> {
        let meta_path = self
            .project_dir(user_id, &project.id.to_string())
            .join(paths::PROJECT_META_FILE);
        if let Some(parent) = meta_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&meta_path, serde_json::to_vec_pretty(project)?).await
    }

    async fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.meta_locks.lock().await;
        locks.entry(project_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Read-modify-write of `project.json` under the per-project lock so
    /// the monotonic generation counters never regress under concurrent
    /// mutations.
    async fn bump_and_save(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, touched: &[String]) -> Result<()> {
        bail_if_canceled(ctx, "bump")?;
        let lock = self.project_lock(project_id).await;
        let _guard = lock.lock().await;
        let mut project = self.load_project(user_id, project_id).await?;
        project.bump(touched, &self.skills_prefixes);
        self.save_project(user_id, &project).await
    }

    async fn resolve(&self, user_id: &str, project_id: &str, rel_path: &str) -> Result<PathBuf> {
        if rel_path.is_empty() {
            return Ok(self.files_dir(user_id, project_id));
        }
        join_contained(&self.files_dir(user_id, project_id), rel_path)
    }

    async fn provider(&self) -> Option<Arc<dyn KeyProvider>> {
        self.key_provider.read().await.clone()
    }
}

#[async_trait]
impl MetaIo for FsProjectsService {
    async fn read_meta(&self, ctx: &CancellationToken, key: &str) -> Result<Option<Vec<u8>>> {
        bail_if_canceled(ctx, "read_meta")?;
        // `key` is `users/<uid>/projects/<pid>/.meta/...`; caller already
        // scoped it, so just join onto root.
        let path = self.root.join(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(&self, ctx: &CancellationToken, key: &str, data: Vec<u8>) -> Result<()> {
        bail_if_canceled(ctx, "write_meta")?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, data).await
    }
}

async fn write_atomic(path: &Path, data: Vec<u8>) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

fn sanitize_name(name: &str) -> Result<()> {
    if name.contains('/') || name.contains('\\') || name.is_empty() {
        return Err(Error::InvalidPath {
            path: name.to_string(),
            reason: "name must not contain path separators".into(),
        });
    }
    Ok(())
}

#[async_trait]
impl ProjectsService for FsProjectsService {
    async fn create_project(&self, ctx: &CancellationToken, user_id: &str, name: &str) -> Result<Project> {
        bail_if_canceled(ctx, "create_project")?;
        validate_id(user_id)?;
        let project = Project::new(user_id, name);
        let pid = project.id.to_string();
        let files_dir = self.files_dir(user_id, &pid);
        tokio::fs::create_dir_all(&files_dir).await?;

        let readme_path = files_dir.join("README.md");
        write_atomic(&readme_path, paths::seed_readme(name).into_bytes()).await?;

        let mut project = project;
        project.bump(&["README.md".to_string()], &self.skills_prefixes);
        self.save_project(user_id, &project).await?;
        info!(user_id, project_id = %pid, "project created");
        Ok(project)
    }

    async fn delete_project(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<()> {
        bail_if_canceled(ctx, "delete_project")?;
        validate_id(project_id)?;
        let dir = self.project_dir(user_id, project_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_projects(&self, ctx: &CancellationToken, user_id: &str) -> Result<Vec<Project>> {
        bail_if_canceled(ctx, "list_projects")?;
        let users_dir = self.root.join("users").join(user_id).join("projects");
        let mut projects = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&users_dir).await else {
            return Ok(projects);
        };
        while let Some(entry) = entries.next_entry().await? {
            bail_if_canceled(ctx, "list_projects")?;
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let pid = entry.file_name().to_string_lossy().to_string();
            if let Ok(mut project) = self.load_project(user_id, &pid).await {
                let (bytes, file_count) = tree_stats(&self.files_dir(user_id, &pid)).await;
                project.bytes = bytes;
                project.file_count = file_count;
                projects.push(project);
            }
        }
        projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.name.cmp(&b.name)));
        Ok(projects)
    }

    async fn head_project(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<Project> {
        bail_if_canceled(ctx, "head_project")?;
        self.load_project(user_id, project_id).await
    }

    async fn list_tree(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<Vec<FileEntry>> {
        bail_if_canceled(ctx, "list_tree")?;
        let dir = self.resolve(user_id, project_id, path).await?;
        let mut entries = Vec::new();
        let Ok(mut read_dir) = tokio::fs::read_dir(&dir).await else {
            return Ok(entries);
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if path.is_empty() && name == paths::META_DIR {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            let meta = entry.metadata().await?;
            let rel_path = if path.is_empty() { name.clone() } else { format!("{path}/{name}") };
            entries.push(FileEntry {
                path: rel_path,
                name,
                kind: if file_type.is_dir() { FileKind::Dir } else { FileKind::File },
                size: meta.len(),
                modified: meta.modified().map(chrono::DateTime::from).unwrap_or_else(|_| chrono::Utc::now()),
            });
        }
        entries.sort_by(|a, b| match (a.kind, b.kind) {
            (FileKind::Dir, FileKind::File) => std::cmp::Ordering::Less,
            (FileKind::File, FileKind::Dir) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });
        Ok(entries)
    }

    async fn upload_file(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, dir: &str, name: &str, content: Vec<u8>) -> Result<()> {
        bail_if_canceled(ctx, "upload_file")?;
        sanitize_name(name)?;
        let rel_path = if dir.is_empty() { name.to_string() } else { format!("{dir}/{name}") };
        let target = self.resolve(user_id, project_id, &rel_path).await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let provider = self.provider().await;
        let data = crypto_support::encrypt_if_enabled(ctx, self, provider.as_ref(), user_id, project_id, content).await?;
        write_atomic(&target, data).await?;

        self.bump_and_save(ctx, user_id, project_id, &[rel_path]).await?;
        Ok(())
    }

    async fn delete_file(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<()> {
        bail_if_canceled(ctx, "delete_file")?;
        let target = self.resolve(user_id, project_id, path).await?;
        let meta = tokio::fs::symlink_metadata(&target).await;
        match meta {
            Ok(m) if m.is_dir() => {
                tokio::fs::remove_dir_all(&target).await.or_else(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
                })?;
            }
            Ok(_) => {
                tokio::fs::remove_file(&target).await.or_else(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound { Ok(()) } else { Err(e) }
                })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.bump_and_save(ctx, user_id, project_id, &[path.to_string()]).await?;
        Ok(())
    }

    async fn move_path(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, from: &str, to: &str) -> Result<()> {
        bail_if_canceled(ctx, "move_path")?;
        let src = self.resolve(user_id, project_id, from).await?;
        let dst = self.resolve(user_id, project_id, to).await?;

        if tokio::fs::symlink_metadata(&src).await?.file_type().is_symlink() {
            return Err(Error::InvalidPath { path: from.to_string(), reason: "symlinks refused".into() });
        }
        if tokio::fs::try_exists(&dst).await? {
            return Err(Error::Conflict(format!("destination {to} already exists")));
        }
        if dst.starts_with(&src) {
            return Err(Error::InvalidPath { path: to.to_string(), reason: "destination is a descendant of source".into() });
        }
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&src, &dst).await?;
        self.bump_and_save(ctx, user_id, project_id, &[from.to_string(), to.to_string()]).await?;
        Ok(())
    }

    async fn create_dir(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<()> {
        bail_if_canceled(ctx, "create_dir")?;
        let target = self.resolve(user_id, project_id, path).await?;
        tokio::fs::create_dir_all(&target).await?;
        self.bump_and_save(ctx, user_id, project_id, &[path.to_string()]).await?;
        Ok(())
    }

    async fn read_file(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, path: &str) -> Result<Vec<u8>> {
        bail_if_canceled(ctx, "read_file")?;
        let target = self.resolve(user_id, project_id, path).await?;
        let data = tokio::fs::read(&target)
            .await
            .map_err(|e| if e.kind() == std::io::ErrorKind::NotFound { Error::FileNotFound(path.to_string()) } else { e.into() })?;
        let provider = self.provider().await;
        crypto_support::decrypt_if_needed(ctx, self, provider.as_ref(), user_id, project_id, data).await
    }

    async fn enable_encryption(&self, ctx: &CancellationToken, user_id: &str, project_id: &str, enabled: bool) -> Result<()> {
        let provider = self.provider().await;
        let fallback = crypto_support::enable_encryption(
            ctx,
            self,
            provider.as_ref(),
            &self.master_key_path(),
            user_id,
            project_id,
            enabled,
        )
        .await?;
        if let Some(fallback) = fallback {
            *self.key_provider.write().await = Some(fallback);
        }
        Ok(())
    }

    async fn rotate_project_dek(&self, ctx: &CancellationToken, user_id: &str, project_id: &str) -> Result<()> {
        let provider = self.provider().await.ok_or_else(|| Error::Internal("no key provider configured".into()))?;
        let files_dir = self.files_dir(user_id, project_id);
        let walk_ctx = ctx.clone();

        crypto_support::rotate_project_dek(ctx, self, provider.as_ref(), user_id, project_id, |old_dek, new_dek| async move {
            reencrypt_tree(&walk_ctx, &files_dir, &old_dek, &new_dek).await
        })
        .await
    }
}

async fn tree_stats(dir: &Path) -> (u64, u64) {
    let mut bytes = 0u64;
    let mut count = 0u64;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&d).await else { continue };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(file_type) = entry.file_type().await else { continue };
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if let Ok(meta) = entry.metadata().await {
                bytes += meta.len();
                count += 1;
            }
        }
    }
    (bytes, count)
}

async fn reencrypt_tree(ctx: &CancellationToken, files_dir: &Path, old_dek: &ws_crypto::Dek, new_dek: &ws_crypto::Dek) -> Result<()> {
    let mut stack = vec![files_dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&d).await else { continue };
        while let Some(entry) = entries.next_entry().await? {
            bail_if_canceled(ctx, "rotate")?;
            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                stack.push(entry.path());
                continue;
            }
            let path = entry.path();
            let body = tokio::fs::read(&path).await?;
            if !ws_crypto::is_encrypted(&body) {
                continue;
            }
            let plaintext = ws_crypto::decrypt(old_dek, &body)?;
            let fresh = ws_crypto::encrypt(new_dek, &plaintext)?;
            let tmp = path.with_extension(format!("rotate-{}", Uuid::new_v4().simple()));
            tokio::fs::write(&tmp, &fresh).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(dir: &Path) -> FsProjectsService {
        FsProjectsService::new(dir, vec!["skills/".to_string()], None)
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn create_project_seeds_readme_and_bumps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let ctx = ctx();
        let project = svc.create_project(&ctx, "user-1", "My Project").await.unwrap();
        assert_eq!(project.generation, 1);

        let listed = svc.list_projects(&ctx, "user-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "My Project");
        assert_eq!(listed[0].file_count, 1);
    }

    #[tokio::test]
    async fn upload_read_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let ctx = ctx();
        let project = svc.create_project(&ctx, "user-1", "demo").await.unwrap();
        let pid = project.id.to_string();

        svc.upload_file(&ctx, "user-1", &pid, "", "s.txt", b"hello".to_vec()).await.unwrap();
        let data = svc.read_file(&ctx, "user-1", &pid, "s.txt").await.unwrap();
        assert_eq!(data, b"hello");

        svc.delete_file(&ctx, "user-1", &pid, "s.txt").await.unwrap();
        assert!(svc.read_file(&ctx, "user-1", &pid, "s.txt").await.is_err());
    }

    #[tokio::test]
    async fn upload_rejects_name_with_separator() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let ctx = ctx();
        let project = svc.create_project(&ctx, "user-1", "demo").await.unwrap();
        let pid = project.id.to_string();
        assert!(svc.upload_file(&ctx, "user-1", &pid, "", "a/b.txt", vec![]).await.is_err());
    }

    #[tokio::test]
    async fn canceled_upload_performs_no_write() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let live = ctx();
        let project = svc.create_project(&live, "user-1", "demo").await.unwrap();
        let pid = project.id.to_string();

        let canceled = CancellationToken::new();
        canceled.cancel();
        assert!(matches!(
            svc.upload_file(&canceled, "user-1", &pid, "", "s.txt", b"x".to_vec()).await,
            Err(Error::Canceled(_))
        ));
        assert!(svc.read_file(&live, "user-1", &pid, "s.txt").await.is_err());
    }

    #[tokio::test]
    async fn move_path_rejects_existing_destination_and_descendant() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let ctx = ctx();
        let project = svc.create_project(&ctx, "user-1", "demo").await.unwrap();
        let pid = project.id.to_string();
        svc.upload_file(&ctx, "user-1", &pid, "", "a.txt", b"1".to_vec()).await.unwrap();
        svc.upload_file(&ctx, "user-1", &pid, "", "b.txt", b"2".to_vec()).await.unwrap();

        assert!(svc.move_path(&ctx, "user-1", &pid, "a.txt", "b.txt").await.is_err());
        svc.move_path(&ctx, "user-1", &pid, "a.txt", "c.txt").await.unwrap();
        assert!(svc.read_file(&ctx, "user-1", &pid, "c.txt").await.is_ok());
    }

    #[tokio::test]
    async fn rotate_dek_keeps_plaintext_readable_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let ctx = ctx();
        let project = svc.create_project(&ctx, "user-1", "demo").await.unwrap();
        let pid = project.id.to_string();

        svc.enable_encryption(&ctx, "user-1", &pid, true).await.unwrap();
        svc.upload_file(&ctx, "user-1", &pid, "", "s.txt", b"top secret".to_vec()).await.unwrap();

        // The fallback master-key path writes the legacy v1 envelope;
        // rotation upgrades it in place.
        let env = crypto_support::load_envelope(&ctx, &svc, "user-1", &pid).await.unwrap().unwrap();
        assert_eq!(env.wrap_version, 1);
        assert!(env.nonce.is_some());

        svc.rotate_project_dek(&ctx, "user-1", &pid).await.unwrap();

        let env = crypto_support::load_envelope(&ctx, &svc, "user-1", &pid).await.unwrap().unwrap();
        assert!(env.prev_wrapped_dek.is_none());
        assert_eq!(env.wrap_version, 2);

        let data = svc.read_file(&ctx, "user-1", &pid, "s.txt").await.unwrap();
        assert_eq!(data, b"top secret");
    }
}
