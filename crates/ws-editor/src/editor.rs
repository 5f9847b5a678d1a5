//! The atomic file editor: every write op goes through
//! lock → read current content → compute new content → temp file in the
//! same directory → atomic rename → release lock. Write ops take the
//! caller's cancellation token; a cancellation observed before the rename
//! leaves no visible effect, one observed after is already committed.

use crate::lines::{join, split_keepends, splice};
use crate::lock::FileLock;
use crate::patch;
use crate::search::{search, SearchResult};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;
use ws_core::cancel::CancellationToken;
use ws_core::validate::contained_in;
use ws_core::{Error, Result};

pub struct AtomicFileEditor {
    root: PathBuf,
}

pub struct ReadResult {
    pub content: String,
    pub line_count: usize,
}

pub struct DiffPreview {
    pub unified_diff: String,
}

impl AtomicFileEditor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, rel_path: &str) -> Result<PathBuf> {
        let candidate = self.root.join(rel_path);
        if candidate
            .components()
            .any(|c| matches!(c, std::path::Component::Normal(n) if n == std::ffi::OsStr::new("..")))
        {
            return Err(Error::InvalidPath { path: rel_path.to_string(), reason: "must not contain '..' segments".into() });
        }
        contained_in(&self.root, &candidate)?;
        Ok(candidate)
    }

    async fn read_lines(&self, target: &Path) -> Result<Vec<String>> {
        if target.symlink_metadata().ok().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            return Err(Error::InvalidPath { path: target.display().to_string(), reason: "symlinks are never followed".into() });
        }
        let content = tokio::fs::read_to_string(target)
            .await
            .map_err(|e| if e.kind() == std::io::ErrorKind::NotFound { Error::FileNotFound(target.display().to_string()) } else { e.into() })?;
        Ok(split_keepends(&content))
    }

    async fn write_atomic(&self, ctx: &CancellationToken, target: &Path, lines: &[String]) -> Result<()> {
        let data = join(lines);
        let tmp = target.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, data).await?;
        // The rename is the commit point; a cancellation noticed here rolls
        // the temp file back and the target is untouched.
        if ctx.is_cancelled() {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Canceled("write".into()));
        }
        tokio::fs::rename(&tmp, target).await?;
        Ok(())
    }

    pub async fn read(&self, rel_path: &str) -> Result<ReadResult> {
        let target = self.resolve(rel_path)?;
        let lines = self.read_lines(&target).await?;
        Ok(ReadResult { content: join(&lines), line_count: lines.len() })
    }

    pub async fn read_range(&self, rel_path: &str, start: usize, end: usize) -> Result<ReadResult> {
        let target = self.resolve(rel_path)?;
        let lines = self.read_lines(&target).await?;
        if start < 1 || end < start {
            return Err(Error::InvalidRange { start, end, line_count: lines.len() });
        }
        let clamped_end = end.min(lines.len());
        if start > lines.len() {
            return Err(Error::InvalidRange { start, end, line_count: lines.len() });
        }
        let slice = &lines[start - 1..clamped_end];
        Ok(ReadResult { content: join(slice), line_count: lines.len() })
    }

    pub async fn search(&self, rel_path: &str, pattern: &str) -> Result<SearchResult> {
        let target = self.resolve(rel_path)?;
        let lines = self.read_lines(&target).await?;
        Ok(search(&lines, pattern))
    }

    pub async fn replace_line(&self, ctx: &CancellationToken, rel_path: &str, n: usize, text: &str) -> Result<()> {
        self.replace_range(ctx, rel_path, n, n, text).await
    }

    pub async fn replace_range(&self, ctx: &CancellationToken, rel_path: &str, start: usize, end: usize, text: &str) -> Result<()> {
        let target = self.resolve(rel_path)?;
        let _lock = FileLock::acquire(ctx, &target).await?;
        let lines = self.read_lines(&target).await?;
        if start < 1 || end < start || start > lines.len() {
            return Err(Error::InvalidRange { start, end, line_count: lines.len() });
        }
        let clamped_end = end.min(lines.len());
        let replacement = if text.is_empty() { Vec::new() } else { split_keepends(text) };
        let new_lines = splice(&lines, start, clamped_end, replacement);
        self.write_atomic(ctx, &target, &new_lines).await?;
        info!(path = rel_path, start, end = clamped_end, "EDITOR: replace_range");
        Ok(())
    }

    pub async fn insert_after(&self, ctx: &CancellationToken, rel_path: &str, n: usize, text: &str) -> Result<()> {
        let target = self.resolve(rel_path)?;
        let _lock = FileLock::acquire(ctx, &target).await?;
        let lines = self.read_lines(&target).await?;
        if n > lines.len() {
            return Err(Error::InvalidRange { start: n, end: n, line_count: lines.len() });
        }
        let mut inserted = split_keepends(text);
        if let Some(last) = inserted.last_mut() {
            if !last.ends_with('\n') {
                last.push('\n');
            }
        }
        let mut new_lines = Vec::with_capacity(lines.len() + inserted.len());
        new_lines.extend_from_slice(&lines[..n]);
        new_lines.append(&mut inserted);
        new_lines.extend_from_slice(&lines[n..]);
        self.write_atomic(ctx, &target, &new_lines).await?;
        info!(path = rel_path, after_line = n, "EDITOR: insert_after");
        Ok(())
    }

    pub async fn delete_range(&self, ctx: &CancellationToken, rel_path: &str, start: usize, end: usize) -> Result<()> {
        self.replace_range(ctx, rel_path, start, end, "").await
    }

    pub async fn apply_patch(&self, ctx: &CancellationToken, rel_path: &str, diff: &str) -> Result<()> {
        let target = self.resolve(rel_path)?;
        let _lock = FileLock::acquire(ctx, &target).await?;
        let lines = self.read_lines(&target).await?;
        let patched = patch::apply(&lines, diff)?;
        self.write_atomic(ctx, &target, &patched).await?;
        info!(path = rel_path, "EDITOR: apply_patch");
        Ok(())
    }

    pub async fn preview_patch(&self, rel_path: &str, diff: &str) -> Result<DiffPreview> {
        let target = self.resolve(rel_path)?;
        let lines = self.read_lines(&target).await?;
        let patched = patch::apply(&lines, diff)?;

        let old_text = join(&lines);
        let new_text = join(&patched);
        let unified_diff = similar::TextDiff::from_lines(&old_text, &new_text)
            .unified_diff()
            .context_radius(3)
            .header(rel_path, rel_path)
            .to_string();
        Ok(DiffPreview { unified_diff })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn editor_with(content: &str) -> (tempfile::TempDir, AtomicFileEditor, &'static str) {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("f.txt"), content).await.unwrap();
        let editor = AtomicFileEditor::new(dir.path());
        (dir, editor, "f.txt")
    }

    fn ctx() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn read_reports_line_count() {
        let (_dir, editor, name) = editor_with("a\nb\nc\n").await;
        let result = editor.read(name).await.unwrap();
        assert_eq!(result.line_count, 3);
    }

    #[tokio::test]
    async fn read_range_clamps_end() {
        let (_dir, editor, name) = editor_with("a\nb\nc\n").await;
        let result = editor.read_range(name, 2, 100).await.unwrap();
        assert_eq!(result.content, "b\nc\n");
    }

    #[tokio::test]
    async fn replace_line_is_atomic() {
        let (_dir, editor, name) = editor_with("a\nb\nc\n").await;
        editor.replace_line(&ctx(), name, 2, "B").await.unwrap();
        let result = editor.read(name).await.unwrap();
        assert_eq!(result.content, "a\nB\nc\n");
    }

    #[tokio::test]
    async fn replace_line_rewrites_only_the_named_line() {
        let (_dir, editor, name) = editor_with("line 1\nline 2\nline 3\n").await;
        editor.replace_line(&ctx(), name, 2, "REPLACED LINE 2").await.unwrap();
        let result = editor.read(name).await.unwrap();
        assert_eq!(result.content, "line 1\nREPLACED LINE 2\nline 3\n");
    }

    #[tokio::test]
    async fn canceled_write_leaves_file_untouched() {
        let (_dir, editor, name) = editor_with("a\nb\nc\n").await;
        let canceled = CancellationToken::new();
        canceled.cancel();
        assert!(matches!(
            editor.replace_line(&canceled, name, 2, "B").await,
            Err(Error::Canceled(_))
        ));
        assert_eq!(editor.read(name).await.unwrap().content, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn insert_after_zero_prepends() {
        let (_dir, editor, name) = editor_with("a\n").await;
        editor.insert_after(&ctx(), name, 0, "first").await.unwrap();
        let result = editor.read(name).await.unwrap();
        assert_eq!(result.content, "first\na\n");
    }

    #[tokio::test]
    async fn insert_after_line_count_appends() {
        let (_dir, editor, name) = editor_with("a\n").await;
        editor.insert_after(&ctx(), name, 1, "last").await.unwrap();
        let result = editor.read(name).await.unwrap();
        assert_eq!(result.content, "a\nlast\n");
    }

    #[tokio::test]
    async fn delete_range_removes_lines() {
        let (_dir, editor, name) = editor_with("a\nb\nc\n").await;
        editor.delete_range(&ctx(), name, 2, 2).await.unwrap();
        let result = editor.read(name).await.unwrap();
        assert_eq!(result.content, "a\nc\n");
    }

    #[tokio::test]
    async fn apply_patch_writes_and_preview_does_not() {
        let (_dir, editor, name) = editor_with("a\nb\nc\n").await;
        let diff = "@@ -2,1 +2,1 @@\n-b\n+B\n";

        let preview = editor.preview_patch(name, diff).await.unwrap();
        assert!(preview.unified_diff.contains("-b"));
        assert!(preview.unified_diff.contains("+B"));
        assert_eq!(editor.read(name).await.unwrap().content, "a\nb\nc\n");

        editor.apply_patch(&ctx(), name, diff).await.unwrap();
        assert_eq!(editor.read(name).await.unwrap().content, "a\nB\nc\n");
    }

    #[tokio::test]
    async fn rejects_path_escaping_root() {
        let (_dir, editor, _name) = editor_with("a\n").await;
        assert!(editor.read("../escape.txt").await.is_err());
    }
}
