use thiserror::Error;

/// The error taxonomy shared by every crate in the workspace.
///
/// Boundary-crossing calls (store ↔ projects, projects ↔ manager, manager ↔
/// enterprise wrapper) return `ws_core::Result<T>`. Purely internal helpers
/// may still use `anyhow` where nothing outside the module inspects the
/// failure.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid id {0:?}")]
    InvalidId(String),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid range [{start},{end}] for file with {line_count} lines")]
    InvalidRange {
        start: usize,
        end: usize,
        line_count: usize,
    },

    #[error("invalid object key {0:?}")]
    InvalidKey(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("bucket missing: {0}")]
    BucketMissing(String),

    #[error("timed out acquiring lock on {0}")]
    LockTimeout(String),

    #[error("path {path:?} escapes root {root:?}")]
    PathOutsideRoot { root: String, path: String },

    #[error("failed to decrypt {0}")]
    DecryptFailed(String),

    #[error("failed to unwrap data encryption key: {0}")]
    UnwrapFailed(String),

    #[error("transient error, retry: {0}")]
    Transient(String),

    #[error("canceled: {0}")]
    Canceled(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether a caller may reasonably retry the operation unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::LockTimeout(_))
    }

    /// Whether the condition is an expected "already gone" state that
    /// idempotent callers (delete, cleanup) may treat as success.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::ProjectNotFound(_) | Error::FileNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
