//! Line-oriented atomic file editor: read/search/range-replace/insert/
//! delete/patch, all write ops going through a per-file advisory lock and
//! temp-file-plus-rename.

pub mod editor;
pub mod lines;
pub mod lock;
pub mod patch;
pub mod search;

pub use editor::{AtomicFileEditor, DiffPreview, ReadResult};
