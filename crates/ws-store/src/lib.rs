//! Object storage abstraction.
//!
//! A narrow `ObjectStore` trait with Get/Put/Delete/List/Head/Copy/Exists,
//! backed by either a local filesystem tree or an S3-compatible bucket
//! (via `opendal`, behind the `s3` feature), plus an in-memory
//! implementation with identical semantics for tests.

pub mod fs;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;
pub mod store;

pub use store::{ListOptions, ListResult, ObjectAttrs, ObjectStore, PutOptions};
