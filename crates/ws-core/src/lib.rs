//! Core types and traits for the workspace service.
//!
//! Every other crate in the workspace depends on this one and nothing else
//! upward — it is the bottom of the dependency graph.

pub mod cancel;
pub mod config;
pub mod error;
pub mod model;
pub mod validate;

pub use cancel::CancellationToken;
pub use config::Config;
pub use error::{Error, Result};
