//! Workspace checkout/commit/cleanup lifecycle.
//!
//! Two implementations share the [`WorkspaceManager`] contract: the legacy
//! passthrough manager (a project directory IS the workspace) and the
//! ephemeral manifest-based manager (a session working copy is hydrated
//! from and reconciled back to an `ObjectStore`).

pub mod callbacks;
pub mod contract;
pub mod ephemeral;
pub mod legacy;

pub use callbacks::{register_checkout_callback, register_skills_invalidation_callback, CheckoutCallback, SkillsInvalidationCallback};
pub use contract::{Workspace, WorkspaceManager};
pub use ephemeral::EphemeralWorkspaceManager;
pub use legacy::LegacyWorkspaceManager;
