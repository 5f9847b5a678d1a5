//! Per-user project CRUD with envelope encryption and DEK rotation, over
//! either a local WORKDIR or an `ObjectStore`.

pub mod contract;
pub mod crypto_support;
pub mod fs_service;
pub mod meta_io;
pub mod os_service;
pub mod paths;

pub use contract::ProjectsService;
pub use fs_service::FsProjectsService;
pub use os_service::ObjectStoreProjectsService;
