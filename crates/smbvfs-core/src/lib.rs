//! Shared plumbing for the smbvfs crates: share configuration, share-relative
//! path handling and logging setup.

pub mod config;
pub mod logging;
pub mod paths;
