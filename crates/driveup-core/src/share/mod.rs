//! Sharing grants on remote files.

mod manager;

pub use manager::{PermissionFailure, PermissionManager, RevokeSummary};
