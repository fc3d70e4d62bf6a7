//! Data models for Drive entities.
//!
//! - `FileMetadata`, `UploadMetadata`: what the transfer engine needs to know
//!   about a remote file before moving its bytes
//! - `Permission`, `ShareRequest`, `Role`, `GrantType`: sharing grants

pub mod file;
pub mod permission;

pub use file::{FileMetadata, UploadMetadata};
pub use permission::{GrantType, Permission, Role, ShareRequest};
