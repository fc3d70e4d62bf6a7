//! driveup core: resumable Google Drive transfers and OAuth token lifecycle.
//!
//! The [`TransferOrchestrator`] is the entry point. It asks the
//! [`TokenManager`](auth::TokenManager) for a credential, loads or creates a
//! [`TransferSession`](store::TransferSession) in the
//! [`ResumeStore`](store::ResumeStore), and hands it to the
//! [`ChunkScheduler`](transfer::ChunkScheduler).

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod share;
pub mod store;
pub mod transfer;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Result, TransferError};
pub use orchestrator::{
    DownloadOptions, DownloadResult, TransferControl, TransferOrchestrator, UploadOptions,
    UploadResult,
};
