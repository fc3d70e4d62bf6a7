use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::UploadMetadata;

/// Which way the bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upload => "upload",
            Direction::Download => "download",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key of a transfer: hex SHA-256 over direction, local path and
/// remote identifier.
pub fn session_key(direction: Direction, local_path: &Path, remote_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(direction.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(local_path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(remote_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Durable state of one resumable transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSession {
    pub key: String,
    pub direction: Direction,
    pub local_path: PathBuf,
    /// Upload: comma-joined parent folder ids ("root" when none).
    /// Download: the remote file id.
    pub remote_id: String,
    pub total_size: u64,
    pub committed_offset: u64,
    /// Upload: resumable session URI. Download: file id.
    pub remote_handle: Option<String>,
    pub fingerprint: String,
    pub status: SessionStatus,
    pub chunk_size: u64,
    #[serde(default)]
    pub accepts_ranges: bool,
    #[serde(default)]
    pub upload: Option<UploadMetadata>,
    /// Set once an upload has been committed.
    #[serde(default)]
    pub remote_file_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferSession {
    pub fn new_upload(
        local_path: PathBuf,
        remote_id: String,
        fingerprint: String,
        metadata: UploadMetadata,
        chunk_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: session_key(Direction::Upload, &local_path, &remote_id),
            direction: Direction::Upload,
            local_path,
            remote_id,
            total_size: metadata.size,
            committed_offset: 0,
            remote_handle: None,
            fingerprint,
            status: SessionStatus::Pending,
            chunk_size,
            accepts_ranges: true,
            upload: Some(metadata),
            remote_file_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_download(
        local_path: PathBuf,
        file_id: String,
        total_size: u64,
        fingerprint: String,
        chunk_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: session_key(Direction::Download, &local_path, &file_id),
            direction: Direction::Download,
            local_path,
            remote_id: file_id.clone(),
            total_size,
            committed_offset: 0,
            remote_handle: Some(file_id),
            fingerprint,
            status: SessionStatus::Pending,
            chunk_size,
            accepts_ranges: false,
            upload: None,
            remote_file_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.total_size - self.committed_offset
    }

    pub fn is_complete(&self) -> bool {
        self.committed_offset >= self.total_size
    }

    /// Move the committed offset forward. Offsets never go backwards and
    /// never pass the total size; returns whether anything changed.
    pub fn advance_to(&mut self, offset: u64) -> bool {
        let target = offset.min(self.total_size);
        if target <= self.committed_offset {
            return false;
        }
        self.committed_offset = target;
        self.touch();
        true
    }

    /// Drop all progress; used when the local or remote content changed.
    pub fn restart(&mut self) {
        self.committed_offset = 0;
        self.remote_handle = match self.direction {
            Direction::Upload => None,
            Direction::Download => Some(self.remote_id.clone()),
        };
        self.remote_file_id = None;
        self.status = SessionStatus::Pending;
        self.touch();
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
        self.touch();
    }

    pub fn display_name(&self) -> String {
        match self.upload {
            Some(ref meta) => meta.name.clone(),
            None => self
                .local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.remote_id.clone()),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
