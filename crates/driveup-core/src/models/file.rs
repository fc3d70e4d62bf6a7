use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of the MIME types Drive uses for native Docs/Sheets/Slides files,
/// which have no binary content to download.
const GOOGLE_APPS_MIME_PREFIX: &str = "application/vnd.google-apps.";

/// Remote file description resolved before a download starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub md5_checksum: Option<String>,
    pub modified_time: Option<DateTime<Utc>>,
    /// Whether byte-range requests are honoured for this file
    pub accepts_ranges: bool,
}

impl FileMetadata {
    pub fn is_google_native(mime_type: Option<&str>) -> bool {
        mime_type
            .map(|m| m.starts_with(GOOGLE_APPS_MIME_PREFIX))
            .unwrap_or(false)
    }

    /// Identifies this revision of the remote content. A resumed download
    /// must see the same tag, otherwise the partial bytes belong to an older
    /// revision.
    pub fn revision_tag(&self) -> String {
        if let Some(ref md5) = self.md5_checksum {
            return format!("md5:{}", md5);
        }
        match self.modified_time {
            Some(ts) => format!("rev:{}:{}", ts.timestamp_millis(), self.size),
            None => format!("size:{}", self.size),
        }
    }
}

/// Metadata sent when opening a resumable upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub size: u64,
}
