use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use super::atomic::{remove_if_exists, write_atomic};
use super::session::TransferSession;
use crate::error::{Error, Result};

/// Length of a hex SHA-256 session key
const SESSION_KEY_LEN: usize = 64;

/// File-backed store of resumable sessions, one JSON record per key at
/// `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Session keys are hex digests; anything else could escape the store directory.
    fn is_valid_key(key: &str) -> bool {
        key.len() == SESSION_KEY_LEN && key.chars().all(|c| c.is_ascii_hexdigit())
    }

    fn session_path(&self, key: &str) -> Result<PathBuf> {
        if !Self::is_valid_key(key) {
            return Err(Error::Validation(format!("malformed session key '{}'", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    /// Load the session stored under `key`.
    ///
    /// `Ok(None)` when absent; `Error::StateCorrupt` when the record exists
    /// but cannot be read or parsed.
    pub async fn load(&self, key: &str) -> Result<Option<TransferSession>> {
        let path = self.session_path(key)?;
        let contents = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::corrupt(&path, e)),
        };

        let session: TransferSession =
            serde_json::from_slice(&contents).map_err(|e| Error::corrupt(&path, e))?;

        if session.key != key {
            return Err(Error::corrupt(&path, "record key does not match file name"));
        }
        if session.committed_offset > session.total_size {
            return Err(Error::corrupt(
                &path,
                format!(
                    "committed offset {} exceeds total size {}",
                    session.committed_offset, session.total_size
                ),
            ));
        }

        debug!(key, offset = session.committed_offset, status = %session.status, "Loaded session");
        Ok(Some(session))
    }

    /// Atomically replace the record for `session.key`.
    pub async fn save(&self, session: &TransferSession) -> Result<()> {
        let path = self.session_path(&session.key)?;
        let contents = serde_json::to_vec_pretty(session)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        write_atomic(&path, &contents).await?;
        Ok(())
    }

    /// Remove the record for `key`; missing records are fine.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.session_path(key)?;
        remove_if_exists(&path).await?;
        debug!(key, "Deleted session");
        Ok(())
    }

    /// Every readable session, oldest first. Unreadable records are skipped.
    pub async fn list(&self) -> Result<Vec<TransferSession>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let key = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => match name.strip_suffix(".json") {
                    Some(key) if Self::is_valid_key(key) => key.to_string(),
                    _ => continue,
                },
                None => continue,
            };

            match self.load(&key).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable session"),
            }
        }

        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}
