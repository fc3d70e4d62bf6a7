//! Drives the byte transfer of one session.
//!
//! Chunks are strictly sequential: chunk N+1 is not requested until the
//! offset reached by chunk N has been persisted. A crash therefore loses at
//! most the chunk in flight, which is re-sent on resume.

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::chunk::{partial_path, read_range, ChunkAck, ChunkRange, PartialDownload};
use super::fingerprint::fingerprint_file;
use super::progress::{Progress, ProgressDispatcher};
use super::retry::RetryPolicy;
use super::stall::Activity;
use crate::api::{ApiError, DriveTransport};
use crate::auth::Credential;
use crate::error::{Error, Result, TransferError};
use crate::store::atomic::remove_if_exists;
use crate::store::{Direction, ResumeStore, SessionStatus, TransferSession};

/// No bytes moving for this long fails the attempt as a stall.
/// 300 seconds lets slow links make progress without hanging forever.
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 300;

/// Size and modification time of the file being uploaded, taken when the
/// run starts and compared before every chunk read.
#[derive(Debug, PartialEq, Eq)]
struct LocalSnapshot {
    len: u64,
    modified: Option<SystemTime>,
}

impl LocalSnapshot {
    async fn capture(path: &Path) -> Result<Self, TransferError> {
        let meta = fs::metadata(path).await.map_err(TransferError::LocalIo)?;
        Ok(Self {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }
}

/// How the chunk loop ended without an error.
enum LoopExit {
    Finished,
    Cancelled,
}

pub struct ChunkScheduler<T> {
    transport: Arc<T>,
    store: ResumeStore,
    retry: RetryPolicy,
    stall_timeout: Duration,
}

impl<T: DriveTransport> ChunkScheduler<T> {
    pub fn new(transport: Arc<T>, store: ResumeStore) -> Self {
        Self {
            transport,
            store,
            retry: RetryPolicy::default(),
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    pub fn store(&self) -> &ResumeStore {
        &self.store
    }

    /// Transfer the remaining bytes of `session`.
    ///
    /// Returns the session once it is `completed` (already removed from the
    /// store) or `paused` after `cancel` fired between chunks. Failures come
    /// back as [`Error::Transfer`]; retryable ones leave the session
    /// persisted as `failed`, fatal ones delete it along with any partial
    /// download.
    pub async fn run(
        &self,
        mut session: TransferSession,
        credential: &Credential,
        progress: &ProgressDispatcher,
        cancel: &CancellationToken,
    ) -> Result<TransferSession> {
        info!(
            key = %session.key,
            direction = %session.direction,
            offset = session.committed_offset,
            total = session.total_size,
            "Starting transfer"
        );

        match self.drive(&mut session, credential, progress, cancel).await {
            Ok(()) => Ok(session),
            Err(err) => Err(self.settle_failure(&mut session, err).await),
        }
    }

    async fn drive(
        &self,
        session: &mut TransferSession,
        credential: &Credential,
        progress: &ProgressDispatcher,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        if session.status == SessionStatus::Pending || session.remote_handle.is_none() {
            self.negotiate(session, credential).await?;
        }
        session.set_status(SessionStatus::Active);
        self.persist(session).await?;

        let exit = match session.direction {
            Direction::Upload => self.upload(session, credential, progress, cancel).await?,
            Direction::Download => self.download(session, credential, progress, cancel).await?,
        };

        match exit {
            LoopExit::Cancelled => {
                session.set_status(SessionStatus::Paused);
                self.persist(session).await?;
                info!(
                    key = %session.key,
                    offset = session.committed_offset,
                    "Transfer paused"
                );
            }
            LoopExit::Finished => {
                session.set_status(SessionStatus::Completed);
                if let Err(e) = self.store.delete(&session.key).await {
                    warn!(key = %session.key, error = %e, "Failed to remove completed session");
                }
                info!(key = %session.key, total = session.total_size, "Transfer complete");
            }
        }
        Ok(())
    }

    /// Obtain the remote handle for a fresh session.
    async fn negotiate(
        &self,
        session: &mut TransferSession,
        credential: &Credential,
    ) -> Result<(), TransferError> {
        match session.direction {
            Direction::Upload => {
                let metadata = session.upload.clone().ok_or_else(|| {
                    TransferError::SessionInvalidated("session has no upload metadata".to_string())
                })?;
                let transport = &self.transport;
                let meta = &metadata;
                let handle = self
                    .attempt(0, |_| transport.open_upload_session(credential, meta))
                    .await?;
                debug!(key = %session.key, "Opened resumable upload session");
                session.committed_offset = 0;
                session.remote_file_id = None;
                session.remote_handle = Some(handle);
            }
            Direction::Download => {
                let transport = &self.transport;
                let file_id = session.remote_id.as_str();
                let metadata = self
                    .attempt(0, |_| transport.get_file_metadata(credential, file_id))
                    .await?;
                if metadata.size != session.total_size {
                    return Err(TransferError::SizeMismatch {
                        expected: session.total_size,
                        actual: metadata.size,
                    });
                }
                session.accepts_ranges = metadata.accepts_ranges;
                session.remote_handle = Some(session.remote_id.clone());
            }
        }
        Ok(())
    }

    async fn upload(
        &self,
        session: &mut TransferSession,
        credential: &Credential,
        progress: &ProgressDispatcher,
        cancel: &CancellationToken,
    ) -> Result<LoopExit, TransferError> {
        let path = session.local_path.clone();
        let handle = session.remote_handle.clone().unwrap_or_default();
        let total = session.total_size;

        let baseline = LocalSnapshot::capture(&path).await?;
        if baseline.len != total {
            return Err(TransferError::FingerprintMismatch(path));
        }
        let mut verified = false;

        progress.publish(Progress {
            committed: session.committed_offset,
            total,
        });

        while let Some(range) = ChunkRange::next(session.committed_offset, session.chunk_size, total) {
            if cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }

            if LocalSnapshot::capture(&path).await? != baseline {
                return Err(TransferError::FingerprintMismatch(path));
            }
            let bytes = match read_range(&path, range).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(TransferError::FingerprintMismatch(path));
                }
                Err(e) => return Err(TransferError::LocalIo(e)),
            };
            // The final chunk finalizes the remote file.
            if range.end == total && !verified {
                self.verify_unchanged(session).await?;
                verified = true;
            }

            let transport = &self.transport;
            let handle = handle.as_str();
            let chunk = &bytes;
            let ack = self
                .attempt(range.start, |activity| async move {
                    let ack = transport
                        .send_chunk(credential, handle, range, total, chunk.clone(), &activity)
                        .await?;
                    match ack {
                        ChunkAck::Partial { committed } if committed <= range.start => {
                            Err(ApiError::NoProgress(range.start))
                        }
                        ack => Ok(ack),
                    }
                })
                .await?;

            match ack {
                ChunkAck::Partial { committed } => {
                    let acked = committed.min(range.end);
                    if acked < range.end {
                        debug!(
                            key = %session.key,
                            sent_end = range.end,
                            acked,
                            "Remote kept part of the chunk"
                        );
                    }
                    session.advance_to(acked);
                }
                ChunkAck::Complete { file_id } => {
                    session.advance_to(total);
                    session.remote_file_id = Some(file_id);
                }
            }

            self.persist(session).await?;
            progress.publish(Progress {
                committed: session.committed_offset,
                total,
            });
            debug!(key = %session.key, offset = session.committed_offset, total, "Chunk committed");
        }

        if session.remote_file_id.is_none() {
            if !verified {
                self.verify_unchanged(session).await?;
            }
            let transport = &self.transport;
            let handle = handle.as_str();
            let file_id = self
                .attempt(total, |_| transport.commit_upload(credential, handle, total))
                .await?;
            session.remote_file_id = Some(file_id);
        }

        Ok(LoopExit::Finished)
    }

    async fn download(
        &self,
        session: &mut TransferSession,
        credential: &Credential,
        progress: &ProgressDispatcher,
        cancel: &CancellationToken,
    ) -> Result<LoopExit, TransferError> {
        let total = session.total_size;
        let keep = if session.accepts_ranges {
            session.committed_offset
        } else {
            0
        };

        let (mut writer, resume_at) = PartialDownload::open(&session.local_path, keep)
            .await
            .map_err(TransferError::LocalIo)?;
        if resume_at < session.committed_offset {
            warn!(
                key = %session.key,
                recorded = session.committed_offset,
                "Partial download cannot be resumed, restarting from zero"
            );
            session.restart();
            session.set_status(SessionStatus::Active);
            self.persist(session).await?;
        }

        progress.publish(Progress {
            committed: session.committed_offset,
            total,
        });

        let chunk_size = if session.accepts_ranges {
            session.chunk_size
        } else {
            total
        };
        let file_id = session.remote_id.clone();

        while let Some(range) = ChunkRange::next(session.committed_offset, chunk_size, total) {
            if cancel.is_cancelled() {
                return Ok(LoopExit::Cancelled);
            }

            let transport = &self.transport;
            let file_id = file_id.as_str();
            let bytes = self
                .attempt(range.start, |activity| async move {
                    let bytes = transport
                        .fetch_range(credential, file_id, range, &activity)
                        .await?;
                    if bytes.len() as u64 != range.len() {
                        return Err(ApiError::Truncated {
                            expected: range.len(),
                            actual: bytes.len() as u64,
                        });
                    }
                    Ok(bytes)
                })
                .await?;

            writer
                .write_at(range.start, &bytes)
                .await
                .map_err(TransferError::LocalIo)?;
            session.advance_to(range.end);
            self.persist(session).await?;
            progress.publish(Progress {
                committed: session.committed_offset,
                total,
            });
            debug!(key = %session.key, offset = session.committed_offset, total, "Chunk committed");
        }

        writer.finish().await.map_err(TransferError::LocalIo)?;
        Ok(LoopExit::Finished)
    }

    /// Re-hash the local file and compare it with the fingerprint the
    /// session was created for.
    async fn verify_unchanged(&self, session: &TransferSession) -> Result<(), TransferError> {
        let current = fingerprint_file(&session.local_path)
            .await
            .map_err(TransferError::LocalIo)?;
        if current != session.fingerprint {
            return Err(TransferError::FingerprintMismatch(session.local_path.clone()));
        }
        Ok(())
    }

    /// Run one remote operation, retrying transient failures with backoff
    /// until the attempt budget is spent. An attempt stalls when its
    /// [`Activity`] sees no bytes move for the stall timeout.
    async fn attempt<V, F, Fut>(&self, offset: u64, mut op: F) -> Result<V, TransferError>
    where
        F: FnMut(Activity) -> Fut,
        Fut: Future<Output = std::result::Result<V, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let activity = Activity::new();
            let outcome = tokio::select! {
                outcome = op(activity.clone()) => outcome,
                _ = activity.idle_for(self.stall_timeout) => {
                    Err(ApiError::Stalled(self.stall_timeout.as_secs()))
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= self.retry.max_attempts {
                        return Err(TransferError::RetriesExhausted {
                            offset,
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        offset,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Chunk attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(TransferError::from_api(e)),
            }
        }
    }

    async fn persist(&self, session: &TransferSession) -> Result<(), TransferError> {
        self.store.save(session).await.map_err(|e| match e {
            Error::Io(e) => TransferError::LocalIo(e),
            other => TransferError::LocalIo(io::Error::new(io::ErrorKind::Other, other.to_string())),
        })
    }

    /// Record the failure on the session and convert it for the caller.
    async fn settle_failure(&self, session: &mut TransferSession, err: TransferError) -> Error {
        session.set_status(SessionStatus::Failed);

        if err.is_retryable() {
            warn!(
                key = %session.key,
                offset = session.committed_offset,
                error = %err,
                "Transfer interrupted, session kept for resume"
            );
            if let Err(e) = self.store.save(session).await {
                warn!(key = %session.key, error = %e, "Failed to persist interrupted session");
            }
        } else {
            error!(key = %session.key, error = %err, "Transfer failed, discarding session");
            if let Err(e) = self.store.delete(&session.key).await {
                warn!(key = %session.key, error = %e, "Failed to remove failed session");
            }
            if session.direction == Direction::Download {
                if let Err(e) = remove_if_exists(&partial_path(&session.local_path)).await {
                    warn!(key = %session.key, error = %e, "Failed to remove partial download");
                }
            }
        }

        Error::Transfer(err)
    }
}
