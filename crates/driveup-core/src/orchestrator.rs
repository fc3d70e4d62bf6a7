//! Single entry point per transfer.
//!
//! The orchestrator resolves the session key, loads or creates the session,
//! obtains a credential, drives the scheduler and applies post-transfer
//! actions. At most one run per session key is active in this process.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{AuthTransport, DriveTransport};
use crate::auth::{AuthProfile, TokenManager};
use crate::error::{Error, Result, TransferError};
use crate::models::{FileMetadata, ShareRequest, UploadMetadata};
use crate::share::PermissionManager;
use crate::store::atomic::remove_if_exists;
use crate::store::{session_key, Direction, ResumeStore, SessionStatus, TransferSession};
use crate::transfer::chunk::partial_path;
use crate::transfer::fingerprint::{fingerprint_file, remote_fingerprint};
use crate::transfer::retry::{with_retry, RetryPolicy};
use crate::transfer::{ChunkScheduler, NoProgress, ProgressDispatcher, ProgressSink};

/// Default bytes per chunk.
/// 8 MiB is a multiple of Drive's 256 KiB upload granularity and keeps the
/// amount re-sent after a crash small.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Remote id recorded for uploads without explicit parent folders
const ROOT_FOLDER: &str = "root";

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub parents: Vec<String>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    /// Grant to create once the upload completes.
    pub share: Option<ShareRequest>,
    /// Remove the local file after a successful upload.
    pub delete_after: bool,
    pub profile: AuthProfile,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub resumable: bool,
    pub force: bool,
    pub output: Option<PathBuf>,
    pub profile: AuthProfile,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            resumable: true,
            force: false,
            output: None,
            profile: AuthProfile::default(),
        }
    }
}

/// Caller-side handles for a running transfer.
#[derive(Clone, Default)]
pub struct TransferControl {
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub resumed_from: u64,
    /// Id of the grant created by the share step.
    pub share: Option<String>,
    pub share_error: Option<String>,
    pub deleted_local: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub file_id: String,
    pub path: PathBuf,
    pub size: u64,
    pub resumed_from: u64,
}

/// Held while a session key is running; releases the key on drop, including
/// when the transfer future itself is dropped.
struct SessionLease {
    key: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.key);
    }
}

pub struct TransferOrchestrator<T> {
    transport: Arc<T>,
    tokens: Arc<TokenManager<T>>,
    scheduler: ChunkScheduler<T>,
    permissions: PermissionManager<T>,
    retry: RetryPolicy,
    chunk_size: u64,
    active: Arc<Mutex<HashSet<String>>>,
}

impl<T: DriveTransport + AuthTransport> TransferOrchestrator<T> {
    pub fn new(transport: Arc<T>, tokens: Arc<TokenManager<T>>, sessions: ResumeStore) -> Self {
        Self {
            scheduler: ChunkScheduler::new(transport.clone(), sessions),
            permissions: PermissionManager::new(transport.clone(), tokens.clone()),
            transport,
            tokens,
            retry: RetryPolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.scheduler = self.scheduler.with_retry_policy(retry.clone());
        self.permissions = self.permissions.with_retry_policy(retry.clone());
        self.retry = retry;
        self
    }

    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.scheduler = self.scheduler.with_stall_timeout(stall_timeout);
        self
    }

    pub fn tokens(&self) -> &TokenManager<T> {
        &self.tokens
    }

    pub fn permissions(&self) -> &PermissionManager<T> {
        &self.permissions
    }

    pub fn sessions(&self) -> &ResumeStore {
        self.scheduler.store()
    }

    /// Upload the file at `path`, resuming a saved session when the file is
    /// unchanged since it was recorded.
    pub async fn upload(
        &self,
        path: &Path,
        options: UploadOptions,
        control: TransferControl,
    ) -> Result<UploadResult> {
        if let Some(ref share) = options.share {
            share.validate()?;
        }

        let local_path = tokio::fs::canonicalize(path).await.map_err(|e| {
            Error::Validation(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file_meta = tokio::fs::metadata(&local_path).await?;
        if !file_meta.is_file() {
            return Err(Error::Validation(format!(
                "{} is not a regular file",
                local_path.display()
            )));
        }
        let size = file_meta.len();
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Validation(format!("{} has no file name", path.display())))?;

        let remote_id = Self::upload_target(&options.parents);
        let key = session_key(Direction::Upload, &local_path, &remote_id);
        let _lease = self.acquire(&key)?;

        let fingerprint = fingerprint_file(&local_path).await?;

        let session = match self.load_session(&key).await? {
            Some(saved) if saved.fingerprint == fingerprint && saved.total_size == size => {
                info!(
                    key = %key,
                    offset = saved.committed_offset,
                    total = size,
                    "Resuming upload"
                );
                saved
            }
            saved => {
                if saved.is_some() {
                    info!(key = %key, "Local file changed since last attempt, restarting upload");
                    self.sessions().delete(&key).await?;
                }
                TransferSession::new_upload(
                    local_path.clone(),
                    remote_id,
                    fingerprint,
                    UploadMetadata {
                        name: name.clone(),
                        parents: options.parents.clone(),
                        description: options.description.clone(),
                        mime_type: options.mime_type.clone(),
                        size,
                    },
                    self.chunk_size,
                )
            }
        };
        let resumed_from = session.committed_offset;

        let session = self.run_session(session, options.profile, &control).await?;
        let file_id = session.remote_file_id.clone().ok_or_else(|| {
            Error::Transfer(TransferError::SessionInvalidated(
                "upload finished without a file id".to_string(),
            ))
        })?;

        let mut result = UploadResult {
            file_id: file_id.clone(),
            name,
            size,
            resumed_from,
            share: None,
            share_error: None,
            deleted_local: false,
        };

        if let Some(ref request) = options.share {
            match self.permissions.share(options.profile, &file_id, request).await {
                Ok(grant) => result.share = Some(grant.id),
                Err(e) => {
                    warn!(file_id = %file_id, error = %e, "Upload succeeded but sharing failed");
                    result.share_error = Some(e.to_string());
                }
            }
        }

        if options.delete_after {
            match tokio::fs::remove_file(&local_path).await {
                Ok(()) => {
                    info!(path = %local_path.display(), "Deleted local file after upload");
                    result.deleted_local = true;
                }
                Err(e) => warn!(path = %local_path.display(), error = %e, "Failed to delete local file"),
            }
        }

        Ok(result)
    }

    /// Download `file_id`, resuming a partial download of the same remote
    /// revision when one exists.
    pub async fn download(
        &self,
        file_id: &str,
        options: DownloadOptions,
        control: TransferControl,
    ) -> Result<DownloadResult> {
        let credential = self.tokens.credential(options.profile).await?;
        let metadata = with_retry(&self.retry, "get_file_metadata", || {
            self.transport.get_file_metadata(&credential, file_id)
        })
        .await
        .map_err(|(e, _)| Error::Api(e))?;

        if FileMetadata::is_google_native(metadata.mime_type.as_deref()) {
            return Err(Error::Validation(format!(
                "{} is a Google Workspace document and has no binary content to download",
                metadata.name
            )));
        }

        let output = Self::resolve_output(options.output.as_deref(), &metadata.name).await?;
        let key = session_key(Direction::Download, &output, file_id);
        let _lease = self.acquire(&key)?;
        let fingerprint = remote_fingerprint(&metadata);

        if !options.resumable {
            self.discard_download(&key, &output).await?;
        }

        let saved = match self.load_session(&key).await? {
            Some(saved) if saved.fingerprint == fingerprint && saved.total_size == metadata.size => {
                info!(
                    key = %key,
                    offset = saved.committed_offset,
                    total = metadata.size,
                    "Resuming download"
                );
                Some(saved)
            }
            Some(_) => {
                info!(key = %key, "Remote file changed since last attempt, restarting download");
                self.discard_download(&key, &output).await?;
                None
            }
            None => None,
        };

        let session = match saved {
            Some(session) => session,
            None => {
                if !options.force && tokio::fs::try_exists(&output).await? {
                    return Err(Error::Validation(format!(
                        "{} already exists (use --force to overwrite)",
                        output.display()
                    )));
                }
                let mut session = TransferSession::new_download(
                    output.clone(),
                    file_id.to_string(),
                    metadata.size,
                    fingerprint,
                    self.chunk_size,
                );
                session.accepts_ranges = metadata.accepts_ranges;
                session
            }
        };
        let resumed_from = session.committed_offset;

        let session = self.run_session(session, options.profile, &control).await?;
        Ok(DownloadResult {
            file_id: file_id.to_string(),
            path: session.local_path,
            size: session.total_size,
            resumed_from,
        })
    }

    /// Drive `session` to completion. A credential rejected mid-transfer is
    /// renewed and the session resumed, as long as the previous renewal was
    /// followed by progress.
    async fn run_session(
        &self,
        session: TransferSession,
        profile: AuthProfile,
        control: &TransferControl,
    ) -> Result<TransferSession> {
        let sink = control
            .progress
            .clone()
            .unwrap_or_else(|| Arc::new(NoProgress) as Arc<dyn ProgressSink>);
        let progress = ProgressDispatcher::spawn(sink);

        let result = self
            .run_with_renewal(session, profile, &progress, &control.cancel)
            .await;
        progress.finish().await;

        let session = result?;
        if session.status == SessionStatus::Paused {
            return Err(Error::Cancelled {
                committed: session.committed_offset,
                total: session.total_size,
            });
        }
        Ok(session)
    }

    async fn run_with_renewal(
        &self,
        mut session: TransferSession,
        profile: AuthProfile,
        progress: &ProgressDispatcher,
        cancel: &CancellationToken,
    ) -> Result<TransferSession> {
        let key = session.key.clone();
        let mut credential = self.tokens.credential(profile).await?;
        let mut renewed_at: Option<u64> = None;

        loop {
            let result = self.scheduler.run(session, &credential, progress, cancel).await;
            match result {
                Err(Error::Transfer(TransferError::CredentialExpired)) => {
                    let saved = self.sessions().load(&key).await?.ok_or_else(|| {
                        Error::Transfer(TransferError::SessionInvalidated(
                            "session disappeared before it could be resumed".to_string(),
                        ))
                    })?;
                    let offset = saved.committed_offset;
                    if renewed_at.is_some_and(|at| offset <= at) {
                        warn!(key = %key, offset, "Renewed credential rejected without progress");
                        return Err(Error::Transfer(TransferError::CredentialExpired));
                    }

                    info!(key = %key, offset, "Credential rejected mid-transfer, renewing");
                    credential = self.tokens.renew(profile).await?;
                    renewed_at = Some(offset);
                    session = saved;
                }
                result => return result,
            }
        }
    }

    /// Saved session for `key`; unreadable records are removed and treated
    /// as absent.
    async fn load_session(&self, key: &str) -> Result<Option<TransferSession>> {
        match self.sessions().load(key).await {
            Ok(saved) => Ok(saved),
            Err(Error::StateCorrupt { path, reason }) => {
                warn!(path = %path.display(), %reason, "Discarding unreadable session record");
                self.sessions().delete(key).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn discard_download(&self, key: &str, output: &Path) -> Result<()> {
        self.sessions().delete(key).await?;
        remove_if_exists(&partial_path(output)).await?;
        debug!(key, "Discarded saved download state");
        Ok(())
    }

    fn acquire(&self, key: &str) -> Result<SessionLease> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(key.to_string()) {
            return Err(Error::SessionBusy(key.to_string()));
        }
        Ok(SessionLease {
            key: key.to_string(),
            active: self.active.clone(),
        })
    }

    /// Parent folders in a stable order, so the same set always yields the
    /// same session key.
    fn upload_target(parents: &[String]) -> String {
        if parents.is_empty() {
            return ROOT_FOLDER.to_string();
        }
        let mut sorted = parents.to_vec();
        sorted.sort();
        sorted.dedup();
        sorted.join(",")
    }

    /// Absolute output path: the remote name in the current directory by
    /// default, or inside `output` when that names a directory.
    async fn resolve_output(output: Option<&Path>, remote_name: &str) -> Result<PathBuf> {
        let file_name = remote_name.replace(['/', '\\'], "_");
        if file_name.is_empty() || file_name == "." || file_name == ".." {
            return Err(Error::Validation(format!(
                "remote name '{}' cannot be used as a file name",
                remote_name
            )));
        }

        let cwd = std::env::current_dir()?;
        let target = match output {
            None => cwd.join(&file_name),
            Some(path) => {
                let path = if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    cwd.join(path)
                };
                if tokio::fs::metadata(&path)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false)
                {
                    path.join(&file_name)
                } else {
                    path
                }
            }
        };

        // Canonical parent keeps the session key stable across spellings.
        match (target.parent(), target.file_name()) {
            (Some(parent), Some(name)) => match tokio::fs::canonicalize(parent).await {
                Ok(parent) => Ok(parent.join(name)),
                Err(_) => Ok(target.clone()),
            },
            _ => Ok(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenStore;
    use crate::testing::{FakeDrive, Fault};
    use crate::transfer::ChunkRange;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    struct Harness {
        dir: TempDir,
        drive: Arc<FakeDrive>,
        orchestrator: TransferOrchestrator<FakeDrive>,
    }

    impl Harness {
        fn new(chunk_size: u64) -> Self {
            Self::build(chunk_size, None)
        }

        fn build(chunk_size: u64, stall_timeout: Option<Duration>) -> Self {
            let dir = TempDir::new().unwrap();
            let drive = Arc::new(FakeDrive::new());
            let tokens = Arc::new(
                TokenManager::new(drive.clone(), TokenStore::new(dir.path().join("tokens")))
                    .with_retry_policy(RetryPolicy::immediate(3)),
            );
            let orchestrator = TransferOrchestrator::new(
                drive.clone(),
                tokens,
                ResumeStore::new(dir.path().join("sessions")),
            )
            .with_chunk_size(chunk_size)
            .with_retry_policy(RetryPolicy::immediate(3));
            let orchestrator = match stall_timeout {
                Some(stall) => orchestrator.with_stall_timeout(stall),
                None => orchestrator,
            };
            Self {
                dir,
                drive,
                orchestrator,
            }
        }

        fn write(&self, name: &str, len: u64, seed: u8) -> PathBuf {
            let content: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect();
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn out(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    fn chunk_lens(ranges: &[ChunkRange], unit: u64) -> Vec<u64> {
        ranges.iter().map(|r| r.len() / unit).collect()
    }

    #[tokio::test]
    async fn test_interrupted_upload_resumes_with_final_chunk_only() {
        let h = Harness::new(8 * MIB);
        let path = h.write("big.bin", 20 * MIB, 1);
        h.drive.hang_on_send(Some(2));

        // Simulate a crash during chunk 3 by dropping the transfer future.
        tokio::select! {
            result = h.orchestrator.upload(&path, UploadOptions::default(), TransferControl::default()) => {
                panic!("upload should hang on the third chunk: {:?}", result.map(|r| r.file_id));
            }
            _ = h.drive.wait_for_hang() => {}
        }
        assert_eq!(chunk_lens(&h.drive.sent_chunks(), MIB), vec![8, 8]);

        let saved = h.orchestrator.sessions().list().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].committed_offset, 16 * MIB);

        h.drive.hang_on_send(None);
        let result = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default())
            .await
            .unwrap();

        assert_eq!(result.resumed_from, 16 * MIB);
        assert_eq!(result.size, 20 * MIB);
        let sent = h.drive.sent_chunks();
        assert_eq!(chunk_lens(&sent, MIB), vec![8, 8, 4]);
        assert_eq!(sent[2].start, 16 * MIB);
        assert_eq!(
            h.drive.file_content(&result.file_id).unwrap(),
            std::fs::read(&path).unwrap()
        );
        assert!(h.orchestrator.sessions().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_changed_file_restarts_from_zero() {
        let h = Harness::new(MIB);
        let path = h.write("doc.bin", 3 * MIB, 1);
        h.drive.hang_on_send(Some(1));

        tokio::select! {
            _ = h.orchestrator.upload(&path, UploadOptions::default(), TransferControl::default()) => {
                panic!("upload should hang");
            }
            _ = h.drive.wait_for_hang() => {}
        }
        h.drive.hang_on_send(None);

        // Same size, different bytes.
        h.write("doc.bin", 3 * MIB, 2);
        let result = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default())
            .await
            .unwrap();

        assert_eq!(result.resumed_from, 0);
        let starts: Vec<u64> = h.drive.sent_chunks().iter().map(|r| r.start / MIB).collect();
        assert_eq!(starts, vec![0, 0, 1, 2]);
        assert_eq!(
            h.drive.file_content(&result.file_id).unwrap(),
            std::fs::read(&path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_committed_offset_never_moves_backwards_across_resumes() {
        let h = Harness::new(MIB);
        let path = h.write("steady.bin", 5 * MIB, 3);
        let mut offsets = Vec::new();

        for hang_at in [1, 3] {
            h.drive.hang_on_send(Some(hang_at));
            tokio::select! {
                _ = h.orchestrator.upload(&path, UploadOptions::default(), TransferControl::default()) => {
                    panic!("upload should hang");
                }
                _ = h.drive.wait_for_hang() => {}
            }
            let saved = h.orchestrator.sessions().list().await.unwrap();
            offsets.push(saved[0].committed_offset);
        }
        h.drive.hang_on_send(None);
        let result = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default())
            .await
            .unwrap();
        offsets.push(result.size);

        assert!(offsets.windows(2).all(|w| w[0] <= w[1]), "{offsets:?}");
        assert!(offsets.iter().all(|&o| o <= 5 * MIB));
    }

    #[tokio::test]
    async fn test_concurrent_upload_of_same_file_is_busy() {
        let h = Harness::build(MIB, Some(Duration::from_millis(200)));
        let path = h.write("shared.bin", 2 * MIB, 4);
        // The first run stalls on its first chunk, times out, and retries.
        h.drive.hang_on_send(Some(0));

        let first = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default());
        let second = async {
            h.drive.wait_for_hang().await;
            h.orchestrator
                .upload(&path, UploadOptions::default(), TransferControl::default())
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(second, Err(Error::SessionBusy(_))));
        let first = first.unwrap();
        assert_eq!(h.drive.file_count(), 1);
        assert_eq!(
            h.drive.file_content(&first.file_id).unwrap(),
            std::fs::read(&path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_upload_with_share_and_delete() {
        let h = Harness::new(MIB);
        let path = h.write("public.bin", MIB / 2, 5);

        let options = UploadOptions {
            share: Some(ShareRequest::default()),
            delete_after: true,
            ..UploadOptions::default()
        };
        let result = h
            .orchestrator
            .upload(&path, options, TransferControl::default())
            .await
            .unwrap();

        assert!(result.share.is_some());
        assert!(result.share_error.is_none());
        assert!(result.deleted_local);
        assert!(!path.exists());
        assert_eq!(h.drive.permissions(&result.file_id).len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_share_request_rejected_before_upload() {
        let h = Harness::new(MIB);
        let path = h.write("x.bin", 10, 0);
        let options = UploadOptions {
            share: Some(ShareRequest::user("not-an-email")),
            ..UploadOptions::default()
        };

        let err = h
            .orchestrator
            .upload(&path, options, TransferControl::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h.drive.sent_chunks().is_empty());
    }

    #[tokio::test]
    async fn test_credential_renewed_each_time_it_expires_mid_transfer() {
        let h = Harness::new(MIB);
        let path = h.write("longer.bin", 3 * MIB, 9);

        h.orchestrator.tokens().credential(AuthProfile::Cli).await.unwrap();
        h.drive.expire_issued_tokens();
        // The first token is rejected when the session opens; the renewed
        // one carries two chunks and is rejected on the third.
        h.drive.expire_tokens_on_send(Some(2));

        let result = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default())
            .await
            .unwrap();

        assert_eq!(h.drive.auth_calls().refreshes, 2);
        assert_eq!(result.resumed_from, 0);
        assert_eq!(
            h.drive.file_content(&result.file_id).unwrap(),
            std::fs::read(&path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_renewal_without_progress_gives_up() {
        let h = Harness::new(MIB);
        let path = h.write("stuck.bin", 2 * MIB, 10);

        h.orchestrator.tokens().credential(AuthProfile::Cli).await.unwrap();
        h.drive.expire_issued_tokens();
        // The renewed token is rejected on the first chunk it carries.
        h.drive.expire_tokens_on_send(Some(0));

        let err = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Transfer(TransferError::CredentialExpired)
        ));
        assert_eq!(h.drive.auth_calls().refreshes, 1);
        let saved = h.orchestrator.sessions().list().await.unwrap();
        assert_eq!(saved[0].committed_offset, 0);
    }

    #[tokio::test]
    async fn test_unreadable_session_record_restarts_upload() {
        let h = Harness::new(MIB);
        let path = h.write("again.bin", 2 * MIB, 11);
        let canonical = std::fs::canonicalize(&path).unwrap();
        let key = session_key(Direction::Upload, &canonical, "root");

        let sessions = h.dir.path().join("sessions");
        std::fs::create_dir_all(&sessions).unwrap();
        std::fs::write(sessions.join(format!("{}.json", key)), b"{\"key\": 12,").unwrap();
        assert!(matches!(
            h.orchestrator.sessions().load(&key).await,
            Err(Error::StateCorrupt { .. })
        ));

        let result = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default())
            .await
            .unwrap();

        assert_eq!(result.resumed_from, 0);
        let starts: Vec<u64> = h.drive.sent_chunks().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0, MIB]);
        assert_eq!(
            h.drive.file_content(&result.file_id).unwrap(),
            std::fs::read(&path).unwrap()
        );
        assert!(h.orchestrator.sessions().load(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_credential_mid_transfer_is_renewed_once() {
        let h = Harness::new(MIB);
        let path = h.write("long.bin", 3 * MIB, 6);

        h.orchestrator.tokens().credential(AuthProfile::Cli).await.unwrap();
        h.drive.expire_issued_tokens();

        let result = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default())
            .await
            .unwrap();

        assert_eq!(h.drive.auth_calls().refreshes, 1);
        assert_eq!(
            h.drive.file_content(&result.file_id).unwrap(),
            std::fs::read(&path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_cancelled_upload_reports_pause() {
        let h = Harness::new(MIB);
        let path = h.write("slow.bin", 2 * MIB, 7);
        let control = TransferControl::default();
        control.cancel.cancel();

        let err = h
            .orchestrator
            .upload(&path, UploadOptions::default(), control)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { committed: 0, total } if total == 2 * MIB));

        let saved = h.orchestrator.sessions().list().await.unwrap();
        assert_eq!(saved[0].status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn test_download_resumes_after_interruption() {
        let h = Harness::new(MIB);
        let content: Vec<u8> = (0..(5 * MIB / 2)).map(|i| (i % 13) as u8).collect();
        let file_id = h.drive.add_file("movie.mkv", content.clone());
        let output = h.out("movie.mkv");
        let options = DownloadOptions {
            output: Some(output.clone()),
            ..DownloadOptions::default()
        };

        h.drive.hang_on_fetch(Some(1));
        tokio::select! {
            _ = h.orchestrator.download(&file_id, options.clone(), TransferControl::default()) => {
                panic!("download should hang");
            }
            _ = h.drive.wait_for_hang() => {}
        }
        h.drive.hang_on_fetch(None);

        let result = h
            .orchestrator
            .download(&file_id, options, TransferControl::default())
            .await
            .unwrap();

        assert_eq!(result.resumed_from, MIB);
        assert_eq!(std::fs::read(&output).unwrap(), content);
        let starts: Vec<u64> = h.drive.fetched_ranges().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0, MIB, 2 * MIB]);
    }

    #[tokio::test]
    async fn test_download_restarts_when_remote_changes() {
        let h = Harness::new(MIB);
        let file_id = h.drive.add_file("data.bin", vec![1u8; (2 * MIB) as usize]);
        let options = DownloadOptions {
            output: Some(h.out("data.bin")),
            ..DownloadOptions::default()
        };

        h.drive.hang_on_fetch(Some(1));
        tokio::select! {
            _ = h.orchestrator.download(&file_id, options.clone(), TransferControl::default()) => {
                panic!("download should hang");
            }
            _ = h.drive.wait_for_hang() => {}
        }
        h.drive.hang_on_fetch(None);
        h.drive.replace_content(&file_id, vec![2u8; (2 * MIB) as usize]);

        let result = h
            .orchestrator
            .download(&file_id, options, TransferControl::default())
            .await
            .unwrap();
        assert_eq!(result.resumed_from, 0);
        assert!(std::fs::read(h.out("data.bin")).unwrap().iter().all(|&b| b == 2));
    }

    #[tokio::test]
    async fn test_download_not_resumable_discards_partial() {
        let h = Harness::new(MIB);
        let file_id = h.drive.add_file("data.bin", vec![3u8; (2 * MIB) as usize]);
        let options = DownloadOptions {
            output: Some(h.out("data.bin")),
            ..DownloadOptions::default()
        };

        h.drive.hang_on_fetch(Some(1));
        tokio::select! {
            _ = h.orchestrator.download(&file_id, options.clone(), TransferControl::default()) => {
                panic!("download should hang");
            }
            _ = h.drive.wait_for_hang() => {}
        }
        h.drive.hang_on_fetch(None);

        let result = h
            .orchestrator
            .download(
                &file_id,
                DownloadOptions {
                    resumable: false,
                    ..options
                },
                TransferControl::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.resumed_from, 0);
    }

    #[tokio::test]
    async fn test_download_refuses_to_overwrite_without_force() {
        let h = Harness::new(MIB);
        let file_id = h.drive.add_file("report.txt", b"new".to_vec());
        let output = h.out("report.txt");
        std::fs::write(&output, b"old").unwrap();
        let options = DownloadOptions {
            output: Some(output.clone()),
            ..DownloadOptions::default()
        };

        let err = h
            .orchestrator
            .download(&file_id, options.clone(), TransferControl::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(std::fs::read(&output).unwrap(), b"old");

        h.orchestrator
            .download(
                &file_id,
                DownloadOptions {
                    force: true,
                    ..options
                },
                TransferControl::default(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_download_into_directory_uses_remote_name() {
        let h = Harness::new(MIB);
        let file_id = h.drive.add_file("notes.md", b"# hi".to_vec());
        let options = DownloadOptions {
            output: Some(h.dir.path().to_path_buf()),
            ..DownloadOptions::default()
        };

        let result = h
            .orchestrator
            .download(&file_id, options, TransferControl::default())
            .await
            .unwrap();
        assert_eq!(result.path.file_name().unwrap(), "notes.md");
        assert_eq!(std::fs::read(result.path).unwrap(), b"# hi");
    }

    #[tokio::test]
    async fn test_google_native_document_is_rejected() {
        let h = Harness::new(MIB);
        let file_id = h.drive.add_file("Budget", Vec::new());
        h.drive
            .set_mime_type(&file_id, "application/vnd.google-apps.spreadsheet");

        let err = h
            .orchestrator
            .download(&file_id, DownloadOptions::default(), TransferControl::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_fatal_upload_failure_discards_session() {
        let h = Harness::new(MIB);
        let path = h.write("gone.bin", 2 * MIB, 8);
        h.drive.push_faults([Fault::AccessDenied]);

        let err = h
            .orchestrator
            .upload(&path, UploadOptions::default(), TransferControl::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer(TransferError::PermissionDenied(_))
        ));
        assert!(h.orchestrator.sessions().list().await.unwrap().is_empty());
    }

    #[test]
    fn test_upload_target_is_order_independent() {
        assert_eq!(
            TransferOrchestrator::<FakeDrive>::upload_target(&[]),
            "root"
        );
        assert_eq!(
            TransferOrchestrator::<FakeDrive>::upload_target(&["b".to_string(), "a".to_string()]),
            TransferOrchestrator::<FakeDrive>::upload_target(&["a".to_string(), "b".to_string()])
        );
    }
}
