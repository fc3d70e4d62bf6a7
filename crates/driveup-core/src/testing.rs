//! In-memory Drive used by unit tests.
//!
//! Implements both transport traits over plain collections guarded by a
//! std mutex. Faults are injected per call; a call can also be made to hang
//! forever so tests can drop the transfer future mid-chunk.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use crate::api::{ApiError, AuthTransport, DriveTransport};
use crate::auth::{AuthProfile, Credential};
use crate::models::{FileMetadata, GrantType, Permission, Role, ShareRequest, UploadMetadata};
use crate::transfer::{Activity, ChunkAck, ChunkRange};

/// Failure to return from the next data-plane call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    ServerError,
    RateLimited,
    Timeout,
    Unauthorized,
    SessionGone,
    AccessDenied,
}

impl Fault {
    fn into_error(self) -> ApiError {
        match self {
            Fault::ServerError => ApiError::ServerError("injected".to_string()),
            Fault::RateLimited => ApiError::RateLimited,
            Fault::Timeout => ApiError::Timeout,
            Fault::Unauthorized => ApiError::Unauthorized,
            Fault::SessionGone => ApiError::SessionGone("injected".to_string()),
            Fault::AccessDenied => ApiError::AccessDenied("injected".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AuthCalls {
    pub exchanges: u32,
    pub refreshes: u32,
    pub revocations: u32,
}

struct StoredFile {
    metadata: FileMetadata,
    content: Vec<u8>,
}

struct OpenUpload {
    metadata: UploadMetadata,
    received: Vec<u8>,
    file_id: Option<String>,
}

struct State {
    files: HashMap<String, StoredFile>,
    uploads: HashMap<String, OpenUpload>,
    permissions: HashMap<String, Vec<Permission>>,
    sent: Vec<ChunkRange>,
    fetched: Vec<ChunkRange>,
    faults: VecDeque<Fault>,
    send_calls: usize,
    fetch_calls: usize,
    hang_on_send: Option<usize>,
    hang_on_fetch: Option<usize>,
    trickle: Option<Trickle>,
    expire_on_send: Option<usize>,
    ack_limit: Option<u64>,
    failing_deletes: HashSet<String>,
    next_id: u64,
    auth: AuthCalls,
    token_lifetime: i64,
    reject_refresh: bool,
    fail_revocation: bool,
    deny_authorization: bool,
    expire_tokens_issued_before: Option<u64>,
}

/// Deliver data-plane bodies in `steps` slices, `pause` apart.
#[derive(Debug, Clone, Copy)]
struct Trickle {
    steps: u32,
    pause: Duration,
}

enum Outcome<T> {
    Ready(Result<T, ApiError>),
    Hang,
}

impl<T> Outcome<T> {
    async fn resolve(
        self,
        hung: Arc<Notify>,
        trickle: Option<Trickle>,
        activity: Activity,
    ) -> Result<T, ApiError> {
        match self {
            Outcome::Ready(result) => {
                if let Some(trickle) = trickle {
                    for _ in 0..trickle.steps {
                        tokio::time::sleep(trickle.pause).await;
                        activity.touch();
                    }
                }
                result
            }
            Outcome::Hang => {
                hung.notify_one();
                std::future::pending().await
            }
        }
    }
}

pub(crate) struct FakeDrive {
    state: Mutex<State>,
    hung: Arc<Notify>,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                files: HashMap::new(),
                uploads: HashMap::new(),
                permissions: HashMap::new(),
                sent: Vec::new(),
                fetched: Vec::new(),
                faults: VecDeque::new(),
                send_calls: 0,
                fetch_calls: 0,
                hang_on_send: None,
                hang_on_fetch: None,
                trickle: None,
                expire_on_send: None,
                ack_limit: None,
                failing_deletes: HashSet::new(),
                next_id: 0,
                auth: AuthCalls::default(),
                token_lifetime: 3600,
                reject_refresh: false,
                fail_revocation: false,
                deny_authorization: false,
                expire_tokens_issued_before: None,
            }),
            hung: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    // ---- auth controls -------------------------------------------------

    pub fn auth_calls(&self) -> AuthCalls {
        self.state().auth
    }

    pub fn set_token_lifetime(&self, secs: i64) {
        self.state().token_lifetime = secs;
    }

    pub fn reject_refresh(&self, reject: bool) {
        self.state().reject_refresh = reject;
    }

    pub fn fail_revocation(&self, fail: bool) {
        self.state().fail_revocation = fail;
    }

    pub fn deny_authorization(&self, deny: bool) {
        self.state().deny_authorization = deny;
    }

    /// Reject every access token issued so far with 401 on data calls.
    pub fn expire_issued_tokens(&self) {
        let mut state = self.state();
        state.expire_tokens_issued_before = Some(state.next_id);
    }

    // ---- data controls -------------------------------------------------

    /// Store a downloadable file and return its id.
    pub fn add_file(&self, name: &str, content: Vec<u8>) -> String {
        let mut state = self.state();
        let id = Self::next_id(&mut state, "file");
        let metadata = Self::describe(&id, name, &content);
        state.files.insert(id.clone(), StoredFile { metadata, content });
        state.permissions.insert(id.clone(), vec![Self::owner_grant()]);
        id
    }

    /// Replace a stored file's content, producing a new revision.
    pub fn replace_content(&self, file_id: &str, content: Vec<u8>) {
        let mut state = self.state();
        if let Some(file) = state.files.get_mut(file_id) {
            file.metadata = Self::describe(file_id, &file.metadata.name, &content);
            file.content = content;
        }
    }

    pub fn set_mime_type(&self, file_id: &str, mime: &str) {
        if let Some(file) = self.state().files.get_mut(file_id) {
            file.metadata.mime_type = Some(mime.to_string());
        }
    }

    pub fn disable_ranges(&self, file_id: &str) {
        if let Some(file) = self.state().files.get_mut(file_id) {
            file.metadata.accepts_ranges = false;
        }
    }

    pub fn file_content(&self, file_id: &str) -> Option<Vec<u8>> {
        self.state().files.get(file_id).map(|f| f.content.clone())
    }

    pub fn file_count(&self) -> usize {
        self.state().files.len()
    }

    pub fn upload_sessions_opened(&self) -> usize {
        self.state().uploads.len()
    }

    /// Ranges accepted by `send_chunk`, in call order.
    pub fn sent_chunks(&self) -> Vec<ChunkRange> {
        self.state().sent.clone()
    }

    /// Ranges served by `fetch_range`, in call order.
    pub fn fetched_ranges(&self) -> Vec<ChunkRange> {
        self.state().fetched.clone()
    }

    pub fn push_faults(&self, faults: impl IntoIterator<Item = Fault>) {
        self.state().faults.extend(faults);
    }

    /// Make the `n`th (0-based) `send_chunk` call never complete.
    pub fn hang_on_send(&self, n: Option<usize>) {
        self.state().hang_on_send = n;
    }

    /// Make the `n`th (0-based) `fetch_range` call never complete.
    pub fn hang_on_fetch(&self, n: Option<usize>) {
        self.state().hang_on_fetch = n;
    }

    /// Spread every chunk body over `steps` slices `pause` apart. Bytes keep
    /// moving, but the whole call takes `steps * pause`.
    pub fn trickle(&self, steps: u32, pause: Duration) {
        self.state().trickle = Some(Trickle { steps, pause });
    }

    /// Reject every access token issued so far, starting with the `n`th
    /// (0-based) `send_chunk` call.
    pub fn expire_tokens_on_send(&self, n: Option<usize>) {
        self.state().expire_on_send = n;
    }

    /// Keep at most `limit` bytes of each received chunk.
    pub fn limit_ack(&self, limit: Option<u64>) {
        self.state().ack_limit = limit;
    }

    pub fn add_permission(&self, file_id: &str, permission: Permission) {
        self.state()
            .permissions
            .entry(file_id.to_string())
            .or_default()
            .push(permission);
    }

    pub fn permissions(&self, file_id: &str) -> Vec<Permission> {
        self.state()
            .permissions
            .get(file_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_permission_delete(&self, permission_id: &str) {
        self.state()
            .failing_deletes
            .insert(permission_id.to_string());
    }

    /// Resolves once a call configured to hang has been reached.
    pub async fn wait_for_hang(&self) {
        self.hung.notified().await
    }

    // ---- internals -----------------------------------------------------

    fn next_id(state: &mut State, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }

    fn describe(id: &str, name: &str, content: &[u8]) -> FileMetadata {
        FileMetadata {
            id: id.to_string(),
            name: name.to_string(),
            size: content.len() as u64,
            mime_type: Some("application/octet-stream".to_string()),
            md5_checksum: Some(hex::encode(&Sha256::digest(content)[..16])),
            modified_time: Some(Utc::now()),
            accepts_ranges: true,
        }
    }

    fn owner_grant() -> Permission {
        Permission {
            id: "owner".to_string(),
            role: Role::Owner,
            grant_type: GrantType::User,
            email_address: Some("me@example.com".to_string()),
            domain: None,
            allow_file_discovery: None,
        }
    }

    fn check_token(state: &State, credential: &Credential) -> Result<(), ApiError> {
        let serial = credential
            .access_token
            .rsplit('-')
            .next()
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0);
        match state.expire_tokens_issued_before {
            Some(cutoff) if serial <= cutoff => Err(ApiError::Unauthorized),
            _ => Ok(()),
        }
    }

    fn take_fault(state: &mut State) -> Option<ApiError> {
        state.faults.pop_front().map(Fault::into_error)
    }

    /// Refresh responses carry no new refresh token, like Google's.
    fn issue(state: &mut State, profile: AuthProfile, refreshing: bool) -> Credential {
        let access = Self::next_id(state, "access");
        let refresh_token = if refreshing {
            None
        } else {
            Some(Self::next_id(state, "refresh"))
        };
        Credential::issued(
            profile,
            access,
            state.token_lifetime,
            refresh_token,
            Some(profile.scope().to_string()),
        )
    }

    fn do_send(
        &self,
        credential: &Credential,
        handle: &str,
        range: ChunkRange,
        total: u64,
        bytes: Vec<u8>,
    ) -> Outcome<ChunkAck> {
        let mut state = self.state();
        let call = state.send_calls;
        state.send_calls += 1;
        if state.hang_on_send == Some(call) {
            return Outcome::Hang;
        }
        if state.expire_on_send == Some(call) {
            state.expire_tokens_issued_before = Some(state.next_id);
        }
        if let Err(e) = Self::check_token(&state, credential) {
            return Outcome::Ready(Err(e));
        }
        if let Some(e) = Self::take_fault(&mut state) {
            return Outcome::Ready(Err(e));
        }

        let limit = state.ack_limit;
        let upload = match state.uploads.get_mut(handle) {
            Some(upload) => upload,
            None => return Outcome::Ready(Err(ApiError::SessionGone(handle.to_string()))),
        };
        if range.start > upload.received.len() as u64 {
            let committed = upload.received.len() as u64;
            return Outcome::Ready(Ok(ChunkAck::Partial { committed }));
        }

        upload.received.truncate(range.start as usize);
        let keep = limit.map(|l| l.min(bytes.len() as u64)).unwrap_or(bytes.len() as u64);
        upload.received.extend_from_slice(&bytes[..keep as usize]);
        let committed = upload.received.len() as u64;
        state.sent.push(ChunkRange::new(range.start, range.start + keep));

        if committed == total {
            let file_id = self.finish_upload(&mut state, handle);
            Outcome::Ready(Ok(ChunkAck::Complete { file_id }))
        } else {
            Outcome::Ready(Ok(ChunkAck::Partial { committed }))
        }
    }

    fn finish_upload(&self, state: &mut State, handle: &str) -> String {
        let file_id = Self::next_id(state, "file");
        let Some(upload) = state.uploads.get_mut(handle) else {
            return file_id;
        };
        if let Some(ref existing) = upload.file_id {
            return existing.clone();
        }
        upload.file_id = Some(file_id.clone());
        let content = upload.received.clone();
        let name = upload.metadata.name.clone();
        let metadata = Self::describe(&file_id, &name, &content);
        state.files.insert(file_id.clone(), StoredFile { metadata, content });
        state
            .permissions
            .insert(file_id.clone(), vec![Self::owner_grant()]);
        file_id
    }

    fn do_fetch(&self, credential: &Credential, file_id: &str, range: ChunkRange) -> Outcome<Vec<u8>> {
        let mut state = self.state();
        let call = state.fetch_calls;
        state.fetch_calls += 1;
        if state.hang_on_fetch == Some(call) {
            return Outcome::Hang;
        }
        if let Err(e) = Self::check_token(&state, credential) {
            return Outcome::Ready(Err(e));
        }
        if let Some(e) = Self::take_fault(&mut state) {
            return Outcome::Ready(Err(e));
        }
        let Some(file) = state.files.get(file_id) else {
            return Outcome::Ready(Err(ApiError::NotFound(file_id.to_string())));
        };
        let end = (range.end as usize).min(file.content.len());
        let start = (range.start as usize).min(end);
        let bytes = file.content[start..end].to_vec();
        state.fetched.push(range);
        Outcome::Ready(Ok(bytes))
    }
}

impl DriveTransport for FakeDrive {
    fn open_upload_session(
        &self,
        credential: &Credential,
        metadata: &UploadMetadata,
    ) -> impl Future<Output = Result<String, ApiError>> + Send {
        let result = {
            let mut state = self.state();
            Self::check_token(&state, credential).and_then(|()| {
                let handle = format!("fake://upload/{}", Self::next_id(&mut state, "session"));
                state.uploads.insert(
                    handle.clone(),
                    OpenUpload {
                        metadata: metadata.clone(),
                        received: Vec::new(),
                        file_id: None,
                    },
                );
                Ok(handle)
            })
        };
        async move { result }
    }

    fn send_chunk(
        &self,
        credential: &Credential,
        handle: &str,
        range: ChunkRange,
        total: u64,
        bytes: Vec<u8>,
        activity: &Activity,
    ) -> impl Future<Output = Result<ChunkAck, ApiError>> + Send {
        let outcome = self.do_send(credential, handle, range, total, bytes);
        let trickle = self.state().trickle;
        outcome.resolve(self.hung.clone(), trickle, activity.clone())
    }

    fn commit_upload(
        &self,
        credential: &Credential,
        handle: &str,
        total: u64,
    ) -> impl Future<Output = Result<String, ApiError>> + Send {
        let result = {
            let mut state = self.state();
            match Self::check_token(&state, credential) {
                Err(e) => Err(e),
                Ok(()) => match state.uploads.get(handle) {
                    None => Err(ApiError::SessionGone(handle.to_string())),
                    Some(upload) if upload.received.len() as u64 != total => {
                        Err(ApiError::InvalidResponse(format!(
                            "upload incomplete: {} of {} bytes",
                            upload.received.len(),
                            total
                        )))
                    }
                    Some(_) => Ok(self.finish_upload(&mut state, handle)),
                },
            }
        };
        async move { result }
    }

    fn get_file_metadata(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> impl Future<Output = Result<FileMetadata, ApiError>> + Send {
        let result = {
            let state = self.state();
            Self::check_token(&state, credential).and_then(|()| {
                state
                    .files
                    .get(file_id)
                    .map(|f| f.metadata.clone())
                    .ok_or_else(|| ApiError::NotFound(file_id.to_string()))
            })
        };
        async move { result }
    }

    fn fetch_range(
        &self,
        credential: &Credential,
        file_id: &str,
        range: ChunkRange,
        activity: &Activity,
    ) -> impl Future<Output = Result<Vec<u8>, ApiError>> + Send {
        let outcome = self.do_fetch(credential, file_id, range);
        let trickle = self.state().trickle;
        outcome.resolve(self.hung.clone(), trickle, activity.clone())
    }

    fn create_permission(
        &self,
        credential: &Credential,
        file_id: &str,
        request: &ShareRequest,
    ) -> impl Future<Output = Result<Permission, ApiError>> + Send {
        let result = {
            let mut state = self.state();
            match Self::check_token(&state, credential) {
                Err(e) => Err(e),
                Ok(()) if !state.files.contains_key(file_id) => {
                    Err(ApiError::NotFound(file_id.to_string()))
                }
                Ok(()) => {
                    let permission = Permission {
                        id: Self::next_id(&mut state, "perm"),
                        role: request.role,
                        grant_type: request.grant_type,
                        email_address: request.email.clone(),
                        domain: request.domain.clone(),
                        allow_file_discovery: request
                            .allows_discovery()
                            .then_some(request.discoverable),
                    };
                    state
                        .permissions
                        .entry(file_id.to_string())
                        .or_default()
                        .push(permission.clone());
                    Ok(permission)
                }
            }
        };
        async move { result }
    }

    fn list_permissions(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> impl Future<Output = Result<Vec<Permission>, ApiError>> + Send {
        let result = {
            let state = self.state();
            Self::check_token(&state, credential).and_then(|()| {
                state
                    .permissions
                    .get(file_id)
                    .cloned()
                    .ok_or_else(|| ApiError::NotFound(file_id.to_string()))
            })
        };
        async move { result }
    }

    fn delete_permission(
        &self,
        credential: &Credential,
        file_id: &str,
        permission_id: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        let result = {
            let mut state = self.state();
            match Self::check_token(&state, credential) {
                Err(e) => Err(e),
                Ok(()) if state.failing_deletes.contains(permission_id) => {
                    Err(ApiError::AccessDenied(permission_id.to_string()))
                }
                Ok(()) => match state.permissions.get_mut(file_id) {
                    Some(grants) => {
                        grants.retain(|p| p.id != permission_id);
                        Ok(())
                    }
                    None => Err(ApiError::NotFound(file_id.to_string())),
                },
            }
        };
        async move { result }
    }
}

impl AuthTransport for FakeDrive {
    fn exchange_auth_code(
        &self,
        profile: AuthProfile,
    ) -> impl Future<Output = Result<Credential, ApiError>> + Send {
        let result = {
            let mut state = self.state();
            if state.deny_authorization {
                Err(ApiError::OAuth {
                    code: "access_denied".to_string(),
                    description: "The user denied access".to_string(),
                })
            } else {
                state.auth.exchanges += 1;
                Ok(Self::issue(&mut state, profile, false))
            }
        };
        async move { result }
    }

    fn refresh_credential(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<Credential, ApiError>> + Send {
        let result = {
            let mut state = self.state();
            if state.reject_refresh {
                Err(ApiError::OAuth {
                    code: "invalid_grant".to_string(),
                    description: "Token has been expired or revoked.".to_string(),
                })
            } else {
                state.auth.refreshes += 1;
                Ok(Self::issue(&mut state, credential.profile, true))
            }
        };
        async move { result }
    }

    fn revoke_credential(
        &self,
        _credential: &Credential,
    ) -> impl Future<Output = Result<(), ApiError>> + Send {
        let result = {
            let mut state = self.state();
            state.auth.revocations += 1;
            if state.fail_revocation {
                Err(ApiError::ServerError("revocation endpoint down".to_string()))
            } else {
                Ok(())
            }
        };
        async move { result }
    }
}
