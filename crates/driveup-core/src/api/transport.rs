//! Remote contracts the core depends on.
//!
//! `DriveClient` implements both traits over the Drive v3 REST API; tests use
//! an in-memory fake. Every method takes the credential explicitly so a
//! transport never caches auth state of its own.

use std::future::Future;

use super::ApiError;
use crate::auth::{AuthProfile, Credential};
use crate::models::{FileMetadata, Permission, ShareRequest, UploadMetadata};
use crate::transfer::{Activity, ChunkAck, ChunkRange};

pub trait DriveTransport: Send + Sync {
    /// Open a resumable upload session and return its opaque handle.
    fn open_upload_session(
        &self,
        credential: &Credential,
        metadata: &UploadMetadata,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;

    /// Send `bytes` as `range` of a `total`-byte upload, touching
    /// `activity` as the body goes out.
    fn send_chunk(
        &self,
        credential: &Credential,
        handle: &str,
        range: ChunkRange,
        total: u64,
        bytes: Vec<u8>,
        activity: &Activity,
    ) -> impl Future<Output = Result<ChunkAck, ApiError>> + Send;

    /// Finish an upload whose bytes have all been acknowledged; returns the file id.
    fn commit_upload(
        &self,
        credential: &Credential,
        handle: &str,
        total: u64,
    ) -> impl Future<Output = Result<String, ApiError>> + Send;

    fn get_file_metadata(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> impl Future<Output = Result<FileMetadata, ApiError>> + Send;

    /// Fetch exactly the bytes of `range`, touching `activity` as they arrive.
    fn fetch_range(
        &self,
        credential: &Credential,
        file_id: &str,
        range: ChunkRange,
        activity: &Activity,
    ) -> impl Future<Output = Result<Vec<u8>, ApiError>> + Send;

    fn create_permission(
        &self,
        credential: &Credential,
        file_id: &str,
        request: &ShareRequest,
    ) -> impl Future<Output = Result<Permission, ApiError>> + Send;

    fn list_permissions(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> impl Future<Output = Result<Vec<Permission>, ApiError>> + Send;

    fn delete_permission(
        &self,
        credential: &Credential,
        file_id: &str,
        permission_id: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

pub trait AuthTransport: Send + Sync {
    /// Run the interactive authorization flow for `profile`.
    fn exchange_auth_code(
        &self,
        profile: AuthProfile,
    ) -> impl Future<Output = Result<Credential, ApiError>> + Send;

    fn refresh_credential(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<Credential, ApiError>> + Send;

    fn revoke_credential(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}
