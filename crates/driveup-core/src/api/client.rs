//! Drive v3 REST client.
//!
//! `DriveClient` implements [`DriveTransport`] against the public Drive API
//! and [`AuthTransport`](super::AuthTransport) against Google's OAuth
//! endpoints (see `oauth.rs`). It holds no credential of its own; every call
//! carries the bearer token it should use.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::header::{self, HeaderValue};
use reqwest::{Body, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::oauth::{AuthPrompt, OAuthClient};
use super::{ApiError, DriveTransport};
use crate::auth::Credential;
use crate::models::{FileMetadata, GrantType, Permission, Role, ShareRequest, UploadMetadata};
use crate::transfer::{Activity, ChunkAck, ChunkRange};

// ============================================================================
// Constants
// ============================================================================

/// Base URL for metadata, permission and media requests
const API_BASE_URL: &str = "https://www.googleapis.com/drive/v3";

/// Base URL for upload requests
const UPLOAD_BASE_URL: &str = "https://www.googleapis.com/upload/drive/v3";

/// Timeout for metadata, permission and token requests in seconds.
/// Chunk requests are bounded by the scheduler's idle watchdog instead.
pub(super) const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Connection establishment timeout in seconds
const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Upload bodies are streamed in frames of this size so the idle watchdog
/// sees progress while a chunk is on the wire
const UPLOAD_FRAME_SIZE: usize = 64 * 1024;

/// Permissions requested per page when listing grants
const PERMISSION_PAGE_SIZE: &str = "100";

/// "Resume Incomplete": Drive's answer to a chunk that did not finish the upload
const RESUME_INCOMPLETE: u16 = 308;

const FILE_FIELDS: &str = "id,name,size,mimeType,md5Checksum,modifiedTime";
const PERMISSION_FIELDS: &str = "id,role,type,emailAddress,domain,allowFileDiscovery";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadBody<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    parents: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    id: String,
    #[serde(default)]
    name: String,
    /// Drive encodes int64 fields as strings; absent for native documents.
    size: Option<String>,
    mime_type: Option<String>,
    md5_checksum: Option<String>,
    modified_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PermissionBody<'a> {
    role: Role,
    #[serde(rename = "type")]
    grant_type: GrantType,
    #[serde(skip_serializing_if = "Option::is_none")]
    email_address: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allow_file_discovery: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionPage {
    #[serde(default)]
    permissions: Vec<Permission>,
    next_page_token: Option<String>,
}

/// Drive API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct DriveClient {
    client: Client,
    oauth: OAuthClient,
    prompt: Arc<dyn AuthPrompt>,
}

impl DriveClient {
    /// Create a client for the OAuth application `oauth`. `prompt` is shown
    /// the device code or authorization URL during interactive flows.
    pub fn new(oauth: OAuthClient, prompt: Arc<dyn AuthPrompt>) -> Result<Self, ApiError> {
        // Redirects stay off so a 308 from the upload endpoint reaches us.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            oauth,
            prompt,
        })
    }

    pub(super) fn http(&self) -> &Client {
        &self.client
    }

    pub(super) fn oauth(&self) -> &OAuthClient {
        &self.oauth
    }

    pub(super) fn prompt(&self) -> &dyn AuthPrompt {
        self.prompt.as_ref()
    }

    /// Check if response is successful, returning an error with body if not.
    pub(super) async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    fn file_url(file_id: &str) -> String {
        format!("{}/files/{}", API_BASE_URL, file_id)
    }

    /// Interpret the answer to a chunk or commit request.
    async fn read_upload_ack(response: Response) -> Result<ChunkAck, ApiError> {
        if response.status().as_u16() == RESUME_INCOMPLETE {
            let committed = parse_committed(response.headers().get(header::RANGE))?;
            return Ok(ChunkAck::Partial { committed });
        }
        let response = Self::check_response(response).await?;
        let created: CreatedFile = response.json().await?;
        Ok(ChunkAck::Complete {
            file_id: created.id,
        })
    }
}

/// Committed byte count from a resumable upload `Range` header
/// (`bytes=0-N` means N+1 bytes). No header means nothing was kept.
fn parse_committed(value: Option<&HeaderValue>) -> Result<u64, ApiError> {
    let Some(value) = value else {
        return Ok(0);
    };
    let invalid = || ApiError::InvalidResponse(format!("unparseable Range header {:?}", value));
    let text = value.to_str().map_err(|_| invalid())?;
    let last = text
        .trim()
        .strip_prefix("bytes=")
        .and_then(|r| r.split_once('-'))
        .map(|(_, end)| end)
        .ok_or_else(invalid)?;
    let last: u64 = last.trim().parse().map_err(|_| invalid())?;
    Ok(last + 1)
}

/// Request body that yields `bytes` in frames, marking `activity` as each
/// frame is handed to the connection.
fn framed_body(bytes: Vec<u8>, activity: Activity) -> Body {
    let frames: Vec<Result<Vec<u8>, io::Error>> = bytes
        .chunks(UPLOAD_FRAME_SIZE)
        .map(|frame| Ok(frame.to_vec()))
        .collect();
    Body::wrap_stream(futures::stream::iter(frames).inspect(move |_| activity.touch()))
}

fn file_metadata(resource: FileResource) -> Result<FileMetadata, ApiError> {
    let size = match resource.size {
        Some(ref s) => s
            .parse()
            .map_err(|_| ApiError::InvalidResponse(format!("file size '{}' is not a number", s)))?,
        None => 0,
    };
    let accepts_ranges = !FileMetadata::is_google_native(resource.mime_type.as_deref());

    Ok(FileMetadata {
        id: resource.id,
        name: resource.name,
        size,
        mime_type: resource.mime_type,
        md5_checksum: resource.md5_checksum,
        modified_time: resource.modified_time,
        accepts_ranges,
    })
}

impl DriveTransport for DriveClient {
    fn open_upload_session(
        &self,
        credential: &Credential,
        metadata: &UploadMetadata,
    ) -> impl std::future::Future<Output = Result<String, ApiError>> + Send {
        let url = format!("{}/files", UPLOAD_BASE_URL);
        let body = UploadBody {
            name: &metadata.name,
            parents: &metadata.parents,
            description: metadata.description.as_deref(),
            mime_type: metadata.mime_type.as_deref(),
        };
        let request = self
            .client
            .post(url)
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", "id"),
            ])
            .bearer_auth(&credential.access_token)
            .header("X-Upload-Content-Length", metadata.size)
            .header(
                "X-Upload-Content-Type",
                metadata
                    .mime_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(&body);

        async move {
            let response = Self::check_response(request.send().await?).await?;
            let location = response
                .headers()
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    ApiError::InvalidResponse("upload session has no Location header".to_string())
                })?;
            debug!("Opened resumable upload session");
            Ok(location.to_string())
        }
    }

    fn send_chunk(
        &self,
        credential: &Credential,
        handle: &str,
        range: ChunkRange,
        total: u64,
        bytes: Vec<u8>,
        activity: &Activity,
    ) -> impl std::future::Future<Output = Result<ChunkAck, ApiError>> + Send {
        let request = self
            .client
            .put(handle)
            .bearer_auth(&credential.access_token)
            .header(header::CONTENT_RANGE, range.content_range_header(total))
            .header(header::CONTENT_LENGTH, bytes.len())
            .body(framed_body(bytes, activity.clone()));
        let activity = activity.clone();

        async move {
            let response = request.send().await?;
            activity.touch();
            Self::read_upload_ack(response).await
        }
    }

    fn commit_upload(
        &self,
        credential: &Credential,
        handle: &str,
        total: u64,
    ) -> impl std::future::Future<Output = Result<String, ApiError>> + Send {
        let request = self
            .client
            .put(handle)
            .bearer_auth(&credential.access_token)
            .header(header::CONTENT_RANGE, format!("bytes */{}", total))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .body(Vec::new());

        async move {
            match Self::read_upload_ack(request.send().await?).await? {
                ChunkAck::Complete { file_id } => Ok(file_id),
                ChunkAck::Partial { committed } => Err(ApiError::InvalidResponse(format!(
                    "upload incomplete: remote holds {} of {} bytes",
                    committed, total
                ))),
            }
        }
    }

    fn get_file_metadata(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> impl std::future::Future<Output = Result<FileMetadata, ApiError>> + Send {
        let request = self
            .client
            .get(Self::file_url(file_id))
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
            .bearer_auth(&credential.access_token)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));

        async move {
            let response = Self::check_response(request.send().await?).await?;
            let resource: FileResource = response.json().await?;
            file_metadata(resource)
        }
    }

    fn fetch_range(
        &self,
        credential: &Credential,
        file_id: &str,
        range: ChunkRange,
        activity: &Activity,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, ApiError>> + Send {
        let request = self
            .client
            .get(Self::file_url(file_id))
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .bearer_auth(&credential.access_token)
            .header(header::RANGE, range.range_header());
        let activity = activity.clone();

        async move {
            let response = Self::check_response(request.send().await?).await?;
            activity.touch();
            if response.status() != StatusCode::PARTIAL_CONTENT && range.start > 0 {
                return Err(ApiError::InvalidResponse(
                    "server ignored the requested byte range".to_string(),
                ));
            }

            let expected = range.len();
            let mut body = Vec::with_capacity(expected as usize);
            let mut stream = response.bytes_stream();
            while let Some(item) = stream.next().await {
                let bytes = item?;
                activity.touch();
                // A 200 carries the whole file; keep only what was asked for.
                let room = expected as usize - body.len();
                body.extend_from_slice(&bytes[..bytes.len().min(room)]);
                if body.len() as u64 == expected {
                    break;
                }
            }

            if (body.len() as u64) < expected {
                return Err(ApiError::Truncated {
                    expected,
                    actual: body.len() as u64,
                });
            }
            Ok(body)
        }
    }

    fn create_permission(
        &self,
        credential: &Credential,
        file_id: &str,
        request: &ShareRequest,
    ) -> impl std::future::Future<Output = Result<Permission, ApiError>> + Send {
        let body = PermissionBody {
            role: request.role,
            grant_type: request.grant_type,
            email_address: request.email.as_deref(),
            domain: request.domain.as_deref(),
            allow_file_discovery: request.allows_discovery().then_some(request.discoverable),
        };
        let mut query = vec![
            ("supportsAllDrives", "true"),
            ("fields", PERMISSION_FIELDS),
        ];
        if request.role == Role::Owner {
            query.push(("transferOwnership", "true"));
        }
        if request.grant_type.requires_email() {
            query.push(("sendNotificationEmail", "false"));
        }
        let request = self
            .client
            .post(format!("{}/permissions", Self::file_url(file_id)))
            .query(&query)
            .bearer_auth(&credential.access_token)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(&body);

        async move {
            let response = Self::check_response(request.send().await?).await?;
            Ok(response.json().await?)
        }
    }

    fn list_permissions(
        &self,
        credential: &Credential,
        file_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Permission>, ApiError>> + Send {
        let url = format!("{}/permissions", Self::file_url(file_id));
        let fields = format!("nextPageToken,permissions({})", PERMISSION_FIELDS);
        let client = self.client.clone();
        let token = credential.access_token.clone();

        async move {
            let mut permissions = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let mut query = vec![
                    ("supportsAllDrives", "true"),
                    ("pageSize", PERMISSION_PAGE_SIZE),
                    ("fields", fields.as_str()),
                ];
                if let Some(ref t) = page_token {
                    query.push(("pageToken", t.as_str()));
                }

                let response = client
                    .get(&url)
                    .query(&query)
                    .bearer_auth(&token)
                    .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                    .send()
                    .await?;
                let page: PermissionPage = Self::check_response(response).await?.json().await?;
                permissions.extend(page.permissions);

                match page.next_page_token {
                    Some(next) if !next.is_empty() => page_token = Some(next),
                    _ => break,
                }
            }
            Ok(permissions)
        }
    }

    fn delete_permission(
        &self,
        credential: &Credential,
        file_id: &str,
        permission_id: &str,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send {
        let request = self
            .client
            .delete(format!(
                "{}/permissions/{}",
                Self::file_url(file_id),
                permission_id
            ))
            .query(&[("supportsAllDrives", "true")])
            .bearer_auth(&credential.access_token)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));

        async move {
            Self::check_response(request.send().await?).await?;
            Ok(())
        }
    }
}
