//! Google OAuth 2.0 flows.
//!
//! The `cli` profile uses the device authorization grant: the user types a
//! short code at a verification URL while we poll the token endpoint. The
//! `web` profile uses the authorization code grant with PKCE and a loopback
//! redirect to a one-shot listener on 127.0.0.1.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use reqwest::{Response, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{DriveClient, REQUEST_TIMEOUT_SECS};
use super::{ApiError, AuthTransport};
use crate::auth::{AuthProfile, Credential};

// ============================================================================
// Constants
// ============================================================================

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEVICE_CODE_URL: &str = "https://oauth2.googleapis.com/device/code";
const REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Polling interval when the device code response names none (RFC 8628)
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Added to the polling interval each time the server answers `slow_down`
const SLOW_DOWN_STEP_SECS: u64 = 5;

/// How long the loopback listener waits for the browser redirect.
/// 5 minutes covers a login with two-factor prompts.
const LOOPBACK_TIMEOUT_SECS: u64 = 300;

/// Upper bound on the redirect request we are willing to buffer
const MAX_REDIRECT_REQUEST_BYTES: usize = 16 * 1024;

const SUCCESS_PAGE: &str = "<html><body><h3>driveup is authorized.</h3>\
<p>You can close this window and return to the terminal.</p></body></html>";
const FAILURE_PAGE: &str = "<html><body><h3>Authorization failed.</h3>\
<p>Return to the terminal for details.</p></body></html>";

/// Shows the user what to do during an interactive flow.
pub trait AuthPrompt: Send + Sync {
    /// Device flow: ask the user to enter `user_code` at `verification_url`.
    fn show_device_code(&self, verification_url: &str, user_code: &str);

    /// Browser flow: open (or print) the consent page.
    fn open_authorization_url(&self, url: &str);
}

/// OAuth application registered in the Google Cloud console.
#[derive(Clone)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Option<String>,
}

impl OAuthClient {
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// `client_id` plus `client_secret` when one is configured.
    fn identity(&self) -> Vec<(&'static str, String)> {
        let mut form = vec![("client_id", self.client_id.clone())];
        if let Some(ref secret) = self.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        form
    }
}

impl std::fmt::Debug for OAuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_uri")]
    verification_url: String,
    expires_in: u64,
    #[serde(default = "default_poll_interval")]
    interval: u64,
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// PKCE pair: the verifier stays local, the challenge goes in the URL.
struct Pkce {
    verifier: String,
    challenge: String,
}

impl Pkce {
    fn generate() -> Self {
        Self::from_verifier(random_urlsafe(32))
    }

    fn from_verifier(verifier: String) -> Self {
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn redirect_error(e: io::Error) -> ApiError {
    ApiError::Redirect(e.to_string())
}

/// Decode a token-endpoint response. Client errors carry an OAuth error
/// code (`invalid_grant`, `authorization_pending`, ...) in the body.
async fn read_oauth_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    if response.status().is_success() {
        return Ok(response.json().await?);
    }
    Err(oauth_failure(response).await)
}

async fn oauth_failure(response: Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        if let Ok(err) = serde_json::from_str::<OAuthErrorBody>(&body) {
            return ApiError::OAuth {
                description: err.error_description.unwrap_or_else(|| err.error.clone()),
                code: err.error,
            };
        }
    }
    ApiError::from_status(status, &body)
}

fn into_credential(profile: AuthProfile, token: TokenResponse) -> Credential {
    let mut credential = Credential::issued(
        profile,
        token.access_token,
        token.expires_in,
        token.refresh_token,
        token.scope,
    );
    if let Some(token_type) = token.token_type {
        credential.token_type = token_type;
    }
    credential
}

/// Parse the query of a redirect request target such as `/?code=...&state=...`.
fn redirect_params(target: &str) -> HashMap<String, String> {
    Url::parse(&format!("http://127.0.0.1{}", target))
        .map(|url| url.query_pairs().into_owned().collect())
        .unwrap_or_default()
}

/// Read one HTTP request head and return its target if it is a GET.
async fn read_request_target(stream: &mut TcpStream) -> io::Result<String> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() < MAX_REDIRECT_REQUEST_BYTES {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf);
    let mut parts = head.lines().next().unwrap_or_default().split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(target)) => Ok(target.to_string()),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "not a GET request")),
    }
}

async fn respond(stream: &mut TcpStream, status: &str, page: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        page.len(),
        page
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "Failed to answer redirect request");
    }
    let _ = stream.shutdown().await;
}

/// Accept connections until one carries the authorization response.
async fn await_redirect(listener: &TcpListener, expected_state: &str) -> Result<String, ApiError> {
    loop {
        let (mut stream, peer) = listener.accept().await.map_err(redirect_error)?;
        let target = match read_request_target(&mut stream).await {
            Ok(target) => target,
            Err(e) => {
                debug!(%peer, error = %e, "Ignoring malformed redirect request");
                continue;
            }
        };
        let params = redirect_params(&target);

        if let Some(error) = params.get("error") {
            respond(&mut stream, "200 OK", FAILURE_PAGE).await;
            return Err(ApiError::OAuth {
                code: error.clone(),
                description: "authorization was not granted".to_string(),
            });
        }
        let Some(code) = params.get("code") else {
            // Browsers also ask for /favicon.ico and the like.
            respond(&mut stream, "404 Not Found", "").await;
            continue;
        };
        if params.get("state").map(String::as_str) != Some(expected_state) {
            respond(&mut stream, "400 Bad Request", FAILURE_PAGE).await;
            return Err(ApiError::OAuth {
                code: "state_mismatch".to_string(),
                description: "redirect state does not match the request".to_string(),
            });
        }

        respond(&mut stream, "200 OK", SUCCESS_PAGE).await;
        return Ok(code.clone());
    }
}

impl DriveClient {
    async fn token_request(&self, form: &[(&str, String)]) -> Result<TokenResponse, ApiError> {
        let response = self
            .http()
            .post(TOKEN_URL)
            .form(form)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;
        read_oauth_json(response).await
    }

    async fn device_flow(&self, profile: AuthProfile) -> Result<Credential, ApiError> {
        let form = [
            ("client_id", self.oauth().client_id.clone()),
            ("scope", profile.scope().to_string()),
        ];
        let response = self
            .http()
            .post(DEVICE_CODE_URL)
            .form(&form)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;
        let device: DeviceCodeResponse = read_oauth_json(response).await?;

        self.prompt()
            .show_device_code(&device.verification_url, &device.user_code);

        let deadline = Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = device.interval.max(1);
        let mut form = self.oauth().identity();
        form.push(("device_code", device.device_code));
        form.push(("grant_type", DEVICE_GRANT_TYPE.to_string()));

        loop {
            tokio::time::sleep(Duration::from_secs(interval)).await;
            if Instant::now() >= deadline {
                return Err(ApiError::OAuth {
                    code: "expired_token".to_string(),
                    description: "the device code expired before it was approved".to_string(),
                });
            }

            match self.token_request(&form).await {
                Ok(token) => {
                    info!(profile = %profile, "Device authorization approved");
                    return Ok(into_credential(profile, token));
                }
                Err(ApiError::OAuth { ref code, .. }) if code == "authorization_pending" => {}
                Err(ApiError::OAuth { ref code, .. }) if code == "slow_down" => {
                    interval += SLOW_DOWN_STEP_SECS;
                    debug!(interval, "Token endpoint asked us to slow down");
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "Device token poll failed, will retry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn loopback_flow(&self, profile: AuthProfile) -> Result<Credential, ApiError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(redirect_error)?;
        let port = listener.local_addr().map_err(redirect_error)?.port();
        let redirect_uri = format!("http://127.0.0.1:{}", port);

        let pkce = Pkce::generate();
        let state = random_urlsafe(16);
        let url = Url::parse_with_params(
            AUTHORIZE_URL,
            &[
                ("client_id", self.oauth().client_id.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", profile.scope()),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("state", state.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| ApiError::InvalidResponse(format!("bad authorization URL: {}", e)))?;

        debug!(port, "Waiting for authorization redirect");
        self.prompt().open_authorization_url(url.as_str());

        let code = tokio::time::timeout(
            Duration::from_secs(LOOPBACK_TIMEOUT_SECS),
            await_redirect(&listener, &state),
        )
        .await
        .map_err(|_| ApiError::OAuth {
            code: "timeout".to_string(),
            description: "no authorization response was received".to_string(),
        })??;

        let mut form = self.oauth().identity();
        form.push(("code", code));
        form.push(("code_verifier", pkce.verifier));
        form.push(("redirect_uri", redirect_uri));
        form.push(("grant_type", "authorization_code".to_string()));

        let token = self.token_request(&form).await?;
        info!(profile = %profile, "Browser authorization approved");
        Ok(into_credential(profile, token))
    }
}

impl AuthTransport for DriveClient {
    fn exchange_auth_code(
        &self,
        profile: AuthProfile,
    ) -> impl std::future::Future<Output = Result<Credential, ApiError>> + Send {
        async move {
            match profile {
                AuthProfile::Cli => self.device_flow(profile).await,
                AuthProfile::Web => self.loopback_flow(profile).await,
            }
        }
    }

    fn refresh_credential(
        &self,
        credential: &Credential,
    ) -> impl std::future::Future<Output = Result<Credential, ApiError>> + Send {
        let profile = credential.profile;
        let refresh_token = credential.refresh_token.clone();

        async move {
            let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) else {
                return Err(ApiError::OAuth {
                    code: "invalid_grant".to_string(),
                    description: "credential has no refresh token".to_string(),
                });
            };
            let mut form = self.oauth().identity();
            form.push(("refresh_token", refresh_token));
            form.push(("grant_type", "refresh_token".to_string()));

            let token = self.token_request(&form).await?;
            debug!(profile = %profile, expires_in = token.expires_in, "Refreshed access token");
            Ok(into_credential(profile, token))
        }
    }

    fn revoke_credential(
        &self,
        credential: &Credential,
    ) -> impl std::future::Future<Output = Result<(), ApiError>> + Send {
        // Revoking the refresh token also invalidates its access tokens.
        let token = credential
            .refresh_token
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| credential.access_token.clone());

        async move {
            let response = self
                .http()
                .post(REVOKE_URL)
                .form(&[("token", token)])
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .send()
                .await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(oauth_failure(response).await)
            }
        }
    }
}
