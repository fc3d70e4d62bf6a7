use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::credential::{AuthProfile, Credential};
use super::token_store::TokenStore;
use crate::api::{ApiError, AuthTransport};
use crate::error::{Error, Result};
use crate::transfer::retry::{with_retry, RetryPolicy};

/// Outcome of [`TokenManager::revoke`]. The local record is always gone;
/// the remote call is best-effort.
#[derive(Debug, Clone, Serialize)]
pub struct RevokeReport {
    pub profile: AuthProfile,
    pub had_credential: bool,
    pub remote_revoked: bool,
    pub remote_error: Option<String>,
}

/// Cached credential summary for display, no network involved.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub profile: AuthProfile,
    pub expires_at: DateTime<Utc>,
    pub expires_in_secs: i64,
    pub expired: bool,
    pub refreshable: bool,
}

/// Acquires, refreshes, caches and revokes credentials.
pub struct TokenManager<A> {
    transport: Arc<A>,
    store: TokenStore,
    retry: RetryPolicy,
    // Serializes flows so two callers never refresh or prompt at once.
    lock: Mutex<()>,
}

impl<A: AuthTransport> TokenManager<A> {
    pub fn new(transport: Arc<A>, store: TokenStore) -> Self {
        Self {
            transport,
            store,
            retry: RetryPolicy::default(),
            lock: Mutex::new(()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Valid credential for `profile`, refreshing or authorizing as needed.
    pub async fn credential(&self, profile: AuthProfile) -> Result<Credential> {
        self.authenticate(profile, false).await
    }

    /// Return a valid credential for `profile`.
    ///
    /// A cached credential outside the refresh margin is returned as-is when
    /// `force` is false. One inside the margin is refreshed inline; if the
    /// refresh is rejected, or `force` is set, the full authorization flow
    /// runs and its result replaces the cached record.
    pub async fn authenticate(&self, profile: AuthProfile, force: bool) -> Result<Credential> {
        let _guard = self.lock.lock().await;

        if !force {
            if let Some(cached) = self.load_cached(profile).await? {
                if !cached.needs_refresh() {
                    debug!(profile = %profile, "Using cached credential");
                    return Ok(cached);
                }
                if cached.can_refresh() {
                    if let Some(refreshed) = self.refresh(&cached).await? {
                        return Ok(refreshed);
                    }
                } else {
                    debug!(profile = %profile, "Cached credential expiring and not refreshable");
                }
            }
        }

        self.authorize(profile).await
    }

    /// Replace a credential the remote side rejected before its recorded
    /// expiry: refresh when a refresh handle exists, otherwise run the full
    /// authorization flow.
    pub async fn renew(&self, profile: AuthProfile) -> Result<Credential> {
        let _guard = self.lock.lock().await;

        if let Some(cached) = self.load_cached(profile).await? {
            if cached.can_refresh() {
                if let Some(refreshed) = self.refresh(&cached).await? {
                    return Ok(refreshed);
                }
            }
        }

        self.authorize(profile).await
    }

    /// Delete the cached credential and revoke it remotely.
    ///
    /// Local deletion always happens first; a failing remote call is
    /// reported in the returned [`RevokeReport`] rather than as an error.
    pub async fn revoke(&self, profile: AuthProfile) -> Result<RevokeReport> {
        let _guard = self.lock.lock().await;

        let cached = self.load_cached(profile).await?;
        self.store.delete(profile).await?;
        info!(profile = %profile, "Deleted cached credential");

        let mut report = RevokeReport {
            profile,
            had_credential: cached.is_some(),
            remote_revoked: false,
            remote_error: None,
        };

        if let Some(credential) = cached {
            match self.transport.revoke_credential(&credential).await {
                Ok(()) => report.remote_revoked = true,
                Err(e) => {
                    warn!(profile = %profile, error = %e, "Remote token revocation failed");
                    report.remote_error = Some(e.to_string());
                }
            }
        }

        Ok(report)
    }

    /// Inspect the cached credential without touching the network.
    pub async fn status(&self, profile: AuthProfile) -> Result<Option<TokenStatus>> {
        Ok(self.load_cached(profile).await?.map(|c| TokenStatus {
            profile,
            expires_at: c.expires_at,
            expires_in_secs: c.seconds_until_expiry(),
            expired: c.is_expired(),
            refreshable: c.can_refresh(),
        }))
    }

    /// Cached credential, with unreadable records treated as absent.
    async fn load_cached(&self, profile: AuthProfile) -> Result<Option<Credential>> {
        match self.store.load(profile).await {
            Ok(cached) => Ok(cached),
            Err(Error::StateCorrupt { path, reason }) => {
                warn!(path = %path.display(), %reason, "Discarding unreadable token record");
                if let Err(e) = self.store.delete(profile).await {
                    warn!(error = %e, "Failed to remove unreadable token record");
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh `cached`. `Ok(None)` means the refresh handle was rejected
    /// and the caller should fall back to a full authorization.
    async fn refresh(&self, cached: &Credential) -> Result<Option<Credential>> {
        let profile = cached.profile;
        debug!(profile = %profile, "Refreshing credential");

        let result = with_retry(&self.retry, "refresh_credential", || {
            self.transport.refresh_credential(cached)
        })
        .await;

        match result {
            Ok(mut refreshed) => {
                if !refreshed.can_refresh() {
                    refreshed.refresh_token = cached.refresh_token.clone();
                }
                refreshed.profile = profile;
                self.store.save(&refreshed).await?;
                info!(profile = %profile, expires_at = %refreshed.expires_at, "Credential refreshed");
                Ok(Some(refreshed))
            }
            Err((e, _)) if e.is_invalid_grant() || matches!(e, ApiError::Unauthorized) => {
                warn!(profile = %profile, error = %e, "Refresh rejected, re-authorizing");
                Ok(None)
            }
            Err((e, attempts)) => Err(Error::Auth(format!(
                "token refresh failed after {} attempt(s): {}",
                attempts, e
            ))),
        }
    }

    async fn authorize(&self, profile: AuthProfile) -> Result<Credential> {
        info!(profile = %profile, "Starting authorization flow");

        let result = with_retry(&self.retry, "exchange_auth_code", || {
            self.transport.exchange_auth_code(profile)
        })
        .await;

        match result {
            Ok(mut credential) => {
                credential.profile = profile;
                self.store.save(&credential).await?;
                info!(profile = %profile, expires_at = %credential.expires_at, "Authorization complete");
                Ok(credential)
            }
            Err((e, attempts)) if e.is_transient() => Err(Error::Auth(format!(
                "authorization endpoint unreachable after {} attempt(s): {}",
                attempts, e
            ))),
            Err((e, _)) => Err(Error::Auth(e.to_string())),
        }
    }
}
