use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{AuthTransport, DriveTransport};
use crate::auth::{AuthProfile, TokenManager};
use crate::error::{Error, Result};
use crate::models::{Permission, Role, ShareRequest};
use crate::transfer::retry::{with_retry, RetryPolicy};

/// A grant that could not be removed.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionFailure {
    pub permission_id: String,
    pub error: String,
}

/// Outcome of [`PermissionManager::revoke`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RevokeSummary {
    pub deleted: Vec<String>,
    pub kept_owners: Vec<String>,
    pub failures: Vec<PermissionFailure>,
}

impl RevokeSummary {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Creates and removes sharing grants.
pub struct PermissionManager<T> {
    transport: Arc<T>,
    tokens: Arc<TokenManager<T>>,
    retry: RetryPolicy,
}

impl<T: DriveTransport + AuthTransport> PermissionManager<T> {
    pub fn new(transport: Arc<T>, tokens: Arc<TokenManager<T>>) -> Self {
        Self {
            transport,
            tokens,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create the grant described by `request` on `file_id`.
    pub async fn share(
        &self,
        profile: AuthProfile,
        file_id: &str,
        request: &ShareRequest,
    ) -> Result<Permission> {
        request.validate()?;

        let mut request = request.clone();
        if request.discoverable && !request.allows_discovery() {
            debug!(grant_type = %request.grant_type, "Discoverability ignored for this grant type");
            request.discoverable = false;
        }

        let credential = self.tokens.credential(profile).await?;
        let request = &request;
        let permission = with_retry(&self.retry, "create_permission", || {
            self.transport.create_permission(&credential, file_id, request)
        })
        .await
        .map_err(|(e, _)| Error::Api(e))?;

        info!(
            file_id,
            permission_id = %permission.id,
            role = %permission.role,
            grant_type = %permission.grant_type,
            "Grant created"
        );
        Ok(permission)
    }

    /// Remove every grant on `file_id` except the owner's.
    ///
    /// Individual deletion failures are collected in the summary instead of
    /// aborting the sweep.
    pub async fn revoke(&self, profile: AuthProfile, file_id: &str) -> Result<RevokeSummary> {
        let credential = self.tokens.credential(profile).await?;

        let grants = with_retry(&self.retry, "list_permissions", || {
            self.transport.list_permissions(&credential, file_id)
        })
        .await
        .map_err(|(e, _)| Error::Api(e))?;

        let mut summary = RevokeSummary::default();
        for grant in grants {
            if grant.role == Role::Owner {
                summary.kept_owners.push(grant.id);
                continue;
            }

            let permission_id = grant.id.as_str();
            let deleted = with_retry(&self.retry, "delete_permission", || {
                self.transport
                    .delete_permission(&credential, file_id, permission_id)
            })
            .await;

            match deleted {
                Ok(()) => {
                    debug!(file_id, permission_id, "Grant deleted");
                    summary.deleted.push(grant.id);
                }
                Err((e, _)) => {
                    warn!(file_id, permission_id, error = %e, "Failed to delete grant");
                    summary.failures.push(PermissionFailure {
                        permission_id: grant.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            file_id,
            deleted = summary.deleted.len(),
            failed = summary.failures.len(),
            "Grants revoked"
        );
        Ok(summary)
    }
}
