use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Buffer before expiry inside which a credential is refreshed (60 seconds)
const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;

/// Authorization flow a credential was obtained with. Each profile holds at
/// most one active credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProfile {
    /// Device flow: the user enters a short code on another device.
    #[default]
    Cli,
    /// Browser flow with a loopback redirect.
    Web,
}

impl AuthProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProfile::Cli => "cli",
            AuthProfile::Web => "web",
        }
    }

    /// OAuth scope requested for this profile. Google only allows the
    /// per-file scope on the device flow.
    pub fn scope(&self) -> &'static str {
        match self {
            AuthProfile::Cli => "https://www.googleapis.com/auth/drive.file",
            AuthProfile::Web => "https://www.googleapis.com/auth/drive",
        }
    }
}

impl fmt::Display for AuthProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cli" => Ok(AuthProfile::Cli),
            "web" => Ok(AuthProfile::Web),
            other => Err(Error::Validation(format!(
                "unknown auth type '{}' (expected cli or web)",
                other
            ))),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub profile: AuthProfile,
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub obtained_at: DateTime<Utc>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Build a credential from a token endpoint response.
    pub fn issued(
        profile: AuthProfile,
        access_token: String,
        expires_in_secs: i64,
        refresh_token: Option<String>,
        scope: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            profile,
            access_token,
            token_type: default_token_type(),
            refresh_token,
            scope,
            expires_at: now + Duration::seconds(expires_in_secs),
            obtained_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Check if the credential will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        let refresh_at = self.expires_at - Duration::seconds(TOKEN_REFRESH_BUFFER_SECS);
        Utc::now() >= refresh_at
    }

    /// Get seconds remaining until expiry (for display)
    pub fn seconds_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().map(|t| !t.is_empty()).unwrap_or(false)
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("profile", &self.profile)
            .field("token_type", &self.token_type)
            .field("has_refresh_token", &self.can_refresh())
            .field("scope", &self.scope)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
