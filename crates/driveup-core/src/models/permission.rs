use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Access level carried by a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Owner,
    Organizer,
    FileOrganizer,
    Writer,
    Commenter,
    #[default]
    Reader,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Organizer => "organizer",
            Role::FileOrganizer => "fileOrganizer",
            Role::Writer => "writer",
            Role::Commenter => "commenter",
            Role::Reader => "reader",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Ok(Role::Owner),
            "organizer" => Ok(Role::Organizer),
            "fileorganizer" => Ok(Role::FileOrganizer),
            "writer" => Ok(Role::Writer),
            "commenter" => Ok(Role::Commenter),
            "reader" => Ok(Role::Reader),
            other => Err(Error::Validation(format!(
                "unknown role '{}' (expected owner/writer/commenter/reader)",
                other
            ))),
        }
    }
}

/// Who a grant applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantType {
    User,
    Group,
    Domain,
    #[default]
    Anyone,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::User => "user",
            GrantType::Group => "group",
            GrantType::Domain => "domain",
            GrantType::Anyone => "anyone",
        }
    }

    /// User and group grants are addressed by email.
    pub fn requires_email(&self) -> bool {
        matches!(self, GrantType::User | GrantType::Group)
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(GrantType::User),
            "group" => Ok(GrantType::Group),
            "domain" => Ok(GrantType::Domain),
            "anyone" => Ok(GrantType::Anyone),
            other => Err(Error::Validation(format!(
                "unknown share type '{}' (expected user/group/domain/anyone)",
                other
            ))),
        }
    }
}

/// A sharing grant as reported by Drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: String,
    pub role: Role,
    #[serde(rename = "type")]
    pub grant_type: GrantType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_file_discovery: Option<bool>,
}

/// Caller's request to create a grant. Defaults to an `anyone`/`reader` link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShareRequest {
    pub role: Role,
    pub grant_type: GrantType,
    pub email: Option<String>,
    pub domain: Option<String>,
    pub discoverable: bool,
}

impl ShareRequest {
    /// Grant read access to a single user by email.
    pub fn user(email: impl Into<String>) -> Self {
        Self {
            grant_type: GrantType::User,
            email: Some(email.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        let has_email = self
            .email
            .as_deref()
            .map(|e| !e.trim().is_empty())
            .unwrap_or(false);

        if self.grant_type.requires_email() && !has_email {
            return Err(Error::Validation(format!(
                "an email address is required when sharing with type '{}'",
                self.grant_type
            )));
        }
        if self.grant_type.requires_email() && has_email {
            let email = self.email.as_deref().unwrap_or_default();
            if !email.contains('@') {
                return Err(Error::Validation(format!(
                    "'{}' is not an email address",
                    email
                )));
            }
        }
        if self.grant_type == GrantType::Domain
            && self.domain.as_deref().map(str::is_empty).unwrap_or(true)
        {
            return Err(Error::Validation(
                "a domain is required when sharing with type 'domain'".to_string(),
            ));
        }
        if self.role == Role::Owner && self.grant_type != GrantType::User {
            return Err(Error::Validation(
                "ownership can only be transferred to a user".to_string(),
            ));
        }
        Ok(())
    }

    /// Discoverability only applies to link-style grants.
    pub fn allows_discovery(&self) -> bool {
        matches!(self.grant_type, GrantType::Anyone | GrantType::Domain)
    }
}
