//! Command-line surface.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use driveup_core::auth::AuthProfile;
use driveup_core::models::{GrantType, Role, ShareRequest};
use driveup_core::{DownloadOptions, UploadOptions};

#[derive(Debug, Parser)]
#[command(
    name = "driveup",
    version,
    about = "Resumable uploads and downloads for Google Drive"
)]
pub struct Cli {
    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Credential profile used by transfer and share commands
    #[arg(long, global = true, default_value = "cli", value_name = "cli|web")]
    pub profile: AuthProfile,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload a file, resuming an interrupted upload of the same file
    Upload(UploadArgs),
    /// Download a file, resuming a partial download
    Download(DownloadArgs),
    /// Share a file or revoke its grants
    Share(ShareArgs),
    /// Obtain a token, running the authorization flow if needed
    #[command(name = "token:get")]
    TokenGet(TokenGetArgs),
    /// Delete the stored token and revoke it remotely
    #[command(name = "token:revoke")]
    TokenRevoke(TokenRevokeArgs),
    /// List interrupted transfers that can be resumed
    Transfers,
}

#[derive(Debug, Args)]
pub struct UploadArgs {
    pub file: PathBuf,

    /// Parent folder id; repeat for several parents
    #[arg(short = 'p', long = "parent", value_name = "ID")]
    pub parents: Vec<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Force the MIME type
    #[arg(long = "mime", value_name = "TYPE")]
    pub mime_type: Option<String>,

    /// Share after upload: with anyone holding the link, or with EMAIL
    /// given as `--share=EMAIL`
    #[arg(long, value_name = "EMAIL", num_args = 0..=1, require_equals = true)]
    pub share: Option<Option<String>>,

    /// Hide progress
    #[arg(long)]
    pub no_progress: bool,

    /// Delete the local file after a successful upload
    #[arg(short = 'd', long = "delete")]
    pub delete: bool,
}

impl UploadArgs {
    pub fn share_request(&self) -> Option<ShareRequest> {
        match self.share {
            None => None,
            Some(Some(ref email)) if !email.trim().is_empty() => {
                Some(ShareRequest::user(email.trim()))
            }
            Some(_) => Some(ShareRequest::default()),
        }
    }

    pub fn options(&self, profile: AuthProfile) -> UploadOptions {
        UploadOptions {
            parents: self.parents.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            share: self.share_request(),
            delete_after: self.delete,
            profile,
        }
    }
}

#[derive(Debug, Args)]
pub struct DownloadArgs {
    pub file_id: String,

    /// Resume a partial download; `--resumable=false` starts over
    #[arg(
        short = 'r',
        long,
        value_name = "BOOL",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub resumable: bool,

    /// Overwrite the output file if it exists
    #[arg(short, long)]
    pub force: bool,

    /// Where to save the file (a directory keeps the remote name)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Hide progress
    #[arg(long)]
    pub no_progress: bool,
}

impl DownloadArgs {
    pub fn options(&self, profile: AuthProfile) -> DownloadOptions {
        DownloadOptions {
            resumable: self.resumable,
            force: self.force,
            output: self.output.clone(),
            profile,
        }
    }
}

#[derive(Debug, Args)]
pub struct ShareArgs {
    pub file_id: String,

    /// owner/writer/commenter/reader
    #[arg(long, default_value = "reader")]
    pub role: Role,

    /// user/group/domain/anyone; defaults to user with --email, else anyone
    #[arg(long = "type", value_name = "TYPE")]
    pub grant_type: Option<GrantType>,

    /// User or group to share with
    #[arg(long)]
    pub email: Option<String>,

    /// Domain to share with
    #[arg(long)]
    pub domain: Option<String>,

    /// Let search engines find the file
    #[arg(long)]
    pub discoverable: bool,

    /// Delete every grant except the owner's
    #[arg(long, conflicts_with_all = ["grant_type", "email", "domain", "discoverable"])]
    pub revoke: bool,
}

impl ShareArgs {
    pub fn request(&self) -> ShareRequest {
        let grant_type = self.grant_type.unwrap_or(if self.email.is_some() {
            GrantType::User
        } else if self.domain.is_some() {
            GrantType::Domain
        } else {
            GrantType::Anyone
        });

        ShareRequest {
            role: self.role,
            grant_type,
            email: self.email.clone(),
            domain: self.domain.clone(),
            discoverable: self.discoverable,
        }
    }
}

#[derive(Debug, Args)]
pub struct TokenGetArgs {
    /// Authorization flow: cli (device code) or web (browser)
    #[arg(short = 't', long = "type", default_value = "cli", value_name = "cli|web")]
    pub profile: AuthProfile,

    /// Run the authorization flow even if a valid token is stored
    #[arg(short, long)]
    pub force: bool,

    /// Save the configured client secret in the OS keychain
    #[arg(long)]
    pub remember_secret: bool,
}

#[derive(Debug, Args)]
pub struct TokenRevokeArgs {
    #[arg(short = 't', long = "type", default_value = "cli", value_name = "cli|web")]
    pub profile: AuthProfile,
}
