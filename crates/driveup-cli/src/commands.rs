//! Command handlers. Each builds what it needs from the loaded [`Config`]
//! and prints its result as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driveup_core::api::{DriveClient, OAuthClient};
use driveup_core::auth::{AuthProfile, SecretStore, TokenManager, TokenStatus};
use driveup_core::store::{Direction, SessionStatus, TransferSession};
use driveup_core::transfer::ProgressSink;
use driveup_core::utils::format_progress;
use driveup_core::{Config, TransferControl, TransferOrchestrator};

use crate::cli::{
    Cli, Command, DownloadArgs, ShareArgs, TokenGetArgs, TokenRevokeArgs, UploadArgs,
};
use crate::output::{print_json, StderrProgress, TerminalPrompt};

type Orchestrator = TransferOrchestrator<DriveClient>;

pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let profile = cli.profile;

    match cli.command {
        Command::Upload(args) => upload(&config, profile, args).await,
        Command::Download(args) => download(&config, profile, args).await,
        Command::Share(args) => share(&config, profile, args).await,
        Command::TokenGet(args) => token_get(&config, args).await,
        Command::TokenRevoke(args) => token_revoke(&config, args).await,
        Command::Transfers => transfers(&config).await,
    }
}

fn orchestrator(config: &Config) -> Result<Orchestrator> {
    let client_id = config.require_client_id()?;
    let secret = config.resolve_client_secret()?;
    let client = Arc::new(
        DriveClient::new(OAuthClient::new(client_id, secret), Arc::new(TerminalPrompt))
            .context("Failed to create HTTP client")?,
    );
    let tokens = Arc::new(
        TokenManager::new(client.clone(), config.token_store()?)
            .with_retry_policy(config.retry_policy()),
    );

    Ok(TransferOrchestrator::new(client, tokens, config.resume_store()?)
        .with_chunk_size(config.chunk_size)
        .with_retry_policy(config.retry_policy())
        .with_stall_timeout(config.stall_timeout()))
}

/// Cancel on the first Ctrl-C so the session pauses at a chunk boundary;
/// a second Ctrl-C exits immediately.
fn transfer_control(label: &str, show_progress: bool) -> TransferControl {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!();
        eprintln!("Interrupted: pausing after the current chunk (Ctrl-C again to quit)");
        token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let progress = show_progress.then(|| Arc::new(StderrProgress::new(label)) as Arc<dyn ProgressSink>);
    TransferControl { progress, cancel }
}

fn label_for(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn upload(config: &Config, profile: AuthProfile, args: UploadArgs) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let control = transfer_control(&label_for(&args.file), !args.no_progress);
    let options = args.options(profile);

    let result = orchestrator.upload(&args.file, options, control).await?;
    print_json(&result)?;

    if let Some(ref e) = result.share_error {
        bail!("file {} was uploaded but sharing failed: {}", result.file_id, e);
    }
    Ok(())
}

async fn download(config: &Config, profile: AuthProfile, args: DownloadArgs) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let control = transfer_control(&args.file_id, !args.no_progress);
    let options = args.options(profile);

    let result = orchestrator.download(&args.file_id, options, control).await?;
    print_json(&result)
}

async fn share(config: &Config, profile: AuthProfile, args: ShareArgs) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let permissions = orchestrator.permissions();

    if args.revoke {
        let summary = permissions.revoke(profile, &args.file_id).await?;
        print_json(&summary)?;
        if !summary.is_clean() {
            bail!(
                "{} of {} grants could not be deleted",
                summary.failures.len(),
                summary.failures.len() + summary.deleted.len()
            );
        }
        return Ok(());
    }

    let permission = permissions
        .share(profile, &args.file_id, &args.request())
        .await?;
    print_json(&permission)
}

#[derive(Debug, Serialize)]
struct TokenOutput {
    #[serde(flatten)]
    status: TokenStatus,
    access_token: String,
    scope: Option<String>,
}

async fn token_get(config: &Config, args: TokenGetArgs) -> Result<()> {
    if args.remember_secret {
        let client_id = config.require_client_id()?;
        let Some(ref secret) = config.client_secret else {
            bail!("no client secret configured to remember");
        };
        SecretStore::store_client_secret(client_id, secret)?;
        info!("Client secret saved to the keychain");
    }

    let orchestrator = orchestrator(config)?;
    let tokens = orchestrator.tokens();
    let credential = tokens.authenticate(args.profile, args.force).await?;
    let status = tokens
        .status(args.profile)
        .await?
        .context("token was not persisted")?;

    print_json(&TokenOutput {
        status,
        access_token: credential.access_token,
        scope: credential.scope,
    })
}

async fn token_revoke(config: &Config, args: TokenRevokeArgs) -> Result<()> {
    let orchestrator = orchestrator(config)?;
    let report = orchestrator.tokens().revoke(args.profile).await?;
    if let Some(ref e) = report.remote_error {
        warn!(error = %e, "Local token deleted but remote revocation failed");
    }
    print_json(&report)
}

/// Row of the `transfers` listing. Upload handles stay out of the output
/// since they grant write access to the pending file.
#[derive(Debug, Serialize)]
struct TransferRow {
    key: String,
    direction: Direction,
    status: SessionStatus,
    name: String,
    local_path: PathBuf,
    remote_id: String,
    committed: u64,
    total: u64,
    progress: String,
    updated_at: DateTime<Utc>,
}

impl From<TransferSession> for TransferRow {
    fn from(session: TransferSession) -> Self {
        Self {
            name: session.display_name(),
            progress: format_progress(session.committed_offset, session.total_size),
            key: session.key,
            direction: session.direction,
            status: session.status,
            local_path: session.local_path,
            remote_id: session.remote_id,
            committed: session.committed_offset,
            total: session.total_size,
            updated_at: session.updated_at,
        }
    }
}

async fn transfers(config: &Config) -> Result<()> {
    let sessions = config.resume_store()?.list().await?;
    let rows: Vec<TransferRow> = sessions.into_iter().map(TransferRow::from).collect();
    print_json(&rows)
}
