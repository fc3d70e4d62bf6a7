//! Terminal output: JSON results on stdout, prompts and progress on stderr.

use std::io::{self, Write};
use std::sync::Mutex;

use anyhow::Result;
use serde::Serialize;

use driveup_core::api::AuthPrompt;
use driveup_core::transfer::{Progress, ProgressSink};
use driveup_core::utils::{format_progress, truncate_string};

/// Longest file name shown in front of the progress line
const MAX_LABEL_LENGTH: usize = 40;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

/// Prints authorization instructions to stderr.
pub struct TerminalPrompt;

impl AuthPrompt for TerminalPrompt {
    fn show_device_code(&self, verification_url: &str, user_code: &str) {
        eprintln!();
        eprintln!("To authorize driveup, visit:");
        eprintln!();
        eprintln!("    {}", verification_url);
        eprintln!();
        eprintln!("and enter the code: {}", user_code);
        eprintln!();
    }

    fn open_authorization_url(&self, url: &str) {
        eprintln!();
        eprintln!("Open this URL in your browser to authorize driveup:");
        eprintln!();
        eprintln!("    {}", url);
        eprintln!();
    }
}

/// Single-line progress display on stderr.
pub struct StderrProgress {
    label: String,
    last_percent: Mutex<Option<u64>>,
}

impl StderrProgress {
    pub fn new(label: &str) -> Self {
        Self {
            label: truncate_string(label, MAX_LABEL_LENGTH),
            last_percent: Mutex::new(None),
        }
    }
}

impl ProgressSink for StderrProgress {
    fn on_progress(&self, progress: Progress) -> Result<()> {
        let percent = (progress.fraction() * 100.0) as u64;
        {
            let mut last = self
                .last_percent
                .lock()
                .map_err(|_| anyhow::anyhow!("progress state poisoned"))?;
            if *last == Some(percent) && !progress.is_complete() {
                return Ok(());
            }
            *last = Some(percent);
        }

        let stderr = io::stderr();
        let mut err = stderr.lock();
        write!(
            err,
            "\r{}  {}",
            self.label,
            format_progress(progress.committed, progress.total)
        )?;
        if progress.is_complete() {
            writeln!(err)?;
        }
        err.flush()?;
        Ok(())
    }
}
