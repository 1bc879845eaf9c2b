//! Shared helpers for command handlers.

use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use simsync_core::DeviceLine;

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Prompt for confirmation, auto-approving if `--yes` was passed.
///
/// Without a terminal to ask on, refuses instead of guessing.
pub fn confirm(message: &str, action: &str, global: &GlobalOpts) -> Result<bool, CliError> {
    if global.yes {
        return Ok(true);
    }
    if !std::io::stdin().is_terminal() {
        return Err(CliError::NonInteractiveRequiresYes {
            action: action.into(),
        });
    }
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(message)
        .default(false)
        .interact()
        .map_err(|e| CliError::Io(std::io::Error::other(e)))?;
    Ok(confirmed)
}

/// A stderr spinner, hidden in quiet mode or when stderr is not a terminal.
pub fn spinner(message: String, global: &GlobalOpts) -> ProgressBar {
    if global.quiet || !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})") {
        bar.set_style(style);
    }
    bar.set_message(message);
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

// ── Reset records ───────────────────────────────────────────────────

/// Bring back the reset record an earlier invocation saved for this line.
pub async fn restore_record(line: &DeviceLine) -> Result<(), CliError> {
    if let Some(record) = simsync_config::load_reset_record(line.id().as_str())? {
        line.restore_reprovision(record).await?;
    }
    Ok(())
}

/// Save the current reset record of the line, removing the file once cleared.
pub fn save_record(line: &DeviceLine) -> Result<(), CliError> {
    let record = line.state().saga;
    simsync_config::save_reset_record(line.id().as_str(), record.as_ref())?;
    Ok(())
}
