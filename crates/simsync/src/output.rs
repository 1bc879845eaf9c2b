//! Output formatting: table, JSON, YAML, plain.
//!
//! Renders data in the format selected by `--output`. Tables use `tabled`,
//! structured formats use serde, plain emits one value per line.

use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, Utc};
use owo_colors::OwoColorize;
use tabled::{Table, Tabled, builder::Builder, settings::Style};

use simsync_core::{DeviceLineState, ReprovisioningRecord, SagaPhase};

use crate::cli::{ColorMode, OutputFormat};
use crate::error::CliError;

// ── Color helpers ────────────────────────────────────────────────────

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

fn paint_phase(phase: SagaPhase, color: bool) -> String {
    let text = phase.to_string();
    if !color {
        return text;
    }
    match phase {
        SagaPhase::Committed => text.green().to_string(),
        SagaPhase::FailedPartial => text.red().bold().to_string(),
        SagaPhase::FailedNoneAttempted => text.yellow().to_string(),
        _ => text.cyan().to_string(),
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a list of serde-serializable + tabled items in the chosen format.
pub fn render_list<T, R>(
    format: OutputFormat,
    data: &[T],
    to_row: impl Fn(&T) -> R,
    id_fn: impl Fn(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            Ok(Table::new(rows).with(Style::rounded()).to_string())
        }
        OutputFormat::Json => render_json(data, false),
        OutputFormat::JsonCompact => render_json(data, true),
        OutputFormat::Yaml => render_yaml(data),
        OutputFormat::Plain => Ok(data.iter().map(&id_fn).collect::<Vec<_>>().join("\n")),
    }
}

/// Render a single serde-serializable item in the chosen format.
///
/// Table rendering uses `detail_fn`, since single-item views are
/// key/value listings rather than `Tabled` rows.
pub fn render_single<T>(
    format: OutputFormat,
    data: &T,
    detail_fn: impl Fn(&T) -> String,
    id_fn: impl Fn(&T) -> String,
) -> Result<String, CliError>
where
    T: serde::Serialize,
{
    match format {
        OutputFormat::Table => Ok(detail_fn(data)),
        OutputFormat::Json => render_json(data, false),
        OutputFormat::JsonCompact => render_json(data, true),
        OutputFormat::Yaml => render_yaml(data),
        OutputFormat::Plain => Ok(id_fn(data)),
    }
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Format-specific renderers ────────────────────────────────────────

fn render_json<T: serde::Serialize + ?Sized>(data: &T, compact: bool) -> Result<String, CliError> {
    if compact {
        Ok(serde_json::to_string(data)?)
    } else {
        Ok(serde_json::to_string_pretty(data)?)
    }
}

fn render_yaml<T: serde::Serialize + ?Sized>(data: &T) -> Result<String, CliError> {
    Ok(serde_yaml::to_string(data)?)
}

fn key_value_table(rows: Vec<(&str, String)>) -> String {
    let mut builder = Builder::default();
    for (key, value) in rows {
        builder.push_record([key.to_owned(), value]);
    }
    builder.build().with(Style::rounded()).to_string()
}

// ── Domain views ─────────────────────────────────────────────────────

fn or_dash(value: Option<impl ToString>) -> String {
    value.map_or_else(|| "-".into(), |v| v.to_string())
}

/// "3m 12s ago" style age of a timestamp.
pub fn age(at: DateTime<Utc>) -> String {
    let elapsed = (Utc::now() - at).to_std().unwrap_or_default();
    let rounded = std::time::Duration::from_secs(elapsed.as_secs());
    format!("{} ago", humantime::format_duration(rounded))
}

fn join<T: ToString>(items: impl IntoIterator<Item = T>) -> String {
    let joined: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    if joined.is_empty() {
        "-".into()
    } else {
        joined.join(", ")
    }
}

/// Key/value view of a line.
pub fn line_detail(state: &DeviceLineState, color: bool) -> String {
    let attrs = &state.attributes;
    let mut rows = vec![
        ("SIM", state.line_id.to_string()),
        ("Endpoint", or_dash(state.endpoint_id.as_ref())),
        ("ICCID", or_dash(state.binding.as_ref().map(|b| &b.iccid))),
        ("IMEI", or_dash(state.binding.as_ref().and_then(|b| b.imei.as_ref()))),
        ("Status", attrs.status.clone()),
        ("Suspended", attrs.suspended.to_string()),
        ("IMEI locked", attrs.imei_locked.to_string()),
        ("Network", attrs.network_preference.to_string()),
        ("Package", attrs.package_id.to_string()),
        (
            "Data",
            format!("{:.2} / {:.2} GB", attrs.data_usage_gb, attrs.max_data_gb),
        ),
        ("Last synced", or_dash(state.last_synced_at.map(age))),
    ];
    if !state.in_flight.is_empty() {
        rows.push(("Pending", join(&state.in_flight)));
    }
    if !state.unconfirmed.is_empty() {
        let text = join(&state.unconfirmed);
        let text = if color { text.yellow().to_string() } else { text };
        rows.push(("Unconfirmed", text));
    }
    if let Some(ref record) = state.saga {
        rows.push(("Reset", paint_phase(record.phase, color)));
    }
    key_value_table(rows)
}

/// Key/value view of a reset record.
pub fn record_detail(record: &ReprovisioningRecord, color: bool) -> String {
    let mut rows = vec![
        ("Reset", record.id.to_string()),
        ("Phase", paint_phase(record.phase, color)),
        ("Display name", record.display_name.clone()),
        ("Old endpoint", or_dash(record.old_endpoint_id.as_ref())),
        ("New endpoint", or_dash(record.new_endpoint_id.as_ref())),
        ("Attempts", record.attempts.to_string()),
        ("Started", record.started_at.to_rfc3339()),
        ("Ended", or_dash(record.ended_at.map(|t| t.to_rfc3339()))),
    ];
    if let Some(phase) = record.failed_phase {
        rows.push(("Failed during", phase.to_string()));
    }
    if let Some(ref reason) = record.failure_reason {
        rows.push(("Failure", reason.clone()));
    }
    if record.termination_unconfirmed {
        rows.push(("Old endpoint state", "unconfirmed".into()));
    }
    key_value_table(rows)
}

/// One-line summary of the parts of a line a watcher cares about.
pub fn line_summary(state: &DeviceLineState) -> String {
    let attrs = &state.attributes;
    let mut summary = format!(
        "endpoint={} status={} suspended={} imei-locked={} network={} package={}",
        or_dash(state.endpoint_id.as_ref()),
        attrs.status,
        attrs.suspended,
        attrs.imei_locked,
        attrs.network_preference,
        attrs.package_id,
    );
    if !state.in_flight.is_empty() {
        summary.push_str(&format!(" pending=[{}]", join(&state.in_flight)));
    }
    if !state.unconfirmed.is_empty() {
        summary.push_str(&format!(" unconfirmed=[{}]", join(&state.unconfirmed)));
    }
    if let Some(ref record) = state.saga {
        summary.push_str(&format!(" reset={}", record.phase));
    }
    summary
}
