//! Clap derive structures for the `simsync` CLI.

use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use simsync_core::{Attribute, LineId};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// simsync -- keep provisioned mobile lines in sync with the provider
#[derive(Debug, Parser)]
#[command(
    name = "simsync",
    version,
    about = "Inspect, change, and reprovision mobile lines at the provisioning provider",
    long_about = "Inspect, change, and reprovision mobile lines at the provisioning provider.\n\n\
        Changes are applied optimistically and rolled back when the provider\n\
        rejects them. `reset` replaces the line's provider identity.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Provider profile to use
    #[arg(long, short = 'p', env = "SIMSYNC_PROFILE", global = true)]
    pub profile: Option<String>,

    /// Provider API URL (overrides profile)
    #[arg(long, env = "SIMSYNC_PROVIDER_URL", global = true)]
    pub provider_url: Option<String>,

    /// Provider API key
    #[arg(long, env = "SIMSYNC_API_KEY", global = true, hide_env = true)]
    pub api_key: Option<String>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "SIMSYNC_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Skip confirmation prompts
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,

    /// Accept self-signed TLS certificates
    #[arg(long, short = 'k', env = "SIMSYNC_INSECURE", global = true)]
    pub insecure: bool,

    /// Per-request timeout, e.g. "30s" (overrides profile)
    #[arg(long, env = "SIMSYNC_TIMEOUT", value_parser = humantime::parse_duration, global = true)]
    pub timeout: Option<Duration>,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fetch a line from the provider and show it
    #[command(alias = "get")]
    Show(ShowArgs),

    /// Change one attribute of a line
    Set(SetArgs),

    /// Replace the provider identity of a line (terminate and recreate)
    #[command(alias = "reprovision")]
    Reset(ResetArgs),

    /// Refresh a line periodically and print every change
    Watch(WatchArgs),

    /// Manage CLI configuration and profiles
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Line commands ────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ShowArgs {
    /// SIM number (ICCID)
    pub sim: LineId,
}

#[derive(Debug, Args)]
pub struct SetArgs {
    /// SIM number (ICCID)
    pub sim: LineId,

    /// Attribute: suspended, imei-locked, network-preference, package
    pub attribute: Attribute,

    /// New value (true/false, auto/lte/5g/3g, or a package number)
    pub value: String,
}

#[derive(Debug, Args)]
pub struct ResetArgs {
    /// SIM number (ICCID)
    pub sim: LineId,

    /// Display name for the new endpoint
    #[arg(long, short = 'n', required_unless_present_any = ["resume", "clear"])]
    pub name: Option<String>,

    /// Retry only the provisioning step of a partially failed reset
    #[arg(long, conflicts_with_all = ["name", "clear"])]
    pub resume: bool,

    /// Acknowledge and drop the last finished reset record
    #[arg(long, conflicts_with = "name")]
    pub clear: bool,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// SIM number (ICCID)
    pub sim: LineId,

    /// Refresh period, e.g. "30s" or "2m"
    #[arg(long, short = 'i', default_value = "30s", value_parser = humantime::parse_duration)]
    pub interval: Duration,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Interactive configuration wizard
    Init,

    /// Show the effective configuration
    Show,

    /// Print the config file path
    Path,

    /// List configured profiles
    Profiles,

    /// Store the API key of a profile in the system keyring
    SetApiKey,
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
