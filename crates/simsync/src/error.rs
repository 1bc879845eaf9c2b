//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors
//! with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use simsync_config::ConfigError;
use simsync_core::{CoreError, DomainError, RetryAdvice, SagaFailure, TransportError};

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
    /// A reset left the line without a provider identity.
    pub const PARTIAL: i32 = 9;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not reach the provider ({operation}): {reason}")]
    #[diagnostic(
        code(simsync::connection_failed),
        help(
            "Check that the provider URL is correct and reachable.\n\
             Show the active settings with: simsync config show"
        )
    )]
    ConnectionFailed { operation: String, reason: String },

    #[error("The provider did not answer {operation} in time")]
    #[diagnostic(code(simsync::timeout))]
    Timeout {
        operation: String,
        #[help]
        advice: Option<String>,
    },

    // ── Authentication ───────────────────────────────────────────────

    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(simsync::auth_failed),
        help("Verify your API key. Store a new one with: simsync config set-api-key")
    )]
    AuthFailed { message: String },

    #[error("No API key configured for profile '{profile}'")]
    #[diagnostic(
        code(simsync::no_credentials),
        help(
            "Configure one with: simsync config init\n\
             Or set the SIMSYNC_API_KEY environment variable."
        )
    )]
    NoCredentials { profile: String },

    // ── Lines ────────────────────────────────────────────────────────

    #[error("{message}")]
    #[diagnostic(code(simsync::not_found), help("Check the SIM number and try again."))]
    NotFound { message: String },

    #[error("{message}")]
    #[diagnostic(code(simsync::ambiguous), help("Provide the complete SIM number."))]
    Ambiguous { message: String },

    #[error("Line {sim} is busy: {reason}")]
    #[diagnostic(
        code(simsync::busy),
        help("Wait for the running reset to finish, then retry.")
    )]
    Busy { sim: String, reason: String },

    #[error("Line {sim} is not eligible: {reason}")]
    #[diagnostic(code(simsync::not_eligible), help("Inspect the line with: simsync show {sim}"))]
    NotEligible { sim: String, reason: String },

    #[error("Provider rejected {operation} ({kind}): {message}")]
    #[diagnostic(code(simsync::rejected))]
    Rejected {
        operation: String,
        kind: String,
        message: String,
        #[help]
        advice: Option<String>,
    },

    // ── Reset ────────────────────────────────────────────────────────

    #[error("Reset of {sim} stopped during {phase}; the line is unchanged: {cause}")]
    #[diagnostic(code(simsync::reset_failed))]
    ResetFailed {
        sim: String,
        phase: String,
        cause: String,
        #[help]
        advice: Option<String>,
    },

    #[error("Reset of {sim} stopped during {phase}; the old endpoint may already be terminated: {cause}")]
    #[diagnostic(
        code(simsync::reset_unconfirmed),
        help(
            "Check the line with: simsync show {sim}\n\
             A new reset is only started once the provider still reports the old endpoint."
        )
    )]
    ResetUnconfirmed {
        sim: String,
        phase: String,
        cause: String,
    },

    #[error("Reset of {sim} failed during {phase} after the old endpoint was terminated: {cause}")]
    #[diagnostic(
        code(simsync::reset_partial),
        help(
            "The line currently has no provider identity.\n\
             Retry provisioning with: simsync reset {sim} --resume"
        )
    )]
    ResetPartial {
        sim: String,
        phase: String,
        cause: String,
    },

    #[error("Line {sim} has a partially failed reset")]
    #[diagnostic(
        code(simsync::restart_after_partial),
        help("Starting over would terminate nothing. Resume with: simsync reset {sim} --resume")
    )]
    RestartAfterPartial { sim: String },

    #[error("Line {sim} has no partially failed reset to resume")]
    #[diagnostic(code(simsync::nothing_to_resume), help("Start a new reset with: simsync reset {sim} --name <NAME>"))]
    NothingToResume { sim: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(simsync::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(simsync::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: simsync config init"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Configuration file not found")]
    #[diagnostic(
        code(simsync::no_config),
        help(
            "Create one with: simsync config init\n\
             Expected at: {path}\n\
             Or pass --provider-url and --api-key."
        )
    )]
    NoConfig { path: String },

    #[error(transparent)]
    #[diagnostic(code(simsync::config))]
    Config(ConfigError),

    // ── Interactive ──────────────────────────────────────────────────

    #[error("Destructive operation '{action}' requires confirmation")]
    #[diagnostic(
        code(simsync::confirmation_required),
        help("Use --yes (-y) to skip confirmation in non-interactive contexts.")
    )]
    NonInteractiveRequiresYes { action: String },

    // ── Internal / IO / Serialization ─────────────────────────────────

    #[error("Internal error: {0}")]
    #[diagnostic(code(simsync::internal))]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("JSON output failed: {0}")]
    #[diagnostic(code(simsync::json))]
    Json(#[from] serde_json::Error),

    #[error("YAML output failed: {0}")]
    #[diagnostic(code(simsync::yaml))]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML output failed: {0}")]
    #[diagnostic(code(simsync::toml))]
    Toml(#[from] toml::ser::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::AuthFailed { .. } | Self::NoCredentials { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Busy { .. }
            | Self::NotEligible { .. }
            | Self::RestartAfterPartial { .. }
            | Self::NothingToResume { .. }
            | Self::ResetUnconfirmed { .. } => exit_code::CONFLICT,
            Self::ResetPartial { .. } => exit_code::PARTIAL,
            Self::Ambiguous { .. }
            | Self::Validation { .. }
            | Self::ProfileNotFound { .. }
            | Self::NonInteractiveRequiresYes { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

fn advice_text(advice: RetryAdvice) -> Option<String> {
    match advice {
        RetryAdvice::SafeToRetry => Some("This is safe to retry.".into()),
        RetryAdvice::ResumeStepOnly => Some("Only the failed step may be retried (--resume).".into()),
        RetryAdvice::ManualIntervention => None,
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        let advice = advice_text(err.retry_advice());
        match err {
            CoreError::Transport(TransportError::Network { operation, reason }) => {
                CliError::ConnectionFailed {
                    operation: operation.into(),
                    reason,
                }
            }

            CoreError::Transport(TransportError::Timeout {
                operation,
                possibly_applied,
            }) => CliError::Timeout {
                operation: operation.into(),
                advice: Some(if possibly_applied {
                    "The provider may still have applied the change.\n\
                     Check the current state with: simsync show <SIM>"
                        .into()
                } else {
                    "Nothing was changed. Increase --timeout or retry later.".into()
                }),
            },

            CoreError::Domain(domain) => from_domain(domain, advice),

            CoreError::Saga(failure) => from_saga(failure, advice),

            CoreError::AuthenticationFailed { message } => CliError::AuthFailed { message },

            CoreError::ValidationFailed { message } => CliError::Validation {
                field: "value".into(),
                reason: message,
            },

            CoreError::Config { message } => CliError::Validation {
                field: "config".into(),
                reason: message,
            },

            CoreError::Internal(message) => CliError::Internal(message),
        }
    }
}

fn from_domain(err: DomainError, advice: Option<String>) -> CliError {
    match err {
        DomainError::NotFound { message } => CliError::NotFound { message },
        DomainError::AmbiguousMatch { message } => CliError::Ambiguous { message },
        DomainError::AlreadyInState { attribute, value } => CliError::Validation {
            field: attribute.to_string(),
            reason: format!("already {value}"),
        },
        DomainError::DeviceNotEligible { line, reason } => CliError::NotEligible {
            sim: line.to_string(),
            reason,
        },
        DomainError::DeviceBusy { line, reason } => CliError::Busy {
            sim: line.to_string(),
            reason: reason.into(),
        },
        DomainError::Rejected {
            operation,
            kind,
            message,
        } => CliError::Rejected {
            operation: operation.into(),
            kind: kind.to_string(),
            message,
            advice,
        },
    }
}

fn from_saga(err: SagaFailure, advice: Option<String>) -> CliError {
    match err {
        SagaFailure::NoneAttempted { line, phase, cause } => CliError::ResetFailed {
            sim: line.to_string(),
            phase: phase.to_string(),
            cause: cause.to_string(),
            advice,
        },
        SagaFailure::Unconfirmed { line, phase, cause } => CliError::ResetUnconfirmed {
            sim: line.to_string(),
            phase: phase.to_string(),
            cause: cause.to_string(),
        },
        SagaFailure::Partial { line, phase, cause } => CliError::ResetPartial {
            sim: line.to_string(),
            phase: phase.to_string(),
            cause: cause.to_string(),
        },
        SagaFailure::RestartAfterPartial { line } => CliError::RestartAfterPartial {
            sim: line.to_string(),
        },
        SagaFailure::NothingToResume { line } => CliError::NothingToResume {
            sim: line.to_string(),
        },
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoCredentials { profile } => CliError::NoCredentials { profile },
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            ConfigError::UnknownProfile { profile } => CliError::ProfileNotFound {
                name: profile,
                available: String::new(),
            },
            other => CliError::Config(other),
        }
    }
}
