// ── Core error types ──
//
// User-facing errors from simsync-core. Callers never see HTTP status codes
// or raw provider payloads; `CoreError::from_gateway` translates gateway
// failures into transport or domain variants.

use simsync_api::ProviderErrorKind;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::model::{Attribute, LineId, SagaPhase};

/// Unified error type for the core crate.
///
/// `Clone` so a single refresh result can be shared by every caller that
/// joined the same in-flight fetch.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Provider reachability ────────────────────────────────────────
    #[error(transparent)]
    Transport(#[from] TransportError),

    // ── Domain outcomes ──────────────────────────────────────────────
    #[error(transparent)]
    Domain(#[from] DomainError),

    // ── Reprovisioning ───────────────────────────────────────────────
    #[error(transparent)]
    Saga(#[from] SagaFailure),

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The provider could not be reached or did not answer in time.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("{operation}: provider unreachable: {reason}")]
    Network {
        operation: &'static str,
        reason: String,
    },

    /// No answer in time. When `possibly_applied` is set the provider may
    /// still have executed the request; the next refresh is authoritative.
    #[error("{operation}: provider did not answer in time{}", applied_note(.possibly_applied))]
    Timeout {
        operation: &'static str,
        possibly_applied: bool,
    },
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn applied_note(possibly_applied: &bool) -> &'static str {
    if *possibly_applied {
        " (the change may still have been applied)"
    } else {
        ""
    }
}

/// The provider answered, or local state forbids the operation.
#[derive(Debug, Clone, Error)]
pub enum DomainError {
    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Ambiguous match: {message}")]
    AmbiguousMatch { message: String },

    #[error("{attribute} is already {value}")]
    AlreadyInState { attribute: Attribute, value: String },

    #[error("Line {line} is not eligible: {reason}")]
    DeviceNotEligible { line: LineId, reason: String },

    #[error("Line {line} is busy: {reason}")]
    DeviceBusy { line: LineId, reason: &'static str },

    #[error("Provider rejected {operation} ({kind}): {message}")]
    Rejected {
        operation: &'static str,
        kind: ProviderErrorKind,
        message: String,
    },
}

/// Outcome of a reprovisioning run that did not commit.
#[derive(Debug, Clone, Error)]
pub enum SagaFailure {
    /// Nothing changed at the provider.
    #[error("Reprovisioning of {line} stopped during {phase}; the line is unchanged: {cause}")]
    NoneAttempted {
        line: LineId,
        phase: SagaPhase,
        cause: Box<CoreError>,
    },

    /// The terminate call may have been applied; the provider never said.
    #[error("Reprovisioning of {line} stopped during {phase}; the old endpoint may already be terminated: {cause}")]
    Unconfirmed {
        line: LineId,
        phase: SagaPhase,
        cause: Box<CoreError>,
    },

    /// The old identity was terminated but no new one was recorded.
    #[error("Reprovisioning of {line} failed during {phase} after the old endpoint was terminated: {cause}")]
    Partial {
        line: LineId,
        phase: SagaPhase,
        cause: Box<CoreError>,
    },

    #[error("Line {line} has a partially failed reprovisioning; resume it instead of starting over")]
    RestartAfterPartial { line: LineId },

    #[error("Line {line} has no partially failed reprovisioning to resume")]
    NothingToResume { line: LineId },
}

/// What a caller can safely do after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RetryAdvice {
    /// Re-issuing the same operation is safe.
    SafeToRetry,
    /// Only the failed reprovisioning step may be retried (resume).
    ResumeStepOnly,
    /// Retrying will not help without operator action.
    ManualIntervention,
}

impl CoreError {
    /// Translate a gateway failure for `operation`.
    ///
    /// `possibly_applied` decides how a transport-level timeout is reported:
    /// reads and rejected-before-send calls pass `false`.
    pub(crate) fn from_gateway(
        operation: &'static str,
        err: GatewayError,
        possibly_applied: bool,
    ) -> Self {
        match err {
            GatewayError::Transport(reason) => TransportError::Network { operation, reason }.into(),
            GatewayError::Timeout => TransportError::Timeout {
                operation,
                possibly_applied,
            }
            .into(),
            GatewayError::Authentication(message) => Self::AuthenticationFailed { message },
            GatewayError::Decode(message) => {
                Self::Internal(format!("{operation}: unexpected provider payload: {message}"))
            }
            GatewayError::Provider { kind, message } => match kind {
                ProviderErrorKind::NotFound => DomainError::NotFound { message }.into(),
                ProviderErrorKind::AmbiguousMatch => DomainError::AmbiguousMatch { message }.into(),
                kind => DomainError::Rejected {
                    operation,
                    kind,
                    message,
                }
                .into(),
            },
        }
    }

    pub(crate) fn busy(line: &LineId, reason: &'static str) -> Self {
        DomainError::DeviceBusy {
            line: line.clone(),
            reason,
        }
        .into()
    }

    pub(crate) fn not_eligible(line: &LineId, reason: impl Into<String>) -> Self {
        DomainError::DeviceNotEligible {
            line: line.clone(),
            reason: reason.into(),
        }
        .into()
    }

    /// Returns `true` for a client-side timeout after which the provider
    /// may still have applied the request.
    pub fn possibly_applied(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::Timeout {
                possibly_applied: true,
                ..
            })
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Domain(DomainError::DeviceBusy { .. }))
    }

    /// Classify this error for callers deciding whether to retry.
    pub fn retry_advice(&self) -> RetryAdvice {
        match self {
            Self::Transport(_) | Self::Domain(DomainError::DeviceBusy { .. }) => {
                RetryAdvice::SafeToRetry
            }
            Self::Domain(DomainError::Rejected { kind, .. }) if kind.is_transient() => {
                RetryAdvice::SafeToRetry
            }
            Self::Domain(_) => RetryAdvice::ManualIntervention,
            Self::Saga(SagaFailure::NoneAttempted { cause, .. }) if cause.possibly_applied() => {
                RetryAdvice::ManualIntervention
            }
            Self::Saga(SagaFailure::NoneAttempted { cause, .. }) => match cause.retry_advice() {
                RetryAdvice::ManualIntervention => RetryAdvice::ManualIntervention,
                _ => RetryAdvice::SafeToRetry,
            },
            Self::Saga(SagaFailure::Partial { .. } | SagaFailure::RestartAfterPartial { .. }) => {
                RetryAdvice::ResumeStepOnly
            }
            Self::Saga(SagaFailure::Unconfirmed { .. } | SagaFailure::NothingToResume { .. })
            | Self::AuthenticationFailed { .. }
            | Self::ValidationFailed { .. }
            | Self::Config { .. }
            | Self::Internal(_) => RetryAdvice::ManualIntervention,
        }
    }
}
