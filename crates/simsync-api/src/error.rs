use thiserror::Error;

use crate::classify::{ProviderErrorKind, classify};

/// Top-level error type for the `simsync-api` crate.
///
/// Covers every failure mode of the provisioning provider surface:
/// authentication, transport, provider-reported failures, and decoding.
/// `simsync-core` maps these into gateway and domain errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// API key rejected (HTTP 401) or unusable as a header value.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS setup or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Provider ────────────────────────────────────────────────────
    /// The provider answered but reported a failure. `kind` is the
    /// classification of `message` via the rule table.
    #[error("Provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
        status: Option<u16>,
    },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Build a provider error from its free-text message.
    pub fn provider(message: impl Into<String>, status: Option<u16>) -> Self {
        let message = message.into();
        Self::Provider {
            kind: classify(&message),
            message,
            status,
        }
    }

    /// Returns `true` if the request timed out on the client side.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_timeout())
    }

    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Provider { kind, .. } => kind.is_transient(),
            _ => false,
        }
    }

    /// Returns `true` if the provider does not know the line.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Provider {
                kind: ProviderErrorKind::NotFound,
                ..
            }
        )
    }

    /// The provider error classification, if any.
    pub fn provider_kind(&self) -> Option<&ProviderErrorKind> {
        match self {
            Self::Provider { kind, .. } => Some(kind),
            _ => None,
        }
    }
}
