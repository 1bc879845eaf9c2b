// ── Command gateway ──
//
// Typed boundary to the external provisioning system. Implementations map
// requests and responses and nothing else: no retries, no caching, no
// ordering. Everything above this trait is provider-agnostic.

mod http;

pub use http::HttpGateway;

use async_trait::async_trait;
use simsync_api::ProviderErrorKind;
use thiserror::Error;

use crate::model::{BindingInfo, EndpointId, LineId, LineSnapshot, NetworkPreference};

/// Failure reported by a gateway call.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("provider unreachable: {0}")]
    Transport(String),

    /// The transport gave up waiting. The request may have been delivered.
    #[error("provider request timed out")]
    Timeout,

    #[error("provider error ({kind}): {message}")]
    Provider {
        kind: ProviderErrorKind,
        message: String,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("unexpected provider payload: {0}")]
    Decode(String),
}

impl From<simsync_api::Error> for GatewayError {
    fn from(err: simsync_api::Error) -> Self {
        match err {
            simsync_api::Error::Authentication { message } => Self::Authentication(message),
            simsync_api::Error::Transport(ref e) if e.is_timeout() => Self::Timeout,
            simsync_api::Error::Transport(e) => Self::Transport(e.to_string()),
            simsync_api::Error::InvalidUrl(e) => Self::Transport(format!("invalid URL: {e}")),
            simsync_api::Error::Tls(msg) => Self::Transport(format!("TLS error: {msg}")),
            simsync_api::Error::Provider { kind, message, .. } => Self::Provider { kind, message },
            simsync_api::Error::Deserialization { message, .. } => Self::Decode(message),
        }
    }
}

/// Operations the engine needs from the provisioning provider.
///
/// Attribute setters carry absolute target values. `terminate_endpoint` and
/// `create_endpoint` are one-shot and must not be repeated blindly.
#[async_trait]
pub trait CommandGateway: Send + Sync {
    async fn fetch_line_details(&self, line: &LineId) -> Result<LineSnapshot, GatewayError>;

    async fn terminate_endpoint(&self, endpoint: &EndpointId) -> Result<(), GatewayError>;

    async fn create_endpoint(
        &self,
        binding: &BindingInfo,
        display_name: &str,
    ) -> Result<EndpointId, GatewayError>;

    async fn set_freeze(&self, endpoint: &EndpointId, freeze: bool) -> Result<(), GatewayError>;

    async fn set_imei_lock(
        &self,
        endpoint: &EndpointId,
        iccid: &str,
        lock: bool,
    ) -> Result<(), GatewayError>;

    async fn set_network_preference(
        &self,
        endpoint: &EndpointId,
        preference: NetworkPreference,
    ) -> Result<(), GatewayError>;

    async fn change_package(&self, endpoint: &EndpointId, package_id: u32)
    -> Result<(), GatewayError>;

    /// Whether a client-side timeout guarantees the provider did nothing.
    /// Most providers make no such promise.
    fn no_partial_effect_on_timeout(&self) -> bool {
        false
    }
}
