// simsync-api: Async Rust client for the mobile line provisioning provider

pub mod classify;
pub mod client;
pub mod error;
pub mod models;
pub mod transport;

pub use classify::{ERROR_RULES, ErrorRule, Pattern, ProviderErrorKind, classify};
pub use client::ProvisioningClient;
pub use error::Error;
pub use models::{CreateEndpointRequest, CreatedEndpoint, LineDetails};
pub use transport::{TlsMode, TransportConfig};
