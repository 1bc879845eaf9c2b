// simsync-core: Synchronization and reprovisioning engine for provisioned mobile lines.
//
// Keeps a local view of each line's provider state, applies optimistic
// single-attribute changes against it, and runs the terminate-and-recreate
// reset of a line's provider identity. All per-line exclusivity goes
// through `DeviceLineCoordinator`.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod model;

mod dispatch;
mod mutation;
mod saga;
mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{EngineConfig, ProviderConfig, TlsVerification};
pub use coordinator::{AccessKind, DeviceLineCoordinator, LineGrant};
pub use engine::{DeviceLine, Engine};
pub use error::{CoreError, DomainError, RetryAdvice, SagaFailure, TransportError};
pub use gateway::{CommandGateway, GatewayError, HttpGateway};

pub use model::{
    Attribute, AttributeMark, BindingInfo, DeviceLineState, EndpointId, LineAttributes, LineId,
    LineSnapshot, Mutation, NetworkPreference, ReprovisioningRecord, SagaPhase,
};

pub use simsync_api::ProviderErrorKind;
