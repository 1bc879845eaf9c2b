// ── Domain model ──
//
// Canonical types for a provisioned line. Wire types from `simsync-api` are
// converted into these in `gateway::http`.

pub mod identity;
pub mod line;
pub mod saga;

pub use identity::{BindingInfo, EndpointId, LineId};
pub use line::{
    Attribute, AttributeMark, DeviceLineState, LineAttributes, LineSnapshot, Mutation,
    NetworkPreference,
};
pub use saga::{ReprovisioningRecord, SagaPhase};
