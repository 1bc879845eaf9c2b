// ── Reprovisioning record ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::{BindingInfo, EndpointId};

/// Phase of a comprehensive reset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
pub enum SagaPhase {
    Validating,
    Terminating,
    Provisioning,
    Swapping,
    Committed,
    /// Failed before the old identity was touched.
    FailedNoneAttempted,
    /// The old identity is gone and no new one is recorded.
    FailedPartial,
}

impl SagaPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::FailedNoneAttempted | Self::FailedPartial
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::FailedNoneAttempted | Self::FailedPartial)
    }
}

/// Audit trail of one reprovisioning run, kept on the line until cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprovisioningRecord {
    pub id: Uuid,
    pub phase: SagaPhase,
    /// Phase that was executing when the run failed.
    pub failed_phase: Option<SagaPhase>,
    pub old_endpoint_id: Option<EndpointId>,
    pub new_endpoint_id: Option<EndpointId>,
    pub display_name: String,
    /// Binding captured during validation; reused on resume.
    pub binding: Option<BindingInfo>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// The old endpoint may have been terminated by a call whose outcome
    /// never arrived. A fresh run first checks the provider.
    #[serde(default)]
    pub termination_unconfirmed: bool,
    /// Number of provisioning attempts (initial run plus resumes).
    pub attempts: u32,
}

impl ReprovisioningRecord {
    pub(crate) fn start(display_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase: SagaPhase::Validating,
            failed_phase: None,
            old_endpoint_id: None,
            new_endpoint_id: None,
            display_name: display_name.into(),
            binding: None,
            started_at: Utc::now(),
            ended_at: None,
            failure_reason: None,
            termination_unconfirmed: false,
            attempts: 0,
        }
    }

    pub(crate) fn fail(&mut self, terminal: SagaPhase, reason: impl Into<String>) {
        self.failed_phase = Some(self.phase);
        self.phase = terminal;
        self.failure_reason = Some(reason.into());
        self.ended_at = Some(Utc::now());
    }
}
