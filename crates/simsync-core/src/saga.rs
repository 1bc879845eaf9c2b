// ── Comprehensive reset ──
//
// Replaces the provider identity of a line: validate, terminate the old
// endpoint, create a new one under the same binding, swap. The run holds
// the line exclusively and executes in its own task. It never retries on
// its own; a run that lost the old identity stops in `FailedPartial` and
// can only be resumed at the provisioning step.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::coordinator::{AccessKind, DeviceLineCoordinator, LineGrant, LineSlot};
use crate::dispatch::{Bounded, bounded};
use crate::error::{CoreError, SagaFailure, TransportError};
use crate::gateway::{CommandGateway, GatewayError};
use crate::model::{
    BindingInfo, DeviceLineState, EndpointId, LineId, ReprovisioningRecord, SagaPhase,
};
use crate::sync::SyncEngine;

type SagaResult = Result<ReprovisioningRecord, CoreError>;

/// Where a run starts.
enum Entry {
    Fresh { display_name: String },
    Resume,
}

/// A provider call that outlived its step timeout.
enum Late {
    Terminate(Pin<Box<BoxFuture<'static, Result<(), GatewayError>>>>),
    Create(Pin<Box<BoxFuture<'static, Result<EndpointId, GatewayError>>>>),
}

#[derive(Clone)]
pub(crate) struct ReprovisioningSaga {
    coordinator: Arc<DeviceLineCoordinator>,
    gateway: Arc<dyn CommandGateway>,
    sync: SyncEngine,
    step_timeout: Duration,
}

impl ReprovisioningSaga {
    pub(crate) fn new(
        coordinator: Arc<DeviceLineCoordinator>,
        gateway: Arc<dyn CommandGateway>,
        sync: SyncEngine,
        step_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            gateway,
            sync,
            step_timeout,
        }
    }

    // ── Entry points ─────────────────────────────────────────────────

    /// Run a full reset from validation.
    pub(crate) async fn reprovision(&self, line: &LineId, display_name: String) -> SagaResult {
        let slot = self.coordinator.slot(line);
        let grant = slot.acquire(AccessKind::Saga).await?;
        if slot.read(DeviceLineState::identity_lost) {
            return Err(SagaFailure::RestartAfterPartial { line: line.clone() }.into());
        }
        self.spawn(slot, grant, Entry::Fresh { display_name }).await
    }

    /// Retry only the provisioning step of a `FailedPartial` run.
    pub(crate) async fn resume(&self, line: &LineId) -> SagaResult {
        let slot = self.coordinator.slot(line);
        let grant = slot.acquire(AccessKind::Saga).await?;
        if !slot.read(DeviceLineState::identity_lost) {
            return Err(SagaFailure::NothingToResume { line: line.clone() }.into());
        }
        self.spawn(slot, grant, Entry::Resume).await
    }

    /// Drop a terminal record. Busy while a run holds the line.
    pub(crate) async fn clear(&self, line: &LineId) -> Result<Option<ReprovisioningRecord>, CoreError> {
        let slot = self.coordinator.slot(line);
        let grant = slot.acquire(AccessKind::Saga).await?;
        let cleared = slot.update(&grant, |state| state.saga.take())?;
        if let Some(record) = &cleared {
            info!(line = %line, record = %record.id, phase = %record.phase, "reprovisioning record cleared");
        }
        Ok(cleared)
    }

    /// Install a finished record kept outside the engine.
    ///
    /// Returns `false` when the line already holds a record, which wins.
    pub(crate) async fn restore(&self, line: &LineId, record: ReprovisioningRecord) -> Result<bool, CoreError> {
        if !record.phase.is_terminal() {
            return Err(CoreError::ValidationFailed {
                message: format!("reprovisioning record {} is still {}", record.id, record.phase),
            });
        }
        let slot = self.coordinator.slot(line);
        let grant = slot.acquire(AccessKind::Saga).await?;
        let (id, phase) = (record.id, record.phase);
        let restored = slot.update(&grant, |state| {
            if state.saga.is_some() {
                return false;
            }
            if record.phase == SagaPhase::FailedPartial {
                state.endpoint_id = None;
            }
            state.saga = Some(record);
            true
        })?;
        if restored {
            debug!(line = %line, record = %id, %phase, "reprovisioning record restored");
        }
        Ok(restored)
    }

    async fn spawn(&self, slot: Arc<LineSlot>, grant: LineGrant, entry: Entry) -> SagaResult {
        let (tx, rx) = oneshot::channel();
        let saga = self.clone();
        tokio::spawn(async move { saga.run(slot, grant, entry, tx).await });
        rx.await
            .map_err(|_| CoreError::Internal("reprovisioning task ended without a result".into()))?
    }

    async fn run(
        &self,
        slot: Arc<LineSlot>,
        grant: LineGrant,
        entry: Entry,
        reply: oneshot::Sender<SagaResult>,
    ) {
        let line = slot.line().clone();
        let (result, late) = match entry {
            Entry::Fresh { display_name } => self.fresh(&slot, &grant, display_name).await,
            Entry::Resume => self.resume_provisioning(&slot, &grant).await,
        };
        let committed = result.is_ok();
        // The caller may be gone; the record already reflects the outcome.
        if let Some(late) = late {
            let _ = reply.send(result);
            settle_late(&slot, &grant, late).await;
            drop(grant);
        } else {
            drop(grant);
            let _ = reply.send(result);
        }

        if !committed {
            return;
        }
        if let Err(e) = self.sync.refresh(&line).await {
            warn!(line = %line, error = %e, "post-reprovisioning refresh failed");
        }
    }

    // ── Phases ───────────────────────────────────────────────────────

    async fn fresh(
        &self,
        slot: &LineSlot,
        grant: &LineGrant,
        display_name: String,
    ) -> (SagaResult, Option<Late>) {
        let line = slot.line();
        let unconfirmed = slot.read(|s| {
            s.saga
                .as_ref()
                .filter(|r| r.termination_unconfirmed)
                .and_then(|r| r.old_endpoint_id.clone())
        });
        if let Some(old) = unconfirmed {
            if let Err(e) = self.verify_termination(slot, grant, &old).await {
                return (Err(e), None);
            }
        }

        let record = ReprovisioningRecord::start(display_name);
        info!(line = %line, record = %record.id, "reprovisioning started");
        if let Err(e) = slot.update(grant, |state| state.saga = Some(record)) {
            return (Err(e), None);
        }

        // Validating
        if let Err(e) = self.sync.refresh_under(slot, grant).await {
            return (Err(fail(slot, grant, SagaPhase::FailedNoneAttempted, e)), None);
        }
        let (old, binding) = match slot.read(eligibility) {
            Ok(found) => found,
            Err(reason) => {
                let cause = CoreError::not_eligible(line, reason);
                return (Err(fail(slot, grant, SagaPhase::FailedNoneAttempted, cause)), None);
            }
        };

        // Terminating
        let entered = slot.update_record(grant, |_, record| {
            record.phase = SagaPhase::Terminating;
            record.old_endpoint_id = Some(old.clone());
            record.binding = Some(binding.clone());
        });
        if let Err(e) = entered {
            return (Err(e), None);
        }
        debug!(line = %line, endpoint = %old, "terminating old endpoint");

        let gateway = Arc::clone(&self.gateway);
        let endpoint = old.clone();
        let call = async move { gateway.terminate_endpoint(&endpoint).await }.boxed();
        match bounded(self.step_timeout, call).await {
            Bounded::Completed(Ok(())) => {}
            Bounded::Completed(Err(e)) => {
                let cause = CoreError::from_gateway("terminate_endpoint", e, self.possibly_applied());
                return (Err(fail(slot, grant, SagaPhase::FailedNoneAttempted, cause)), None);
            }
            Bounded::TimedOut(call) => {
                let cause = self.step_timed_out("terminate_endpoint");
                let err = fail(slot, grant, SagaPhase::FailedNoneAttempted, cause);
                return (Err(err), Some(Late::Terminate(call)));
            }
        }
        if let Err(e) = slot.update(grant, |state| state.endpoint_id = None) {
            return (Err(e), None);
        }
        info!(line = %line, endpoint = %old, "old endpoint terminated");

        let display_name = slot.read(|s| {
            s.saga
                .as_ref()
                .map(|r| r.display_name.clone())
                .unwrap_or_default()
        });
        self.provision(slot, grant, binding, display_name).await
    }

    async fn resume_provisioning(
        &self,
        slot: &LineSlot,
        grant: &LineGrant,
    ) -> (SagaResult, Option<Late>) {
        let line = slot.line();
        let stored = slot.read(|s| {
            s.saga.as_ref().map(|r| {
                (
                    r.new_endpoint_id.clone(),
                    r.binding.clone().or_else(|| s.binding.clone()),
                    r.display_name.clone(),
                )
            })
        });
        let Some((created, binding, display_name)) = stored else {
            return (Err(SagaFailure::NothingToResume { line: line.clone() }.into()), None);
        };

        if let Some(created) = created {
            info!(line = %line, endpoint = %created, "adopting endpoint created after an earlier timeout");
            return (swap(slot, grant, created), None);
        }
        let Some(binding) = binding else {
            let cause = CoreError::not_eligible(line, "no binding recorded for the line");
            return (Err(fail(slot, grant, SagaPhase::FailedPartial, cause)), None);
        };

        let reopened = slot.update_record(grant, |_, record| {
            record.failed_phase = None;
            record.failure_reason = None;
            record.ended_at = None;
        });
        if let Err(e) = reopened {
            return (Err(e), None);
        }
        info!(line = %line, "resuming reprovisioning at provisioning");
        self.provision(slot, grant, binding, display_name).await
    }

    async fn provision(
        &self,
        slot: &LineSlot,
        grant: &LineGrant,
        binding: BindingInfo,
        display_name: String,
    ) -> (SagaResult, Option<Late>) {
        let line = slot.line();
        let entered = slot.update_record(grant, |_, record| {
            record.phase = SagaPhase::Provisioning;
            record.attempts += 1;
        });
        if let Err(e) = entered {
            return (Err(e), None);
        }
        debug!(line = %line, iccid = %binding.iccid, "creating new endpoint");

        let gateway = Arc::clone(&self.gateway);
        let call = async move { gateway.create_endpoint(&binding, &display_name).await }.boxed();
        match bounded(self.step_timeout, call).await {
            Bounded::Completed(Ok(created)) => (swap(slot, grant, created), None),
            Bounded::Completed(Err(e)) => {
                let cause = CoreError::from_gateway("create_endpoint", e, self.possibly_applied());
                (Err(fail(slot, grant, SagaPhase::FailedPartial, cause)), None)
            }
            Bounded::TimedOut(call) => {
                let cause = self.step_timed_out("create_endpoint");
                let err = fail(slot, grant, SagaPhase::FailedPartial, cause);
                (Err(err), Some(Late::Create(call)))
            }
        }
    }

    /// Settle an earlier terminate whose outcome never arrived.
    ///
    /// Only a provider that still reports `old` lets a fresh run proceed.
    /// A provider with no endpoint turns the earlier run into a partial
    /// failure; any other answer needs an operator.
    async fn verify_termination(
        &self,
        slot: &LineSlot,
        grant: &LineGrant,
        old: &EndpointId,
    ) -> Result<(), CoreError> {
        let line = slot.line();
        let fetched = self.sync.refresh_under(slot, grant).await?;
        match fetched.endpoint_id {
            Some(remote) if remote == *old => {
                info!(line = %line, endpoint = %old, "old endpoint is still live; earlier terminate did not apply");
                slot.update_record(grant, |_, record| record.termination_unconfirmed = false)?;
                Ok(())
            }
            None => {
                warn!(line = %line, endpoint = %old, "provider no longer reports the old endpoint; earlier terminate applied");
                slot.update_record(grant, |state, record| {
                    state.endpoint_id = None;
                    record.termination_unconfirmed = false;
                    record.phase = SagaPhase::FailedPartial;
                    record.failed_phase = Some(SagaPhase::Terminating);
                    record.failure_reason =
                        Some(format!("endpoint {old} was terminated by an unconfirmed call"));
                })?;
                Err(SagaFailure::RestartAfterPartial { line: line.clone() }.into())
            }
            Some(remote) => Err(CoreError::not_eligible(
                line,
                format!(
                    "termination of {old} is unconfirmed and the provider reports endpoint {remote}; \
                     clear the reset record once the line is checked"
                ),
            )),
        }
    }

    // ── Failure handling ─────────────────────────────────────────────

    fn possibly_applied(&self) -> bool {
        !self.gateway.no_partial_effect_on_timeout()
    }

    fn step_timed_out(&self, operation: &'static str) -> CoreError {
        TransportError::Timeout {
            operation,
            possibly_applied: self.possibly_applied(),
        }
        .into()
    }
}

/// Keep driving a timed-out call and record what it turned out to do.
async fn settle_late(slot: &LineSlot, grant: &LineGrant, late: Late) {
    let line = slot.line();
    let recorded = match late {
        Late::Terminate(call) => match call.await {
            Ok(()) => {
                warn!(line = %line, "old endpoint was terminated after the step timed out");
                slot.update_record(grant, |state, record| {
                    state.endpoint_id = None;
                    record.termination_unconfirmed = false;
                    record.phase = SagaPhase::FailedPartial;
                    record.failed_phase = Some(SagaPhase::Terminating);
                    record.failure_reason =
                        Some("old endpoint terminated after the step timed out".into());
                })
            }
            Err(e @ (GatewayError::Timeout | GatewayError::Transport(_))) => {
                warn!(line = %line, error = %e, "outcome of timed-out terminate is still unknown");
                Ok(())
            }
            Err(e) => {
                info!(line = %line, error = %e, "timed-out terminate did not take effect");
                slot.update_record(grant, |_, record| record.termination_unconfirmed = false)
            }
        },
        Late::Create(call) => match call.await {
            Ok(created) => {
                warn!(line = %line, endpoint = %created, "new endpoint was created after the step timed out");
                slot.update_record(grant, |_, record| {
                    record.failure_reason = Some(format!(
                        "endpoint {created} was created after the step timed out; resume to adopt it"
                    ));
                    record.new_endpoint_id = Some(created);
                })
            }
            Err(e) => {
                info!(line = %line, error = %e, "timed-out create did not take effect");
                Ok(())
            }
        },
    };
    if let Err(e) = recorded {
        warn!(line = %line, error = %e, "could not record late reprovisioning outcome");
    }
}

/// Install the new endpoint and commit the record.
fn swap(slot: &LineSlot, grant: &LineGrant, created: EndpointId) -> SagaResult {
    slot.update_record(grant, |_, record| record.phase = SagaPhase::Swapping)?;
    let record = slot.update_record(grant, |state, record| {
        state.endpoint_id = Some(created.clone());
        record.new_endpoint_id = Some(created.clone());
        record.phase = SagaPhase::Committed;
        record.failed_phase = None;
        record.failure_reason = None;
        record.ended_at = Some(Utc::now());
        record.clone()
    })?;
    info!(
        line = %slot.line(),
        old = ?record.old_endpoint_id,
        new = %created,
        "reprovisioning committed"
    );
    Ok(record)
}

/// Move the record to the terminal `phase` and build the caller error.
fn fail(slot: &LineSlot, grant: &LineGrant, terminal: SagaPhase, cause: CoreError) -> CoreError {
    let line = slot.line().clone();
    let reason = cause.to_string();
    let unconfirmed = terminal == SagaPhase::FailedNoneAttempted && cause.possibly_applied();
    let phase = match slot.update_record(grant, |_, record| {
        let phase = record.phase;
        record.fail(terminal, reason);
        record.termination_unconfirmed = unconfirmed;
        phase
    }) {
        Ok(phase) => phase,
        Err(e) => return e,
    };
    warn!(line = %line, %phase, outcome = %terminal, error = %cause, "reprovisioning failed");

    let cause = Box::new(cause);
    if terminal == SagaPhase::FailedPartial {
        SagaFailure::Partial { line, phase, cause }.into()
    } else if unconfirmed {
        SagaFailure::Unconfirmed { line, phase, cause }.into()
    } else {
        SagaFailure::NoneAttempted { line, phase, cause }.into()
    }
}

/// Old endpoint and binding of a line that may be reprovisioned.
fn eligibility(state: &DeviceLineState) -> Result<(EndpointId, BindingInfo), String> {
    if !state.attributes.is_active() {
        return Err(format!("status is '{}', expected active", state.attributes.status));
    }
    if state.attributes.suspended {
        return Err("line is suspended".into());
    }
    let endpoint = state
        .endpoint_id
        .clone()
        .ok_or_else(|| "no provisioned endpoint".to_owned())?;
    let binding = state
        .binding
        .clone()
        .ok_or_else(|| "no binding reported by the provider".to_owned())?;
    Ok((endpoint, binding))
}
