// ── Optimistic single-attribute mutations ──
//
// A mutation flips the local value first, dispatches one absolute-value
// call to the provider, then confirms or rolls back. The dispatch runs in
// its own task and owns the attribute grant until the provider call ends,
// including after a client-side timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::coordinator::{AccessKind, DeviceLineCoordinator, LineGrant, LineSlot};
use crate::dispatch::{Bounded, bounded};
use crate::error::{CoreError, DomainError, TransportError};
use crate::gateway::{CommandGateway, GatewayError};
use crate::model::{Attribute, DeviceLineState, EndpointId, LineId, Mutation};
use crate::sync::SyncEngine;

#[derive(Clone)]
pub(crate) struct MutationController {
    coordinator: Arc<DeviceLineCoordinator>,
    gateway: Arc<dyn CommandGateway>,
    sync: SyncEngine,
    timeout: Duration,
}

/// Everything the dispatch task needs once the optimistic value is set.
struct Pending {
    slot: Arc<LineSlot>,
    grant: LineGrant,
    mutation: Mutation,
    previous: Mutation,
    endpoint: EndpointId,
    iccid: String,
}

impl MutationController {
    pub(crate) fn new(
        coordinator: Arc<DeviceLineCoordinator>,
        gateway: Arc<dyn CommandGateway>,
        sync: SyncEngine,
        timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            gateway,
            sync,
            timeout,
        }
    }

    pub(crate) async fn mutate(&self, line: &LineId, mutation: Mutation) -> Result<(), CoreError> {
        let slot = self.coordinator.slot(line);
        let attribute = mutation.attribute();

        slot.ensure_mutable()?;
        if slot.read(DeviceLineState::identity_lost) {
            return Err(CoreError::not_eligible(
                line,
                "the last reprovisioning left the line without an endpoint",
            ));
        }
        if slot.read(|s| s.endpoint_id.is_none()) {
            debug!(line = %line, "line not synced yet; refreshing before mutation");
            self.sync.refresh(line).await?;
        }

        let grant = slot.acquire(AccessKind::Mutate(attribute)).await?;

        let (endpoint, iccid) = slot.read(|s| {
            (
                s.endpoint_id.clone(),
                s.binding
                    .as_ref()
                    .map_or_else(|| line.to_string(), |b| b.iccid.clone()),
            )
        });
        let Some(endpoint) = endpoint else {
            return Err(CoreError::not_eligible(line, "no provisioned endpoint"));
        };

        let already = slot.read(|s| {
            s.attributes.current(attribute) == mutation && !s.unconfirmed.contains(&attribute)
        });
        if already {
            return Err(DomainError::AlreadyInState {
                attribute,
                value: mutation.value_string(),
            }
            .into());
        }

        let previous = slot.update(&grant, |state| {
            let previous = state.attributes.current(attribute);
            state.attributes.apply(&mutation);
            state.in_flight.insert(attribute);
            stamp(state, attribute);
            previous
        })?;
        debug!(line = %line, %mutation, %previous, "optimistic value set");

        let pending = Pending {
            slot,
            grant,
            mutation,
            previous,
            endpoint,
            iccid,
        };
        let (tx, rx) = oneshot::channel();
        let controller = self.clone();
        tokio::spawn(async move { controller.dispatch(pending, tx).await });

        rx.await
            .map_err(|_| CoreError::Internal("mutation task ended without a result".into()))?
    }

    async fn dispatch(&self, pending: Pending, reply: oneshot::Sender<Result<(), CoreError>>) {
        let Pending {
            slot,
            grant,
            mutation,
            previous,
            endpoint,
            iccid,
        } = pending;
        let line = slot.line().clone();
        let attribute = mutation.attribute();
        let operation = operation(mutation);
        let possibly_applied = !self.gateway.no_partial_effect_on_timeout();

        let call = send(self.gateway.as_ref(), &endpoint, &iccid, mutation);
        let (result, late) = match bounded(self.timeout, call).await {
            Bounded::Completed(Ok(())) => {
                let settled = slot.update(&grant, |state| confirm(state, mutation));
                info!(line = %line, %mutation, "mutation confirmed");
                (settled, None)
            }
            Bounded::Completed(Err(GatewayError::Timeout)) => {
                let settled = slot.update(&grant, |state| rollback(state, previous, possibly_applied));
                warn!(line = %line, %mutation, "transport timed out; rolled back");
                let err = TransportError::Timeout {
                    operation,
                    possibly_applied,
                };
                (settled.and(Err(err.into())), None)
            }
            Bounded::Completed(Err(e)) => {
                let settled = slot.update(&grant, |state| rollback(state, previous, false));
                warn!(line = %line, %mutation, error = %e, "mutation failed; rolled back");
                (settled.and(Err(CoreError::from_gateway(operation, e, possibly_applied))), None)
            }
            Bounded::TimedOut(call) => {
                let settled = slot.update(&grant, |state| rollback(state, previous, possibly_applied));
                warn!(
                    line = %line,
                    %mutation,
                    timeout = ?self.timeout,
                    possibly_applied,
                    "mutation timed out; rolled back, call left running"
                );
                let err = TransportError::Timeout {
                    operation,
                    possibly_applied,
                };
                (settled.and(Err(err.into())), Some(call))
            }
        };

        // The caller may be gone; the state transition above already happened.
        let _ = reply.send(result);

        if let Some(call) = late {
            let outcome = call.await;
            match slot.update(&grant, |state| settle_late(state, mutation, &outcome)) {
                Ok(()) => info!(line = %line, %mutation, ok = outcome.is_ok(), "timed-out mutation finished"),
                Err(e) => warn!(line = %line, error = %e, "could not record late mutation outcome"),
            }
        }
        debug!(line = %line, %attribute, "attribute released");
        drop(grant);
    }
}

// ── Dispatch helpers ────────────────────────────────────────────────

fn operation(mutation: Mutation) -> &'static str {
    match mutation {
        Mutation::Suspend(_) => "set_freeze",
        Mutation::ImeiLock(_) => "set_imei_lock",
        Mutation::NetworkPreference(_) => "set_network_preference",
        Mutation::Package(_) => "change_package",
    }
}

async fn send(
    gateway: &dyn CommandGateway,
    endpoint: &EndpointId,
    iccid: &str,
    mutation: Mutation,
) -> Result<(), GatewayError> {
    match mutation {
        Mutation::Suspend(freeze) => gateway.set_freeze(endpoint, freeze).await,
        Mutation::ImeiLock(lock) => gateway.set_imei_lock(endpoint, iccid, lock).await,
        Mutation::NetworkPreference(pref) => gateway.set_network_preference(endpoint, pref).await,
        Mutation::Package(id) => gateway.change_package(endpoint, id).await,
    }
}

// ── State transitions ───────────────────────────────────────────────

/// Bump the line revision and mark `attribute` as touched at it.
fn stamp(state: &mut DeviceLineState, attribute: Attribute) {
    state.revision += 1;
    let revision = state.revision;
    state.marks.entry(attribute).or_default().revision = revision;
}

fn confirm(state: &mut DeviceLineState, mutation: Mutation) {
    let attribute = mutation.attribute();
    state.in_flight.remove(&attribute);
    state.unconfirmed.remove(&attribute);
    stamp(state, attribute);
    state.marks.entry(attribute).or_default().confirmed_at = Some(Utc::now());
}

fn rollback(state: &mut DeviceLineState, previous: Mutation, possibly_applied: bool) {
    let attribute = previous.attribute();
    state.attributes.apply(&previous);
    state.in_flight.remove(&attribute);
    if possibly_applied {
        state.unconfirmed.insert(attribute);
    }
    stamp(state, attribute);
}

/// Record the outcome of a call that outlived its timeout.
fn settle_late(state: &mut DeviceLineState, mutation: Mutation, outcome: &Result<(), GatewayError>) {
    let attribute = mutation.attribute();
    match outcome {
        Ok(()) => {
            state.attributes.apply(&mutation);
            state.unconfirmed.remove(&attribute);
            stamp(state, attribute);
            state.marks.entry(attribute).or_default().confirmed_at = Some(Utc::now());
        }
        Err(GatewayError::Timeout | GatewayError::Transport(_)) => {}
        Err(_) => {
            state.unconfirmed.remove(&attribute);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LineId, NetworkPreference};

    fn state() -> DeviceLineState {
        let mut s = DeviceLineState::new(LineId::new("1"));
        s.attributes.network_preference = NetworkPreference::Lte;
        s
    }

    #[test]
    fn rollback_restores_and_flags_unconfirmed() {
        let mut s = state();
        s.attributes.apply(&Mutation::NetworkPreference(NetworkPreference::FiveG));
        s.in_flight.insert(Attribute::NetworkPreference);

        rollback(&mut s, Mutation::NetworkPreference(NetworkPreference::Lte), true);

        assert_eq!(s.attributes.network_preference, NetworkPreference::Lte);
        assert!(s.in_flight.is_empty());
        assert!(s.unconfirmed.contains(&Attribute::NetworkPreference));
        assert_eq!(s.touched_at(Attribute::NetworkPreference), s.revision);
    }

    #[test]
    fn confirm_clears_flags_and_stamps_time() {
        let mut s = state();
        s.in_flight.insert(Attribute::Package);
        s.unconfirmed.insert(Attribute::Package);

        confirm(&mut s, Mutation::Package(5));

        assert!(s.in_flight.is_empty());
        assert!(s.unconfirmed.is_empty());
        assert!(s.marks[&Attribute::Package].confirmed_at.is_some());
    }

    #[test]
    fn late_success_applies_value() {
        let mut s = state();
        s.unconfirmed.insert(Attribute::Suspended);

        settle_late(&mut s, Mutation::Suspend(true), &Ok(()));

        assert!(s.attributes.suspended);
        assert!(s.unconfirmed.is_empty());
    }

    #[test]
    fn late_transport_failure_stays_unconfirmed() {
        let mut s = state();
        s.unconfirmed.insert(Attribute::Suspended);

        settle_late(&mut s, Mutation::Suspend(true), &Err(GatewayError::Timeout));

        assert!(!s.attributes.suspended);
        assert!(s.unconfirmed.contains(&Attribute::Suspended));
    }
}
