// ── Full-state refresh ──
//
// Fetches a line from the provider and merges it into local state without
// clobbering attributes that a mutation has touched since the fetch was
// issued. Concurrent refreshes of one line share a single fetch.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::FutureExt;
use strum::IntoEnumIterator;
use tracing::{debug, warn};

use crate::coordinator::{AccessKind, DeviceLineCoordinator, LineGrant, LineSlot, RefreshFlight};
use crate::error::{CoreError, TransportError};
use crate::gateway::CommandGateway;
use crate::model::{Attribute, DeviceLineState, EndpointId, LineId, LineSnapshot};

#[derive(Clone)]
pub(crate) struct SyncEngine {
    coordinator: Arc<DeviceLineCoordinator>,
    gateway: Arc<dyn CommandGateway>,
    fetch_timeout: Duration,
}

impl SyncEngine {
    pub(crate) fn new(
        coordinator: Arc<DeviceLineCoordinator>,
        gateway: Arc<dyn CommandGateway>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            coordinator,
            gateway,
            fetch_timeout,
        }
    }

    /// Refresh `line`, joining a refresh that is already running.
    ///
    /// The fetch-and-merge runs in its own task holding the refresh grant,
    /// so it completes even if every caller goes away.
    pub(crate) async fn refresh(&self, line: &LineId) -> Result<LineSnapshot, CoreError> {
        let slot = self.coordinator.slot(line);
        let flight = {
            let mut cell = slot.flight.lock().await;
            if let Some((_, flight)) = cell.as_ref() {
                debug!(line = %line, "joining in-flight refresh");
                flight.clone()
            } else {
                let generation = slot.flight_generation.fetch_add(1, Ordering::Relaxed) + 1;
                let flight = self.launch(Arc::clone(&slot), generation);
                *cell = Some((generation, flight.clone()));
                flight
            }
        };
        flight.await
    }

    fn launch(&self, slot: Arc<LineSlot>, generation: u64) -> RefreshFlight {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let result = match slot.acquire(AccessKind::Refresh).await {
                Ok(grant) => engine.refresh_under(&slot, &grant).await,
                Err(e) => Err(e),
            };
            let mut cell = slot.flight.lock().await;
            if cell.as_ref().is_some_and(|(g, _)| *g == generation) {
                *cell = None;
            }
            result
        });
        handle
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(CoreError::Internal(format!("refresh task failed: {e}"))))
            })
            .boxed()
            .shared()
    }

    /// Fetch and merge while the caller already holds a grant on the line.
    pub(crate) async fn refresh_under(
        &self,
        slot: &LineSlot,
        grant: &LineGrant,
    ) -> Result<LineSnapshot, CoreError> {
        let line = slot.line();
        let since = slot.read(|s| s.revision);

        let fetched =
            match tokio::time::timeout(self.fetch_timeout, self.gateway.fetch_line_details(line)).await {
                Ok(Ok(snapshot)) => snapshot,
                Ok(Err(e)) => {
                    debug!(line = %line, error = %e, "refresh failed");
                    return Err(CoreError::from_gateway("fetch_line_details", e, false));
                }
                Err(_) => {
                    debug!(line = %line, timeout = ?self.fetch_timeout, "refresh timed out");
                    return Err(TransportError::Timeout {
                        operation: "fetch_line_details",
                        possibly_applied: false,
                    }
                    .into());
                }
            };

        let outcome = slot.update(grant, |state| merge(state, &fetched, since))?;
        match &outcome.endpoint {
            EndpointMerge::Mismatch { local, remote } => {
                warn!(line = %line, %local, %remote, "provider reports a different endpoint; keeping local identity");
            }
            EndpointMerge::RemoteMissing { local } => {
                warn!(line = %line, %local, "provider reports no endpoint for this line");
            }
            EndpointMerge::Adopted | EndpointMerge::Unchanged => {}
        }
        debug!(
            line = %line,
            merged = ?outcome.merged,
            held = ?outcome.held,
            "refresh merged"
        );
        Ok(fetched)
    }
}

// ── Merge ───────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EndpointMerge {
    Unchanged,
    Adopted,
    Mismatch { local: EndpointId, remote: EndpointId },
    RemoteMissing { local: EndpointId },
}

#[derive(Debug)]
pub(crate) struct MergeOutcome {
    pub merged: Vec<Attribute>,
    pub held: BTreeSet<Attribute>,
    pub endpoint: EndpointMerge,
}

/// Merge a fetched snapshot into `state`.
///
/// A mutable attribute is held (left as is) when it is in flight or was
/// touched after revision `since`, i.e. after the fetch was issued.
pub(crate) fn merge(state: &mut DeviceLineState, fetched: &LineSnapshot, since: u64) -> MergeOutcome {
    let held: BTreeSet<Attribute> = Attribute::iter()
        .filter(|a| state.in_flight.contains(a) || state.touched_at(*a) > since)
        .collect();

    let merged = state
        .attributes
        .merge_from(&fetched.attributes, |a| held.contains(&a));
    for attribute in &merged {
        state.unconfirmed.remove(attribute);
    }

    let identity_lost = state.identity_lost();
    let endpoint = match (&state.endpoint_id, &fetched.endpoint_id) {
        (None, Some(remote)) if !identity_lost => {
            state.endpoint_id = Some(remote.clone());
            EndpointMerge::Adopted
        }
        (Some(local), Some(remote)) if local != remote => EndpointMerge::Mismatch {
            local: local.clone(),
            remote: remote.clone(),
        },
        (Some(local), None) => EndpointMerge::RemoteMissing {
            local: local.clone(),
        },
        _ => EndpointMerge::Unchanged,
    };

    state.binding = Some(fetched.binding.clone());
    state.last_synced_at = Some(fetched.fetched_at);

    MergeOutcome {
        merged,
        held,
        endpoint,
    }
}
