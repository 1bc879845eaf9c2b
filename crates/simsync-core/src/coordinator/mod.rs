// ── Device line coordinator ──
//
// Keyed store of per-line slots and the single authority for exclusivity
// on a line. Refresh, mutation and reprovisioning all go through
// `acquire`; nothing else writes line state. Slots are created lazily and
// no lock ever spans two lines.

mod slot;

pub use slot::{AccessKind, LineGrant};
pub(crate) use slot::{LineSlot, RefreshFlight};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{DeviceLineState, LineId};

/// Per-line mutual exclusion and ordering authority.
#[derive(Default)]
pub struct DeviceLineCoordinator {
    slots: DashMap<LineId, Arc<LineSlot>>,
}

impl DeviceLineCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for `line`, created on first access.
    pub(crate) fn slot(&self, line: &LineId) -> Arc<LineSlot> {
        if let Some(slot) = self.slots.get(line) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(line.clone())
                .or_insert_with(|| {
                    debug!(line = %line, "tracking new line");
                    Arc::new(LineSlot::new(line.clone()))
                })
                .value(),
        )
    }

    /// Obtain a grant of `kind` on `line`.
    ///
    /// `Mutate` and `Saga` fail fast with `DeviceBusy` when a reprovisioning
    /// holds or has claimed the line; `Refresh` waits for it instead.
    pub async fn acquire(&self, line: &LineId, kind: AccessKind) -> Result<LineGrant, CoreError> {
        let slot = self.slot(line);
        let grant = slot.acquire(kind).await?;
        debug!(line = %line, ?kind, "grant acquired");
        Ok(grant)
    }

    /// Current state of `line`.
    pub fn state(&self, line: &LineId) -> DeviceLineState {
        self.slot(line).state()
    }

    pub fn subscribe(&self, line: &LineId) -> watch::Receiver<DeviceLineState> {
        self.slot(line).subscribe()
    }

    /// Every line that has been accessed and not forgotten.
    pub fn lines(&self) -> Vec<LineId> {
        let mut lines: Vec<LineId> = self.slots.iter().map(|e| e.key().clone()).collect();
        lines.sort();
        lines
    }

    /// Drop the cached state of an idle line. Returns `false` (and keeps the
    /// line) while anything is in progress on it or a record is retained.
    pub fn forget(&self, line: &LineId) -> bool {
        let removed = self
            .slots
            .remove_if(line, |_, slot| {
                Arc::strong_count(slot) == 1 && slot.is_idle() && slot.read(|s| s.saga.is_none())
            })
            .is_some();
        if removed {
            debug!(line = %line, "forgot idle line");
        }
        removed
    }
}
