// ── Per-line slot and access grants ──
//
// One `LineSlot` per tracked line. The gate is shared by refreshes and
// mutations and taken exclusively by a reprovisioning run; each mutable
// attribute has its own mutex underneath the gate. State lives in a
// `watch` channel so subscribers see every transition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::future::{BoxFuture, Shared};
use strum::IntoEnumIterator;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, watch};

use crate::error::CoreError;
use crate::model::{Attribute, DeviceLineState, LineId, LineSnapshot, ReprovisioningRecord};

/// A coalesced refresh that later callers can join.
pub(crate) type RefreshFlight = Shared<BoxFuture<'static, Result<LineSnapshot, CoreError>>>;

/// What a grant permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Fetch and merge. Compatible with other refreshes and mutations.
    Refresh,
    /// Change one attribute. Excludes other mutations of the same attribute.
    Mutate(Attribute),
    /// Exclusive access for a reprovisioning run.
    Saga,
}

pub(crate) struct LineSlot {
    line: LineId,
    gate: Arc<RwLock<()>>,
    attribute_locks: BTreeMap<Attribute, Arc<Mutex<()>>>,
    saga_claimed: AtomicBool,
    /// Current refresh flight, tagged with a generation so a finished
    /// flight only clears itself.
    pub(crate) flight: Mutex<Option<(u64, RefreshFlight)>>,
    pub(crate) flight_generation: AtomicU64,
    state: watch::Sender<DeviceLineState>,
}

impl LineSlot {
    pub(crate) fn new(line: LineId) -> Self {
        let (state, _) = watch::channel(DeviceLineState::new(line.clone()));
        Self {
            attribute_locks: Attribute::iter()
                .map(|a| (a, Arc::new(Mutex::new(()))))
                .collect(),
            line,
            gate: Arc::new(RwLock::new(())),
            saga_claimed: AtomicBool::new(false),
            flight: Mutex::new(None),
            flight_generation: AtomicU64::new(0),
            state,
        }
    }

    pub(crate) fn line(&self) -> &LineId {
        &self.line
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub(crate) fn state(&self) -> DeviceLineState {
        self.state.borrow().clone()
    }

    /// Read a projection of the state without cloning all of it.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&DeviceLineState) -> R) -> R {
        f(&self.state.borrow())
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DeviceLineState> {
        self.state.subscribe()
    }

    /// No grant is held and no reprovisioning or mutation is pending.
    pub(crate) fn is_idle(&self) -> bool {
        !self.saga_claimed.load(Ordering::Acquire)
            && self.gate.try_write().is_ok()
            && self.read(|s| s.in_flight.is_empty() && !s.saga_in_progress())
    }

    // ── Writes (grant required) ──────────────────────────────────────

    /// Apply `f` to the line state and notify subscribers.
    pub(crate) fn update<R>(
        &self,
        grant: &LineGrant,
        f: impl FnOnce(&mut DeviceLineState) -> R,
    ) -> Result<R, CoreError> {
        self.check_owner(grant)?;
        let mut output = None;
        self.state.send_modify(|state| output = Some(f(state)));
        output.ok_or_else(|| CoreError::Internal("state update did not run".into()))
    }

    /// Write the reprovisioning record. Only the exclusive grant may.
    pub(crate) fn update_record<R>(
        &self,
        grant: &LineGrant,
        f: impl FnOnce(&mut DeviceLineState, &mut ReprovisioningRecord) -> R,
    ) -> Result<R, CoreError> {
        if grant.kind() != AccessKind::Saga {
            return Err(CoreError::Internal(format!(
                "reprovisioning record of {} written without exclusive access",
                self.line
            )));
        }
        self.update(grant, |state| {
            let mut record = state.saga.take()?;
            let out = f(state, &mut record);
            state.saga = Some(record);
            Some(out)
        })?
        .ok_or_else(|| CoreError::Internal(format!("line {} has no reprovisioning record", self.line)))
    }

    fn check_owner(&self, grant: &LineGrant) -> Result<(), CoreError> {
        if std::ptr::eq(Arc::as_ptr(&grant.slot), self) {
            Ok(())
        } else {
            Err(CoreError::Internal(format!(
                "grant for {} used on line {}",
                grant.slot.line, self.line
            )))
        }
    }

    // ── Acquisition ──────────────────────────────────────────────────

    pub(crate) async fn acquire(self: &Arc<Self>, kind: AccessKind) -> Result<LineGrant, CoreError> {
        let hold = match kind {
            AccessKind::Refresh => Hold::Shared(Arc::clone(&self.gate).read_owned().await),
            AccessKind::Mutate(attribute) => {
                self.ensure_mutable()?;
                let gate = Arc::clone(&self.gate)
                    .try_read_owned()
                    .map_err(|_| CoreError::busy(&self.line, "reprovisioning in progress"))?;
                let lock = self
                    .attribute_locks
                    .get(&attribute)
                    .cloned()
                    .ok_or_else(|| CoreError::Internal(format!("no lock for {attribute}")))?;
                let attr = lock.lock_owned().await;
                // A reprovisioning may have claimed the line while we queued.
                self.ensure_mutable()?;
                Hold::Attribute {
                    _gate: gate,
                    _attr: attr,
                    attribute,
                }
            }
            AccessKind::Saga => {
                if self
                    .saga_claimed
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(CoreError::busy(&self.line, "reprovisioning in progress"));
                }
                // Released by the grant once built; until then by the claim,
                // so a dropped caller cannot leave the line claimed.
                let mut claim = SagaClaim {
                    slot: self,
                    armed: true,
                };
                let guard = Arc::clone(&self.gate).write_owned().await;
                claim.armed = false;
                Hold::Exclusive(guard)
            }
        };
        Ok(LineGrant {
            slot: Arc::clone(self),
            hold,
        })
    }

    pub(crate) fn ensure_mutable(&self) -> Result<(), CoreError> {
        if self.saga_claimed.load(Ordering::Acquire) || self.read(DeviceLineState::saga_in_progress) {
            Err(CoreError::busy(&self.line, "reprovisioning in progress"))
        } else {
            Ok(())
        }
    }
}

/// Releases a saga claim if acquisition is abandoned.
struct SagaClaim<'a> {
    slot: &'a LineSlot,
    armed: bool,
}

impl Drop for SagaClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.saga_claimed.store(false, Ordering::Release);
        }
    }
}

enum Hold {
    Shared(OwnedRwLockReadGuard<()>),
    Attribute {
        _gate: OwnedRwLockReadGuard<()>,
        _attr: OwnedMutexGuard<()>,
        attribute: Attribute,
    },
    Exclusive(OwnedRwLockWriteGuard<()>),
}

/// Permission to act on one line, released on drop.
pub struct LineGrant {
    slot: Arc<LineSlot>,
    hold: Hold,
}

impl LineGrant {
    pub fn kind(&self) -> AccessKind {
        match &self.hold {
            Hold::Shared(_) => AccessKind::Refresh,
            Hold::Attribute { attribute, .. } => AccessKind::Mutate(*attribute),
            Hold::Exclusive(_) => AccessKind::Saga,
        }
    }

    pub fn line(&self) -> &LineId {
        &self.slot.line
    }
}

impl Drop for LineGrant {
    fn drop(&mut self) {
        if matches!(self.hold, Hold::Exclusive(_)) {
            self.slot.saga_claimed.store(false, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for LineGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineGrant")
            .field("line", &self.slot.line)
            .field("kind", &self.kind())
            .finish()
    }
}
