// ── Engine facade ──
//
// Entry point for consumers. Owns the coordinator and the three operation
// components, hands out per-line handles and runs the optional periodic
// refresh in the background.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ProviderConfig};
use crate::coordinator::DeviceLineCoordinator;
use crate::error::CoreError;
use crate::gateway::{CommandGateway, HttpGateway};
use crate::model::{DeviceLineState, LineId, LineSnapshot, Mutation, ReprovisioningRecord};
use crate::mutation::MutationController;
use crate::saga::ReprovisioningSaga;
use crate::sync::SyncEngine;

/// Synchronization and reprovisioning engine.
///
/// Cheaply cloneable via `Arc<EngineInner>`. Line state is created lazily
/// on first access and kept until [`forget`](Self::forget).
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    coordinator: Arc<DeviceLineCoordinator>,
    sync: SyncEngine,
    mutations: MutationController,
    saga: ReprovisioningSaga,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over any gateway. Does not start background tasks.
    pub fn new(config: EngineConfig, gateway: Arc<dyn CommandGateway>) -> Self {
        let coordinator = Arc::new(DeviceLineCoordinator::new());
        let sync = SyncEngine::new(
            Arc::clone(&coordinator),
            Arc::clone(&gateway),
            config.fetch_timeout,
        );
        let mutations = MutationController::new(
            Arc::clone(&coordinator),
            Arc::clone(&gateway),
            sync.clone(),
            config.mutation_timeout,
        );
        let saga = ReprovisioningSaga::new(
            Arc::clone(&coordinator),
            gateway,
            sync.clone(),
            config.saga_step_timeout,
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                coordinator,
                sync,
                mutations,
                saga,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Build an engine talking to the provider's HTTP API.
    pub fn with_provider(config: EngineConfig, provider: &ProviderConfig) -> Result<Self, CoreError> {
        let gateway = HttpGateway::new(provider)?;
        Ok(Self::new(config, Arc::new(gateway)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn coordinator(&self) -> &Arc<DeviceLineCoordinator> {
        &self.inner.coordinator
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the periodic refresh when an interval is configured.
    /// Calling it again while the refresh runs does nothing.
    pub async fn start(&self) {
        let interval = self.inner.config.refresh_interval;
        if interval.is_zero() {
            debug!("periodic refresh disabled");
            return;
        }
        let mut handles = self.inner.task_handles.lock().await;
        if !handles.is_empty() {
            debug!("periodic refresh already running");
            return;
        }
        handles.push(tokio::spawn(refresh_task(self.clone(), self.inner.cancel.clone())));
        info!(interval = ?interval, "periodic refresh started");
    }

    /// Stop background tasks. Operations already dispatched keep running.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        debug!("engine stopped");
    }

    // ── Lines ────────────────────────────────────────────────────────

    /// Handle to one line. Creating a handle does not contact the provider.
    pub fn line(&self, id: impl Into<LineId>) -> DeviceLine {
        DeviceLine {
            engine: self.clone(),
            id: id.into(),
        }
    }

    /// Lines currently tracked.
    pub fn lines(&self) -> Vec<LineId> {
        self.inner.coordinator.lines()
    }

    /// Stop tracking an idle line. See [`DeviceLineCoordinator::forget`].
    pub fn forget(&self, line: &LineId) -> bool {
        self.inner.coordinator.forget(line)
    }

    /// Refresh every tracked line concurrently, returning the failures.
    pub async fn refresh_all(&self) -> Vec<(LineId, CoreError)> {
        let lines = self.lines();
        let results = join_all(lines.iter().map(|line| self.inner.sync.refresh(line))).await;
        lines
            .into_iter()
            .zip(results)
            .filter_map(|(line, result)| result.err().map(|e| (line, e)))
            .collect()
    }
}

/// Operations on one line.
#[derive(Clone)]
pub struct DeviceLine {
    engine: Engine,
    id: LineId,
}

impl DeviceLine {
    pub fn id(&self) -> &LineId {
        &self.id
    }

    /// Current cached state.
    pub fn state(&self) -> DeviceLineState {
        self.engine.inner.coordinator.state(&self.id)
    }

    /// Receive every state transition of this line.
    pub fn subscribe(&self) -> watch::Receiver<DeviceLineState> {
        self.engine.inner.coordinator.subscribe(&self.id)
    }

    /// Fetch the provider state and merge it.
    pub async fn refresh(&self) -> Result<LineSnapshot, CoreError> {
        self.engine.inner.sync.refresh(&self.id).await
    }

    /// Apply one attribute change optimistically.
    pub async fn mutate(&self, mutation: Mutation) -> Result<(), CoreError> {
        self.engine.inner.mutations.mutate(&self.id, mutation).await
    }

    /// Replace the provider identity of the line.
    pub async fn reprovision(&self, display_name: impl Into<String>) -> Result<ReprovisioningRecord, CoreError> {
        self.engine
            .inner
            .saga
            .reprovision(&self.id, display_name.into())
            .await
    }

    /// Retry the provisioning step of a partially failed reprovisioning.
    pub async fn resume_reprovision(&self) -> Result<ReprovisioningRecord, CoreError> {
        self.engine.inner.saga.resume(&self.id).await
    }

    /// Install a finished reprovisioning record saved by an earlier process.
    ///
    /// A `FailedPartial` record also drops the local endpoint, so only a
    /// resume can give the line an identity again. Returns `false` when the
    /// line already has a record.
    pub async fn restore_reprovision(&self, record: ReprovisioningRecord) -> Result<bool, CoreError> {
        self.engine.inner.saga.restore(&self.id, record).await
    }

    /// Acknowledge and drop a finished reprovisioning record.
    pub async fn clear_reprovision(&self) -> Result<Option<ReprovisioningRecord>, CoreError> {
        self.engine.inner.saga.clear(&self.id).await
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Periodically refresh every tracked line.
async fn refresh_task(engine: Engine, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(engine.inner.config.refresh_interval);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                for (line, e) in engine.refresh_all().await {
                    warn!(line = %line, error = %e, "periodic refresh failed");
                }
            }
        }
    }
}
