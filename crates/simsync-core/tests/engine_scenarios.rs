#![allow(clippy::unwrap_used)]
// End-to-end engine behavior against a scripted in-memory gateway.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use tokio::sync::{Semaphore, mpsc};

use simsync_core::{
    AccessKind, Attribute, BindingInfo, CommandGateway, CoreError, DeviceLine, DomainError,
    EndpointId, Engine, EngineConfig, GatewayError, LineAttributes, LineId, LineSnapshot, Mutation,
    NetworkPreference, ProviderErrorKind, RetryAdvice, SagaFailure, SagaPhase, TransportError,
};

const SIM: &str = "8944500102198304826";

// ── Scripted gateway ────────────────────────────────────────────────

#[derive(Clone)]
enum Step {
    Succeed,
    Fail(GatewayError),
    /// Wait for a permit, then succeed or fail.
    Gated(Arc<Semaphore>, Option<GatewayError>),
    Delay(Duration),
}

#[derive(Default, Clone, Copy)]
struct Counter {
    calls: usize,
    active: usize,
    max_active: usize,
}

struct FakeGateway {
    remote: Mutex<LineSnapshot>,
    steps: Mutex<HashMap<&'static str, VecDeque<Step>>>,
    counters: Mutex<HashMap<&'static str, Counter>>,
    entered: mpsc::UnboundedSender<&'static str>,
    created: AtomicUsize,
    no_partial_effect: bool,
}

struct Active<'a> {
    gateway: &'a FakeGateway,
    op: &'static str,
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        let mut counters = self.gateway.counters.lock().unwrap();
        counters.entry(self.op).or_default().active -= 1;
    }
}

impl FakeGateway {
    fn new(no_partial_effect: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<&'static str>) {
        let (entered, rx) = mpsc::unbounded_channel();
        let gateway = Self {
            remote: Mutex::new(LineSnapshot {
                line_id: LineId::new(SIM),
                endpoint_id: Some(EndpointId::from("ep-1")),
                binding: BindingInfo {
                    iccid: SIM.into(),
                    imei: Some("356938035643809".into()),
                },
                attributes: LineAttributes {
                    suspended: false,
                    imei_locked: false,
                    network_preference: NetworkPreference::Lte,
                    package_id: 3,
                    data_usage_gb: 1.0,
                    max_data_gb: 10.0,
                    status: "Active".into(),
                },
                fetched_at: Utc::now(),
            }),
            steps: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            entered,
            created: AtomicUsize::new(0),
            no_partial_effect,
        };
        (Arc::new(gateway), rx)
    }

    fn script(&self, op: &'static str, step: Step) {
        self.steps
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(step);
    }

    fn calls(&self, op: &'static str) -> usize {
        self.counters.lock().unwrap().get(op).map_or(0, |c| c.calls)
    }

    fn max_active(&self, op: &'static str) -> usize {
        self.counters.lock().unwrap().get(op).map_or(0, |c| c.max_active)
    }

    fn edit_remote(&self, f: impl FnOnce(&mut LineSnapshot)) {
        f(&mut self.remote.lock().unwrap());
    }

    fn enter(&self, op: &'static str) -> Active<'_> {
        let mut counters = self.counters.lock().unwrap();
        let counter = counters.entry(op).or_default();
        counter.calls += 1;
        counter.active += 1;
        counter.max_active = counter.max_active.max(counter.active);
        Active { gateway: self, op }
    }

    async fn run(&self, op: &'static str) -> Result<(), GatewayError> {
        let _active = self.enter(op);
        let step = self
            .steps
            .lock()
            .unwrap()
            .get_mut(op)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed);
        let _ = self.entered.send(op);
        match step {
            Step::Succeed => Ok(()),
            Step::Fail(e) => Err(e),
            Step::Gated(gate, failure) => {
                gate.acquire().await.unwrap().forget();
                failure.map_or(Ok(()), Err)
            }
            Step::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl CommandGateway for FakeGateway {
    async fn fetch_line_details(&self, line: &LineId) -> Result<LineSnapshot, GatewayError> {
        let mut snapshot = self.remote.lock().unwrap().clone();
        self.run("fetch").await?;
        snapshot.line_id = line.clone();
        snapshot.fetched_at = Utc::now();
        Ok(snapshot)
    }

    async fn terminate_endpoint(&self, _endpoint: &EndpointId) -> Result<(), GatewayError> {
        self.run("terminate_endpoint").await?;
        self.edit_remote(|r| r.endpoint_id = None);
        Ok(())
    }

    async fn create_endpoint(
        &self,
        _binding: &BindingInfo,
        _display_name: &str,
    ) -> Result<EndpointId, GatewayError> {
        self.run("create_endpoint").await?;
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        let id = EndpointId::new(format!("ep-new-{n}"));
        self.edit_remote(|r| r.endpoint_id = Some(id.clone()));
        Ok(id)
    }

    async fn set_freeze(&self, _endpoint: &EndpointId, freeze: bool) -> Result<(), GatewayError> {
        self.run("set_freeze").await?;
        self.edit_remote(|r| r.attributes.suspended = freeze);
        Ok(())
    }

    async fn set_imei_lock(
        &self,
        _endpoint: &EndpointId,
        _iccid: &str,
        lock: bool,
    ) -> Result<(), GatewayError> {
        self.run("set_imei_lock").await?;
        self.edit_remote(|r| r.attributes.imei_locked = lock);
        Ok(())
    }

    async fn set_network_preference(
        &self,
        _endpoint: &EndpointId,
        preference: NetworkPreference,
    ) -> Result<(), GatewayError> {
        self.run("set_network_preference").await?;
        self.edit_remote(|r| r.attributes.network_preference = preference);
        Ok(())
    }

    async fn change_package(&self, _endpoint: &EndpointId, package_id: u32) -> Result<(), GatewayError> {
        self.run("change_package").await?;
        self.edit_remote(|r| r.attributes.package_id = package_id);
        Ok(())
    }

    fn no_partial_effect_on_timeout(&self) -> bool {
        self.no_partial_effect
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn config() -> EngineConfig {
    EngineConfig {
        fetch_timeout: Duration::from_secs(10),
        mutation_timeout: Duration::from_secs(10),
        saga_step_timeout: Duration::from_secs(10),
        refresh_interval: Duration::ZERO,
    }
}

fn setup_with(
    config: EngineConfig,
    no_partial_effect: bool,
) -> (Engine, Arc<FakeGateway>, mpsc::UnboundedReceiver<&'static str>) {
    let (gateway, rx) = FakeGateway::new(no_partial_effect);
    let engine = Engine::new(config, Arc::clone(&gateway) as Arc<dyn CommandGateway>);
    (engine, gateway, rx)
}

fn setup() -> (Engine, Arc<FakeGateway>, mpsc::UnboundedReceiver<&'static str>) {
    setup_with(config(), false)
}

async fn wait_entered(rx: &mut mpsc::UnboundedReceiver<&'static str>, op: &'static str) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(entered) = rx.recv().await {
            if entered == op {
                return;
            }
        }
        panic!("gateway dropped");
    })
    .await
    .unwrap_or_else(|_| panic!("{op} was never called"));
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Block until no reprovisioning holds the line.
async fn wait_saga_released(engine: &Engine) {
    drop(
        engine
            .coordinator()
            .acquire(&LineId::new(SIM), AccessKind::Refresh)
            .await
            .unwrap(),
    );
}

fn gate() -> Arc<Semaphore> {
    Arc::new(Semaphore::new(0))
}

// ── Mutations ───────────────────────────────────────────────────────

#[tokio::test]
async fn optimistic_mutation_confirms() {
    let (engine, gateway, mut rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let g = gate();
    gateway.script("set_freeze", Step::Gated(Arc::clone(&g), None));
    let task = {
        let line = line.clone();
        tokio::spawn(async move { line.mutate(Mutation::Suspend(true)).await })
    };
    wait_entered(&mut rx, "set_freeze").await;

    let during = line.state();
    assert!(during.attributes.suspended, "optimistic value visible immediately");
    assert!(during.in_flight.contains(&Attribute::Suspended));

    g.add_permits(1);
    task.await.unwrap().unwrap();

    let after = line.state();
    assert!(after.attributes.suspended);
    assert!(after.in_flight.is_empty());
    assert!(after.marks[&Attribute::Suspended].confirmed_at.is_some());
    assert_eq!(gateway.calls("fetch"), 1, "no refresh after a confirmed mutation");
}

#[tokio::test]
async fn first_mutation_syncs_the_line() {
    let (engine, gateway, _rx) = setup();
    let line = engine.line(SIM);

    line.mutate(Mutation::Package(8)).await.unwrap();

    assert_eq!(gateway.calls("fetch"), 1);
    assert_eq!(line.state().attributes.package_id, 8);
    assert_eq!(line.state().endpoint_id, Some(EndpointId::from("ep-1")));
}

#[tokio::test]
async fn provider_failure_rolls_back() {
    let (engine, gateway, _rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    gateway.script(
        "set_freeze",
        Step::Fail(GatewayError::Provider {
            kind: ProviderErrorKind::DeviceLoadError,
            message: "Error loading device 42".into(),
        }),
    );
    let err = line.mutate(Mutation::Suspend(true)).await.unwrap_err();

    assert!(matches!(
        err,
        CoreError::Domain(DomainError::Rejected {
            kind: ProviderErrorKind::DeviceLoadError,
            ..
        })
    ));
    assert_eq!(err.retry_advice(), RetryAdvice::SafeToRetry);
    let state = line.state();
    assert!(!state.attributes.suspended);
    assert!(state.in_flight.is_empty());
    assert!(state.unconfirmed.is_empty());
}

#[tokio::test]
async fn transport_failure_rolls_back() {
    let (engine, gateway, _rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    gateway.script(
        "set_network_preference",
        Step::Fail(GatewayError::Transport("connection refused".into())),
    );
    let err = line
        .mutate(Mutation::NetworkPreference(NetworkPreference::FiveG))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Transport(TransportError::Network { .. })));
    assert_eq!(line.state().attributes.network_preference, NetworkPreference::Lte);
}

#[tokio::test]
async fn unchanged_value_is_already_in_state() {
    let (engine, gateway, _rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let err = line.mutate(Mutation::Suspend(false)).await.unwrap_err();

    assert!(matches!(
        err,
        CoreError::Domain(DomainError::AlreadyInState {
            attribute: Attribute::Suspended,
            ..
        })
    ));
    assert_eq!(gateway.calls("set_freeze"), 0);
}

#[tokio::test]
async fn refresh_resolving_after_mutation_keeps_optimistic_value() {
    let (engine, gateway, mut rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let mutation_gate = gate();
    let fetch_gate = gate();
    gateway.script("set_freeze", Step::Gated(Arc::clone(&mutation_gate), None));
    gateway.script("fetch", Step::Gated(Arc::clone(&fetch_gate), None));

    let mutation = {
        let line = line.clone();
        tokio::spawn(async move { line.mutate(Mutation::Suspend(true)).await })
    };
    wait_entered(&mut rx, "set_freeze").await;

    gateway.edit_remote(|r| r.attributes.data_usage_gb = 7.5);
    let refresh = {
        let line = line.clone();
        tokio::spawn(async move { line.refresh().await })
    };
    wait_entered(&mut rx, "fetch").await;

    mutation_gate.add_permits(1);
    mutation.await.unwrap().unwrap();
    fetch_gate.add_permits(1);
    let stale = refresh.await.unwrap().unwrap();

    assert!(!stale.attributes.suspended, "fetch captured the pre-mutation value");
    let state = line.state();
    assert!(state.attributes.suspended);
    assert!((state.attributes.data_usage_gb - 7.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn refresh_merging_during_mutation_skips_in_flight_attribute() {
    let (engine, gateway, mut rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let g = gate();
    gateway.script("change_package", Step::Gated(Arc::clone(&g), None));
    let mutation = {
        let line = line.clone();
        tokio::spawn(async move { line.mutate(Mutation::Package(11)).await })
    };
    wait_entered(&mut rx, "change_package").await;

    gateway.edit_remote(|r| r.attributes.imei_locked = true);
    line.refresh().await.unwrap();

    let during = line.state();
    assert_eq!(during.attributes.package_id, 11);
    assert!(during.attributes.imei_locked, "other attributes still merge");

    g.add_permits(1);
    mutation.await.unwrap().unwrap();
    assert_eq!(line.state().attributes.package_id, 11);
}

#[tokio::test]
async fn same_attribute_calls_never_overlap() {
    let (engine, gateway, _rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    for _ in 0..3 {
        gateway.script("change_package", Step::Delay(Duration::from_millis(30)));
    }
    let tasks: Vec<_> = (1..=3)
        .map(|package| {
            let line = line.clone();
            tokio::spawn(async move { line.mutate(Mutation::Package(10 + package)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(gateway.calls("change_package"), 3);
    assert_eq!(gateway.max_active("change_package"), 1);
    assert!(line.state().in_flight.is_empty());
}

#[tokio::test]
async fn different_attributes_mutate_concurrently() {
    let (engine, gateway, mut rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let g = gate();
    gateway.script("set_freeze", Step::Gated(Arc::clone(&g), None));
    let freeze = {
        let line = line.clone();
        tokio::spawn(async move { line.mutate(Mutation::Suspend(true)).await })
    };
    wait_entered(&mut rx, "set_freeze").await;

    line.mutate(Mutation::ImeiLock(true)).await.unwrap();
    assert!(line.state().in_flight.contains(&Attribute::Suspended));

    g.add_permits(1);
    freeze.await.unwrap().unwrap();
    let state = line.state();
    assert!(state.attributes.suspended && state.attributes.imei_locked);
}

#[tokio::test]
async fn timeout_rolls_back_and_holds_attribute_until_call_finishes() {
    let (engine, gateway, _rx) = setup_with(
        EngineConfig {
            mutation_timeout: Duration::from_millis(100),
            ..config()
        },
        false,
    );
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let g = gate();
    gateway.script("set_freeze", Step::Gated(Arc::clone(&g), None));
    let err = line.mutate(Mutation::Suspend(true)).await.unwrap_err();

    assert!(err.possibly_applied());
    let state = line.state();
    assert!(!state.attributes.suspended);
    assert!(state.in_flight.is_empty());
    assert!(state.unconfirmed.contains(&Attribute::Suspended));

    // A second call for the same attribute waits for the detached one.
    let second = {
        let line = line.clone();
        tokio::spawn(async move { line.mutate(Mutation::Suspend(true)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gateway.calls("set_freeze"), 1);

    g.add_permits(1);
    let err = second.await.unwrap().unwrap_err();
    assert!(
        matches!(err, CoreError::Domain(DomainError::AlreadyInState { .. })),
        "late confirmation applied the value: {err:?}"
    );
    let state = line.state();
    assert!(state.attributes.suspended);
    assert!(state.unconfirmed.is_empty());
    assert_eq!(gateway.max_active("set_freeze"), 1);
}

#[tokio::test]
async fn timeout_without_partial_effect_is_not_unconfirmed() {
    let (engine, gateway, _rx) = setup_with(
        EngineConfig {
            mutation_timeout: Duration::from_millis(50),
            ..config()
        },
        true,
    );
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let g = gate();
    gateway.script("change_package", Step::Gated(Arc::clone(&g), None));
    let err = line.mutate(Mutation::Package(5)).await.unwrap_err();

    assert!(matches!(
        err,
        CoreError::Transport(TransportError::Timeout {
            possibly_applied: false,
            ..
        })
    ));
    assert!(line.state().unconfirmed.is_empty());
    g.add_permits(1);
}

// ── Refresh ─────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_refreshes_share_one_fetch() {
    let (engine, gateway, mut rx) = setup();
    let line = engine.line(SIM);

    let g = gate();
    gateway.script("fetch", Step::Gated(Arc::clone(&g), None));
    let tasks: Vec<_> = (0..3)
        .map(|_| {
            let line = line.clone();
            tokio::spawn(async move { line.refresh().await })
        })
        .collect();
    wait_entered(&mut rx, "fetch").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    g.add_permits(1);
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(gateway.calls("fetch"), 1);

    line.refresh().await.unwrap();
    assert_eq!(gateway.calls("fetch"), 2, "finished flights are not reused");
}

#[tokio::test]
async fn not_found_is_a_domain_error() {
    let (engine, gateway, _rx) = setup();
    gateway.script(
        "fetch",
        Step::Fail(GatewayError::Provider {
            kind: ProviderErrorKind::NotFound,
            message: "SIM number not found.".into(),
        }),
    );

    let err = engine.line(SIM).refresh().await.unwrap_err();
    assert!(matches!(err, CoreError::Domain(DomainError::NotFound { .. })));
    assert!(!engine.line(SIM).state().is_synced());
}

#[tokio::test]
async fn periodic_refresh_runs_until_shutdown() {
    let (engine, gateway, _rx) = setup_with(
        EngineConfig {
            refresh_interval: Duration::from_millis(40),
            ..config()
        },
        false,
    );
    engine.line(SIM).refresh().await.unwrap();
    engine.start().await;

    wait_until(|| gateway.calls("fetch") >= 3).await;
    engine.shutdown().await;

    let settled = gateway.calls("fetch");
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(gateway.calls("fetch"), settled);
}

// ── Reprovisioning ──────────────────────────────────────────────────

#[tokio::test]
async fn reprovision_commits_and_refreshes_once() {
    let (engine, gateway, _rx) = setup();
    let line = engine.line(SIM);

    let record = line.reprovision("Van 12").await.unwrap();

    assert_eq!(record.phase, SagaPhase::Committed);
    assert_eq!(record.old_endpoint_id, Some(EndpointId::from("ep-1")));
    assert_eq!(record.new_endpoint_id, Some(EndpointId::from("ep-new-1")));
    assert_eq!(record.display_name, "Van 12");
    assert_eq!(record.attempts, 1);
    assert!(record.ended_at.is_some());
    assert_eq!(line.state().endpoint_id, Some(EndpointId::from("ep-new-1")));

    wait_until(|| gateway.calls("fetch") == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(gateway.calls("fetch"), 2);
    assert_eq!(gateway.calls("terminate_endpoint"), 1);
    assert_eq!(gateway.calls("create_endpoint"), 1);
}

#[tokio::test]
async fn mutation_during_reprovisioning_is_busy_and_changes_nothing() {
    let (engine, gateway, mut rx) = setup();
    let line = engine.line(SIM);

    let g = gate();
    gateway.script("terminate_endpoint", Step::Gated(Arc::clone(&g), None));
    let saga = {
        let line = line.clone();
        tokio::spawn(async move { line.reprovision("Van 12").await })
    };
    wait_entered(&mut rx, "terminate_endpoint").await;

    let before = line.state();
    let err = line.mutate(Mutation::Suspend(true)).await.unwrap_err();
    assert!(err.is_busy());
    let err = line.reprovision("again").await.unwrap_err();
    assert!(err.is_busy());
    let err = line.clear_reprovision().await.unwrap_err();
    assert!(err.is_busy());
    assert_eq!(line.state(), before);
    assert_eq!(gateway.calls("set_freeze"), 0);

    g.add_permits(1);
    assert_eq!(saga.await.unwrap().unwrap().phase, SagaPhase::Committed);
    line.mutate(Mutation::Suspend(true)).await.unwrap();
}

#[tokio::test]
async fn ineligible_line_fails_before_any_identity_change() {
    let (engine, gateway, _rx) = setup();
    gateway.edit_remote(|r| r.attributes.suspended = true);
    let line = engine.line(SIM);

    let err = line.reprovision("Van 12").await.unwrap_err();

    let CoreError::Saga(SagaFailure::NoneAttempted { phase, cause, .. }) = &err else {
        panic!("expected NoneAttempted, got {err:?}");
    };
    assert_eq!(*phase, SagaPhase::Validating);
    assert!(matches!(
        **cause,
        CoreError::Domain(DomainError::DeviceNotEligible { .. })
    ));
    assert_eq!(err.retry_advice(), RetryAdvice::ManualIntervention);

    let state = line.state();
    let record = state.saga.unwrap();
    assert_eq!(record.phase, SagaPhase::FailedNoneAttempted);
    assert_eq!(record.failed_phase, Some(SagaPhase::Validating));
    assert_eq!(state.endpoint_id, Some(EndpointId::from("ep-1")));
    assert_eq!(gateway.calls("terminate_endpoint"), 0);
}

#[tokio::test]
async fn terminate_failure_leaves_line_intact_and_rerun_is_allowed() {
    let (engine, gateway, _rx) = setup();
    let line = engine.line(SIM);
    gateway.script(
        "terminate_endpoint",
        Step::Fail(GatewayError::Transport("connection reset".into())),
    );

    let err = line.reprovision("Van 12").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Saga(SagaFailure::NoneAttempted {
            phase: SagaPhase::Terminating,
            ..
        })
    ));
    assert_eq!(err.retry_advice(), RetryAdvice::SafeToRetry);
    assert_eq!(line.state().endpoint_id, Some(EndpointId::from("ep-1")));

    let record = line.reprovision("Van 12").await.unwrap();
    assert_eq!(record.phase, SagaPhase::Committed);
}

#[tokio::test]
async fn create_timeout_leaves_partial_failure_that_only_resume_fixes() {
    let (engine, gateway, _rx) = setup_with(
        EngineConfig {
            saga_step_timeout: Duration::from_millis(100),
            ..config()
        },
        false,
    );
    let line = engine.line(SIM);

    let g = gate();
    gateway.script(
        "create_endpoint",
        Step::Gated(
            Arc::clone(&g),
            Some(GatewayError::Transport("connection reset".into())),
        ),
    );
    let err = line.reprovision("Van 12").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Saga(SagaFailure::Partial {
            phase: SagaPhase::Provisioning,
            ..
        })
    ));
    assert_eq!(err.retry_advice(), RetryAdvice::ResumeStepOnly);

    let state = line.state();
    let record = state.saga.clone().unwrap();
    assert_eq!(record.phase, SagaPhase::FailedPartial);
    assert_eq!(record.failed_phase, Some(SagaPhase::Provisioning));
    assert_eq!(record.old_endpoint_id, Some(EndpointId::from("ep-1")));
    assert_eq!(state.endpoint_id, None);

    // Terminal, so not busy; but the line has no identity to mutate.
    let err = line.mutate(Mutation::Suspend(true)).await.unwrap_err();
    assert!(!err.is_busy());
    assert!(matches!(
        err,
        CoreError::Domain(DomainError::DeviceNotEligible { .. })
    ));

    g.add_permits(1);
    wait_saga_released(&engine).await;

    let before = line.state();
    let err = line.reprovision("Van 12").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Saga(SagaFailure::RestartAfterPartial { .. })
    ));
    assert_eq!(line.state(), before, "rejected restart changes nothing");

    let record = line.resume_reprovision().await.unwrap();
    assert_eq!(record.phase, SagaPhase::Committed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.new_endpoint_id, Some(EndpointId::from("ep-new-1")));
    assert_eq!(gateway.calls("terminate_endpoint"), 1, "resume never re-terminates");
    assert_eq!(gateway.calls("create_endpoint"), 2);
    assert_eq!(line.state().endpoint_id, Some(EndpointId::from("ep-new-1")));
}

#[tokio::test]
async fn late_create_success_is_adopted_on_resume() {
    let (engine, gateway, _rx) = setup_with(
        EngineConfig {
            saga_step_timeout: Duration::from_millis(100),
            ..config()
        },
        false,
    );
    let line = engine.line(SIM);

    let g = gate();
    gateway.script("create_endpoint", Step::Gated(Arc::clone(&g), None));
    line.reprovision("Van 12").await.unwrap_err();

    let mut states = line.subscribe();
    g.add_permits(1);
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|s| s.saga.as_ref().is_some_and(|r| r.new_endpoint_id.is_some())),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(line.state().saga.unwrap().phase, SagaPhase::FailedPartial);
    wait_saga_released(&engine).await;

    let record = line.resume_reprovision().await.unwrap();
    assert_eq!(record.phase, SagaPhase::Committed);
    assert_eq!(record.new_endpoint_id, Some(EndpointId::from("ep-new-1")));
    assert_eq!(gateway.calls("create_endpoint"), 1);
}

#[tokio::test]
async fn late_terminate_turns_clean_failure_into_partial() {
    let (engine, gateway, _rx) = setup_with(
        EngineConfig {
            saga_step_timeout: Duration::from_millis(100),
            ..config()
        },
        false,
    );
    let line = engine.line(SIM);

    let g = gate();
    gateway.script("terminate_endpoint", Step::Gated(Arc::clone(&g), None));
    let err = line.reprovision("Van 12").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Saga(SagaFailure::Unconfirmed {
            phase: SagaPhase::Terminating,
            ..
        })
    ));
    assert_eq!(err.retry_advice(), RetryAdvice::ManualIntervention);

    g.add_permits(1);
    wait_saga_released(&engine).await;

    let state = line.state();
    assert_eq!(state.saga.unwrap().phase, SagaPhase::FailedPartial);
    assert_eq!(state.endpoint_id, None);

    let record = line.resume_reprovision().await.unwrap();
    assert_eq!(record.phase, SagaPhase::Committed);
    assert_eq!(gateway.calls("terminate_endpoint"), 1);
}

fn short_steps() -> EngineConfig {
    EngineConfig {
        saga_step_timeout: Duration::from_millis(100),
        ..config()
    }
}

/// Reset whose terminate times out and then fails with no answer either.
async fn unanswered_terminate(
    line: &DeviceLine,
    gateway: &FakeGateway,
    engine: &Engine,
) {
    let g = gate();
    gateway.script(
        "terminate_endpoint",
        Step::Gated(Arc::clone(&g), Some(GatewayError::Timeout)),
    );
    let err = line.reprovision("Van 12").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Saga(SagaFailure::Unconfirmed {
            phase: SagaPhase::Terminating,
            ..
        })
    ));
    assert_eq!(err.retry_advice(), RetryAdvice::ManualIntervention);

    g.add_permits(1);
    wait_saga_released(engine).await;

    let state = line.state();
    let record = state.saga.unwrap();
    assert_eq!(record.phase, SagaPhase::FailedNoneAttempted);
    assert!(record.termination_unconfirmed);
    assert!(
        record
            .failure_reason
            .is_some_and(|r| r.contains("may still have been applied"))
    );
    assert_eq!(state.endpoint_id, Some(EndpointId::from("ep-1")));
}

#[tokio::test]
async fn unanswered_terminate_is_not_repeated_once_the_endpoint_is_gone() {
    let (engine, gateway, _rx) = setup_with(short_steps(), false);
    let line = engine.line(SIM);
    unanswered_terminate(&line, &gateway, &engine).await;

    // The provider applied the terminate after all.
    gateway.edit_remote(|r| r.endpoint_id = None);

    let err = line.reprovision("Van 12").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Saga(SagaFailure::RestartAfterPartial { .. })
    ));
    assert_eq!(gateway.calls("terminate_endpoint"), 1);

    let state = line.state();
    let record = state.saga.clone().unwrap();
    assert_eq!(record.phase, SagaPhase::FailedPartial);
    assert_eq!(record.failed_phase, Some(SagaPhase::Terminating));
    assert!(!record.termination_unconfirmed);
    assert_eq!(state.endpoint_id, None);

    let record = line.resume_reprovision().await.unwrap();
    assert_eq!(record.phase, SagaPhase::Committed);
    assert_eq!(record.new_endpoint_id, Some(EndpointId::from("ep-new-1")));
    assert_eq!(gateway.calls("terminate_endpoint"), 1);
    assert_eq!(gateway.calls("create_endpoint"), 1);
}

#[tokio::test]
async fn unanswered_terminate_allows_restart_while_old_endpoint_is_live() {
    let (engine, gateway, _rx) = setup_with(short_steps(), false);
    let line = engine.line(SIM);
    unanswered_terminate(&line, &gateway, &engine).await;

    let record = line.reprovision("Van 12").await.unwrap();
    assert_eq!(record.phase, SagaPhase::Committed);
    assert!(!record.termination_unconfirmed);
    assert_eq!(gateway.calls("terminate_endpoint"), 2);
}

#[tokio::test]
async fn unanswered_terminate_with_foreign_endpoint_needs_an_operator() {
    let (engine, gateway, _rx) = setup_with(short_steps(), false);
    let line = engine.line(SIM);
    unanswered_terminate(&line, &gateway, &engine).await;
    gateway.edit_remote(|r| r.endpoint_id = Some(EndpointId::from("ep-other")));

    let err = line.reprovision("Van 12").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Domain(DomainError::DeviceNotEligible { .. })
    ));
    assert_eq!(gateway.calls("terminate_endpoint"), 1);
    assert!(line.state().saga.unwrap().termination_unconfirmed);

    line.clear_reprovision().await.unwrap();
    assert!(line.state().saga.is_none());
}

#[tokio::test]
async fn reset_rejected_at_acquire_leaves_state_untouched() {
    let (engine, gateway, mut rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let g = gate();
    gateway.script("create_endpoint", Step::Gated(Arc::clone(&g), None));
    let running = {
        let line = line.clone();
        tokio::spawn(async move { line.reprovision("Van 12").await })
    };
    wait_entered(&mut rx, "create_endpoint").await;

    let before = line.state();
    assert!(line.reprovision("Van 13").await.unwrap_err().is_busy());
    assert!(line.resume_reprovision().await.unwrap_err().is_busy());
    assert_eq!(line.state(), before);
    assert_eq!(gateway.calls("terminate_endpoint"), 1);

    g.add_permits(1);
    assert_eq!(running.await.unwrap().unwrap().phase, SagaPhase::Committed);
}

#[tokio::test]
async fn partial_record_restored_into_a_new_engine_can_be_resumed() {
    let (first, gateway, _rx) = setup();
    gateway.script(
        "create_endpoint",
        Step::Fail(GatewayError::Provider {
            kind: ProviderErrorKind::DeviceLoadError,
            message: "Error loading device 7".into(),
        }),
    );
    first.line(SIM).reprovision("Van 12").await.unwrap_err();
    let record = first.line(SIM).state().saga.unwrap();
    assert_eq!(record.phase, SagaPhase::FailedPartial);

    let second = Engine::new(config(), Arc::clone(&gateway) as Arc<dyn CommandGateway>);
    let line = second.line(SIM);
    assert!(line.restore_reprovision(record.clone()).await.unwrap());
    assert_eq!(line.state().endpoint_id, None);
    assert!(!line.restore_reprovision(record).await.unwrap(), "existing record wins");

    let err = line.reprovision("Van 12").await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Saga(SagaFailure::RestartAfterPartial { .. })
    ));

    let record = line.resume_reprovision().await.unwrap();
    assert_eq!(record.phase, SagaPhase::Committed);
    assert_eq!(gateway.calls("terminate_endpoint"), 1);
    assert_eq!(gateway.calls("create_endpoint"), 2);
}

#[tokio::test]
async fn running_record_cannot_be_restored() {
    let (engine, gateway, mut rx) = setup();
    let g = gate();
    gateway.script("terminate_endpoint", Step::Gated(Arc::clone(&g), None));
    let running = {
        let line = engine.line(SIM);
        tokio::spawn(async move { line.reprovision("Van 12").await })
    };
    wait_entered(&mut rx, "terminate_endpoint").await;
    let in_progress = engine.line(SIM).state().saga.unwrap();
    assert_eq!(in_progress.phase, SagaPhase::Terminating);

    let (other, _gateway, _rx) = setup();
    let err = other
        .line(SIM)
        .restore_reprovision(in_progress)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::ValidationFailed { .. }));
    assert!(other.line(SIM).state().saga.is_none());

    g.add_permits(1);
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn resume_without_partial_failure_is_rejected() {
    let (engine, _gateway, _rx) = setup();
    let line = engine.line(SIM);
    line.refresh().await.unwrap();

    let before = line.state();
    let err = line.resume_reprovision().await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Saga(SagaFailure::NothingToResume { .. })
    ));
    assert_eq!(line.state(), before);
}

#[tokio::test]
async fn clear_drops_terminal_record() {
    let (engine, _gateway, _rx) = setup();
    let line = engine.line(SIM);
    line.reprovision("Van 12").await.unwrap();

    let cleared = line.clear_reprovision().await.unwrap();
    assert_eq!(cleared.map(|r| r.phase), Some(SagaPhase::Committed));
    assert!(line.state().saga.is_none());
    assert!(line.clear_reprovision().await.unwrap().is_none());
}

#[tokio::test]
async fn idle_lines_can_be_forgotten() {
    let (engine, _gateway, _rx) = setup();
    engine.line(SIM).refresh().await.unwrap();
    assert_eq!(engine.lines(), vec![LineId::new(SIM)]);

    assert!(engine.forget(&LineId::new(SIM)));
    assert!(engine.lines().is_empty());
}
