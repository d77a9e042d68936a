//! # Engine Lifecycle Integration Tests
//!
//! End-to-end exercises of the provisioning engine against a real file
//! store and scripted primitive backends. These cover the boundaries where
//! bugs hide: admission vs capacity, retry scheduling, cancellation vs
//! deletion, startup replay after a crash, and expiry.
//!
//! | Category | What it tests |
//! |----------|---------------|
//! | A. Happy path | accept → provision → ok, ledger charged |
//! | B. Capacity | rejection persists an error result, nothing charged |
//! | C. Retries | transient failures back off and converge |
//! | D. Recovery | replay after crash, restart restoration, capacity shrink |
//! | E. Ordering | networks provision before dependents at startup |
//! | F. Deletion | idempotence, cancellation, terminal ids, expiry |

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use ed25519_dalek::SigningKey;
use weft_common::crypto::{generate_keypair, sign_challenge};
use weft_common::time::now_unix;
use weft_common::{Capacity, Reservation, ResultState, TwinId, WorkloadType, GIB, MIB};
use weft_engine::{
    Admitted, Backoff, CreateError, Deadlines, Engine, EngineConfig, EngineError, EngineEvent,
    EngineHandle, OpCtx, Primitive, PrimitiveError, Provisioned, Registry, ResultSigner,
    StaticTwins, Statistics,
};
use weft_store::{FsStore, Store};

const TWIN: TwinId = 7;

// ═══════════════════════════════════════════════════════════════════════
// SCRIPTED PRIMITIVE BACKEND
// ═══════════════════════════════════════════════════════════════════════

/// Backend with scripted behavior: fail transiently N times, fail
/// permanently, or succeed after a delay; records call order.
#[derive(Default)]
struct ScriptedPrimitive {
    transient_left: AtomicU32,
    permanent: Option<String>,
    delay: Duration,
    provisions: AtomicU32,
    decommissions: AtomicU32,
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl ScriptedPrimitive {
    fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn flaky(failures: u32) -> Arc<Self> {
        Arc::new(ScriptedPrimitive {
            transient_left: AtomicU32::new(failures),
            ..Default::default()
        })
    }

    fn broken(message: &str) -> Arc<Self> {
        Arc::new(ScriptedPrimitive {
            permanent: Some(message.to_string()),
            ..Default::default()
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedPrimitive {
            delay,
            ..Default::default()
        })
    }

    fn logged(log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(ScriptedPrimitive {
            log: Some(log),
            ..Default::default()
        })
    }

    fn logged_slow(log: Arc<Mutex<Vec<String>>>, delay: Duration) -> Arc<Self> {
        Arc::new(ScriptedPrimitive {
            log: Some(log),
            delay,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Primitive for ScriptedPrimitive {
    async fn provision(
        &self,
        _ctx: &OpCtx,
        reservation: &Reservation,
    ) -> Result<Provisioned, PrimitiveError> {
        if let Some(log) = &self.log {
            log.lock().push(reservation.id.clone());
        }
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self
            .transient_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PrimitiveError::Transient("network flapping".into()));
        }
        if let Some(message) = &self.permanent {
            return Err(PrimitiveError::Permanent(message.clone()));
        }
        Ok(Provisioned::Data(json!({ "deployed": reservation.id })))
    }

    async fn decommission(
        &self,
        _ctx: &OpCtx,
        _reservation: &Reservation,
    ) -> Result<(), PrimitiveError> {
        self.decommissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// HARNESS
// ═══════════════════════════════════════════════════════════════════════

fn small_backoff() -> EngineConfig {
    EngineConfig {
        backoff: Backoff {
            initial: Duration::from_millis(20),
            factor: 2,
            max: Duration::from_millis(200),
        },
        janitor_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

fn registry_with(backends: &[(WorkloadType, Arc<ScriptedPrimitive>)]) -> Registry {
    let mut registry = Registry::new(Deadlines::uniform(Duration::from_secs(5)));
    for (t, backend) in backends {
        registry = registry.register(*t, backend.clone() as Arc<dyn Primitive>);
    }
    registry
}

struct TestNode {
    handle: EngineHandle,
    task: JoinHandle<Result<(), EngineError>>,
}

impl TestNode {
    async fn stop(self) {
        self.handle.shutdown();
        self.task.await.expect("engine task").expect("engine run");
    }
}

fn start_node(
    dir: &Path,
    totals: Capacity,
    registry: Registry,
    twin_key: &SigningKey,
    config: EngineConfig,
) -> TestNode {
    let store: Arc<dyn Store> = Arc::new(FsStore::open(dir).expect("open store"));
    let twins = Arc::new(StaticTwins::from_keys(
        [(TWIN, twin_key.verifying_key())],
        [],
    ));
    let signer: Arc<dyn ResultSigner> = Arc::new(generate_keypair());
    let engine = Engine::new(
        store,
        Statistics::new(totals, Capacity::default()),
        twins.clone(),
        twins,
        registry,
        signer,
        config,
    );
    let handle = engine.handle();
    let task = tokio::spawn(engine.run());
    TestNode { handle, task }
}

fn totals() -> Capacity {
    Capacity {
        cru: 4,
        mru: 4 * GIB,
        hru: 0,
        sru: 10 * GIB,
        ipv4u: 2,
    }
}

fn signed(
    key: &SigningKey,
    id: &str,
    workload_type: WorkloadType,
    data: Value,
    duration_secs: u64,
) -> Reservation {
    let mut r = Reservation {
        id: id.to_string(),
        twin_id: TWIN,
        workload_type,
        data,
        created_at: now_unix(),
        duration_secs,
        signature: String::new(),
        to_delete: false,
        result: None,
    };
    r.signature = sign_challenge(key, &r.challenge());
    r
}

fn network(key: &SigningKey, id: &str) -> Reservation {
    signed(
        key,
        id,
        WorkloadType::NetworkResource,
        json!({"name": "net-a", "subnet": "10.10.1.0/24"}),
        3600,
    )
}

fn container(key: &SigningKey, id: &str, cru: u64) -> Reservation {
    signed(
        key,
        id,
        WorkloadType::Container,
        json!({
            "flist": "https://hub.example.org/app.flist",
            "cpu": cru,
            "memory_mib": 128,
            "rootfs_mib": 1024,
            "network": "net-a",
        }),
        3600,
    )
}

async fn wait_for_state(handle: &EngineHandle, id: &str, state: ResultState) -> Reservation {
    let deadline = Duration::from_secs(5);
    let poll = async {
        loop {
            if let Ok(r) = handle.get(id) {
                if r.result_state() == Some(state) {
                    return r;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(deadline, poll)
        .await
        .unwrap_or_else(|_| panic!("reservation {id} never reached {state:?}"))
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let poll = async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

// ═══════════════════════════════════════════════════════════════════════
// A. HAPPY PATH
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_happy_path_provisions_and_charges() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let backend = ScriptedPrimitive::ok();
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[
            (WorkloadType::NetworkResource, backend.clone()),
            (WorkloadType::Container, backend.clone()),
        ]),
        &key,
        small_backoff(),
    );

    assert_eq!(
        node.handle.create(network(&key, "net-1")).unwrap(),
        Admitted::Queued
    );
    assert_eq!(
        node.handle.create(container(&key, "ct-1", 1)).unwrap(),
        Admitted::Queued
    );

    let net = wait_for_state(&node.handle, "net-1", ResultState::Ok).await;
    assert_eq!(net.result.as_ref().unwrap().data["deployed"], "net-1");
    assert!(!net.result.as_ref().unwrap().signature.is_empty());
    wait_for_state(&node.handle, "ct-1", ResultState::Ok).await;

    let current = node.handle.counters().current;
    assert_eq!(current.cru, 1);
    assert_eq!(current.mru, 128 * MIB);
    assert_eq!(current.sru, GIB);

    node.stop().await;
}

#[tokio::test]
async fn test_validation_rejects_bad_input() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Volume, ScriptedPrimitive::ok())]),
        &key,
        small_backoff(),
    );

    // zero duration
    let r = signed(&key, "v-1", WorkloadType::Volume, json!({"size_gib": 1, "kind": "ssd"}), 0);
    assert!(matches!(
        node.handle.create(r),
        Err(CreateError::Validation(_))
    ));

    // unsigned
    let mut r = signed(&key, "v-2", WorkloadType::Volume, json!({"size_gib": 1, "kind": "ssd"}), 60);
    r.signature = String::new();
    assert!(matches!(node.handle.create(r), Err(CreateError::Auth(_))));

    // unknown twin
    let mut r = signed(&key, "v-3", WorkloadType::Volume, json!({"size_gib": 1, "kind": "ssd"}), 60);
    r.twin_id = 99;
    r.signature = sign_challenge(&key, &r.challenge());
    assert!(matches!(node.handle.create(r), Err(CreateError::Auth(_))));

    // far-future creation date
    let mut r = signed(&key, "v-4", WorkloadType::Volume, json!({"size_gib": 1, "kind": "ssd"}), 60);
    r.created_at = now_unix() + 86_400;
    r.signature = sign_challenge(&key, &r.challenge());
    assert!(matches!(
        node.handle.create(r),
        Err(CreateError::Validation(_))
    ));

    // malformed payload
    let r = signed(&key, "v-5", WorkloadType::Volume, json!({"size_gib": "ten"}), 60);
    assert!(matches!(
        node.handle.create(r),
        Err(CreateError::Validation(_))
    ));

    // nothing was persisted or charged
    assert!(node.handle.list_all().is_empty());
    assert!(node.handle.counters().current.is_zero());

    node.stop().await;
}

// ═══════════════════════════════════════════════════════════════════════
// B. CAPACITY
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_capacity_rejection_persists_error() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let backend = ScriptedPrimitive::ok();
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );

    node.handle.create(container(&key, "big", 4)).unwrap();
    wait_for_state(&node.handle, "big", ResultState::Ok).await;
    assert_eq!(node.handle.counters().current.cru, 4);

    let admitted = node.handle.create(container(&key, "extra", 1)).unwrap();
    assert_eq!(admitted, Admitted::CapacityExhausted);

    let rejected = node.handle.get("extra").unwrap();
    let result = rejected.result.expect("rejection result persisted");
    assert_eq!(result.state, ResultState::Error);
    assert_eq!(result.message, "capacity exhausted");

    // the charge did not move, and the rejected workload never reached the backend
    assert_eq!(node.handle.counters().current.cru, 4);
    assert_eq!(backend.provisions.load(Ordering::SeqCst), 1);

    node.stop().await;
}

#[tokio::test]
async fn test_permanent_error_releases_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let backend = ScriptedPrimitive::broken("image does not exist");
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );

    node.handle.create(container(&key, "ct-1", 2)).unwrap();
    let r = wait_for_state(&node.handle, "ct-1", ResultState::Error).await;
    assert_eq!(r.result.unwrap().message, "image does not exist");

    // the charge made at admission was refunded
    assert!(node.handle.counters().current.is_zero());
    // no automatic retry of a permanent error
    sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.provisions.load(Ordering::SeqCst), 1);

    node.stop().await;
}

// ═══════════════════════════════════════════════════════════════════════
// C. RETRIES
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_transient_retries_back_off_and_converge() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let backend = ScriptedPrimitive::flaky(2);
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Volume, backend.clone())]),
        &key,
        small_backoff(),
    );
    let mut events = node.handle.subscribe();

    node.handle
        .create(signed(&key, "v-1", WorkloadType::Volume, json!({"size_gib": 1, "kind": "ssd"}), 3600))
        .unwrap();
    let r = wait_for_state(&node.handle, "v-1", ResultState::Ok).await;

    // two failures, then success; nothing persisted in between
    assert_eq!(backend.provisions.load(Ordering::SeqCst), 3);
    assert_eq!(r.result_state(), Some(ResultState::Ok));

    let mut delays = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if let EngineEvent::RetryScheduled { id, delay, .. } = event {
            assert_eq!(id, "v-1");
            delays.push(delay);
        }
    }
    assert_eq!(delays.len(), 2);
    assert!(delays[0] < delays[1], "backoff must strictly increase");

    // the charge was held across retries
    assert_eq!(node.handle.counters().current.sru, GIB);

    node.stop().await;
}

// ═══════════════════════════════════════════════════════════════════════
// D. RECOVERY
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_replay_provisions_reservation_persisted_before_crash() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();

    // crash happened after the durable write, before the worker ran
    {
        let store = FsStore::open(dir.path()).unwrap();
        store.add(&container(&key, "ct-1", 1)).unwrap();
    }

    let backend = ScriptedPrimitive::ok();
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );

    let r = wait_for_state(&node.handle, "ct-1", ResultState::Ok).await;
    assert_eq!(r.result.unwrap().state, ResultState::Ok);
    assert_eq!(backend.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(node.handle.counters().current.cru, 1);

    node.stop().await;
}

#[tokio::test]
async fn test_restart_restores_counters_without_reprovisioning() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let backend = ScriptedPrimitive::ok();

    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );
    node.handle.create(container(&key, "ct-1", 2)).unwrap();
    wait_for_state(&node.handle, "ct-1", ResultState::Ok).await;
    let before = node.handle.counters().current;
    node.stop().await;

    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );
    wait_until("ledger rebuild", || node.handle.counters().current == before).await;

    // an ok reservation is not re-driven through the backend
    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.provisions.load(Ordering::SeqCst), 1);
    assert_eq!(
        node.handle.get("ct-1").unwrap().result_state(),
        Some(ResultState::Ok)
    );

    node.stop().await;
}

#[tokio::test]
async fn test_capacity_shrink_forces_decommission_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let backend = ScriptedPrimitive::ok();

    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );
    node.handle.create(container(&key, "ct-1", 3)).unwrap();
    wait_for_state(&node.handle, "ct-1", ResultState::Ok).await;
    node.stop().await;

    // the node comes back with fewer cores than the workload needs
    let shrunk = Capacity { cru: 2, ..totals() };
    let node = start_node(
        dir.path(),
        shrunk,
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );

    wait_for_state(&node.handle, "ct-1", ResultState::Deleted).await;
    assert_eq!(backend.decommissions.load(Ordering::SeqCst), 1);
    wait_until("capacity released", || {
        node.handle.counters().current.is_zero()
    })
    .await;

    node.stop().await;
}

// ═══════════════════════════════════════════════════════════════════════
// E. STARTUP ORDERING
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_networks_provision_before_dependents_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();

    {
        let store = FsStore::open(dir.path()).unwrap();
        // persisted in "wrong" arrival order on purpose
        store.add(&container(&key, "ct-1", 1)).unwrap();
        store.add(&container(&key, "ct-2", 1)).unwrap();
        store.add(&network(&key, "net-1")).unwrap();
        store
            .add(&signed(&key, "vol-1", WorkloadType::Volume, json!({"size_gib": 1, "kind": "ssd"}), 3600))
            .unwrap();
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    // the network backend is slow; a phase gate (not luck) must hold the rest
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[
            (
                WorkloadType::NetworkResource,
                ScriptedPrimitive::logged_slow(log.clone(), Duration::from_millis(100)),
            ),
            (WorkloadType::Volume, ScriptedPrimitive::logged(log.clone())),
            (WorkloadType::Container, ScriptedPrimitive::logged(log.clone())),
        ]),
        &key,
        small_backoff(),
    );

    for id in ["net-1", "vol-1", "ct-1", "ct-2"] {
        wait_for_state(&node.handle, id, ResultState::Ok).await;
    }

    let order = log.lock().clone();
    let position = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(position("net-1") < position("vol-1"));
    assert!(position("vol-1") < position("ct-1"));
    assert!(position("vol-1") < position("ct-2"));

    node.stop().await;
}

// ═══════════════════════════════════════════════════════════════════════
// F. DELETION
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_submit_and_delete_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let backend = ScriptedPrimitive::ok();
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );

    node.handle.create(container(&key, "ct-1", 1)).unwrap();
    wait_for_state(&node.handle, "ct-1", ResultState::Ok).await;

    // resubmission of the same id is a no-op without a second charge
    assert_eq!(
        node.handle.create(container(&key, "ct-1", 1)).unwrap(),
        Admitted::Duplicate
    );
    assert_eq!(node.handle.counters().current.cru, 1);
    assert_eq!(backend.provisions.load(Ordering::SeqCst), 1);

    node.handle.delete("ct-1").unwrap();
    node.handle.delete("ct-1").unwrap();
    wait_for_state(&node.handle, "ct-1", ResultState::Deleted).await;
    wait_until("single decommission settles", || {
        node.handle.counters().current.is_zero()
    })
    .await;
    assert_eq!(backend.decommissions.load(Ordering::SeqCst), 1);

    // a deleted id is terminal; reuse requires a fresh id
    assert!(matches!(
        node.handle.create(container(&key, "ct-1", 1)),
        Err(CreateError::Terminal(_))
    ));
    assert_eq!(
        node.handle.get("ct-1").unwrap().result_state(),
        Some(ResultState::Deleted)
    );

    node.stop().await;
}

#[tokio::test]
async fn test_delete_cancels_inflight_provision() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    // provisioning takes far longer than the test; deletion must not wait for it
    let backend = ScriptedPrimitive::slow(Duration::from_secs(30));
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Container, backend.clone())]),
        &key,
        small_backoff(),
    );

    node.handle.create(container(&key, "ct-1", 1)).unwrap();
    wait_until("provision started", || {
        backend.provisions.load(Ordering::SeqCst) == 1
    })
    .await;

    node.handle.delete("ct-1").unwrap();
    wait_for_state(&node.handle, "ct-1", ResultState::Deleted).await;
    assert!(node.handle.counters().current.is_zero());

    node.stop().await;
}

#[tokio::test]
async fn test_expired_reservation_is_decommissioned() {
    let dir = tempfile::tempdir().unwrap();
    let key = generate_keypair();
    let backend = ScriptedPrimitive::ok();
    let node = start_node(
        dir.path(),
        totals(),
        registry_with(&[(WorkloadType::Volume, backend.clone())]),
        &key,
        small_backoff(),
    );

    node.handle
        .create(signed(&key, "v-1", WorkloadType::Volume, json!({"size_gib": 2, "kind": "ssd"}), 2))
        .unwrap();
    wait_for_state(&node.handle, "v-1", ResultState::Ok).await;
    assert_eq!(node.handle.counters().current.sru, 2 * GIB);

    // duration 2s + janitor interval: deleted well within the poll deadline
    wait_for_state(&node.handle, "v-1", ResultState::Deleted).await;
    wait_until("capacity released", || {
        node.handle.counters().current.is_zero()
    })
    .await;
    assert_eq!(backend.decommissions.load(Ordering::SeqCst), 1);

    node.stop().await;
}
