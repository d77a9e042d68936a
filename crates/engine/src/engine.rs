//! The reconciler.
//!
//! Single event loop, many workers. The loop owns all scheduling state and
//! processes events serially; provisioning and decommissioning run in
//! spawned workers that report back over the same channel, so events for
//! one reservation id are always handled in arrival order and at most one
//! worker runs per id.
//!
//! ```text
//!  admission ──Provision──►┐
//!  api/janitor ──Delete───►├─► event loop ─► dispatch ─► worker ─┐
//!  timers ──────Retry─────►┘        ▲                            │
//!                                   └────────WorkerDone──────────┘
//! ```
//!
//! ## Lifecycle
//!
//! Accepted reservations are charged against the capacity ledger, written
//! to the store, then provisioned. A transient provision failure keeps the
//! charge and retries with capped backoff; a permanent one records the
//! error and refunds the charge. Deletion (requested, expired, or forced by
//! a capacity shrink) marks the durable intent first, then decommissions —
//! retried forever on transient errors, forced through on permanent ones so
//! a broken backend cannot livelock the node.
//!
//! ## The ledger charge rule
//!
//! A reservation holds a charge exactly while its persisted result state is
//! absent, `unknown` or `ok`. Admission charges; a permanent provision
//! error or a finished decommission refunds; the startup rebuild recharges
//! by the same rule, which is what makes the ledger agree with the store
//! after a restart.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use weft_common::time::now_unix;
use weft_common::{
    is_valid_id, Capacity, Reservation, ReservationId, ReservationResult, ResultState,
    WorkloadType,
};
use weft_store::{Store, StoreError};

use crate::auth::{self, AdminRegistry, AuthError, TwinRegistry};
use crate::backoff::Backoff;
use crate::events::{DeleteCause, EngineEvent, EventBus};
use crate::janitor::Janitor;
use crate::primitives::{PrimitiveError, Provisioned, Registry};
use crate::statistics::{Counters, Statistics};

/// Signs the results this node produces.
pub trait ResultSigner: Send + Sync + 'static {
    fn sign(&self, challenge: &[u8]) -> String;
}

impl ResultSigner for ed25519_dalek::SigningKey {
    fn sign(&self, challenge: &[u8]) -> String {
        weft_common::crypto::sign_challenge(self, challenge)
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Types provisioned first during startup replay, in this order.
    /// Networks and storage come up before the workloads that attach to them.
    pub startup_order: Vec<WorkloadType>,
    /// Retry schedule for transient failures.
    pub backoff: Backoff,
    /// Upper bound on concurrent provisioning workers per type. Types not
    /// listed are unbounded.
    pub provision_bounds: HashMap<WorkloadType, usize>,
    /// Janitor scan interval.
    pub janitor_interval: Duration,
    /// How long shutdown waits for in-flight workers.
    pub shutdown_grace: Duration,
    /// Maximum tolerated `created_at` clock skew into the future, seconds.
    pub max_clock_skew_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut provision_bounds = HashMap::new();
        provision_bounds.insert(WorkloadType::NetworkResource, 1);
        EngineConfig {
            startup_order: vec![
                WorkloadType::NetworkResource,
                WorkloadType::Volume,
                WorkloadType::PublicIp,
            ],
            backoff: Backoff::default(),
            provision_bounds,
            janitor_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            max_clock_skew_secs: 3600,
        }
    }
}

/// Admission outcome for a syntactically valid, authenticated reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admitted {
    /// Charged and queued for provisioning.
    Queued,
    /// The id is already present and live; nothing changed.
    Duplicate,
    /// The node cannot host it; recorded with an error result.
    CapacityExhausted,
}

/// Errors surfaced to the submitter.
#[derive(Debug, Error)]
pub enum CreateError {
    #[error("invalid reservation: {0}")]
    Validation(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The id belongs to a deleted reservation; ids are never reused.
    #[error("reservation {0} is deleted; resubmission requires a new id")]
    Terminal(ReservationId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced to a delete caller.
#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("reservation {0} not found")]
    NotFound(ReservationId),

    #[error(transparent)]
    Store(StoreError),
}

/// Fatal engine failures (startup only; the steady loop retries instead).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store failure during startup: {0}")]
    Store(#[from] StoreError),
}

/// What a worker was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    Provision,
    Decommission(DeleteCause),
}

/// Worker report back to the loop.
#[derive(Debug)]
enum Outcome {
    ProvisionOk,
    ProvisionTransient(String),
    ProvisionPermanent,
    ProvisionCancelled,
    /// Deletion intent observed before or during the attempt; the result
    /// was discarded.
    ProvisionSkipped,
    DecommissionOk,
    DecommissionTransient(String),
    DecommissionPermanent,
    /// Already in the deleted state; nothing to do, nothing to refund.
    DecommissionNoop,
    /// A store operation failed mid-flight; retried on the next tick.
    StoreFailed(JobKind),
}

#[derive(Debug)]
enum Event {
    Provision(ReservationId),
    Delete { id: ReservationId, cause: DeleteCause },
    Retry { id: ReservationId, kind: JobKind },
    WorkerDone { id: ReservationId, outcome: Outcome },
}

struct Shared {
    store: Arc<dyn Store>,
    stats: Statistics,
    twins: Arc<dyn TwinRegistry>,
    admins: Arc<dyn AdminRegistry>,
    registry: Registry,
    signer: Arc<dyn ResultSigner>,
    events: EventBus,
    config: EngineConfig,
    tx: mpsc::UnboundedSender<Event>,
    shutdown: Arc<Notify>,
    // `Notify` alone loses a wakeup that fires while the loop is busy
    shutdown_fired: AtomicBool,
    bounds: HashMap<WorkloadType, Arc<Semaphore>>,
}

impl Shared {
    fn signed_result(
        &self,
        id: &str,
        state: ResultState,
        message: impl Into<String>,
        data: Value,
    ) -> ReservationResult {
        let mut result = ReservationResult::new(state, message, data, now_unix());
        result.signature = self.signer.sign(&result.challenge(id));
        result
    }

    /// Footprint of a stored reservation; logs and zeroes out on a payload
    /// that no longer parses (it parsed at admission, so this is corruption).
    fn capacity_of(&self, reservation: &Reservation) -> Capacity {
        match reservation.capacity() {
            Ok(cap) => cap,
            Err(err) => {
                warn!(id = %reservation.id, %err, "stored payload no longer parses; assuming zero footprint");
                Capacity::default()
            }
        }
    }
}

/// Whether a reservation in this result state holds a capacity charge.
fn holds_charge(state: Option<ResultState>) -> bool {
    matches!(state, None | Some(ResultState::Unknown) | Some(ResultState::Ok))
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    /// Admit a new reservation: validate, authenticate, charge capacity,
    /// persist, and queue for provisioning. Synchronous up to the durable
    /// write; the actual provisioning is asynchronous.
    pub fn create(&self, mut reservation: Reservation) -> Result<Admitted, CreateError> {
        let s = &self.shared;

        if !is_valid_id(&reservation.id) {
            return Err(CreateError::Validation(format!(
                "id {:?} is not a valid reservation id",
                reservation.id
            )));
        }
        if reservation.duration_secs == 0 {
            return Err(CreateError::Validation("duration must be positive".into()));
        }
        let now = now_unix();
        if reservation.created_at > now.saturating_add(s.config.max_clock_skew_secs) {
            return Err(CreateError::Validation("created_at is in the far future".into()));
        }
        if reservation.is_expired(now) {
            return Err(CreateError::Validation("reservation has already expired".into()));
        }
        auth::verify_reservation(&*s.twins, &reservation)?;
        let capacity = reservation
            .capacity()
            .map_err(|e| CreateError::Validation(e.to_string()))?;

        // the caller cannot smuggle lifecycle state in
        reservation.to_delete = false;
        reservation.result = None;

        if let Err(rejection) = s.stats.reserve(reservation.workload_type, &capacity) {
            // record the rejection so `get` can observe it; nothing charged
            reservation.result = Some(s.signed_result(
                &reservation.id,
                ResultState::Error,
                "capacity exhausted",
                Value::Null,
            ));
            return match s.store.add(&reservation) {
                Ok(()) => {
                    warn!(id = %reservation.id, missing = %rejection.missing, "capacity rejected");
                    s.events.publish(EngineEvent::CapacityRejected {
                        id: reservation.id.clone(),
                        twin: reservation.twin_id,
                        missing: rejection.missing,
                    });
                    Ok(Admitted::CapacityExhausted)
                }
                Err(StoreError::AlreadyExists(_)) => self.admit_duplicate(&reservation.id),
                Err(err) => Err(err.into()),
            };
        }

        match s.store.add(&reservation) {
            Ok(()) => {
                info!(
                    id = %reservation.id,
                    twin = reservation.twin_id,
                    workload_type = %reservation.workload_type,
                    "reservation accepted"
                );
                s.events.publish(EngineEvent::Accepted {
                    id: reservation.id.clone(),
                    twin: reservation.twin_id,
                    workload_type: reservation.workload_type,
                });
                let _ = s.tx.send(Event::Provision(reservation.id));
                Ok(Admitted::Queued)
            }
            Err(StoreError::AlreadyExists(_)) => {
                // do not double-charge an idempotent resubmission
                s.stats.release(reservation.workload_type, &capacity);
                self.admit_duplicate(&reservation.id)
            }
            Err(err) => {
                s.stats.release(reservation.workload_type, &capacity);
                Err(err.into())
            }
        }
    }

    fn admit_duplicate(&self, id: &str) -> Result<Admitted, CreateError> {
        let existing = self.shared.store.get(id)?;
        if existing.to_delete || existing.result_state() == Some(ResultState::Deleted) {
            Err(CreateError::Terminal(id.to_string()))
        } else {
            debug!(%id, "duplicate submission accepted as no-op");
            Ok(Admitted::Duplicate)
        }
    }

    /// Request decommission of a reservation. Authorization is enforced by
    /// the caller (the admission API); the engine trusts the signal. The
    /// durable intent is set before this returns; idempotent.
    pub fn delete(&self, id: &str) -> Result<(), DeleteError> {
        self.delete_with_cause(id, DeleteCause::Requested)
    }

    pub(crate) fn delete_with_cause(&self, id: &str, cause: DeleteCause) -> Result<(), DeleteError> {
        let s = &self.shared;
        let existing = s.store.get(id).map_err(|e| match e {
            StoreError::NotFound(id) => DeleteError::NotFound(id),
            other => DeleteError::Store(other),
        })?;
        if existing.result_state() == Some(ResultState::Deleted) {
            return Ok(());
        }
        s.store.mark_to_delete(id).map_err(DeleteError::Store)?;
        if cause == DeleteCause::Expired {
            s.events.publish(EngineEvent::Expired { id: id.to_string() });
        }
        let _ = s.tx.send(Event::Delete { id: id.to_string(), cause });
        Ok(())
    }

    /// Fetch a reservation including its latest result.
    pub fn get(&self, id: &str) -> Result<Reservation, StoreError> {
        self.shared.store.get(id)
    }

    pub fn list_all(&self) -> Vec<ReservationId> {
        self.shared.store.list_all()
    }

    pub fn list_by_twin(
        &self,
        twin: weft_common::TwinId,
        workload_type: Option<WorkloadType>,
    ) -> Vec<ReservationId> {
        self.shared.store.list_by_twin(twin, workload_type)
    }

    pub fn list_by_type(&self, workload_type: WorkloadType) -> Vec<ReservationId> {
        self.shared.store.list_by_type(workload_type)
    }

    /// Capacity ledger snapshot.
    pub fn counters(&self) -> Counters {
        self.shared.stats.counters()
    }

    /// Subscribe to the engine's observability events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    /// Twin key registry, for the admission API's delete authorization.
    pub fn twins(&self) -> &Arc<dyn TwinRegistry> {
        &self.shared.twins
    }

    /// Admin registry, for the admission API's delete authorization.
    pub fn admins(&self) -> &Arc<dyn AdminRegistry> {
        &self.shared.admins
    }

    /// Ask the engine to stop. Returns immediately; `run` drains in-flight
    /// workers up to the grace deadline.
    pub fn shutdown(&self) {
        self.shared.shutdown_fired.store(true, Ordering::Release);
        self.shared.shutdown.notify_waiters();
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.shared.store
    }
}

/// Scheduling state owned by the event loop.
#[derive(Default)]
struct LoopState {
    active: HashMap<ReservationId, ActiveJob>,
    pending: HashMap<ReservationId, VecDeque<JobKind>>,
    attempts: HashMap<ReservationId, u32>,
    startup: Option<StartupReplay>,
    deferred: Vec<ReservationId>,
    shutting_down: bool,
}

struct ActiveJob {
    kind: JobKind,
    cancel: Arc<Notify>,
}

/// Phase-gated startup replay: a later phase starts only when every job of
/// the current phase has settled (ok, permanent error, or retry scheduled).
struct StartupReplay {
    phases: VecDeque<Vec<(ReservationId, JobKind)>>,
    unsettled: HashSet<ReservationId>,
}

/// The reconciling engine. Construct, take a [`EngineHandle`], then drive
/// [`Engine::run`] on the runtime.
pub struct Engine {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        stats: Statistics,
        twins: Arc<dyn TwinRegistry>,
        admins: Arc<dyn AdminRegistry>,
        registry: Registry,
        signer: Arc<dyn ResultSigner>,
        config: EngineConfig,
    ) -> Engine {
        let (tx, rx) = mpsc::unbounded_channel();
        let bounds = config
            .provision_bounds
            .iter()
            .map(|(t, n)| (*t, Arc::new(Semaphore::new((*n).max(1)))))
            .collect();
        let shared = Arc::new(Shared {
            store,
            stats,
            twins,
            admins,
            registry,
            signer,
            events: EventBus::default(),
            config,
            tx,
            shutdown: Arc::new(Notify::new()),
            shutdown_fired: AtomicBool::new(false),
            bounds,
        });
        Engine { shared, rx }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run the engine until shutdown: rebuild the ledger, run the runtime
    /// upgrade hooks, replay persisted reservations in priority order, then
    /// serve events.
    pub async fn run(mut self) -> Result<(), EngineError> {
        let handle = self.handle();
        let mut state = LoopState::default();

        let flagged = self.rebuild_statistics()?;
        self.shared
            .registry
            .runtime_upgrade_all(self.shared.store.as_ref())
            .await;
        self.prepare_startup_replay(&mut state, &flagged)?;

        let janitor = Janitor::new(
            handle.clone(),
            self.shared.config.janitor_interval,
            self.shared.shutdown.clone(),
        )
        .spawn();

        self.advance_startup(&mut state);
        info!("provision engine running");

        loop {
            let notified = self.shared.shutdown.notified();
            tokio::pin!(notified);
            // register interest before checking the flag, so a shutdown that
            // fired while an event was being handled is never lost
            notified.as_mut().enable();
            if self.shared.shutdown_fired.load(Ordering::Acquire) {
                state.shutting_down = true;
                break;
            }
            tokio::select! {
                _ = &mut notified => {
                    state.shutting_down = true;
                    break;
                }
                ev = self.rx.recv() => match ev {
                    Some(ev) => self.handle_event(&mut state, ev),
                    None => break,
                },
            }
        }

        info!(
            in_flight = state.active.len(),
            "engine stopping; draining workers"
        );
        let grace = self.shared.config.shutdown_grace;
        let drain = async {
            while !state.active.is_empty() {
                match self.rx.recv().await {
                    Some(Event::WorkerDone { id, outcome }) => {
                        debug!(%id, ?outcome, "worker finished during drain");
                        state.active.remove(&id);
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        };
        if timeout(grace, drain).await.is_err() {
            warn!("shutdown grace deadline hit with workers still in flight");
        }
        // the janitor has its own shutdown listener; the abort is the
        // backstop for a wakeup that raced its scan
        janitor.abort();
        let _ = janitor.await;
        info!("engine stopped");
        Ok(())
    }

    /// Recharge the ledger from persisted truth. Returns the ids that no
    /// longer fit the node's capacity and must be force-decommissioned.
    fn rebuild_statistics(&self) -> Result<Vec<ReservationId>, EngineError> {
        let snapshot = self
            .shared
            .store
            .in_startup_order(&self.shared.config.startup_order);
        let mut flagged = Vec::new();
        for r in &snapshot {
            if !holds_charge(r.result_state()) {
                continue;
            }
            let cap = self.shared.capacity_of(r);
            if self.shared.stats.reserve(r.workload_type, &cap).is_err() {
                warn!(
                    id = %r.id,
                    capacity = %cap,
                    "reservation no longer fits node capacity; forcing decommission"
                );
                // still running out there until decommission catches up
                self.shared.stats.force_reserve(r.workload_type, &cap);
                self.shared.store.mark_to_delete(&r.id)?;
                flagged.push(r.id.clone());
            }
        }
        info!(
            reservations = snapshot.len(),
            current = %self.shared.stats.current(),
            "capacity ledger rebuilt"
        );
        Ok(flagged)
    }

    /// Decide the replay job for every persisted reservation and group them
    /// into startup phases: one phase per priority type, then everything else.
    fn prepare_startup_replay(
        &self,
        state: &mut LoopState,
        flagged: &[ReservationId],
    ) -> Result<(), EngineError> {
        let order = &self.shared.config.startup_order;
        let snapshot = self.shared.store.in_startup_order(order);
        let flagged: HashSet<&ReservationId> = flagged.iter().collect();

        let phase_count = order.len() + 1;
        let mut phases: Vec<Vec<(ReservationId, JobKind)>> = vec![Vec::new(); phase_count];
        for r in snapshot {
            let job = match (r.result_state(), r.to_delete) {
                (Some(ResultState::Deleted), _) => continue,
                (_, true) => {
                    let cause = if flagged.contains(&r.id) {
                        DeleteCause::OverCapacity
                    } else {
                        DeleteCause::Requested
                    };
                    JobKind::Decommission(cause)
                }
                (None | Some(ResultState::Unknown), false) => JobKind::Provision,
                // running; nothing to re-drive
                (Some(ResultState::Ok), false) => continue,
                // persisted permanent errors are terminal until resubmission
                (Some(ResultState::Error), false) => continue,
            };
            let phase = order
                .iter()
                .position(|t| *t == r.workload_type)
                .unwrap_or(order.len());
            phases[phase].push((r.id, job));
        }

        let total: usize = phases.iter().map(Vec::len).sum();
        if total > 0 {
            info!(jobs = total, "startup replay prepared");
        }
        state.startup = Some(StartupReplay {
            phases: phases.into_iter().collect(),
            unsettled: HashSet::new(),
        });
        Ok(())
    }

    /// Dispatch phases until one has unsettled jobs or none remain.
    fn advance_startup(&self, state: &mut LoopState) {
        loop {
            let Some(replay) = state.startup.as_mut() else { return };
            if !replay.unsettled.is_empty() {
                return;
            }
            let Some(batch) = replay.phases.pop_front() else {
                state.startup = None;
                let deferred = std::mem::take(&mut state.deferred);
                if !deferred.is_empty() {
                    debug!(count = deferred.len(), "dispatching work deferred during replay");
                }
                info!("startup replay complete");
                for id in deferred {
                    self.dispatch(state, id, JobKind::Provision);
                }
                return;
            };
            if batch.is_empty() {
                continue;
            }
            replay
                .unsettled
                .extend(batch.iter().map(|(id, _)| id.clone()));
            for (id, kind) in batch {
                self.dispatch(state, id, kind);
            }
            return;
        }
    }

    fn handle_event(&self, state: &mut LoopState, event: Event) {
        match event {
            Event::Provision(id) => {
                if state.startup.is_some() {
                    // replay owns the ordering until it completes
                    state.deferred.push(id);
                } else {
                    self.dispatch(state, id, JobKind::Provision);
                }
            }

            Event::Delete { id, cause } => {
                // durable intent, idempotent; covers every delete source
                if let Err(err) = self.shared.store.mark_to_delete(&id) {
                    match err {
                        StoreError::NotFound(_) => return,
                        other => {
                            warn!(%id, err = %other, "failed to mark deletion intent; will retry");
                            self.schedule_retry(state, id, JobKind::Decommission(cause));
                            return;
                        }
                    }
                }
                match state.active.get(&id) {
                    Some(active) if active.kind == JobKind::Provision => {
                        // abandon the in-flight provision; its result is ignored
                        active.cancel.notify_waiters();
                        Self::queue_pending(state, &id, JobKind::Decommission(cause));
                    }
                    // an active decommission already covers the intent
                    Some(_) => {}
                    None => self.dispatch(state, id, JobKind::Decommission(cause)),
                }
            }

            Event::Retry { id, kind } => self.handle_retry(state, id, kind),

            Event::WorkerDone { id, outcome } => {
                let finished = state.active.remove(&id);
                self.handle_outcome(state, &id, finished, outcome);
                if let Some(next) = Self::pop_pending(state, &id) {
                    self.dispatch(state, id.clone(), next);
                }
                self.settle_startup(state, &id);
            }
        }
    }

    fn handle_retry(&self, state: &mut LoopState, id: ReservationId, kind: JobKind) {
        if state.active.contains_key(&id) {
            // another job got there first; its completion will reschedule
            return;
        }
        let reservation = match self.shared.store.get(&id) {
            Ok(r) => r,
            Err(StoreError::NotFound(_)) => {
                state.attempts.remove(&id);
                return;
            }
            Err(err) => {
                warn!(%id, %err, "store read failed on retry; rescheduling");
                self.schedule_retry(state, id, kind);
                return;
            }
        };
        if reservation.result_state() == Some(ResultState::Deleted) {
            state.attempts.remove(&id);
            return;
        }
        if reservation.to_delete {
            let cause = match kind {
                JobKind::Decommission(cause) => cause,
                JobKind::Provision => DeleteCause::Requested,
            };
            self.dispatch(state, id, JobKind::Decommission(cause));
        } else if kind == JobKind::Provision {
            self.dispatch(state, id, JobKind::Provision);
        }
    }

    fn handle_outcome(
        &self,
        state: &mut LoopState,
        id: &ReservationId,
        finished: Option<ActiveJob>,
        outcome: Outcome,
    ) {
        match outcome {
            Outcome::ProvisionOk
            | Outcome::ProvisionPermanent
            | Outcome::DecommissionOk
            | Outcome::DecommissionPermanent
            | Outcome::DecommissionNoop => {
                state.attempts.remove(id);
            }

            Outcome::ProvisionTransient(message) => {
                let deletion_pending = state
                    .pending
                    .get(id)
                    .is_some_and(|q| q.iter().any(|k| matches!(k, JobKind::Decommission(_))));
                if !deletion_pending && !state.shutting_down {
                    debug!(%id, %message, "provision failed transiently");
                    self.schedule_retry(state, id.clone(), JobKind::Provision);
                }
            }

            Outcome::ProvisionCancelled => {
                let deletion_pending = state
                    .pending
                    .get(id)
                    .is_some_and(|q| q.iter().any(|k| matches!(k, JobKind::Decommission(_))));
                if !deletion_pending && !state.shutting_down {
                    // cancelled for any reason other than decommission: transient
                    self.schedule_retry(state, id.clone(), JobKind::Provision);
                }
            }

            Outcome::ProvisionSkipped => {
                // the worker saw the deletion intent; make sure a
                // decommission is actually lined up
                let lined_up = state.pending.get(id).is_some_and(|q| !q.is_empty());
                if !lined_up {
                    Self::queue_pending(state, id, JobKind::Decommission(DeleteCause::Requested));
                }
            }

            Outcome::DecommissionTransient(message) => {
                if !state.shutting_down {
                    debug!(%id, %message, "decommission failed transiently");
                    let kind = finished
                        .map(|j| j.kind)
                        .unwrap_or(JobKind::Decommission(DeleteCause::Requested));
                    self.schedule_retry(state, id.clone(), kind);
                }
            }

            Outcome::StoreFailed(kind) => {
                if !state.shutting_down {
                    self.schedule_retry(state, id.clone(), kind);
                }
            }
        }
    }

    fn schedule_retry(&self, state: &mut LoopState, id: ReservationId, kind: JobKind) {
        let attempt = state.attempts.get(&id).copied().unwrap_or(0);
        state.attempts.insert(id.clone(), attempt + 1);
        let delay = self.shared.config.backoff.delay(attempt);
        self.shared.events.publish(EngineEvent::RetryScheduled {
            id: id.clone(),
            attempt: attempt + 1,
            delay,
        });
        debug!(%id, attempt = attempt + 1, ?delay, "retry scheduled");
        let tx = self.shared.tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Event::Retry { id, kind });
        });
    }

    fn queue_pending(state: &mut LoopState, id: &ReservationId, kind: JobKind) {
        let queue = state.pending.entry(id.clone()).or_default();
        // one decommission in line is enough
        if matches!(kind, JobKind::Decommission(_))
            && queue.iter().any(|k| matches!(k, JobKind::Decommission(_)))
        {
            return;
        }
        queue.push_back(kind);
    }

    fn pop_pending(state: &mut LoopState, id: &ReservationId) -> Option<JobKind> {
        let queue = state.pending.get_mut(id)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            state.pending.remove(id);
        }
        next
    }

    fn settle_startup(&self, state: &mut LoopState, id: &ReservationId) {
        let advance = match state.startup.as_mut() {
            Some(replay) => {
                // a job only settles once nothing else is queued for its id
                if !state.pending.contains_key(id) && !state.active.contains_key(id) {
                    replay.unsettled.remove(id);
                }
                replay.unsettled.is_empty()
            }
            None => false,
        };
        if advance {
            self.advance_startup(state);
        }
    }

    fn dispatch(&self, state: &mut LoopState, id: ReservationId, kind: JobKind) {
        if state.shutting_down {
            return;
        }
        if state.active.contains_key(&id) {
            Self::queue_pending(state, &id, kind);
            return;
        }
        let cancel = Arc::new(Notify::new());
        state.active.insert(
            id.clone(),
            ActiveJob {
                kind,
                cancel: cancel.clone(),
            },
        );
        let shared = self.shared.clone();
        match kind {
            JobKind::Provision => {
                tokio::spawn(async move {
                    let outcome = provision_attempt(&shared, &id, cancel).await;
                    let _ = shared.tx.send(Event::WorkerDone { id, outcome });
                });
            }
            JobKind::Decommission(cause) => {
                tokio::spawn(async move {
                    let outcome = decommission_attempt(&shared, &id, cancel, cause).await;
                    let _ = shared.tx.send(Event::WorkerDone { id, outcome });
                });
            }
        }
    }
}

async fn provision_attempt(
    shared: &Arc<Shared>,
    id: &ReservationId,
    cancel: Arc<Notify>,
) -> Outcome {
    let reservation = match shared.store.get(id) {
        Ok(r) => r,
        Err(err) => {
            error!(%id, %err, "store read failed before provisioning");
            return Outcome::StoreFailed(JobKind::Provision);
        }
    };
    if reservation.to_delete || reservation.result_state() == Some(ResultState::Deleted) {
        return Outcome::ProvisionSkipped;
    }

    // per-type worker bound
    let _permit = match shared.bounds.get(&reservation.workload_type) {
        Some(sem) => {
            let acquired = tokio::select! {
                permit = sem.clone().acquire_owned() => permit,
                _ = cancel.notified() => return Outcome::ProvisionCancelled,
                _ = shared.shutdown.notified() => return Outcome::ProvisionCancelled,
            };
            match acquired {
                Ok(permit) => Some(permit),
                Err(_) => return Outcome::ProvisionCancelled,
            }
        }
        None => None,
    };

    debug!(%id, workload_type = %reservation.workload_type, "provisioning");
    let outcome = tokio::select! {
        outcome = shared.registry.provision(&reservation, cancel.clone()) => outcome,
        _ = cancel.notified() => return Outcome::ProvisionCancelled,
        _ = shared.shutdown.notified() => return Outcome::ProvisionCancelled,
    };

    match outcome {
        Ok(provisioned) => {
            let data = match provisioned {
                Provisioned::Data(data) => data,
                Provisioned::Unchanged => reservation
                    .result
                    .as_ref()
                    .map(|r| r.data.clone())
                    .unwrap_or(Value::Null),
            };
            let result = shared.signed_result(id, ResultState::Ok, "", data);
            match shared.store.set_result(id, result) {
                Ok(()) => {
                    info!(%id, "provisioned");
                    shared.events.publish(EngineEvent::Provisioned {
                        id: id.clone(),
                        workload_type: reservation.workload_type,
                    });
                    Outcome::ProvisionOk
                }
                // deletion raced us; the workload exists and the
                // decommission queued behind us will tear it down
                Err(StoreError::PreconditionFailed { .. }) => Outcome::ProvisionSkipped,
                Err(err) => {
                    error!(%id, %err, "failed to persist provision result");
                    Outcome::StoreFailed(JobKind::Provision)
                }
            }
        }
        Err(PrimitiveError::Transient(message)) => Outcome::ProvisionTransient(message),
        Err(PrimitiveError::Permanent(message)) => {
            let result = shared.signed_result(id, ResultState::Error, &message, Value::Null);
            match shared.store.set_result(id, result) {
                Ok(()) => {
                    // the workload never took resources; refund the admission charge
                    let cap = shared.capacity_of(&reservation);
                    shared.stats.release(reservation.workload_type, &cap);
                    warn!(%id, %message, "provision failed permanently");
                    shared.events.publish(EngineEvent::ProvisionError {
                        id: id.clone(),
                        message,
                    });
                    Outcome::ProvisionPermanent
                }
                Err(StoreError::PreconditionFailed { .. }) => Outcome::ProvisionSkipped,
                Err(err) => {
                    error!(%id, %err, "failed to persist provision error");
                    Outcome::StoreFailed(JobKind::Provision)
                }
            }
        }
    }
}

async fn decommission_attempt(
    shared: &Arc<Shared>,
    id: &ReservationId,
    cancel: Arc<Notify>,
    cause: DeleteCause,
) -> Outcome {
    let reservation = match shared.store.get(id) {
        Ok(r) => r,
        Err(StoreError::NotFound(_)) => return Outcome::DecommissionNoop,
        Err(err) => {
            error!(%id, %err, "store read failed before decommissioning");
            return Outcome::StoreFailed(JobKind::Decommission(cause));
        }
    };
    if reservation.result_state() == Some(ResultState::Deleted) {
        return Outcome::DecommissionNoop;
    }
    let charged = holds_charge(reservation.result_state());

    debug!(%id, workload_type = %reservation.workload_type, ?cause, "decommissioning");
    let outcome = tokio::select! {
        outcome = shared.registry.decommission(&reservation, cancel.clone()) => outcome,
        _ = shared.shutdown.notified() => {
            // the durable intent survives; replay finishes the job after restart
            return Outcome::DecommissionTransient("interrupted by shutdown".into());
        }
    };

    let (message, forced) = match outcome {
        Ok(()) => ("decommissioned".to_string(), false),
        Err(PrimitiveError::Transient(message)) => {
            return Outcome::DecommissionTransient(message)
        }
        Err(PrimitiveError::Permanent(message)) => {
            // forward progress over livelock: a human can see the log, the
            // node cannot wait forever on a broken backend
            error!(%id, %message, "decommission failed permanently; forcing deleted state");
            (format!("decommission forced: {message}"), true)
        }
    };

    let result = shared.signed_result(id, ResultState::Deleted, &message, Value::Null);
    match shared.store.set_result(id, result) {
        Ok(()) => {
            if charged {
                let cap = shared.capacity_of(&reservation);
                shared.stats.release(reservation.workload_type, &cap);
            }
            if forced {
                // drop the record so the broken workload cannot wedge replay
                if let Err(err) = shared.store.remove(id) {
                    warn!(%id, %err, "failed to remove forcibly deleted reservation");
                }
            }
            info!(%id, ?cause, "decommissioned");
            shared.events.publish(EngineEvent::Decommissioned {
                id: id.clone(),
                cause,
            });
            if forced {
                Outcome::DecommissionPermanent
            } else {
                Outcome::DecommissionOk
            }
        }
        Err(StoreError::PreconditionFailed { .. }) => Outcome::DecommissionNoop,
        Err(err) => {
            error!(%id, %err, "failed to persist decommission result");
            Outcome::StoreFailed(JobKind::Decommission(cause))
        }
    }
}
