//! Primitive dispatch.
//!
//! A primitive backend knows how to deploy and tear down one workload type.
//! The [`Registry`] maps each type to its backend and wraps every call in
//! the per-type operation deadline; the engine layers cancellation on top.
//!
//! Error classification drives the engine's retry policy:
//!
//! - `Transient` — try again later with backoff
//! - `Permanent` — terminal; the engine records the error and moves on

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;

use weft_common::{Reservation, WorkloadType};
use weft_store::Store;

/// Successful provision outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// The workload was deployed; `data` is forwarded verbatim into the
    /// reservation result.
    Data(serde_json::Value),
    /// The workload was already at the desired state; keep any previous
    /// result data.
    Unchanged,
}

/// Failure classification shared by provision and decommission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveError {
    /// Worth retrying: the backend or its dependency is temporarily
    /// unavailable.
    Transient(String),
    /// Terminal: retrying cannot succeed without operator intervention.
    Permanent(String),
}

impl PrimitiveError {
    pub fn message(&self) -> &str {
        match self {
            PrimitiveError::Transient(m) | PrimitiveError::Permanent(m) => m,
        }
    }
}

impl fmt::Display for PrimitiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimitiveError::Transient(m) => write!(f, "transient: {m}"),
            PrimitiveError::Permanent(m) => write!(f, "permanent: {m}"),
        }
    }
}

/// Bounded context handed to every primitive operation.
///
/// `deadline` is the per-type operation budget (already enforced by the
/// registry); `cancel` fires when the engine abandons the operation, either
/// because a decommission arrived or the daemon is shutting down. Backends
/// doing long work should poll it at natural suspension points.
#[derive(Debug, Clone)]
pub struct OpCtx {
    pub deadline: Duration,
    pub cancel: Arc<Notify>,
}

/// A backend that can deploy and tear down one workload type.
#[async_trait]
pub trait Primitive: Send + Sync + 'static {
    /// Deploy the reservation's workload.
    async fn provision(
        &self,
        ctx: &OpCtx,
        reservation: &Reservation,
    ) -> Result<Provisioned, PrimitiveError>;

    /// Tear the workload down. Must be idempotent: deleting a workload that
    /// does not exist is `Ok`.
    async fn decommission(
        &self,
        ctx: &OpCtx,
        reservation: &Reservation,
    ) -> Result<(), PrimitiveError>;

    /// Reconcile external state against the store at engine startup, before
    /// the main loop runs (kill orphans, re-attach mounts). May mutate the
    /// store through [`Store::reconcile`] only. Must be idempotent.
    async fn runtime_upgrade(&self, _store: &dyn Store) {}
}

/// Per-type operation deadlines.
#[derive(Debug, Clone)]
pub struct Deadlines {
    by_type: HashMap<WorkloadType, Duration>,
    default: Duration,
}

impl Default for Deadlines {
    /// Containers and VMs may legitimately pull images for minutes; the
    /// rest settle in well under two.
    fn default() -> Self {
        let mut by_type = HashMap::new();
        by_type.insert(WorkloadType::Container, Duration::from_secs(300));
        by_type.insert(WorkloadType::VirtualMachine, Duration::from_secs(300));
        by_type.insert(WorkloadType::NetworkResource, Duration::from_secs(60));
        Deadlines {
            by_type,
            default: Duration::from_secs(120),
        }
    }
}

impl Deadlines {
    /// Same deadline for every type (tests).
    pub fn uniform(deadline: Duration) -> Self {
        Deadlines {
            by_type: HashMap::new(),
            default: deadline,
        }
    }

    pub fn for_type(&self, t: WorkloadType) -> Duration {
        self.by_type.get(&t).copied().unwrap_or(self.default)
    }
}

/// Registry mapping workload types to their backends.
#[derive(Clone, Default)]
pub struct Registry {
    backends: HashMap<WorkloadType, Arc<dyn Primitive>>,
    deadlines: Deadlines,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new(deadlines: Deadlines) -> Self {
        Registry {
            backends: HashMap::new(),
            deadlines,
        }
    }

    /// Register the backend for a workload type, replacing any previous one.
    pub fn register(mut self, t: WorkloadType, backend: Arc<dyn Primitive>) -> Self {
        self.backends.insert(t, backend);
        self
    }

    fn backend(&self, t: WorkloadType) -> Result<&Arc<dyn Primitive>, PrimitiveError> {
        self.backends
            .get(&t)
            .ok_or_else(|| PrimitiveError::Permanent(format!("no backend for {t}")))
    }

    /// Provision through the type's backend with its deadline applied.
    /// A deadline overrun is transient: the workload may come up later.
    pub async fn provision(
        &self,
        reservation: &Reservation,
        cancel: Arc<Notify>,
    ) -> Result<Provisioned, PrimitiveError> {
        let backend = self.backend(reservation.workload_type)?;
        let deadline = self.deadlines.for_type(reservation.workload_type);
        let ctx = OpCtx { deadline, cancel };
        match timeout(deadline, backend.provision(&ctx, reservation)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PrimitiveError::Transient(format!(
                "provision deadline of {deadline:?} exceeded"
            ))),
        }
    }

    /// Decommission through the type's backend with its deadline applied.
    pub async fn decommission(
        &self,
        reservation: &Reservation,
        cancel: Arc<Notify>,
    ) -> Result<(), PrimitiveError> {
        let backend = self.backend(reservation.workload_type)?;
        let deadline = self.deadlines.for_type(reservation.workload_type);
        let ctx = OpCtx { deadline, cancel };
        match timeout(deadline, backend.decommission(&ctx, reservation)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PrimitiveError::Transient(format!(
                "decommission deadline of {deadline:?} exceeded"
            ))),
        }
    }

    /// Run every backend's `runtime_upgrade` hook once, at startup.
    pub async fn runtime_upgrade_all(&self, store: &dyn Store) {
        for (t, backend) in &self.backends {
            tracing::debug!(workload_type = %t, "running runtime upgrade hook");
            backend.runtime_upgrade(store).await;
        }
        if self.backends.is_empty() {
            warn!("no primitive backends registered");
        }
    }
}
