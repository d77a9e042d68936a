//! The storage trait the engine drives.

use std::fmt::Debug;

use weft_common::{Reservation, ReservationResult, ResultState, TwinId, WorkloadType};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// `add` on an id already present.
    #[error("reservation {0} already exists")]
    AlreadyExists(String),

    /// Lookup on an absent id.
    #[error("reservation {0} not found")]
    NotFound(String),

    /// `remove` on a reservation whose result is not `deleted`, or a
    /// result write that would violate the monotonic state transitions.
    #[error("precondition failed for reservation {id}: {reason}")]
    PreconditionFailed { id: String, reason: String },

    /// Underlying I/O failure. The record on disk is unchanged.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record failed to encode or decode.
    #[error("store codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Durable reservation storage keyed by id, with secondary indexes by twin
/// and by workload type.
///
/// Implementations serialize their own internal state; callers may share a
/// store across threads freely.
pub trait Store: Debug + Send + Sync + 'static {
    /// Persist a new reservation durably. Fails with
    /// [`StoreError::AlreadyExists`] if the id is present.
    fn add(&self, reservation: &Reservation) -> Result<(), StoreError>;

    /// Fetch the current reservation including its latest result.
    fn get(&self, id: &str) -> Result<Reservation, StoreError>;

    /// Atomically replace the result of an existing reservation.
    ///
    /// Enforces the monotonic transitions of [`ResultState`] and refuses to
    /// move a `to_delete` reservation back to `ok`.
    fn set_result(&self, id: &str, result: ReservationResult) -> Result<(), StoreError>;

    /// Set the deletion intent flag. Idempotent; the flag is never cleared.
    fn mark_to_delete(&self, id: &str) -> Result<(), StoreError>;

    /// Remove the record entirely. Only legal once the result state is
    /// [`ResultState::Deleted`].
    fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Reconciliation hook for `runtime_upgrade`: primitives are the
    /// authority on the real world and may force a result (including
    /// `deleted`) onto a record. Unlike `set_result`, re-asserting `deleted`
    /// on an already-deleted record is accepted, so the upgrade hook stays
    /// idempotent across reruns.
    fn reconcile(&self, id: &str, result: ReservationResult) -> Result<(), StoreError>;

    /// Ids owned by a twin, optionally restricted to one workload type.
    fn list_by_twin(&self, twin: TwinId, workload_type: Option<WorkloadType>) -> Vec<String>;

    /// Ids of all reservations of one workload type.
    fn list_by_type(&self, workload_type: WorkloadType) -> Vec<String>;

    /// All ids in the store.
    fn list_all(&self) -> Vec<String>;

    /// Reservations in recovery order: the given priority types first, in
    /// the order given, then every remaining type; within a type ascending
    /// `(created_at, id)`.
    fn in_startup_order(&self, priority: &[WorkloadType]) -> Vec<Reservation>;
}

/// Shared transition guard used by implementations.
pub(crate) fn check_transition(
    current: &Reservation,
    next: ResultState,
    reconcile: bool,
) -> Result<(), StoreError> {
    if let Some(state) = current.result_state() {
        let allowed = state.can_transition_to(next)
            || (reconcile && state == ResultState::Deleted && next == ResultState::Deleted);
        if !allowed {
            return Err(StoreError::PreconditionFailed {
                id: current.id.clone(),
                reason: format!("result transition {state} -> {next} is not allowed"),
            });
        }
    }
    // decommission is a one-way door
    if current.to_delete && next == ResultState::Ok {
        return Err(StoreError::PreconditionFailed {
            id: current.id.clone(),
            reason: "reservation is marked for deletion".into(),
        });
    }
    Ok(())
}
