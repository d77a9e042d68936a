//! Engine observability events.
//!
//! Every externally visible state transition is published on a broadcast
//! channel. Observers (the API layer, metrics, tests) subscribe and read;
//! the engine never blocks on slow observers — a lagging receiver drops
//! events, the store remains the source of truth.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use weft_common::{Capacity, ReservationId, TwinId, WorkloadType};

/// Why a decommission was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteCause {
    /// An authorized caller asked for it.
    Requested,
    /// The reservation crossed its expiry deadline.
    Expired,
    /// Node capacity shrank below what recovery needs.
    OverCapacity,
}

/// A state transition the engine wants the world to know about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Accepted {
        id: ReservationId,
        twin: TwinId,
        workload_type: WorkloadType,
    },
    CapacityRejected {
        id: ReservationId,
        twin: TwinId,
        missing: Capacity,
    },
    Provisioned {
        id: ReservationId,
        workload_type: WorkloadType,
    },
    ProvisionError {
        id: ReservationId,
        message: String,
    },
    RetryScheduled {
        id: ReservationId,
        attempt: u32,
        #[serde(with = "duration_secs")]
        delay: Duration,
    },
    Decommissioned {
        id: ReservationId,
        cause: DeleteCause,
    },
    Expired {
        id: ReservationId,
    },
}

mod duration_secs {
    use super::*;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

/// Publishing side of the event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Absent or lagging subscribers are not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}
