//! Capacity ledger.
//!
//! In-memory accounting of reserved resource units and workload counts per
//! type. [`Statistics::reserve`] is the only admission gate for
//! resource-consuming workloads; it is an atomic check-and-add across all
//! five counters. The ledger is rebuilt from the store at startup, so its
//! totals always equal the sum of footprints over reservations whose result
//! is `ok` and which are not marked for deletion.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use weft_common::{Capacity, WorkloadType};

/// Rejection from [`Statistics::reserve`]: the node cannot host the
/// workload. `missing` is the shortfall per resource unit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("insufficient capacity: missing {missing}")]
pub struct InsufficientCapacity {
    pub missing: Capacity,
}

#[derive(Debug, Default)]
struct Inner {
    current: Capacity,
    workloads: HashMap<WorkloadType, u64>,
}

/// Snapshot of the ledger for observers.
#[derive(Debug, Clone, Serialize)]
pub struct Counters {
    /// Units currently reserved by running workloads.
    pub current: Capacity,
    /// Total units the node offers.
    pub total: Capacity,
    /// Units held back for the node's own runtime.
    pub reserved: Capacity,
    /// Running workload count per type.
    pub workloads: HashMap<WorkloadType, u64>,
}

/// Shared capacity ledger. Cheap to clone; all clones see the same counters.
#[derive(Debug, Clone)]
pub struct Statistics {
    total: Capacity,
    reserved: Capacity,
    inner: Arc<Mutex<Inner>>,
}

impl Statistics {
    /// Create a ledger for a node offering `total` units, with `reserved`
    /// units held back for the node runtime itself (charged up front).
    pub fn new(total: Capacity, reserved: Capacity) -> Self {
        Statistics {
            total,
            reserved,
            inner: Arc::new(Mutex::new(Inner {
                current: reserved,
                workloads: HashMap::new(),
            })),
        }
    }

    /// Units currently reserved, including the node's own share.
    pub fn current(&self) -> Capacity {
        self.inner.lock().current
    }

    /// Total units offered by the node.
    pub fn total(&self) -> Capacity {
        self.total
    }

    /// Full snapshot for the statistics API.
    pub fn counters(&self) -> Counters {
        let inner = self.inner.lock();
        Counters {
            current: inner.current,
            total: self.total,
            reserved: self.reserved,
            workloads: inner.workloads.clone(),
        }
    }

    /// Atomically check and charge `capacity` for one workload of the given
    /// type. On rejection nothing is charged.
    pub fn reserve(
        &self,
        workload_type: WorkloadType,
        capacity: &Capacity,
    ) -> Result<(), InsufficientCapacity> {
        let mut inner = self.inner.lock();
        let next = inner.current.add(capacity);
        if !next.fits_in(&self.total) {
            return Err(InsufficientCapacity {
                missing: next.saturating_sub(&self.total),
            });
        }
        inner.current = next;
        *inner.workloads.entry(workload_type).or_insert(0) += 1;
        Ok(())
    }

    /// Charge `capacity` unconditionally, allowing the ledger to exceed the
    /// node total. Used only by the startup rebuild for reservations that no
    /// longer fit: the workload is still running out there, so the ledger
    /// reflects it until the forced decommission releases it.
    pub fn force_reserve(&self, workload_type: WorkloadType, capacity: &Capacity) {
        let mut inner = self.inner.lock();
        inner.current = inner.current.add(capacity);
        *inner.workloads.entry(workload_type).or_insert(0) += 1;
    }

    /// Refund `capacity` for one workload of the given type. Never fails;
    /// clamps at zero.
    pub fn release(&self, workload_type: WorkloadType, capacity: &Capacity) {
        let mut inner = self.inner.lock();
        inner.current = inner.current.saturating_sub(capacity);
        if let Some(count) = inner.workloads.get_mut(&workload_type) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_common::{GIB, MIB};

    fn totals() -> Capacity {
        Capacity { cru: 4, mru: 4 * GIB, hru: 0, sru: 10 * GIB, ipv4u: 1 }
    }

    #[test]
    fn test_reserve_and_release() {
        let stats = Statistics::new(totals(), Capacity::default());
        let cap = Capacity { cru: 1, mru: 128 * MIB, sru: GIB, ..Default::default() };

        stats.reserve(WorkloadType::Container, &cap).unwrap();
        assert_eq!(stats.current().cru, 1);
        assert_eq!(stats.counters().workloads[&WorkloadType::Container], 1);

        stats.release(WorkloadType::Container, &cap);
        assert!(stats.current().is_zero());
        assert_eq!(stats.counters().workloads[&WorkloadType::Container], 0);
    }

    #[test]
    fn test_reserve_reports_missing() {
        let stats = Statistics::new(totals(), Capacity::default());
        let cap = Capacity { cru: 4, ..Default::default() };
        stats.reserve(WorkloadType::Container, &cap).unwrap();

        let err = stats
            .reserve(WorkloadType::Container, &Capacity { cru: 2, ..Default::default() })
            .unwrap_err();
        assert_eq!(err.missing.cru, 2);
        // nothing was charged by the failed reserve
        assert_eq!(stats.current().cru, 4);
    }

    #[test]
    fn test_release_clamps_at_zero() {
        let stats = Statistics::new(totals(), Capacity::default());
        stats.release(WorkloadType::Volume, &Capacity { sru: GIB, ..Default::default() });
        assert!(stats.current().is_zero());
    }

    #[test]
    fn test_node_reserved_share_is_charged() {
        let reserved = Capacity { mru: GIB, sru: 2 * GIB, ..Default::default() };
        let stats = Statistics::new(totals(), reserved);
        assert_eq!(stats.current().mru, GIB);

        // the reserved share shrinks what workloads can take
        let err = stats
            .reserve(WorkloadType::Volume, &Capacity { sru: 9 * GIB, ..Default::default() })
            .unwrap_err();
        assert_eq!(err.missing.sru, GIB);
    }
}
