//! Mock primitive backends.
//!
//! Fully in-memory stand-ins for the real workload backends (container
//! runtime, network stack, storage pool, 0-db, IP filter). Used in mock
//! mode for development and by tests. Behavior is deterministic unless
//! failure injection is configured.
//!
//! Each backend parses its typed payload the way a real one would, so a
//! malformed payload fails permanently here exactly like it would against
//! the real runtime.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use sha3::{Digest, Sha3_256};
use tokio::time::sleep;
use tracing::{debug, info};

use weft_common::payload::{
    Container, NetworkResource, PublicIp, VirtualMachine, Volume, ZdbNamespace,
};
use weft_common::{Reservation, WorkloadType};
use weft_engine::{Deadlines, OpCtx, Primitive, PrimitiveError, Provisioned, Registry};
use weft_store::Store;

/// In-memory backend for one workload type.
///
/// - `latency`: simulated operation time (async, non-blocking)
/// - `failure_rate`: probability (0.0 - 1.0) that an operation fails
///   transiently, for exercising the engine's retry path
pub struct MockPrimitive {
    workload_type: WorkloadType,
    latency: Duration,
    failure_rate: f64,
    provisions: AtomicU32,
    decommissions: AtomicU32,
}

impl MockPrimitive {
    pub fn new(workload_type: WorkloadType) -> Self {
        MockPrimitive {
            workload_type,
            latency: Duration::ZERO,
            failure_rate: 0.0,
            provisions: AtomicU32::new(0),
            decommissions: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failure_rate(mut self, failure_rate: f64) -> Self {
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Number of successful provision calls (test helper).
    pub fn provision_count(&self) -> u32 {
        self.provisions.load(Ordering::SeqCst)
    }

    /// Number of successful decommission calls (test helper).
    pub fn decommission_count(&self) -> u32 {
        self.decommissions.load(Ordering::SeqCst)
    }

    async fn simulate(&self, op: &str) -> Result<(), PrimitiveError> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            return Err(PrimitiveError::Transient(format!(
                "injected {op} failure for {}",
                self.workload_type
            )));
        }
        Ok(())
    }

    /// Fabricate the result data a real backend would return.
    fn fabricate(&self, reservation: &Reservation) -> Result<Value, PrimitiveError> {
        let malformed =
            |e: serde_json::Error| PrimitiveError::Permanent(format!("malformed payload: {e}"));
        let data = reservation.data.clone();
        let value = match self.workload_type {
            WorkloadType::NetworkResource => {
                let net: NetworkResource = serde_json::from_value(data).map_err(malformed)?;
                json!({
                    "name": net.name,
                    "subnet": net.subnet,
                    "wireguard_key": derived_token(&reservation.id, "wg"),
                })
            }
            WorkloadType::Volume => {
                let vol: Volume = serde_json::from_value(data).map_err(malformed)?;
                json!({
                    "volume_id": reservation.id,
                    "path": format!("/mnt/{}", reservation.id),
                    "size_gib": vol.size_gib,
                })
            }
            WorkloadType::PublicIp => {
                let ip: PublicIp = serde_json::from_value(data).map_err(malformed)?;
                json!({ "ip": ip.ip, "gateway": ip.gateway })
            }
            WorkloadType::Container => {
                let ct: Container = serde_json::from_value(data).map_err(malformed)?;
                json!({
                    "container_id": reservation.id,
                    "flist": ct.flist,
                    "network": ct.network,
                })
            }
            WorkloadType::VirtualMachine => {
                let vm: VirtualMachine = serde_json::from_value(data).map_err(malformed)?;
                json!({ "vm_id": reservation.id, "image": vm.image })
            }
            WorkloadType::ZdbNamespace => {
                let ns: ZdbNamespace = serde_json::from_value(data).map_err(malformed)?;
                json!({
                    "namespace": format!("ns{}-{}", reservation.twin_id, reservation.id),
                    "port": 9900,
                    "public": ns.public,
                })
            }
        };
        Ok(value)
    }
}

#[async_trait]
impl Primitive for MockPrimitive {
    async fn provision(
        &self,
        _ctx: &OpCtx,
        reservation: &Reservation,
    ) -> Result<Provisioned, PrimitiveError> {
        self.simulate("provision").await?;
        let data = self.fabricate(reservation)?;
        self.provisions.fetch_add(1, Ordering::SeqCst);
        info!(
            id = %reservation.id,
            workload_type = %self.workload_type,
            "mock provisioned"
        );
        Ok(Provisioned::Data(data))
    }

    async fn decommission(
        &self,
        _ctx: &OpCtx,
        reservation: &Reservation,
    ) -> Result<(), PrimitiveError> {
        self.simulate("decommission").await?;
        self.decommissions.fetch_add(1, Ordering::SeqCst);
        info!(
            id = %reservation.id,
            workload_type = %self.workload_type,
            "mock decommissioned"
        );
        Ok(())
    }

    async fn runtime_upgrade(&self, _store: &dyn Store) {
        // nothing external to reconcile against
        debug!(workload_type = %self.workload_type, "mock runtime upgrade");
    }
}

fn derived_token(id: &str, label: &str) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(label.as_bytes());
    hasher.update(id.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// A registry with a mock backend for every workload type.
pub fn mock_registry(latency: Duration, failure_rate: f64) -> Registry {
    let mut registry = Registry::new(Deadlines::default());
    for t in WorkloadType::ALL {
        let backend = MockPrimitive::new(t)
            .with_latency(latency)
            .with_failure_rate(failure_rate);
        registry = registry.register(t, Arc::new(backend) as Arc<dyn Primitive>);
    }
    registry
}
