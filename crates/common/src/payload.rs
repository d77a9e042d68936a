//! Typed workload payloads and capacity derivation.
//!
//! Reservation `data` is opaque to the engine; the typed structs here are
//! parsed in exactly two places: by the primitive backend that deploys the
//! workload, and at admission to derive the [`Capacity`] footprint that the
//! statistics ledger charges.
//!
//! Footprint rules:
//!
//! | Type | cru | mru | hru | sru | ipv4u |
//! |------|-----|-----|-----|-----|-------|
//! | network_resource | - | - | - | - | - |
//! | volume | - | - | size (hdd) | size (ssd) | - |
//! | public_ip | - | - | - | - | 1 |
//! | container | cpu | memory | - | rootfs | - |
//! | virtual_machine | cpu | memory | - | disk | - |
//! | zero_db_namespace | - | - | size (hdd) | size (ssd) | - |

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capacity::{Capacity, GIB, MIB};
use crate::reservation::WorkloadType;

/// Error returned when a payload does not match its type's schema.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed {workload_type} payload: {reason}")]
pub struct PayloadError {
    pub workload_type: WorkloadType,
    pub reason: String,
}

/// Backing disk class for storage-bearing workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    Hdd,
    Ssd,
}

/// 0-db namespace access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZdbMode {
    Seq,
    User,
}

/// An overlay network segment on this node. Other workloads attach to it by
/// name, which is why networks are provisioned first at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkResource {
    /// Network name, referenced by dependent workloads.
    pub name: String,
    /// Node-local subnet in CIDR notation.
    pub subnet: String,
    /// Wireguard listen port for cross-node traffic.
    #[serde(default)]
    pub wireguard_port: Option<u16>,
}

impl NetworkResource {
    /// Networks consume no resource units; only the workload count moves.
    pub fn capacity(&self) -> Capacity {
        Capacity::default()
    }
}

/// A disk volume carved out of the node's storage pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub size_gib: u64,
    pub kind: DiskKind,
}

impl Volume {
    pub fn capacity(&self) -> Capacity {
        let bytes = self.size_gib.saturating_mul(GIB);
        match self.kind {
            DiskKind::Hdd => Capacity { hru: bytes, ..Default::default() },
            DiskKind::Ssd => Capacity { sru: bytes, ..Default::default() },
        }
    }
}

/// A public IPv4 address routed to a workload through the node filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicIp {
    /// Address with prefix, e.g. `185.69.166.12/24`.
    pub ip: String,
    /// Gateway for the address.
    #[serde(default)]
    pub gateway: String,
}

impl PublicIp {
    pub fn capacity(&self) -> Capacity {
        Capacity { ipv4u: 1, ..Default::default() }
    }
}

/// A volume mounted into a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    /// Reservation id of the volume.
    pub volume_id: String,
    /// Absolute mount point inside the container.
    pub mountpoint: String,
}

/// Container creation info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// URL of the root filesystem image.
    pub flist: String,
    /// Process to start inside the container.
    #[serde(default)]
    pub entrypoint: String,
    /// Environment passed to the entrypoint.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Virtual cores.
    pub cpu: u64,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// Root filesystem size in MiB, taken from the SSD pool.
    #[serde(default)]
    pub rootfs_mib: u64,
    /// Extra volume mounts.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Name of the network resource this container attaches to.
    pub network: String,
}

impl Container {
    pub fn capacity(&self) -> Capacity {
        Capacity {
            cru: self.cpu,
            mru: self.memory_mib.saturating_mul(MIB),
            sru: self.rootfs_mib.saturating_mul(MIB),
            ..Default::default()
        }
    }
}

/// Full virtual machine creation info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualMachine {
    /// Boot image name.
    pub image: String,
    pub cpu: u64,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// Boot disk size in GiB, taken from the SSD pool.
    pub disk_gib: u64,
    /// Name of the network resource the VM attaches to.
    pub network: String,
}

impl VirtualMachine {
    pub fn capacity(&self) -> Capacity {
        Capacity {
            cru: self.cpu,
            mru: self.memory_mib.saturating_mul(MIB),
            sru: self.disk_gib.saturating_mul(GIB),
            ..Default::default()
        }
    }
}

/// 0-db namespace creation info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZdbNamespace {
    pub size_gib: u64,
    pub kind: DiskKind,
    pub mode: ZdbMode,
    /// Whether the namespace is reachable without a password.
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub password: String,
}

impl ZdbNamespace {
    pub fn capacity(&self) -> Capacity {
        let bytes = self.size_gib.saturating_mul(GIB);
        match self.kind {
            DiskKind::Hdd => Capacity { hru: bytes, ..Default::default() },
            DiskKind::Ssd => Capacity { sru: bytes, ..Default::default() },
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    workload_type: WorkloadType,
    data: &serde_json::Value,
) -> Result<T, PayloadError> {
    serde_json::from_value(data.clone()).map_err(|e| PayloadError {
        workload_type,
        reason: e.to_string(),
    })
}

/// Derive the resource footprint of a payload of the given type.
pub fn capacity_of(
    workload_type: WorkloadType,
    data: &serde_json::Value,
) -> Result<Capacity, PayloadError> {
    let capacity = match workload_type {
        WorkloadType::NetworkResource => {
            parse::<NetworkResource>(workload_type, data)?.capacity()
        }
        WorkloadType::Volume => parse::<Volume>(workload_type, data)?.capacity(),
        WorkloadType::PublicIp => parse::<PublicIp>(workload_type, data)?.capacity(),
        WorkloadType::Container => parse::<Container>(workload_type, data)?.capacity(),
        WorkloadType::VirtualMachine => {
            parse::<VirtualMachine>(workload_type, data)?.capacity()
        }
        WorkloadType::ZdbNamespace => parse::<ZdbNamespace>(workload_type, data)?.capacity(),
    };
    Ok(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_container_capacity() {
        let data = json!({
            "flist": "https://hub.example.org/app.flist",
            "cpu": 2,
            "memory_mib": 512,
            "rootfs_mib": 256,
            "network": "net-a",
        });
        let cap = capacity_of(WorkloadType::Container, &data).expect("parse");
        assert_eq!(cap.cru, 2);
        assert_eq!(cap.mru, 512 * MIB);
        assert_eq!(cap.sru, 256 * MIB);
        assert_eq!(cap.hru, 0);
    }

    #[test]
    fn test_volume_capacity_by_disk_kind() {
        let hdd = json!({"size_gib": 10, "kind": "hdd"});
        let ssd = json!({"size_gib": 5, "kind": "ssd"});
        assert_eq!(capacity_of(WorkloadType::Volume, &hdd).unwrap().hru, 10 * GIB);
        assert_eq!(capacity_of(WorkloadType::Volume, &ssd).unwrap().sru, 5 * GIB);
    }

    #[test]
    fn test_network_and_public_ip() {
        let net = json!({"name": "net-a", "subnet": "10.10.1.0/24"});
        assert!(capacity_of(WorkloadType::NetworkResource, &net).unwrap().is_zero());

        let ip = json!({"ip": "185.69.166.12/24", "gateway": "185.69.166.1"});
        assert_eq!(capacity_of(WorkloadType::PublicIp, &ip).unwrap().ipv4u, 1);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let err = capacity_of(WorkloadType::Volume, &json!({"size_gib": "ten"})).unwrap_err();
        assert_eq!(err.workload_type, WorkloadType::Volume);
    }
}
