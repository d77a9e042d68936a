//! Resource-unit accounting types.
//!
//! A [`Capacity`] is the resource footprint of a single workload or the
//! aggregate footprint of a set of workloads: compute units, memory,
//! spinning storage, solid-state storage and public IPv4 addresses.
//! Memory and storage fields are byte counts.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

/// One gibibyte in bytes.
pub const GIB: u64 = 1024 * MIB;

/// Resource units of a node or a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Compute units (virtual cores).
    #[serde(default)]
    pub cru: u64,
    /// Memory in bytes.
    #[serde(default)]
    pub mru: u64,
    /// Spinning (HDD) storage in bytes.
    #[serde(default)]
    pub hru: u64,
    /// Solid-state (SSD) storage in bytes.
    #[serde(default)]
    pub sru: u64,
    /// Public IPv4 addresses.
    #[serde(default)]
    pub ipv4u: u64,
}

impl Capacity {
    /// True when every field is zero.
    pub fn is_zero(&self) -> bool {
        *self == Capacity::default()
    }

    /// Field-wise saturating addition.
    pub fn add(&self, other: &Capacity) -> Capacity {
        Capacity {
            cru: self.cru.saturating_add(other.cru),
            mru: self.mru.saturating_add(other.mru),
            hru: self.hru.saturating_add(other.hru),
            sru: self.sru.saturating_add(other.sru),
            ipv4u: self.ipv4u.saturating_add(other.ipv4u),
        }
    }

    /// Field-wise saturating subtraction, clamping at zero.
    pub fn saturating_sub(&self, other: &Capacity) -> Capacity {
        Capacity {
            cru: self.cru.saturating_sub(other.cru),
            mru: self.mru.saturating_sub(other.mru),
            hru: self.hru.saturating_sub(other.hru),
            sru: self.sru.saturating_sub(other.sru),
            ipv4u: self.ipv4u.saturating_sub(other.ipv4u),
        }
    }

    /// True when every field of `self` is less than or equal to the
    /// corresponding field of `other`.
    pub fn fits_in(&self, other: &Capacity) -> bool {
        self.cru <= other.cru
            && self.mru <= other.mru
            && self.hru <= other.hru
            && self.sru <= other.sru
            && self.ipv4u <= other.ipv4u
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cru={} mru={} hru={} sru={} ipv4u={}",
            self.cru, self.mru, self.hru, self.sru, self.ipv4u
        )
    }
}
