//! The Reservation data model.
//!
//! A reservation is a durable, signed request to run one workload on this
//! node for a bounded duration. The issuer assigns the id; the owning twin
//! signs the canonical challenge; the node appends a signed result after the
//! first provision attempt.
//!
//! ## Result state transitions
//!
//! ```text
//! (none) ──► unknown ──► ok ─────┐
//!    │          │                ├──► deleted   (terminal)
//!    │          └──► error ──► ok│
//!    └───────────────────────────┘
//! ```
//!
//! Once `to_delete` is set it is never cleared, and a reservation whose
//! result reached `deleted` never changes again.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capacity::Capacity;

/// Issuer-assigned, globally unique reservation identifier.
pub type ReservationId = String;

/// Opaque numeric owner identity, resolved to a public key by the authorizer.
pub type TwinId = u32;

/// Sentinel duration meaning "effectively infinite".
pub const DURATION_FOREVER: u64 = u64::MAX;

/// Maximum length of a reservation id.
pub const MAX_ID_LEN: usize = 128;

/// The closed set of workload kinds this node can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    NetworkResource,
    Volume,
    PublicIp,
    Container,
    VirtualMachine,
    #[serde(rename = "zero_db_namespace")]
    ZdbNamespace,
}

impl WorkloadType {
    /// All recognized workload types.
    pub const ALL: [WorkloadType; 6] = [
        WorkloadType::NetworkResource,
        WorkloadType::Volume,
        WorkloadType::PublicIp,
        WorkloadType::Container,
        WorkloadType::VirtualMachine,
        WorkloadType::ZdbNamespace,
    ];

    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::NetworkResource => "network_resource",
            WorkloadType::Volume => "volume",
            WorkloadType::PublicIp => "public_ip",
            WorkloadType::Container => "container",
            WorkloadType::VirtualMachine => "virtual_machine",
            WorkloadType::ZdbNamespace => "zero_db_namespace",
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized workload type names.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown workload type: {0}")]
pub struct UnknownWorkloadType(pub String);

impl FromStr for WorkloadType {
    type Err = UnknownWorkloadType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network_resource" => Ok(WorkloadType::NetworkResource),
            "volume" => Ok(WorkloadType::Volume),
            "public_ip" => Ok(WorkloadType::PublicIp),
            "container" => Ok(WorkloadType::Container),
            "virtual_machine" => Ok(WorkloadType::VirtualMachine),
            "zero_db_namespace" => Ok(WorkloadType::ZdbNamespace),
            other => Err(UnknownWorkloadType(other.to_string())),
        }
    }
}

/// State of a reservation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Unknown,
    Ok,
    Error,
    Deleted,
}

impl ResultState {
    /// Whether a stored result in state `self` may be replaced by `next`.
    ///
    /// `deleted` is terminal. `ok` can only move to `deleted` (decommission
    /// is a one-way door); `unknown` and `error` can move anywhere.
    pub fn can_transition_to(self, next: ResultState) -> bool {
        match self {
            ResultState::Deleted => false,
            ResultState::Ok => matches!(next, ResultState::Ok | ResultState::Deleted),
            ResultState::Unknown | ResultState::Error => true,
        }
    }
}

impl fmt::Display for ResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultState::Unknown => "unknown",
            ResultState::Ok => "ok",
            ResultState::Error => "error",
            ResultState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Outcome of the latest provision or decommission attempt.
///
/// `data` is opaque to the engine and forwarded to observers verbatim.
/// `signature` is the node's signature over [`ReservationResult::challenge`],
/// so external observers can attribute results to this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationResult {
    pub state: ResultState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created_at: u64,
    #[serde(default)]
    pub signature: String,
}

impl ReservationResult {
    /// Build an unsigned result stamped with the given time.
    pub fn new(state: ResultState, message: impl Into<String>, data: serde_json::Value, now: u64) -> Self {
        ReservationResult {
            state,
            message: message.into(),
            data,
            created_at: now,
            signature: String::new(),
        }
    }

    /// Canonical byte string the node signs: everything except the signature.
    pub fn challenge(&self, id: &str) -> Vec<u8> {
        let data = serde_json::to_string(&self.data).unwrap_or_default();
        format!(
            "{}\n{}\n{}\n{}\n{}",
            id, self.state, self.message, self.created_at, data
        )
        .into_bytes()
    }
}

/// A durable, signed request to run one workload on this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    /// Issuer-assigned unique id.
    pub id: ReservationId,
    /// Owning twin; signature verifies under this twin's key.
    pub twin_id: TwinId,
    /// Workload kind; selects the primitive backend and the payload schema.
    #[serde(rename = "type")]
    pub workload_type: WorkloadType,
    /// Opaque payload, interpreted only by the backend (and for capacity
    /// derivation at admission).
    #[serde(default)]
    pub data: serde_json::Value,
    /// Unix seconds, set by the issuer at creation.
    pub created_at: u64,
    /// Lifetime in seconds from `created_at`; [`DURATION_FOREVER`] never expires.
    pub duration_secs: u64,
    /// Hex ed25519 signature over [`Reservation::challenge`].
    #[serde(default)]
    pub signature: String,
    /// Deletion intent; once true it is never cleared.
    #[serde(default)]
    pub to_delete: bool,
    /// Set after the first provision attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ReservationResult>,
}

impl Reservation {
    /// Expiry timestamp, `None` for the forever sentinel.
    pub fn expires_at(&self) -> Option<u64> {
        if self.duration_secs == DURATION_FOREVER {
            return None;
        }
        Some(self.created_at.saturating_add(self.duration_secs))
    }

    /// Whether the reservation has expired at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        match self.expires_at() {
            Some(at) => at <= now,
            None => false,
        }
    }

    /// Canonical byte string the owning twin signs: every field except
    /// `signature`, `to_delete` and `result`.
    pub fn challenge(&self) -> Vec<u8> {
        let data = serde_json::to_string(&self.data).unwrap_or_default();
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.id, self.twin_id, self.workload_type, self.created_at, self.duration_secs, data
        )
        .into_bytes()
    }

    /// Canonical byte string a caller signs to request deletion of `id`.
    pub fn delete_challenge(id: &str, twin_id: TwinId) -> Vec<u8> {
        format!("delete\n{}\n{}", id, twin_id).into_bytes()
    }

    /// Resource footprint derived from the payload.
    pub fn capacity(&self) -> Result<Capacity, crate::payload::PayloadError> {
        crate::payload::capacity_of(self.workload_type, &self.data)
    }

    /// State of the stored result, if any.
    pub fn result_state(&self) -> Option<ResultState> {
        self.result.as_ref().map(|r| r.state)
    }
}

/// Whether `id` is acceptable as a reservation id.
///
/// Ids become file names in the store, so they are restricted to a
/// path-safe alphabet and must not start with a dot.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.starts_with('.')
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}
