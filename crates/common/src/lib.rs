//! # Weft Common Crate
//!
//! Shared types for the weft per-node provisioning engine.
//!
//! ## Modules
//! - `reservation`: the Reservation data model and its signing challenges
//! - `capacity`: resource-unit accounting types
//! - `payload`: typed workload payloads and capacity derivation
//! - `crypto`: sha3 digests and ed25519 helpers
//! - `config`: TOML configuration loader
//! - `time`: unix-time helpers

pub mod capacity;
pub mod config;
pub mod crypto;
pub mod payload;
pub mod reservation;
pub mod time;

pub use capacity::{Capacity, GIB, MIB};
pub use config::Config;
pub use payload::{capacity_of, PayloadError};
pub use reservation::{
    is_valid_id, Reservation, ReservationId, ReservationResult, ResultState, TwinId,
    WorkloadType, DURATION_FOREVER,
};
