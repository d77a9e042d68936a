//! # Weft Node Crate
//!
//! The `weftd` daemon: wires the reservation store, capacity ledger, twin
//! registry, primitive backends and the engine together, and hosts the
//! admission API over HTTP.

pub mod api;
pub mod cli;
pub mod identity;
pub mod primitives;

pub use api::{build_router, ApiState};
pub use identity::NodeIdentity;
pub use primitives::{mock_registry, MockPrimitive};
