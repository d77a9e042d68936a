//! # Weft Store Crate
//!
//! Durable persistence of reservations and their results. The [`Store`]
//! trait is the only interface the engine uses; [`FsStore`] is the
//! file-backed implementation.
//!
//! ## Durability contract
//!
//! - `add` and `set_result` are durable (fsync) before they return
//! - an interrupted write never corrupts an existing record and never
//!   produces a partial record that appears valid on reload

pub mod fsstore;
pub mod store;

pub use fsstore::FsStore;
pub use store::{Store, StoreError};
