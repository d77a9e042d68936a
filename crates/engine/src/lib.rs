//! # Weft Engine Crate
//!
//! The reconciling provisioning engine of a weft node: admission of signed
//! reservations, capacity accounting, the provision/decommission lifecycle
//! with crash recovery, and expiry.
//!
//! ## Components
//!
//! - [`statistics`]: the capacity ledger gating admission
//! - [`auth`]: twin/admin resolution and signature verification
//! - [`primitives`]: the backend trait and type dispatch registry
//! - [`engine`]: the event loop, workers and startup replay
//! - [`janitor`]: expiry detection
//! - [`events`]: the observability event stream
//!
//! The wrapper daemon instantiates a [`weft_store::Store`], a
//! [`statistics::Statistics`] ledger, the registries, and drives
//! [`engine::Engine::run`] on the runtime.

pub mod auth;
pub mod backoff;
pub mod engine;
pub mod events;
pub mod janitor;
pub mod primitives;
pub mod statistics;

pub use auth::{AdminRegistry, AuthError, StaticTwins, TwinRegistry};
pub use backoff::Backoff;
pub use engine::{
    Admitted, CreateError, DeleteError, Engine, EngineConfig, EngineError, EngineHandle,
    ResultSigner,
};
pub use events::{DeleteCause, EngineEvent, EventBus};
pub use primitives::{Deadlines, OpCtx, Primitive, PrimitiveError, Provisioned, Registry};
pub use statistics::{Counters, InsufficientCapacity, Statistics};
