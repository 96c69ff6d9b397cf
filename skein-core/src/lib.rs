//! skein-core — a durable, distributed workflow engine.
//!
//! User-authored graphs are decomposed at runtime into a DAG of persisted
//! activities that survive process crashes, message replays, and arbitrary
//! restarts. Exactly-once semantics rest on three coupled subsystems: the
//! collation ledgers (two monotonic 15-digit integers per invocation), the
//! two-leg activity protocol, and the per-job semaphore with edge-capture
//! snapshots.
//!
//! The engine operates exclusively through the [`store::JobStore`]
//! contract; [`store_memory::MemoryStore`] serves tests and single-process
//! use, and `store_postgres::PostgresStore` (behind the `postgres` feature)
//! serves production.

pub mod activity;
pub mod collator;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod ledger;
pub mod router;
pub mod state;
pub mod store;
pub mod store_memory;
#[cfg(feature = "postgres")]
pub mod store_postgres;
pub mod types;

pub use engine::Engine;
pub use error::{CollationFault, EngineError, EngineResult};
pub use graph::{ActivityKind, CompiledGraph, GraphManifest};
pub use router::{RouterConfig, StreamRouter};
pub use store::JobStore;
pub use store_memory::MemoryStore;
pub use types::{DimensionalAddress, Job, JobState, JobStatus, StartOptions, TransitionMessage};
