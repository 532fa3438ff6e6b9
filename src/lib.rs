//! mirror_db: Key-value mirror of analytical tables
//!
//! Rows from an analytical source (DataFusion over Arrow / CSV / Parquet / JSON)
//! are hydrated into a sled-backed hash/set store: one hash per row and one set
//! per secondary index value. Queries resolve glob-pattern criteria against the
//! index sets inside atomic store primitives, then fetch, sort and truncate.
//!
//! This lib exposes the hydrator, the query executor and the store adapter.

pub mod error;
pub mod keys;
pub mod models;
pub mod storage;
// Analytical row sources (DataFusion push-down, in-memory)
pub mod source;
pub mod indexing;
pub mod query;
// CLI configuration and tracing setup for the binaries
pub mod config;
pub mod logging;

pub use error::{MirrorError, Result};
pub use indexing::{HydrationReport, HydrationRequest, Hydrator, HydratorConfig};
pub use models::{Filter, Record};
pub use query::{QueryConfig, QueryExecutor};
pub use storage::{KeyValueStore, MemoryStore, SledStore};
