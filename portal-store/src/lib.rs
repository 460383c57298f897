//! Content-addressed storage for Portal networks: a durable hex-keyed KV
//! store, the Merkle-proof validators that gate ingestion, and the
//! radius-governed eviction policy.

pub mod accumulator;
pub mod error;
pub mod execution;
pub mod kv;
pub mod proof;
pub mod store;
pub mod trie;

pub use accumulator::{EpochAccumulator, HeaderRecord, HistoricalRoots, MasterAccumulator};
pub use error::StoreError;
pub use kv::{KvStore, MemoryKv, SqliteKv};
pub use store::{BeaconVerifier, ContentStore, PutOutcome, StoreConfig, StoreEvent};
