//! Pair shards: deterministic per-(prover, auditor) chunk stores.

pub mod generator;
pub mod layout;
pub mod store;

pub use generator::{
    chunk_bytes, chunk_hash, chunk_text, generate, generate_all, GenerateError, GeneratePlan,
};
pub use layout::{LayoutError, NodeRole};
pub use store::{remove_shard_files, ShardRow, ShardStore, StoreError};
