//! Tensorage - proof-of-storage subnet participant
//!
//! Two cooperating roles share this crate:
//! - **Prover** (miner): holds one deterministic data shard per auditor
//!   and answers `ping` / `retrieve` / `store` over the RPC fabric.
//! - **Auditor** (validator): keeps hash-only replicas of every prover's
//!   shard, continuously challenges provers near their capacity frontier,
//!   and converges a per-prover estimate via additive increase and
//!   sharp decrease before emitting normalized weights.
//!
//! Key principles:
//! - Shard content is a pure function of the (prover, auditor) pair, so
//!   both sides derive identical bytes without exchanging them.
//! - Chunks travel as a frozen text encoding; every hash is taken over
//!   that text, never the raw bytes.
//! - The chain client and the RPC transport are external collaborators;
//!   this crate pins their contracts at the [`directory`] and
//!   [`protocol`] boundaries.

pub mod auditor;
pub mod directory;
pub mod encoding;
pub mod protocol;
pub mod prover;
pub mod shard;
pub mod sharder;
