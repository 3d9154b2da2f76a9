//! # Storage Engine
//!
//! The versioned key space (`versioned_store`), its Merkle index
//! (`merkle`), and its optional on-disk journal (`journal`). Together these
//! implement §4.B: LWW merge on every write, per-key RMW serialization, and
//! durable replay across restarts.
//!
//! `VersionedStore` replaces the plain-string `KvEngine` family with a
//! single engine that understands LWW versions.

pub mod journal;
pub mod merkle;
pub mod versioned_store;

pub use journal::{Journal, JournalRecord};
pub use merkle::MerkleTree;
pub use versioned_store::VersionedStore;
