//! # Replication Pipeline (§4.H)
//!
//! Three cooperating pieces: `outbox` (publish side, one event per local
//! mutation), `applier` (inbound side, LWW merge with the three rejection
//! checks), and `anti_entropy` (the periodic Merkle-root reconciliation
//! sketch spec.md asks for alongside the event-driven path).

pub mod anti_entropy;
pub mod applier;
pub mod outbox;

pub use anti_entropy::AntiEntropy;
pub use applier::{Applier, RejectReason};
pub use outbox::Outbox;
