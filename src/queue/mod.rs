//! # Offline Queue (§4.I)
//!
//! Buffers user commands issued while the broker connection isn't
//! `Connected`, for replay once it is.

pub mod offline_queue;

pub use offline_queue::{OfflineQueue, QueueStats};
