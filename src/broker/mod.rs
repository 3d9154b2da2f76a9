//! # Broker Client & Topic Router (§4.D/§4.E)
//!
//! `client` owns the MQTT session: connect/reconnect state machine, LWT,
//! QoS=1 publish queue, and the raw inbound-message/connection-state
//! broadcasts. `router` sits on top of it: canonical topic scheme,
//! wildcard-filtered dispatch, per-client ACL, and deterministic
//! subscription restoration after reconnect.

pub mod backoff;
pub mod client;
pub mod router;
pub mod topic;

pub use backoff::Backoff;
pub use client::{BrokerClient, ConnectionState, InboundMessage};
pub use router::{AclDecision, Router};
