//! # Error Taxonomy
//!
//! This module defines the stable error kinds every public operation in the
//! crate surfaces. Callers match on `Error` variants rather than parsing
//! strings; each variant carries a stable numeric `code()` suitable for the
//! `ResponseEnvelope.code` field on the wire (see the command/response
//! payloads).
//!
//! Locally recoverable failures (storage I/O, a transient MQTT publish) are
//! retried with capped backoff inside the owning component and never reach
//! the caller as `Storage`/`Connection` unless retries are exhausted.

use thiserror::Error;

/// The stable error taxonomy returned by public crate operations.
///
/// No variant leaks a `Debug`-formatted source error to the wire: the
/// `Display` impl (derived via `#[error(...)]`) is the only thing that ever
/// reaches a `ResponseEnvelope.error` string. Full context (chained causes)
/// is logged via `log::error!`, not returned to callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input. Local failure, never retried.
    #[error("validation failed for {field}: {reason} (value={value:?})")]
    Validation {
        field: &'static str,
        value: String,
        reason: String,
    },

    /// A key, value, command, or replication payload exceeded its size cap.
    #[error("payload too large: {actual} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { actual: usize, limit: usize },

    /// INCR/DECR over/underflowed signed 64-bit range.
    #[error("range overflow on key '{key}'")]
    RangeOverflow { key: String },

    /// A numeric or string op was attempted on a value of the wrong shape.
    #[error("invalid type for key '{key}': expected {expected}")]
    InvalidType { key: String, expected: &'static str },

    /// No response within the operation's budget. Idempotent retry is safe.
    #[error("timeout waiting for {op} after {ms}ms")]
    Timeout { op: &'static str, ms: u64 },

    /// Not connected, or connection lost mid-operation. Retryable, and
    /// bufferable via the offline queue when enabled.
    #[error("connection error: {state}")]
    Connection { state: String },

    /// Client-side ACL denied the action. Non-retryable without a config
    /// change. `code` is one of the 300-302 authorization codes in §7.
    #[error("authorization denied: {action}")]
    Authorization { action: String, code: u16 },

    /// TLS handshake/certificate validation failure, broken out by kind so
    /// callers can distinguish expired vs. misconfigured certificates.
    #[error("tls error: {kind}")]
    Tls { kind: TlsErrorKind },

    /// I/O error on the journal or offline-queue store. The in-memory state
    /// remains authoritative; this is a degraded-mode warning, not a crash.
    #[error("storage error: {0}")]
    Storage(String),

    /// An internal invariant was violated. Logged with full context
    /// upstream; this variant's message is intentionally non-leaky.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Distinguished TLS failure kinds, per §4.D.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsErrorKind {
    Expired,
    ChainInvalid,
    HostnameMismatch,
    SanMismatch,
    VersionTooOld,
}

impl std::fmt::Display for TlsErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TlsErrorKind::Expired => "expired",
            TlsErrorKind::ChainInvalid => "chain invalid",
            TlsErrorKind::HostnameMismatch => "hostname mismatch",
            TlsErrorKind::SanMismatch => "SAN mismatch",
            TlsErrorKind::VersionTooOld => "TLS version too old",
        };
        f.write_str(s)
    }
}

impl Error {
    /// The stable numeric code for this error, as listed in §7.
    pub fn code(&self) -> u16 {
        match self {
            Error::Validation { .. } => 100,
            Error::PayloadTooLarge { .. } => 101,
            Error::RangeOverflow { .. } => 102,
            Error::InvalidType { .. } => 103,
            Error::Timeout { .. } => 200,
            Error::Connection { .. } => 201,
            Error::Authorization { code, .. } => *code,
            Error::Tls { .. } => 201,
            Error::Storage(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Whether a caller may safely retry the same logical operation
    /// (with the same idempotency id) after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Connection { .. } | Error::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_spec_table() {
        assert_eq!(
            Error::Validation {
                field: "key",
                value: "".into(),
                reason: "empty".into()
            }
            .code(),
            100
        );
        assert_eq!(
            Error::PayloadTooLarge {
                actual: 1,
                limit: 0
            }
            .code(),
            101
        );
        assert_eq!(Error::RangeOverflow { key: "k".into() }.code(), 102);
        assert_eq!(
            Error::InvalidType {
                key: "k".into(),
                expected: "int"
            }
            .code(),
            103
        );
        assert_eq!(Error::Timeout { op: "GET", ms: 10 }.code(), 200);
        assert_eq!(
            Error::Connection {
                state: "disconnected".into()
            }
            .code(),
            201
        );
        assert_eq!(
            Error::Authorization {
                action: "publish".into(),
                code: 300
            }
            .code(),
            300
        );
    }

    #[test]
    fn retryability_matches_taxonomy() {
        assert!(Error::Timeout { op: "GET", ms: 1 }.is_retryable());
        assert!(Error::Connection {
            state: "x".into()
        }
        .is_retryable());
        assert!(Error::Storage("disk full".into()).is_retryable());
        assert!(!Error::Validation {
            field: "key",
            value: "".into(),
            reason: "empty".into()
        }
        .is_retryable());
        assert!(!Error::Authorization {
            action: "x".into(),
            code: 300
        }
        .is_retryable());
    }
}
