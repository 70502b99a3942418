//! Abstract error/status handling for the engine.
//!
//! Fallible setup and parse paths return `anyhow::Result`, exactly as the
//! base RPC layer this engine is modeled on does. Separately, the
//! demultiplexer needs a cheap, `Clone`-able outcome it can hand to several
//! independently-resolving receive callbacks (cancellation, authorization
//! denial, transport closed); `StatusCode` is that value.

use std::fmt;

/// The abstract status delivered to demultiplexer callbacks and returned
/// from engine-level operations that are not plain I/O failures.
///
/// This is intentionally smaller than a full RPC-surface status type: it
/// only distinguishes the outcomes this engine itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    /// A stream was cancelled locally or by the peer.
    Cancelled,
    Unknown,
    /// Bad framing, out-of-order sequence, duplicate setup, or similar
    /// protocol violation.
    InvalidArgument,
    /// The writer gave up waiting for flow-control credit.
    DeadlineExceeded,
    /// The security predicate rejected the peer's credential at setup.
    PermissionDenied,
    /// The connection has entered graceful shutdown; pending callbacks
    /// complete with this status.
    Unavailable,
    /// Primitive error or other internal failure.
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Ok => "ok",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::InvalidArgument => "invalid_argument",
            StatusCode::DeadlineExceeded => "deadline_exceeded",
            StatusCode::PermissionDenied => "permission_denied",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A transport-level error returned from fallible engine operations that
/// have a single caller (setup, a single `RpcCall`, a single parcel parse).
///
/// Carries a [`StatusCode`] so callers that need to propagate it into the
/// demultiplexer don't have to downcast an `anyhow::Error`.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub code: StatusCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PermissionDenied, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}
