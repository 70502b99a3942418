//! Per-stream state: the half-close lifecycle a single transaction code
//! moves through, plus the per-connection table keyed by transaction code.
//!
//! The state machine and ref-counted handle are modeled on
//! `grpc_binder_stream` and its `grpc_binder_stream_ref`/`_unref` helpers:
//! there, a stream is a plain struct reached through a raw pointer kept
//! alive by manual reference counting. Here an `Arc` plays that role, so a
//! handle can be cloned into a demultiplexer callback or a combiner task
//! without the caller tracking a matching release by hand.

use std::sync::Arc;

use crate::transaction::{Role, StreamId};

/// Where a stream sits in its half-close lifecycle.
///
/// A stream starts `Open`. Sending (for a client) or receiving (for a
/// server) a Suffix moves the local side to half-closed; the same happens
/// independently to the remote side on the peer's Suffix. Once both sides
/// are half-closed, or the stream is cancelled, it is `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Applies the local side sending its Suffix.
    pub fn close_local(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    /// Applies the remote side's Suffix having been received.
    pub fn close_remote(self) -> Self {
        match self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        }
    }

    pub fn is_closed(self) -> bool {
        self == StreamState::Closed
    }
}

struct Inner {
    id: StreamId,
    role: Role,
    state: std::sync::Mutex<StreamState>,
}

/// A ref-counted handle to one stream's state.
///
/// Cloning is cheap and every clone observes the same underlying state;
/// the stream is torn down when the last handle (held by the connection's
/// stream table, the demultiplexer, and any in-flight combiner task) drops.
#[derive(Clone)]
pub struct StreamHandle(Arc<Inner>);

impl StreamHandle {
    pub fn new(id: StreamId, role: Role) -> Self {
        Self(Arc::new(Inner { id, role, state: std::sync::Mutex::new(StreamState::Open) }))
    }

    pub fn id(&self) -> StreamId {
        self.0.id
    }

    pub fn role(&self) -> Role {
        self.0.role
    }

    pub fn state(&self) -> StreamState {
        *self.0.state.lock().expect("stream state mutex poisoned")
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    pub fn mark_closed_local(&self) -> StreamState {
        let mut s = self.0.state.lock().expect("stream state mutex poisoned");
        *s = s.close_local();
        *s
    }

    pub fn mark_closed_remote(&self) -> StreamState {
        let mut s = self.0.state.lock().expect("stream state mutex poisoned");
        *s = s.close_remote();
        *s
    }

    /// Forces the stream straight to `Closed`, e.g. on cancellation or
    /// transport teardown.
    pub fn force_close(&self) {
        *self.0.state.lock().expect("stream state mutex poisoned") = StreamState::Closed;
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("id", &self.id())
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}

/// The set of streams currently registered on one connection, keyed by
/// transaction code. Mirrors `grpc_binder_transport::registered_stream`
/// (an `absl::flat_hash_map<int, grpc_binder_stream*>`) with a
/// `std::sync::Mutex` in place of the combiner-only access the original
/// relies on, since this crate's stream table is reached from both the
/// combiner task and whichever task owns the next outbound call id.
#[derive(Default)]
pub struct StreamTable {
    streams: std::sync::Mutex<std::collections::HashMap<StreamId, StreamHandle>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new stream. Panics if `id` is already registered: a
    /// transaction code collision on a single connection is a programming
    /// error in the id allocator, not a recoverable condition.
    pub fn insert(&self, handle: StreamHandle) {
        let mut streams = self.streams.lock().expect("stream table mutex poisoned");
        let prev = streams.insert(handle.id(), handle);
        assert!(prev.is_none(), "transaction code reused while still registered");
    }

    pub fn get(&self, id: StreamId) -> Option<StreamHandle> {
        self.streams.lock().expect("stream table mutex poisoned").get(&id).cloned()
    }

    pub fn remove(&self, id: StreamId) -> Option<StreamHandle> {
        self.streams.lock().expect("stream table mutex poisoned").remove(&id)
    }

    /// Forces every registered stream closed and empties the table, used
    /// when the connection itself is torn down.
    pub fn close_all(&self) {
        let mut streams = self.streams.lock().expect("stream table mutex poisoned");
        for (_, handle) in streams.drain() {
            handle.force_close();
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().expect("stream table mutex poisoned").len()
    }

    /// Snapshot of every currently-registered stream id, used by transport
    /// teardown to cancel each one's pending demultiplexer registrations
    /// before dropping the table.
    pub fn ids(&self) -> Vec<StreamId> {
        self.streams.lock().expect("stream table mutex poisoned").keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
