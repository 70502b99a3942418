//! The transport adapter: translates stream op batches (send/recv initial
//! metadata, message, trailing metadata, cancel) from the RPC surface above
//! into [`Transaction`] sends on the wire writer and registrations on the
//! demultiplexer.
//!
//! Grounded on `binder_transport.cc`'s `perform_stream_op_locked`: building
//! a `Transaction` from whichever `send_*` parts are present, calling
//! `RpcCall` once if any are, and registering `recv_*` parts against the
//! stream receiver follows that function's shape part for part.
//! `cancel_stream_locked`'s "server sends a status-1 suffix to inform the
//! peer, then tears down locally" is `cancel_stream` below; `close_transport`
//! generalizes it to every registered stream, matching `close_transport_locked`.
//!
//! A server's `recv_trailing_metadata` additionally carries
//! `need_to_call_trailing_metadata_callback`'s gate: if the client's
//! trailing metadata arrives before the server has sent its own, the
//! completion is held back (`DeferredTrailing` below) until the server's
//! next `send_trailing_metadata`, matching the original's ordering
//! guarantee for its surface.
//!
//! `perform_transport_op_locked`'s connectivity watchers, accept-stream
//! callback installation, and goaway/disconnect handling are
//! `connectivity_state`, `set_accept_stream_callback`/`accept_stream`, and
//! `perform_transport_op` below.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::{oneshot, watch};

use crate::config::EngineConfig;
use crate::demux::{Demux, InitialMetadataOutcome, MessageOutcome, RegisterOutcome};
use crate::error::StatusCode;
use crate::stream::{StreamHandle, StreamTable};
use crate::transaction::{Metadata, Role, StreamId, Transaction};
use crate::writer::WireWriter;

/// Coarse connectivity state a connection moves through, watched via
/// [`TransportAdapter::connectivity_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Ready,
    /// `goaway` or `disconnect_with_error` was issued; the transport is
    /// tearing down.
    Shutdown,
}

/// An operation on the transport as a whole, as opposed to one stream.
pub enum TransportOp {
    /// Both a peer-initiated goaway and a local disconnect-with-error react
    /// the same way: cancel every stream and stop accepting new ones.
    GoAway(StatusCode),
    DisconnectWithError(StatusCode),
}

type AcceptStreamCallback = Arc<dyn Fn(StreamHandle) + Send + Sync>;

type TrailingResult = Result<(Metadata, u16, Option<String>), StatusCode>;

/// Held-back state for one stream's server-side `recv_trailing_metadata`.
/// `pending_value` is set once the peer's trailing metadata has actually
/// arrived; it is only handed to `waiter` once `trailing_sent` is true.
#[derive(Default)]
struct DeferredTrailing {
    trailing_sent: bool,
    pending_value: Option<TrailingResult>,
    waiter: Option<oneshot::Sender<TrailingResult>>,
}

impl DeferredTrailing {
    /// Releases the pending value to the waiter if both are present.
    fn release_if_ready(&mut self) {
        if self.trailing_sent {
            if let (Some(value), Some(tx)) = (self.pending_value.take(), self.waiter.take()) {
                let _ = tx.send(value);
            }
        }
    }
}

/// The numeric status the original carries in a server-initiated
/// cancellation suffix; corresponds to gRPC's `CANCELLED` status code.
const CANCEL_STATUS: u16 = 1;

pub type InitialMetadataFuture = BoxFuture<'static, InitialMetadataOutcome>;
pub type MessageFuture = BoxFuture<'static, MessageOutcome>;
pub type TrailingMetadataFuture =
    BoxFuture<'static, Result<(Metadata, u16, Option<String>), StatusCode>>;

fn resolve<T: Send + 'static>(outcome: RegisterOutcome<T>) -> BoxFuture<'static, T> {
    match outcome {
        RegisterOutcome::Ready(v) => Box::pin(async move { v }),
        RegisterOutcome::Wait(rx) => {
            Box::pin(async move { rx.await.expect("demultiplexer slot dropped without resolving") })
        }
    }
}

/// One op batch: every part is independently optional, exactly as the
/// RPC-surface batch this is modeled on allows any subset to be set.
#[derive(Default)]
pub struct StreamOpBatch {
    pub send_initial_metadata: Option<(Option<String>, Metadata)>,
    pub send_message: Option<Vec<u8>>,
    pub send_trailing_metadata: Option<(Metadata, u16, Option<String>)>,
    pub recv_initial_metadata: bool,
    pub recv_message: bool,
    pub recv_trailing_metadata: bool,
    /// Mutually exclusive with every other field: a batch either cancels or
    /// carries ordinary send/recv parts, never both.
    pub cancel: Option<StatusCode>,
}

/// The futures an op batch's `recv_*` parts produce, present only for the
/// parts that were requested.
#[derive(Default)]
pub struct StreamOpOutcome {
    pub initial_metadata: Option<InitialMetadataFuture>,
    pub message: Option<MessageFuture>,
    pub trailing_metadata: Option<TrailingMetadataFuture>,
}

/// Ties together the wire writer, demultiplexer, and stream table for one
/// connection, presenting the batch-oriented surface an RPC layer expects.
pub struct TransportAdapter {
    role: Role,
    config: EngineConfig,
    writer: Arc<WireWriter>,
    demux: Arc<Demux>,
    streams: Arc<StreamTable>,
    deferred_trailing: Arc<Mutex<HashMap<StreamId, DeferredTrailing>>>,
    next_id: AtomicU32,
    connectivity: watch::Sender<ConnectivityState>,
    accept_stream_callback: Mutex<Option<AcceptStreamCallback>>,
}

impl TransportAdapter {
    pub fn new(
        role: Role,
        config: EngineConfig,
        writer: Arc<WireWriter>,
        demux: Arc<Demux>,
        streams: Arc<StreamTable>,
    ) -> Self {
        let next_id = AtomicU32::new(config.first_call_id);
        let (connectivity, _) = watch::channel(ConnectivityState::Ready);
        Self {
            role,
            config,
            writer,
            demux,
            streams,
            deferred_trailing: Arc::new(Mutex::new(HashMap::new())),
            next_id,
            connectivity,
            accept_stream_callback: Mutex::new(None),
        }
    }

    /// Subscribes to connectivity-state changes. Unsubscribing is simply
    /// dropping the returned receiver; there is no separate call for it.
    pub fn connectivity_state(&self) -> watch::Receiver<ConnectivityState> {
        self.connectivity.subscribe()
    }

    /// Installs the callback invoked the first time a peer-initiated stream
    /// id is observed (see [`Self::accept_stream`]). Replaces any
    /// previously installed callback.
    pub fn set_accept_stream_callback(&self, callback: AcceptStreamCallback) {
        *self.accept_stream_callback.lock().unwrap() = Some(callback);
    }

    /// Registers a stream under an id the peer chose, if not already
    /// present, and fires the accept-stream callback for a genuinely new
    /// one. Called by the connection when the reader observes the first
    /// frame for an unrecognized stream id.
    pub fn accept_stream(&self, id: StreamId) -> StreamHandle {
        if let Some(existing) = self.streams.get(id) {
            return existing;
        }
        let handle = StreamHandle::new(id, self.role);
        self.streams.insert(handle.clone());
        if let Some(callback) = self.accept_stream_callback.lock().unwrap().as_ref() {
            callback(handle.clone());
        }
        handle
    }

    /// Connectivity-state-affecting operations: a peer `GOAWAY` and a local
    /// disconnect-with-error both cancel every stream and mark the
    /// connection shut down, matching `perform_transport_op_locked`.
    pub fn perform_transport_op(&self, op: TransportOp) {
        let reason = match op {
            TransportOp::GoAway(reason) => reason,
            TransportOp::DisconnectWithError(reason) => reason,
        };
        self.close_transport(reason);
        let _ = self.connectivity.send(ConnectivityState::Shutdown);
    }

    /// Allocates the next stream id off this connection's counter and
    /// registers it. Once the counter runs past the configured ceiling, the
    /// new stream is handed back already force-closed with an unavailable
    /// reason: every send on it is skipped and every recv resolves with that
    /// reason immediately, exactly as for any other closed stream.
    pub fn init_stream(&self) -> StreamHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = StreamHandle::new(id, self.role);
        self.streams.insert(handle.clone());
        if id > self.config.max_call_id {
            handle.force_close();
            self.demux.cancel_stream(id, StatusCode::Unavailable);
        }
        handle
    }

    pub fn get_stream(&self, id: StreamId) -> Option<StreamHandle> {
        self.streams.get(id)
    }

    /// Runs one op batch against `stream`. A cancelling batch carries no
    /// other parts. Otherwise: a closed stream skips every send part (its
    /// bytes would never be delivered) but still registers every requested
    /// recv part, which resolves immediately from the terminal cancellation
    /// value the demultiplexer already holds for it.
    pub fn perform_stream_op(&self, stream: &StreamHandle, op: StreamOpBatch) -> Result<StreamOpOutcome> {
        if let Some(reason) = op.cancel {
            self.cancel_stream(stream, reason)?;
            return Ok(StreamOpOutcome::default());
        }

        if !stream.is_closed() {
            let has_send = op.send_initial_metadata.is_some()
                || op.send_message.is_some()
                || op.send_trailing_metadata.is_some();
            if has_send {
                let mut tx = Transaction::new(stream.id(), self.role);
                if let Some((method_ref, metadata)) = op.send_initial_metadata {
                    tx.set_prefix(method_ref, metadata);
                }
                if let Some(data) = op.send_message {
                    tx.set_message_data(data);
                }
                let sends_trailing = op.send_trailing_metadata.is_some();
                if let Some((metadata, status, status_description)) = op.send_trailing_metadata {
                    tx.set_suffix(metadata, status, status_description);
                }
                self.writer.rpc_call(&tx)?;
                if sends_trailing {
                    stream.mark_closed_local();
                    if self.role == Role::Server {
                        let mut deferred = self.deferred_trailing.lock().unwrap();
                        let entry = deferred.entry(stream.id()).or_default();
                        entry.trailing_sent = true;
                        entry.release_if_ready();
                    }
                }
            }
        }

        let mut outcome = StreamOpOutcome::default();
        if op.recv_initial_metadata {
            outcome.initial_metadata =
                Some(resolve(self.demux.register_recv_initial_metadata(stream.id())));
        }
        if op.recv_message {
            outcome.message = Some(resolve(self.demux.register_recv_message(stream.id())));
        }
        if op.recv_trailing_metadata {
            outcome.trailing_metadata = Some(if self.role == Role::Server {
                self.register_deferred_trailing(stream.id())
            } else {
                resolve(self.demux.register_recv_trailing_metadata(stream.id()))
            });
        }
        Ok(outcome)
    }

    /// Registers a server's `recv_trailing_metadata`, gated on the server
    /// having sent its own trailing metadata first. The raw demux value is
    /// captured as soon as it arrives regardless; it is only forwarded to
    /// the caller once `trailing_sent` is set by a matching send.
    fn register_deferred_trailing(&self, id: StreamId) -> TrailingMetadataFuture {
        let (tx, rx) = oneshot::channel();
        {
            let mut deferred = self.deferred_trailing.lock().unwrap();
            let entry = deferred.entry(id).or_default();
            assert!(entry.waiter.is_none(), "duplicate recv_trailing_metadata registration");
            entry.waiter = Some(tx);
            entry.release_if_ready();
        }

        let raw = resolve(self.demux.register_recv_trailing_metadata(id));
        let deferred_trailing = self.deferred_trailing.clone();
        tokio::spawn(async move {
            let value = raw.await;
            let mut deferred = deferred_trailing.lock().unwrap();
            let entry = deferred.entry(id).or_default();
            entry.pending_value = Some(value);
            entry.release_if_ready();
        });

        Box::pin(async move { rx.await.unwrap_or(Err(StatusCode::Unavailable)) })
    }

    /// Cancels one stream: a server additionally sends a suffix carrying a
    /// cancellation status so the peer learns about it, then the stream is
    /// force-closed locally and its demultiplexer state resolved with
    /// `reason` and dropped from the table.
    fn cancel_stream(&self, stream: &StreamHandle, reason: StatusCode) -> Result<()> {
        if !stream.is_closed() {
            if self.role == Role::Server {
                let mut tx = Transaction::new(stream.id(), Role::Server);
                tx.set_suffix(Metadata::new(), CANCEL_STATUS, None);
                self.writer.rpc_call(&tx)?;
            }
            stream.force_close();
        }
        self.demux.cancel_stream(stream.id(), reason);
        self.streams.remove(stream.id());
        self.deferred_trailing.lock().unwrap().remove(&stream.id());
        Ok(())
    }

    /// Tears down one stream without notifying the peer, e.g. once its
    /// surface-side call object is dropped.
    pub fn destroy_stream(&self, stream: &StreamHandle) {
        if !stream.is_closed() {
            self.demux.cancel_stream(stream.id(), StatusCode::Unavailable);
            stream.force_close();
        }
        self.streams.remove(stream.id());
        self.demux.forget_stream(stream.id());
        self.deferred_trailing.lock().unwrap().remove(&stream.id());
    }

    /// Cancels every stream still registered, e.g. on connection teardown.
    pub fn close_transport(&self, reason: StatusCode) {
        for id in self.streams.ids() {
            self.demux.cancel_stream(id, reason);
        }
        self.streams.close_all();
        self.deferred_trailing.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::primitive::{Endpoint, EndpointHandle};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct RecordingEndpoint {
        calls: Mutex<Vec<u32>>,
    }

    impl Endpoint for RecordingEndpoint {
        fn transact(&self, code: u32, _parcel: crate::codec::Parcel) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(code);
            Ok(())
        }
    }

    fn adapter_with(role: Role) -> (TransportAdapter, Arc<Demux>, Arc<RecordingEndpoint>) {
        adapter_with_config(role, EngineConfig::default())
    }

    fn adapter_with_config(
        role: Role,
        config: EngineConfig,
    ) -> (TransportAdapter, Arc<Demux>, Arc<RecordingEndpoint>) {
        let recorder = Arc::new(RecordingEndpoint::default());
        let endpoint = EndpointHandle::new(recorder.clone());
        let writer = Arc::new(WireWriter::new(endpoint, config));
        let demux = Arc::new(Demux::new());
        let streams = Arc::new(StreamTable::new());
        (TransportAdapter::new(role, config, writer, demux.clone(), streams), demux, recorder)
    }

    #[tokio::test]
    async fn unary_client_send_then_recv_round_trip() {
        let (adapter, demux, recorder) = adapter_with(Role::Client);
        let stream = adapter.init_stream();

        let outcome = adapter
            .perform_stream_op(
                &stream,
                StreamOpBatch {
                    send_initial_metadata: Some((Some("Echo".to_string()), Metadata::new())),
                    send_message: Some(b"hi".to_vec()),
                    recv_initial_metadata: true,
                    recv_message: true,
                    recv_trailing_metadata: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);

        demux.notify_recv_initial_metadata(1024, Ok((None, Metadata::new())));
        demux.notify_recv_message(1024, b"hi back".to_vec());
        demux.notify_recv_trailing_metadata(1024, Metadata::new(), 0, None);

        assert!(outcome.initial_metadata.unwrap().await.is_ok());
        match outcome.message.unwrap().await {
            MessageOutcome::Data(d) => assert_eq!(d, b"hi back"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(outcome.trailing_metadata.unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn cancel_from_server_sends_suffix_and_closes() {
        let (adapter, _demux, recorder) = adapter_with(Role::Server);
        let stream = adapter.init_stream();
        adapter
            .perform_stream_op(&stream, StreamOpBatch { cancel: Some(StatusCode::Cancelled), ..Default::default() })
            .unwrap();
        assert_eq!(recorder.calls.lock().unwrap().len(), 1);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn cancel_from_client_does_not_notify_peer() {
        let (adapter, _demux, recorder) = adapter_with(Role::Client);
        let stream = adapter.init_stream();
        adapter
            .perform_stream_op(&stream, StreamOpBatch { cancel: Some(StatusCode::Cancelled), ..Default::default() })
            .unwrap();
        assert!(recorder.calls.lock().unwrap().is_empty());
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn ops_on_an_already_closed_stream_resolve_from_the_cancellation() {
        let (adapter, _demux, _recorder) = adapter_with(Role::Client);
        let stream = adapter.init_stream();
        adapter
            .perform_stream_op(&stream, StreamOpBatch { cancel: Some(StatusCode::Unavailable), ..Default::default() })
            .unwrap();

        // Stream was removed from the table by cancellation; a caller
        // holding the handle can still issue ops against it directly.
        let outcome = adapter
            .perform_stream_op(
                &stream,
                StreamOpBatch {
                    send_message: Some(b"too late".to_vec()),
                    recv_message: true,
                    ..Default::default()
                },
            )
            .unwrap();
        match outcome.message.unwrap().await {
            MessageOutcome::Cancelled(StatusCode::Unavailable) => {}
            other => panic!("expected cached cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn destroy_stream_forgets_demux_state() {
        let (adapter, demux, _recorder) = adapter_with(Role::Client);
        let stream = adapter.init_stream();
        adapter.destroy_stream(&stream);
        assert!(stream.is_closed());
        // forget_stream drops all state; a fresh registration starts clean
        // rather than replaying the earlier cancellation.
        match demux.register_recv_message(1024) {
            RegisterOutcome::Wait(_) => {}
            RegisterOutcome::Ready(_) => panic!("expected a clean slate after forgetting"),
        }
    }

    #[tokio::test]
    async fn server_recv_trailing_metadata_waits_for_its_own_send() {
        let (adapter, demux, _recorder) = adapter_with(Role::Server);
        let stream = adapter.init_stream();

        let outcome = adapter
            .perform_stream_op(&stream, StreamOpBatch { recv_trailing_metadata: true, ..Default::default() })
            .unwrap();
        let fut = outcome.trailing_metadata.unwrap();

        // The client's trailing metadata arrives first, but the server
        // hasn't sent its own yet, so the future must not resolve.
        demux.notify_recv_trailing_metadata(1024, Metadata::new(), 0, None);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let mut fut = Box::pin(fut);
        assert!(futures::poll!(&mut fut).is_pending());

        adapter
            .perform_stream_op(
                &stream,
                StreamOpBatch {
                    send_trailing_metadata: Some((Metadata::new(), 0, None)),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(fut.await.is_ok());
    }

    #[tokio::test]
    async fn server_recv_trailing_metadata_resolves_immediately_if_already_sent() {
        let (adapter, demux, _recorder) = adapter_with(Role::Server);
        let stream = adapter.init_stream();

        adapter
            .perform_stream_op(
                &stream,
                StreamOpBatch {
                    send_trailing_metadata: Some((Metadata::new(), 0, None)),
                    ..Default::default()
                },
            )
            .unwrap();

        let outcome = adapter
            .perform_stream_op(&stream, StreamOpBatch { recv_trailing_metadata: true, ..Default::default() })
            .unwrap();
        demux.notify_recv_trailing_metadata(1024, Metadata::new(), 0, None);
        assert!(outcome.trailing_metadata.unwrap().await.is_ok());
    }

    #[tokio::test]
    async fn close_transport_cancels_every_registered_stream() {
        let (adapter, _demux, _recorder) = adapter_with(Role::Server);
        let a = adapter.init_stream();
        let b = adapter.init_stream();
        adapter.close_transport(StatusCode::Unavailable);
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn exhausted_id_counter_hands_back_an_already_closed_stream() {
        let config = EngineConfig::default().with_first_call_id(1024).with_max_call_id(1024);
        let (adapter, _demux, recorder) = adapter_with_config(Role::Client, config);

        let within_ceiling = adapter.init_stream();
        assert!(!within_ceiling.is_closed());

        let past_ceiling = adapter.init_stream();
        assert!(past_ceiling.is_closed());

        let outcome = adapter
            .perform_stream_op(
                &past_ceiling,
                StreamOpBatch {
                    send_message: Some(b"never sent".to_vec()),
                    recv_message: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(recorder.calls.lock().unwrap().is_empty());
        match outcome.message.unwrap().await {
            MessageOutcome::Cancelled(StatusCode::Unavailable) => {}
            other => panic!("expected exhaustion to read back as unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_stream_registers_once_and_fires_the_callback_once() {
        let (adapter, _demux, _recorder) = adapter_with(Role::Server);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        adapter.set_accept_stream_callback(Arc::new(move |s| seen2.lock().unwrap().push(s.id())));

        let a = adapter.accept_stream(2048);
        let b = adapter.accept_stream(2048);
        assert_eq!(a.id(), b.id());
        assert_eq!(*seen.lock().unwrap(), vec![2048]);
    }

    #[tokio::test]
    async fn goaway_cancels_streams_and_marks_connectivity_shutdown() {
        let (adapter, _demux, _recorder) = adapter_with(Role::Server);
        let mut connectivity = adapter.connectivity_state();
        assert_eq!(*connectivity.borrow(), ConnectivityState::Ready);
        let stream = adapter.init_stream();

        adapter.perform_transport_op(TransportOp::GoAway(StatusCode::Unavailable));

        assert!(stream.is_closed());
        connectivity.changed().await.unwrap();
        assert_eq!(*connectivity.borrow(), ConnectivityState::Shutdown);
    }
}
