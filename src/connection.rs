//! Ties the reader, writer, adapter, and stream table together into one
//! connection's lifecycle, from construction through the setup handshake to
//! steady-state stream operations.
//!
//! Grounded on two places at once. The constructor ordering
//! (`TransportStreamReceiverImpl`, then `WireReaderImpl`, then
//! `SetupTransport` handing back the `wire_writer`) is `binder_transport.cc`'s
//! constructor. The shape of "register an inbound callback with the
//! primitive, then drive everything through a per-connection context" is
//! `NFSTcpListener::bind`'s per-connection `Context` and `process_socket`'s
//! read-loop/reply-channel wiring in the base crate's own transport layer.
//!
//! Every mutation of per-connection state (stream allocation, op batches,
//! teardown) is submitted to the [`Combiner`] rather than called directly,
//! matching the concurrency model the adapter and stream table are built
//! for. Since [`Combiner::run`] is enqueue-only, callers that need a result
//! pair it with a `oneshot` channel themselves.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::oneshot;
use tracing::error;

use crate::adapter::{
    ConnectivityState, StreamOpBatch, StreamOpOutcome, TransportAdapter, TransportOp,
};
use crate::combiner::Combiner;
use crate::config::EngineConfig;
use crate::demux::Demux;
use crate::error::StatusCode;
use crate::primitive::{EndpointHandle, Primitive, SecurityPredicate};
use crate::reader::{WireReader, WIRE_FORMAT_VERSION};
use crate::stream::{StreamHandle, StreamTable};
use crate::transaction::{Role, StreamId};
use crate::writer::WireWriter;

/// Runs `f` against a fresh `TransportAdapter` clone inside the combiner and
/// ships the result back through a one-shot channel. Every `Connection`
/// method that mutates adapter state goes through this so two calls never
/// race each other.
async fn on_combiner<T, F>(combiner: &Combiner, adapter: Arc<TransportAdapter>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&TransportAdapter) -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    combiner.run(Box::pin(async move {
        let result = f(&adapter);
        let _ = tx.send(result);
    }))?;
    rx.await.map_err(|_| anyhow!("combiner dropped the task before it completed"))
}

fn install_inbound_callback(
    primitive: &dyn Primitive,
    reader: Arc<WireReader>,
) -> EndpointHandle {
    primitive.construct_receiver(Arc::new(move |code, parcel, credential| {
        if let Err(e) = reader.process_transaction(code, parcel, credential) {
            error!(error = %e, "failed to process inbound transaction");
        }
    }))
}

/// One live connection: a client or server side, past its setup handshake,
/// ready to allocate and drive streams.
pub struct Connection {
    adapter: Arc<TransportAdapter>,
    combiner: Combiner,
    role: Role,
}

impl Connection {
    /// Initiates a connection to a peer whose endpoint handle is already
    /// known (e.g. looked up from the [`crate::registry::EndpointRegistry`]).
    /// The client sends its own receiver handle in `SETUP_TRANSPORT`
    /// immediately; it does not need to wait for anything from the peer.
    pub fn connect(
        primitive: &dyn Primitive,
        peer: EndpointHandle,
        config: EngineConfig,
        security: Arc<dyn SecurityPredicate>,
    ) -> Result<Self> {
        let demux = Arc::new(Demux::new());
        let reader = Arc::new(WireReader::new(Role::Client, config, security, demux.clone()));
        let own_receiver = install_inbound_callback(primitive, reader.clone());

        let writer = Arc::new(WireWriter::new(peer, config));
        reader.attach_writer(writer.clone());
        writer.send_setup_transport(WIRE_FORMAT_VERSION, own_receiver)?;

        let streams = Arc::new(StreamTable::new());
        let adapter =
            Arc::new(TransportAdapter::new(Role::Client, config, writer, demux, streams));
        let connection = Self { adapter: adapter.clone(), combiner: Combiner::new(), role: Role::Client };
        connection.wire_accept_stream_hook(reader);
        Ok(connection)
    }

    /// Begins accepting a connection from an unknown peer. The server must
    /// wait for the peer's own `SETUP_TRANSPORT` to learn its receiver
    /// handle before it can build a writer, so construction here is two
    /// phases: register this side's receiver now, then [`PendingConnection::finish`]
    /// once the peer's handle has arrived.
    pub fn accept(
        primitive: &dyn Primitive,
        config: EngineConfig,
        security: Arc<dyn SecurityPredicate>,
    ) -> PendingConnection {
        let demux = Arc::new(Demux::new());
        let reader = Arc::new(WireReader::new(Role::Server, config, security, demux.clone()));
        let peer_rx = reader.wait_for_peer_setup();
        let own_receiver = install_inbound_callback(primitive, reader.clone());
        PendingConnection { reader, demux, config, peer_rx, own_receiver }
    }

    fn wire_accept_stream_hook(&self, reader: Arc<WireReader>) {
        let adapter = self.adapter.clone();
        reader.set_accept_stream_hook(Arc::new(move |id: StreamId| {
            adapter.accept_stream(id);
        }));
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Subscribes to connectivity-state changes on this connection.
    pub fn connectivity_state(&self) -> tokio::sync::watch::Receiver<ConnectivityState> {
        self.adapter.connectivity_state()
    }

    /// Installs the callback fired once for every peer-initiated stream the
    /// reader first observes. Server-side only in practice, since a client
    /// never receives a stream it didn't open itself.
    pub fn set_accept_stream_callback(&self, callback: Arc<dyn Fn(StreamHandle) + Send + Sync>) {
        self.adapter.set_accept_stream_callback(callback);
    }

    /// Allocates a new outbound stream. Only meaningful for a client; a
    /// server learns about its streams through the accept-stream callback
    /// instead.
    pub async fn new_stream(&self) -> Result<StreamHandle> {
        on_combiner(&self.combiner, self.adapter.clone(), |adapter| adapter.init_stream()).await
    }

    pub fn get_stream(&self, id: StreamId) -> Option<StreamHandle> {
        self.adapter.get_stream(id)
    }

    /// Runs one op batch against `stream`, serialized on this connection's
    /// combiner along with every other mutation.
    pub async fn perform_stream_op(
        &self,
        stream: StreamHandle,
        op: StreamOpBatch,
    ) -> Result<StreamOpOutcome> {
        on_combiner(&self.combiner, self.adapter.clone(), move |adapter| {
            adapter.perform_stream_op(&stream, op)
        })
        .await?
    }

    /// Tears down one stream without notifying the peer.
    pub async fn destroy_stream(&self, stream: StreamHandle) -> Result<()> {
        on_combiner(&self.combiner, self.adapter.clone(), move |adapter| {
            adapter.destroy_stream(&stream);
        })
        .await
    }

    /// Issues a connectivity-affecting operation: a peer goaway or a local
    /// disconnect-with-error, both of which cancel every open stream.
    pub async fn perform_transport_op(&self, op: TransportOp) -> Result<()> {
        on_combiner(&self.combiner, self.adapter.clone(), move |adapter| {
            adapter.perform_transport_op(op);
        })
        .await
    }

    /// Cancels every stream still open and marks the connection unavailable.
    /// Equivalent to `perform_transport_op(TransportOp::DisconnectWithError(reason))`.
    pub async fn close(&self, reason: StatusCode) -> Result<()> {
        self.perform_transport_op(TransportOp::DisconnectWithError(reason)).await
    }
}

/// A server-side connection that has registered its own receiver but is
/// still waiting for the peer's `SETUP_TRANSPORT` before it can build a
/// writer and become a full [`Connection`].
pub struct PendingConnection {
    reader: Arc<WireReader>,
    demux: Arc<Demux>,
    config: EngineConfig,
    peer_rx: oneshot::Receiver<EndpointHandle>,
    own_receiver: EndpointHandle,
}

impl PendingConnection {
    /// The receiver handle the connecting client needs to be given (e.g.
    /// through the [`crate::registry::EndpointRegistry`]) before it can
    /// address this side.
    pub fn own_receiver(&self) -> EndpointHandle {
        self.own_receiver.clone()
    }

    /// Waits for the peer's `SETUP_TRANSPORT`, then completes the handshake
    /// from this side and returns the live connection.
    pub async fn finish(self) -> Result<Connection> {
        let peer = self
            .peer_rx
            .await
            .map_err(|_| anyhow!("connection was torn down before the peer's setup arrived"))?;

        let writer = Arc::new(WireWriter::new(peer, self.config));
        self.reader.attach_writer(writer.clone());
        writer.send_setup_transport(WIRE_FORMAT_VERSION, self.own_receiver.clone())?;

        let streams = Arc::new(StreamTable::new());
        let adapter = Arc::new(TransportAdapter::new(
            Role::Server,
            self.config,
            writer,
            self.demux.clone(),
            streams,
        ));
        let connection =
            Connection { adapter: adapter.clone(), combiner: Combiner::new(), role: Role::Server };
        connection.wire_accept_stream_hook(self.reader);
        Ok(connection)
    }
}
