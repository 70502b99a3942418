//! An in-process loopback [`Primitive`], standing in for a real IPC
//! mechanism the way `tests/rpc.rs` drives its protocol stack over an
//! in-memory `tokio::io::duplex` instead of a socket.
//!
//! Each endpoint constructed here owns one end of an
//! `mpsc::unbounded_channel`; `transact` just pushes onto the channel and
//! returns, and a spawned task drains it and invokes the registered
//! handler. This keeps delivery asynchronous (a send can complete before
//! the peer has processed it) the way a real cross-process primitive
//! would, rather than calling the handler inline under `transact`.

use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;

use pbrpc::config::EngineConfig;
use pbrpc::connection::Connection;
use pbrpc::primitive::{Endpoint, EndpointHandle, InboundHandler, PeerCredential, Primitive};

/// The credential every loopback endpoint reports itself as calling with.
pub const LOOPBACK_CREDENTIAL: PeerCredential = 1000;

/// Enables `tracing` output for a test run, honoring `RUST_LOG`. Safe to
/// call from every test in a suite; only the first call installs a
/// subscriber, the rest are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct LoopbackPrimitive;

impl LoopbackPrimitive {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoopbackPrimitive {
    fn default() -> Self {
        Self::new()
    }
}

struct ChannelEndpoint {
    tx: mpsc::UnboundedSender<(u32, pbrpc::codec::Parcel, PeerCredential)>,
}

impl fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEndpoint").finish()
    }
}

impl Endpoint for ChannelEndpoint {
    fn transact(&self, code: u32, parcel: pbrpc::codec::Parcel) -> anyhow::Result<()> {
        self.tx
            .send((code, parcel, LOOPBACK_CREDENTIAL))
            .map_err(|_| anyhow!("loopback peer's receiver task is gone"))
    }
}

impl Primitive for LoopbackPrimitive {
    fn construct_receiver(&self, on_transact: InboundHandler) -> EndpointHandle {
        let (tx, mut rx) =
            mpsc::unbounded_channel::<(u32, pbrpc::codec::Parcel, PeerCredential)>();
        tokio::spawn(async move {
            while let Some((code, parcel, credential)) = rx.recv().await {
                on_transact(code, parcel, credential);
            }
        });
        EndpointHandle::new(Arc::new(ChannelEndpoint { tx }))
    }
}

/// Stands up two connections, client and server, over a pair of loopback
/// primitives and runs the setup handshake to completion.
pub async fn connect_pair(config: EngineConfig) -> (Connection, Connection) {
    let server_primitive = LoopbackPrimitive::new();
    let client_primitive = LoopbackPrimitive::new();

    let pending =
        Connection::accept(&server_primitive, config, Arc::new(pbrpc::primitive::AllowAll));
    let client = Connection::connect(
        &client_primitive,
        pending.own_receiver(),
        config,
        Arc::new(pbrpc::primitive::AllowAll),
    )
    .expect("client-side handshake setup failed");
    let server = pending.finish().await.expect("server-side handshake setup failed");
    (client, server)
}
