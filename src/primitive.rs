//! The external collaborators this engine depends on but does not own: the
//! host IPC primitive underneath it, and the connector/security-policy
//! interfaces the surrounding driver is expected to supply.
//!
//! None of this module's traits are implemented for a real kernel IPC
//! mechanism here; loading and bridging that primitive is someone else's
//! job. `tests/support.rs` provides an in-process loopback implementation
//! so the rest of the engine can be exercised end to end.

use std::fmt;
use std::sync::Arc;

use crate::codec::Parcel;

/// The peer credential a [`SecurityPredicate`] is consulted with (e.g. a
/// Unix uid). Opaque beyond being comparable and cheap to copy.
pub type PeerCredential = u32;

/// An opaque connection identifier, produced by the connector/listener
/// layer and used only as a lookup key by the [`crate::registry`].
pub type ConnectionId = Vec<u8>;

/// A reference to a peer IPC endpoint: the only thing this engine can do
/// with it is hand it a transaction code and a parcel.
pub trait Endpoint: Send + Sync + fmt::Debug {
    fn transact(&self, code: u32, parcel: Parcel) -> anyhow::Result<()>;
}

/// An owned, clonable reference to a peer endpoint.
///
/// Cloning bumps the reference the same way handing a handle to a parcel
/// transfers a reference the peer is obligated to release; `Arc`'s
/// clone/drop gives us that without a raw pointer ever escaping a lock.
#[derive(Clone, Debug)]
pub struct EndpointHandle(Arc<dyn Endpoint>);

impl EndpointHandle {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self(endpoint)
    }

    pub fn transact(&self, code: u32, parcel: Parcel) -> anyhow::Result<()> {
        self.0.transact(code, parcel)
    }
}

/// Invoked once per inbound parcel: transaction code, the parcel itself,
/// and the credential of the process that sent it.
pub type InboundHandler = Arc<dyn Fn(u32, Parcel, PeerCredential) + Send + Sync>;

/// The host-provided IPC primitive. Constructing a receiver registers the
/// callback that fires for every parcel sent to *us*, and returns the
/// endpoint handle other processes use to reach that callback; this is
/// the handle the reader transmits to the peer during the setup handshake.
pub trait Primitive: Send + Sync {
    fn construct_receiver(&self, on_transact: InboundHandler) -> EndpointHandle;
}

/// A caller-supplied, stateless authorization check. Must be stable for a
/// given input so the engine may cache its result per connection.
pub trait SecurityPredicate: Send + Sync {
    fn is_authorized(&self, credential: PeerCredential) -> bool;
}

impl<F> SecurityPredicate for F
where
    F: Fn(PeerCredential) -> bool + Send + Sync,
{
    fn is_authorized(&self, credential: PeerCredential) -> bool {
        self(credential)
    }
}

/// A predicate that authorizes every peer; the default for engines that
/// delegate authorization to a layer above (or none at all).
pub struct AllowAll;

impl SecurityPredicate for AllowAll {
    fn is_authorized(&self, _credential: PeerCredential) -> bool {
        true
    }
}
