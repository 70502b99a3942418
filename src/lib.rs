//! pbrpc - a wire protocol engine for a cross-process RPC transport
//!
//! This crate implements the hard part of multiplexing gRPC-style call
//! semantics (initial metadata, message, trailing metadata, status) over a
//! host-provided one-way, ordered, parcel-based IPC primitive analogous to
//! Android Binder. It sits between a generic RPC surface (streams with op
//! batches) above and a primitive below that offers one operation: "send a
//! parcel of bytes and typed fields to the peer; receive parcels from the
//! peer on a registered callback".
//!
//! ## Main components
//!
//! - [`codec`]: typed read/write of a parcel's fields.
//! - [`primitive`]: the external IPC primitive this engine is built on top
//!   of, expressed as traits so tests can substitute an in-process
//!   loopback.
//! - [`registry`]: the process-wide connection-identifier to endpoint-handle
//!   directory.
//! - [`transaction`]: the per-call outbound builder.
//! - [`stream`]: per-stream state and the per-connection stream table.
//! - [`demux`]: the stream demultiplexer (pending receive callbacks).
//! - [`writer`]: the wire writer (framing, fragmentation, flow control).
//! - [`reader`]: the wire reader (parsing, setup handshake, dispatch).
//! - [`combiner`]: the per-connection serialized execution context.
//! - [`adapter`]: translation from RPC-surface batch ops to writer/demux
//!   calls.
//! - [`connection`]: ties the above together into one connection's
//!   lifecycle.
//!
//! ## Standards / design basis
//!
//! The wire layout and flow-control scheme are a from-scratch design, not
//! wire-compatible with HTTP/2. No retransmission or ack-based delivery is
//! implemented at the frame level: the underlying IPC primitive is assumed
//! ordered and reliable per direction. No cryptographic protection is
//! applied to frames.

pub mod adapter;
pub mod codec;
pub mod combiner;
pub mod config;
pub mod connection;
pub mod demux;
pub mod error;
pub mod primitive;
pub mod registry;
pub mod stream;
pub mod transaction;
pub mod writer;
pub mod reader;

pub use config::EngineConfig;
pub use error::{StatusCode, TransportError};
pub use transaction::{Role, Transaction, TxCode};
