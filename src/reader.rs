//! The wire reader: parses inbound parcels, runs the setup handshake, and
//! routes streaming frames to the [`Demux`].
//!
//! Grounded almost one-to-one on `WireReaderImpl`: `process_transaction`'s
//! code-range dispatch mirrors `ProcessTransaction`, and
//! `process_streaming_transaction` mirrors
//! `ProcessStreamingTransactionImpl`'s ordered field reads, its
//! `cancellation_flags` bookkeeping on a parse failure partway through a
//! frame, and the ack-threshold check that follows it. One deliberate
//! divergence: the original's client blocks for the server's binder handle
//! because of how Android's async `oneway` transactions dispatch; this
//! engine's primitive is symmetric, so both roles exchange their own
//! receiver handle during setup and either side can wait for the other's.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::codec::{flags, Parcel};
use crate::config::EngineConfig;
use crate::demux::Demux;
use crate::error::{StatusCode, TransportError};
use crate::primitive::{EndpointHandle, PeerCredential, SecurityPredicate};
use crate::transaction::{
    Metadata, Role, TxCode, ACKNOWLEDGE_BYTES, LAST_RESERVED_CODE, PING, PING_RESPONSE,
    SETUP_TRANSPORT, SHUTDOWN_TRANSPORT,
};
use crate::writer::WireWriter;

pub(crate) const WIRE_FORMAT_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupState {
    Fresh,
    WaitingPeerSetup,
    Connected,
}

fn parse_metadata(parcel: &mut Parcel) -> std::io::Result<Metadata> {
    let num_header = parcel.read_i32()?;
    if num_header < 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "metadata header count cannot be negative",
        ));
    }
    let mut metadata = Metadata::new();
    for _ in 0..num_header {
        let key = parcel.read_byte_array()?;
        let value = parcel.read_byte_array()?;
        metadata.push((key, value));
    }
    Ok(metadata)
}

/// Invoked the first time a server observes a streaming frame for a
/// transaction code it has not seen before, i.e. a peer-initiated stream.
pub type AcceptStreamHook = Arc<dyn Fn(TxCode) + Send + Sync>;

struct ReaderState {
    setup: SetupState,
    recvd_setup_transport: bool,
    writer: Option<Arc<WireWriter>>,
    expected_seq_num: HashMap<TxCode, u32>,
    message_buffer: HashMap<TxCode, Vec<u8>>,
    num_incoming_bytes: u64,
    num_acknowledged_bytes: u64,
    peer_setup_waiter: Option<oneshot::Sender<EndpointHandle>>,
    accept_stream_hook: Option<AcceptStreamHook>,
}

/// Parses inbound parcels for one connection and drives its setup
/// handshake and flow-control bookkeeping.
pub struct WireReader {
    role: Role,
    config: EngineConfig,
    security: Arc<dyn SecurityPredicate>,
    demux: Arc<Demux>,
    state: Mutex<ReaderState>,
}

impl WireReader {
    pub fn new(
        role: Role,
        config: EngineConfig,
        security: Arc<dyn SecurityPredicate>,
        demux: Arc<Demux>,
    ) -> Self {
        Self {
            role,
            config,
            security,
            demux,
            state: Mutex::new(ReaderState {
                setup: SetupState::Fresh,
                recvd_setup_transport: false,
                writer: None,
                expected_seq_num: HashMap::new(),
                message_buffer: HashMap::new(),
                num_incoming_bytes: 0,
                num_acknowledged_bytes: 0,
                peer_setup_waiter: None,
                accept_stream_hook: None,
            }),
        }
    }

    /// Installs the callback fired the first time a streaming frame arrives
    /// for a transaction code this reader has not seen before. A connection
    /// uses this to register the stream and fire its own accept-stream
    /// callback before the frame's fields are delivered to the demux.
    pub fn set_accept_stream_hook(&self, hook: AcceptStreamHook) {
        self.state.lock().expect("reader mutex poisoned").accept_stream_hook = Some(hook);
    }

    /// Attaches the wire writer this reader forwards acknowledgements and
    /// ping replies to. Must be called once, after the peer's receiver
    /// handle is known.
    pub fn attach_writer(&self, writer: Arc<WireWriter>) {
        let mut state = self.state.lock().expect("reader mutex poisoned");
        state.writer = Some(writer);
        state.setup = SetupState::Connected;
    }

    /// Registers interest in the peer's receiver handle, delivered by its
    /// `SETUP_TRANSPORT` control transaction. Used by the side that needs
    /// to build its [`WireWriter`] only once that handle is known.
    pub fn wait_for_peer_setup(&self) -> oneshot::Receiver<EndpointHandle> {
        let mut state = self.state.lock().expect("reader mutex poisoned");
        state.setup = SetupState::WaitingPeerSetup;
        let (tx, rx) = oneshot::channel();
        state.peer_setup_waiter = Some(tx);
        rx
    }

    /// Top-level dispatch for every inbound parcel: reserved control codes
    /// below [`crate::config::EngineConfig::first_call_id`] are handled
    /// directly, everything else is routed as a streaming frame.
    pub fn process_transaction(
        &self,
        code: TxCode,
        mut parcel: Parcel,
        credential: PeerCredential,
    ) -> Result<()> {
        if code >= self.config.first_call_id {
            return self.process_streaming_transaction(code, parcel);
        }

        if !(1..=LAST_RESERVED_CODE).contains(&code) {
            warn!(code, "received unknown control message, ignoring");
            return Ok(());
        }

        let mut state = self.state.lock().expect("reader mutex poisoned");
        if code != SETUP_TRANSPORT && state.setup != SetupState::Connected {
            return Err(TransportError::invalid_argument("transport not connected yet").into());
        }

        match code {
            SETUP_TRANSPORT => {
                if state.recvd_setup_transport {
                    return Err(
                        TransportError::invalid_argument("already received SETUP_TRANSPORT").into()
                    );
                }
                state.recvd_setup_transport = true;
                if !self.security.is_authorized(credential) {
                    return Err(TransportError::permission_denied(format!(
                        "credential {credential} is not authorized to connect"
                    ))
                    .into());
                }
                let version = parcel.read_i32()?;
                if version != WIRE_FORMAT_VERSION {
                    warn!(version, expected = WIRE_FORMAT_VERSION, "peer wire format version mismatch, continuing anyway");
                }
                let peer_receiver = parcel.read_handle()?;
                state.setup = SetupState::Connected;
                if let Some(waiter) = state.peer_setup_waiter.take() {
                    let _ = waiter.send(peer_receiver);
                }
                Ok(())
            }
            SHUTDOWN_TRANSPORT => {
                warn!("received SHUTDOWN_TRANSPORT, not implemented");
                Err(TransportError::internal("SHUTDOWN_TRANSPORT is not implemented").into())
            }
            ACKNOWLEDGE_BYTES => {
                let num_bytes = parcel.read_i64()?;
                let writer = state.writer.clone();
                drop(state);
                if let Some(writer) = writer {
                    writer.on_ack_received(num_bytes as u64);
                } else {
                    warn!("received ACKNOWLEDGE_BYTES before a writer was attached");
                }
                Ok(())
            }
            PING => {
                if self.role == Role::Client {
                    return Err(
                        TransportError::invalid_argument("received PING on a client").into()
                    );
                }
                let ping_id = parcel.read_i32()?;
                debug!(ping_id, "received ping, replying");
                let writer = state.writer.clone();
                drop(state);
                if let Some(writer) = writer {
                    writer.send_ping_response(ping_id)?;
                }
                Ok(())
            }
            PING_RESPONSE => {
                let value = parcel.read_i32()?;
                debug!(value, "received ping response");
                Ok(())
            }
            _ => unreachable!("range checked above"),
        }
    }

    fn process_streaming_transaction(&self, code: TxCode, mut parcel: Parcel) -> Result<()> {
        let mut cancellation_flags: u16 = 0;
        let result = self.process_streaming_transaction_impl(code, &mut parcel, &mut cancellation_flags);

        if let Err(ref e) = result {
            info!(code, error = %e, "failed to process streaming transaction, cancelling pending receives");
            if cancellation_flags & flags::FLAG_PREFIX as u16 != 0 {
                self.demux.notify_recv_initial_metadata(code, Err(StatusCode::InvalidArgument));
            }
            if cancellation_flags & flags::FLAG_MESSAGE_DATA as u16 != 0 {
                self.demux.notify_recv_message(code, Vec::new());
            }
            if cancellation_flags & flags::FLAG_SUFFIX as u16 != 0 {
                self.demux.notify_recv_trailing_metadata(code, Metadata::new(), 0, None);
            }
        }

        let mut state = self.state.lock().expect("reader mutex poisoned");
        if state.num_incoming_bytes - state.num_acknowledged_bytes >= self.config.flow_control_ack_bytes
        {
            let writer = state.writer.clone();
            let acked_through = state.num_incoming_bytes;
            state.num_acknowledged_bytes = acked_through;
            drop(state);
            if let Some(writer) = writer {
                if result.is_ok() {
                    return writer.send_ack(acked_through);
                }
                let _ = writer.send_ack(acked_through);
            }
        }

        result
    }

    fn process_streaming_transaction_impl(
        &self,
        code: TxCode,
        parcel: &mut Parcel,
        cancellation_flags: &mut u16,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().expect("reader mutex poisoned");
            state.num_incoming_bytes += parcel.data_size() as u64;
        }

        let word = parcel.read_i32()? as u32;
        let (flag_bits, status) = flags::unpack(word);
        *cancellation_flags = flag_bits;

        if flag_bits == 0 {
            trace!(code, "received an empty transaction, ignoring");
            return Ok(());
        }

        if flag_bits & flags::FLAG_MESSAGE_DATA_IS_PARCELABLE as u16 != 0 {
            return Err(TransportError::invalid_argument(
                "alternate message encoding (MessageDataIsParcelable) is not supported",
            )
            .into());
        }

        let seq_num = parcel.read_i32()?;
        if seq_num < 0 {
            return Err(TransportError::invalid_argument("negative sequence number").into());
        }
        let mut newly_seen = false;
        {
            let mut state = self.state.lock().expect("reader mutex poisoned");
            newly_seen = !state.expected_seq_num.contains_key(&code);
            let expected = state.expected_seq_num.entry(code).or_insert(0);
            if seq_num as u32 != *expected {
                return Err(TransportError::invalid_argument(format!(
                    "unexpected sequence number on stream {code}: expected {expected}, got {seq_num}"
                ))
                .into());
            }
            *expected = expected.checked_add(1).ok_or_else(|| {
                TransportError::internal("sequence number exhausted a 32-bit counter")
            })?;
        }
        if newly_seen && self.role == Role::Server {
            let hook = self.state.lock().expect("reader mutex poisoned").accept_stream_hook.clone();
            if let Some(hook) = hook {
                hook(code);
            }
        }

        if flag_bits & flags::FLAG_PREFIX as u16 != 0 {
            trace!(code, "reading prefix");
            let method_ref = if self.role == Role::Server {
                Some(parcel.read_string()?)
            } else {
                None
            };
            let metadata = parse_metadata(parcel)?;
            self.demux.notify_recv_initial_metadata(code, Ok((method_ref, metadata)));
            *cancellation_flags &= !(flags::FLAG_PREFIX as u16);
        }

        if flag_bits & flags::FLAG_MESSAGE_DATA as u16 != 0 {
            let chunk = parcel.read_byte_array()?;
            trace!(code, chunk_len = chunk.len(), "reading message chunk");
            let mut state = self.state.lock().expect("reader mutex poisoned");
            let buf = state.message_buffer.entry(code).or_default();
            buf.extend_from_slice(&chunk);
            if flag_bits & flags::FLAG_MESSAGE_DATA_IS_PARTIAL as u16 == 0 {
                let full = state.message_buffer.remove(&code).unwrap_or_default();
                drop(state);
                self.demux.notify_recv_message(code, full);
            }
            *cancellation_flags &= !(flags::FLAG_MESSAGE_DATA as u16);
        }

        if flag_bits & flags::FLAG_SUFFIX as u16 != 0 {
            trace!(code, "reading suffix");
            let status_description = if flag_bits & flags::FLAG_STATUS_DESCRIPTION as u16 != 0 {
                Some(parcel.read_string()?)
            } else {
                None
            };
            let trailing_metadata =
                if self.role == Role::Client { parse_metadata(parcel)? } else { Metadata::new() };
            self.demux.notify_recv_trailing_metadata(
                code,
                trailing_metadata,
                status,
                status_description,
            );
            *cancellation_flags &= !(flags::FLAG_SUFFIX as u16);
        }

        Ok(())
    }
}
