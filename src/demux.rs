//! The stream demultiplexer: routes inbound initial metadata, message
//! bytes, and trailing metadata to whichever task is waiting for them, per
//! stream.
//!
//! Grounded on `TransportStreamReceiverImpl`: a `register_recv_*` call and
//! the matching `notify_recv_*` call race against each other, and whichever
//! arrives second resolves the other; an extra `notify` before anyone has
//! registered is buffered so a later registration still gets it in order.
//! The original keeps three `std::map<id, queue<...>>` tables for this under
//! one mutex; `Slot<T>` below collapses that rendezvous into one reusable
//! type, and `StreamSlots` is three of them.
//!
//! The one piece of real logic beyond plain rendezvous is that receiving
//! trailing metadata means no further message data will ever arrive: any
//! message registration still pending is resolved with
//! [`MessageOutcome::StreamClosed`] instead of being left to wait forever,
//! and any buffered messages are still delivered first.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::StatusCode;
use crate::transaction::{Metadata, StreamId};

enum SlotState<T> {
    Empty,
    Pending(oneshot::Sender<T>),
    Buffered(VecDeque<T>),
}

/// The result of awaiting a registration: either the value was already
/// available and is returned directly, or the caller must await the
/// receiver for it to arrive later.
pub enum RegisterOutcome<T> {
    Ready(T),
    Wait(oneshot::Receiver<T>),
}

struct Slot<T: Clone> {
    state: SlotState<T>,
    terminal: Option<T>,
}

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self { state: SlotState::Empty, terminal: None }
    }

    /// Registers interest in the next value. Panics if a registration is
    /// already pending: a stream may only have one outstanding `register`
    /// per slot at a time, exactly as the original asserts.
    fn register(&mut self) -> RegisterOutcome<T> {
        match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::Buffered(mut q) => {
                let v = q.pop_front().expect("buffered slot state is never empty");
                self.state = if q.is_empty() { SlotState::Empty } else { SlotState::Buffered(q) };
                RegisterOutcome::Ready(v)
            }
            SlotState::Empty => {
                if let Some(terminal) = &self.terminal {
                    RegisterOutcome::Ready(terminal.clone())
                } else {
                    let (tx, rx) = oneshot::channel();
                    self.state = SlotState::Pending(tx);
                    RegisterOutcome::Wait(rx)
                }
            }
            SlotState::Pending(_) => panic!("duplicate registration on a demultiplexer slot"),
        }
    }

    fn notify(&mut self, value: T) {
        match std::mem::replace(&mut self.state, SlotState::Empty) {
            SlotState::Pending(tx) => {
                let _ = tx.send(value);
            }
            SlotState::Empty => {
                let mut q = VecDeque::new();
                q.push_back(value);
                self.state = SlotState::Buffered(q);
            }
            SlotState::Buffered(mut q) => {
                q.push_back(value);
                self.state = SlotState::Buffered(q);
            }
        }
    }

    /// Like `notify`, but remembers `value` so every registration made
    /// after the buffer drains (now or in the future) sees it too, instead
    /// of just the next one.
    fn close(&mut self, value: T) {
        self.terminal = Some(value.clone());
        self.notify(value);
    }
}

/// Outcome delivered to a pending `register_recv_message` call.
#[derive(Debug, Clone)]
pub enum MessageOutcome {
    Data(Vec<u8>),
    /// Trailing metadata has been received; no further message data will
    /// ever arrive on this stream.
    StreamClosed,
    Cancelled(StatusCode),
}

/// What a completed initial-metadata receive carries: the method reference
/// a server reads off a client's Prefix (`None` on the client side, which
/// never receives one back), plus the metadata itself.
pub type InitialMetadataOutcome = Result<(Option<String>, Metadata), StatusCode>;

struct StreamSlots {
    initial_metadata: Slot<InitialMetadataOutcome>,
    message: Slot<MessageOutcome>,
    trailing_metadata: Slot<Result<(Metadata, u16, Option<String>), StatusCode>>,
    trailing_received: bool,
}

impl StreamSlots {
    fn new() -> Self {
        Self {
            initial_metadata: Slot::new(),
            message: Slot::new(),
            trailing_metadata: Slot::new(),
            trailing_received: false,
        }
    }
}

/// Routes received data to the tasks that asked for it, per stream.
#[derive(Default)]
pub struct Demux {
    streams: Mutex<HashMap<StreamId, StreamSlots>>,
}

impl Demux {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stream<R>(&self, id: StreamId, f: impl FnOnce(&mut StreamSlots) -> R) -> R {
        let mut streams = self.streams.lock().expect("demux mutex poisoned");
        let entry = streams.entry(id).or_insert_with(StreamSlots::new);
        f(entry)
    }

    pub fn register_recv_initial_metadata(
        &self,
        id: StreamId,
    ) -> RegisterOutcome<InitialMetadataOutcome> {
        self.with_stream(id, |s| s.initial_metadata.register())
    }

    pub fn register_recv_message(&self, id: StreamId) -> RegisterOutcome<MessageOutcome> {
        self.with_stream(id, |s| s.message.register())
    }

    pub fn register_recv_trailing_metadata(
        &self,
        id: StreamId,
    ) -> RegisterOutcome<Result<(Metadata, u16, Option<String>), StatusCode>> {
        self.with_stream(id, |s| s.trailing_metadata.register())
    }

    pub fn notify_recv_initial_metadata(&self, id: StreamId, result: InitialMetadataOutcome) {
        self.with_stream(id, |s| s.initial_metadata.notify(result));
    }

    pub fn notify_recv_message(&self, id: StreamId, data: Vec<u8>) {
        self.with_stream(id, |s| s.message.notify(MessageOutcome::Data(data)));
    }

    /// Delivers trailing metadata and, the first time this fires for a
    /// stream, closes out the message slot so nothing waits on it forever.
    pub fn notify_recv_trailing_metadata(
        &self,
        id: StreamId,
        metadata: Metadata,
        status: u16,
        status_description: Option<String>,
    ) {
        self.with_stream(id, |s| {
            s.trailing_metadata.notify(Ok((metadata, status, status_description)));
            if !s.trailing_received {
                s.trailing_received = true;
                s.message.close(MessageOutcome::StreamClosed);
            }
        });
    }

    /// Resolves every outstanding and future registration on a stream with
    /// a cancellation outcome; used for explicit cancellation and for
    /// transport-wide teardown.
    pub fn cancel_stream(&self, id: StreamId, reason: StatusCode) {
        self.with_stream(id, |s| {
            s.initial_metadata.close(Err(reason));
            s.message.close(MessageOutcome::Cancelled(reason));
            s.trailing_metadata.close(Err(reason));
        });
    }

    /// Drops all per-stream state, e.g. once a stream is known closed and
    /// fully drained.
    pub fn forget_stream(&self, id: StreamId) {
        self.streams.lock().expect("demux mutex poisoned").remove(&id);
    }
}
