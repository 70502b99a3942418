//! The transaction code namespace, roles, and the per-call outbound
//! builder.

use smallvec::SmallVec;

use crate::codec::flags;

/// An unsigned 32-bit transaction code. Values `1..=5` are reserved control
/// codes; values from [`crate::config::EngineConfig::first_call_id`] and up
/// identify streams.
pub type TxCode = u32;

/// A stream identifier; aliases `TxCode` because a stream *is* identified by
/// its transaction code.
pub type StreamId = TxCode;

pub const SETUP_TRANSPORT: TxCode = 1;
pub const SHUTDOWN_TRANSPORT: TxCode = 2;
pub const ACKNOWLEDGE_BYTES: TxCode = 3;
pub const PING: TxCode = 4;
pub const PING_RESPONSE: TxCode = 5;

/// Highest reserved control code; any code in `1..=LAST_RESERVED_CODE` that
/// isn't one of the five above is an unknown control message.
pub const LAST_RESERVED_CODE: TxCode = 5;

/// One (key, value) metadata entry; ordered, no deduplication.
pub type MetadataEntry = (Vec<u8>, Vec<u8>);

/// An ordered sequence of metadata entries. Most calls carry only a
/// handful, so a small inline capacity avoids a heap allocation for the
/// common case.
pub type Metadata = SmallVec<[MetadataEntry; 4]>;

/// Which side of a stream this transaction (or the stream itself) belongs
/// to. A client sends `method_ref` and never a non-empty suffix metadata;
/// a server sends `status` and never a `method_ref`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A builder for a single outbound unit bound to a stream. Every optional
/// part is set at most once; setting an already-set part is a programming
/// error, asserted rather than returned as a `Result`.
#[derive(Debug, Clone)]
pub struct Transaction {
    tx_code: TxCode,
    role: Role,
    method_ref: Option<String>,
    prefix_metadata: Option<Metadata>,
    message_data: Option<Vec<u8>>,
    suffix_metadata: Option<Metadata>,
    status: u16,
    status_description: Option<String>,
}

impl Transaction {
    pub fn new(tx_code: TxCode, role: Role) -> Self {
        Self {
            tx_code,
            role,
            method_ref: None,
            prefix_metadata: None,
            message_data: None,
            suffix_metadata: None,
            status: 0,
            status_description: None,
        }
    }

    pub fn tx_code(&self) -> TxCode {
        self.tx_code
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Sets the Prefix part: `method_ref` (client only, may be omitted even
    /// for a client) plus the initial metadata. May be called at most once.
    pub fn set_prefix(&mut self, method_ref: Option<String>, metadata: Metadata) {
        assert!(self.prefix_metadata.is_none(), "prefix already set on this transaction");
        if method_ref.is_some() {
            assert_eq!(self.role, Role::Client, "only a client may set method_ref");
        }
        self.method_ref = method_ref;
        self.prefix_metadata = Some(metadata);
    }

    /// Sets the message-bytes part. May be called at most once; arbitrary
    /// length, fragmented by the writer if needed.
    pub fn set_message_data(&mut self, data: Vec<u8>) {
        assert!(self.message_data.is_none(), "message data already set on this transaction");
        self.message_data = Some(data);
    }

    /// Sets the Suffix part. For a client, `metadata` must be empty;
    /// `status`/`status_description` are server-only and a non-zero status
    /// or non-empty metadata from a client transaction is asserted against.
    pub fn set_suffix(
        &mut self,
        metadata: Metadata,
        status: u16,
        status_description: Option<String>,
    ) {
        assert!(self.suffix_metadata.is_none(), "suffix already set on this transaction");
        if self.role == Role::Client {
            assert!(metadata.is_empty(), "client suffix metadata must be empty");
            assert_eq!(status, 0, "only a server may set a non-zero status");
        }
        self.suffix_metadata = Some(metadata);
        self.status = status;
        self.status_description = status_description;
    }

    pub fn has_prefix(&self) -> bool {
        self.prefix_metadata.is_some()
    }

    pub fn has_message_data(&self) -> bool {
        self.message_data.is_some()
    }

    pub fn has_suffix(&self) -> bool {
        self.suffix_metadata.is_some()
    }

    pub fn method_ref(&self) -> Option<&str> {
        self.method_ref.as_deref()
    }

    pub fn prefix_metadata(&self) -> Option<&Metadata> {
        self.prefix_metadata.as_ref()
    }

    pub fn message_data(&self) -> Option<&[u8]> {
        self.message_data.as_deref()
    }

    pub fn suffix_metadata(&self) -> Option<&Metadata> {
        self.suffix_metadata.as_ref()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_description(&self) -> Option<&str> {
        self.status_description.as_deref()
    }

    /// The base wire flags this transaction would carry if emitted whole
    /// (before the writer's fragmentation logic adds
    /// `FLAG_MESSAGE_DATA_IS_PARTIAL` for the slow path).
    pub fn base_flags(&self) -> u16 {
        let mut f = 0u32;
        if self.has_prefix() {
            f |= flags::FLAG_PREFIX;
        }
        if self.has_message_data() {
            f |= flags::FLAG_MESSAGE_DATA;
        }
        if self.has_suffix() {
            f |= flags::FLAG_SUFFIX;
            if self.status_description.is_some() {
                f |= flags::FLAG_STATUS_DESCRIPTION;
            }
        }
        f as u16
    }

    /// The full 32-bit wire word: `base_flags()` in the low 16 bits and
    /// `status` in the high 16, as a single transaction carries both.
    pub fn packed_flags(&self) -> u32 {
        flags::pack(self.base_flags(), self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "prefix already set")]
    fn double_prefix_panics() {
        let mut tx = Transaction::new(1024, Role::Client);
        tx.set_prefix(None, Metadata::new());
        tx.set_prefix(None, Metadata::new());
    }

    #[test]
    #[should_panic(expected = "client suffix metadata must be empty")]
    fn client_nonempty_suffix_panics() {
        let mut tx = Transaction::new(1024, Role::Client);
        let mut md = Metadata::new();
        md.push((b"a".to_vec(), b"b".to_vec()));
        tx.set_suffix(md, 0, None);
    }

    #[test]
    fn packed_flags_combine_flags_and_status() {
        let mut tx = Transaction::new(1024, Role::Server);
        tx.set_suffix(Metadata::new(), 7, None);
        assert_eq!(tx.packed_flags(), flags::pack(flags::FLAG_SUFFIX as u16, 7));
    }

    #[test]
    fn base_flags_reflect_set_parts() {
        let mut tx = Transaction::new(1024, Role::Server);
        assert_eq!(tx.base_flags(), 0);
        tx.set_message_data(vec![1, 2, 3]);
        assert_eq!(tx.base_flags(), flags::FLAG_MESSAGE_DATA as u16);
        tx.set_suffix(Metadata::new(), 5, Some("done".to_string()));
        assert_eq!(
            tx.base_flags(),
            (flags::FLAG_MESSAGE_DATA | flags::FLAG_SUFFIX | flags::FLAG_STATUS_DESCRIPTION) as u16
        );
    }
}
