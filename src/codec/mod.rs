//! The parcel codec: typed sequential read/write of a single parcel's
//! fields.
//!
//! A [`Parcel`] is an ordered, typed byte container, built the same way the
//! base crate's `protocol::xdr::XDR` trait treats a `Read`/`Write` stream:
//! sequential, order-significant field access, every operation fallible and
//! propagated with `?`. Unlike XDR (which the base crate uses for NFS/RPC
//! wire compatibility and pads to 4-byte alignment), this parcel format is
//! this engine's own design and is not padded; it follows the host
//! primitive's native field layout, which for a Binder-style primitive is
//! little-endian fixed-width integers, length-prefixed UTF-8 strings and
//! byte arrays, and opaque endpoint-handle tokens carried out of band from
//! the byte stream (see [`Parcel::write_handle`]).

pub mod flags;

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::primitive::EndpointHandle;

/// An ordered, typed byte container delivered atomically by the underlying
/// IPC primitive.
///
/// Integer and byte-array fields live in a flat buffer; endpoint handles
/// are tracked in a side list in write/read order, mirroring how a real
/// Binder parcel carries strong-binder objects alongside its byte payload.
#[derive(Debug, Default)]
pub struct Parcel {
    data: Vec<u8>,
    pos: usize,
    handles: Vec<EndpointHandle>,
    handle_pos: usize,
}

impl Parcel {
    /// Creates an empty parcel ready for writing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps already-serialized bytes for reading (e.g. bytes just received
    /// from the primitive).
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, pos: 0, handles: Vec::new(), handle_pos: 0 }
    }

    /// Total size of the serialized byte payload, used by the writer to
    /// account for flow-control credit and by the reader to account for
    /// inbound bytes.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Consumes the parcel, returning its raw bytes (for handing to the
    /// primitive's transact call).
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn write_bool(&mut self, v: bool) -> io::Result<()> {
        self.write_i32(v as i32)
    }

    pub fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_i32()? != 0)
    }

    pub fn write_i32(&mut self, v: i32) -> io::Result<()> {
        self.data.write_i32::<LittleEndian>(v)
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        let mut cur = self.remaining();
        let v = cur.read_i32::<LittleEndian>()?;
        self.pos += 4;
        Ok(v)
    }

    pub fn write_u32(&mut self, v: u32) -> io::Result<()> {
        self.data.write_u32::<LittleEndian>(v)
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut cur = self.remaining();
        let v = cur.read_u32::<LittleEndian>()?;
        self.pos += 4;
        Ok(v)
    }

    pub fn write_i64(&mut self, v: i64) -> io::Result<()> {
        self.data.write_i64::<LittleEndian>(v)
    }

    pub fn read_i64(&mut self) -> io::Result<i64> {
        let mut cur = self.remaining();
        let v = cur.read_i64::<LittleEndian>()?;
        self.pos += 8;
        Ok(v)
    }

    pub fn write_u64(&mut self, v: u64) -> io::Result<()> {
        self.data.write_u64::<LittleEndian>(v)
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut cur = self.remaining();
        let v = cur.read_u64::<LittleEndian>()?;
        self.pos += 8;
        Ok(v)
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, s: &str) -> io::Result<()> {
        self.write_byte_array_with_length(s.as_bytes())
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> io::Result<String> {
        let bytes = self.read_byte_array()?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Writes a 32-bit length followed by the bytes. When `data` is empty,
    /// only the (zero) length is written.
    pub fn write_byte_array_with_length(&mut self, data: &[u8]) -> io::Result<()> {
        assert!(data.len() <= u32::MAX as usize, "byte array too large for a 32-bit length");
        self.write_u32(data.len() as u32)?;
        if !data.is_empty() {
            self.data.write_all(data)?;
        }
        Ok(())
    }

    /// Inverse of [`Parcel::write_byte_array_with_length`]: reads the
    /// length, then that many bytes, yielding owned bytes.
    pub fn read_byte_array(&mut self) -> io::Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        if len > self.remaining().len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "byte array length exceeds remaining parcel data",
            ));
        }
        let mut buf = vec![0u8; len];
        let mut cur = self.remaining();
        cur.read_exact(&mut buf)?;
        self.pos += len;
        Ok(buf)
    }

    /// Hands an endpoint handle to the peer. The writer is responsible for
    /// the primitive-level reference bump; the reader takes ownership on
    /// read and is responsible for eventual release.
    pub fn write_handle(&mut self, handle: EndpointHandle) {
        self.handles.push(handle);
    }

    /// Reads the next handle written by the peer, in write order.
    pub fn read_handle(&mut self) -> io::Result<EndpointHandle> {
        if self.handle_pos >= self.handles.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "no endpoint handle available in parcel",
            ));
        }
        let h = self.handles[self.handle_pos].clone();
        self.handle_pos += 1;
        Ok(h)
    }

    /// Used by test fixtures and the primitive loopback to move handles
    /// from a written parcel into the bytes-only form the primitive
    /// transmits, and back.
    pub fn take_handles(&mut self) -> Vec<EndpointHandle> {
        std::mem::take(&mut self.handles)
    }

    pub fn set_handles(&mut self, handles: Vec<EndpointHandle>) {
        self.handles = handles;
        self.handle_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        let mut p = Parcel::new();
        p.write_i32(-42).unwrap();
        p.write_u32(7).unwrap();
        p.write_i64(-9_000_000_000).unwrap();
        p.write_u64(9_000_000_000).unwrap();
        p.write_bool(true).unwrap();
        p.write_bool(false).unwrap();

        let mut r = Parcel::from_bytes(p.into_bytes());
        assert_eq!(r.read_i32().unwrap(), -42);
        assert_eq!(r.read_u32().unwrap(), 7);
        assert_eq!(r.read_i64().unwrap(), -9_000_000_000);
        assert_eq!(r.read_u64().unwrap(), 9_000_000_000);
        assert!(r.read_bool().unwrap());
        assert!(!r.read_bool().unwrap());
    }

    #[test]
    fn byte_array_roundtrip_including_empty() {
        for payload in [&b""[..], b"hi", b"a longer payload with more bytes in it"] {
            let mut p = Parcel::new();
            p.write_byte_array_with_length(payload).unwrap();
            let mut r = Parcel::from_bytes(p.into_bytes());
            assert_eq!(r.read_byte_array().unwrap(), payload);
        }
    }

    #[test]
    fn string_roundtrip() {
        let mut p = Parcel::new();
        p.write_string("echo").unwrap();
        let mut r = Parcel::from_bytes(p.into_bytes());
        assert_eq!(r.read_string().unwrap(), "echo");
    }

    #[test]
    fn empty_byte_array_writes_only_length() {
        let mut p = Parcel::new();
        p.write_byte_array_with_length(&[]).unwrap();
        assert_eq!(p.data_size(), 4);
    }

    #[test]
    fn read_past_end_fails() {
        let mut r = Parcel::from_bytes(vec![1, 2]);
        assert!(r.read_i32().is_err());
    }

    #[test]
    fn truncated_byte_array_length_fails() {
        let mut p = Parcel::new();
        p.write_u32(100).unwrap();
        let mut r = Parcel::from_bytes(p.into_bytes());
        assert!(r.read_byte_array().is_err());
    }
}
