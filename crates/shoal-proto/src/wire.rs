//! Payload encoding primitives
//!
//! All integers are big-endian.  Strings and blobs are `u32` length
//! prefixed; a zero-length string encodes an absent optional string.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("frame payload truncated")]
    Truncated,

    #[error("invalid UTF-8 in wire string")]
    Utf8,

    #[error("unknown command {0:#06x}")]
    UnknownCommand(u16),

    #[error("payload of {0} bytes exceeds the frame limit")]
    Oversize(u32),

    #[error("malformed payload: {0}")]
    Malformed(&'static str),
}

/// Incremental writer for a frame payload.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_str(&mut self, s: &str) {
        self.buf.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
    }

    pub fn put_blob(&mut self, b: &[u8]) {
        self.buf.put_u32(b.len() as u32);
        self.buf.put_slice(b);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Incremental reader over a frame payload.
#[derive(Debug)]
pub struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            Err(WireError::Truncated)
        } else {
            Ok(())
        }
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    pub fn i64(&mut self) -> Result<i64, WireError> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn str(&mut self) -> Result<String, WireError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, rest) = self.buf.split_at(len);
        let s = std::str::from_utf8(head).map_err(|_| WireError::Utf8)?.to_string();
        self.buf = rest;
        Ok(s)
    }

    pub fn blob(&mut self) -> Result<Bytes, WireError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let (head, rest) = self.buf.split_at(len);
        let b = Bytes::copy_from_slice(head);
        self.buf = rest;
        Ok(b)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut w = PayloadWriter::new();
        w.put_u64(0xdead_beef_0000_0001);
        w.put_i64(-42);
        w.put_i32(7);
        w.put_u8(1);
        w.put_str("hello");
        w.put_blob(&[1, 2, 3]);
        let payload = w.finish();

        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.u64().unwrap(), 0xdead_beef_0000_0001);
        assert_eq!(r.i64().unwrap(), -42);
        assert_eq!(r.i32().unwrap(), 7);
        assert_eq!(r.u8().unwrap(), 1);
        assert_eq!(r.str().unwrap(), "hello");
        assert_eq!(r.blob().unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_network_byte_order() {
        let mut w = PayloadWriter::new();
        w.put_u32(0x0102_0304);
        assert_eq!(w.finish().as_ref(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_truncated() {
        let mut r = PayloadReader::new(&[0, 0, 0]);
        assert_eq!(r.u32(), Err(WireError::Truncated));

        // declared string length longer than the buffer
        let mut w = PayloadWriter::new();
        w.put_u32(10);
        let payload = w.finish();
        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.str(), Err(WireError::Truncated));
    }

    #[test]
    fn test_empty_string_is_absent() {
        let mut w = PayloadWriter::new();
        w.put_str("");
        let payload = w.finish();
        let mut r = PayloadReader::new(&payload);
        assert_eq!(r.str().unwrap(), "");
    }
}
