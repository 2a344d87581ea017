//! Packet builder and decoding helpers for SFTP packets.

use alloc::format;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::Cell;

use crate::attrs::Attrs;
use crate::error::{Error, Result};

/// One SFTP packet: `uint32 length | uint8 type | payload`.
///
/// A send packet is built with [`Packet::new`] and the `put_*` methods,
/// then framed with [`Packet::send_prepare`]. A receive packet is
/// allocated with [`Packet::recv_prepare`] once the length is known,
/// filled through [`Packet::body_mut`] and armed with
/// [`Packet::recv_finish`]; fields then come back out through `get_*` in
/// the order they were written.
pub struct Packet {
    buf: Vec<u8>,
    kind: u8,
    pos: Cell<usize>,
}

impl Packet {
    /// Start a send packet of the given type with a placeholder length.
    pub fn new(kind: u8) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(kind);
        Self {
            buf,
            kind,
            pos: Cell::new(5),
        }
    }

    /// Allocate a receive packet for a frame whose length prefix is `length`.
    pub fn recv_prepare(length: u32) -> Self {
        let mut buf = vec![0u8; length as usize + 4];
        buf[0..4].copy_from_slice(&length.to_be_bytes());
        Self {
            buf,
            kind: 0,
            pos: Cell::new(4),
        }
    }

    /// Bytes after the length prefix, to be filled by the receiver.
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[4..]
    }

    /// Extract the type byte and arm the read cursor after it.
    pub fn recv_finish(&mut self) -> Result<()> {
        if self.buf.len() < 5 {
            return Err(Error::Malformed("packet has no type byte"));
        }
        self.kind = self.buf[4];
        self.pos.set(5);
        Ok(())
    }

    /// Parse one complete frame from `wire`, which must hold exactly one packet.
    pub fn from_wire(wire: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let length = read_u32(wire, &mut offset)?;
        if wire.len() - 4 != length as usize {
            return Err(Error::Malformed("length prefix does not match frame"));
        }
        let mut pkt = Self::recv_prepare(length);
        pkt.body_mut().copy_from_slice(&wire[4..]);
        pkt.recv_finish()?;
        Ok(pkt)
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub(crate) fn set_kind(&mut self, kind: u8) {
        self.kind = kind;
        self.buf[4] = kind;
    }

    /// Payload length, excluding the length prefix itself.
    pub fn len(&self) -> usize {
        self.buf.len() - 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes not yet consumed by `get_*`.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos.get()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a length-prefixed byte string.
    pub fn put_string(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_string(value.as_bytes());
    }

    pub fn put_attrs(&mut self, attrs: &Attrs) {
        attrs.encode(self);
    }

    /// Fix up the length prefix and return the wire bytes.
    pub fn send_prepare(&mut self) -> &[u8] {
        let size = (self.buf.len() - 4) as u32;
        self.buf[0..4].copy_from_slice(&size.to_be_bytes());
        &self.buf
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.send_prepare();
        self.buf
    }

    pub fn get_u8(&self) -> Result<u8> {
        self.with_cursor(|buf, offset| read_u8(buf, offset))
    }

    pub fn get_bool(&self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&self) -> Result<u32> {
        self.with_cursor(|buf, offset| read_u32(buf, offset))
    }

    pub fn get_u64(&self) -> Result<u64> {
        self.with_cursor(|buf, offset| read_u64(buf, offset))
    }

    /// Borrow the next length-prefixed string out of the packet buffer.
    pub fn get_string(&self) -> Result<&[u8]> {
        self.with_cursor(|buf, offset| read_string(buf, offset))
    }

    pub fn get_str(&self) -> Result<&str> {
        core::str::from_utf8(self.get_string()?).map_err(|_| Error::Malformed("invalid utf8"))
    }

    pub fn get_attrs(&self) -> Result<Attrs> {
        Attrs::decode(self)
    }

    /// Request id of a reply or request, read without moving the cursor.
    pub fn peek_u32(&self) -> Result<u32> {
        let mut offset = self.pos.get();
        read_u32(&self.buf, &mut offset)
    }

    /// Unread bytes, for diagnostics.
    pub fn rest(&self) -> &[u8] {
        &self.buf[self.pos.get()..]
    }

    fn with_cursor<'a, T>(
        &'a self,
        read: impl FnOnce(&'a [u8], &mut usize) -> Result<T>,
    ) -> Result<T> {
        let mut offset = self.pos.get();
        let value = read(self.buf.as_slice(), &mut offset)?;
        self.pos.set(offset);
        Ok(value)
    }
}

impl core::fmt::Debug for Packet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("pos", &self.pos.get())
            .finish()
    }
}

pub(crate) fn read_u8(buf: &[u8], offset: &mut usize) -> Result<u8> {
    let bytes = take(buf, offset, 1)?;
    Ok(bytes[0])
}

pub(crate) fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    let bytes = take(buf, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn read_u64(buf: &[u8], offset: &mut usize) -> Result<u64> {
    let bytes = take(buf, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(raw))
}

pub(crate) fn read_string<'a>(buf: &'a [u8], offset: &mut usize) -> Result<&'a [u8]> {
    let mut cursor = *offset;
    let len = read_u32(buf, &mut cursor)? as usize;
    let bytes = take(buf, &mut cursor, len)?;
    *offset = cursor;
    Ok(bytes)
}

fn take<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or(Error::Malformed("short buffer"))?;
    if end > buf.len() {
        return Err(Error::Malformed("short buffer"));
    }
    let bytes = &buf[*offset..end];
    *offset = end;
    Ok(bytes)
}

pub(crate) fn dump_hex(buf: &[u8]) -> String {
    let mut out = String::new();
    for (idx, byte) in buf.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
