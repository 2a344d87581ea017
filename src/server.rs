//! Server side: request dispatch onto a filesystem backend.

use alloc::vec::Vec;
use log::{debug, warn};

use crate::attrs::Attrs;
use crate::error::Result;
use crate::message::{Packet, dump_hex};
use crate::protocol::*;
use crate::transport::Framer;

/// Sink for the one reply a backend method produces.
///
/// Every backend method ends with exactly one call here, except that
/// `reply_name_count(n)` is followed by `n` calls to `reply_full_name`.
pub trait ReplyBuilder {
    fn reply_ok(&mut self);
    fn reply_error(&mut self, code: u32, msg: &str);
    fn reply_simple_name(&mut self, name: &str);
    fn reply_name_count(&mut self, count: u32);
    fn reply_full_name(&mut self, name: &str, longname: &str, attrs: &Attrs);
    fn reply_handle(&mut self, handle: &[u8]);
    fn reply_data(&mut self, data: &[u8]);
    fn reply_attrs(&mut self, attrs: &Attrs);
}

/// Filesystem operations answering SFTP requests.
pub trait SftpServer {
    /// Reply with `reply_error` or `reply_simple_name`.
    fn realpath(&mut self, reply: &mut dyn ReplyBuilder, path: &str);
    /// Reply with `reply_error` or `reply_handle`.
    fn open(&mut self, reply: &mut dyn ReplyBuilder, path: &str, flags: u32, attrs: Attrs);
    /// Reply with `reply_error` or `reply_handle`.
    fn opendir(&mut self, reply: &mut dyn ReplyBuilder, path: &str);
    fn close(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8]);
    fn mkdir(&mut self, reply: &mut dyn ReplyBuilder, path: &str, attrs: Attrs);
    fn rmdir(&mut self, reply: &mut dyn ReplyBuilder, path: &str);
    fn remove(&mut self, reply: &mut dyn ReplyBuilder, path: &str);
    fn rename(&mut self, reply: &mut dyn ReplyBuilder, src: &str, dst: &str);
    /// Reply with `reply_error` or `reply_attrs`.
    fn stat(&mut self, reply: &mut dyn ReplyBuilder, path: &str, follow_symlinks: bool);
    /// Reply with `reply_error` or `reply_attrs`.
    fn fstat(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8]);
    fn setstat(&mut self, reply: &mut dyn ReplyBuilder, path: &str, attrs: Attrs);
    fn fsetstat(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8], attrs: Attrs);
    /// Reply with `reply_error` or `reply_data`.
    fn read(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8], offset: u64, length: u32);
    fn write(&mut self, reply: &mut dyn ReplyBuilder, handle: &[u8], offset: u64, data: &[u8]);
    /// Reply with `reply_error`, or `reply_name_count` then that many `reply_full_name`.
    fn readdir(
        &mut self,
        reply: &mut dyn ReplyBuilder,
        handle: &[u8],
        max_entries: usize,
        omit_longname: bool,
    );
}

/// Reply builder that serializes straight into a reply packet.
pub struct PacketReplyBuilder {
    id: u32,
    pkt: Packet,
    replied: bool,
    names_left: u32,
}

impl PacketReplyBuilder {
    /// Start a reply to request `id`; the type byte is set by the reply call.
    pub fn new(id: u32) -> Self {
        let mut pkt = Packet::new(0);
        pkt.put_u32(id);
        Self {
            id,
            pkt,
            replied: false,
            names_left: 0,
        }
    }

    pub fn has_replied(&self) -> bool {
        self.replied
    }

    /// The finished reply packet.
    ///
    /// A backend that never replied, or announced more names than it
    /// supplied, gets a FAILURE status instead.
    pub fn finish(mut self) -> Packet {
        if !self.replied {
            warn!("backend produced no reply; sending FAILURE");
            self.reply_error(SSH_FX_FAILURE, "no reply from server backend");
        }
        if self.names_left != 0 {
            warn!("NAME reply is {} entries short; sending FAILURE", self.names_left);
            let mut failed = Self::new(self.id);
            failed.reply_error(SSH_FX_FAILURE, "incomplete name list");
            return failed.pkt;
        }
        self.pkt
    }

    fn begin(&mut self, kind: u8) -> bool {
        if self.replied {
            warn!("ignoring second reply of type {}", kind);
            return false;
        }
        self.replied = true;
        self.pkt.set_kind(kind);
        true
    }
}

impl ReplyBuilder for PacketReplyBuilder {
    fn reply_ok(&mut self) {
        if self.begin(SSH_FXP_STATUS) {
            self.pkt.put_u32(SSH_FX_OK);
            self.pkt.put_str("success");
            self.pkt.put_str("en");
        }
    }

    fn reply_error(&mut self, code: u32, msg: &str) {
        if self.begin(SSH_FXP_STATUS) {
            self.pkt.put_u32(code);
            self.pkt.put_str(msg);
            self.pkt.put_str("en");
        }
    }

    fn reply_simple_name(&mut self, name: &str) {
        if self.begin(SSH_FXP_NAME) {
            self.pkt.put_u32(1);
            self.pkt.put_str(name);
            self.pkt.put_str(name);
            self.pkt.put_attrs(&Attrs::NONE);
        }
    }

    fn reply_name_count(&mut self, count: u32) {
        if self.begin(SSH_FXP_NAME) {
            self.pkt.put_u32(count);
            self.names_left = count;
        }
    }

    fn reply_full_name(&mut self, name: &str, longname: &str, attrs: &Attrs) {
        if self.names_left == 0 {
            warn!("dropping name {:?} beyond announced count", name);
            return;
        }
        self.names_left -= 1;
        self.pkt.put_str(name);
        self.pkt.put_str(longname);
        self.pkt.put_attrs(attrs);
    }

    fn reply_handle(&mut self, handle: &[u8]) {
        if self.begin(SSH_FXP_HANDLE) {
            self.pkt.put_string(handle);
        }
    }

    fn reply_data(&mut self, data: &[u8]) {
        if self.begin(SSH_FXP_DATA) {
            self.pkt.put_string(data);
        }
    }

    fn reply_attrs(&mut self, attrs: &Attrs) {
        if self.begin(SSH_FXP_ATTRS) {
            self.pkt.put_attrs(attrs);
        }
    }
}

/// Answer one request packet using `srv`.
///
/// Only a request whose id cannot be read fails; everything else,
/// including undecodable bodies and unknown opcodes, gets a STATUS reply.
pub fn handle_request(srv: &mut dyn SftpServer, req: &Packet) -> Result<Packet> {
    if req.kind() == SSH_FXP_INIT {
        // Only v3 is spoken, so the client's version does not matter.
        let mut reply = Packet::new(SSH_FXP_VERSION);
        reply.put_u32(SFTP_PROTO_VERSION);
        return Ok(reply);
    }

    let id = req.get_u32().map_err(|err| {
        warn!("request without id: {} ({})", err, dump_hex(req.rest()));
        err
    })?;
    let mut rb = PacketReplyBuilder::new(id);
    debug!("request {} type {}", id, req.kind());

    if let Err(err) = dispatch(srv, &mut rb, req) {
        warn!("undecodable request {} type {}: {}", id, req.kind(), err);
        rb.reply_error(SSH_FX_BAD_MESSAGE, "unable to decode request");
    }
    Ok(rb.finish())
}

fn dispatch(srv: &mut dyn SftpServer, rb: &mut dyn ReplyBuilder, req: &Packet) -> Result<()> {
    match req.kind() {
        SSH_FXP_REALPATH => {
            let path = req.get_str()?;
            srv.realpath(rb, path);
        }
        SSH_FXP_OPEN => {
            let path = req.get_str()?;
            let flags = req.get_u32()?;
            let attrs = req.get_attrs()?;
            srv.open(rb, path, flags, attrs);
        }
        SSH_FXP_OPENDIR => {
            let path = req.get_str()?;
            srv.opendir(rb, path);
        }
        SSH_FXP_CLOSE => {
            let handle = req.get_string()?;
            srv.close(rb, handle);
        }
        SSH_FXP_MKDIR => {
            let path = req.get_str()?;
            let attrs = req.get_attrs()?;
            srv.mkdir(rb, path, attrs);
        }
        SSH_FXP_RMDIR => {
            let path = req.get_str()?;
            srv.rmdir(rb, path);
        }
        SSH_FXP_REMOVE => {
            let path = req.get_str()?;
            srv.remove(rb, path);
        }
        SSH_FXP_RENAME => {
            let src = req.get_str()?;
            let dst = req.get_str()?;
            srv.rename(rb, src, dst);
        }
        SSH_FXP_STAT => {
            let path = req.get_str()?;
            srv.stat(rb, path, true);
        }
        SSH_FXP_LSTAT => {
            let path = req.get_str()?;
            srv.stat(rb, path, false);
        }
        SSH_FXP_FSTAT => {
            let handle = req.get_string()?;
            srv.fstat(rb, handle);
        }
        SSH_FXP_SETSTAT => {
            let path = req.get_str()?;
            let attrs = req.get_attrs()?;
            srv.setstat(rb, path, attrs);
        }
        SSH_FXP_FSETSTAT => {
            let handle = req.get_string()?;
            let attrs = req.get_attrs()?;
            srv.fsetstat(rb, handle, attrs);
        }
        SSH_FXP_READ => {
            let handle = req.get_string()?;
            let offset = req.get_u64()?;
            let length = req.get_u32()?;
            srv.read(rb, handle, offset, length);
        }
        SSH_FXP_WRITE => {
            let handle = req.get_string()?;
            let offset = req.get_u64()?;
            let data = req.get_string()?;
            srv.write(rb, handle, offset, data);
        }
        SSH_FXP_READDIR => {
            let handle = req.get_string()?;
            srv.readdir(rb, handle, usize::MAX, false);
        }
        other => {
            debug!("unsupported request type {}", other);
            rb.reply_error(SSH_FX_OP_UNSUPPORTED, "unrecognised request type");
        }
    }
    Ok(())
}

/// Server end of one channel: bytes in, framed replies out.
pub struct ServerConnection<S> {
    framer: Framer,
    backend: S,
}

impl<S: SftpServer> ServerConnection<S> {
    pub fn new(backend: S) -> Self {
        Self::with_max_packet_len(backend, DEFAULT_MAX_PACKET_LEN)
    }

    pub fn with_max_packet_len(backend: S, max_packet_len: u32) -> Self {
        Self {
            framer: Framer::new(max_packet_len),
            backend,
        }
    }

    /// Feed stream bytes and collect the wire bytes of every reply they produce.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.framer.push(data)?;
        let mut out = Vec::new();
        while let Some(req) = self.framer.next_packet() {
            let reply = handle_request(&mut self.backend, &req)?;
            out.extend_from_slice(&reply.into_bytes());
        }
        Ok(out)
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut S {
        &mut self.backend
    }
}

impl<S> core::fmt::Debug for ServerConnection<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("idle", &self.framer.is_idle())
            .finish()
    }
}
