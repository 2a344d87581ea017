//! Client session: request ids, per-operation send/recv pairs and reply matching.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::any::Any;
use log::{debug, warn};

use crate::attrs::Attrs;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{Packet, dump_hex};
use crate::parse::{NameEntry, parse_names, parse_status};
use crate::protocol::*;
use crate::transport::{Framer, Transport, poll_packet};

/// Opaque server-issued token for an open file or directory.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Handle(Vec<u8>);

impl Handle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl core::fmt::Debug for Handle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Handle({})", dump_hex(&self.0))
    }
}

/// One outstanding operation, returned by a `*_send` call.
///
/// Hand it to [`SftpSession::register`] before its reply can be matched;
/// [`SftpSession::find_request`] gives it back once the reply arrives.
pub struct Request {
    id: u32,
    kind: u8,
    read_len: u32,
    userdata: Option<Box<dyn Any>>,
}

impl Request {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Opcode of the request that was sent.
    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn set_userdata<T: Any>(&mut self, data: T) {
        self.userdata = Some(Box::new(data));
    }

    pub fn userdata<T: Any>(&self) -> Option<&T> {
        self.userdata.as_ref()?.downcast_ref()
    }

    pub fn take_userdata<T: Any>(&mut self) -> Option<T> {
        let data = self.userdata.take()?;
        match data.downcast::<T>() {
            Ok(data) => Some(*data),
            Err(data) => {
                self.userdata = Some(data);
                None
            }
        }
    }
}

impl core::fmt::Debug for Request {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("userdata", &self.userdata.is_some())
            .finish()
    }
}

enum Slot {
    /// Sent, caller still holds the Request.
    Issued,
    Registered(Request),
    /// Reply no longer wanted.
    Abandoned,
}

/// Client side of one SFTP channel.
pub struct SftpSession {
    config: Config,
    next_id: u32,
    pending: BTreeMap<u32, Slot>,
    framer: Framer,
    version: Option<u32>,
    transport: Box<dyn Transport>,
}

impl SftpSession {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self::with_config(transport, Config::default())
    }

    pub fn with_config(transport: Box<dyn Transport>, config: Config) -> Self {
        Self {
            config,
            next_id: config.first_request_id,
            pending: BTreeMap::new(),
            framer: Framer::new(config.max_packet_len),
            version: None,
            transport,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Protocol version reported by the server, once negotiated.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Number of requests issued and not yet retired or abandoned.
    pub fn outstanding(&self) -> usize {
        self.pending
            .values()
            .filter(|slot| !matches!(slot, Slot::Abandoned))
            .count()
    }

    pub fn send_backlog(&self) -> usize {
        self.transport.send_backlog()
    }

    /// Send INIT. The reply carries no request id.
    pub fn init_send(&mut self) -> Result<()> {
        let mut msg = Packet::new(SSH_FXP_INIT);
        msg.put_u32(SFTP_PROTO_VERSION);
        self.transport.send(msg.send_prepare())
    }

    pub fn init_recv(&mut self, pkt: Packet) -> Result<u32> {
        if pkt.kind() != SSH_FXP_VERSION {
            return Err(Error::Protocol(String::from("did not receive FXP_VERSION")));
        }
        let remote = pkt.get_u32().map_err(|err| {
            warn!("VERSION parse error: {} ({})", err, dump_hex(pkt.rest()));
            Error::Malformed("malformed FXP_VERSION packet")
        })?;
        if remote > SFTP_PROTO_VERSION {
            return Err(Error::Protocol(String::from(
                "remote protocol is more advanced than we support",
            )));
        }
        // Extension pairs may follow; none are acted on.
        while pkt.remaining() > 0 {
            let name = pkt.get_str().unwrap_or("?");
            debug!("server extension {}", name);
            if pkt.get_string().is_err() {
                break;
            }
        }
        debug!("SFTP version {} negotiated", remote);
        self.version = Some(remote);
        Ok(remote)
    }

    pub fn realpath_send(&mut self, path: &str) -> Result<Request> {
        self.request(SSH_FXP_REALPATH, |msg| msg.put_str(path))
    }

    pub fn realpath_recv(&self, pkt: Packet, req: Request) -> Result<String> {
        expect_kind(&req, SSH_FXP_REALPATH)?;
        skip_id(&pkt)?;
        match pkt.kind() {
            SSH_FXP_NAME => {
                let count = pkt.get_u32()?;
                if count != 1 {
                    return Err(Error::Protocol(String::from(
                        "REALPATH did not return name count of 1",
                    )));
                }
                Ok(pkt.get_str()?.to_string())
            }
            _ => Err(unexpected_reply(&pkt, "FXP_NAME")),
        }
    }

    pub fn open_send(&mut self, path: &str, flags: u32, attrs: &Attrs) -> Result<Request> {
        self.request(SSH_FXP_OPEN, |msg| {
            msg.put_str(path);
            msg.put_u32(flags);
            msg.put_attrs(attrs);
        })
    }

    pub fn open_recv(&self, pkt: Packet, req: Request) -> Result<Handle> {
        expect_kind(&req, SSH_FXP_OPEN)?;
        handle_reply(&pkt)
    }

    pub fn opendir_send(&mut self, path: &str) -> Result<Request> {
        self.request(SSH_FXP_OPENDIR, |msg| msg.put_str(path))
    }

    pub fn opendir_recv(&self, pkt: Packet, req: Request) -> Result<Handle> {
        expect_kind(&req, SSH_FXP_OPENDIR)?;
        handle_reply(&pkt)
    }

    /// Close a handle. The handle is spent whatever the outcome.
    pub fn close_send(&mut self, handle: Handle) -> Result<Request> {
        self.request(SSH_FXP_CLOSE, |msg| msg.put_string(handle.as_bytes()))
    }

    pub fn close_recv(&self, pkt: Packet, req: Request) -> Result<()> {
        expect_kind(&req, SSH_FXP_CLOSE)?;
        status_reply(&pkt)
    }

    pub fn mkdir_send(&mut self, path: &str, attrs: &Attrs) -> Result<Request> {
        self.request(SSH_FXP_MKDIR, |msg| {
            msg.put_str(path);
            msg.put_attrs(attrs);
        })
    }

    pub fn mkdir_recv(&self, pkt: Packet, req: Request) -> Result<()> {
        expect_kind(&req, SSH_FXP_MKDIR)?;
        status_reply(&pkt)
    }

    pub fn rmdir_send(&mut self, path: &str) -> Result<Request> {
        self.request(SSH_FXP_RMDIR, |msg| msg.put_str(path))
    }

    pub fn rmdir_recv(&self, pkt: Packet, req: Request) -> Result<()> {
        expect_kind(&req, SSH_FXP_RMDIR)?;
        status_reply(&pkt)
    }

    pub fn remove_send(&mut self, path: &str) -> Result<Request> {
        self.request(SSH_FXP_REMOVE, |msg| msg.put_str(path))
    }

    pub fn remove_recv(&self, pkt: Packet, req: Request) -> Result<()> {
        expect_kind(&req, SSH_FXP_REMOVE)?;
        status_reply(&pkt)
    }

    pub fn rename_send(&mut self, src: &str, dst: &str) -> Result<Request> {
        self.request(SSH_FXP_RENAME, |msg| {
            msg.put_str(src);
            msg.put_str(dst);
        })
    }

    pub fn rename_recv(&self, pkt: Packet, req: Request) -> Result<()> {
        expect_kind(&req, SSH_FXP_RENAME)?;
        status_reply(&pkt)
    }

    pub fn stat_send(&mut self, path: &str) -> Result<Request> {
        self.request(SSH_FXP_STAT, |msg| msg.put_str(path))
    }

    pub fn stat_recv(&self, pkt: Packet, req: Request) -> Result<Attrs> {
        expect_kind(&req, SSH_FXP_STAT)?;
        attrs_reply(&pkt)
    }

    /// Like `stat_send`, without following a final symlink.
    pub fn lstat_send(&mut self, path: &str) -> Result<Request> {
        self.request(SSH_FXP_LSTAT, |msg| msg.put_str(path))
    }

    pub fn lstat_recv(&self, pkt: Packet, req: Request) -> Result<Attrs> {
        expect_kind(&req, SSH_FXP_LSTAT)?;
        attrs_reply(&pkt)
    }

    pub fn fstat_send(&mut self, handle: &Handle) -> Result<Request> {
        self.request(SSH_FXP_FSTAT, |msg| msg.put_string(handle.as_bytes()))
    }

    pub fn fstat_recv(&self, pkt: Packet, req: Request) -> Result<Attrs> {
        expect_kind(&req, SSH_FXP_FSTAT)?;
        attrs_reply(&pkt)
    }

    pub fn setstat_send(&mut self, path: &str, attrs: &Attrs) -> Result<Request> {
        self.request(SSH_FXP_SETSTAT, |msg| {
            msg.put_str(path);
            msg.put_attrs(attrs);
        })
    }

    pub fn setstat_recv(&self, pkt: Packet, req: Request) -> Result<()> {
        expect_kind(&req, SSH_FXP_SETSTAT)?;
        status_reply(&pkt)
    }

    pub fn fsetstat_send(&mut self, handle: &Handle, attrs: &Attrs) -> Result<Request> {
        self.request(SSH_FXP_FSETSTAT, |msg| {
            msg.put_string(handle.as_bytes());
            msg.put_attrs(attrs);
        })
    }

    pub fn fsetstat_recv(&self, pkt: Packet, req: Request) -> Result<()> {
        expect_kind(&req, SSH_FXP_FSETSTAT)?;
        status_reply(&pkt)
    }

    pub fn read_send(&mut self, handle: &Handle, offset: u64, len: u32) -> Result<Request> {
        let mut req = self.request(SSH_FXP_READ, |msg| {
            msg.put_string(handle.as_bytes());
            msg.put_u64(offset);
            msg.put_u32(len);
        })?;
        req.read_len = len;
        Ok(req)
    }

    /// Data returned by a READ. End of file comes back as an EOF status error.
    pub fn read_recv(&self, pkt: Packet, req: Request) -> Result<Vec<u8>> {
        expect_kind(&req, SSH_FXP_READ)?;
        skip_id(&pkt)?;
        match pkt.kind() {
            SSH_FXP_DATA => {
                let data = pkt.get_string()?;
                if data.len() > req.read_len as usize {
                    return Err(Error::Protocol(String::from(
                        "READ returned more bytes than requested",
                    )));
                }
                Ok(data.to_vec())
            }
            SSH_FXP_STATUS => Err(status_failure(&pkt)),
            _ => Err(unexpected_reply(&pkt, "FXP_DATA")),
        }
    }

    pub fn write_send(&mut self, handle: &Handle, offset: u64, data: &[u8]) -> Result<Request> {
        self.request(SSH_FXP_WRITE, |msg| {
            msg.put_string(handle.as_bytes());
            msg.put_u64(offset);
            msg.put_string(data);
        })
    }

    pub fn write_recv(&self, pkt: Packet, req: Request) -> Result<()> {
        expect_kind(&req, SSH_FXP_WRITE)?;
        status_reply(&pkt)
    }

    pub fn readdir_send(&mut self, handle: &Handle) -> Result<Request> {
        self.request(SSH_FXP_READDIR, |msg| msg.put_string(handle.as_bytes()))
    }

    /// One batch of directory entries; the end of the listing is an EOF status error.
    pub fn readdir_recv(&self, pkt: Packet, req: Request) -> Result<Vec<NameEntry>> {
        expect_kind(&req, SSH_FXP_READDIR)?;
        skip_id(&pkt)?;
        match pkt.kind() {
            SSH_FXP_NAME => parse_names(&pkt),
            SSH_FXP_STATUS => Err(status_failure(&pkt)),
            _ => Err(unexpected_reply(&pkt, "FXP_NAME")),
        }
    }

    /// Make `req` eligible for reply matching.
    pub fn register(&mut self, req: Request) {
        debug!("register request {} (type {})", req.id, req.kind);
        self.pending.insert(req.id, Slot::Registered(req));
    }

    /// Retire and return the request that `pkt` answers.
    ///
    /// Returns `Ok(None)` for a late reply to an abandoned request, which
    /// is dropped. Any other unmatched id is a protocol violation.
    pub fn find_request(&mut self, pkt: &Packet) -> Result<Option<Request>> {
        let id = pkt
            .peek_u32()
            .map_err(|_| Error::Malformed("did not receive a valid SFTP packet"))?;
        match self.pending.remove(&id) {
            Some(Slot::Registered(req)) => {
                debug!("reply for request {} (type {})", id, pkt.kind());
                Ok(Some(req))
            }
            Some(Slot::Abandoned) => {
                debug!("discarding late reply for abandoned request {}", id);
                Ok(None)
            }
            Some(Slot::Issued) => {
                self.pending.insert(id, Slot::Issued);
                Err(Error::Protocol(format!(
                    "reply for unregistered request {}",
                    id
                )))
            }
            None => Err(Error::Protocol(format!("request ID mismatch: {}", id))),
        }
    }

    /// Drop interest in an outstanding request; its reply will be discarded.
    pub fn abandon(&mut self, id: u32) {
        if let Some(slot) = self.pending.get_mut(&id) {
            *slot = Slot::Abandoned;
        }
    }

    /// Forget every outstanding request, as on teardown.
    pub fn cleanup_requests(&mut self) {
        if !self.pending.is_empty() {
            debug!("dropping {} outstanding requests", self.pending.len());
        }
        self.pending.clear();
    }

    /// Next complete packet from the transport, without blocking.
    ///
    /// The reply id is left unread so it can be passed to
    /// [`find_request`](Self::find_request); the `*_recv` methods skip it.
    pub fn recv_packet(&mut self) -> Result<Option<Packet>> {
        poll_packet(self.transport.as_mut(), &mut self.framer)
    }

    /// Register `req` and poll until its reply arrives.
    ///
    /// Meant for transports whose `recv` blocks; with a non-blocking
    /// transport this spins. Any other reply arriving first is an error.
    pub fn wait_for_reply(&mut self, req: Request) -> Result<(Packet, Request)> {
        let id = req.id;
        self.register(req);
        loop {
            let Some(pkt) = self.recv_packet()? else {
                continue;
            };
            return match self.find_request(&pkt)? {
                Some(found) if found.id == id => Ok((pkt, found)),
                Some(found) => Err(Error::Protocol(format!(
                    "expected reply to {}, got reply to {}",
                    id, found.id
                ))),
                None => continue,
            };
        }
    }

    /// Blocking INIT/VERSION exchange.
    pub fn init(&mut self) -> Result<u32> {
        self.init_send()?;
        loop {
            if let Some(pkt) = self.recv_packet()? {
                return self.init_recv(pkt);
            }
        }
    }

    pub fn realpath(&mut self, path: &str) -> Result<String> {
        let req = self.realpath_send(path)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.realpath_recv(pkt, req)
    }

    pub fn open(&mut self, path: &str, flags: u32, attrs: &Attrs) -> Result<Handle> {
        let req = self.open_send(path, flags, attrs)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.open_recv(pkt, req)
    }

    pub fn opendir(&mut self, path: &str) -> Result<Handle> {
        let req = self.opendir_send(path)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.opendir_recv(pkt, req)
    }

    pub fn close(&mut self, handle: Handle) -> Result<()> {
        let req = self.close_send(handle)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.close_recv(pkt, req)
    }

    pub fn mkdir(&mut self, path: &str, attrs: &Attrs) -> Result<()> {
        let req = self.mkdir_send(path, attrs)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.mkdir_recv(pkt, req)
    }

    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        let req = self.rmdir_send(path)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.rmdir_recv(pkt, req)
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        let req = self.remove_send(path)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.remove_recv(pkt, req)
    }

    pub fn rename(&mut self, src: &str, dst: &str) -> Result<()> {
        let req = self.rename_send(src, dst)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.rename_recv(pkt, req)
    }

    pub fn stat(&mut self, path: &str) -> Result<Attrs> {
        let req = self.stat_send(path)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.stat_recv(pkt, req)
    }

    pub fn lstat(&mut self, path: &str) -> Result<Attrs> {
        let req = self.lstat_send(path)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.lstat_recv(pkt, req)
    }

    pub fn fstat(&mut self, handle: &Handle) -> Result<Attrs> {
        let req = self.fstat_send(handle)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.fstat_recv(pkt, req)
    }

    pub fn setstat(&mut self, path: &str, attrs: &Attrs) -> Result<()> {
        let req = self.setstat_send(path, attrs)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.setstat_recv(pkt, req)
    }

    pub fn fsetstat(&mut self, handle: &Handle, attrs: &Attrs) -> Result<()> {
        let req = self.fsetstat_send(handle, attrs)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.fsetstat_recv(pkt, req)
    }

    pub fn read(&mut self, handle: &Handle, offset: u64, len: u32) -> Result<Vec<u8>> {
        let req = self.read_send(handle, offset, len)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.read_recv(pkt, req)
    }

    pub fn write(&mut self, handle: &Handle, offset: u64, data: &[u8]) -> Result<()> {
        let req = self.write_send(handle, offset, data)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.write_recv(pkt, req)
    }

    pub fn readdir(&mut self, handle: &Handle) -> Result<Vec<NameEntry>> {
        let req = self.readdir_send(handle)?;
        let (pkt, req) = self.wait_for_reply(req)?;
        self.readdir_recv(pkt, req)
    }

    /// List directory entries at the provided path.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<NameEntry>> {
        let handle = self.opendir(path)?;
        let mut names = Vec::new();
        let listed = loop {
            match self.readdir(&handle) {
                Ok(batch) if batch.is_empty() => break Ok(()),
                Ok(batch) => names.extend(batch),
                Err(err) if err.is_eof() => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        let closed = self.close(handle);
        listed?;
        closed?;
        Ok(names)
    }

    fn request(&mut self, kind: u8, body: impl FnOnce(&mut Packet)) -> Result<Request> {
        let id = self.alloc_id();
        let mut msg = Packet::new(kind);
        msg.put_u32(id);
        body(&mut msg);
        self.transport.send(msg.send_prepare())?;
        self.pending.insert(id, Slot::Issued);
        Ok(Request {
            id,
            kind,
            read_len: 0,
            userdata: None,
        })
    }

    fn alloc_id(&mut self) -> u32 {
        let mut id = self.next_id;
        while self.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);
        id
    }
}

fn expect_kind(req: &Request, kind: u8) -> Result<()> {
    if req.kind != kind {
        return Err(Error::Protocol(format!(
            "request {} is type {}, not {}",
            req.id, req.kind, kind
        )));
    }
    Ok(())
}

/// Skip the reply id; `find_request` only peeks at it.
fn skip_id(pkt: &Packet) -> Result<()> {
    pkt.get_u32().map(|_| ())
}

fn status_failure(pkt: &Packet) -> Error {
    match parse_status(pkt) {
        Ok(()) => crate::error::StatusError::new(SSH_FX_OK, String::new()).into(),
        Err(err) => err,
    }
}

fn unexpected_reply(pkt: &Packet, wanted: &str) -> Error {
    if pkt.kind() == SSH_FXP_STATUS {
        return status_failure(pkt);
    }
    warn!("expected {}, got type {}: {}", wanted, pkt.kind(), dump_hex(pkt.rest()));
    Error::Malformed("unexpected reply type")
}

fn status_reply(pkt: &Packet) -> Result<()> {
    skip_id(pkt)?;
    if pkt.kind() != SSH_FXP_STATUS {
        return Err(Error::Malformed("expected FXP_STATUS packet"));
    }
    parse_status(pkt)
}

fn handle_reply(pkt: &Packet) -> Result<Handle> {
    skip_id(pkt)?;
    match pkt.kind() {
        SSH_FXP_HANDLE => Ok(Handle::new(pkt.get_string()?.to_vec())),
        _ => Err(unexpected_reply(pkt, "FXP_HANDLE")),
    }
}

fn attrs_reply(pkt: &Packet) -> Result<Attrs> {
    skip_id(pkt)?;
    match pkt.kind() {
        SSH_FXP_ATTRS => pkt.get_attrs(),
        _ => Err(unexpected_reply(pkt, "FXP_ATTRS")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::VecDeque;
    use alloc::rc::Rc;
    use alloc::vec;
    use core::cell::RefCell;

    #[derive(Default)]
    struct Wire {
        sent: Vec<Vec<u8>>,
        inbox: VecDeque<u8>,
    }

    #[derive(Clone, Default)]
    struct Script(Rc<RefCell<Wire>>);

    impl Transport for Script {
        fn send(&mut self, data: &[u8]) -> Result<()> {
            self.0.borrow_mut().sent.push(data.to_vec());
            Ok(())
        }

        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut wire = self.0.borrow_mut();
            let n = buf.len().min(wire.inbox.len());
            for (slot, byte) in buf.iter_mut().zip(wire.inbox.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    fn session() -> (SftpSession, Script) {
        let script = Script::default();
        (SftpSession::new(Box::new(script.clone())), script)
    }

    fn reply(kind: u8, id: u32, body: impl FnOnce(&mut Packet)) -> Packet {
        let mut pkt = Packet::new(kind);
        pkt.put_u32(id);
        body(&mut pkt);
        Packet::from_wire(&pkt.into_bytes()).unwrap()
    }

    fn ok_status(id: u32) -> Packet {
        reply(SSH_FXP_STATUS, id, |pkt| {
            pkt.put_u32(SSH_FX_OK);
            pkt.put_str("");
            pkt.put_str("");
        })
    }

    #[test]
    fn realpath_round_trip() {
        let (mut sess, script) = session();
        let req = sess.realpath_send("/home/x/../y").unwrap();
        assert_eq!(req.id(), REQUEST_ID_OFFSET);

        let sent = Packet::from_wire(&script.0.borrow().sent[0]).unwrap();
        assert_eq!(sent.kind(), SSH_FXP_REALPATH);
        assert_eq!(sent.get_u32().unwrap(), req.id());
        assert_eq!(sent.get_str().unwrap(), "/home/x/../y");

        sess.register(req);
        let pkt = reply(SSH_FXP_NAME, REQUEST_ID_OFFSET, |pkt| {
            pkt.put_u32(1);
            pkt.put_str("/home/y");
            pkt.put_str("/home/y");
            pkt.put_attrs(&Attrs::NONE);
        });
        let req = sess.find_request(&pkt).unwrap().unwrap();
        assert_eq!(sess.realpath_recv(pkt, req).unwrap(), "/home/y");
        assert_eq!(sess.outstanding(), 0);
    }

    #[test]
    fn realpath_needs_exactly_one_name() {
        let (mut sess, _) = session();
        let req = sess.realpath_send(".").unwrap();
        let id = req.id();
        sess.register(req);
        let pkt = reply(SSH_FXP_NAME, id, |pkt| pkt.put_u32(0));
        let req = sess.find_request(&pkt).unwrap().unwrap();
        assert!(matches!(sess.realpath_recv(pkt, req), Err(Error::Protocol(_))));
    }

    #[test]
    fn replies_route_in_any_order() {
        let (mut sess, _) = session();
        let mut ids = Vec::new();
        for path in ["/a", "/b", "/c"] {
            let mut req = sess.mkdir_send(path, &Attrs::NONE).unwrap();
            req.set_userdata(String::from(path));
            ids.push(req.id());
            sess.register(req);
        }
        for idx in [2usize, 0, 1] {
            let pkt = ok_status(ids[idx]);
            let mut req = sess.find_request(&pkt).unwrap().unwrap();
            assert_eq!(req.id(), ids[idx]);
            let path = req.take_userdata::<String>().unwrap();
            assert_eq!(path, ["/a", "/b", "/c"][idx]);
            sess.mkdir_recv(pkt, req).unwrap();
        }
        // A duplicate of a retired reply is a violation.
        assert!(matches!(
            sess.find_request(&ok_status(ids[0])),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn unknown_id_is_a_violation() {
        let (mut sess, _) = session();
        let err = sess.find_request(&ok_status(9999)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn unregistered_request_stays_pending() {
        let (mut sess, _) = session();
        let req = sess.remove_send("/f").unwrap();
        let pkt = ok_status(req.id());
        assert!(sess.find_request(&pkt).is_err());
        assert_eq!(sess.outstanding(), 1);
        sess.register(req);
        assert!(sess.find_request(&pkt).unwrap().is_some());
    }

    #[test]
    fn abandoned_reply_is_discarded_once() {
        let (mut sess, _) = session();
        let req = sess.stat_send("/f").unwrap();
        let id = req.id();
        sess.register(req);
        sess.abandon(id);
        assert_eq!(sess.outstanding(), 0);
        assert!(sess.find_request(&ok_status(id)).unwrap().is_none());
        assert!(sess.find_request(&ok_status(id)).is_err());
    }

    #[test]
    fn ids_wrap_and_skip_pending() {
        let script = Script::default();
        let cfg = Config::default().with_first_request_id(u32::MAX);
        let mut sess = SftpSession::with_config(Box::new(script), cfg);
        let first = sess.rmdir_send("/a").unwrap();
        let second = sess.rmdir_send("/b").unwrap();
        assert_eq!((first.id(), second.id()), (u32::MAX, 0));
        // Still pending, so a fresh cycle must not reuse it.
        sess.next_id = u32::MAX;
        let third = sess.rmdir_send("/c").unwrap();
        assert_eq!(third.id(), 1);
    }

    #[test]
    fn read_longer_than_asked_is_rejected() {
        let (mut sess, _) = session();
        let handle = Handle::new(vec![1, 2]);
        let req = sess.read_send(&handle, 0, 4).unwrap();
        let id = req.id();
        sess.register(req);
        let pkt = reply(SSH_FXP_DATA, id, |pkt| pkt.put_string(b"12345"));
        let req = sess.find_request(&pkt).unwrap().unwrap();
        assert!(matches!(sess.read_recv(pkt, req), Err(Error::Protocol(_))));
    }

    #[test]
    fn status_reply_surfaces_code() {
        let (mut sess, _) = session();
        let req = sess.open_send("/missing", SSH_FXF_READ, &Attrs::NONE).unwrap();
        let id = req.id();
        sess.register(req);
        let pkt = reply(SSH_FXP_STATUS, id, |pkt| {
            pkt.put_u32(SSH_FX_NO_SUCH_FILE);
            pkt.put_str("nope");
            pkt.put_str("en");
        });
        let req = sess.find_request(&pkt).unwrap().unwrap();
        let err = sess.open_recv(pkt, req).unwrap_err();
        assert_eq!(err.status_code(), Some(SSH_FX_NO_SUCH_FILE));
    }

    #[test]
    fn recv_with_wrong_request_kind() {
        let (mut sess, _) = session();
        let req = sess.lstat_send("/f").unwrap();
        let id = req.id();
        sess.register(req);
        let pkt = reply(SSH_FXP_ATTRS, id, |pkt| pkt.put_attrs(&Attrs::NONE));
        let req = sess.find_request(&pkt).unwrap().unwrap();
        assert!(matches!(sess.stat_recv(pkt, req), Err(Error::Protocol(_))));
    }

    #[test]
    fn init_checks_version() {
        let (mut sess, script) = session();
        sess.init_send().unwrap();
        assert_eq!(script.0.borrow().sent[0], [0, 0, 0, 5, SSH_FXP_INIT, 0, 0, 0, 3]);

        let mut version = Packet::new(SSH_FXP_VERSION);
        version.put_u32(3);
        version.put_str("posix-rename@openssh.com");
        version.put_str("1");
        let version = Packet::from_wire(&version.into_bytes()).unwrap();
        assert_eq!(sess.init_recv(version).unwrap(), 3);
        assert_eq!(sess.version(), Some(3));

        let mut newer = Packet::new(SSH_FXP_VERSION);
        newer.put_u32(6);
        let newer = Packet::from_wire(&newer.into_bytes()).unwrap();
        assert!(matches!(sess.init_recv(newer), Err(Error::Protocol(_))));
    }

    #[test]
    fn recv_packet_reassembles_split_frames() {
        let (mut sess, script) = session();
        assert!(sess.recv_packet().unwrap().is_none());
        let mut pkt = Packet::new(SSH_FXP_STATUS);
        pkt.put_u32(300);
        pkt.put_u32(SSH_FX_OK);
        let wire = pkt.into_bytes();
        script.0.borrow_mut().inbox.extend(&wire[..6]);
        assert!(sess.recv_packet().unwrap().is_none());
        script.0.borrow_mut().inbox.extend(&wire[6..]);
        let pkt = sess.recv_packet().unwrap().unwrap();
        assert_eq!(pkt.peek_u32().unwrap(), 300);
    }

    #[test]
    fn cleanup_forgets_everything() {
        let (mut sess, _) = session();
        let req = sess.fstat_send(&Handle::new(vec![7])).unwrap();
        sess.register(req);
        sess.cleanup_requests();
        assert_eq!(sess.outstanding(), 0);
    }
}
