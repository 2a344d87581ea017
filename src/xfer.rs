//! Pipelined bulk transfers over an [`SftpSession`].
//!
//! Both directions keep several requests outstanding at once, bounded by
//! a [`TransferConfig`] window. The caller owns the event loop: it hands
//! every received packet for which [`Download::owns`] or [`Upload::owns`]
//! is true to the matching `gotpkt`.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, trace, warn};

use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::message::Packet;
use crate::protocol::{DATA_HEADER_LEN, MAX_READ_LEN};
use crate::session::{Handle, SftpSession};

/// Request count and byte budget shared by both directions.
#[derive(Debug)]
struct Window {
    cfg: TransferConfig,
    requests: usize,
    bytes: u64,
}

impl Window {
    fn new(cfg: TransferConfig) -> Self {
        Self {
            cfg: cfg.clamped(),
            requests: 0,
            bytes: 0,
        }
    }

    fn has_room(&self) -> bool {
        self.requests < self.cfg.max_requests && self.bytes < self.cfg.max_in_flight
    }

    fn take(&mut self, len: u32) {
        self.requests += 1;
        self.bytes += u64::from(len);
    }

    fn retire(&mut self) {
        self.requests = self.requests.saturating_sub(1);
    }

    fn release(&mut self, len: u32) {
        self.bytes = self.bytes.saturating_sub(u64::from(len));
    }
}

/// Id of the reply in `pkt`, if it has one.
fn reply_id(pkt: &Packet) -> Option<u32> {
    pkt.peek_u32().ok()
}

#[derive(Debug)]
struct Chunk {
    /// Bytes asked for.
    len: u32,
    /// `None` until the READ completes.
    data: Option<Vec<u8>>,
}

/// A download in progress.
///
/// READs go out in increasing offset order and may complete in any
/// order; completed chunks wait in a reorder buffer until everything
/// before them has been handed out by [`Download::data`].
#[derive(Debug)]
pub struct Download {
    handle: Handle,
    window: Window,
    /// Offset of the next READ to issue.
    next_offset: u64,
    /// Lowest offset not yet handed to the caller.
    delivered: u64,
    chunks: BTreeMap<u64, Chunk>,
    /// Outstanding request id to chunk offset.
    ids: BTreeMap<u32, u64>,
    /// End of file, once a reply has revealed it.
    filesize: u64,
    /// Highest offset that returned data.
    furthest: u64,
    eof: bool,
    err: bool,
}

impl Download {
    /// Start downloading `handle` from `offset`, filling the window at once.
    ///
    /// Each READ asks for at most `chunk_size` bytes, and never more than
    /// a DATA reply within the session's `max_packet_len` can carry.
    pub fn init(
        session: &mut SftpSession,
        handle: Handle,
        offset: u64,
        mut cfg: TransferConfig,
    ) -> Result<Self> {
        let limit = session
            .config()
            .max_packet_len
            .saturating_sub(DATA_HEADER_LEN)
            .clamp(1, MAX_READ_LEN);
        if cfg.chunk_size > limit {
            debug!("download: chunk size {} lowered to {}", cfg.chunk_size, limit);
            cfg.chunk_size = limit;
        }
        let mut xfer = Self {
            handle,
            window: Window::new(cfg),
            next_offset: offset,
            delivered: offset,
            chunks: BTreeMap::new(),
            ids: BTreeMap::new(),
            filesize: u64::MAX,
            furthest: 0,
            eof: false,
            err: false,
        };
        xfer.queue(session)?;
        Ok(xfer)
    }

    /// Issue READs until the window is full or the end of file is known.
    pub fn queue(&mut self, session: &mut SftpSession) -> Result<()> {
        let len = self.window.cfg.chunk_size;
        while !self.eof && !self.err && self.window.has_room() {
            let req = session.read_send(&self.handle, self.next_offset, len)?;
            trace!("download: READ {} at {}", req.id(), self.next_offset);
            self.ids.insert(req.id(), self.next_offset);
            self.chunks.insert(self.next_offset, Chunk { len, data: None });
            session.register(req);
            self.window.take(len);
            self.next_offset += u64::from(len);
        }
        Ok(())
    }

    /// True if `pkt` answers one of this download's READs.
    pub fn owns(&self, pkt: &Packet) -> bool {
        reply_id(pkt).is_some_and(|id| self.ids.contains_key(&id))
    }

    /// Absorb the reply to one of this download's READs.
    pub fn gotpkt(&mut self, session: &mut SftpSession, pkt: Packet) -> Result<()> {
        let id = reply_id(&pkt).ok_or(Error::Malformed("did not receive a valid SFTP packet"))?;
        let offset = self
            .ids
            .remove(&id)
            .ok_or_else(|| Error::Protocol(format!("reply {} is not part of this download", id)))?;
        self.window.retire();
        let len = self.chunks.get(&offset).map_or(0, |chunk| chunk.len);

        let Some(req) = session.find_request(&pkt)? else {
            self.drop_chunk(offset, len);
            return Ok(());
        };
        let data = match session.read_recv(pkt, req) {
            Ok(data) => data,
            Err(err) if err.is_eof() => Vec::new(),
            Err(err) => {
                warn!("download: READ at {} failed: {}", offset, err);
                self.err = true;
                return Err(err);
            }
        };

        if (data.len() as u64) < u64::from(len) {
            let end = offset + data.len() as u64;
            debug!("download: end of file at {}", end);
            self.eof = true;
            self.filesize = self.filesize.min(end);
        }
        if data.is_empty() {
            self.drop_chunk(offset, len);
        } else {
            self.furthest = self.furthest.max(offset);
            if let Some(chunk) = self.chunks.get_mut(&offset) {
                chunk.data = Some(data);
            }
        }
        if self.furthest > self.filesize {
            self.err = true;
            return Err(Error::Protocol(String::from(
                "received a short buffer from FXP_READ, but not at EOF",
            )));
        }
        Ok(())
    }

    /// Next run of contiguous bytes, if the chunk at the delivery point is in.
    ///
    /// Fails with [`Error::Aborted`] once the transfer has failed.
    pub fn data(&mut self) -> Result<Option<Vec<u8>>> {
        if self.err {
            return Err(Error::Aborted);
        }
        let Some(entry) = self.chunks.first_entry() else {
            return Ok(None);
        };
        if *entry.key() != self.delivered || entry.get().data.is_none() {
            return Ok(None);
        }
        let chunk = entry.remove();
        self.window.release(chunk.len);
        let data = chunk.data.unwrap_or_default();
        self.delivered += data.len() as u64;
        Ok(Some(data))
    }

    /// No READ outstanding, and either the transfer failed or every byte
    /// up to end of file has been handed out.
    pub fn done(&self) -> bool {
        self.ids.is_empty() && (self.err || (self.eof && self.chunks.is_empty()))
    }

    /// Stop issuing READs; the next [`data`](Self::data) call reports the failure.
    pub fn set_error(&mut self) {
        self.err = true;
    }

    /// Offset just past the last byte handed out.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Abandon any READs still outstanding and release the handle.
    pub fn cleanup(self, session: &mut SftpSession) -> Handle {
        for id in self.ids.keys() {
            session.abandon(*id);
        }
        if !self.ids.is_empty() {
            debug!("download: abandoned {} READs", self.ids.len());
        }
        self.handle
    }

    fn drop_chunk(&mut self, offset: u64, len: u32) {
        self.chunks.remove(&offset);
        self.window.release(len);
    }
}

/// An upload in progress.
#[derive(Debug)]
pub struct Upload {
    handle: Handle,
    window: Window,
    offset: u64,
    /// Outstanding request id to `(offset, len)`.
    outstanding: BTreeMap<u32, (u64, u32)>,
    err: bool,
}

impl Upload {
    /// Start uploading to `handle` at `offset`. Nothing is sent until [`data`](Self::data).
    pub fn init(handle: Handle, offset: u64, cfg: TransferConfig) -> Self {
        Self {
            handle,
            window: Window::new(cfg),
            offset,
            outstanding: BTreeMap::new(),
            err: false,
        }
    }

    /// Whether more data can be accepted without overrunning the window.
    pub fn ready(&self, session: &SftpSession) -> bool {
        !self.err && session.send_backlog() == 0 && self.window.has_room()
    }

    /// Send `buf` as the next stretch of the file, split into WRITEs of at most `chunk_size`.
    pub fn data(&mut self, session: &mut SftpSession, buf: &[u8]) -> Result<()> {
        if self.err {
            return Err(Error::Aborted);
        }
        for piece in buf.chunks(self.window.cfg.chunk_size as usize) {
            let req = session.write_send(&self.handle, self.offset, piece)?;
            let len = piece.len() as u32;
            trace!("upload: WRITE {} at {} ({} bytes)", req.id(), self.offset, len);
            self.outstanding.insert(req.id(), (self.offset, len));
            session.register(req);
            self.window.take(len);
            self.offset += u64::from(len);
        }
        Ok(())
    }

    pub fn owns(&self, pkt: &Packet) -> bool {
        reply_id(pkt).is_some_and(|id| self.outstanding.contains_key(&id))
    }

    /// Absorb the acknowledgement of one of this upload's WRITEs.
    pub fn gotpkt(&mut self, session: &mut SftpSession, pkt: Packet) -> Result<()> {
        let id = reply_id(&pkt).ok_or(Error::Malformed("did not receive a valid SFTP packet"))?;
        let (offset, len) = self
            .outstanding
            .remove(&id)
            .ok_or_else(|| Error::Protocol(format!("reply {} is not part of this upload", id)))?;
        self.window.retire();
        self.window.release(len);

        let Some(req) = session.find_request(&pkt)? else {
            return Ok(());
        };
        session.write_recv(pkt, req).map_err(|err| {
            warn!("upload: WRITE at {} failed: {}", offset, err);
            self.err = true;
            err
        })
    }

    /// No WRITE is awaiting acknowledgement.
    pub fn done(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn set_error(&mut self) {
        self.err = true;
    }

    /// Offset the next [`data`](Self::data) call will write at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn cleanup(self, session: &mut SftpSession) -> Handle {
        for id in self.outstanding.keys() {
            session.abandon(*id);
        }
        self.handle
    }
}

/// Reject a packet that no running transfer claims.
fn stray_reply(session: &mut SftpSession, pkt: &Packet) -> Result<()> {
    match session.find_request(pkt)? {
        Some(req) => Err(Error::Protocol(format!(
            "unexpected reply to request {} during transfer",
            req.id()
        ))),
        None => Ok(()),
    }
}

/// Read `handle` from `offset` to end of file.
///
/// Polls the session until the transfer completes, so the transport
/// should block in `recv`.
pub fn fetch(
    session: &mut SftpSession,
    handle: &Handle,
    offset: u64,
    cfg: TransferConfig,
) -> Result<Vec<u8>> {
    let mut xfer = Download::init(session, handle.clone(), offset, cfg)?;
    let mut out = Vec::new();
    let result = loop {
        match xfer.data() {
            Ok(Some(chunk)) => {
                out.extend_from_slice(&chunk);
                continue;
            }
            Ok(None) => {}
            Err(err) => break Err(err),
        }
        if xfer.done() {
            break Ok(());
        }
        if let Err(err) = xfer.queue(session) {
            break Err(err);
        }
        let pkt = match session.recv_packet() {
            Ok(Some(pkt)) => pkt,
            Ok(None) => continue,
            Err(err) => break Err(err),
        };
        let handled = if xfer.owns(&pkt) {
            xfer.gotpkt(session, pkt)
        } else {
            stray_reply(session, &pkt)
        };
        if let Err(err) = handled {
            break Err(err);
        }
    };
    xfer.cleanup(session);
    result.map(|()| out)
}

/// Write all of `data` to `handle` starting at `offset`.
pub fn store(
    session: &mut SftpSession,
    handle: &Handle,
    offset: u64,
    data: &[u8],
    cfg: TransferConfig,
) -> Result<()> {
    let mut xfer = Upload::init(handle.clone(), offset, cfg);
    let step = xfer.window.cfg.chunk_size as usize;
    let mut pos = 0;
    let result = loop {
        if pos < data.len() && xfer.ready(session) {
            let end = (pos + step).min(data.len());
            if let Err(err) = xfer.data(session, &data[pos..end]) {
                break Err(err);
            }
            pos = end;
            continue;
        }
        if pos >= data.len() && xfer.done() {
            break Ok(());
        }
        let pkt = match session.recv_packet() {
            Ok(Some(pkt)) => pkt,
            Ok(None) => continue,
            Err(err) => break Err(err),
        };
        let handled = if xfer.owns(&pkt) {
            xfer.gotpkt(session, pkt)
        } else {
            stray_reply(session, &pkt)
        };
        if let Err(err) = handled {
            break Err(err);
        }
    };
    xfer.cleanup(session);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_counts_requests_and_bytes() {
        let cfg = TransferConfig::default()
            .with_max_requests(2)
            .with_max_in_flight(100);
        let mut window = Window::new(cfg);
        assert!(window.has_room());
        window.take(40);
        assert!(window.has_room());
        window.take(40);
        assert!(!window.has_room());
        window.retire();
        window.release(40);
        assert!(window.has_room());
    }

    #[test]
    fn byte_budget_alone_closes_window() {
        let cfg = TransferConfig::default()
            .with_max_requests(64)
            .with_max_in_flight(100);
        let mut window = Window::new(cfg);
        window.take(100);
        assert!(!window.has_room());
        window.retire();
        assert!(!window.has_room());
        window.release(100);
        assert!(window.has_room());
    }

    #[test]
    fn zeroed_config_still_opens_window() {
        let window = Window::new(TransferConfig {
            chunk_size: 0,
            max_requests: 0,
            max_in_flight: 0,
        });
        assert!(window.has_room());
        assert_eq!(window.cfg.chunk_size, 1);
    }
}
