#![allow(dead_code)]

use std::cell::{Ref, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use fxp::{MemFs, Result, ServerConnection, SftpSession, Transport};

/// Server end of the loopback, plus the bytes queued for the client.
pub struct Link {
    pub server: ServerConnection<MemFs>,
    pub inbox: VecDeque<u8>,
    /// Reply frames withheld while `hold` is set.
    pub held: Vec<Vec<u8>>,
    pub hold: bool,
    pub backlog: usize,
}

/// Transport that answers every request synchronously from a [`MemFs`].
#[derive(Clone)]
pub struct Loopback(pub Rc<RefCell<Link>>);

impl Loopback {
    pub fn new(fs: MemFs) -> Self {
        Loopback(Rc::new(RefCell::new(Link {
            server: ServerConnection::new(fs),
            inbox: VecDeque::new(),
            held: Vec::new(),
            hold: false,
            backlog: 0,
        })))
    }

    pub fn fs(&self) -> Ref<'_, MemFs> {
        Ref::map(self.0.borrow(), |link| link.server.backend())
    }

    /// Withhold replies until one of the `release_*` calls.
    pub fn hold(&self) {
        self.0.borrow_mut().hold = true;
    }

    pub fn release_in_order(&self) {
        let mut link = self.0.borrow_mut();
        link.hold = false;
        let held: Vec<Vec<u8>> = link.held.drain(..).collect();
        for frame in held {
            link.inbox.extend(frame);
        }
    }

    pub fn release_reversed(&self) {
        let mut link = self.0.borrow_mut();
        link.hold = false;
        let held: Vec<Vec<u8>> = link.held.drain(..).rev().collect();
        for frame in held {
            link.inbox.extend(frame);
        }
    }

    /// Release only the `n` oldest withheld replies, keeping the hold.
    pub fn release_first(&self, n: usize) {
        let mut link = self.0.borrow_mut();
        let n = n.min(link.held.len());
        let frames: Vec<Vec<u8>> = link.held.drain(..n).collect();
        for frame in frames {
            link.inbox.extend(frame);
        }
    }

    pub fn held_count(&self) -> usize {
        self.0.borrow().held.len()
    }

    pub fn set_backlog(&self, bytes: usize) {
        self.0.borrow_mut().backlog = bytes;
    }
}

impl Transport for Loopback {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut link = self.0.borrow_mut();
        let out = link.server.feed(data)?;
        if link.hold {
            let frames = split_frames(&out);
            link.held.extend(frames);
        } else {
            link.inbox.extend(out);
        }
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut link = self.0.borrow_mut();
        let n = buf.len().min(link.inbox.len());
        for (slot, byte) in buf.iter_mut().zip(link.inbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn send_backlog(&self) -> usize {
        self.0.borrow().backlog
    }
}

/// Split concatenated wire frames apart.
pub fn split_frames(mut wire: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    while wire.len() >= 4 {
        let len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
        let (frame, rest) = wire.split_at(4 + len);
        frames.push(frame.to_vec());
        wire = rest;
    }
    frames
}

/// A negotiated client session talking to `fs`.
pub fn connect(fs: MemFs) -> (SftpSession, Loopback) {
    let link = Loopback::new(fs);
    let mut session = SftpSession::new(Box::new(link.clone()));
    session.init().expect("init");
    (session, link)
}

/// `len` bytes of a recognisable pattern.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|idx| (idx * 7 + idx / 251) as u8).collect()
}
