//! Transport abstraction and stream framing for SFTP traffic.

use alloc::collections::VecDeque;
use alloc::format;
use log::{trace, warn};

use crate::error::{Error, Result};
use crate::message::Packet;

/// Ordered, reliable byte stream supplied by the secure channel.
pub trait Transport {
    /// Queue `data` for sending.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Copy whatever bytes are available into `buf`, returning how many.
    ///
    /// `Ok(0)` means nothing has arrived yet; it is not end of stream.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Bytes accepted by `send` but not yet written out.
    fn send_backlog(&self) -> usize {
        0
    }
}

enum FrameState {
    Header { raw: [u8; 4], filled: usize },
    Body { pkt: Packet, filled: usize },
}

/// Splits a byte stream into packets.
pub struct Framer {
    max_packet_len: u32,
    state: FrameState,
    ready: VecDeque<Packet>,
}

impl Framer {
    pub fn new(max_packet_len: u32) -> Self {
        Self {
            max_packet_len,
            state: FrameState::Header {
                raw: [0; 4],
                filled: 0,
            },
            ready: VecDeque::new(),
        }
    }

    /// Consume stream bytes, completing as many packets as they allow.
    ///
    /// An oversized or empty frame is fatal for the stream.
    pub fn push(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match &mut self.state {
                FrameState::Header { raw, filled } => {
                    let take = (4 - *filled).min(data.len());
                    raw[*filled..*filled + take].copy_from_slice(&data[..take]);
                    *filled += take;
                    data = &data[take..];
                    if *filled == 4 {
                        let length = u32::from_be_bytes(*raw);
                        if length == 0 || length > self.max_packet_len {
                            warn!("rejecting frame of length {}", length);
                            return Err(Error::Malformed("bad frame length"));
                        }
                        trace!("frame header: {} bytes", length);
                        self.state = FrameState::Body {
                            pkt: Packet::recv_prepare(length),
                            filled: 0,
                        };
                    }
                }
                FrameState::Body { pkt, filled } => {
                    let body = pkt.body_mut();
                    let take = (body.len() - *filled).min(data.len());
                    body[*filled..*filled + take].copy_from_slice(&data[..take]);
                    *filled += take;
                    data = &data[take..];
                    if *filled == body.len() {
                        let done = core::mem::replace(
                            &mut self.state,
                            FrameState::Header {
                                raw: [0; 4],
                                filled: 0,
                            },
                        );
                        if let FrameState::Body { mut pkt, .. } = done {
                            pkt.recv_finish()?;
                            trace!("framed packet type {}", pkt.kind());
                            self.ready.push_back(pkt);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Next complete packet, if any.
    pub fn next_packet(&mut self) -> Option<Packet> {
        self.ready.pop_front()
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, FrameState::Header { filled: 0, .. })
    }
}

/// Read from `transport` until `framer` yields a packet or the transport runs dry.
pub(crate) fn poll_packet(
    transport: &mut dyn Transport,
    framer: &mut Framer,
) -> Result<Option<Packet>> {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(pkt) = framer.next_packet() {
            return Ok(Some(pkt));
        }
        let n = transport.recv(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n > buf.len() {
            return Err(Error::Transport(format!("recv reported {} bytes", n)));
        }
        framer.push(&buf[..n])?;
    }
}
