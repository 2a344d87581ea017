#![no_std]

//! Poll-driven SFTP version 3 engine for no_std targets.
//!
//! The crate has three layers over a caller-supplied [`Transport`]:
//!
//! * [`SftpSession`], the client: every operation is a `*_send` call that
//!   returns a [`Request`], and a `*_recv` call that decodes the matching
//!   reply once [`SftpSession::find_request`] has routed it. Blocking
//!   wrappers such as [`SftpSession::open`] sit on top for transports
//!   whose `recv` blocks.
//! * [`ServerConnection`] and [`handle_request`], the server: requests are
//!   decoded and dispatched onto an [`SftpServer`] backend, which answers
//!   through a [`ReplyBuilder`]. [`MemFs`] is an in-memory backend.
//! * [`Download`] and [`Upload`], which pipeline READ and WRITE requests
//!   for bulk transfers, with [`fetch`] and [`store`] as one-call helpers.

extern crate alloc;

mod attrs;
mod config;
mod error;
mod memfs;
mod message;
mod parse;
pub mod protocol;
mod server;
mod session;
mod transport;
mod xfer;

pub use attrs::Attrs;
pub use config::{Config, TransferConfig};
pub use error::{Error, Result, StatusError};
pub use memfs::{MemFs, long_name};
pub use message::Packet;
pub use parse::NameEntry;
pub use protocol::{StatusCode, status_message};
pub use server::{PacketReplyBuilder, ReplyBuilder, ServerConnection, SftpServer, handle_request};
pub use session::{Handle, Request, SftpSession};
pub use transport::{Framer, Transport};
pub use xfer::{Download, Upload, fetch, store};
