//! Error types shared by the client, server and transfer layers.

use alloc::string::String;

use crate::protocol::{SSH_FX_EOF, status_message};

/// Failure reported by the remote side in an SSH_FXP_STATUS reply.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct StatusError {
    /// Raw SSH_FX_* code from the wire.
    pub code: u32,
    /// Local description of `code`.
    pub message: &'static str,
    /// Message text supplied by the server, possibly empty.
    pub server_message: String,
}

impl StatusError {
    pub fn new(code: u32, server_message: String) -> Self {
        Self {
            code,
            message: status_message(code),
            server_message,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Decode ran past the buffer or the packet had the wrong shape.
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
    /// The peer broke request/reply bookkeeping.
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error("transport error: {0}")]
    Transport(String),
    /// The transfer was aborted with `set_error`.
    #[error("transfer aborted")]
    Aborted,
}

impl Error {
    /// The SSH_FX_* code behind this error, if it came from a STATUS reply.
    pub fn status_code(&self) -> Option<u32> {
        match self {
            Self::Status(status) => Some(status.code),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.status_code() == Some(SSH_FX_EOF)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
