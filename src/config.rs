//! Tunables for sessions and pipelined transfers.

use crate::protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_IN_FLIGHT, DEFAULT_MAX_PACKET_LEN, REQUEST_ID_OFFSET,
};

/// Session-level settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Largest inbound frame accepted, excluding the length prefix.
    pub max_packet_len: u32,
    /// First request id handed out.
    pub first_request_id: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            first_request_id: REQUEST_ID_OFFSET,
        }
    }
}

impl Config {
    pub fn with_max_packet_len(mut self, len: u32) -> Self {
        self.max_packet_len = len;
        self
    }

    pub fn with_first_request_id(mut self, id: u32) -> Self {
        self.first_request_id = id;
        self
    }
}

/// Window settings for [`Download`](crate::Download) and [`Upload`](crate::Upload).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    /// Bytes per READ request, and the split size for WRITE requests.
    pub chunk_size: u32,
    /// Most requests outstanding at once.
    pub max_requests: usize,
    /// Most bytes requested or written but not yet retired.
    pub max_in_flight: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_requests: 64,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

impl TransferConfig {
    pub fn with_chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn with_max_requests(mut self, count: usize) -> Self {
        self.max_requests = count.max(1);
        self
    }

    pub fn with_max_in_flight(mut self, bytes: u64) -> Self {
        self.max_in_flight = bytes.max(1);
        self
    }

    /// The same settings with every zero field raised to one.
    pub(crate) fn clamped(self) -> Self {
        self.with_chunk_size(self.chunk_size)
            .with_max_requests(self.max_requests)
            .with_max_in_flight(self.max_in_flight)
    }
}
