//! Per-connection context
//!
//! One [`UcsConnection`] per accepted TCP stream. All fields are owned and
//! mutated by the core task only; the reader and writer tasks interact with
//! it exclusively through channels.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use vsm_proto::FrameError;

/// Why a connection is being torn down. Always terminal; recovery is the
/// peer reconnecting.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    #[error("read failed: {0}")]
    ReadError(String),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("write failed: {0}")]
    WriteError(String),
    #[error("write timed out")]
    WriteTimeout,
    #[error("framing violation: {0}")]
    Frame(#[from] FrameError),
    #[error("message parse failure: {0}")]
    Parse(String),
    #[error("peer type {0} is not a server")]
    WrongPeerType(i32),
    #[error("keep-alive timed out")]
    PingTimeout,
    #[error("peer registration timed out")]
    RegisterPeerTimeout,
}

/// State for one live UCS connection.
pub(crate) struct UcsConnection {
    pub stream_id: u32,
    pub address: SocketAddr,
    /// Unset until the peer's `register_peer` arrives.
    pub peer_id: Option<u32>,
    /// At most one connection per peer id is primary at any time.
    pub primary: bool,
    /// A version-incompatible peer stays connected but is never written to.
    pub is_compatible: bool,
    /// Updated on every successfully parsed inbound message.
    pub last_message_time: Instant,
    /// `message_id` -> `device_id` for registration requests awaiting the
    /// peer's `device_response`.
    pub pending_registrations: HashMap<u32, u32>,
    /// Devices this peer acknowledged registering.
    pub registered_devices: HashSet<u32>,
    /// Frames queued to the writer task, already length-prefixed.
    pub writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

impl UcsConnection {
    pub fn new(
        stream_id: u32,
        address: SocketAddr,
        writer_tx: mpsc::UnboundedSender<Vec<u8>>,
        reader: JoinHandle<()>,
        writer: JoinHandle<()>,
    ) -> Self {
        Self {
            stream_id,
            address,
            peer_id: None,
            primary: false,
            is_compatible: true,
            last_message_time: Instant::now(),
            pending_registrations: HashMap::new(),
            registered_devices: HashSet::new(),
            writer_tx,
            reader,
            writer,
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.address.ip().is_loopback()
    }

    /// Abort the outstanding read and any queued writes.
    pub fn abort_io(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Label for log lines: address plus peer id when known.
    pub fn describe(&self) -> String {
        match self.peer_id {
            Some(peer_id) => format!("{} (peer {:#010x})", self.address, peer_id),
            None => format!("{} (peer unknown)", self.address),
        }
    }
}
