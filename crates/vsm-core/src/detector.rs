//! Transport-detector collaborator and the inbound link contract
//!
//! The link core never binds a socket itself. The embedding program's
//! transport detector owns the listener, hands accepted streams over as
//! [`IncomingLink`]s, and is switched on and off through the
//! [`TransportDetector`] handle as UCS connections come and go.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

/// Process-wide collaborator probing for external links.
///
/// The core activates it when the first peer handshake completes and
/// deactivates it when the last connection drops, unless configuration pins
/// it on.
pub trait TransportDetector: Send + Sync {
    fn activate(&self, active: bool);
}

/// Detector stub for embeddings without link probing.
pub struct NullDetector;

impl TransportDetector for NullDetector {
    fn activate(&self, _active: bool) {}
}

/// Byte stream carrying one UCS connection.
pub trait IoLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoLink for T {}

/// Transport the detector accepted the stream on. Only TCP is admissible
/// for UCS traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Tcp,
    Udp,
    Serial,
}

/// An accepted inbound connection, as delivered by the transport detector.
pub struct IncomingLink {
    pub address: SocketAddr,
    pub kind: LinkKind,
    pub stream: Box<dyn IoLink>,
}

impl std::fmt::Debug for IncomingLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingLink")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
