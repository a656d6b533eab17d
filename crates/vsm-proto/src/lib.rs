//! Wire protocol for the VSM <-> UCS link
//!
//! This crate is the protocol layer shared by the VSM core and by test
//! harnesses that impersonate a UCS server:
//! - [`message`]: the `VsmMessage` record and its sub-messages, hand-written
//!   against the UCS schema with `prost` derives (no build-time codegen)
//! - [`framing`]: the varint length-prefix codec that carries serialized
//!   messages over a TCP stream, tolerating arbitrary partial reads
//!
//! The crate has no I/O of its own; everything here is pure state.

pub mod framing;
pub mod message;

pub use framing::{encode_frame, encode_message, FrameDecoder, FrameError, PROTO_MAX_MESSAGE_LEN};
pub use message::{
    CommandAvailability, DeviceResponse, DeviceStatus, FieldValue, MetaValue, PeerType,
    RegisterDevice, RegisterPeer, StatusCode, TelemetryField, UnregisterDevice, VsmMessage,
};

/// Highest UCS protocol version this VSM speaks, as `(major, minor)`.
///
/// A peer announcing a strictly lower version pair is kept connected but
/// never written to.
pub const SUPPORTED_UCS_VERSION_MAJOR: u32 = 1;
pub const SUPPORTED_UCS_VERSION_MINOR: u32 = 2;
