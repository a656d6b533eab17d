//! Vehicle-side UCS link core
//!
//! This crate is the networking heart of a vehicle-side module (VSM): a
//! connection multiplexer and message router between locally managed devices
//! ("vehicles") and remote control-station servers ("UCS peers").
//!
//! - [`processor`]: the [`UcsProcessor`] handle and the single core task
//!   that owns all connection and device state
//! - [`connection`]: per-connection context and the close taxonomy
//! - [`device`]: the device-facing contract (registration, message delivery,
//!   peer-set notifications, response completion)
//! - [`detector`]: the transport-detector collaborator and inbound link
//!   contract
//! - [`config`]: the `ucs.*` properties this core recognizes
//!
//! ## Architecture
//!
//! All core state is owned by one task (the processing context). Socket
//! reads, writes, and the keep-alive tick happen on per-connection tasks
//! (the completion context) and re-enter the core through channels, so no
//! lock ever guards a connection or device table. Devices likewise own
//! their own processing contexts and are reached only through their event
//! channels.

pub mod config;
pub mod connection;
pub mod detector;
pub mod device;
pub mod error;
pub mod processor;

pub use config::UcsConfig;
pub use connection::CloseReason;
pub use detector::{IncomingLink, IoLink, LinkKind, NullDetector, TransportDetector};
pub use device::{Device, DeviceEvent, DeviceEventSender, Responder, UcsInfo};
pub use error::{UcsError, UcsResult};
pub use processor::{
    UcsProcessor, UcsProcessorBuilder, UcsStats, REGISTER_PEER_TIMEOUT, WRITE_TIMEOUT,
};
