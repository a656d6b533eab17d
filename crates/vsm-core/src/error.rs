//! Error types for the UCS link core
//!
//! Only caller-facing failures live here. Conditions that are terminal for a
//! single connection (transport errors, protocol violations) are a
//! [`CloseReason`](crate::connection::CloseReason) instead: they are logged
//! and drive teardown, they never surface to the device-facing API.

/// Errors returned through the device-facing API.
#[derive(Debug, thiserror::Error)]
pub enum UcsError {
    #[error("UCS processor is not running")]
    Shutdown,
    #[error("device {device_id} is already registered")]
    DeviceAlreadyRegistered { device_id: u32 },
}

pub type UcsResult<T> = Result<T, UcsError>;
