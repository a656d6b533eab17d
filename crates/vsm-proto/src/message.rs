//! `VsmMessage` and its sub-messages
//!
//! Hand-written prost definitions for the subset of the UCS schema the link
//! core exchanges. All fields are proto2-style optionals, paired with
//! codegen-style accessor methods (`device_id()`, `response_required()`,
//! `peer_type()`, ...) that the rest of the workspace routes on.

/// Top-level record framed onto the wire in both directions.
///
/// Exactly which sub-message is present decides how the core classifies an
/// inbound record: handshake (`register_peer`), registration acknowledgement
/// (`device_response` whose `message_id` matches a pending registration), or
/// device-bound traffic (everything else, addressed by `device_id`).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VsmMessage {
    /// Addressed device session, 0 for the peer itself.
    #[prost(uint32, optional, tag = "1")]
    pub device_id: Option<u32>,
    /// Correlates requests with their `device_response`.
    #[prost(uint32, optional, tag = "2")]
    pub message_id: Option<u32>,
    #[prost(bool, optional, tag = "3")]
    pub response_required: Option<bool>,
    #[prost(message, optional, tag = "4")]
    pub register_peer: Option<RegisterPeer>,
    #[prost(message, optional, tag = "5")]
    pub register_device: Option<RegisterDevice>,
    #[prost(message, optional, tag = "6")]
    pub unregister_device: Option<UnregisterDevice>,
    #[prost(message, optional, tag = "7")]
    pub device_status: Option<DeviceStatus>,
    #[prost(message, optional, tag = "8")]
    pub device_response: Option<DeviceResponse>,
}

impl VsmMessage {
    /// Empty message addressed to a device session.
    pub fn for_device(device_id: u32) -> Self {
        Self {
            device_id: Some(device_id),
            ..Self::default()
        }
    }

    /// Keep-alive ping: addressed to the peer itself, answer demanded.
    pub fn ping() -> Self {
        Self {
            device_id: Some(0),
            response_required: Some(true),
            ..Self::default()
        }
    }
}

/// Symmetric handshake record, first message in each direction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterPeer {
    #[prost(uint32, optional, tag = "1")]
    pub peer_id: Option<u32>,
    #[prost(enumeration = "PeerType", optional, tag = "2")]
    pub peer_type: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,
    #[prost(uint32, optional, tag = "4")]
    pub version_major: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub version_minor: Option<u32>,
    #[prost(string, optional, tag = "6")]
    pub version_build: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PeerType {
    Server = 0,
    Vsm = 1,
}

/// Device catalogue entry, populated by the device itself at registration.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterDevice {
    #[prost(string, optional, tag = "1")]
    pub device_name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub device_type: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub serial_number: Option<String>,
    #[prost(message, repeated, tag = "4")]
    pub telemetry_fields: Vec<TelemetryField>,
    #[prost(message, repeated, tag = "5")]
    pub command_availability: Vec<CommandAvailability>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnregisterDevice {}

/// Telemetry and command-availability update for one device.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceStatus {
    #[prost(message, repeated, tag = "1")]
    pub telemetry_fields: Vec<TelemetryField>,
    #[prost(message, repeated, tag = "2")]
    pub command_availability: Vec<CommandAvailability>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TelemetryField {
    #[prost(uint32, optional, tag = "1")]
    pub field_id: Option<u32>,
    #[prost(message, optional, tag = "2")]
    pub value: Option<FieldValue>,
}

impl TelemetryField {
    /// True when the value is the explicit "not available" meta-value.
    ///
    /// Such entries stay in the cache (they overwrite stale readings) but are
    /// never replayed to a freshly registered peer.
    pub fn is_meta_na(&self) -> bool {
        matches!(
            self.value.as_ref().and_then(|v| v.value.as_ref()),
            Some(field_value::Value::MetaValue(m)) if *m == MetaValue::Na as i32
        )
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FieldValue {
    #[prost(oneof = "field_value::Value", tags = "1, 2, 3, 4, 5")]
    pub value: Option<field_value::Value>,
}

pub mod field_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(sint64, tag = "1")]
        IntValue(i64),
        #[prost(double, tag = "2")]
        DoubleValue(f64),
        #[prost(string, tag = "3")]
        StringValue(String),
        #[prost(bool, tag = "4")]
        BoolValue(bool),
        #[prost(enumeration = "super::MetaValue", tag = "5")]
        MetaValue(i32),
    }
}

impl FieldValue {
    pub fn int(value: i64) -> Self {
        Self {
            value: Some(field_value::Value::IntValue(value)),
        }
    }

    pub fn double(value: f64) -> Self {
        Self {
            value: Some(field_value::Value::DoubleValue(value)),
        }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: Some(field_value::Value::StringValue(value.into())),
        }
    }

    pub fn na() -> Self {
        Self {
            value: Some(field_value::Value::MetaValue(MetaValue::Na as i32)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MetaValue {
    Na = 0,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandAvailability {
    #[prost(uint32, optional, tag = "1")]
    pub command_id: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub is_available: Option<bool>,
    #[prost(bool, optional, tag = "3")]
    pub is_enabled: Option<bool>,
}

/// Peer's answer to a request that demanded one.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceResponse {
    #[prost(enumeration = "StatusCode", optional, tag = "1")]
    pub code: Option<i32>,
    /// Completion fraction for `StatusCode::InProgress` answers.
    #[prost(float, optional, tag = "2")]
    pub progress: Option<f32>,
    /// Human-readable failure reason.
    #[prost(string, optional, tag = "3")]
    pub status: Option<String>,
}

impl DeviceResponse {
    pub fn ok() -> Self {
        Self {
            code: Some(StatusCode::Ok as i32),
            ..Self::default()
        }
    }

    pub fn with_code(code: StatusCode) -> Self {
        Self {
            code: Some(code as i32),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Failed = 1,
    InProgress = 2,
    InvalidSessionId = 3,
    InvalidCommand = 4,
}
