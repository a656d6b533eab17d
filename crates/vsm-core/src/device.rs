//! Device-facing contract
//!
//! A device ("vehicle") is a local context with its own processing executor.
//! The link core talks to it exclusively through its event channel so the
//! device sees peer-set changes serialized with its other work, and the
//! device talks back through the [`UcsProcessor`](crate::UcsProcessor)
//! handle or a per-request [`Responder`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;

use vsm_proto::{CommandAvailability, DeviceResponse, TelemetryField, VsmMessage};

use crate::processor::UcsCommand;

/// Sender half of a device's processing context.
pub type DeviceEventSender = mpsc::UnboundedSender<DeviceEvent>;

/// A local device registered into the link core.
pub trait Device: Send + Sync + 'static {
    /// Process-unique session id. 0 is reserved for the peer itself.
    fn session_id(&self) -> u32;

    /// Fill in the registration record announced to every UCS peer.
    ///
    /// Called synchronously during registration; `message.register_device`
    /// is already present and telemetry/availability entries placed in it
    /// seed the device's caches.
    fn populate_registration(&self, message: &mut VsmMessage);

    /// The device's own processing context.
    fn processing_ctx(&self) -> DeviceEventSender;
}

impl std::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Device({})", self.session_id())
    }
}

/// Work delivered into a device's processing context.
#[derive(Debug)]
pub enum DeviceEvent {
    /// A peer-originated message addressed to this device. When the peer
    /// demanded an answer, `responder` carries the prepared template.
    UcsMessage {
        message: VsmMessage,
        responder: Option<Responder>,
    },
    /// The set of connections this device is registered through changed.
    UcsInfoChanged { peers: Vec<UcsInfo> },
}

/// One connection a device is currently registered through.
#[derive(Debug, Clone)]
pub struct UcsInfo {
    pub peer_id: u32,
    pub address: SocketAddr,
    pub primary: bool,
    pub last_message_time: Instant,
}

/// Completion handle for a request that demanded a response.
///
/// Holds a response template carrying the original `message_id`; completing
/// it sends the answer back over the same connection the request arrived on.
/// Dropping the responder answers nothing.
#[derive(Debug)]
pub struct Responder {
    pub(crate) template: VsmMessage,
    pub(crate) stream_id: u32,
    pub(crate) commands: mpsc::UnboundedSender<UcsCommand>,
}

impl Responder {
    /// `message_id` the peer used for correlation.
    pub fn message_id(&self) -> u32 {
        self.template.message_id()
    }

    /// Complete the template and send it over the originating connection.
    pub fn send(mut self, response: DeviceResponse) {
        self.template.device_response = Some(response);
        let _ = self.commands.send(UcsCommand::SendOnStream {
            stream_id: self.stream_id,
            message: self.template,
        });
    }
}

// ----------------------------------------------------------------------------
// Device context
// ----------------------------------------------------------------------------

/// Core-side state for one registered device.
pub(crate) struct DeviceContext {
    pub device: Arc<dyn Device>,
    /// Registration record, replayed to every newly handshaken peer.
    pub registration: VsmMessage,
    /// Latest value per telemetry field id. N/A entries are kept (they
    /// overwrite stale readings) but are excluded from replay.
    pub telemetry_cache: HashMap<u32, TelemetryField>,
    /// Latest availability per command id.
    pub availability_cache: HashMap<u32, CommandAvailability>,
}

impl DeviceContext {
    pub fn new(device: Arc<dyn Device>, registration: VsmMessage) -> Self {
        let mut ctx = Self {
            device,
            registration,
            telemetry_cache: HashMap::new(),
            availability_cache: HashMap::new(),
        };
        if let Some(reg) = ctx.registration.register_device.clone() {
            ctx.merge_caches(&reg.telemetry_fields, &reg.command_availability);
        }
        ctx
    }

    /// Insert-or-overwrite cache entries by field/command id.
    pub fn merge_caches(
        &mut self,
        telemetry: &[TelemetryField],
        availability: &[CommandAvailability],
    ) {
        for field in telemetry {
            self.telemetry_cache.insert(field.field_id(), field.clone());
        }
        for entry in availability {
            self.availability_cache
                .insert(entry.command_id(), entry.clone());
        }
    }

    /// Snapshot of both caches for replay to a freshly registered peer,
    /// with N/A telemetry left out.
    pub fn status_snapshot(&self) -> vsm_proto::DeviceStatus {
        let mut telemetry_fields: Vec<TelemetryField> = self
            .telemetry_cache
            .values()
            .filter(|f| !f.is_meta_na())
            .cloned()
            .collect();
        telemetry_fields.sort_by_key(|f| f.field_id());
        let mut command_availability: Vec<CommandAvailability> =
            self.availability_cache.values().cloned().collect();
        command_availability.sort_by_key(|a| a.command_id());
        vsm_proto::DeviceStatus {
            telemetry_fields,
            command_availability,
        }
    }
}
