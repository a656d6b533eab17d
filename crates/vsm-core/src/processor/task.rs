//! Core logic task
//!
//! The single processing context. Owns `connections` and `devices`, consumes
//! device-facing commands, completion-context link events, and the 1 Hz
//! keep-alive tick, and is the only place core state is mutated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use vsm_proto::{
    encode_message, DeviceResponse, PeerType, RegisterPeer, StatusCode, VsmMessage,
    SUPPORTED_UCS_VERSION_MAJOR, SUPPORTED_UCS_VERSION_MINOR,
};

use crate::config::UcsConfig;
use crate::connection::{CloseReason, UcsConnection};
use crate::detector::{IncomingLink, LinkKind, TransportDetector};
use crate::device::{DeviceContext, DeviceEvent, Responder, UcsInfo};
use crate::error::UcsError;
use crate::processor::io::{spawn_link_io, LinkEvent};
use crate::processor::{
    NewConnectionCallback, UcsCommand, UcsStats, REGISTER_PEER_TIMEOUT,
};

pub(crate) struct UcsCoreTask {
    config: UcsConfig,
    detector: Arc<dyn TransportDetector>,
    on_new_connection: Option<NewConnectionCallback>,
    local_peer_id: u32,
    /// Kept so responders can re-enter the task; also means the command
    /// channel never closes underneath us.
    command_tx: mpsc::UnboundedSender<UcsCommand>,
    command_rx: mpsc::UnboundedReceiver<UcsCommand>,
    link_rx: mpsc::UnboundedReceiver<IncomingLink>,
    links_open: bool,
    event_tx: mpsc::UnboundedSender<LinkEvent>,
    event_rx: mpsc::UnboundedReceiver<LinkEvent>,
    connections: HashMap<u32, UcsConnection>,
    devices: HashMap<u32, DeviceContext>,
    next_stream_id: u32,
    next_message_id: u32,
    stats: UcsStats,
    stats_tx: watch::Sender<UcsStats>,
    running: bool,
}

impl UcsCoreTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: UcsConfig,
        detector: Arc<dyn TransportDetector>,
        on_new_connection: Option<NewConnectionCallback>,
        local_peer_id: u32,
        command_tx: mpsc::UnboundedSender<UcsCommand>,
        command_rx: mpsc::UnboundedReceiver<UcsCommand>,
        link_rx: mpsc::UnboundedReceiver<IncomingLink>,
        stats_tx: watch::Sender<UcsStats>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            detector,
            on_new_connection,
            local_peer_id,
            command_tx,
            command_rx,
            link_rx,
            links_open: true,
            event_tx,
            event_rx,
            connections: HashMap::new(),
            devices: HashMap::new(),
            next_stream_id: 1,
            next_message_id: 1,
            stats: UcsStats::default(),
            stats_tx,
            running: true,
        }
    }

    pub async fn run(mut self) {
        let local = format!("{:#010x}", self.local_peer_id);
        info!(peer_id = %local, "UCS link core starting");
        self.detector.activate(self.config.detector_on_when_disconnected);

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        while self.running {
            tokio::select! {
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                link = self.link_rx.recv(), if self.links_open => match link {
                    Some(link) => self.handle_incoming(link),
                    None => self.links_open = false,
                },
                Some(event) = self.event_rx.recv() => self.handle_event(event),
                _ = tick.tick() => self.on_tick(),
            }
            self.stats_tx.send_replace(self.stats.clone());
        }

        info!("UCS link core stopped");
    }

    // ------------------------------------------------------------------------
    // Command handling (device-facing API)
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, command: UcsCommand) {
        match command {
            UcsCommand::RegisterDevice { device, reply } => {
                let _ = reply.send(self.register_device(device));
            }
            UcsCommand::UnregisterDevice { device_id } => self.unregister_device(device_id),
            UcsCommand::SendUcsMessage {
                device_id,
                message,
                stream_id,
            } => self.send_ucs_message(device_id, message, stream_id),
            UcsCommand::SendOnStream { stream_id, message } => {
                self.send_to_connection(stream_id, message);
            }
            UcsCommand::Shutdown { reply } => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    fn register_device(&mut self, device: Arc<dyn crate::device::Device>) -> Result<(), UcsError> {
        let device_id = device.session_id();
        if self.devices.contains_key(&device_id) {
            return Err(UcsError::DeviceAlreadyRegistered { device_id });
        }

        let mut registration = VsmMessage::for_device(device_id);
        registration.register_device = Some(vsm_proto::RegisterDevice::default());
        device.populate_registration(&mut registration);
        registration.device_id = Some(device_id);

        let context = DeviceContext::new(device, registration.clone());
        self.devices.insert(device_id, context);
        self.stats.devices_registered += 1;

        if self.connections.is_empty() {
            warn!(device_id, "device registered, but no UCS servers connected");
        } else {
            self.broadcast(registration);
        }
        Ok(())
    }

    fn unregister_device(&mut self, device_id: u32) {
        if self.devices.remove(&device_id).is_none() {
            error!(device_id, "unregistering a device that is not registered");
            return;
        }
        self.stats.devices_unregistered += 1;
        let mut notice = VsmMessage::for_device(device_id);
        notice.unregister_device = Some(vsm_proto::UnregisterDevice::default());
        self.broadcast(notice);
    }

    fn send_ucs_message(&mut self, device_id: u32, mut message: VsmMessage, stream_id: u32) {
        let Some(context) = self.devices.get_mut(&device_id) else {
            debug!(device_id, "dropping message from unknown device");
            self.stats.messages_dropped += 1;
            return;
        };
        if let Some(status) = message.device_status.as_ref() {
            context.merge_caches(&status.telemetry_fields, &status.command_availability);
        }
        message.device_id = Some(device_id);
        if stream_id != 0 {
            self.send_to_connection(stream_id, message);
        } else {
            self.broadcast(message);
        }
    }

    // ------------------------------------------------------------------------
    // Inbound connections
    // ------------------------------------------------------------------------

    fn handle_incoming(&mut self, link: IncomingLink) {
        if link.kind != LinkKind::Tcp {
            warn!(address = %link.address, kind = ?link.kind, "rejecting non-TCP UCS connection");
            return;
        }

        let stream_id = self.next_stream_id;
        // Stream ids are never reused within a process lifetime.
        self.next_stream_id = self
            .next_stream_id
            .checked_add(1)
            .expect("stream id space exhausted");

        let (writer_tx, reader, writer) = spawn_link_io(stream_id, link.stream, self.event_tx.clone());
        let connection = UcsConnection::new(stream_id, link.address, writer_tx, reader, writer);
        info!(stream_id, address = %link.address, "UCS connection accepted");
        self.connections.insert(stream_id, connection);
        self.stats.connections_accepted += 1;

        if let Some(callback) = self.on_new_connection.as_ref() {
            callback();
        }

        // Introduce ourselves; nothing else goes out until the peer's
        // register_peer has been seen.
        let hello = VsmMessage {
            register_peer: Some(RegisterPeer {
                peer_id: Some(self.local_peer_id),
                peer_type: Some(PeerType::Vsm as i32),
                name: Some(self.config.vsm_name.clone()),
                version_major: Some(SUPPORTED_UCS_VERSION_MAJOR),
                version_minor: Some(SUPPORTED_UCS_VERSION_MINOR),
                version_build: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..VsmMessage::default()
        };
        self.send_to_connection(stream_id, hello);
    }

    // ------------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------------

    fn handle_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Frame { stream_id, message } => self.handle_frame(stream_id, message),
            LinkEvent::Closed { stream_id, reason } => self.close_connection(stream_id, &reason),
        }
    }

    fn handle_frame(&mut self, stream_id: u32, message: VsmMessage) {
        // The connection may already be gone; a frame parsed just before the
        // close event is simply late.
        let Some(connection) = self.connections.get_mut(&stream_id) else {
            return;
        };
        self.stats.frames_received += 1;

        if connection.peer_id.is_none() {
            if message.register_peer.is_some() {
                self.handle_register_peer(stream_id, message);
            } else {
                warn!(
                    stream_id,
                    address = %connection.address,
                    "dropping message from peer that has not registered"
                );
            }
            return;
        }

        connection.last_message_time = Instant::now();

        if message.device_response.is_some()
            && connection
                .pending_registrations
                .contains_key(&message.message_id())
        {
            self.handle_registration_response(stream_id, message);
            return;
        }

        self.route_to_device(stream_id, message);
    }

    /// Peer handshake: duplicate detection, primary selection with loopback
    /// preference, version gate, catalogue replay.
    fn handle_register_peer(&mut self, stream_id: u32, message: VsmMessage) {
        let register = message.register_peer.unwrap_or_default();

        if register.peer_type.is_some() && register.peer_type() != PeerType::Server {
            let kind = register.peer_type.unwrap_or_default();
            warn!(stream_id, peer_type = kind, "handshake from non-server peer");
            self.close_connection(stream_id, &CloseReason::WrongPeerType(kind));
            return;
        }

        let peer_id = register.peer_id();
        let this_loopback = self
            .connections
            .get(&stream_id)
            .map(|c| c.is_loopback())
            .unwrap_or(false);

        // Walk the siblings carrying the same peer id.
        let mut have_sibling = false;
        let mut demoted: Option<u32> = None;
        let mut primary = true;
        for other in self.connections.values_mut() {
            if other.stream_id == stream_id || other.peer_id != Some(peer_id) {
                continue;
            }
            have_sibling = true;
            if other.primary {
                if !other.is_loopback() && this_loopback {
                    other.primary = false;
                    demoted = Some(other.stream_id);
                } else {
                    primary = false;
                }
            }
        }

        let compatible = (register.version_major(), register.version_minor())
            >= (SUPPORTED_UCS_VERSION_MAJOR, SUPPORTED_UCS_VERSION_MINOR);

        let Some(connection) = self.connections.get_mut(&stream_id) else {
            return;
        };
        connection.peer_id = Some(peer_id);
        connection.primary = primary;
        connection.is_compatible = compatible;
        connection.last_message_time = Instant::now();

        let peer = format!("{:#010x}", peer_id);
        info!(
            stream_id,
            address = %connection.address,
            peer_id = %peer,
            name = register.name(),
            primary,
            duplicate = have_sibling,
            "UCS peer registered"
        );
        if !compatible {
            let version = format!("{}.{}", register.version_major(), register.version_minor());
            let supported = format!(
                "{}.{}",
                SUPPORTED_UCS_VERSION_MAJOR, SUPPORTED_UCS_VERSION_MINOR
            );
            warn!(
                stream_id,
                version = %version,
                supported = %supported,
                "peer version incompatible, connection muted"
            );
        }

        if let Some(old_primary) = demoted {
            info!(
                from = old_primary,
                to = stream_id,
                "primary switched to loopback connection"
            );
            let affected: Vec<u32> = self
                .connections
                .get(&old_primary)
                .map(|c| c.registered_devices.iter().copied().collect())
                .unwrap_or_default();
            for device_id in affected {
                self.notify_device_peer_set(device_id);
            }
        }

        if !have_sibling {
            // First connection for this peer: start probing for links.
            self.detector.activate(true);
        }

        // Replay the device catalogue through the normal send path so
        // pending-registration tracking is populated.
        let registrations: Vec<VsmMessage> = self
            .devices
            .values()
            .map(|context| context.registration.clone())
            .collect();
        for registration in registrations {
            self.send_to_connection(stream_id, registration);
        }
    }

    /// Peer acknowledged (or rejected) one of our register_device requests.
    fn handle_registration_response(&mut self, stream_id: u32, message: VsmMessage) {
        let Some(connection) = self.connections.get_mut(&stream_id) else {
            return;
        };
        let message_id = message.message_id();
        let Some(device_id) = connection.pending_registrations.get(&message_id).copied() else {
            return;
        };
        let response = message.device_response.unwrap_or_default();

        match response.code() {
            StatusCode::Ok => {
                connection.pending_registrations.remove(&message_id);
                if !self.devices.contains_key(&device_id) {
                    // Raced with unregistration; the peer will see the
                    // unregister notice that is already on the wire.
                    debug!(device_id, stream_id, "registration ack for removed device");
                    return;
                }
                connection.registered_devices.insert(device_id);
                info!(device_id, stream_id, "device registered with UCS peer");
                self.notify_device_peer_set(device_id);

                // Catch the new peer up on everything already observed.
                if let Some(context) = self.devices.get(&device_id) {
                    let mut status = VsmMessage::for_device(device_id);
                    status.device_status = Some(context.status_snapshot());
                    self.send_to_connection(stream_id, status);
                }
            }
            StatusCode::InProgress => {
                debug!(
                    device_id,
                    stream_id,
                    progress = response.progress() as f64,
                    "device registration in progress"
                );
            }
            code => {
                warn!(
                    device_id,
                    stream_id,
                    code = ?code,
                    reason = response.status(),
                    "device registration rejected by UCS peer"
                );
                connection.pending_registrations.remove(&message_id);
            }
        }
    }

    /// Deliver a peer message to the addressed device, or answer for the
    /// peer itself when `device_id` is 0.
    fn route_to_device(&mut self, stream_id: u32, message: VsmMessage) {
        let device_id = message.device_id();
        let response_required = message.response_required();
        let message_id = message.message_id;

        if device_id == 0 {
            if response_required {
                let pong = VsmMessage {
                    device_id: Some(0),
                    message_id,
                    device_response: Some(DeviceResponse::ok()),
                    ..VsmMessage::default()
                };
                self.send_to_connection(stream_id, pong);
            }
            return;
        }

        match self.devices.get(&device_id) {
            Some(context) => {
                let responder = response_required.then(|| Responder {
                    template: VsmMessage {
                        device_id: Some(0),
                        message_id,
                        ..VsmMessage::default()
                    },
                    stream_id,
                    commands: self.command_tx.clone(),
                });
                if context
                    .device
                    .processing_ctx()
                    .send(DeviceEvent::UcsMessage { message, responder })
                    .is_err()
                {
                    debug!(device_id, "device processing context is gone");
                }
            }
            None if response_required => {
                debug!(device_id, stream_id, "request for unknown device");
                let response = VsmMessage {
                    device_id: Some(0),
                    message_id,
                    device_response: Some(DeviceResponse::with_code(StatusCode::InvalidSessionId)),
                    ..VsmMessage::default()
                };
                self.send_to_connection(stream_id, response);
            }
            None => {
                debug!(device_id, stream_id, "dropping message for unknown device");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------------

    /// Send on every primary connection.
    fn broadcast(&mut self, message: VsmMessage) {
        self.stats.broadcasts += 1;
        let targets: Vec<u32> = self
            .connections
            .values()
            .filter(|c| c.primary)
            .map(|c| c.stream_id)
            .collect();
        for stream_id in targets {
            self.send_to_connection(stream_id, message.clone());
        }
    }

    /// The one egress gate. Enforces the per-connection send rules in order:
    /// unregistered peers only ever see register_peer, muted connections see
    /// nothing, register_device acquires response tracking, device-bound
    /// traffic requires an acknowledged registration.
    fn send_to_connection(&mut self, stream_id: u32, mut message: VsmMessage) {
        // Allocated up front; ids are only required to be unique, gaps are
        // fine.
        let fresh_id = self.alloc_message_id();

        let Some(connection) = self.connections.get_mut(&stream_id) else {
            self.stats.messages_dropped += 1;
            return;
        };

        if connection.peer_id.is_none() {
            if message.register_peer.is_none() {
                error!(
                    stream_id,
                    address = %connection.address,
                    "refusing to send before peer registration"
                );
                self.stats.messages_dropped += 1;
                return;
            }
            message.device_id = Some(0);
        }

        if !connection.is_compatible {
            self.stats.messages_dropped += 1;
            return;
        }

        if message.register_device.is_some() {
            message.response_required = Some(true);
            message.message_id = Some(fresh_id);
            connection
                .pending_registrations
                .insert(fresh_id, message.device_id());
        } else if message.device_id() != 0 {
            let device_id = message.device_id();
            if !connection.registered_devices.contains(&device_id) {
                debug!(
                    stream_id,
                    device_id, "dropping message for device not registered on this connection"
                );
                self.stats.messages_dropped += 1;
                return;
            }
            if message.unregister_device.is_some() {
                connection.registered_devices.remove(&device_id);
                connection
                    .pending_registrations
                    .retain(|_, pending| *pending != device_id);
            }
        }

        if message.response_required() && message.message_id.is_none() {
            message.message_id = Some(fresh_id);
        }

        match encode_message(&message) {
            Ok(bytes) => {
                if connection.writer_tx.send(bytes).is_ok() {
                    self.stats.messages_sent += 1;
                } else {
                    // Writer already failed; its close event is in flight.
                    self.stats.messages_dropped += 1;
                }
            }
            Err(err) => {
                error!(stream_id, %err, "dropping oversize outbound message");
                self.stats.messages_dropped += 1;
            }
        }
    }

    fn alloc_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }

    // ------------------------------------------------------------------------
    // Teardown and failover
    // ------------------------------------------------------------------------

    /// Single teardown path for every way a connection dies: remove, re-elect
    /// a primary, tell affected devices, maybe park the detector.
    fn close_connection(&mut self, stream_id: u32, reason: &CloseReason) {
        let Some(connection) = self.connections.remove(&stream_id) else {
            return;
        };
        connection.abort_io();
        self.stats.connections_closed += 1;
        warn!(
            stream_id,
            connection = %connection.describe(),
            %reason,
            "UCS connection closed"
        );

        let mut affected: Vec<u32> = connection.registered_devices.iter().copied().collect();

        if connection.primary {
            if let Some(peer_id) = connection.peer_id {
                if let Some(promoted) = self.promote_sibling(peer_id) {
                    if let Some(new_primary) = self.connections.get(&promoted) {
                        info!(
                            from = stream_id,
                            to = promoted,
                            connection = %new_primary.describe(),
                            "primary failover"
                        );
                        affected.extend(new_primary.registered_devices.iter().copied());
                    }
                }
            }
        }

        affected.sort_unstable();
        affected.dedup();
        for device_id in affected {
            self.notify_device_peer_set(device_id);
        }

        if self.connections.is_empty() && !self.config.detector_on_when_disconnected {
            self.detector.activate(false);
        }
    }

    /// Pick the next primary among a peer's surviving connections,
    /// preferring loopback.
    fn promote_sibling(&mut self, peer_id: u32) -> Option<u32> {
        let mut fallback: Option<u32> = None;
        let mut loopback: Option<u32> = None;
        for connection in self.connections.values() {
            if connection.peer_id != Some(peer_id) {
                continue;
            }
            if connection.is_loopback() {
                loopback.get_or_insert(connection.stream_id);
            }
            fallback.get_or_insert(connection.stream_id);
        }
        let chosen = loopback.or(fallback)?;
        if let Some(connection) = self.connections.get_mut(&chosen) {
            connection.primary = true;
        }
        Some(chosen)
    }

    /// Tell a device which connections it is currently registered through.
    fn notify_device_peer_set(&self, device_id: u32) {
        let Some(context) = self.devices.get(&device_id) else {
            return;
        };
        let peers: Vec<UcsInfo> = self
            .connections
            .values()
            .filter(|c| c.registered_devices.contains(&device_id))
            .map(|c| UcsInfo {
                peer_id: c.peer_id.unwrap_or(0),
                address: c.address,
                primary: c.primary,
                last_message_time: c.last_message_time,
            })
            .collect();
        if context
            .device
            .processing_ctx()
            .send(DeviceEvent::UcsInfoChanged { peers })
            .is_err()
        {
            debug!(device_id, "device processing context is gone");
        }
    }

    // ------------------------------------------------------------------------
    // Keep-alive timer
    // ------------------------------------------------------------------------

    /// 1 Hz walk over all connections: ping registered peers, expire idle
    /// ones, expire stalled handshakes.
    fn on_tick(&mut self) {
        let now = Instant::now();
        let mut to_close: Vec<(u32, CloseReason)> = Vec::new();
        let mut to_ping: Vec<u32> = Vec::new();

        for connection in self.connections.values() {
            let idle = now.saturating_duration_since(connection.last_message_time);
            match connection.peer_id {
                Some(_) => {
                    if let Some(budget) = self.config.keep_alive_timeout {
                        if idle > budget {
                            to_close.push((connection.stream_id, CloseReason::PingTimeout));
                        } else {
                            to_ping.push(connection.stream_id);
                        }
                    }
                }
                None => {
                    if idle > REGISTER_PEER_TIMEOUT {
                        to_close.push((connection.stream_id, CloseReason::RegisterPeerTimeout));
                    }
                }
            }
        }

        for (stream_id, reason) in to_close {
            self.close_connection(stream_id, &reason);
        }
        for stream_id in to_ping {
            self.send_to_connection(stream_id, VsmMessage::ping());
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    fn teardown(&mut self) {
        for (_, connection) in self.connections.drain() {
            connection.abort_io();
        }
        if !self.devices.is_empty() {
            error!(
                count = self.devices.len(),
                "devices still registered at shutdown"
            );
            debug_assert!(
                self.devices.is_empty(),
                "all devices must be unregistered before shutdown"
            );
            self.devices.clear();
        }
        self.running = false;
    }
}
