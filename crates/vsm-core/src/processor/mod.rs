//! UCS processor: handle, builder, and the core task
//!
//! The processor is a single long-lived value owned by the embedding
//! program. [`UcsProcessorBuilder`] wires the channels and spawns the core
//! task; [`UcsProcessor`] is the device-facing handle. All core state lives
//! inside the task and is reached only through channels, so a completion
//! arriving after shutdown lands in a closed channel instead of freed state.

mod io;
mod task;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use vsm_proto::VsmMessage;

use crate::config::UcsConfig;
use crate::detector::{IncomingLink, NullDetector, TransportDetector};
use crate::device::Device;
use crate::error::{UcsError, UcsResult};

/// Budget for one frame write; expiry is terminal for the connection.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a freshly accepted connection may stall before its
/// `register_peer` must have arrived.
pub const REGISTER_PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// Callback invoked on the core task whenever an inbound connection is
/// accepted.
pub type NewConnectionCallback = Box<dyn Fn() + Send>;

/// Requests into the core task.
#[derive(Debug)]
pub(crate) enum UcsCommand {
    RegisterDevice {
        device: Arc<dyn Device>,
        reply: oneshot::Sender<UcsResult<()>>,
    },
    UnregisterDevice {
        device_id: u32,
    },
    SendUcsMessage {
        device_id: u32,
        message: VsmMessage,
        stream_id: u32,
    },
    /// Completed response template going back over a specific connection.
    SendOnStream {
        stream_id: u32,
        message: VsmMessage,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Running counters, published through a watch channel after every
/// processed request.
#[derive(Debug, Clone, Default)]
pub struct UcsStats {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub frames_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub broadcasts: u64,
    pub devices_registered: u64,
    pub devices_unregistered: u64,
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder wiring the processor's channels and collaborators.
pub struct UcsProcessorBuilder {
    config: UcsConfig,
    detector: Arc<dyn TransportDetector>,
    on_new_connection: Option<NewConnectionCallback>,
}

impl Default for UcsProcessorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UcsProcessorBuilder {
    pub fn new() -> Self {
        Self {
            config: UcsConfig::default(),
            detector: Arc::new(NullDetector),
            on_new_connection: None,
        }
    }

    pub fn with_config(mut self, config: UcsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn TransportDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Register a callback fired whenever an inbound UCS connection is
    /// accepted.
    pub fn on_new_connection(mut self, callback: NewConnectionCallback) -> Self {
        self.on_new_connection = Some(callback);
        self
    }

    /// Spawn the core task and return the handle.
    ///
    /// With `ucs.disable` set nothing is spawned: the handle's channels are
    /// closed and every call reports [`UcsError::Shutdown`].
    pub fn build(self) -> UcsProcessor {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(UcsStats::default());

        if self.config.disable {
            tracing::info!("UCS link core disabled by configuration");
            return UcsProcessor {
                commands: command_tx,
                links: link_tx,
                stats: stats_rx,
                task: None,
            };
        }

        // Stable process-instance identifier announced in our register_peer.
        let local_peer_id = loop {
            let candidate: u32 = rand::random();
            if candidate != 0 {
                break candidate;
            }
        };

        let core = task::UcsCoreTask::new(
            self.config,
            self.detector,
            self.on_new_connection,
            local_peer_id,
            command_tx.clone(),
            command_rx,
            link_rx,
            stats_tx,
        );
        let task = tokio::spawn(core.run());

        UcsProcessor {
            commands: command_tx,
            links: link_tx,
            stats: stats_rx,
            task: Some(task),
        }
    }
}

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

/// Device-facing handle to the UCS link core.
pub struct UcsProcessor {
    commands: mpsc::UnboundedSender<UcsCommand>,
    links: mpsc::UnboundedSender<IncomingLink>,
    stats: watch::Receiver<UcsStats>,
    task: Option<JoinHandle<()>>,
}

impl UcsProcessor {
    pub fn builder() -> UcsProcessorBuilder {
        UcsProcessorBuilder::new()
    }

    /// Register a local device.
    ///
    /// Returns once the device has populated its registration record and the
    /// core has stored it; the registration broadcast to connected peers
    /// happens right after.
    pub async fn register_device(&self, device: Arc<dyn Device>) -> UcsResult<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(UcsCommand::RegisterDevice { device, reply })
            .map_err(|_| UcsError::Shutdown)?;
        done.await.map_err(|_| UcsError::Shutdown)?
    }

    /// Remove a device and broadcast the unregister notice.
    pub fn unregister_device(&self, device_id: u32) -> UcsResult<()> {
        self.commands
            .send(UcsCommand::UnregisterDevice { device_id })
            .map_err(|_| UcsError::Shutdown)
    }

    /// Send a device-originated message. `stream_id` 0 broadcasts to every
    /// primary connection; a non-zero id targets one connection.
    pub fn send_ucs_message(
        &self,
        device_id: u32,
        message: VsmMessage,
        stream_id: u32,
    ) -> UcsResult<()> {
        self.commands
            .send(UcsCommand::SendUcsMessage {
                device_id,
                message,
                stream_id,
            })
            .map_err(|_| UcsError::Shutdown)
    }

    /// Sender the transport detector feeds accepted connections into.
    pub fn link_sender(&self) -> mpsc::UnboundedSender<IncomingLink> {
        self.links.clone()
    }

    /// Snapshot of the running counters.
    pub fn stats(&self) -> UcsStats {
        self.stats.borrow().clone()
    }

    /// Tear down every connection and stop the core task.
    ///
    /// All devices must have been unregistered first; leftovers are a
    /// programming error (asserted in debug builds, logged otherwise).
    pub async fn shutdown(mut self) -> UcsResult<()> {
        let (reply, done) = oneshot::channel();
        if self.commands.send(UcsCommand::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}
