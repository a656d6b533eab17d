//! UCS link configuration
//!
//! The embedding program owns the properties store; this module only knows
//! which keys the link core recognizes and how to fold them into a config
//! struct.

use std::collections::HashMap;
use std::time::Duration;

/// Properties-store key that disables the entire link core.
pub const KEY_DISABLE: &str = "ucs.disable";
/// Properties-store key that pins the transport detector on even with no
/// UCS connected. The spelling matches the deployed properties files.
pub const KEY_DETECTOR_ON_WHEN_DISCONNECTED: &str = "ucs.transport_detector_on_when_diconnected";
/// Properties-store key holding the keep-alive timeout in seconds.
pub const KEY_KEEP_ALIVE_TIMEOUT: &str = "ucs.keep_alive_timeout";

/// Runtime configuration for the UCS link core.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UcsConfig {
    /// When true the processor accepts no connections and every API call
    /// fails with [`UcsError::Shutdown`](crate::UcsError::Shutdown).
    pub disable: bool,
    /// Keep the transport detector active even while no UCS is connected.
    pub detector_on_when_disconnected: bool,
    /// Idle budget for registered peers. `None` disables keep-alive pings
    /// and the idle timeout; the pre-handshake timeout always applies.
    pub keep_alive_timeout: Option<Duration>,
    /// Name announced in our `register_peer`.
    pub vsm_name: String,
}

impl Default for UcsConfig {
    fn default() -> Self {
        Self {
            disable: false,
            detector_on_when_disconnected: false,
            keep_alive_timeout: None,
            vsm_name: "vsm".to_string(),
        }
    }
}

impl UcsConfig {
    /// Fold the recognized `ucs.*` keys out of a properties store.
    ///
    /// Presence alone triggers the boolean keys; `ucs.keep_alive_timeout`
    /// must parse as a positive integer of seconds or it is treated as
    /// absent.
    pub fn from_properties(props: &HashMap<String, String>) -> Self {
        let keep_alive_timeout = props
            .get(KEY_KEEP_ALIVE_TIMEOUT)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        Self {
            disable: props.contains_key(KEY_DISABLE),
            detector_on_when_disconnected: props.contains_key(KEY_DETECTOR_ON_WHEN_DISCONNECTED),
            keep_alive_timeout,
            ..Self::default()
        }
    }
}
