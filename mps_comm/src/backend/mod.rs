//! Protocol backends.
//!
//! | Backend | Used for | Execution |
//! |---------|----------|-----------|
//! | [`PubSubMachine`] | node protocol, simulation | queued, worker thread, completion by notification |
//! | [`PollingMachine`] | Modbus/TCP | in the caller's thread, completion by polling |

pub mod polling;
pub mod pubsub;

pub use polling::PollingMachine;
pub use pubsub::PubSubMachine;

use crate::event_log::{EventLog, TracingEventLog};
use mps_common::config::{CommConfig, DispatcherConfig, HeartbeatConfig};
use std::fmt;
use std::sync::Arc;

/// Engine settings shared by every machine built from one configuration.
#[derive(Clone)]
pub struct BackendContext {
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// Dispatcher settings.
    pub dispatcher: DispatcherConfig,
    /// Event sink for final subscription values and failed instructions.
    pub log: Arc<dyn EventLog>,
}

impl BackendContext {
    /// Take the engine sections of `config`.
    pub fn from_config(config: &CommConfig, log: Arc<dyn EventLog>) -> Self {
        Self {
            heartbeat: config.heartbeat.clone(),
            dispatcher: config.dispatcher.clone(),
            log,
        }
    }
}

impl Default for BackendContext {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            dispatcher: DispatcherConfig::default(),
            log: Arc::new(TracingEventLog),
        }
    }
}

impl fmt::Debug for BackendContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendContext")
            .field("heartbeat", &self.heartbeat)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
