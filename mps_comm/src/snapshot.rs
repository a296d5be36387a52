//! Read-only machine snapshots for external consumers.

use crate::dispatcher::DispatchStats;
use crate::heartbeat::HeartbeatStats;
use crate::session::SessionState;
use mps_common::config::Protocol;
use mps_common::instruction::Instruction;
use mps_common::machine::MachineType;
use mps_common::register::{MpsRegister, RegisterValue};
use serde::Serialize;
use std::collections::BTreeMap;

/// Backend driving a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Queue + subscriptions.
    PubSub,
    /// Synchronous register polling.
    Polling,
}

/// Point-in-time view of one machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineSnapshot {
    /// Station name.
    pub name: String,
    /// Station type.
    pub machine_type: MachineType,
    /// Configured protocol.
    pub protocol: Protocol,
    /// Backend kind.
    pub backend: BackendKind,
    /// Session state.
    pub session: SessionState,
    /// Session generation.
    pub generation: u64,
    /// Station identified on the current session.
    pub identified: bool,
    /// Instructions waiting.
    pub queue_len: usize,
    /// Instruction executing, if any.
    pub in_flight: Option<Instruction>,
    /// Last known register values.
    pub values: BTreeMap<MpsRegister, RegisterValue>,
    /// Instruction counters.
    pub dispatch: DispatchStats,
    /// Liveness counters.
    pub heartbeat: HeartbeatStats,
}

impl MachineSnapshot {
    /// True if the machine accepts instructions right now.
    pub fn is_ready(&self) -> bool {
        self.session == SessionState::Ready
    }

    /// Render as JSON.
    ///
    /// # Errors
    /// Returns the serializer error.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
