//! Machines of one installation, keyed by station name.

use crate::backend::BackendContext;
use crate::event_log::EventLog;
use crate::machine::Machine;
use crate::registry::BackendRegistry;
use crate::session::SessionState;
use crate::snapshot::MachineSnapshot;
use mps_common::config::CommConfig;
use mps_common::error::{CommError, CommResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const READY_POLL: Duration = Duration::from_millis(20);

/// Running machines keyed by station name.
#[derive(Default)]
pub struct Fleet {
    machines: BTreeMap<String, Arc<dyn Machine>>,
}

impl Fleet {
    /// Empty fleet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `config` and start one machine per station entry.
    ///
    /// # Errors
    /// `CommError::Config` for an invalid configuration or a station no
    /// backend handles. Machines started before the failure are shut down.
    pub fn from_config(
        config: &CommConfig,
        backends: &BackendRegistry,
        log: Arc<dyn EventLog>,
    ) -> CommResult<Self> {
        config.validate()?;
        let ctx = BackendContext::from_config(config, log);
        let mut fleet = Self::new();
        for station in &config.stations {
            match backends.create(station, &ctx) {
                Ok(machine) => fleet.insert(machine)?,
                Err(e) => {
                    fleet.shutdown();
                    return Err(e);
                }
            }
        }
        info!(stations = fleet.len(), "Fleet started");
        Ok(fleet)
    }

    /// Add a running machine.
    ///
    /// # Errors
    /// `CommError::Config` if a machine with the same name exists.
    pub fn insert(&mut self, machine: Arc<dyn Machine>) -> CommResult<()> {
        let name = machine.name().to_string();
        if self.machines.contains_key(&name) {
            return Err(CommError::Config(format!("duplicate station name '{name}'")));
        }
        self.machines.insert(name, machine);
        Ok(())
    }

    /// Machine named `name`.
    pub fn machine(&self, name: &str) -> Option<Arc<dyn Machine>> {
        self.machines.get(name).cloned()
    }

    /// Station names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.machines.keys().map(String::as_str).collect()
    }

    /// Number of machines.
    pub fn len(&self) -> usize {
        self.machines.len()
    }

    /// True if the fleet has no machines.
    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    /// Snapshot of every machine, in name order.
    pub fn snapshots(&self) -> Vec<MachineSnapshot> {
        self.machines.values().map(|m| m.snapshot()).collect()
    }

    /// Wait up to `timeout` for every machine to reach `Ready`. Returns the
    /// names of machines that did not.
    pub fn wait_ready(&self, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: Vec<String> = self
                .machines
                .iter()
                .filter(|(_, m)| m.session_state() != SessionState::Ready)
                .map(|(name, _)| name.clone())
                .collect();
            let now = Instant::now();
            if pending.is_empty() || now >= deadline {
                return pending;
            }
            thread::sleep(READY_POLL.min(deadline - now));
        }
    }

    /// Shut every machine down.
    pub fn shutdown(&self) {
        for machine in self.machines.values() {
            machine.shutdown();
        }
    }
}
