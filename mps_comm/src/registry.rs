//! Backend registry.
//!
//! Maps a backend key to a factory that builds a running [`Machine`] from a
//! station entry. Constructed at start-up, populated with `register()` and
//! handed to [`crate::fleet::Fleet::from_config`].
//!
//! | Key | Built for | Backend |
//! |-----|-----------|---------|
//! | `simulation` | any station with `simulate = true` or `protocol = "simulation"` | polling for Modbus stations, pub/sub otherwise |
//! | `modbus` | live Modbus/TCP stations | polling |
//!
//! No `node` factory ships with the engine; a node-protocol client registers
//! its own.

use crate::backend::{BackendContext, PollingMachine, PubSubMachine};
use crate::machine::Machine;
use crate::transport::{ModbusTcpTransport, SimOptions, SimulatedStation, SimulatedTransport};
use mps_common::config::StationConfig;
use mps_common::error::{CommError, CommResult};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds a running machine for one station entry.
pub type BackendFactory =
    Arc<dyn Fn(&StationConfig, &BackendContext) -> CommResult<Arc<dyn Machine>> + Send + Sync>;

/// Key of the in-process station model.
pub const SIMULATION_BACKEND: &str = "simulation";

/// Key of the Modbus/TCP backend.
pub const MODBUS_BACKEND: &str = "modbus";

/// Backend key a station entry is built with.
pub fn backend_key(station: &StationConfig) -> &'static str {
    if station.is_simulated() {
        SIMULATION_BACKEND
    } else {
        station.protocol.as_str()
    }
}

/// Registry of available backends.
pub struct BackendRegistry {
    factories: HashMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the simulation and Modbus backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.factories.insert(SIMULATION_BACKEND, Arc::new(simulated_machine));
        registry.factories.insert(MODBUS_BACKEND, Arc::new(modbus_machine));
        registry
    }

    /// Register a factory under `key`.
    ///
    /// # Errors
    /// Returns `CommError::Config` if `key` is already registered.
    pub fn register(&mut self, key: &'static str, factory: BackendFactory) -> CommResult<()> {
        if self.factories.contains_key(key) {
            return Err(CommError::Config(format!(
                "backend '{key}' is already registered"
            )));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    /// True if a factory is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Build and start the machine for `station`.
    ///
    /// # Errors
    /// `CommError::Config` if the entry is invalid or no factory handles it,
    /// otherwise whatever the factory returns.
    pub fn create(
        &self,
        station: &StationConfig,
        ctx: &BackendContext,
    ) -> CommResult<Arc<dyn Machine>> {
        station.validate()?;
        let key = backend_key(station);
        let factory = self.factories.get(key).ok_or_else(|| {
            CommError::Config(format!(
                "no backend registered for '{key}' (station '{}')",
                station.name
            ))
        })?;
        debug!(station = %station.name, backend = key, "Creating machine");
        factory(station, ctx)
    }

    /// Registered keys, sorted.
    pub fn list(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.factories.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.list())
            .finish()
    }
}

fn simulated_machine(
    station: &StationConfig,
    ctx: &BackendContext,
) -> CommResult<Arc<dyn Machine>> {
    let model = SimulatedStation::new(station.machine_type, SimOptions::default());
    let transport = Box::new(SimulatedTransport::new(model));
    if station.protocol.is_polling() {
        Ok(Arc::new(PollingMachine::start(station.clone(), transport, ctx)?))
    } else {
        Ok(Arc::new(PubSubMachine::start(station.clone(), transport, ctx)?))
    }
}

fn modbus_machine(station: &StationConfig, ctx: &BackendContext) -> CommResult<Arc<dyn Machine>> {
    let transport = Box::new(ModbusTcpTransport::new(
        station.endpoint(),
        station.unit_id,
        station.machine_type.modbus_map(),
    ));
    Ok(Arc::new(PollingMachine::start(station.clone(), transport, ctx)?))
}
