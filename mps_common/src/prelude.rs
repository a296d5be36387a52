//! Prelude module for common re-exports.
//!
//! ```rust
//! use mps_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    CommConfig, ConfigError, ConfigLoader, DispatcherConfig, HeartbeatConfig, LogLevel, Protocol,
    SharedConfig, StationConfig,
};

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{CommError, CommResult};

// ─── Registers & instructions ───────────────────────────────────────
pub use crate::instruction::{Instruction, InstructionOutcome, StatusBits};
pub use crate::register::{JobLane, MpsRegister, RegisterDirection, RegisterValue, ValueKind};

// ─── Machine types ──────────────────────────────────────────────────
pub use crate::machine::{
    BaseColor, CapOperation, ConveyorDirection, LightColor, LightState, MachineType, ModbusAddress,
    ModbusMap, ModbusTable, MpsSensor, StationSide,
};
