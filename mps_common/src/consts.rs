//! Engine-wide constants.
//!
//! Command codes understood by the station controllers and the default
//! timing of the dispatcher and heartbeat loops.

use std::time::Duration;

// ─── Command codes ──────────────────────────────────────────────────

/// No-op job; also written to cancel a running job.
pub const COMMAND_NOTHING: u16 = 0;

/// Tell the station controller which machine type it runs (payload0 = type code).
pub const COMMAND_SET_TYPE: u16 = 10;

/// Switch every light off.
pub const LIGHT_COLOR_RESET: u16 = 20;

/// Red light (payload0 = state, payload1 = duration in seconds).
pub const LIGHT_COLOR_RED: u16 = 21;

/// Yellow light.
pub const LIGHT_COLOR_YELLOW: u16 = 22;

/// Green light.
pub const LIGHT_COLOR_GREEN: u16 = 23;

/// Offset of the conveyor command from the machine type code.
pub const COMMAND_MOVE_CONVEYOR_OFFSET: u16 = 2;

/// Offset of the main station job (dispense, cap, mount ring, deliver,
/// retrieve, produce).
pub const COMMAND_JOB_OFFSET: u16 = 1;

/// Offset of the storage station's store job.
pub const COMMAND_STORE_OFFSET: u16 = 3;

/// Offset of the ring station's slide counter reset.
pub const COMMAND_SLIDE_RESET_OFFSET: u16 = 4;

// ─── Timing ─────────────────────────────────────────────────────────

/// Heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive failed liveness checks before a pub/sub session is rebuilt.
pub const PUBSUB_HEARTBEAT_FAILURES: u32 = 2;

/// Consecutive failed liveness checks before a polling link is rebuilt.
pub const POLLING_HEARTBEAT_FAILURES: u32 = 1;

/// Granularity of worker waits: cancellation checkpoints and register polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Light command timeout.
pub const LIGHT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout applied to conveyor moves.
pub const CONVEYOR_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout applied to station reset.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout applied to station-specific jobs.
pub const JOB_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport-level timeout for single Modbus requests.
pub const MODBUS_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Default Modbus/TCP port.
pub const DEFAULT_MODBUS_PORT: u16 = 502;

/// Default port of node-based station controllers.
pub const DEFAULT_NODE_PORT: u16 = 4840;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mps/comm.toml";
