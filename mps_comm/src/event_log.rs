//! Event log sink.
//!
//! The engine reports two kinds of human-readable events to a caller-supplied
//! sink: the final value of a subscription when it is torn down, and every
//! failed instruction. Formatting is up to the sink.

use mps_common::error::CommError;
use mps_common::instruction::Instruction;
use mps_common::register::{MpsRegister, RegisterValue};
use tracing::{info, warn};

/// Caller-supplied logging sink.
pub trait EventLog: Send + Sync {
    /// A subscription was cancelled; `value` is the last value seen.
    fn subscription_final(&self, station: &str, register: MpsRegister, value: Option<RegisterValue>);

    /// An instruction failed.
    fn instruction_failed(&self, station: &str, instruction: &Instruction, error: &CommError);
}

/// Default sink emitting `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn subscription_final(&self, station: &str, register: MpsRegister, value: Option<RegisterValue>) {
        match value {
            Some(value) => info!(station, %register, %value, "Subscription closed"),
            None => info!(station, %register, "Subscription closed without value"),
        }
    }

    fn instruction_failed(&self, station: &str, instruction: &Instruction, error: &CommError) {
        warn!(station, %instruction, %error, "Instruction failed");
    }
}
