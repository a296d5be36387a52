//! Instruction value object.
//!
//! One atomic actuation request: command code, job lane, up to two payload
//! words, a timeout and the initial status / error bytes written with the job.

use crate::error::CommError;
use crate::register::JobLane;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

bitflags! {
    /// Lane status bits carried by an instruction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StatusBits: u8 {
        /// Start the job.
        const ENABLE = 0x01;
        /// Job running.
        const BUSY   = 0x02;
        /// Lane accepts the next job.
        const READY  = 0x04;
        /// Last job failed.
        const ERROR  = 0x08;
    }
}

impl Default for StatusBits {
    fn default() -> Self {
        Self::ENABLE
    }
}

/// One queued actuation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Command code (see [`crate::consts`]).
    pub command: u16,
    /// Lane the job is written to.
    pub lane: JobLane,
    /// Payload words.
    pub payload: [u16; 2],
    /// Deadline for the expected post-condition. Zero means one polling interval.
    pub timeout: Duration,
    /// Initial status bits.
    pub status: StatusBits,
    /// Initial error byte.
    pub error: u8,
}

impl Instruction {
    /// Create an instruction with empty payload, zero timeout and default status.
    pub fn new(lane: JobLane, command: u16) -> Self {
        Self {
            command,
            lane,
            payload: [0, 0],
            timeout: Duration::ZERO,
            status: StatusBits::default(),
            error: 0,
        }
    }

    /// Set both payload words.
    pub fn with_payload(mut self, payload0: u16, payload1: u16) -> Self {
        self.payload = [payload0, payload1];
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the initial status bits.
    pub fn with_status(mut self, status: StatusBits) -> Self {
        self.status = status;
        self
    }

    /// Set the initial error byte.
    pub fn with_error(mut self, error: u8) -> Self {
        self.error = error;
        self
    }

    /// Effective wait budget given the engine's polling interval.
    pub fn deadline_budget(&self, poll_interval: Duration) -> Duration {
        if self.timeout.is_zero() {
            poll_interval
        } else {
            self.timeout
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cmd={} lane={} payload=[{}, {}] timeout={:?} status={:#04x} error={}",
            self.command,
            self.lane,
            self.payload[0],
            self.payload[1],
            self.timeout,
            self.status.bits(),
            self.error
        )
    }
}

/// Final result of one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionOutcome {
    /// The station reported the expected post-condition.
    Completed,
    /// The instruction failed; the error says why.
    Failed(CommError),
}

impl InstructionOutcome {
    /// True for [`InstructionOutcome::Completed`].
    pub fn is_completed(&self) -> bool {
        matches!(self, InstructionOutcome::Completed)
    }

    /// Convert to a `Result`.
    pub fn into_result(self) -> Result<(), CommError> {
        match self {
            InstructionOutcome::Completed => Ok(()),
            InstructionOutcome::Failed(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let instr = Instruction::new(JobLane::Basic, 21)
            .with_payload(1, 5)
            .with_timeout(Duration::from_secs(2))
            .with_error(3);
        assert_eq!(instr.command, 21);
        assert_eq!(instr.payload, [1, 5]);
        assert_eq!(instr.timeout, Duration::from_secs(2));
        assert_eq!(instr.status, StatusBits::ENABLE);
        assert_eq!(instr.error, 3);
    }

    #[test]
    fn zero_timeout_uses_one_poll_interval() {
        let poll = Duration::from_millis(50);
        let instr = Instruction::new(JobLane::In, 101);
        assert_eq!(instr.deadline_budget(poll), poll);
        let instr = instr.with_timeout(Duration::from_secs(1));
        assert_eq!(instr.deadline_budget(poll), Duration::from_secs(1));
    }

    #[test]
    fn outcome_into_result() {
        assert!(InstructionOutcome::Completed.into_result().is_ok());
        assert_eq!(
            InstructionOutcome::Failed(CommError::Aborted).into_result(),
            Err(CommError::Aborted)
        );
    }

    #[test]
    fn display_is_compact() {
        let text = Instruction::new(JobLane::Basic, 10).with_payload(300, 0).to_string();
        assert!(text.starts_with("cmd=10 lane=basic payload=[300, 0]"));
    }
}
