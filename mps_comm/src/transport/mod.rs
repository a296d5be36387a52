//! Field transports.
//!
//! A [`Transport`] is the protocol SDK seam: connect, read and write single
//! registers, and (for subscription-capable protocols) deliver value changes
//! of monitored registers to a [`NotificationSink`]. Sessions own exactly one
//! transport and serialize access to it.
//!
//! - [`sim`] - in-process station model with monitored items
//! - [`modbus`] - Modbus/TCP client over fixed register addresses

pub mod modbus;
pub mod sim;

use crate::subscription::NotificationSink;
use mps_common::error::{CommError, CommResult};
use mps_common::register::{MpsRegister, RegisterValue};

pub use modbus::ModbusTcpTransport;
pub use sim::{SimOptions, SimulatedStation, SimulatedTransport};

/// Low-level link to one station controller.
///
/// Implementations are driven from one thread at a time (the session holds
/// the transport behind a lock) but must be `Send`. Notifications may be
/// pushed into a sink from any thread the implementation owns.
pub trait Transport: Send {
    /// Short transport name for logs.
    fn name(&self) -> &'static str;

    /// Open the link.
    ///
    /// # Errors
    /// Returns `CommError::Transport` if the controller cannot be reached.
    fn open(&mut self) -> CommResult<()>;

    /// Close the link and drop every monitored item. Idempotent.
    fn close(&mut self);

    /// Read one register.
    ///
    /// # Errors
    /// Returns `CommError::Transport` on I/O failure, `CommError::Unsupported`
    /// if the station does not expose the register.
    fn read(&mut self, register: MpsRegister) -> CommResult<RegisterValue>;

    /// Write one register.
    ///
    /// # Errors
    /// Returns `CommError::Transport` on I/O failure, `CommError::Unsupported`
    /// if the station does not expose the register.
    fn write(&mut self, register: MpsRegister, value: RegisterValue) -> CommResult<()>;

    /// True if [`Transport::monitor`] is available.
    fn supports_monitoring(&self) -> bool {
        false
    }

    /// Start delivering value changes of `register` to `sink`. The current
    /// value is delivered once right away. Monitoring a register twice
    /// replaces the previous sink.
    ///
    /// # Errors
    /// Returns `CommError::Unsupported` on register-polling transports.
    fn monitor(&mut self, register: MpsRegister, sink: NotificationSink) -> CommResult<()> {
        let _ = sink;
        Err(CommError::unsupported(format!(
            "{} transport cannot monitor {register}",
            self.name()
        )))
    }

    /// Stop delivering value changes of `register`.
    fn unmonitor(&mut self, register: MpsRegister) {
        let _ = register;
    }
}
