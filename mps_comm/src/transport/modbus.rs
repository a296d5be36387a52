//! Modbus/TCP transport.
//!
//! Register-based link using the blocking `tokio-modbus` client. Every
//! register is lowered through the station's [`ModbusMap`]; registers the
//! station does not expose fail with `Unsupported`. Monitoring is not
//! available, so stations on this transport are driven by the polling backend.

use super::Transport;
use mps_common::consts::MODBUS_REQUEST_TIMEOUT;
use mps_common::error::{CommError, CommResult};
use mps_common::machine::{ModbusAddress, ModbusMap, ModbusTable};
use mps_common::register::{MpsRegister, RegisterValue, ValueKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio_modbus::client::sync::{self, Reader, Writer};
use tokio_modbus::prelude::Slave;
use tracing::{debug, info};

/// Blocking Modbus/TCP client for one station.
pub struct ModbusTcpTransport {
    endpoint: String,
    unit_id: u8,
    map: ModbusMap,
    timeout: Duration,
    ctx: Option<sync::Context>,
}

impl ModbusTcpTransport {
    /// Create a closed link to `endpoint` (`host:port`).
    pub fn new(endpoint: impl Into<String>, unit_id: u8, map: ModbusMap) -> Self {
        Self {
            endpoint: endpoint.into(),
            unit_id,
            map,
            timeout: MODBUS_REQUEST_TIMEOUT,
            ctx: None,
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Address map in use.
    pub fn map(&self) -> &ModbusMap {
        &self.map
    }

    fn resolve(&self) -> CommResult<SocketAddr> {
        self.endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| CommError::transport(format!("cannot resolve {}", self.endpoint)))
    }

    fn address(&self, register: MpsRegister) -> CommResult<ModbusAddress> {
        self.map.get(register).ok_or_else(|| {
            CommError::unsupported(format!("{register} is not mapped on this station"))
        })
    }

    fn context(&mut self) -> CommResult<&mut sync::Context> {
        self.ctx
            .as_mut()
            .ok_or_else(|| CommError::transport("modbus link not open"))
    }
}

fn first<T: Copy>(values: Vec<T>, register: MpsRegister) -> CommResult<T> {
    values.first().copied().ok_or_else(|| CommError::ProtocolViolation {
        register,
        expected: register.kind(),
        actual: "empty response".to_string(),
    })
}

/// Convert a raw table value to the register's declared kind. Flags may sit
/// in word tables (the pick & place station reports ready as an input register).
fn decode(register: MpsRegister, raw: u16) -> RegisterValue {
    match register.kind() {
        ValueKind::Boolean => RegisterValue::Bool(raw != 0),
        ValueKind::Word => RegisterValue::Word(raw),
    }
}

impl Transport for ModbusTcpTransport {
    fn name(&self) -> &'static str {
        "modbus"
    }

    fn open(&mut self) -> CommResult<()> {
        self.close();
        let addr = self.resolve()?;
        let ctx = sync::tcp::connect_slave_with_timeout(addr, Slave(self.unit_id), Some(self.timeout))?;
        info!(endpoint = %self.endpoint, unit = self.unit_id, "Modbus link open");
        self.ctx = Some(ctx);
        Ok(())
    }

    fn close(&mut self) {
        if self.ctx.take().is_some() {
            debug!(endpoint = %self.endpoint, "Modbus link closed");
        }
    }

    fn read(&mut self, register: MpsRegister) -> CommResult<RegisterValue> {
        let ModbusAddress { table, address } = self.address(register)?;
        let ctx = self.context()?;
        let raw = match table {
            ModbusTable::Coil => u16::from(first(ctx.read_coils(address, 1)?, register)?),
            ModbusTable::DiscreteInput => {
                u16::from(first(ctx.read_discrete_inputs(address, 1)?, register)?)
            }
            ModbusTable::InputRegister => first(ctx.read_input_registers(address, 1)?, register)?,
            ModbusTable::HoldingRegister => {
                first(ctx.read_holding_registers(address, 1)?, register)?
            }
        };
        Ok(decode(register, raw))
    }

    fn write(&mut self, register: MpsRegister, value: RegisterValue) -> CommResult<()> {
        let target = self.address(register)?;
        if !target.is_writable() {
            return Err(CommError::unsupported(format!(
                "{register} is mapped to read-only {:?}",
                target.table
            )));
        }
        let ctx = self.context()?;
        match target.table {
            ModbusTable::Coil => ctx.write_single_coil(target.address, value.as_bool())?,
            _ => ctx.write_single_register(target.address, value.as_word())?,
        }
        Ok(())
    }
}
