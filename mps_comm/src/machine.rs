//! Machine capability surface.
//!
//! [`Machine`] is implemented by both protocol backends. Capability methods
//! are provided on top of [`Machine::submit`], so a light or conveyor request
//! lowers to the same [`Instruction`] whichever protocol drives the station.
//! Station-specific jobs live in [`StationCommands`] and check the station
//! type before submitting anything.

use crate::dispatcher::InstructionHandle;
use crate::session::SessionState;
use crate::snapshot::MachineSnapshot;
use crate::subscription::{Callback, SubscriptionHandle, ValueSlot};
use mps_common::config::Protocol;
use mps_common::error::{CommError, CommResult};
use mps_common::instruction::Instruction;
use mps_common::machine::{
    self as tables, BaseColor, CapOperation, ConveyorDirection, LightColor, LightState,
    MachineType, MpsSensor, StationSide,
};
use mps_common::register::{MpsRegister, RegisterValue};
use std::time::Duration;

/// Capabilities shared by every station.
pub trait Machine: Send + Sync {
    /// Station name.
    fn name(&self) -> &str;

    /// Station type.
    fn machine_type(&self) -> MachineType;

    /// Configured field protocol.
    fn protocol(&self) -> Protocol;

    /// Hand one instruction to the backend.
    ///
    /// The pub/sub backend queues it and returns a pending handle. The
    /// polling backend runs it before returning an already-completed handle.
    ///
    /// # Errors
    /// `CommError::SessionNotReady` from the polling backend when the link is
    /// down. Execution failures are reported through the handle.
    fn submit(&self, instruction: Instruction) -> CommResult<InstructionHandle>;

    /// Cancel the instruction currently executing. Returns false when idle.
    fn abort(&self) -> bool;

    /// Session state.
    fn session_state(&self) -> SessionState;

    /// Last value delivered for `register`.
    fn register_value(&self, register: MpsRegister) -> Option<RegisterValue>;

    /// Read `register` from the device now.
    ///
    /// # Errors
    /// Transport and protocol errors of the session.
    fn read_register(&self, register: MpsRegister) -> CommResult<RegisterValue>;

    /// Subscribe to `register` with an optional callback and output slot.
    /// Simulation subscriptions only receive [`Machine::push_simulated`]
    /// values.
    ///
    /// # Errors
    /// Transport error while installing the monitored item.
    fn add_callback(
        &self,
        register: MpsRegister,
        callback: Option<Callback>,
        slot: Option<ValueSlot>,
        simulation: bool,
    ) -> CommResult<SubscriptionHandle>;

    /// Inject a value through the notification path.
    fn push_simulated(&self, register: MpsRegister, value: RegisterValue);

    /// Read-only view of the machine.
    fn snapshot(&self) -> MachineSnapshot;

    /// Stop threads and close the link. Idempotent.
    fn shutdown(&self);

    /// Drive one signal light. A zero `duration` keeps the light on.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn set_light(
        &self,
        color: LightColor,
        state: LightState,
        duration: Duration,
    ) -> CommResult<InstructionHandle> {
        let secs = u16::try_from(duration.as_secs()).unwrap_or(u16::MAX);
        self.submit(tables::light_instruction(color, state, secs))
    }

    /// Set all three lights.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn set_lights(
        &self,
        red: LightState,
        yellow: LightState,
        green: LightState,
    ) -> CommResult<Vec<InstructionHandle>> {
        Ok(vec![
            self.set_light(LightColor::Red, red, tables::LIGHT_INDEFINITE)?,
            self.set_light(LightColor::Yellow, yellow, tables::LIGHT_INDEFINITE)?,
            self.set_light(LightColor::Green, green, tables::LIGHT_INDEFINITE)?,
        ])
    }

    /// Run the conveyor until `sensor` triggers.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn conveyor_move(
        &self,
        direction: ConveyorDirection,
        sensor: MpsSensor,
    ) -> CommResult<InstructionHandle> {
        self.submit(tables::conveyor_instruction(
            self.machine_type(),
            direction,
            sensor,
        ))
    }

    /// Move the workpiece back to the input sensor.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn band_on_until_in(&self) -> CommResult<InstructionHandle> {
        self.conveyor_move(ConveyorDirection::Backward, MpsSensor::Input)
    }

    /// Move the workpiece to the middle sensor.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn band_on_until_mid(&self) -> CommResult<InstructionHandle> {
        self.conveyor_move(ConveyorDirection::Forward, MpsSensor::Middle)
    }

    /// Move the workpiece to the output sensor.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn band_on_until_out(&self) -> CommResult<InstructionHandle> {
        self.conveyor_move(ConveyorDirection::Forward, MpsSensor::Output)
    }

    /// Reset the station. One handle per instruction of the reset sequence.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn reset(&self) -> CommResult<Vec<InstructionHandle>> {
        self.machine_type()
            .reset_sequence()
            .into_iter()
            .map(|instruction| self.submit(instruction))
            .collect()
    }

    /// Switch every light off.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn reset_light(&self) -> CommResult<InstructionHandle> {
        self.submit(tables::reset_light_instruction())
    }

    /// Tell the controller which station type it runs.
    ///
    /// # Errors
    /// See [`Machine::submit`].
    fn identify(&self) -> CommResult<InstructionHandle> {
        self.submit(self.machine_type().identify_instruction())
    }
}

fn require(machine: &(impl Machine + ?Sized), expected: MachineType, command: &str) -> CommResult<()> {
    let actual = machine.machine_type();
    if actual == expected {
        Ok(())
    } else {
        Err(CommError::unsupported(format!(
            "{command} needs a {expected} station, {} is a {actual}",
            machine.name()
        )))
    }
}

/// Station-specific jobs. Each command is valid only for one station type
/// and fails with `CommError::Unsupported` elsewhere.
pub trait StationCommands: Machine {
    /// Base station: dispense a base of `color` at `side`.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise see [`Machine::submit`].
    fn dispense_base(&self, color: BaseColor, side: StationSide) -> CommResult<InstructionHandle> {
        require(self, MachineType::BaseStation, "dispense_base")?;
        self.submit(tables::dispense_base_instruction(color, side))
    }

    /// Cap station: take the cap off the workpiece into the shelf.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise see [`Machine::submit`].
    fn retrieve_cap(&self) -> CommResult<InstructionHandle> {
        require(self, MachineType::CapStation, "retrieve_cap")?;
        self.submit(tables::cap_instruction(CapOperation::Retrieve))
    }

    /// Cap station: mount the buffered cap.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise see [`Machine::submit`].
    fn mount_cap(&self) -> CommResult<InstructionHandle> {
        require(self, MachineType::CapStation, "mount_cap")?;
        self.submit(tables::cap_instruction(CapOperation::Mount))
    }

    /// Ring station: mount a ring from `feeder`.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise see [`Machine::submit`].
    fn mount_ring(&self, feeder: u16) -> CommResult<InstructionHandle> {
        require(self, MachineType::RingStation, "mount_ring")?;
        self.submit(tables::mount_ring_instruction(feeder))
    }

    /// Ring station: zero the slide counter.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise see [`Machine::submit`].
    fn reset_slide_counter(&self) -> CommResult<InstructionHandle> {
        require(self, MachineType::RingStation, "reset_slide_counter")?;
        self.submit(tables::slide_counter_reset_instruction())
    }

    /// Delivery station: deliver the product to `gate` (1..=3).
    ///
    /// # Errors
    /// `Unsupported` on other stations or for an unknown gate, otherwise see
    /// [`Machine::submit`].
    fn deliver(&self, gate: u16) -> CommResult<InstructionHandle> {
        require(self, MachineType::DeliveryStation, "deliver")?;
        if !(1..=3).contains(&gate) {
            return Err(CommError::unsupported(format!("delivery gate {gate}")));
        }
        self.submit(tables::deliver_instruction(gate))
    }

    /// Storage station: take the workpiece at `shelf`/`slot` out.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise see [`Machine::submit`].
    fn storage_retrieve(&self, shelf: u16, slot: u16) -> CommResult<InstructionHandle> {
        require(self, MachineType::StorageStation, "storage_retrieve")?;
        self.submit(tables::storage_retrieve_instruction(shelf, slot))
    }

    /// Storage station: put the workpiece into `shelf`/`slot`.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise see [`Machine::submit`].
    fn storage_store(&self, shelf: u16, slot: u16) -> CommResult<InstructionHandle> {
        require(self, MachineType::StorageStation, "storage_store")?;
        self.submit(tables::storage_store_instruction(shelf, slot))
    }

    /// Pick & place: produce a ring on `workpiece`.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise see [`Machine::submit`].
    fn produce_ring(&self, workpiece: u16) -> CommResult<InstructionHandle> {
        require(self, MachineType::PickPlace, "produce_ring")?;
        self.submit(tables::produce_ring_instruction(workpiece))
    }

    /// Pick & place: true once the produced ring can be taken.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise the read error.
    fn ring_ready(&self) -> CommResult<bool> {
        require(self, MachineType::PickPlace, "ring_ready")?;
        self.read_register(MpsRegister::StatusReadyIn)
            .map(|v| v.as_bool())
    }

    /// Pick & place: true if the ring line is empty.
    ///
    /// # Errors
    /// `Unsupported` on other stations, otherwise the read error.
    fn is_empty(&self) -> CommResult<bool> {
        require(self, MachineType::PickPlace, "is_empty")?;
        self.read_register(MpsRegister::LineEmpty).map(|v| v.as_bool())
    }
}

impl<M: Machine + ?Sized> StationCommands for M {}
