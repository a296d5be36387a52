//! Machine types and their per-type data tables.
//!
//! A station differs from another only by data: its type code, the
//! registers it publishes, its reset sequence and (for Modbus links) the
//! register address map. Capabilities are lowered to [`Instruction`]s here so
//! both protocol backends share one encoding.

use crate::consts::{
    COMMAND_JOB_OFFSET, COMMAND_MOVE_CONVEYOR_OFFSET, COMMAND_SET_TYPE, COMMAND_SLIDE_RESET_OFFSET,
    COMMAND_STORE_OFFSET, CONVEYOR_TIMEOUT, JOB_TIMEOUT,
    LIGHT_COLOR_GREEN, LIGHT_COLOR_RED, LIGHT_COLOR_RESET, LIGHT_COLOR_YELLOW, LIGHT_TIMEOUT,
    RESET_TIMEOUT,
};
use crate::instruction::Instruction;
use crate::register::{JobLane, MpsRegister};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Station type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineType {
    /// Base station: dispenses bases.
    #[serde(rename = "BS")]
    BaseStation,
    /// Cap station: retrieves and mounts caps.
    #[serde(rename = "CS")]
    CapStation,
    /// Ring station: mounts rings from its feeders.
    #[serde(rename = "RS")]
    RingStation,
    /// Delivery station: accepts finished products at one of three gates.
    #[serde(rename = "DS")]
    DeliveryStation,
    /// Storage station: shelf storage.
    #[serde(rename = "SS")]
    StorageStation,
    /// Legacy pick & place station driven over plain Modbus registers.
    #[serde(rename = "PP")]
    PickPlace,
}

// ─── Auto-subscribed registers ──────────────────────────────────────

const STATUS_REGISTERS: [MpsRegister; 11] = [
    MpsRegister::StatusBusyIn,
    MpsRegister::StatusReadyIn,
    MpsRegister::StatusErrorIn,
    MpsRegister::ErrorIn,
    MpsRegister::StatusBusyBasic,
    MpsRegister::StatusReadyBasic,
    MpsRegister::StatusErrorBasic,
    MpsRegister::ErrorBasic,
    MpsRegister::SensorInput,
    MpsRegister::SensorMiddle,
    MpsRegister::SensorOutput,
];

const RING_REGISTERS: [MpsRegister; 12] = [
    MpsRegister::StatusBusyIn,
    MpsRegister::StatusReadyIn,
    MpsRegister::StatusErrorIn,
    MpsRegister::ErrorIn,
    MpsRegister::StatusBusyBasic,
    MpsRegister::StatusReadyBasic,
    MpsRegister::StatusErrorBasic,
    MpsRegister::ErrorBasic,
    MpsRegister::SensorInput,
    MpsRegister::SensorMiddle,
    MpsRegister::SensorOutput,
    MpsRegister::SlideCountIn,
];

const BARCODE_REGISTERS: [MpsRegister; 12] = [
    MpsRegister::StatusBusyIn,
    MpsRegister::StatusReadyIn,
    MpsRegister::StatusErrorIn,
    MpsRegister::ErrorIn,
    MpsRegister::StatusBusyBasic,
    MpsRegister::StatusReadyBasic,
    MpsRegister::StatusErrorBasic,
    MpsRegister::ErrorBasic,
    MpsRegister::SensorInput,
    MpsRegister::SensorMiddle,
    MpsRegister::SensorOutput,
    MpsRegister::BarcodeIn,
];

const PICK_PLACE_REGISTERS: [MpsRegister; 2] = [MpsRegister::StatusReadyIn, MpsRegister::LineEmpty];

impl MachineType {
    /// Every machine type.
    pub const ALL: [MachineType; 6] = [
        MachineType::BaseStation,
        MachineType::CapStation,
        MachineType::RingStation,
        MachineType::DeliveryStation,
        MachineType::StorageStation,
        MachineType::PickPlace,
    ];

    /// Type code sent with the identify instruction; job codes are offsets from it.
    pub const fn code(self) -> u16 {
        match self {
            MachineType::BaseStation => 100,
            MachineType::CapStation => 200,
            MachineType::RingStation => 300,
            MachineType::DeliveryStation => 400,
            MachineType::StorageStation => 500,
            MachineType::PickPlace => 600,
        }
    }

    /// Two-letter abbreviation.
    pub const fn abbrev(self) -> &'static str {
        match self {
            MachineType::BaseStation => "BS",
            MachineType::CapStation => "CS",
            MachineType::RingStation => "RS",
            MachineType::DeliveryStation => "DS",
            MachineType::StorageStation => "SS",
            MachineType::PickPlace => "PP",
        }
    }

    /// Parse a two-letter abbreviation (case-insensitive).
    pub fn from_abbrev(abbrev: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.abbrev().eq_ignore_ascii_case(abbrev))
    }

    /// Registers subscribed when a session comes up.
    pub const fn subscribed_registers(self) -> &'static [MpsRegister] {
        match self {
            MachineType::RingStation => &RING_REGISTERS,
            MachineType::CapStation | MachineType::DeliveryStation => &BARCODE_REGISTERS,
            MachineType::PickPlace => &PICK_PLACE_REGISTERS,
            MachineType::BaseStation | MachineType::StorageStation => &STATUS_REGISTERS,
        }
    }

    /// Command code of a station job at `offset` from the type code.
    pub const fn job_command(self, offset: u16) -> u16 {
        self.code() + offset
    }

    /// Instruction telling the controller which station it runs.
    pub fn identify_instruction(self) -> Instruction {
        Instruction::new(JobLane::Basic, COMMAND_SET_TYPE)
            .with_payload(self.code(), 0)
            .with_timeout(RESET_TIMEOUT)
    }

    /// Instructions making up the station reset.
    pub fn reset_sequence(self) -> Vec<Instruction> {
        let reset = Instruction::new(JobLane::Basic, self.code()).with_timeout(RESET_TIMEOUT);
        match self {
            MachineType::RingStation => vec![reset, slide_counter_reset_instruction()],
            _ => vec![reset],
        }
    }

    /// Register address map used when this station is driven over Modbus.
    pub fn modbus_map(self) -> ModbusMap {
        match self {
            MachineType::PickPlace => ModbusMap::pick_place(),
            _ => ModbusMap::standard(),
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbrev())
    }
}

// ─── Capability payloads ────────────────────────────────────────────

/// Signal light color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightColor {
    Red,
    Yellow,
    Green,
}

impl LightColor {
    /// Command code driving this light.
    pub const fn command(self) -> u16 {
        match self {
            LightColor::Red => LIGHT_COLOR_RED,
            LightColor::Yellow => LIGHT_COLOR_YELLOW,
            LightColor::Green => LIGHT_COLOR_GREEN,
        }
    }

    /// Parse a color name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "red" => Some(LightColor::Red),
            "yellow" => Some(LightColor::Yellow),
            "green" => Some(LightColor::Green),
            _ => None,
        }
    }
}

/// Signal light state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightState {
    #[default]
    Off = 0,
    On = 1,
    Blink = 2,
}

impl LightState {
    /// Parse a state name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "off" => Some(LightState::Off),
            "on" => Some(LightState::On),
            "blink" => Some(LightState::Blink),
            _ => None,
        }
    }
}

/// Conveyor direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConveyorDirection {
    Forward = 1,
    Backward = 2,
}

/// Conveyor stop sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MpsSensor {
    Input = 1,
    Middle = 2,
    Output = 3,
}

impl MpsSensor {
    /// Register reporting this sensor.
    pub const fn register(self) -> MpsRegister {
        match self {
            MpsSensor::Input => MpsRegister::SensorInput,
            MpsSensor::Middle => MpsRegister::SensorMiddle,
            MpsSensor::Output => MpsRegister::SensorOutput,
        }
    }
}

/// Base color held in the base station's magazines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseColor {
    Red = 1,
    Black = 2,
    Silver = 3,
}

/// Side of a station where a workpiece is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StationSide {
    Input = 1,
    Output = 2,
}

/// Cap station operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapOperation {
    Retrieve = 1,
    Mount = 2,
}

/// Drive one light.
pub fn light_instruction(color: LightColor, state: LightState, duration_secs: u16) -> Instruction {
    Instruction::new(JobLane::Basic, color.command())
        .with_payload(state as u16, duration_secs)
        .with_timeout(LIGHT_TIMEOUT)
}

/// Switch every light off.
pub fn reset_light_instruction() -> Instruction {
    Instruction::new(JobLane::Basic, LIGHT_COLOR_RESET).with_timeout(LIGHT_TIMEOUT)
}

/// Run the conveyor until `sensor` triggers.
pub fn conveyor_instruction(
    machine: MachineType,
    direction: ConveyorDirection,
    sensor: MpsSensor,
) -> Instruction {
    Instruction::new(
        JobLane::Basic,
        machine.job_command(COMMAND_MOVE_CONVEYOR_OFFSET),
    )
    .with_payload(sensor as u16, direction as u16)
    .with_timeout(CONVEYOR_TIMEOUT)
}

/// Station job on the `In` lane.
pub fn job_instruction(machine: MachineType, offset: u16, payload0: u16, payload1: u16) -> Instruction {
    Instruction::new(JobLane::In, machine.job_command(offset))
        .with_payload(payload0, payload1)
        .with_timeout(JOB_TIMEOUT)
}

/// Base station: push a base of `color` out at `side`.
pub fn dispense_base_instruction(color: BaseColor, side: StationSide) -> Instruction {
    job_instruction(
        MachineType::BaseStation,
        COMMAND_JOB_OFFSET,
        color as u16,
        side as u16,
    )
}

/// Cap station: retrieve or mount a cap.
pub fn cap_instruction(operation: CapOperation) -> Instruction {
    job_instruction(MachineType::CapStation, COMMAND_JOB_OFFSET, operation as u16, 0)
}

/// Ring station: mount a ring from `feeder`.
pub fn mount_ring_instruction(feeder: u16) -> Instruction {
    job_instruction(MachineType::RingStation, COMMAND_JOB_OFFSET, feeder, 0)
}

/// Ring station: zero the slide counter.
pub fn slide_counter_reset_instruction() -> Instruction {
    job_instruction(MachineType::RingStation, COMMAND_SLIDE_RESET_OFFSET, 0, 0)
        .with_timeout(RESET_TIMEOUT)
}

/// Delivery station: deliver to `gate`.
pub fn deliver_instruction(gate: u16) -> Instruction {
    job_instruction(MachineType::DeliveryStation, COMMAND_JOB_OFFSET, gate, 0)
}

/// Storage station: take the workpiece at `shelf`/`slot` out.
pub fn storage_retrieve_instruction(shelf: u16, slot: u16) -> Instruction {
    job_instruction(MachineType::StorageStation, COMMAND_JOB_OFFSET, shelf, slot)
}

/// Storage station: put the workpiece at `shelf`/`slot`.
pub fn storage_store_instruction(shelf: u16, slot: u16) -> Instruction {
    job_instruction(MachineType::StorageStation, COMMAND_STORE_OFFSET, shelf, slot)
}

/// Pick & place: produce a ring on `workpiece`.
pub fn produce_ring_instruction(workpiece: u16) -> Instruction {
    job_instruction(MachineType::PickPlace, COMMAND_JOB_OFFSET, workpiece, 0)
}

// ─── Modbus address map ─────────────────────────────────────────────

/// Modbus data table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusTable {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

/// Location of one register on a Modbus device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModbusAddress {
    /// Data table.
    pub table: ModbusTable,
    /// Zero-based address within the table.
    pub address: u16,
}

impl ModbusAddress {
    /// Shorthand constructor.
    pub const fn new(table: ModbusTable, address: u16) -> Self {
        Self { table, address }
    }

    /// True if the table accepts writes.
    pub const fn is_writable(&self) -> bool {
        matches!(self.table, ModbusTable::Coil | ModbusTable::HoldingRegister)
    }
}

/// Register → Modbus address table of one station.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModbusMap {
    entries: BTreeMap<MpsRegister, ModbusAddress>,
}

/// Offset between the `In` and `Basic` lanes in the standard map.
const BASIC_LANE_OFFSET: u16 = 10;

impl ModbusMap {
    /// Map shared by stations exposing the full register catalog.
    pub fn standard() -> Self {
        use ModbusTable::*;

        let mut map = Self::default();
        for (lane, base) in [(JobLane::In, 0), (JobLane::Basic, BASIC_LANE_OFFSET)] {
            let [data0, data1] = lane.data();
            map.insert(lane.action_id(), ModbusAddress::new(HoldingRegister, base));
            map.insert(data0, ModbusAddress::new(HoldingRegister, base + 1));
            map.insert(data1, ModbusAddress::new(HoldingRegister, base + 2));
            map.insert(lane.enable(), ModbusAddress::new(Coil, base));
            map.insert(lane.error(), ModbusAddress::new(InputRegister, base));
            map.insert(lane.busy(), ModbusAddress::new(DiscreteInput, base));
            map.insert(lane.ready(), ModbusAddress::new(DiscreteInput, base + 1));
            map.insert(lane.fault(), ModbusAddress::new(DiscreteInput, base + 2));
        }
        map.insert(MpsRegister::SlideCountIn, ModbusAddress::new(InputRegister, 1));
        map.insert(MpsRegister::BarcodeIn, ModbusAddress::new(InputRegister, 2));
        map.insert(MpsRegister::SensorInput, ModbusAddress::new(DiscreteInput, 20));
        map.insert(MpsRegister::SensorMiddle, ModbusAddress::new(DiscreteInput, 21));
        map.insert(MpsRegister::SensorOutput, ModbusAddress::new(DiscreteInput, 22));
        map.insert(MpsRegister::LineEmpty, ModbusAddress::new(DiscreteInput, 23));
        map.insert(MpsRegister::Heartbeat, ModbusAddress::new(InputRegister, 20));
        map
    }

    /// Legacy pick & place layout: produce → holding 1, ready → input 2,
    /// line empty → input 3, liveness → input 0.
    pub fn pick_place() -> Self {
        use ModbusTable::*;

        let mut map = Self::default();
        map.insert(MpsRegister::Data0In, ModbusAddress::new(HoldingRegister, 1));
        map.insert(MpsRegister::StatusReadyIn, ModbusAddress::new(InputRegister, 2));
        map.insert(MpsRegister::LineEmpty, ModbusAddress::new(InputRegister, 3));
        map.insert(MpsRegister::Heartbeat, ModbusAddress::new(InputRegister, 0));
        map
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, register: MpsRegister, address: ModbusAddress) {
        self.entries.insert(register, address);
    }

    /// Address of `register`, if the station exposes it.
    pub fn get(&self, register: MpsRegister) -> Option<ModbusAddress> {
        self.entries.get(&register).copied()
    }

    /// True if the station exposes `register`.
    pub fn contains(&self, register: MpsRegister) -> bool {
        self.entries.contains_key(&register)
    }

    /// Iterate over all entries in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = (MpsRegister, ModbusAddress)> + '_ {
        self.entries.iter().map(|(r, a)| (*r, *a))
    }
}

/// Default duration for a light that stays on until changed.
pub const LIGHT_INDEFINITE: Duration = Duration::ZERO;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn type_codes_are_distinct() {
        let codes: HashSet<_> = MachineType::ALL.iter().map(|t| t.code()).collect();
        assert_eq!(codes.len(), MachineType::ALL.len());
    }

    #[test]
    fn abbrev_round_trip() {
        for t in MachineType::ALL {
            assert_eq!(MachineType::from_abbrev(t.abbrev()), Some(t));
        }
        assert_eq!(MachineType::from_abbrev("rs"), Some(MachineType::RingStation));
        assert_eq!(MachineType::from_abbrev("XX"), None);
    }

    #[test]
    fn identify_carries_type_code() {
        let instr = MachineType::CapStation.identify_instruction();
        assert_eq!(instr.command, COMMAND_SET_TYPE);
        assert_eq!(instr.lane, JobLane::Basic);
        assert_eq!(instr.payload, [200, 0]);
    }

    #[test]
    fn ring_station_reset_also_clears_slide_counter() {
        let seq = MachineType::RingStation.reset_sequence();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].command, 300);
        assert_eq!(seq[1].command, 304);
        assert_eq!(MachineType::BaseStation.reset_sequence().len(), 1);
    }

    #[test]
    fn light_and_conveyor_lowering() {
        let light = light_instruction(LightColor::Yellow, LightState::Blink, 5);
        assert_eq!(light.command, LIGHT_COLOR_YELLOW);
        assert_eq!(light.payload, [2, 5]);

        let conveyor = conveyor_instruction(
            MachineType::BaseStation,
            ConveyorDirection::Backward,
            MpsSensor::Middle,
        );
        assert_eq!(conveyor.command, 102);
        assert_eq!(conveyor.payload, [2, 2]);
        assert_eq!(conveyor.timeout, CONVEYOR_TIMEOUT);
    }

    #[test]
    fn station_jobs_use_in_lane() {
        let base = dispense_base_instruction(BaseColor::Silver, StationSide::Output);
        assert_eq!((base.command, base.payload), (101, [3, 2]));

        let store = storage_store_instruction(2, 5);
        assert_eq!((store.command, store.payload), (503, [2, 5]));

        let produce = produce_ring_instruction(7);
        assert_eq!((produce.command, produce.payload), (601, [7, 0]));

        for instr in [base, store, produce, cap_instruction(CapOperation::Mount)] {
            assert_eq!(instr.lane, JobLane::In);
            assert_eq!(instr.timeout, JOB_TIMEOUT);
        }
        assert_eq!(slide_counter_reset_instruction().timeout, RESET_TIMEOUT);
    }

    #[test]
    fn subscriptions_are_status_or_sensor_registers() {
        for t in MachineType::ALL {
            for reg in t.subscribed_registers() {
                assert!(!reg.is_writable(), "{t} subscribes to writable {reg}");
            }
        }
        assert!(MachineType::RingStation
            .subscribed_registers()
            .contains(&MpsRegister::SlideCountIn));
    }

    #[test]
    fn standard_map_writes_only_to_writable_tables() {
        let map = ModbusMap::standard();
        for (reg, addr) in map.iter() {
            assert_eq!(reg.is_writable(), addr.is_writable(), "{reg} mapped to {addr:?}");
        }
        assert_eq!(
            map.get(MpsRegister::StatusReadyBasic),
            Some(ModbusAddress::new(ModbusTable::DiscreteInput, 11))
        );
    }

    #[test]
    fn pick_place_map_matches_legacy_layout() {
        let map = MachineType::PickPlace.modbus_map();
        assert_eq!(
            map.get(MpsRegister::Data0In),
            Some(ModbusAddress::new(ModbusTable::HoldingRegister, 1))
        );
        assert_eq!(
            map.get(MpsRegister::StatusReadyIn),
            Some(ModbusAddress::new(ModbusTable::InputRegister, 2))
        );
        assert_eq!(
            map.get(MpsRegister::LineEmpty),
            Some(ModbusAddress::new(ModbusTable::InputRegister, 3))
        );
        assert!(!map.contains(MpsRegister::ActionIdBasic));
    }

    #[test]
    fn parse_light_names() {
        assert_eq!(LightColor::parse("RED"), Some(LightColor::Red));
        assert_eq!(LightState::parse("blink"), Some(LightState::Blink));
        assert_eq!(LightState::parse("dim"), None);
    }
}
