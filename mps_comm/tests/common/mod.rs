//! Shared helpers for the engine integration tests.

#![allow(dead_code)]

use mps_comm::backend::{BackendContext, PollingMachine, PubSubMachine};
use mps_comm::event_log::EventLog;
use mps_comm::transport::{SimOptions, SimulatedStation, SimulatedTransport};
use mps_common::config::{CommConfig, Protocol, StationConfig};
use mps_common::error::CommError;
use mps_common::instruction::Instruction;
use mps_common::machine::MachineType;
use mps_common::register::{MpsRegister, RegisterValue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Heartbeat interval used by the helpers.
pub const TEST_HEARTBEAT: Duration = Duration::from_millis(40);

/// Polling interval used by the helpers.
pub const TEST_POLL: Duration = Duration::from_millis(10);

/// Upper bound for anything a test waits for.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Event log that keeps everything it receives.
#[derive(Default)]
pub struct RecordingEventLog {
    pub finals: Mutex<Vec<(String, MpsRegister, Option<RegisterValue>)>>,
    pub failures: Mutex<Vec<(String, u16, CommError)>>,
}

impl EventLog for RecordingEventLog {
    fn subscription_final(&self, station: &str, register: MpsRegister, value: Option<RegisterValue>) {
        self.finals
            .lock()
            .push((station.to_string(), register, value));
    }

    fn instruction_failed(&self, station: &str, instruction: &Instruction, error: &CommError) {
        self.failures
            .lock()
            .push((station.to_string(), instruction.command, error.clone()));
    }
}

/// Context with short intervals.
pub fn fast_context(log: Arc<RecordingEventLog>) -> BackendContext {
    let mut config = CommConfig::default();
    config.heartbeat.interval_ms = TEST_HEARTBEAT.as_millis() as u64;
    config.dispatcher.poll_interval_ms = TEST_POLL.as_millis() as u64;
    BackendContext::from_config(&config, log)
}

/// Pub/sub machine on a fresh simulated station.
pub fn pubsub(
    machine_type: MachineType,
    options: SimOptions,
) -> (SimulatedStation, PubSubMachine, Arc<RecordingEventLog>) {
    let station = SimulatedStation::new(machine_type, options);
    let (machine, log) = pubsub_on(&station);
    (station, machine, log)
}

/// Pub/sub machine on an existing simulated station.
pub fn pubsub_on(station: &SimulatedStation) -> (PubSubMachine, Arc<RecordingEventLog>) {
    let log = Arc::new(RecordingEventLog::default());
    let machine_type = station.machine_type();
    let config = StationConfig::new(
        format!("C-{}", machine_type.abbrev()),
        machine_type,
        Protocol::Simulation,
    );
    let machine = PubSubMachine::start(
        config,
        Box::new(SimulatedTransport::new(station.clone())),
        &fast_context(Arc::clone(&log)),
    )
    .expect("start pub/sub machine");
    (machine, log)
}

/// Polling machine on a fresh simulated station.
pub fn polling(
    machine_type: MachineType,
    options: SimOptions,
) -> (SimulatedStation, PollingMachine, Arc<RecordingEventLog>) {
    let station = SimulatedStation::new(machine_type, options);
    let (machine, log) = polling_on(&station);
    (station, machine, log)
}

/// Polling machine on an existing simulated station.
pub fn polling_on(station: &SimulatedStation) -> (PollingMachine, Arc<RecordingEventLog>) {
    let log = Arc::new(RecordingEventLog::default());
    let machine_type = station.machine_type();
    let mut config = StationConfig::new(
        format!("M-{}", machine_type.abbrev()),
        machine_type,
        Protocol::Modbus,
    );
    config.simulate = true;
    let machine = PollingMachine::start(
        config,
        Box::new(SimulatedTransport::new(station.clone())),
        &fast_context(Arc::clone(&log)),
    )
    .expect("start polling machine");
    (machine, log)
}

/// Options with a long busy phase, for tests that act mid-job.
pub fn slow_jobs() -> SimOptions {
    SimOptions {
        busy_duration: Duration::from_millis(300),
        ..SimOptions::default()
    }
}

/// Spin until `done` holds or [`PATIENCE`] runs out.
pub fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

/// Commands the station started, in order, without identify jobs.
pub fn started_commands(station: &SimulatedStation) -> Vec<u16> {
    station
        .started_jobs()
        .iter()
        .map(|job| job.command)
        .filter(|command| *command != mps_common::consts::COMMAND_SET_TYPE)
        .collect()
}
