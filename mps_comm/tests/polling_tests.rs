//! Polling backend tests.
//!
//! Runs the register-polling machine against the in-process station model:
//! synchronous completion, readiness checks, concurrent callers and
//! heartbeat recovery.

mod common;

use common::{
    RecordingEventLog, fast_context, polling, polling_on, slow_jobs, started_commands,
    wait_until,
};
use mps_comm::backend::PollingMachine;
use mps_comm::machine::{Machine, StationCommands};
use mps_comm::session::SessionState;
use mps_comm::snapshot::BackendKind;
use mps_comm::transport::{SimOptions, SimulatedStation, SimulatedTransport, Transport};
use mps_common::config::{Protocol, StationConfig};
use mps_common::consts::{LIGHT_COLOR_GREEN, LIGHT_COLOR_RED, LIGHT_COLOR_YELLOW};
use mps_common::error::{CommError, CommResult};
use mps_common::instruction::InstructionOutcome;
use mps_common::machine::{LIGHT_INDEFINITE, LightColor, LightState, MachineType};
use mps_common::register::{JobLane, MpsRegister, RegisterValue};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ─── Helpers ────────────────────────────────────────────────────────

const ENABLE_LAG: Duration = Duration::from_millis(30);

/// Link to a controller that picks up the enable flag only after
/// [`ENABLE_LAG`]; everything else goes straight through.
struct LaggingEnable {
    station: SimulatedStation,
    inner: SimulatedTransport,
}

impl LaggingEnable {
    fn new(station: &SimulatedStation) -> Self {
        Self {
            station: station.clone(),
            inner: SimulatedTransport::new(station.clone()),
        }
    }
}

impl Transport for LaggingEnable {
    fn name(&self) -> &'static str {
        "lagging-enable"
    }

    fn open(&mut self) -> CommResult<()> {
        self.inner.open()
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn read(&mut self, register: MpsRegister) -> CommResult<RegisterValue> {
        self.inner.read(register)
    }

    fn write(&mut self, register: MpsRegister, value: RegisterValue) -> CommResult<()> {
        let is_enable = [JobLane::In, JobLane::Basic]
            .iter()
            .any(|lane| lane.enable() == register);
        if !is_enable || !value.as_bool() {
            return self.inner.write(register, value);
        }
        let mut late = SimulatedTransport::new(self.station.clone());
        late.open()?;
        thread::spawn(move || {
            thread::sleep(ENABLE_LAG);
            let _ = late.write(register, value);
        });
        Ok(())
    }
}

// ─── Readiness ──────────────────────────────────────────────────────

#[test]
fn test_submit_returns_completed_handle() {
    let (station, machine, _log) = polling(MachineType::BaseStation, SimOptions::default());
    assert_eq!(machine.session_state(), SessionState::Ready);

    let handle = machine
        .set_light(LightColor::Red, LightState::Blink, LIGHT_INDEFINITE)
        .expect("set_light");
    assert!(handle.is_done());
    assert_eq!(handle.try_outcome(), Some(InstructionOutcome::Completed));
    assert_eq!(station.light(LightColor::Red), LightState::Blink);
    assert_eq!(station.monitor_calls(), 0);
    assert_eq!(machine.snapshot().backend, BackendKind::Polling);
    machine.shutdown();
}

#[test]
fn test_waits_for_controller_to_pick_up_the_job() {
    let station = SimulatedStation::new(MachineType::BaseStation, SimOptions::default());
    let mut config = StationConfig::new("M-BS", MachineType::BaseStation, Protocol::Modbus);
    config.simulate = true;
    let machine = PollingMachine::start(
        config,
        Box::new(LaggingEnable::new(&station)),
        &fast_context(Arc::new(RecordingEventLog::default())),
    )
    .expect("start polling machine");

    let started = Instant::now();
    let handle = machine
        .set_light(LightColor::Red, LightState::On, LIGHT_INDEFINITE)
        .expect("set_light");
    assert_eq!(handle.try_outcome(), Some(InstructionOutcome::Completed));
    assert!(started.elapsed() >= ENABLE_LAG * 2);
    assert_eq!(station.identified_as(), Some(MachineType::BaseStation));
    assert_eq!(station.light(LightColor::Red), LightState::On);
    assert_eq!(started_commands(&station), vec![LIGHT_COLOR_RED]);
    machine.shutdown();
}

#[test]
fn test_offline_station_is_not_ready() {
    let station = SimulatedStation::new(MachineType::BaseStation, SimOptions::default());
    station.set_online(false);
    let (machine, log) = polling_on(&station);

    let result = machine.set_light(LightColor::Green, LightState::On, LIGHT_INDEFINITE);
    assert!(matches!(result, Err(CommError::SessionNotReady)));
    assert!(log.failures.lock().is_empty());

    station.set_online(true);
    assert!(wait_until(|| machine.session_state() == SessionState::Ready));
    let handle = machine
        .set_light(LightColor::Green, LightState::On, LIGHT_INDEFINITE)
        .expect("set_light after recovery");
    assert_eq!(handle.try_outcome(), Some(InstructionOutcome::Completed));
    machine.shutdown();
}

#[test]
fn test_lost_link_is_rebuilt() {
    let (station, machine, _log) = polling(MachineType::DeliveryStation, SimOptions::default());
    let opens = station.open_count();

    station.set_online(false);
    assert!(wait_until(|| machine.session_state() != SessionState::Ready));
    station.set_online(true);
    assert!(wait_until(|| machine.session_state() == SessionState::Ready));

    assert!(station.open_count() > opens);
    assert!(machine.heartbeat().stats().rebuilds >= 1);
    machine.shutdown();
}

// ─── Concurrency ────────────────────────────────────────────────────

#[test]
fn test_concurrent_callers_run_one_at_a_time() {
    let (station, machine, _log) = polling(MachineType::StorageStation, SimOptions::default());
    let machine = Arc::new(machine);

    let workers: Vec<_> = [LightColor::Red, LightColor::Yellow, LightColor::Green]
        .into_iter()
        .map(|color| {
            let machine = Arc::clone(&machine);
            thread::spawn(move || {
                machine
                    .set_light(color, LightState::On, LIGHT_INDEFINITE)
                    .expect("set_light")
                    .wait()
            })
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().expect("join"), InstructionOutcome::Completed);
    }

    let mut commands = started_commands(&station);
    assert_eq!(commands.len(), 3);
    commands.sort_unstable();
    assert_eq!(commands, vec![LIGHT_COLOR_RED, LIGHT_COLOR_YELLOW, LIGHT_COLOR_GREEN]);
    assert_eq!(station.jobs().len(), station.started_jobs().len());
    machine.shutdown();
}

#[test]
fn test_abort_from_another_thread() {
    let (station, machine, log) = polling(MachineType::RingStation, slow_jobs());
    let machine = Arc::new(machine);
    let identify = machine.identify().expect("identify");
    assert_eq!(identify.try_outcome(), Some(InstructionOutcome::Completed));
    assert!(!machine.abort());

    let runner = Arc::clone(&machine);
    let worker = thread::spawn(move || runner.band_on_until_mid().expect("conveyor").wait());
    let conveyor = MachineType::RingStation.job_command(2);
    assert!(wait_until(|| started_commands(&station).contains(&conveyor)));
    assert!(wait_until(|| machine.abort()));

    assert_eq!(
        worker.join().expect("join"),
        InstructionOutcome::Failed(CommError::Aborted)
    );
    assert_eq!(log.failures.lock().len(), 1);
    assert!(!machine.abort());
    machine.shutdown();
}

// ─── Pick & place ───────────────────────────────────────────────────

#[test]
fn test_pick_place_reads_status_registers() {
    let (station, machine, _log) = polling(MachineType::PickPlace, SimOptions::default());

    station.set_value(MpsRegister::LineEmpty, RegisterValue::Bool(true));
    assert!(machine.is_empty().expect("is_empty"));
    station.set_value(MpsRegister::LineEmpty, RegisterValue::Bool(false));
    assert!(!machine.is_empty().expect("is_empty"));

    let handle = machine.produce_ring(3).expect("produce_ring");
    assert_eq!(handle.try_outcome(), Some(InstructionOutcome::Completed));
    assert!(machine.ring_ready().expect("ring_ready"));

    let jobs = station.jobs();
    let produce = jobs.last().expect("produce job");
    assert_eq!(produce.command, MachineType::PickPlace.job_command(1));
    assert_eq!(produce.payload[0], 3);
    machine.shutdown();
}

#[test]
fn test_pick_place_has_no_light_lane() {
    let (_station, machine, log) = polling(MachineType::PickPlace, SimOptions::default());
    let handle = machine
        .set_light(LightColor::Red, LightState::On, LIGHT_INDEFINITE)
        .expect("submit");
    assert!(matches!(
        handle.try_outcome(),
        Some(InstructionOutcome::Failed(CommError::Unsupported(_)))
    ));
    assert_eq!(log.failures.lock().len(), 1);
    machine.shutdown();
}

// ─── Shutdown ───────────────────────────────────────────────────────

#[test]
fn test_shutdown_is_final() {
    let (_station, machine, log) = polling(MachineType::CapStation, SimOptions::default());
    machine.shutdown();
    machine.shutdown();

    assert_ne!(machine.session_state(), SessionState::Ready);
    assert!(matches!(
        machine.reset_light(),
        Err(CommError::SessionNotReady)
    ));
    assert_eq!(
        log.finals.lock().len(),
        MachineType::CapStation.subscribed_registers().len()
    );
}
