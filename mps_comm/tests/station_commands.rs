//! Station command tests.
//!
//! Each station type accepts its own jobs and rejects the others before
//! anything reaches the queue.

mod common;

use common::{PATIENCE, pubsub, started_commands};
use mps_comm::machine::{Machine, StationCommands};
use mps_comm::transport::SimOptions;
use mps_common::error::CommError;
use mps_common::instruction::InstructionOutcome;
use mps_common::machine::{BaseColor, LightColor, LightState, MachineType, StationSide};
use mps_common::register::{JobLane, MpsRegister, RegisterValue};

// ─── Helpers ────────────────────────────────────────────────────────

fn completed(result: Result<mps_comm::InstructionHandle, CommError>) {
    let handle = result.expect("submit");
    assert_eq!(handle.wait_timeout(PATIENCE), Some(InstructionOutcome::Completed));
}

fn unsupported<T: std::fmt::Debug>(result: Result<T, CommError>) {
    assert!(
        matches!(result, Err(CommError::Unsupported(_))),
        "expected Unsupported, got {result:?}"
    );
}

// ─── Station jobs ───────────────────────────────────────────────────

#[test]
fn test_base_station_dispenses() {
    let (station, machine, _log) = pubsub(MachineType::BaseStation, SimOptions::default());
    completed(machine.dispense_base(BaseColor::Silver, StationSide::Output));

    let job = station.jobs().last().copied().expect("job");
    assert_eq!(job.lane, JobLane::In);
    assert_eq!(job.command, 101);
    assert_eq!(job.payload, [BaseColor::Silver as u16, StationSide::Output as u16]);

    unsupported(machine.retrieve_cap());
    unsupported(machine.ring_ready());
    machine.shutdown();
}

#[test]
fn test_cap_station_retrieves_and_mounts() {
    let (station, machine, _log) = pubsub(MachineType::CapStation, SimOptions::default());
    completed(machine.retrieve_cap());
    completed(machine.mount_cap());
    assert_eq!(started_commands(&station), vec![201, 201]);
    let payloads: Vec<u16> = station.jobs().iter().skip(1).map(|j| j.payload[0]).collect();
    assert_eq!(payloads, vec![1, 2]);

    unsupported(machine.deliver(1));
    machine.shutdown();
}

#[test]
fn test_ring_station_counts_and_resets_slide() {
    let (station, machine, _log) = pubsub(MachineType::RingStation, SimOptions::default());
    completed(machine.mount_ring(1));
    completed(machine.mount_ring(2));
    assert_eq!(station.value(MpsRegister::SlideCountIn), RegisterValue::Word(2));
    assert!(common::wait_until(|| {
        machine.register_value(MpsRegister::SlideCountIn) == Some(RegisterValue::Word(2))
    }));

    completed(machine.reset_slide_counter());
    assert_eq!(station.value(MpsRegister::SlideCountIn), RegisterValue::Word(0));

    unsupported(machine.dispense_base(BaseColor::Red, StationSide::Input));
    machine.shutdown();
}

#[test]
fn test_ring_station_reset_clears_slide_counter() {
    let (station, machine, _log) = pubsub(MachineType::RingStation, SimOptions::default());
    completed(machine.mount_ring(1));
    completed(machine.set_light(LightColor::Green, LightState::On, std::time::Duration::ZERO));

    for handle in machine.reset().expect("reset") {
        assert_eq!(handle.wait_timeout(PATIENCE), Some(InstructionOutcome::Completed));
    }
    assert_eq!(started_commands(&station), vec![301, 23, 300, 304]);
    assert_eq!(station.value(MpsRegister::SlideCountIn), RegisterValue::Word(0));
    assert_eq!(station.light(LightColor::Green), LightState::Off);
    machine.shutdown();
}

#[test]
fn test_delivery_station_gates() {
    let (station, machine, _log) = pubsub(MachineType::DeliveryStation, SimOptions::default());
    completed(machine.deliver(3));
    assert_eq!(station.jobs().last().map(|j| (j.command, j.payload[0])), Some((401, 3)));

    unsupported(machine.deliver(0));
    unsupported(machine.deliver(4));
    assert_eq!(started_commands(&station), vec![401]);
    machine.shutdown();
}

#[test]
fn test_storage_station_shelves() {
    let (station, machine, _log) = pubsub(MachineType::StorageStation, SimOptions::default());
    completed(machine.storage_store(2, 5));
    completed(machine.storage_retrieve(2, 5));

    let jobs: Vec<(u16, [u16; 2])> = station
        .jobs()
        .iter()
        .skip(1)
        .map(|j| (j.command, j.payload))
        .collect();
    assert_eq!(jobs, vec![(503, [2, 5]), (501, [2, 5])]);

    unsupported(machine.produce_ring(1));
    unsupported(machine.is_empty());
    machine.shutdown();
}

#[test]
fn test_conveyor_moves_to_sensor() {
    let (station, machine, _log) = pubsub(MachineType::DeliveryStation, SimOptions::default());
    completed(machine.band_on_until_in());
    assert!(station.value(MpsRegister::SensorInput).as_bool());
    completed(machine.band_on_until_out());
    assert!(station.value(MpsRegister::SensorOutput).as_bool());
    assert!(!station.value(MpsRegister::SensorInput).as_bool());

    let job = station.jobs().last().copied().expect("job");
    assert_eq!(job.lane, JobLane::Basic);
    assert_eq!(job.command, 402);
    machine.shutdown();
}
