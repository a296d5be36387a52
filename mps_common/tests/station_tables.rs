//! Cross-module checks of the station tables: every instruction a station
//! can be asked to run addresses registers the station actually exposes.

use mps_common::machine::{conveyor_instruction, job_instruction, light_instruction};
use mps_common::prelude::*;

#[test]
fn every_lane_register_is_mapped_on_standard_stations() {
    let map = ModbusMap::standard();
    for lane in [JobLane::In, JobLane::Basic] {
        assert!(map.contains(lane.action_id()));
        assert!(map.contains(lane.enable()));
        assert!(map.contains(lane.ready()));
        for reg in lane.data() {
            assert!(map.contains(reg));
        }
    }
    assert!(map.contains(MpsRegister::Heartbeat));
}

#[test]
fn identify_and_reset_use_basic_lane() {
    for machine in MachineType::ALL {
        assert_eq!(machine.identify_instruction().lane, JobLane::Basic);
        let reset = machine.reset_sequence();
        assert!(!reset.is_empty());
        assert_eq!(reset[0].command, machine.code());
        assert_eq!(reset[0].lane, JobLane::Basic);
    }
}

#[test]
fn capability_lowering_matches_command_table() {
    let red_on = light_instruction(LightColor::Red, LightState::On, 0);
    assert_eq!((red_on.command, red_on.payload), (21, [1, 0]));

    let forward = conveyor_instruction(
        MachineType::StorageStation,
        ConveyorDirection::Forward,
        MpsSensor::Output,
    );
    assert_eq!((forward.command, forward.payload), (502, [3, 1]));

    let mount = job_instruction(MachineType::CapStation, 1, CapOperation::Mount as u16, 0);
    assert_eq!(mount.lane, JobLane::In);
    assert_eq!(mount.command, 201);
}

#[test]
fn pick_place_exposes_only_legacy_points() {
    let map = MachineType::PickPlace.modbus_map();
    let mapped: Vec<_> = map.iter().map(|(reg, _)| reg).collect();
    assert_eq!(
        mapped,
        vec![
            MpsRegister::Data0In,
            MpsRegister::StatusReadyIn,
            MpsRegister::LineEmpty,
            MpsRegister::Heartbeat,
        ]
    );
}

#[test]
fn station_config_round_trips_through_toml() {
    let mut station = StationConfig::new("C-RS2", MachineType::RingStation, Protocol::Node);
    station.simulate = true;
    let text = toml::to_string(&station).expect("serialize");
    assert!(text.contains("machine_type = \"RS\""));
    let back: StationConfig = toml::from_str(&text).expect("deserialize");
    assert_eq!(back.machine_type, MachineType::RingStation);
    assert!(back.is_simulated());
}
