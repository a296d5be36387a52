//! Dispatch benchmark: round trip of one light instruction through each
//! backend against the in-process station model.
//!
//! Measures queueing, register staging and completion detection. The station
//! model finishes jobs after a fixed busy phase, so the numbers are dominated
//! by engine overhead plus `busy_duration`.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use mps_comm::backend::{BackendContext, PollingMachine, PubSubMachine};
use mps_comm::machine::Machine;
use mps_comm::transport::{SimOptions, SimulatedStation, SimulatedTransport};
use mps_comm::{EventLog, TracingEventLog};
use mps_common::config::{CommConfig, Protocol, StationConfig};
use mps_common::machine::{LIGHT_INDEFINITE, LightColor, LightState, MachineType};

const BUSY: Duration = Duration::from_micros(200);

fn context() -> BackendContext {
    let mut config = CommConfig::default();
    config.dispatcher.poll_interval_ms = 1;
    let log: Arc<dyn EventLog> = Arc::new(TracingEventLog);
    BackendContext::from_config(&config, log)
}

fn station() -> SimulatedStation {
    SimulatedStation::new(
        MachineType::BaseStation,
        SimOptions {
            busy_duration: BUSY,
            ..SimOptions::default()
        },
    )
}

fn start(protocol: Protocol) -> Arc<dyn Machine> {
    let ctx = context();
    let transport = Box::new(SimulatedTransport::new(station()));
    let mut config = StationConfig::new("BENCH-BS", MachineType::BaseStation, protocol);
    config.simulate = true;
    if protocol.is_polling() {
        Arc::new(PollingMachine::start(config, transport, &ctx).expect("polling machine"))
    } else {
        Arc::new(PubSubMachine::start(config, transport, &ctx).expect("pub/sub machine"))
    }
}

fn bench_light_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("light_round_trip");
    group.sample_size(50);

    for protocol in [Protocol::Simulation, Protocol::Modbus] {
        let machine = start(protocol);
        let mut state = LightState::On;
        group.bench_with_input(
            BenchmarkId::from_parameter(protocol.as_str()),
            &protocol,
            |b, _| {
                b.iter(|| {
                    state = if state == LightState::On {
                        LightState::Off
                    } else {
                        LightState::On
                    };
                    let handle = machine
                        .set_light(LightColor::Green, state, LIGHT_INDEFINITE)
                        .expect("submit");
                    black_box(handle.wait())
                });
            },
        );
        machine.shutdown();
    }

    group.finish();
}

criterion_group!(benches, bench_light_round_trip);
criterion_main!(benches);
