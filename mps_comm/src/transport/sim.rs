//! In-process station model.
//!
//! [`SimulatedStation`] behaves like a station controller: writing the lane
//! enable flag starts the job staged in the lane's action id and data
//! registers, the lane reports busy, and after `busy_duration` it reports
//! ready (or raises its error flag if a fault was injected for the command).
//! Value changes of monitored registers are delivered from the station's own
//! job threads, the way a pub/sub SDK delivers them from its client thread.
//!
//! The station outlives individual links: [`SimulatedTransport`] is one link
//! to it, and reconnecting opens a new link to the same device state.

use super::Transport;
use crate::subscription::NotificationSink;
use mps_common::consts::{
    COMMAND_MOVE_CONVEYOR_OFFSET, COMMAND_SET_TYPE, LIGHT_COLOR_GREEN, LIGHT_COLOR_RED,
    LIGHT_COLOR_RESET,
};
use mps_common::error::{CommError, CommResult};
use mps_common::machine::{LightColor, LightState, MachineType};
use mps_common::register::{JobLane, MpsRegister, RegisterValue};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Behaviour knobs of a simulated station.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Time a job stays busy before the lane reports ready.
    pub busy_duration: Duration,
    /// When false, jobs start but never finish.
    pub respond: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            busy_duration: Duration::from_millis(20),
            respond: true,
        }
    }
}

/// One job seen by the station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedJob {
    /// Lane the job ran on.
    pub lane: JobLane,
    /// Command code.
    pub command: u16,
    /// Payload words.
    pub payload: [u16; 2],
}

struct Model {
    machine_type: MachineType,
    options: SimOptions,
    online: bool,
    values: BTreeMap<MpsRegister, RegisterValue>,
    monitors: BTreeMap<MpsRegister, NotificationSink>,
    faults: BTreeMap<u16, u16>,
    lights: [LightState; 3],
    identified_as: Option<u16>,
    lane_epoch: [u64; 2],
    started: Vec<ExecutedJob>,
    completed: Vec<ExecutedJob>,
    opens: u64,
    monitor_calls: u64,
}

const fn lane_index(lane: JobLane) -> usize {
    match lane {
        JobLane::In => 0,
        JobLane::Basic => 1,
    }
}

const fn light_index(color: LightColor) -> usize {
    match color {
        LightColor::Red => 0,
        LightColor::Yellow => 1,
        LightColor::Green => 2,
    }
}

impl Model {
    fn set(&mut self, register: MpsRegister, value: RegisterValue) {
        let previous = self.values.insert(register, value);
        if previous != Some(value) {
            if let Some(sink) = self.monitors.get(&register) {
                sink.notify(register, value);
            }
        }
    }

    fn word(&self, register: MpsRegister) -> u16 {
        self.values.get(&register).map_or(0, RegisterValue::as_word)
    }

    fn staged_job(&self, lane: JobLane) -> ExecutedJob {
        let [data0, data1] = lane.data();
        ExecutedJob {
            lane,
            command: self.word(lane.action_id()),
            payload: [self.word(data0), self.word(data1)],
        }
    }

    fn apply_effects(&mut self, job: &ExecutedJob) {
        let type_code = self.machine_type.code();
        match job.command {
            COMMAND_SET_TYPE => self.identified_as = Some(job.payload[0]),
            LIGHT_COLOR_RESET => self.lights = [LightState::Off; 3],
            LIGHT_COLOR_RED..=LIGHT_COLOR_GREEN => {
                let state = match job.payload[0] {
                    1 => LightState::On,
                    2 => LightState::Blink,
                    _ => LightState::Off,
                };
                self.lights[usize::from(job.command - LIGHT_COLOR_RED)] = state;
            }
            c if c == type_code + COMMAND_MOVE_CONVEYOR_OFFSET => {
                let sensors = [
                    MpsRegister::SensorInput,
                    MpsRegister::SensorMiddle,
                    MpsRegister::SensorOutput,
                ];
                for (idx, sensor) in sensors.into_iter().enumerate() {
                    let hit = usize::from(job.payload[0]) == idx + 1;
                    self.set(sensor, RegisterValue::Bool(hit));
                }
            }
            c if c == type_code => {
                self.lights = [LightState::Off; 3];
                for sensor in [
                    MpsRegister::SensorInput,
                    MpsRegister::SensorMiddle,
                    MpsRegister::SensorOutput,
                ] {
                    self.set(sensor, RegisterValue::Bool(false));
                }
            }
            c if self.machine_type == MachineType::RingStation && c == type_code + 4 => {
                self.set(MpsRegister::SlideCountIn, RegisterValue::Word(0));
            }
            c if self.machine_type == MachineType::RingStation && c == type_code + 1 => {
                let count = self.word(MpsRegister::SlideCountIn).saturating_add(1);
                self.set(MpsRegister::SlideCountIn, RegisterValue::Word(count));
            }
            _ => {}
        }
    }
}

/// Shared device state of one simulated station.
#[derive(Clone)]
pub struct SimulatedStation {
    inner: Arc<Mutex<Model>>,
}

impl SimulatedStation {
    /// New idle station: both lanes ready, all sensors clear.
    pub fn new(machine_type: MachineType, options: SimOptions) -> Self {
        let mut values: BTreeMap<MpsRegister, RegisterValue> = MpsRegister::ALL
            .iter()
            .map(|r| (*r, RegisterValue::zero_for(*r)))
            .collect();
        values.insert(MpsRegister::StatusReadyIn, RegisterValue::Bool(true));
        values.insert(MpsRegister::StatusReadyBasic, RegisterValue::Bool(true));

        Self {
            inner: Arc::new(Mutex::new(Model {
                machine_type,
                options,
                online: true,
                values,
                monitors: BTreeMap::new(),
                faults: BTreeMap::new(),
                lights: [LightState::Off; 3],
                identified_as: None,
                lane_epoch: [0; 2],
                started: Vec::new(),
                completed: Vec::new(),
                opens: 0,
                monitor_calls: 0,
            })),
        }
    }

    /// Station type.
    pub fn machine_type(&self) -> MachineType {
        self.inner.lock().machine_type
    }

    /// Take the station off the network (or bring it back). While offline,
    /// opens, reads and writes fail and running jobs never finish.
    pub fn set_online(&self, online: bool) {
        self.inner.lock().online = online;
        debug!(online, "Simulated station availability changed");
    }

    /// True while reachable.
    pub fn is_online(&self) -> bool {
        self.inner.lock().online
    }

    /// When false, jobs start but the lane never reports ready.
    pub fn set_responding(&self, respond: bool) {
        self.inner.lock().options.respond = respond;
    }

    /// Make every future job with `command` fail with lane error `code`.
    pub fn inject_fault(&self, command: u16, code: u16) {
        self.inner.lock().faults.insert(command, code);
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Change a register from the device side (sensor edge, status change).
    pub fn set_value(&self, register: MpsRegister, value: RegisterValue) {
        self.inner.lock().set(register, value);
    }

    /// Current device-side value.
    pub fn value(&self, register: MpsRegister) -> RegisterValue {
        let model = self.inner.lock();
        model
            .values
            .get(&register)
            .copied()
            .unwrap_or_else(|| RegisterValue::zero_for(register))
    }

    /// Current state of one light.
    pub fn light(&self, color: LightColor) -> LightState {
        self.inner.lock().lights[light_index(color)]
    }

    /// Machine type the controller was told it runs, if any.
    pub fn identified_as(&self) -> Option<MachineType> {
        let code = self.inner.lock().identified_as?;
        MachineType::ALL.into_iter().find(|t| t.code() == code)
    }

    /// Jobs that ran to completion (successfully or with a fault), in order.
    pub fn jobs(&self) -> Vec<ExecutedJob> {
        self.inner.lock().completed.clone()
    }

    /// Jobs that were started, in order.
    pub fn started_jobs(&self) -> Vec<ExecutedJob> {
        self.inner.lock().started.clone()
    }

    /// Number of successful link opens.
    pub fn open_count(&self) -> u64 {
        self.inner.lock().opens
    }

    /// Registers with an installed monitored item.
    pub fn monitored(&self) -> Vec<MpsRegister> {
        self.inner.lock().monitors.keys().copied().collect()
    }

    /// Total number of monitor installs over the station's life.
    pub fn monitor_calls(&self) -> u64 {
        self.inner.lock().monitor_calls
    }

    fn start_job(&self, model: &mut Model, lane: JobLane, job: ExecutedJob) -> CommResult<()> {
        let idx = lane_index(lane);
        model.lane_epoch[idx] += 1;
        let epoch = model.lane_epoch[idx];

        model.set(lane.fault(), RegisterValue::Bool(false));
        model.set(lane.busy(), RegisterValue::Bool(true));
        model.set(lane.ready(), RegisterValue::Bool(false));
        model.started.push(job);
        trace!(%lane, command = job.command, "Simulated job started");

        if !model.options.respond {
            return Ok(());
        }

        let busy = model.options.busy_duration;
        let station = self.clone();
        thread::Builder::new()
            .name(format!("mps-sim-{lane}"))
            .spawn(move || {
                thread::sleep(busy);
                station.finish_job(lane, epoch, job);
            })?;
        Ok(())
    }

    fn finish_job(&self, lane: JobLane, epoch: u64, job: ExecutedJob) {
        let mut model = self.inner.lock();
        if model.lane_epoch[lane_index(lane)] != epoch || !model.online || !model.options.respond {
            return;
        }

        model.set(lane.busy(), RegisterValue::Bool(false));
        model.set(lane.enable(), RegisterValue::Bool(false));
        if let Some(code) = model.faults.get(&job.command).copied() {
            model.set(lane.error(), RegisterValue::Word(code));
            model.set(lane.fault(), RegisterValue::Bool(true));
        } else {
            model.apply_effects(&job);
            model.set(lane.error(), RegisterValue::Word(0));
            model.set(lane.ready(), RegisterValue::Bool(true));
        }
        model.completed.push(job);
        trace!(%lane, command = job.command, "Simulated job finished");
    }

    fn abort_job(&self, model: &mut Model, lane: JobLane) {
        model.lane_epoch[lane_index(lane)] += 1;
        model.set(lane.busy(), RegisterValue::Bool(false));
        model.set(lane.ready(), RegisterValue::Bool(true));
        trace!(%lane, "Simulated job aborted");
    }

    fn write(&self, register: MpsRegister, value: RegisterValue) -> CommResult<()> {
        let mut model = self.inner.lock();
        if !model.online {
            return Err(CommError::transport("simulated station offline"));
        }
        model.set(register, value);

        for lane in [JobLane::In, JobLane::Basic] {
            if register == lane.enable() {
                if value.as_bool() {
                    let job = model.staged_job(lane);
                    self.start_job(&mut model, lane, job)?;
                } else {
                    self.abort_job(&mut model, lane);
                }
                return Ok(());
            }
        }

        // The pick & place controller starts producing as soon as the
        // workpiece register is written.
        if model.machine_type == MachineType::PickPlace && register == MpsRegister::Data0In {
            let job = ExecutedJob {
                lane: JobLane::In,
                command: MachineType::PickPlace.job_command(1),
                payload: [value.as_word(), 0],
            };
            self.start_job(&mut model, JobLane::In, job)?;
        }
        Ok(())
    }

    fn read(&self, register: MpsRegister) -> CommResult<RegisterValue> {
        let mut model = self.inner.lock();
        if !model.online {
            return Err(CommError::transport("simulated station offline"));
        }
        if register == MpsRegister::Heartbeat {
            let beat = model.word(MpsRegister::Heartbeat).wrapping_add(1);
            model.values.insert(register, RegisterValue::Word(beat));
        }
        Ok(model
            .values
            .get(&register)
            .copied()
            .unwrap_or_else(|| RegisterValue::zero_for(register)))
    }
}

/// One link to a [`SimulatedStation`].
pub struct SimulatedTransport {
    station: SimulatedStation,
    open: bool,
}

impl SimulatedTransport {
    /// Create a closed link.
    pub fn new(station: SimulatedStation) -> Self {
        Self {
            station,
            open: false,
        }
    }

    fn ensure_open(&self) -> CommResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(CommError::transport("simulated link not open"))
        }
    }
}

impl Transport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn open(&mut self) -> CommResult<()> {
        let mut model = self.station.inner.lock();
        if !model.online {
            return Err(CommError::transport("simulated station unreachable"));
        }
        model.opens += 1;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.station.inner.lock().monitors.clear();
            self.open = false;
        }
    }

    fn read(&mut self, register: MpsRegister) -> CommResult<RegisterValue> {
        self.ensure_open()?;
        self.station.read(register)
    }

    fn write(&mut self, register: MpsRegister, value: RegisterValue) -> CommResult<()> {
        self.ensure_open()?;
        self.station.write(register, value)
    }

    fn supports_monitoring(&self) -> bool {
        true
    }

    fn monitor(&mut self, register: MpsRegister, sink: NotificationSink) -> CommResult<()> {
        self.ensure_open()?;
        let mut model = self.station.inner.lock();
        if !model.online {
            return Err(CommError::transport("simulated station offline"));
        }
        let current = model
            .values
            .get(&register)
            .copied()
            .unwrap_or_else(|| RegisterValue::zero_for(register));
        sink.notify(register, current);
        model.monitors.insert(register, sink);
        model.monitor_calls += 1;
        Ok(())
    }

    fn unmonitor(&mut self, register: MpsRegister) {
        self.station.inner.lock().monitors.remove(&register);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn open_link(machine_type: MachineType) -> (SimulatedStation, SimulatedTransport) {
        let station = SimulatedStation::new(machine_type, SimOptions::default());
        let mut link = SimulatedTransport::new(station.clone());
        link.open().expect("open");
        (station, link)
    }

    fn stage(link: &mut SimulatedTransport, lane: JobLane, command: u16, payload: [u16; 2]) {
        let [d0, d1] = lane.data();
        link.write(d0, RegisterValue::Word(payload[0])).expect("d0");
        link.write(d1, RegisterValue::Word(payload[1])).expect("d1");
        link.write(lane.action_id(), RegisterValue::Word(command))
            .expect("action");
        link.write(lane.enable(), RegisterValue::Bool(true)).expect("enable");
    }

    #[test]
    fn light_job_runs_to_ready() {
        let (station, mut link) = open_link(MachineType::BaseStation);
        stage(&mut link, JobLane::Basic, 21, [1, 0]);
        assert_eq!(
            station.value(MpsRegister::StatusBusyBasic),
            RegisterValue::Bool(true)
        );
        assert!(wait_until(|| station.value(MpsRegister::StatusReadyBasic).as_bool()));
        assert_eq!(station.light(LightColor::Red), LightState::On);
        assert_eq!(station.jobs().len(), 1);
    }

    #[test]
    fn injected_fault_raises_lane_error() {
        let (station, mut link) = open_link(MachineType::CapStation);
        station.inject_fault(201, 7);
        stage(&mut link, JobLane::In, 201, [2, 0]);
        assert!(wait_until(|| station.value(MpsRegister::StatusErrorIn).as_bool()));
        assert_eq!(station.value(MpsRegister::ErrorIn), RegisterValue::Word(7));
        assert!(!station.value(MpsRegister::StatusReadyIn).as_bool());
    }

    #[test]
    fn offline_station_rejects_io() {
        let (station, mut link) = open_link(MachineType::DeliveryStation);
        station.set_online(false);
        assert!(link.read(MpsRegister::Heartbeat).is_err());
        assert!(SimulatedTransport::new(station.clone()).open().is_err());
    }

    #[test]
    fn heartbeat_counts_reads() {
        let (_station, mut link) = open_link(MachineType::StorageStation);
        let a = link.read(MpsRegister::Heartbeat).expect("a").as_word();
        let b = link.read(MpsRegister::Heartbeat).expect("b").as_word();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn pick_place_produces_on_workpiece_write() {
        let (station, mut link) = open_link(MachineType::PickPlace);
        link.write(MpsRegister::Data0In, RegisterValue::Word(2))
            .expect("produce");
        assert!(wait_until(|| station.jobs().len() == 1));
        assert_eq!(station.jobs()[0].payload, [2, 0]);
    }

    #[test]
    fn close_drops_monitors() {
        let (station, mut link) = open_link(MachineType::RingStation);
        let sink = NotificationSink::detached();
        link.monitor(MpsRegister::SlideCountIn, sink).expect("monitor");
        assert_eq!(station.monitored(), vec![MpsRegister::SlideCountIn]);
        link.close();
        assert!(station.monitored().is_empty());
    }
}
