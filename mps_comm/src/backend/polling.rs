//! Polling backend.
//!
//! Register links without notifications. A capability call runs in the
//! caller's thread: it waits its turn at a FIFO ticket gate, writes the
//! mapped job registers and then reads the lane ready flag every polling
//! interval until it is set or the timeout elapses. The returned handle is
//! already complete.
//!
//! Registers missing from the station's address map are skipped when
//! staging a job; a lane whose ready flag is not mapped cannot run jobs at
//! all. Subscribed registers are refreshed on every heartbeat tick.

use super::BackendContext;
use crate::dispatcher::{AbortSlot, CancelToken, DispatchStats, InstructionHandle};
use crate::event_log::EventLog;
use crate::heartbeat::{HeartbeatSupervisor, LinkSupervised};
use crate::machine::Machine;
use crate::session::{Session, SessionState};
use crate::snapshot::{BackendKind, MachineSnapshot};
use crate::subscription::{Callback, SubscriptionHandle, SubscriptionRegistry, ValueSlot};
use crate::transport::Transport;
use mps_common::config::{Protocol, StationConfig};
use mps_common::consts::COMMAND_SET_TYPE;
use mps_common::error::{CommError, CommResult};
use mps_common::instruction::{Instruction, InstructionOutcome, StatusBits};
use mps_common::machine::{MachineType, ModbusMap};
use mps_common::register::{JobLane, MpsRegister, RegisterValue};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

// ─── Ticket gate ────────────────────────────────────────────────────

#[derive(Default)]
struct Tickets {
    next: u64,
    serving: u64,
}

/// Mutual exclusion that admits callers in arrival order.
#[derive(Default)]
struct TicketGate {
    tickets: Mutex<Tickets>,
    turn: Condvar,
}

struct Turn<'a> {
    gate: &'a TicketGate,
}

impl TicketGate {
    fn enter(&self) -> Turn<'_> {
        let mut tickets = self.tickets.lock();
        let mine = tickets.next;
        tickets.next += 1;
        while tickets.serving != mine {
            self.turn.wait(&mut tickets);
        }
        Turn { gate: self }
    }

    fn waiting(&self) -> usize {
        let tickets = self.tickets.lock();
        tickets.next.saturating_sub(tickets.serving).saturating_sub(1) as usize
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut tickets = self.gate.tickets.lock();
        tickets.serving += 1;
        self.gate.turn.notify_all();
    }
}

// ─── Link ───────────────────────────────────────────────────────────

struct PollingLink {
    session: Arc<Session>,
    registry: Arc<SubscriptionRegistry>,
    map: ModbusMap,
}

impl PollingLink {
    fn bring_up(&self) -> CommResult<()> {
        self.session.connect()?;
        self.registry.subscribe_all()
    }

    fn refresh(&self) -> CommResult<()> {
        for register in self.registry.device_registers() {
            if !self.map.contains(register) {
                continue;
            }
            let value = self.session.read(register)?;
            self.registry.record(register, value);
        }
        Ok(())
    }
}

impl LinkSupervised for PollingLink {
    fn is_up(&self) -> bool {
        self.session.is_ready()
    }

    fn ping(&self) -> CommResult<()> {
        self.session.ping()?;
        self.refresh()
    }

    fn rebuild(&self) -> CommResult<()> {
        self.registry.cancel_all(true);
        self.session.disconnect();
        self.bring_up()
    }
}

// ─── Machine ────────────────────────────────────────────────────────

/// Station driven over a register-polling transport.
pub struct PollingMachine {
    config: StationConfig,
    link: Arc<PollingLink>,
    heartbeat: HeartbeatSupervisor,
    gate: TicketGate,
    in_flight: AbortSlot,
    poll_interval: Duration,
    identified_generation: AtomicU64,
    next_id: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    stopped: AtomicBool,
    log: Arc<dyn EventLog>,
}

impl PollingMachine {
    /// Build the machine, attempt a first connect and start its heartbeat.
    ///
    /// # Errors
    /// Returns `CommError::Transport` if a thread cannot be spawned.
    pub fn start(
        config: StationConfig,
        transport: Box<dyn Transport>,
        ctx: &BackendContext,
    ) -> CommResult<Self> {
        let machine_type = config.machine_type;
        let session = Arc::new(Session::new(
            config.name.clone(),
            config.endpoint(),
            transport,
            true,
        ));
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&session),
            Arc::clone(&ctx.log),
        )?);
        for register in machine_type.subscribed_registers() {
            registry.subscribe(*register, None, None, false)?;
        }

        let link = Arc::new(PollingLink {
            session,
            registry,
            map: machine_type.modbus_map(),
        });
        if let Err(e) = link.bring_up().and_then(|()| link.refresh()) {
            warn!(station = %config.name, error = %e, "Initial connect failed; heartbeat will retry");
        }

        let heartbeat = HeartbeatSupervisor::new(
            config.name.clone(),
            Arc::clone(&link) as Arc<dyn LinkSupervised>,
            ctx.heartbeat.interval(),
            ctx.heartbeat.threshold(config.protocol),
        );
        heartbeat.start()?;

        info!(
            station = %config.name,
            machine_type = %machine_type,
            state = %link.session.state(),
            "Polling machine started"
        );
        Ok(Self {
            config,
            link,
            heartbeat,
            gate: TicketGate::default(),
            in_flight: AbortSlot::default(),
            poll_interval: ctx.dispatcher.poll_interval(),
            identified_generation: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            log: Arc::clone(&ctx.log),
        })
    }

    /// Station configuration.
    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Liveness supervisor.
    pub fn heartbeat(&self) -> &HeartbeatSupervisor {
        &self.heartbeat
    }

    /// Address map used to lower instructions.
    pub fn map(&self) -> &ModbusMap {
        &self.link.map
    }

    fn session(&self) -> &Session {
        &self.link.session
    }

    fn identified(&self) -> bool {
        let generation = self.session().generation();
        generation != 0 && self.identified_generation.load(Ordering::SeqCst) == generation
    }

    fn execute(&self, instruction: &Instruction) -> CommResult<()> {
        let generation = self.session().generation();
        let token = self.in_flight.arm(instruction);
        let result = self.run_instruction(instruction, &token, generation);
        self.in_flight.disarm();
        result
    }

    fn run_instruction(
        &self,
        instruction: &Instruction,
        token: &CancelToken,
        generation: u64,
    ) -> CommResult<()> {
        self.checkpoint(token, generation)?;

        let identify = self.config.machine_type.identify_instruction();
        let can_identify = self.link.map.contains(identify.lane.action_id());
        if can_identify
            && instruction.command != COMMAND_SET_TYPE
            && self.identified_generation.load(Ordering::SeqCst) != generation
        {
            debug!(station = %self.config.name, generation, "Identifying station");
            self.perform(&identify, token, generation)?;
            self.identified_generation.store(generation, Ordering::SeqCst);
        }

        self.perform(instruction, token, generation)?;
        if instruction.command == COMMAND_SET_TYPE {
            self.identified_generation.store(generation, Ordering::SeqCst);
        }
        Ok(())
    }

    fn checkpoint(&self, token: &CancelToken, generation: u64) -> CommResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(CommError::SessionClosed);
        }
        if token.is_cancelled() {
            return Err(CommError::Aborted);
        }
        if !self.session().is_ready() || self.session().generation() != generation {
            return Err(CommError::SessionClosed);
        }
        Ok(())
    }

    fn read(&self, register: MpsRegister) -> CommResult<RegisterValue> {
        let value = self.session().read(register)?;
        self.link.registry.record(register, value);
        Ok(value)
    }

    fn lane_fault(&self, lane: JobLane) -> CommResult<bool> {
        if self.link.map.contains(lane.fault()) {
            Ok(self.read(lane.fault())?.as_bool())
        } else {
            Ok(false)
        }
    }

    fn perform(
        &self,
        instruction: &Instruction,
        token: &CancelToken,
        generation: u64,
    ) -> CommResult<()> {
        let lane = instruction.lane;
        let map = &self.link.map;
        if !map.contains(lane.ready()) {
            return Err(CommError::unsupported(format!(
                "{} has no {lane} lane",
                self.config.name
            )));
        }
        debug!(station = %self.config.name, %instruction, "Executing");

        let result = self.stage_and_poll(instruction, token, generation);
        if matches!(result, Err(CommError::Aborted)) && map.contains(lane.enable()) {
            if let Err(e) = self.session().write(lane.enable(), false.into()) {
                warn!(station = %self.config.name, error = %e, "Abort write failed");
            }
            info!(station = %self.config.name, %instruction, "Instruction aborted");
        }
        result
    }

    fn stage_and_poll(
        &self,
        instruction: &Instruction,
        token: &CancelToken,
        generation: u64,
    ) -> CommResult<()> {
        let lane = instruction.lane;
        let map = &self.link.map;
        let [data0, data1] = lane.data();
        let mut staged = vec![
            (data0, RegisterValue::from(instruction.payload[0])),
            (data1, RegisterValue::from(instruction.payload[1])),
            (lane.action_id(), RegisterValue::from(instruction.command)),
        ];
        let enable = instruction.status.contains(StatusBits::ENABLE);
        if enable {
            staged.push((lane.enable(), RegisterValue::Bool(true)));
        }

        // Ready and fault still hold the previous job's result until the
        // controller picks up the new one.
        let ready_before = self.read(lane.ready())?.as_bool();
        let fault_before = self.lane_fault(lane)?;

        let mut wrote = false;
        for (register, value) in staged {
            if !map.contains(register) {
                trace!(station = %self.config.name, %register, "Not mapped, skipped");
                continue;
            }
            self.session().write(register, value)?;
            wrote = true;
            self.checkpoint(token, generation)?;
        }
        if !wrote {
            return Err(CommError::unsupported(format!(
                "{} cannot stage command {}",
                self.config.name, instruction.command
            )));
        }
        if !enable {
            return Ok(());
        }

        let budget = instruction.deadline_budget(self.poll_interval);
        let deadline = Instant::now() + budget;
        let mut started = !ready_before && !fault_before;
        loop {
            self.checkpoint(token, generation)?;
            let ready = self.read(lane.ready())?.as_bool();
            let fault = self.lane_fault(lane)?;
            if !started {
                let busy = map.contains(lane.busy()) && self.read(lane.busy())?.as_bool();
                started = busy || (!ready && !fault);
            }
            if started && fault {
                let code = if map.contains(lane.error()) {
                    self.read(lane.error())?.as_word()
                } else {
                    0
                };
                return Err(CommError::DeviceFault {
                    register: lane.error(),
                    code,
                });
            }
            if started && ready {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CommError::Timeout(budget));
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}

impl Machine for PollingMachine {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn machine_type(&self) -> MachineType {
        self.config.machine_type
    }

    fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    fn submit(&self, instruction: Instruction) -> CommResult<InstructionHandle> {
        if !self.session().is_ready() {
            return Err(CommError::SessionNotReady);
        }
        let _turn = self.gate.enter();
        if !self.session().is_ready() {
            return Err(CommError::SessionNotReady);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let outcome = match self.execute(&instruction) {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                InstructionOutcome::Completed
            }
            Err(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.log
                    .instruction_failed(&self.config.name, &instruction, &error);
                InstructionOutcome::Failed(error)
            }
        };
        Ok(InstructionHandle::completed(id, outcome))
    }

    fn abort(&self) -> bool {
        let aborted = self.in_flight.abort();
        if aborted {
            info!(station = %self.config.name, "Abort requested");
        }
        aborted
    }

    fn session_state(&self) -> SessionState {
        self.session().state()
    }

    fn register_value(&self, register: MpsRegister) -> Option<RegisterValue> {
        self.link.registry.value(register)
    }

    fn read_register(&self, register: MpsRegister) -> CommResult<RegisterValue> {
        self.read(register)
    }

    fn add_callback(
        &self,
        register: MpsRegister,
        callback: Option<Callback>,
        slot: Option<ValueSlot>,
        simulation: bool,
    ) -> CommResult<SubscriptionHandle> {
        self.link
            .registry
            .subscribe(register, callback, slot, simulation)
    }

    fn push_simulated(&self, register: MpsRegister, value: RegisterValue) {
        self.link.registry.push_simulated(register, value);
    }

    fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            name: self.config.name.clone(),
            machine_type: self.config.machine_type,
            protocol: self.config.protocol,
            backend: BackendKind::Polling,
            session: self.session().state(),
            generation: self.session().generation(),
            identified: self.identified(),
            queue_len: self.gate.waiting(),
            in_flight: self.in_flight.current(),
            values: self.link.registry.values(),
            dispatch: DispatchStats {
                completed: self.completed.load(Ordering::Relaxed),
                failed: self.failed.load(Ordering::Relaxed),
            },
            heartbeat: self.heartbeat.stats(),
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heartbeat.stop();
        self.in_flight.abort();
        let _turn = self.gate.enter();
        self.link.registry.cancel_all(true);
        self.link.session.disconnect();
        self.link.registry.stop();
        info!(station = %self.config.name, "Polling machine stopped");
    }
}

impl Drop for PollingMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
