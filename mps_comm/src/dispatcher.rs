//! Command dispatcher.
//!
//! An unbounded FIFO of instructions and one worker thread that executes them
//! against the session, strictly one at a time and in enqueue order.
//!
//! # Worker loop
//!
//! 1. Wait until the queue is non-empty or shutdown is requested.
//! 2. Peek the head. While the session is not `Ready` the head stays queued.
//! 3. Pop it and execute it under the execution lock:
//!    - identify the station first if this session generation has not been
//!      identified yet
//!    - write the payload words, the action id, then the lane enable flag
//!    - wait for a fresh lane ready notification, the lane error flag, the
//!      timeout, an abort, or the session leaving `Ready`
//! 4. Complete the instruction handle and go back to 1.
//!
//! `enqueue` only takes the queue lock, so it never waits behind device I/O.
//! Cancellation is checked at the start of an instruction, after every
//! register operation and after every wait slice.

use crate::event_log::EventLog;
use crate::session::Session;
use crate::subscription::SubscriptionRegistry;
use mps_common::consts::COMMAND_SET_TYPE;
use mps_common::error::{CommError, CommResult};
use mps_common::instruction::{Instruction, InstructionOutcome, StatusBits};
use mps_common::machine::MachineType;
use mps_common::register::{MpsRegister, RegisterValue};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ─── Instruction handles ────────────────────────────────────────────

struct Completion {
    outcome: Mutex<Option<InstructionOutcome>>,
    done: Condvar,
}

/// Caller's view of one submitted instruction.
#[derive(Clone)]
pub struct InstructionHandle {
    id: u64,
    completion: Arc<Completion>,
}

impl InstructionHandle {
    fn pending(id: u64) -> Self {
        Self {
            id,
            completion: Arc::new(Completion {
                outcome: Mutex::new(None),
                done: Condvar::new(),
            }),
        }
    }

    /// Handle that is already complete.
    pub fn completed(id: u64, outcome: InstructionOutcome) -> Self {
        let handle = Self::pending(id);
        handle.complete(outcome);
        handle
    }

    pub(crate) fn complete(&self, outcome: InstructionOutcome) {
        let mut slot = self.completion.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.completion.done.notify_all();
        }
    }

    /// Submission number, unique per machine.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once an outcome is available.
    pub fn is_done(&self) -> bool {
        self.completion.outcome.lock().is_some()
    }

    /// Outcome, if available.
    pub fn try_outcome(&self) -> Option<InstructionOutcome> {
        self.completion.outcome.lock().clone()
    }

    /// Block until the instruction completes.
    pub fn wait(&self) -> InstructionOutcome {
        let mut slot = self.completion.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.completion.done.wait(&mut slot);
        }
    }

    /// Block until the instruction completes or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<InstructionOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.completion.outcome.lock();
        while slot.is_none() {
            if self.completion.done.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        slot.clone()
    }
}

impl fmt::Debug for InstructionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionHandle")
            .field("id", &self.id)
            .field("outcome", &self.try_outcome())
            .finish()
    }
}

// ─── Cancellation ───────────────────────────────────────────────────

/// Per-instruction cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Instruction currently executing, shared with `abort()` callers.
pub(crate) struct InFlight {
    pub(crate) instruction: Instruction,
    pub(crate) token: CancelToken,
}

/// Slot holding the in-flight instruction and its token. The only state a
/// caller may touch while an instruction executes.
#[derive(Default)]
pub(crate) struct AbortSlot(Mutex<Option<InFlight>>);

impl AbortSlot {
    pub(crate) fn arm(&self, instruction: &Instruction) -> CancelToken {
        let token = CancelToken::new();
        *self.0.lock() = Some(InFlight {
            instruction: instruction.clone(),
            token: token.clone(),
        });
        token
    }

    pub(crate) fn disarm(&self) {
        *self.0.lock() = None;
    }

    /// Cancel the in-flight instruction. False when idle.
    pub(crate) fn abort(&self) -> bool {
        match self.0.lock().as_ref() {
            Some(in_flight) => {
                in_flight.token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn current(&self) -> Option<Instruction> {
        self.0.lock().as_ref().map(|f| f.instruction.clone())
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────

struct Pending {
    instruction: Instruction,
    handle: InstructionHandle,
}

/// Result of one run of the queue head.
enum Attempt {
    Finished(InstructionOutcome),
    /// The session closed before any of the instruction's own registers
    /// were written; it goes back to the front of the queue.
    NotStarted,
}

struct QueueState {
    items: VecDeque<Pending>,
    shutdown: bool,
}

/// Dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    /// Instructions completed successfully.
    pub completed: u64,
    /// Instructions that failed.
    pub failed: u64,
}

struct Shared {
    station: String,
    machine_type: MachineType,
    session: Arc<Session>,
    registry: Arc<SubscriptionRegistry>,
    log: Arc<dyn EventLog>,
    poll_interval: Duration,
    queue: Mutex<QueueState>,
    queued: Condvar,
    exec: Mutex<()>,
    identified_generation: AtomicU64,
    in_flight: AbortSlot,
    stopping: AtomicBool,
    next_id: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// FIFO queue and worker of one pub/sub machine.
pub struct Dispatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create the dispatcher and start its worker.
    ///
    /// # Errors
    /// Returns `CommError::Transport` if the worker thread cannot be spawned.
    pub fn spawn(
        machine_type: MachineType,
        session: Arc<Session>,
        registry: Arc<SubscriptionRegistry>,
        log: Arc<dyn EventLog>,
        poll_interval: Duration,
    ) -> CommResult<Self> {
        let station = session.station().to_string();
        let shared = Arc::new(Shared {
            station: station.clone(),
            machine_type,
            session,
            registry,
            log,
            poll_interval,
            queue: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            queued: Condvar::new(),
            exec: Mutex::new(()),
            identified_generation: AtomicU64::new(0),
            in_flight: AbortSlot::default(),
            stopping: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("mps-dispatch-{station}"))
            .spawn(move || worker_shared.run())?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Append `instruction` to the queue. Never blocks behind device I/O.
    /// After shutdown the returned handle is already failed with
    /// `SessionClosed`.
    pub fn enqueue(&self, instruction: Instruction) -> InstructionHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return InstructionHandle::completed(
                id,
                InstructionOutcome::Failed(CommError::SessionClosed),
            );
        }
        let handle = InstructionHandle::pending(id);
        debug!(station = %self.shared.station, id, %instruction, "Enqueued");
        queue.items.push_back(Pending {
            instruction,
            handle: handle.clone(),
        });
        self.shared.queued.notify_one();
        handle
    }

    /// Cancel the instruction currently executing. Queued instructions are
    /// unaffected. Returns false (and does nothing) when idle.
    pub fn abort(&self) -> bool {
        let aborted = self.shared.in_flight.abort();
        if aborted {
            info!(station = %self.shared.station, "Abort requested");
        }
        aborted
    }

    /// Number of instructions waiting (excluding the one executing).
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Instruction currently executing.
    pub fn in_flight(&self) -> Option<Instruction> {
        self.shared.in_flight.current()
    }

    /// True if the station has been identified on the current session.
    pub fn identified(&self) -> bool {
        let generation = self.shared.session.generation();
        generation != 0 && self.shared.identified_generation.load(Ordering::SeqCst) == generation
    }

    /// Completion counters.
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker. The in-flight instruction fails with `SessionClosed`
    /// at its next checkpoint; queued instructions fail with `SessionClosed`.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            self.shared.queued.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
            info!(station = %self.shared.station, "Dispatcher stopped");
        }
        self.shared.fail_queued();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn run(&self) {
        debug!(station = %self.station, "Dispatcher worker started");
        loop {
            {
                let mut queue = self.queue.lock();
                while queue.items.is_empty() && !queue.shutdown {
                    self.queued.wait(&mut queue);
                }
                if queue.shutdown {
                    break;
                }
            }

            // Hold the head until the session is ready.
            if !self.session.is_ready() {
                self.session.wait_ready(self.poll_interval);
                continue;
            }

            let Some(pending) = self.queue.lock().items.pop_front() else {
                continue;
            };
            match self.execute(&pending.instruction) {
                Attempt::Finished(outcome) => self.finish(&pending, outcome),
                Attempt::NotStarted => {
                    debug!(
                        station = %self.station,
                        id = pending.handle.id(),
                        "Session lost before start, requeued"
                    );
                    self.queue.lock().items.push_front(pending);
                }
            }
        }
        self.fail_queued();
        debug!(station = %self.station, "Dispatcher worker exiting");
    }

    fn finish(&self, pending: &Pending, outcome: InstructionOutcome) {
        match &outcome {
            InstructionOutcome::Completed => {
                self.completed.fetch_add(1, Ordering::Relaxed);
                debug!(station = %self.station, id = pending.handle.id(), "Instruction completed");
            }
            InstructionOutcome::Failed(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.log
                    .instruction_failed(&self.station, &pending.instruction, error);
            }
        }
        pending.handle.complete(outcome);
    }

    fn fail_queued(&self) {
        let drained: Vec<Pending> = self.queue.lock().items.drain(..).collect();
        for pending in drained {
            self.finish(
                &pending,
                InstructionOutcome::Failed(CommError::SessionClosed),
            );
        }
    }

    fn execute(&self, instruction: &Instruction) -> Attempt {
        let _exec = self.exec.lock();
        let token = self.in_flight.arm(instruction);
        let mut started = false;
        let result = self.run_instruction(instruction, &token, &mut started);
        self.in_flight.disarm();
        match result {
            Ok(()) => Attempt::Finished(InstructionOutcome::Completed),
            Err(CommError::SessionClosed) if !started && !self.stopping.load(Ordering::SeqCst) => {
                Attempt::NotStarted
            }
            Err(error) => Attempt::Finished(InstructionOutcome::Failed(error)),
        }
    }

    /// Run `instruction`, identifying the station first on a new session.
    /// `started` is set once the first of the instruction's own registers
    /// has been written.
    fn run_instruction(
        &self,
        instruction: &Instruction,
        token: &CancelToken,
        started: &mut bool,
    ) -> CommResult<()> {
        let generation = self.session.generation();
        self.checkpoint(token, generation)?;

        if self.identified_generation.load(Ordering::SeqCst) != generation {
            if instruction.command != COMMAND_SET_TYPE {
                let identify = self.machine_type.identify_instruction();
                debug!(station = %self.station, generation, "Identifying station");
                self.perform(&identify, token, generation, &mut false)?;
                self.identified_generation.store(generation, Ordering::SeqCst);
            } else {
                self.perform(instruction, token, generation, started)?;
                self.identified_generation.store(generation, Ordering::SeqCst);
                return Ok(());
            }
        }

        self.perform(instruction, token, generation, started)
    }

    fn checkpoint(&self, token: &CancelToken, generation: u64) -> CommResult<()> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(CommError::SessionClosed);
        }
        if token.is_cancelled() {
            return Err(CommError::Aborted);
        }
        if !self.session.is_ready() || self.session.generation() != generation {
            return Err(CommError::SessionClosed);
        }
        Ok(())
    }

    fn write(
        &self,
        register: MpsRegister,
        value: RegisterValue,
        token: &CancelToken,
        generation: u64,
        started: &mut bool,
    ) -> CommResult<()> {
        self.session.write(register, value)?;
        *started = true;
        self.checkpoint(token, generation)
    }

    fn perform(
        &self,
        instruction: &Instruction,
        token: &CancelToken,
        generation: u64,
        started: &mut bool,
    ) -> CommResult<()> {
        let lane = instruction.lane;
        debug!(station = %self.station, %instruction, "Executing");

        let result = self.stage_and_wait(instruction, token, generation, started);
        if matches!(result, Err(CommError::Aborted)) {
            // Vendor abort: drop the lane enable flag.
            if let Err(e) = self.session.write(lane.enable(), false.into()) {
                warn!(station = %self.station, error = %e, "Abort write failed");
            }
            info!(station = %self.station, %instruction, "Instruction aborted");
        }
        result
    }

    fn stage_and_wait(
        &self,
        instruction: &Instruction,
        token: &CancelToken,
        generation: u64,
        started: &mut bool,
    ) -> CommResult<()> {
        let lane = instruction.lane;
        let [data0, data1] = lane.data();
        let after = self.registry.last_seq();

        self.write(data0, instruction.payload[0].into(), token, generation, started)?;
        self.write(data1, instruction.payload[1].into(), token, generation, started)?;
        self.write(lane.action_id(), instruction.command.into(), token, generation, started)?;
        if !instruction.status.contains(StatusBits::ENABLE) {
            return Ok(());
        }
        self.write(lane.enable(), true.into(), token, generation, started)?;

        let budget = instruction.deadline_budget(self.poll_interval);
        self.registry.wait_for(
            budget,
            self.poll_interval,
            || self.checkpoint(token, generation),
            |obs| {
                if obs.fresh(lane.fault(), after).is_some_and(|v| v.as_bool()) {
                    let code = obs.value(lane.error()).map_or(0, |v| v.as_word());
                    return Some(Err(CommError::DeviceFault {
                        register: lane.error(),
                        code,
                    }));
                }
                obs.fresh(lane.ready(), after)
                    .filter(|v| v.as_bool())
                    .map(|_| Ok(()))
            },
        )?
    }
}
