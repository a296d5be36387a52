//! Pub/sub backend.
//!
//! Queue + subscriptions: capability calls return immediately with a pending
//! handle, one worker executes instructions in order and completion is
//! observed through lane status notifications.

use super::BackendContext;
use crate::dispatcher::{Dispatcher, InstructionHandle};
use crate::heartbeat::{HeartbeatSupervisor, LinkSupervised};
use crate::machine::Machine;
use crate::session::{Session, SessionState};
use crate::snapshot::{BackendKind, MachineSnapshot};
use crate::subscription::{Callback, SubscriptionHandle, SubscriptionRegistry, ValueSlot};
use crate::transport::Transport;
use mps_common::config::{Protocol, StationConfig};
use mps_common::error::CommResult;
use mps_common::instruction::Instruction;
use mps_common::machine::MachineType;
use mps_common::register::{MpsRegister, RegisterValue};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Session plus subscriptions, rebuilt as one unit.
struct PubSubLink {
    session: Arc<Session>,
    registry: Arc<SubscriptionRegistry>,
}

impl PubSubLink {
    fn bring_up(&self) -> CommResult<()> {
        self.session.connect()?;
        self.registry.subscribe_all()
    }
}

impl LinkSupervised for PubSubLink {
    fn is_up(&self) -> bool {
        self.session.is_ready()
    }

    fn ping(&self) -> CommResult<()> {
        self.session.ping()
    }

    fn rebuild(&self) -> CommResult<()> {
        self.registry.cancel_all(true);
        self.session.disconnect();
        self.bring_up()
    }
}

/// Station driven over a notification-capable transport.
pub struct PubSubMachine {
    config: StationConfig,
    session: Arc<Session>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    heartbeat: HeartbeatSupervisor,
    stopped: AtomicBool,
}

impl PubSubMachine {
    /// Build the machine and start its threads.
    ///
    /// The station's default registers are subscribed and a first connect is
    /// attempted. A failed first connect is not an error: the heartbeat keeps
    /// rebuilding the link and queued instructions wait for it.
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
            false,
        ));
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&session),
            Arc::clone(&ctx.log),
        )?);
        for register in machine_type.subscribed_registers() {
            registry.subscribe(*register, None, None, false)?;
        }

        let link = Arc::new(PubSubLink {
            session: Arc::clone(&session),
            registry: Arc::clone(&registry),
        });
        if let Err(e) = link.bring_up() {
            warn!(station = %config.name, error = %e, "Initial connect failed; heartbeat will retry");
        }

        let dispatcher = Dispatcher::spawn(
            machine_type,
            Arc::clone(&session),
            Arc::clone(&registry),
            Arc::clone(&ctx.log),
            ctx.dispatcher.poll_interval(),
        )?;
        let heartbeat = HeartbeatSupervisor::new(
            config.name.clone(),
            link,
            ctx.heartbeat.interval(),
            ctx.heartbeat.threshold(config.protocol),
        );
        heartbeat.start()?;

        info!(
            station = %config.name,
            machine_type = %machine_type,
            protocol = %config.protocol,
            state = %session.state(),
            "Pub/sub machine started"
        );
        Ok(Self {
            config,
            session,
            registry,
            dispatcher,
            heartbeat,
            stopped: AtomicBool::new(false),
        })
    }

    /// Station configuration.
    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Instruction queue.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Liveness supervisor.
    pub fn heartbeat(&self) -> &HeartbeatSupervisor {
        &self.heartbeat
    }

    /// Subscriptions.
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Connection session.
    pub fn session(&self) -> &Session {
        &self.session
    }
}

impl Machine for PubSubMachine {
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
        Ok(self.dispatcher.enqueue(instruction))
    }

    fn abort(&self) -> bool {
        self.dispatcher.abort()
    }

    fn session_state(&self) -> SessionState {
        self.session.state()
    }

    fn register_value(&self, register: MpsRegister) -> Option<RegisterValue> {
        self.registry.value(register)
    }

    fn read_register(&self, register: MpsRegister) -> CommResult<RegisterValue> {
        self.session.read(register)
    }

    fn add_callback(
        &self,
        register: MpsRegister,
        callback: Option<Callback>,
        slot: Option<ValueSlot>,
        simulation: bool,
    ) -> CommResult<SubscriptionHandle> {
        self.registry.subscribe(register, callback, slot, simulation)
    }

    fn push_simulated(&self, register: MpsRegister, value: RegisterValue) {
        self.registry.push_simulated(register, value);
    }

    fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot {
            name: self.config.name.clone(),
            machine_type: self.config.machine_type,
            protocol: self.config.protocol,
            backend: BackendKind::PubSub,
            session: self.session.state(),
            generation: self.session.generation(),
            identified: self.dispatcher.identified(),
            queue_len: self.dispatcher.queue_len(),
            in_flight: self.dispatcher.in_flight(),
            values: self.registry.values(),
            dispatch: self.dispatcher.stats(),
            heartbeat: self.heartbeat.stats(),
        }
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.heartbeat.stop();
        self.dispatcher.shutdown();
        self.registry.cancel_all(true);
        self.session.disconnect();
        self.registry.stop();
        info!(station = %self.config.name, "Pub/sub machine stopped");
    }
}

impl Drop for PubSubMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
