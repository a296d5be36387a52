//! Subscription registry.
//!
//! Maps registers to notification targets and keeps the last value seen for
//! each. Transports never call user code: they push `(register, value)` into
//! a [`NotificationSink`], a non-blocking channel hand-off, and a single
//! consumer thread applies notifications in arrival order:
//!
//! 1. drop it if it belongs to a stale session generation or the register is
//!    not actively subscribed
//! 2. store the value and a fresh sequence number
//! 3. write the output slot, run the callback, wake waiters
//!
//! Bindings (callback, slot, simulation flag) survive a session teardown.
//! [`SubscriptionRegistry::subscribe_all`] re-installs each of them exactly
//! once on the new session.

use crate::event_log::EventLog;
use crate::session::Session;
use mps_common::error::{CommError, CommResult};
use mps_common::register::{MpsRegister, RegisterValue};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Callback run on the notification consumer thread.
///
/// Callbacks must only touch registry-side state (their own captures, output
/// slots). They must never enqueue instructions or block on device I/O.
pub type Callback = Arc<dyn Fn(MpsRegister, RegisterValue) + Send + Sync>;

/// Externally supplied output slot updated on every notification.
#[derive(Debug, Clone, Default)]
pub struct ValueSlot(Arc<Mutex<Option<RegisterValue>>>);

impl ValueSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value written, if any.
    pub fn get(&self) -> Option<RegisterValue> {
        *self.0.lock()
    }

    fn set(&self, value: RegisterValue) {
        *self.0.lock() = Some(value);
    }
}

enum Message {
    Notify {
        generation: u64,
        register: MpsRegister,
        value: RegisterValue,
    },
    Flush(Sender<()>),
    Stop,
}

/// Non-blocking hand-off from a transport thread into the registry.
///
/// Tagged with the session generation it was created for; notifications of
/// a torn-down session are discarded by the consumer.
#[derive(Clone)]
pub struct NotificationSink {
    tx: Sender<Message>,
    generation: u64,
}

impl NotificationSink {
    /// Push one value change. Never blocks; silently dropped once the
    /// registry has stopped.
    pub fn notify(&self, register: MpsRegister, value: RegisterValue) {
        let _ = self.tx.send(Message::Notify {
            generation: self.generation,
            register,
            value,
        });
    }

    /// Session generation this sink belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::channel();
        Self { tx, generation: 0 }
    }
}

impl fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Handle returned by [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Subscribed register.
    pub register: MpsRegister,
    /// Session generation the subscription was installed on (0 if deferred).
    pub generation: u64,
}

#[derive(Clone, Default)]
struct Binding {
    callback: Option<Callback>,
    slot: Option<ValueSlot>,
    simulation: bool,
}

#[derive(Default)]
struct Entry {
    binding: Binding,
    active: bool,
    value: Option<RegisterValue>,
    seq: u64,
    updates: u64,
}

struct RegistryState {
    entries: BTreeMap<MpsRegister, Entry>,
    generation: u64,
    last_seq: u64,
    stopped: bool,
}

/// Read access to fresh values while waiting, see [`SubscriptionRegistry::wait_for`].
pub struct Observed<'a> {
    state: &'a RegistryState,
}

impl Observed<'_> {
    /// Cached value of `register`.
    pub fn value(&self, register: MpsRegister) -> Option<RegisterValue> {
        self.state.entries.get(&register).and_then(|e| e.value)
    }

    /// Cached value of `register` if it arrived after sequence `after_seq`.
    pub fn fresh(&self, register: MpsRegister, after_seq: u64) -> Option<RegisterValue> {
        self.state
            .entries
            .get(&register)
            .filter(|e| e.seq > after_seq)
            .and_then(|e| e.value)
    }
}

struct Shared {
    station: String,
    state: Mutex<RegistryState>,
    updated: Condvar,
    log: Arc<dyn EventLog>,
}

/// Live subscriptions of one machine.
pub struct SubscriptionRegistry {
    shared: Arc<Shared>,
    session: Arc<Session>,
    tx: Sender<Message>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionRegistry {
    /// Create a registry bound to `session` and start its consumer thread.
    ///
    /// # Errors
    /// Returns `CommError::Transport` if the consumer thread cannot be spawned.
    pub fn new(session: Arc<Session>, log: Arc<dyn EventLog>) -> CommResult<Self> {
        let station = session.station().to_string();
        let shared = Arc::new(Shared {
            station: station.clone(),
            state: Mutex::new(RegistryState {
                entries: BTreeMap::new(),
                generation: 0,
                last_seq: 0,
                stopped: false,
            }),
            updated: Condvar::new(),
            log,
        });

        let (tx, rx) = mpsc::channel();
        let consumer_shared = Arc::clone(&shared);
        let consumer = thread::Builder::new()
            .name(format!("mps-notify-{station}"))
            .spawn(move || consume(consumer_shared, rx))?;

        Ok(Self {
            shared,
            session,
            tx,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    fn sink(&self, generation: u64) -> NotificationSink {
        NotificationSink {
            tx: self.tx.clone(),
            generation,
        }
    }

    /// Subscribe to `register`, replacing any previous binding.
    ///
    /// On a linked session with a monitoring transport the item is installed
    /// immediately; otherwise the binding is stored and activated by the next
    /// [`SubscriptionRegistry::subscribe_all`]. Simulation subscriptions are
    /// never installed on the transport and only see
    /// [`SubscriptionRegistry::push_simulated`] values.
    ///
    /// # Errors
    /// Returns the transport error if installing the monitored item fails.
    pub fn subscribe(
        &self,
        register: MpsRegister,
        callback: Option<Callback>,
        slot: Option<ValueSlot>,
        simulation: bool,
    ) -> CommResult<SubscriptionHandle> {
        let generation = {
            let mut state = self.shared.state.lock();
            let generation = state.generation;
            let entry = state.entries.entry(register).or_default();
            entry.binding = Binding {
                callback,
                slot,
                simulation,
            };
            generation
        };

        let live = self.session.state().is_linked() && self.session.generation() == generation;
        if !live {
            debug!(station = %self.shared.station, %register, "Subscription deferred");
            return Ok(SubscriptionHandle {
                register,
                generation: 0,
            });
        }

        if !simulation && self.session.supports_monitoring() {
            self.session.monitor(register, self.sink(generation))?;
        }
        if let Some(entry) = self.shared.state.lock().entries.get_mut(&register) {
            entry.active = true;
        }
        debug!(station = %self.shared.station, %register, simulation, "Subscribed");
        Ok(SubscriptionHandle {
            register,
            generation,
        })
    }

    /// Install every remembered binding on the current session and move the
    /// session to `Ready`. Polling sessions are already `Ready` after connect;
    /// their bindings are only re-activated.
    ///
    /// # Errors
    /// Returns the first transport error; the session is left `Subscribing`
    /// and the heartbeat will rebuild it.
    pub fn subscribe_all(&self) -> CommResult<()> {
        let polling = self.session.is_polling();
        if !polling {
            self.session.begin_subscribing()?;
        }
        let generation = self.session.generation();
        let monitoring = self.session.supports_monitoring();

        let bindings: Vec<(MpsRegister, bool)> = {
            let mut state = self.shared.state.lock();
            state.generation = generation;
            state
                .entries
                .iter_mut()
                .map(|(register, entry)| {
                    entry.active = false;
                    (*register, entry.binding.simulation)
                })
                .collect()
        };

        for (register, simulation) in &bindings {
            if !simulation && monitoring {
                self.session.monitor(*register, self.sink(generation))?;
            }
            if let Some(entry) = self.shared.state.lock().entries.get_mut(register) {
                entry.active = true;
            }
        }

        // Initial values pushed by the transport must be applied before the
        // dispatcher records its first sequence number.
        self.flush();
        if !polling {
            self.session.mark_ready()?;
        }
        info!(
            station = %self.shared.station,
            generation,
            count = bindings.len(),
            "Subscriptions installed"
        );
        Ok(())
    }

    /// Stop notifications for `register` and forget its binding.
    pub fn cancel(&self, register: MpsRegister, log: bool) {
        let removed = self.shared.state.lock().entries.remove(&register);
        if let Some(entry) = removed {
            if entry.active && !entry.binding.simulation {
                self.session.unmonitor(register);
            }
            if log {
                self.shared
                    .log
                    .subscription_final(&self.shared.station, register, entry.value);
            }
            debug!(station = %self.shared.station, %register, "Subscription cancelled");
        }
    }

    /// Deactivate every subscription, keeping the bindings for the next
    /// [`SubscriptionRegistry::subscribe_all`]. Runs as part of a disconnect.
    pub fn cancel_all(&self, log: bool) {
        let finals: Vec<(MpsRegister, Option<RegisterValue>)> = {
            let mut state = self.shared.state.lock();
            state
                .entries
                .iter_mut()
                .filter(|(_, entry)| entry.active)
                .map(|(register, entry)| {
                    entry.active = false;
                    (*register, entry.value)
                })
                .collect()
        };
        self.shared.updated.notify_all();

        if log {
            for (register, value) in &finals {
                self.shared
                    .log
                    .subscription_final(&self.shared.station, *register, *value);
            }
        }
        if !finals.is_empty() {
            debug!(station = %self.shared.station, count = finals.len(), "Subscriptions deactivated");
        }
    }

    /// Push a synthetic value through the normal notification path.
    pub fn push_simulated(&self, register: MpsRegister, value: RegisterValue) {
        let generation = self.shared.state.lock().generation;
        self.sink(generation).notify(register, value);
    }

    /// Publish a value read by polling through the normal notification path.
    pub fn record(&self, register: MpsRegister, value: RegisterValue) {
        self.push_simulated(register, value);
    }

    /// Block until every notification queued so far has been applied.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(Message::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv_timeout(Duration::from_secs(1));
        }
    }

    /// Cached value of `register`.
    pub fn value(&self, register: MpsRegister) -> Option<RegisterValue> {
        self.shared
            .state
            .lock()
            .entries
            .get(&register)
            .and_then(|e| e.value)
    }

    /// Every cached value.
    pub fn values(&self) -> BTreeMap<MpsRegister, RegisterValue> {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .filter_map(|(r, e)| e.value.map(|v| (*r, v)))
            .collect()
    }

    /// Registers with a binding, active or not.
    pub fn subscribed(&self) -> Vec<MpsRegister> {
        self.shared.state.lock().entries.keys().copied().collect()
    }

    /// Active registers fed by the device (simulation bindings excluded).
    pub fn device_registers(&self) -> Vec<MpsRegister> {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .filter(|(_, e)| e.active && !e.binding.simulation)
            .map(|(r, _)| *r)
            .collect()
    }

    /// True if `register` currently receives notifications.
    pub fn is_active(&self, register: MpsRegister) -> bool {
        self.shared
            .state
            .lock()
            .entries
            .get(&register)
            .is_some_and(|e| e.active)
    }

    /// Number of notifications applied to `register`.
    pub fn update_count(&self, register: MpsRegister) -> u64 {
        self.shared
            .state
            .lock()
            .entries
            .get(&register)
            .map_or(0, |e| e.updates)
    }

    /// Sequence number of the last applied notification.
    pub fn last_seq(&self) -> u64 {
        self.shared.state.lock().last_seq
    }

    /// Wait until `probe` yields a result, `budget` elapses or `checkpoint`
    /// fails. `checkpoint` runs before the first probe and after every wait
    /// slice of at most `slice`.
    ///
    /// # Errors
    /// The checkpoint's error, `CommError::Timeout(budget)` on expiry or
    /// `CommError::SessionClosed` once the registry has stopped.
    pub fn wait_for<T>(
        &self,
        budget: Duration,
        slice: Duration,
        mut checkpoint: impl FnMut() -> CommResult<()>,
        mut probe: impl FnMut(&Observed<'_>) -> Option<T>,
    ) -> CommResult<T> {
        let deadline = Instant::now() + budget;
        checkpoint()?;
        let mut state = self.shared.state.lock();
        loop {
            if state.stopped {
                return Err(CommError::SessionClosed);
            }
            if let Some(found) = probe(&Observed { state: &*state }) {
                return Ok(found);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CommError::Timeout(budget));
            }
            let wake = deadline.min(now + slice);
            self.shared.updated.wait_until(&mut state, wake);
            drop(state);
            checkpoint()?;
            state = self.shared.state.lock();
        }
    }

    /// Wait for a notification on `register`, newer than `after_seq`, whose
    /// value satisfies `predicate`.
    ///
    /// # Errors
    /// `CommError::Timeout(budget)` on expiry.
    pub fn wait_for_value(
        &self,
        register: MpsRegister,
        after_seq: u64,
        budget: Duration,
        predicate: impl Fn(RegisterValue) -> bool,
    ) -> CommResult<RegisterValue> {
        self.wait_for(
            budget,
            budget,
            || Ok(()),
            |obs| obs.fresh(register, after_seq).filter(|v| predicate(*v)),
        )
    }

    /// Stop the consumer thread. Waiters fail with `SessionClosed`.
    pub fn stop(&self) {
        let _ = self.tx.send(Message::Stop);
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
        self.shared.state.lock().stopped = true;
        self.shared.updated.notify_all();
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consume(shared: Arc<Shared>, rx: Receiver<Message>) {
    for message in rx {
        match message {
            Message::Notify {
                generation,
                register,
                value,
            } => apply(&shared, generation, register, value),
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
            Message::Stop => break,
        }
    }
    trace!(station = %shared.station, "Notification consumer stopped");
}

fn apply(shared: &Shared, generation: u64, register: MpsRegister, value: RegisterValue) {
    if !value.fits(register) {
        warn!(
            station = %shared.station,
            %register,
            ?value,
            "Dropping notification of wrong kind"
        );
        return;
    }

    let binding = {
        let mut state = shared.state.lock();
        if generation != state.generation {
            trace!(station = %shared.station, %register, generation, "Stale notification");
            return;
        }
        state.last_seq += 1;
        let seq = state.last_seq;
        let Some(entry) = state.entries.get_mut(&register) else {
            return;
        };
        if !entry.active {
            return;
        }
        entry.value = Some(value);
        entry.seq = seq;
        entry.updates += 1;
        entry.binding.clone()
    };
    shared.updated.notify_all();

    if let Some(slot) = &binding.slot {
        slot.set(value);
    }
    if let Some(callback) = &binding.callback {
        callback(register, value);
    }
}
