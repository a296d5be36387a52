//! Connection session.
//!
//! One session per machine. It owns the transport and the lifecycle:
//!
//! ```text
//! Disconnected → Connecting → Connected → Subscribing → Ready
//!       ▲             │           │            │          │
//!       └─────────────┴───────────┴────────────┴──────────┘  (failure / disconnect)
//! ```
//!
//! Register-polling links have no subscribe step and go `Connected → Ready`
//! directly. Every successful connect bumps the session generation; work tied
//! to an older generation is stale. `connect()` never retries internally.

use crate::subscription::NotificationSink;
use crate::transport::Transport;
use mps_common::error::{CommError, CommResult};
use mps_common::register::{MpsRegister, RegisterValue};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No link.
    Disconnected,
    /// Transport open in progress.
    Connecting,
    /// Transport up, subscriptions not yet installed.
    Connected,
    /// Installing subscriptions.
    Subscribing,
    /// Accepting instructions.
    Ready,
}

impl SessionState {
    /// True if register reads and writes are allowed.
    pub const fn is_linked(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Subscribing | SessionState::Ready
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Subscribing => "subscribing",
            SessionState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// Event driving a session transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// `connect()` called.
    ConnectRequested,
    /// Transport opened.
    TransportUp,
    /// Transport open failed.
    TransportFailed,
    /// Subscription install started.
    SubscribeStarted,
    /// All mandatory registers subscribed (or no subscribe step needed).
    SubscriptionsComplete,
    /// Explicit teardown.
    Disconnect,
}

/// Result of a transition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition succeeded, new state.
    Ok(SessionState),
    /// Transition rejected.
    Rejected(&'static str),
}

/// Transition table of the session lifecycle.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl SessionStateMachine {
    /// Start in `Disconnected`.
    pub const fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
        }
    }

    /// Current state.
    #[inline]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Attempt a transition given an event.
    pub fn handle_event(&mut self, event: SessionEvent) -> TransitionResult {
        use SessionEvent::*;
        use SessionState::*;

        let next = match (self.state, event) {
            (Disconnected, ConnectRequested) => Connecting,
            (Connecting, TransportUp) => Connected,
            (Connecting, TransportFailed) => Disconnected,
            (Connected, SubscribeStarted) => Subscribing,
            (Subscribing, SubscriptionsComplete) => Ready,
            // Polling links: readiness is transport connect.
            (Connected, SubscriptionsComplete) => Ready,
            (Subscribing, TransportFailed) => Disconnected,
            (Ready, TransportFailed) | (Connected, TransportFailed) => Disconnected,
            (_, Disconnect) => Disconnected,
            _ => return TransitionResult::Rejected(invalid_transition_reason(self.state, event)),
        };

        self.state = next;
        TransitionResult::Ok(next)
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_transition_reason(state: SessionState, event: SessionEvent) -> &'static str {
    use SessionEvent::*;
    match (state, event) {
        (_, ConnectRequested) => "connect requested while session is not disconnected",
        (_, TransportUp) | (_, TransportFailed) => "transport result outside of a connect attempt",
        (_, SubscribeStarted) => "subscribe requires a connected session",
        (_, SubscriptionsComplete) => "no subscribe step in progress",
        (_, Disconnect) => "disconnect rejected",
    }
}

struct SessionInner {
    machine: SessionStateMachine,
    generation: u64,
}

/// Live or attempted link to one station.
pub struct Session {
    station: String,
    endpoint: String,
    polling: bool,
    inner: Mutex<SessionInner>,
    changed: Condvar,
    transport: Mutex<Box<dyn Transport>>,
}

impl Session {
    /// Create a disconnected session over `transport`.
    ///
    /// `polling` sessions become `Ready` as soon as the transport is up.
    pub fn new(
        station: impl Into<String>,
        endpoint: impl Into<String>,
        transport: Box<dyn Transport>,
        polling: bool,
    ) -> Self {
        Self {
            station: station.into(),
            endpoint: endpoint.into(),
            polling,
            inner: Mutex::new(SessionInner {
                machine: SessionStateMachine::new(),
                generation: 0,
            }),
            changed: Condvar::new(),
            transport: Mutex::new(transport),
        }
    }

    /// Station name.
    pub fn station(&self) -> &str {
        &self.station
    }

    /// `host:port` of the controller.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// True for register-polling links without a subscribe step.
    pub fn is_polling(&self) -> bool {
        self.polling
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().machine.state()
    }

    /// Generation of the current (or last) link. Zero before the first connect.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// True in `Ready`.
    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// True if notifications are delivered by the transport. Polling
    /// sessions never install monitored items.
    pub fn supports_monitoring(&self) -> bool {
        !self.polling && self.transport.lock().supports_monitoring()
    }

    fn transition(&self, event: SessionEvent) -> CommResult<SessionState> {
        let mut inner = self.inner.lock();
        let from = inner.machine.state();
        match inner.machine.handle_event(event) {
            TransitionResult::Ok(to) => {
                if event == SessionEvent::TransportUp {
                    inner.generation += 1;
                }
                if from != to {
                    debug!(station = %self.station, %from, %to, ?event, "Session transition");
                    self.changed.notify_all();
                }
                Ok(to)
            }
            TransitionResult::Rejected(reason) => Err(CommError::transport(format!(
                "{}: {reason} (state {from}, event {event:?})",
                self.station
            ))),
        }
    }

    /// Open the transport: `Disconnected → Connecting → Connected` (or
    /// `→ Ready` for polling links).
    ///
    /// # Errors
    /// Surfaces the transport error and leaves the session `Disconnected`.
    /// Returns `CommError::SessionClosed` if the session was torn down while
    /// the transport was opening.
    pub fn connect(&self) -> CommResult<()> {
        self.transition(SessionEvent::ConnectRequested)?;
        info!(station = %self.station, endpoint = %self.endpoint, "Connecting");

        let mut transport = self.transport.lock();
        if let Err(e) = transport.open() {
            transport.close();
            drop(transport);
            let _ = self.transition(SessionEvent::TransportFailed);
            warn!(station = %self.station, error = %e, "Connect failed");
            return Err(e);
        }

        if self.transition(SessionEvent::TransportUp).is_err() {
            transport.close();
            return Err(CommError::SessionClosed);
        }
        drop(transport);

        if self.polling {
            self.transition(SessionEvent::SubscriptionsComplete)?;
        }
        info!(station = %self.station, generation = self.generation(), "Connected");
        Ok(())
    }

    /// Tear the link down. Idempotent; always safe to call.
    pub fn disconnect(&self) {
        let was = self.state();
        let _ = self.transition(SessionEvent::Disconnect);
        self.transport.lock().close();
        if was != SessionState::Disconnected {
            info!(station = %self.station, "Disconnected");
        }
    }

    /// `Connected → Subscribing`.
    ///
    /// # Errors
    /// Returns `CommError::Transport` unless the session is `Connected`.
    pub fn begin_subscribing(&self) -> CommResult<()> {
        self.transition(SessionEvent::SubscribeStarted).map(|_| ())
    }

    /// `Subscribing → Ready`.
    ///
    /// # Errors
    /// Returns `CommError::Transport` if no subscribe step is in progress.
    pub fn mark_ready(&self) -> CommResult<()> {
        self.transition(SessionEvent::SubscriptionsComplete)?;
        info!(station = %self.station, generation = self.generation(), "Session ready");
        Ok(())
    }

    /// Block until the session is `Ready` or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.machine.state() != SessionState::Ready {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.machine.state() == SessionState::Ready;
            }
        }
        true
    }

    fn ensure_linked(&self) -> CommResult<()> {
        let state = self.state();
        if state.is_linked() {
            Ok(())
        } else {
            Err(CommError::transport(format!(
                "{}: session {state}",
                self.station
            )))
        }
    }

    /// Read one register.
    ///
    /// # Errors
    /// `CommError::Transport` unless linked or on I/O failure,
    /// `CommError::ProtocolViolation` if the value has the wrong kind.
    pub fn read(&self, register: MpsRegister) -> CommResult<RegisterValue> {
        self.ensure_linked()?;
        let value = self.transport.lock().read(register)?;
        if !value.fits(register) {
            return Err(CommError::ProtocolViolation {
                register,
                expected: register.kind(),
                actual: format!("{value:?}"),
            });
        }
        Ok(value)
    }

    /// Write one register.
    ///
    /// # Errors
    /// `CommError::Transport` unless linked or on I/O failure,
    /// `CommError::ProtocolViolation` if `value` has the wrong kind.
    pub fn write(&self, register: MpsRegister, value: RegisterValue) -> CommResult<()> {
        if !value.fits(register) {
            return Err(CommError::ProtocolViolation {
                register,
                expected: register.kind(),
                actual: format!("{value:?}"),
            });
        }
        self.ensure_linked()?;
        self.transport.lock().write(register, value)
    }

    /// Install a monitored item for `register`.
    ///
    /// # Errors
    /// `CommError::Transport` unless linked, `CommError::Unsupported` on
    /// polling transports.
    pub fn monitor(&self, register: MpsRegister, sink: NotificationSink) -> CommResult<()> {
        self.ensure_linked()?;
        self.transport.lock().monitor(register, sink)
    }

    /// Remove the monitored item for `register`.
    pub fn unmonitor(&self, register: MpsRegister) {
        if self.state().is_linked() {
            self.transport.lock().unmonitor(register);
        }
    }

    /// Liveness check: read the heartbeat register.
    ///
    /// # Errors
    /// Whatever [`Session::read`] returns.
    pub fn ping(&self) -> CommResult<()> {
        self.read(MpsRegister::Heartbeat).map(|_| ())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("station", &self.station)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}
