//! # MPS Communication Library
//!
//! Machine control engine for MPS stations. High-level actuation requests
//! (lights, conveyor, reset, station jobs) become correctly sequenced
//! register operations on a station controller, while a heartbeat keeps the
//! link alive and notifications keep the station state current.
//!
//! # Module Structure
//!
//! - [`transport`] - Protocol seam and transports (simulated station, Modbus/TCP)
//! - [`session`] - Connection lifecycle state machine
//! - [`subscription`] - Subscriptions, cached values and the notification consumer
//! - [`dispatcher`] - FIFO instruction queue and worker
//! - [`heartbeat`] - Liveness supervisor and session rebuild
//! - [`machine`] - Capability traits shared by all stations
//! - [`backend`] - Pub/sub and polling machines
//! - [`registry`] - Backend factories
//! - [`fleet`] - Machines keyed by station name
//! - [`snapshot`] - Read-only machine views
//! - [`event_log`] - Event sink for final values and failed instructions
//!
//! # Architecture
//!
//! ```text
//! caller ──► Machine ──► Dispatcher (FIFO) ──► Session ──► Transport
//!                             ▲                   ▲            │
//!                    wait_for │                   │ rebuild    │ notifications
//!                             │                   │            ▼
//!                   SubscriptionRegistry     Heartbeat    NotificationSink
//!                             ▲                                │
//!                             └────────── consumer thread ◄────┘
//! ```

#![deny(missing_docs)]

pub mod backend;
pub mod dispatcher;
pub mod event_log;
pub mod fleet;
pub mod heartbeat;
pub mod machine;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod subscription;
pub mod transport;

// Re-export key types for convenience
pub use crate::backend::{BackendContext, PollingMachine, PubSubMachine};
pub use crate::dispatcher::{Dispatcher, InstructionHandle};
pub use crate::event_log::{EventLog, TracingEventLog};
pub use crate::fleet::Fleet;
pub use crate::heartbeat::{HeartbeatStats, HeartbeatSupervisor};
pub use crate::machine::{Machine, StationCommands};
pub use crate::registry::BackendRegistry;
pub use crate::session::{Session, SessionState};
pub use crate::snapshot::MachineSnapshot;
pub use crate::subscription::{SubscriptionRegistry, ValueSlot};

static_assertions::assert_impl_all!(PubSubMachine: Send, Sync);
static_assertions::assert_impl_all!(PollingMachine: Send, Sync);
static_assertions::assert_impl_all!(Fleet: Send, Sync);
