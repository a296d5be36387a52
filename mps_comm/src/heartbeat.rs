//! Heartbeat supervisor.
//!
//! Periodic liveness check of one machine's link. Each tick either pings the
//! session or, when the link is down, tries a full rebuild. After
//! `threshold` consecutive ping failures the link is rebuilt: subscriptions
//! cancelled (and logged), transport disconnected, reconnected and
//! resubscribed. The supervisor never touches instructions; the dispatcher
//! notices the generation change on its own.

use mps_common::error::CommResult;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Link operations the supervisor drives.
pub trait LinkSupervised: Send + Sync {
    /// True if the link is established (pub/sub: `Ready`).
    fn is_up(&self) -> bool;

    /// Liveness probe.
    fn ping(&self) -> CommResult<()>;

    /// Tear the link down and build it again.
    fn rebuild(&self) -> CommResult<()>;
}

/// Supervisor counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeartbeatStats {
    /// Ticks run.
    pub ticks: u64,
    /// Failed pings and failed rebuilds.
    pub failures: u64,
    /// Current run of failed pings.
    pub consecutive_failures: u32,
    /// Successful rebuilds.
    pub rebuilds: u64,
    /// Last error seen, if any.
    pub last_error: Option<String>,
}

struct Shared {
    station: String,
    link: Arc<dyn LinkSupervised>,
    interval: Duration,
    threshold: u32,
    stats: Mutex<HeartbeatStats>,
    stop: Mutex<bool>,
    stopped: Condvar,
}

/// Liveness supervisor with its own thread.
pub struct HeartbeatSupervisor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatSupervisor {
    /// Build a supervisor without starting its thread. `threshold` is
    /// clamped to at least one failure.
    pub fn new(
        station: impl Into<String>,
        link: Arc<dyn LinkSupervised>,
        interval: Duration,
        threshold: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                station: station.into(),
                link,
                interval,
                threshold: threshold.max(1),
                stats: Mutex::new(HeartbeatStats::default()),
                stop: Mutex::new(false),
                stopped: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the periodic thread. Calling it twice has no effect.
    ///
    /// # Errors
    /// Returns `CommError::Transport` if the thread cannot be spawned.
    pub fn start(&self) -> CommResult<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        *self.shared.stop.lock() = false;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("mps-heartbeat-{}", self.shared.station))
            .spawn(move || shared.run())?;
        *thread = Some(handle);
        info!(
            station = %self.shared.station,
            interval_ms = self.shared.interval.as_millis() as u64,
            threshold = self.shared.threshold,
            "Heartbeat started"
        );
        Ok(())
    }

    /// Run one supervision step in the calling thread.
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Consecutive-failure threshold.
    pub fn threshold(&self) -> u32 {
        self.shared.threshold
    }

    /// Counter snapshot.
    pub fn stats(&self) -> HeartbeatStats {
        self.shared.stats.lock().clone()
    }

    /// Stop the thread promptly and join it. Idempotent.
    pub fn stop(&self) {
        {
            let mut stop = self.shared.stop.lock();
            *stop = true;
            self.shared.stopped.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
            info!(station = %self.shared.station, "Heartbeat stopped");
        }
    }
}

impl Drop for HeartbeatSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn run(&self) {
        let mut next = Instant::now() + self.interval;
        loop {
            {
                let mut stop = self.stop.lock();
                while !*stop {
                    if self.stopped.wait_until(&mut stop, next).timed_out() {
                        break;
                    }
                }
                if *stop {
                    break;
                }
            }
            self.tick();
            next = Instant::now() + self.interval;
        }
    }

    fn tick(&self) {
        self.stats.lock().ticks += 1;

        if !self.link.is_up() {
            debug!(station = %self.station, "Link down, rebuilding");
            self.rebuild();
            return;
        }

        match self.link.ping() {
            Ok(()) => {
                self.stats.lock().consecutive_failures = 0;
            }
            Err(e) => {
                let consecutive = {
                    let mut stats = self.stats.lock();
                    stats.failures += 1;
                    stats.consecutive_failures += 1;
                    stats.last_error = Some(e.to_string());
                    stats.consecutive_failures
                };
                warn!(
                    station = %self.station,
                    error = %e,
                    consecutive,
                    "Heartbeat failed"
                );
                if consecutive >= self.threshold {
                    self.rebuild();
                }
            }
        }
    }

    fn rebuild(&self) {
        match self.link.rebuild() {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.rebuilds += 1;
                stats.consecutive_failures = 0;
                info!(station = %self.station, rebuilds = stats.rebuilds, "Link rebuilt");
            }
            Err(e) => {
                let mut stats = self.stats.lock();
                stats.failures += 1;
                stats.last_error = Some(e.to_string());
                debug!(station = %self.station, error = %e, "Rebuild failed");
            }
        }
    }
}
