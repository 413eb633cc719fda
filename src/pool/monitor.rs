//! Health monitoring for a single logical connection
//!
//! The monitor owns the retry loop for one link (e.g. the cache/session
//! store): it consumes connect/disconnect/error signals in arrival order,
//! feeds each failure to the retry policy, and either redials after the
//! returned delay or raises a permanent-failure signal to the process
//! supervisor. It never terminates the process itself; that decision
//! belongs to the supervisor.

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::backoff::{ErrorClass, RetryDecision, RetryPolicy, RetryState};
use super::connection::ConnectionManager;

/// Lifecycle signal observed on a monitored link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The owner established (or confirmed) the connection
    Connected,

    /// The connection dropped without a classified error
    Disconnected,

    /// A connect/operate attempt failed
    Errored(ErrorClass),
}

/// Escalations delivered to the process supervisor
///
/// The supervisor, not the emitting component, decides whether the process
/// terminates (see the binary's exit contract).
#[derive(Debug, Clone)]
pub enum SupervisorSignal {
    /// An idle pool connection errored; the resource is likely unreachable
    /// for the whole pool
    PoolFatal { detail: String },

    /// A monitored link exhausted its retry budget or hit a terminal
    /// failure classification
    PermanentFailure {
        resource: &'static str,
        detail: String,
    },
}

/// Channel endpoints handed to the owner of the monitored link
pub struct MonitorHandle<M: ConnectionManager> {
    /// Report link lifecycle events here
    pub events: mpsc::UnboundedSender<LinkEvent>,

    /// Fresh connections arrive here after each successful (re)dial
    pub connections: mpsc::UnboundedReceiver<M::Connection>,
}

/// Watches one logical connection and drives reconnection
pub struct HealthMonitor<M: ConnectionManager> {
    resource: &'static str,
    manager: M,
    policy: RetryPolicy,
    state: RetryState,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    fresh: mpsc::UnboundedSender<M::Connection>,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
    shutdown: watch::Receiver<bool>,
}

impl<M: ConnectionManager> HealthMonitor<M> {
    pub fn new(
        resource: &'static str,
        manager: M,
        policy: RetryPolicy,
        signals: mpsc::UnboundedSender<SupervisorSignal>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, MonitorHandle<M>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (fresh_tx, fresh_rx) = mpsc::unbounded_channel();

        let monitor = Self {
            resource,
            manager,
            policy,
            state: RetryState::new(),
            events: event_rx,
            fresh: fresh_tx,
            signals,
            shutdown,
        };
        let handle = MonitorHandle {
            events: event_tx,
            connections: fresh_rx,
        };
        (monitor, handle)
    }

    /// Run until shutdown, the owner hangs up, or the link permanently fails
    ///
    /// Events are processed in arrival order by this single task, which is
    /// what keeps the streak counter correct.
    pub async fn run(mut self) {
        // Establish the link before watching for events.
        if !self.dial().await {
            return;
        }

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    None => break,
                    Some(LinkEvent::Connected) => {
                        self.state.reset();
                        info!(resource = self.resource, "link connected");
                    }
                    Some(LinkEvent::Disconnected) => {
                        if !self.recover(ErrorClass::Unknown).await {
                            return;
                        }
                    }
                    Some(LinkEvent::Errored(class)) => {
                        if !self.recover(class).await {
                            return;
                        }
                    }
                },
            }
        }
        debug!(resource = self.resource, "health monitor stopped");
    }

    /// First connect attempt; failures flow into the same recovery loop
    async fn dial(&mut self) -> bool {
        match self.manager.connect().await {
            Ok(conn) => {
                self.state.reset();
                info!(resource = self.resource, "link connected");
                let _ = self.fresh.send(conn);
                true
            }
            Err(err) => self.recover(err.classify()).await,
        }
    }

    /// Retry until reconnected or the policy gives up.
    /// Returns false when the monitor should stop.
    async fn recover(&mut self, first: ErrorClass) -> bool {
        let mut class = first;
        loop {
            let event = self.state.record(class);
            warn!(
                resource = self.resource,
                class = class.name(),
                streak = event.streak,
                elapsed_ms = event.elapsed.as_millis() as u64,
                "link failure"
            );

            match self.policy.decide(&event) {
                RetryDecision::GiveUp(reason) => {
                    error!(
                        resource = self.resource,
                        reason = reason.describe(),
                        streak = event.streak,
                        "giving up on link"
                    );
                    let _ = self.signals.send(SupervisorSignal::PermanentFailure {
                        resource: self.resource,
                        detail: format!("{} after {} attempt(s)", reason.describe(), event.streak),
                    });
                    return false;
                }
                RetryDecision::RetryAfter(delay) => {
                    debug!(
                        resource = self.resource,
                        delay_ms = delay.as_millis() as u64,
                        "scheduling reconnect"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        // Shutdown cancels the pending reconnect timer.
                        _ = self.shutdown.changed() => return false,
                    }
                }
                RetryDecision::ReconnectNow => {}
            }

            match self.manager.connect().await {
                Ok(conn) => {
                    self.state.reset();
                    // Events queued while recovering refer to the
                    // connection that already failed; drop them so each
                    // stale report does not trigger another redial.
                    while self.events.try_recv().is_ok() {}
                    info!(resource = self.resource, "link reconnected");
                    let _ = self.fresh.send(conn);
                    return true;
                }
                Err(err) => {
                    class = err.classify();
                }
            }
        }
    }
}
