//! Bounded connection pool for a primary resource
//!
//! This module provides a pool of live transport connections with:
//! - Semaphore-bounded acquisition with per-call timeouts
//! - LIFO reuse of idle connections
//! - Automatic reclamation of connections past their idle timeout
//! - Fatal escalation when an idle connection turns out to be broken
//!
//! Callers borrow a [`PooledConnection`] for the duration of one operation;
//! the handle returns the connection on every exit path, including panics
//! and early returns.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backoff::ErrorClass;
use super::monitor::SupervisorSignal;

/// Error while establishing or validating a single connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connection refused by {0}")]
    Refused(String),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Map onto the retry policy's failure taxonomy
    pub fn classify(&self) -> ErrorClass {
        match self {
            ConnectError::Refused(_) => ErrorClass::ConnectionRefused,
            ConnectError::Timeout(_) => ErrorClass::Timeout,
            ConnectError::Auth(_) => ErrorClass::AuthFailure,
            ConnectError::Io(_) => ErrorClass::Unknown,
        }
    }
}

/// Error types for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No connection became available within the caller's timeout.
    /// Recoverable: the caller may retry its request.
    #[error("timed out after {0:?} waiting for a pool connection")]
    AcquireTimeout(Duration),

    /// The pool has been shut down
    #[error("pool is shut down")]
    Closed,

    /// Establishing a fresh connection failed
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Lifecycle state of one pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    InUse,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::InUse => "in-use",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Opens and validates connections to one resource
///
/// The pool and the health monitor are both generic over this trait so the
/// same machinery serves databases, caches and brokers, and tests can drive
/// it with in-memory fakes.
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Establish a fresh connection
    async fn connect(&self) -> Result<Self::Connection, ConnectError>;

    /// Cheap liveness check for an idle connection
    ///
    /// An error here means the connection is broken while nobody was using
    /// it, which the pool escalates as fatal.
    async fn check(&self, conn: &mut Self::Connection) -> Result<(), ConnectError>;
}

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Maximum number of simultaneously open connections
    pub max_size: usize,

    /// Idle duration after which a connection is proactively closed
    pub idle_timeout: Duration,

    /// Timeout for establishing a fresh connection
    pub connect_timeout: Duration,

    /// Interval between housekeeping passes
    pub reap_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 20,
            idle_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Connections currently open (idle + in use)
    pub live: usize,

    /// Connections sitting in the idle set
    pub idle: usize,

    /// Connections currently borrowed by callers
    pub in_use: usize,

    /// Total connections created over the pool's lifetime
    pub total_created: u64,

    /// Total idle-connection reuses
    pub total_reused: u64,

    /// Total connections reclaimed by the idle timeout
    pub total_reclaimed: u64,
}

struct IdleConn<C> {
    id: u64,
    conn: C,
    idle_since: Instant,
}

struct PoolState<C> {
    idle: Vec<IdleConn<C>>,
    live: usize,
    /// Idle connections temporarily out of the set for validation
    validating: usize,
    next_id: u64,
    closed: bool,
    total_created: u64,
    total_reused: u64,
    total_reclaimed: u64,
}

impl<C> PoolState<C> {
    fn new() -> Self {
        Self {
            idle: Vec::new(),
            live: 0,
            validating: 0,
            next_id: 0,
            closed: false,
            total_created: 0,
            total_reused: 0,
            total_reclaimed: 0,
        }
    }
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    settings: PoolSettings,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<M::Connection>>,
    signals: mpsc::UnboundedSender<SupervisorSignal>,
}

/// Bounded connection pool
///
/// Acquisition waits on a semaphore sized to the pool bound, so the number
/// of simultaneously in-use connections can never exceed it. Bookkeeping is
/// a plain mutex; `release` (handle drop) never suspends.
pub struct Pool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl<M: ConnectionManager> Pool<M> {
    /// Create a pool and start its housekeeping task
    pub fn new(
        manager: M,
        settings: PoolSettings,
        signals: mpsc::UnboundedSender<SupervisorSignal>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(settings.max_size));
        let inner = Arc::new(PoolInner {
            manager,
            settings,
            semaphore,
            state: Mutex::new(PoolState::new()),
            signals,
        });

        let reaper = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.settings.reap_interval);
                // The first tick fires immediately; skip it.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    Self::housekeeping(&inner).await;
                }
            })
        };

        Self {
            inner,
            reaper: Mutex::new(Some(reaper)),
        }
    }

    /// Borrow a connection, waiting up to `timeout` for one to become
    /// available (an idle connection, or headroom to create a new one)
    ///
    /// `timeout` bounds only the wait for capacity. When the idle set is
    /// empty, establishing the fresh connection runs under the pool's
    /// `connect_timeout`, so total latency can reach
    /// `timeout + connect_timeout`; a slow connect fails with
    /// [`PoolError::Connect`], not [`PoolError::AcquireTimeout`].
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<M>, PoolError> {
        if self.lock_state().closed {
            return Err(PoolError::Closed);
        }

        // A timed-out waiter drops out of the semaphore queue here, so its
        // slot is immediately available to the next waiter.
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        {
            Err(_) => return Err(PoolError::AcquireTimeout(timeout)),
            Ok(Err(_)) => return Err(PoolError::Closed),
            Ok(Ok(permit)) => permit,
        };

        // Most recently returned connection first.
        let reused = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(PoolError::Closed);
            }
            let conn = state.idle.pop();
            if conn.is_some() {
                state.total_reused += 1;
            }
            conn
        };

        if let Some(idle) = reused {
            debug!(
                id = idle.id,
                idle_ms = idle.idle_since.elapsed().as_millis() as u64,
                "reusing idle connection"
            );
            return Ok(PooledConnection::new(
                Arc::clone(&self.inner),
                idle.id,
                idle.conn,
                permit,
            ));
        }

        // Idle set empty and the permit guarantees headroom: create one.
        let conn = match tokio::time::timeout(
            self.inner.settings.connect_timeout,
            self.inner.manager.connect(),
        )
        .await
        {
            Err(_) => {
                return Err(PoolError::Connect(ConnectError::Timeout(
                    self.inner.settings.connect_timeout,
                )))
            }
            Ok(Err(e)) => return Err(PoolError::Connect(e)),
            Ok(Ok(conn)) => conn,
        };

        let (id, live) = {
            let mut state = self.lock_state();
            state.next_id += 1;
            state.live += 1;
            state.total_created += 1;
            (state.next_id, state.live)
        };

        info!(id, live, "created new connection");
        Ok(PooledConnection::new(
            Arc::clone(&self.inner),
            id,
            conn,
            permit,
        ))
    }

    /// Run one housekeeping pass now (also runs periodically in the
    /// background): reclaim connections past the idle timeout, then
    /// validate the survivors
    pub async fn reap_now(&self) {
        Self::housekeeping(&self.inner).await;
    }

    async fn housekeeping(inner: &Arc<PoolInner<M>>) {
        // Phase 1: close connections past the idle timeout, in place under
        // the lock.
        {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            let now = Instant::now();
            let idle_timeout = inner.settings.idle_timeout;
            let before = state.idle.len();
            state
                .idle
                .retain(|conn| now.duration_since(conn.idle_since) < idle_timeout);
            let expired = before - state.idle.len();
            if expired > 0 {
                state.live -= expired;
                state.total_reclaimed += expired as u64;
                debug!(
                    removed = expired,
                    live = state.live,
                    "closed connections past their idle timeout"
                );
            }
        }

        // Phase 2: validate the survivors outside the lock. Every
        // connection taken out for validation keeps a semaphore permit, so
        // a concurrent acquire waits for the verdict instead of opening a
        // replacement and exceeding the pool bound. An error on a
        // connection nobody was using means the resource is likely
        // unreachable for the whole pool.
        let mut valid = Vec::new();
        let mut permits = Vec::new();
        let mut fatal: Option<ConnectError> = None;
        loop {
            let permit = match inner.semaphore.try_acquire() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let idle = {
                let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                let conn = state.idle.pop();
                if conn.is_some() {
                    state.validating += 1;
                }
                conn
            };
            let Some(mut idle) = idle else { break };

            match inner.manager.check(&mut idle.conn).await {
                Ok(()) => {
                    valid.push(idle);
                    permits.push(permit);
                }
                Err(err) => {
                    warn!(
                        id = idle.id,
                        error = %err,
                        state = ConnectionState::Closing.name(),
                        "idle connection failed validation"
                    );
                    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.live = state.live.saturating_sub(1);
                    state.validating -= 1;
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                }
            }
        }

        {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            state.validating -= valid.len();
            // Popped newest-first; reverse to restore the stack order.
            valid.reverse();
            state.idle.extend(valid);
        }
        drop(permits);

        if let Some(err) = fatal {
            error!(error = %err, "error on idle connection; escalating as fatal");
            let _ = inner.signals.send(SupervisorSignal::PoolFatal {
                detail: err.to_string(),
            });
        }
    }

    /// Scoped teardown: reject new acquisitions, wait up to `drain_timeout`
    /// for in-flight connections to come back, then close everything
    pub async fn shutdown(&self, drain_timeout: Duration) {
        {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        info!("pool shutting down");

        let all = self.inner.settings.max_size as u32;
        match tokio::time::timeout(drain_timeout, self.inner.semaphore.acquire_many(all)).await {
            Ok(Ok(_permit)) => {}
            Ok(Err(_)) => {}
            Err(_) => warn!(
                drain_ms = drain_timeout.as_millis() as u64,
                "drain timeout elapsed with connections still in use"
            ),
        }

        // Wake any remaining waiters with PoolError::Closed.
        self.inner.semaphore.close();

        let reclaimed = {
            let mut state = self.lock_state();
            let n = state.idle.len();
            state.idle.clear();
            state.live = state.live.saturating_sub(n);
            n
        };

        if let Some(handle) = self
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        info!(
            reclaimed,
            state = ConnectionState::Closed.name(),
            "pool shut down"
        );
    }

    /// Current pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            live: state.live,
            idle: state.idle.len(),
            in_use: state.live - state.idle.len() - state.validating,
            total_created: state.total_created,
            total_reused: state.total_reused,
            total_reclaimed: state.total_reclaimed,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState<M::Connection>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A connection borrowed from the pool
///
/// Dereferences to the underlying transport connection. Dropping the handle
/// returns the connection to the idle set (or closes it if the pool has shut
/// down) and frees the caller's slot; it never blocks.
pub struct PooledConnection<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
    id: u64,
    conn: Option<M::Connection>,
    _permit: OwnedSemaphorePermit,
}

impl<M: ConnectionManager> PooledConnection<M> {
    fn new(
        inner: Arc<PoolInner<M>>,
        id: u64,
        conn: M::Connection,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            inner,
            id,
            conn: Some(conn),
            _permit: permit,
        }
    }

    /// Pool-assigned identifier, stable across reuses
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::InUse
    }
}

impl<M: ConnectionManager> std::fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("state", &ConnectionState::InUse)
            .finish()
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            state.live = state.live.saturating_sub(1);
            debug!(
                id = self.id,
                state = ConnectionState::Closed.name(),
                "closing connection returned after shutdown"
            );
        } else {
            state.idle.push(IdleConn {
                id: self.id,
                conn,
                idle_since: Instant::now(),
            });
            debug!(
                id = self.id,
                state = ConnectionState::Idle.name(),
                "returned connection to idle set"
            );
        }
        // _permit drops after this, releasing the caller's slot.
    }
}

/// Raw TCP connection manager with keep-alive
///
/// Suits any stream-oriented resource (database, cache) where the protocol
/// layer lives above the pool.
pub struct TcpManager {
    addr: String,
    connect_timeout: Duration,
    keepalive: bool,
}

impl TcpManager {
    pub fn new(addr: String, connect_timeout: Duration) -> Self {
        Self {
            addr,
            connect_timeout,
            keepalive: true,
        }
    }

    pub fn without_keepalive(mut self) -> Self {
        self.keepalive = false;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl ConnectionManager for TcpManager {
    type Connection = TcpStream;

    async fn connect(&self) -> Result<TcpStream, ConnectError> {
        let stream = match tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect(&self.addr),
        )
        .await
        {
            Err(_) => return Err(ConnectError::Timeout(self.connect_timeout)),
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                return Err(ConnectError::Refused(self.addr.clone()))
            }
            Ok(Err(e)) => return Err(ConnectError::Io(e)),
            Ok(Ok(stream)) => stream,
        };

        if !self.keepalive {
            return Ok(stream);
        }

        let socket = socket2::Socket::from(stream.into_std()?);
        socket.set_keepalive(true)?;
        Ok(TcpStream::from_std(socket.into())?)
    }

    async fn check(&self, conn: &mut TcpStream) -> Result<(), ConnectError> {
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::from_millis(10), conn.peek(&mut probe)).await {
            // Nothing readable within the probe window: still open.
            Err(_) => Ok(()),
            Ok(Ok(0)) => Err(ConnectError::Io(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "remote closed idle connection",
            ))),
            // Unsolicited bytes waiting; the connection is alive.
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ConnectError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_settings_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.max_size, 20);
        assert_eq!(settings.idle_timeout, Duration::from_secs(30));
        assert_eq!(settings.connect_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_connect_error_classification() {
        assert_eq!(
            ConnectError::Refused("db:5432".into()).classify(),
            ErrorClass::ConnectionRefused
        );
        assert_eq!(
            ConnectError::Timeout(Duration::from_secs(2)).classify(),
            ErrorClass::Timeout
        );
        assert_eq!(
            ConnectError::Auth("bad password".into()).classify(),
            ErrorClass::AuthFailure
        );
        assert_eq!(
            ConnectError::Io(std::io::Error::new(ErrorKind::Other, "reset")).classify(),
            ErrorClass::Unknown
        );
    }

    #[test]
    fn test_connection_state_names() {
        assert_eq!(ConnectionState::Idle.name(), "idle");
        assert_eq!(ConnectionState::InUse.name(), "in-use");
        assert_eq!(ConnectionState::Closing.name(), "closing");
        assert_eq!(ConnectionState::Closed.name(), "closed");
    }
}
