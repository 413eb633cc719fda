//! Connection lifecycle management
//!
//! This module provides:
//! - A bounded connection pool with idle-timeout reclamation
//! - A pure retry/backoff policy engine
//! - A health monitor that drives reconnection for a single link
//! - Supervisor signalling for unrecoverable failures

pub mod backoff;
pub mod connection;
pub mod monitor;

pub use backoff::{
    ErrorClass, FailureEvent, GiveUpReason, RetryDecision, RetryPolicy, RetryState,
};
pub use connection::{
    ConnectError, ConnectionManager, ConnectionState, Pool, PoolError, PoolSettings, PoolStats,
    PooledConnection, TcpManager,
};
pub use monitor::{HealthMonitor, LinkEvent, MonitorHandle, SupervisorSignal};
