//! respool - resource connection management for long-lived services
//!
//! Provides the pieces a service needs to hold onto remote resources for
//! the life of the process:
//!
//! - [`pool`]: a bounded connection pool, a retry/backoff policy engine,
//!   and a health monitor that supervises a single long-lived link
//! - [`config`]: per-environment configuration resolved from the process
//!   environment, validated before any connection is attempted
//! - [`services`]: payment-provider and object-storage collaborators
//! - [`core`]: the composition root tying the above together, with a
//!   supervisor channel for unrecoverable failures

pub mod config;
pub mod core;
pub mod pool;
pub mod services;

pub use crate::config::{ConfigError, Environment, ResourceConfig};
pub use crate::core::{Core, Supervisor};
pub use crate::pool::{Pool, PoolError, RetryPolicy, SupervisorSignal};
