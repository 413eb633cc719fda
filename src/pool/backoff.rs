//! Retry/backoff policy for reconnecting to a remote resource
//!
//! The policy is a pure decision function: callers keep an explicit
//! [`RetryState`] (failure streak + elapsed retry time), turn each failure
//! into a [`FailureEvent`], and ask the policy what to do next. No hidden
//! state, no I/O, safe to call from any thread.
//!
//! # Backoff schedule (defaults)
//!
//! | Streak | Delay          |
//! |--------|----------------|
//! | 1      | 100ms          |
//! | 2      | 200ms          |
//! | ...    | streak * 100ms |
//! | 30+    | 3000ms (cap)   |
//!
//! The policy gives up once the cumulative retry window (default 1 hour) or
//! the attempt ceiling (default 10) is exceeded. A successful connect resets
//! the streak and the elapsed accumulator via [`RetryState::reset`].

use serde::Serialize;
use std::time::{Duration, Instant};

/// Classification of a failed connect/operate attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Remote actively refused the connection - it is not listening
    ConnectionRefused,

    /// Attempt did not complete within the connect timeout
    Timeout,

    /// Remote rejected our credentials
    AuthFailure,

    /// Anything else (DNS, resets mid-handshake, ...)
    Unknown,
}

impl ErrorClass {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorClass::ConnectionRefused => "connection-refused",
            ErrorClass::Timeout => "timeout",
            ErrorClass::AuthFailure => "auth-failure",
            ErrorClass::Unknown => "unknown",
        }
    }
}

/// One failed attempt, as seen by the policy engine
///
/// Transient: produced by the health monitor on every failure, consumed by
/// [`RetryPolicy::decide`], not persisted.
#[derive(Debug, Clone, Copy)]
pub struct FailureEvent {
    /// When the failure was observed
    pub at: Instant,

    /// What kind of failure it was
    pub class: ErrorClass,

    /// Consecutive failures since the last success, this one included (>= 1)
    pub streak: u32,

    /// Cumulative time spent retrying since the last success
    pub elapsed: Duration,
}

/// Why the policy decided to stop retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The remote is refusing connections; operator intervention required
    RemoteRefusing,

    /// Credentials were rejected; retrying cannot help
    AuthRejected,

    /// Attempt ceiling or cumulative retry window exceeded
    RetryBudgetExhausted,
}

impl GiveUpReason {
    pub fn describe(&self) -> &'static str {
        match self {
            GiveUpReason::RemoteRefusing => "remote refused the connection",
            GiveUpReason::AuthRejected => "authentication rejected",
            GiveUpReason::RetryBudgetExhausted => "retry budget exhausted",
        }
    }
}

/// What to do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then attempt a reconnect
    RetryAfter(Duration),

    /// Reconnect immediately (computed delay was zero)
    ReconnectNow,

    /// Stop retrying and raise a permanent-failure signal
    GiveUp(GiveUpReason),
}

/// Configuration for retry behavior
#[derive(Debug, Clone, Serialize)]
pub struct RetryPolicy {
    /// Delay unit; attempt n waits n * base_unit
    pub base_unit: Duration,

    /// Per-attempt delay cap
    pub max_delay: Duration,

    /// Cumulative retry window; exceeding it gives up
    pub max_elapsed: Duration,

    /// Attempt ceiling; a streak beyond it gives up
    pub max_attempts: u32,

    /// Treat connection-refused as transient instead of terminal
    pub retry_refused: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_unit: Duration::from_millis(100),
            max_delay: Duration::from_millis(3000),
            max_elapsed: Duration::from_secs(3600),
            max_attempts: 10,
            retry_refused: false,
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after a failure
    ///
    /// Pure and deterministic: the same event always yields the same
    /// decision. Terminal classifications (refused unless `retry_refused`,
    /// auth failures) short-circuit before the budget checks.
    pub fn decide(&self, event: &FailureEvent) -> RetryDecision {
        match event.class {
            ErrorClass::ConnectionRefused if !self.retry_refused => {
                return RetryDecision::GiveUp(GiveUpReason::RemoteRefusing);
            }
            ErrorClass::AuthFailure => {
                return RetryDecision::GiveUp(GiveUpReason::AuthRejected);
            }
            _ => {}
        }

        if event.elapsed > self.max_elapsed || event.streak > self.max_attempts {
            return RetryDecision::GiveUp(GiveUpReason::RetryBudgetExhausted);
        }

        let delay = self
            .base_unit
            .saturating_mul(event.streak)
            .min(self.max_delay);

        if delay.is_zero() {
            RetryDecision::ReconnectNow
        } else {
            RetryDecision::RetryAfter(delay)
        }
    }
}

/// Caller-owned failure streak tracking
///
/// The monitor records each failure here and resets on success; the policy
/// itself stays stateless.
#[derive(Debug, Default)]
pub struct RetryState {
    streak: u32,
    retrying_since: Option<Instant>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure, producing the event to feed the policy
    pub fn record(&mut self, class: ErrorClass) -> FailureEvent {
        let now = Instant::now();
        let since = *self.retrying_since.get_or_insert(now);
        self.streak += 1;

        FailureEvent {
            at: now,
            class,
            streak: self.streak,
            elapsed: now.duration_since(since),
        }
    }

    /// Reset after a successful connect
    pub fn reset(&mut self) {
        self.streak = 0;
        self.retrying_since = None;
    }

    /// Consecutive failures since the last success
    pub fn streak(&self) -> u32 {
        self.streak
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(class: ErrorClass, streak: u32, elapsed: Duration) -> FailureEvent {
        FailureEvent {
            at: Instant::now(),
            class,
            streak,
            elapsed,
        }
    }

    fn delay_of(decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::RetryAfter(d) => d,
            RetryDecision::ReconnectNow => Duration::ZERO,
            RetryDecision::GiveUp(reason) => panic!("unexpected give-up: {:?}", reason),
        }
    }

    #[test]
    fn test_delay_linear_then_capped() {
        let policy = RetryPolicy::default();

        let mut previous = Duration::ZERO;
        for streak in 1..=10 {
            let d = delay_of(policy.decide(&event(ErrorClass::Timeout, streak, Duration::ZERO)));
            assert!(d >= previous, "delay must be non-decreasing");
            assert!(d <= policy.max_delay, "delay must respect the cap");
            previous = d;
        }

        assert_eq!(
            delay_of(policy.decide(&event(ErrorClass::Timeout, 3, Duration::ZERO))),
            Duration::from_millis(300)
        );

        // With the default unit the attempt ceiling fires before the cap
        // does; verify the cap with a coarser unit.
        let coarse = RetryPolicy {
            base_unit: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };
        assert_eq!(
            delay_of(coarse.decide(&event(ErrorClass::Timeout, 5, Duration::ZERO))),
            Duration::from_millis(3000)
        );
    }

    #[test]
    fn test_give_up_on_attempt_ceiling() {
        let policy = RetryPolicy::default();

        // Streak 10 is still retried; streak 11 is not.
        assert!(matches!(
            policy.decide(&event(ErrorClass::Timeout, 10, Duration::ZERO)),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            policy.decide(&event(ErrorClass::Timeout, 11, Duration::ZERO)),
            RetryDecision::GiveUp(GiveUpReason::RetryBudgetExhausted)
        );
    }

    #[test]
    fn test_give_up_on_elapsed_window() {
        let policy = RetryPolicy::default();

        assert!(matches!(
            policy.decide(&event(ErrorClass::Timeout, 1, policy.max_elapsed)),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            policy.decide(&event(
                ErrorClass::Timeout,
                1,
                policy.max_elapsed + Duration::from_secs(1)
            )),
            RetryDecision::GiveUp(GiveUpReason::RetryBudgetExhausted)
        );
    }

    #[test]
    fn test_refused_is_terminal_by_default() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&event(ErrorClass::ConnectionRefused, 1, Duration::ZERO)),
            RetryDecision::GiveUp(GiveUpReason::RemoteRefusing)
        );
    }

    #[test]
    fn test_auth_failure_is_terminal() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(&event(ErrorClass::AuthFailure, 1, Duration::ZERO)),
            RetryDecision::GiveUp(GiveUpReason::AuthRejected)
        );
    }

    #[test]
    fn test_refused_streak_with_retry_enabled() {
        // Three refused failures followed by a success: streaks [1,2,3,0],
        // delays [base, 2*base, 3*base].
        let policy = RetryPolicy {
            retry_refused: true,
            ..RetryPolicy::default()
        };
        let mut state = RetryState::new();

        let mut streaks = Vec::new();
        let mut delays = Vec::new();
        for _ in 0..3 {
            let ev = state.record(ErrorClass::ConnectionRefused);
            streaks.push(ev.streak);
            delays.push(delay_of(policy.decide(&ev)));
        }
        state.reset();
        streaks.push(state.streak());

        assert_eq!(streaks, vec![1, 2, 3, 0]);
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn test_reset_restarts_the_schedule() {
        let policy = RetryPolicy::default();
        let mut state = RetryState::new();

        for _ in 0..5 {
            state.record(ErrorClass::Timeout);
        }
        state.reset();

        let ev = state.record(ErrorClass::Timeout);
        assert_eq!(ev.streak, 1);
        assert_eq!(delay_of(policy.decide(&ev)), policy.base_unit);
    }

    #[test]
    fn test_zero_base_unit_reconnects_immediately() {
        let policy = RetryPolicy {
            base_unit: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(
            policy.decide(&event(ErrorClass::Unknown, 1, Duration::ZERO)),
            RetryDecision::ReconnectNow
        );
    }
}
