//! Circuit breaker for the critic API
//!
//! After `threshold` consecutive failures the breaker opens and calls are
//! refused until `cooldown` has passed; then one probe is let through
//! (half-open). A success closes it again.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut BreakerState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn state(&self) -> CircuitState {
        self.with_state(|s| {
            if s.failures < self.threshold {
                return CircuitState::Closed;
            }
            match s.last_failure {
                Some(at) if at.elapsed() < self.cooldown => CircuitState::Open,
                _ => CircuitState::HalfOpen,
            }
        })
    }

    pub fn can_execute(&self) -> bool {
        self.state() != CircuitState::Open
    }

    pub fn record_success(&self) {
        self.with_state(|s| {
            s.failures = 0;
            s.last_failure = None;
        });
    }

    pub fn record_failure(&self) {
        self.with_state(|s| {
            s.failures = s.failures.saturating_add(1);
            s.last_failure = Some(Instant::now());
        });
    }

    pub fn failure_count(&self) -> u32 {
        self.with_state(|s| s.failures)
    }

    /// Remaining cooldown while open, zero otherwise
    pub fn time_until_retry(&self) -> Duration {
        self.with_state(|s| match s.last_failure {
            Some(at) if s.failures >= self.threshold => self.cooldown.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        })
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}
