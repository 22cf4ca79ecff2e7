//! Circuit breaker guarding Phase-A deliveries.
//!
//! One instance guards all sends. Closed until a run of consecutive
//! failures trips it open; open blocks calls for a cooldown window; then a
//! limited number of half-open probes decide whether to close again.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

/// Breaker tuning
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker open
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// How long the breaker stays open before allowing probes
    pub open_timeout: Duration,
    /// Maximum probe calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time breaker state for metrics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub half_open_calls: u32,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
}

/// Thread-safe circuit breaker with its own lock
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_calls: 0,
                opened_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Ask permission to make a call. `Err(())` means the call must be
    /// rejected without reaching the executor.
    pub fn try_acquire(&self) -> Result<(), ()> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_timeout);
                if cooled_down {
                    info!("Circuit breaker half-open, admitting probes");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_calls = 1;
                    Ok(())
                } else {
                    Err(())
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    Err(())
                } else {
                    inner.half_open_calls += 1;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    info!("Circuit breaker closed after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_calls = 0;
                    inner.opened_at = None;
                }
            }
            _ => inner.consecutive_failures = 0,
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.opened_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        "Circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit breaker reopened after failed probe");
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                inner.half_open_calls = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_calls: inner.half_open_calls,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_millis(20),
            half_open_max_calls: 3,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = fast_breaker();
        for _ in 0..4 {
            breaker.try_acquire().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_success_resets_failure_run() {
        let breaker = fast_breaker();
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..4 {
            breaker.record_failure();
        }
        // Never reached 5 consecutive, still closed
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_flow() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert!(breaker.try_acquire().is_err());

        std::thread::sleep(Duration::from_millis(30));

        // First acquire after cooldown admits a probe
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.snapshot().state, CircuitState::HalfOpen);
        breaker.record_success();
        breaker.try_acquire().unwrap();
        breaker.record_success();
        breaker.try_acquire().unwrap();
        breaker.record_success();
        assert_eq!(breaker.snapshot().state, CircuitState::Closed);
    }

    #[test]
    fn test_half_open_call_cap() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));

        breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap();
        breaker.try_acquire().unwrap();
        // Cap of 3 probes, no results recorded yet
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = fast_breaker();
        for _ in 0..5 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(30));

        breaker.try_acquire().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }
}
