use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Time source for breaker cooldowns.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self { origin: Instant::now(), offset: Mutex::new(Duration::ZERO) }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        match self.offset.lock() {
            Ok(mut offset) => *offset += by,
            Err(poisoned) => *poisoned.into_inner() += by,
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = match self.offset.lock() {
            Ok(offset) => *offset,
            Err(poisoned) => *poisoned.into_inner(),
        };
        self.origin + offset
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(60) }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    probe_granted_at: Option<Instant>,
}

/// Per-endpoint failure gate. CLOSED lets calls through, OPEN rejects them until the
/// recovery timeout has elapsed, after which exactly one HALF_OPEN trial is granted.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                last_failure_time: None,
                probe_granted_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    /// Whether a call may go out now. Moves OPEN to HALF_OPEN once the cooldown has
    /// elapsed and hands out the single trial permit.
    pub fn can_execute(&self) -> bool {
        let now = self.clock.now();
        self.with_state(|inner| match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at) >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_granted_at = Some(now);
                    info!(
                        event_name = "resilience.circuit.half_open",
                        api_name = %self.name,
                        "circuit breaker granted trial call"
                    );
                }
                cooled_down
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back would otherwise wedge the breaker.
                let stale = inner
                    .probe_granted_at
                    .map(|at| now.saturating_duration_since(at) >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if stale {
                    inner.probe_granted_at = Some(now);
                }
                stale
            }
        })
    }

    pub fn record_success(&self) {
        self.with_state(|inner| match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.probe_granted_at = None;
                info!(
                    event_name = "resilience.circuit.closed",
                    api_name = %self.name,
                    "circuit breaker closed after successful trial"
                );
            }
            CircuitState::Open => {}
        });
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        self.with_state(|inner| {
            inner.failure_count = inner.failure_count.saturating_add(1);
            inner.last_failure_at = Some(now);
            inner.last_failure_time = Some(Utc::now());

            match inner.state {
                CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                    inner.state = CircuitState::Open;
                    warn!(
                        event_name = "resilience.circuit.opened",
                        api_name = %self.name,
                        failure_count = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
                CircuitState::HalfOpen => {
                    inner.state = CircuitState::Open;
                    inner.probe_granted_at = None;
                    warn!(
                        event_name = "resilience.circuit.reopened",
                        api_name = %self.name,
                        "circuit breaker trial failed"
                    );
                }
                _ => {}
            }
        });
    }

    pub fn state(&self) -> CircuitState {
        self.with_state(|inner| inner.state)
    }

    pub fn failure_count(&self) -> u32 {
        self.with_state(|inner| inner.failure_count)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        self.with_state(|inner| CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_time,
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BreakerState) -> T) -> T {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ManualClock};

    fn breaker(threshold: u32, cooldown_secs: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let breaker = CircuitBreaker::with_clock(
            "credit_bureau",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(cooldown_secs),
            },
            clock.clone(),
        );
        (breaker, clock)
    }

    #[test]
    fn starts_closed() {
        let (breaker, _) = breaker(3, 60);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_execute());
    }

    #[test]
    fn opens_exactly_at_threshold() {
        for threshold in 1..=6 {
            let (breaker, _) = breaker(threshold, 60);
            for _ in 0..threshold - 1 {
                breaker.record_failure();
                assert!(breaker.can_execute(), "below threshold {threshold} stays closed");
            }
            breaker.record_failure();
            assert!(!breaker.can_execute(), "threshold {threshold} reached should open");
            assert_eq!(breaker.state(), CircuitState::Open);
        }
    }

    #[test]
    fn stays_open_until_recovery_timeout() {
        let (breaker, clock) = breaker(2, 60);
        breaker.record_failure();
        breaker.record_failure();

        clock.advance(Duration::from_secs(59));
        assert!(!breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn grants_single_trial_regardless_of_checks_while_open() {
        let (breaker, clock) = breaker(1, 30);
        breaker.record_failure();
        for _ in 0..25 {
            assert!(!breaker.can_execute());
        }

        clock.advance(Duration::from_secs(30));
        assert!(breaker.can_execute(), "first check after cooldown is the trial");
        for _ in 0..10 {
            assert!(!breaker.can_execute(), "no second permit while the trial is out");
        }
    }

    #[test]
    fn successful_trial_closes_and_resets_count() {
        let (breaker, clock) = breaker(2, 10);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(10));
        assert!(breaker.can_execute());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.can_execute());
    }

    #[test]
    fn failed_trial_reopens_for_a_fresh_cooldown() {
        let (breaker, clock) = breaker(1, 10);
        breaker.record_failure();
        clock.advance(Duration::from_secs(10));
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());

        clock.advance(Duration::from_secs(9));
        assert!(!breaker.can_execute());
        clock.advance(Duration::from_secs(1));
        assert!(breaker.can_execute());
    }

    #[test]
    fn success_while_closed_clears_partial_failures() {
        let (breaker, _) = breaker(3, 60);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.can_execute(), "count restarted after the success");
    }

    #[test]
    fn snapshot_reports_last_failure() {
        let (breaker, _) = breaker(5, 60);
        assert!(breaker.snapshot().last_failure_time.is_none());
        breaker.record_failure();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 1);
        assert!(snapshot.last_failure_time.is_some());
    }
}
