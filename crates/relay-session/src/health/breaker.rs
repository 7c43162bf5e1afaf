//! Per-agent circuit breaker.
//!
//! `threshold` consecutive failures open the circuit; after `cool_down` it
//! half-opens and admits a single probe. The probe's outcome closes or
//! re-opens the circuit. A probe that reports nothing within another
//! `cool_down` is written off and a new one is admitted.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Executions admitted.
    Closed,
    /// Executions barred until the cool-down has elapsed.
    Open {
        /// When the circuit opened.
        since: Instant,
    },
    /// A single probe execution is admitted.
    HalfOpen,
}

impl CircuitState {
    /// Snake-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CircuitState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Closed → Open → HalfOpen → Closed state machine.
#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    probe_started: Option<Instant>,
    threshold: u32,
    cool_down: Duration,
}

impl CircuitBreaker {
    /// A closed breaker.
    pub fn new(threshold: u32, cool_down: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_started: None,
            threshold: threshold.max(1),
            cool_down,
        }
    }

    /// State at `now`, half-opening an expired open circuit.
    pub fn state(&mut self, now: Instant) -> CircuitState {
        if let CircuitState::Open { since } = self.state {
            if now.saturating_duration_since(since) >= self.cool_down {
                self.state = CircuitState::HalfOpen;
                self.probe_started = None;
            }
        }
        self.state
    }

    /// Whether a new execution may start at `now`.
    ///
    /// In `HalfOpen` exactly one caller gets `true` until an outcome is
    /// recorded or the probe's deadline passes.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state(now) {
            CircuitState::Closed => true,
            CircuitState::Open { .. } => false,
            CircuitState::HalfOpen => match self.probe_started {
                Some(at) if now.saturating_duration_since(at) < self.cool_down => false,
                _ => {
                    self.probe_started = Some(now);
                    true
                }
            },
        }
    }

    /// Record a success. Closes the circuit.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.probe_started = None;
        self.state = CircuitState::Closed;
    }

    /// Record a failure. Returns `true` if this failure opened the circuit.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.probe_started = None;
        match self.state(now) {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open { since: now };
                true
            }
            CircuitState::Closed if self.consecutive_failures >= self.threshold => {
                self.state = CircuitState::Open { since: now };
                true
            }
            _ => false,
        }
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const COOL_DOWN: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(3, COOL_DOWN);
        let now = Instant::now();
        assert!(!breaker.record_failure(now));
        assert!(!breaker.record_failure(now));
        assert!(breaker.allow(now));
        assert!(breaker.record_failure(now));
        assert_matches!(breaker.state(now), CircuitState::Open { .. });
        assert!(!breaker.allow(now));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let mut breaker = CircuitBreaker::new(3, COOL_DOWN);
        let now = Instant::now();
        let _ = breaker.record_failure(now);
        let _ = breaker.record_failure(now);
        breaker.record_success();
        let _ = breaker.record_failure(now);
        assert_eq!(breaker.state(now), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_single_probe() {
        let mut breaker = CircuitBreaker::new(1, COOL_DOWN);
        let opened = Instant::now();
        let _ = breaker.record_failure(opened);

        let later = opened + COOL_DOWN;
        assert_eq!(breaker.state(later), CircuitState::HalfOpen);
        assert!(breaker.allow(later));
        assert!(!breaker.allow(later));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes() {
        let mut breaker = CircuitBreaker::new(1, COOL_DOWN);
        let opened = Instant::now();
        let _ = breaker.record_failure(opened);
        assert!(breaker.allow(opened + COOL_DOWN));
        breaker.record_success();
        assert_eq!(breaker.state(opened + COOL_DOWN), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens() {
        let mut breaker = CircuitBreaker::new(5, COOL_DOWN);
        let opened = Instant::now();
        for _ in 0..5 {
            let _ = breaker.record_failure(opened);
        }
        let probe_at = opened + COOL_DOWN;
        assert!(breaker.allow(probe_at));
        assert!(breaker.record_failure(probe_at));
        assert_eq!(breaker.state(probe_at), CircuitState::Open { since: probe_at });
        assert!(!breaker.allow(probe_at + Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_readmits_after_silent_deadline() {
        let mut breaker = CircuitBreaker::new(1, COOL_DOWN);
        let opened = Instant::now();
        let _ = breaker.record_failure(opened);

        let probe_at = opened + COOL_DOWN;
        assert!(breaker.allow(probe_at));
        assert!(!breaker.allow(probe_at + COOL_DOWN - Duration::from_secs(1)));
        assert!(breaker.allow(probe_at + COOL_DOWN));
        assert_eq!(breaker.state(probe_at + COOL_DOWN), CircuitState::HalfOpen);
    }

    #[test]
    fn state_serializes_as_name() {
        assert_eq!(
            serde_json::to_value(CircuitState::HalfOpen).unwrap(),
            serde_json::json!("half_open")
        );
    }
}
