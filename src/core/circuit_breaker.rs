//! Circuit Breaker Implementation
//!
//! Per-instance circuit breaker owned by the load balancer. It reacts to
//! request outcomes only; active probing is the health checker's job.
//!
//! ## States:
//! - **Closed**: requests pass through, consecutive failures are counted
//! - **Open**: the instance is skipped by selection
//!
//! There is no explicit half-open state. Once the cool-down since the last
//! failure has elapsed the breaker closes optimistically and keeps its failure
//! count, so the next failed request re-opens it immediately while a success
//! resets it.
//!
//! The breaker is a plain value guarded by the balancer's lock; it uses
//! `tokio::time::Instant` so tests can drive the cool-down with a paused clock.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub max_retries: u32,

    /// How long an open circuit stays open after the last failure
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Instance is excluded from selection
    Open,
}

/// Immutable snapshot of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub times_opened: u64,
    pub rejected_selections: u64,
    pub seconds_since_last_failure: Option<f64>,
}

/// Circuit breaker for one service instance
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    consecutive_failures: u32,
    last_failure_time: Option<Instant>,
    open: bool,
    times_opened: u64,
    rejected_selections: u64,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            last_failure_time: None,
            open: false,
            times_opened: 0,
            rejected_selections: 0,
        }
    }

    /// Check whether the instance may receive traffic.
    ///
    /// An open circuit whose cool-down has elapsed transitions back to closed
    /// here, regardless of any health-check outcome.
    pub fn allows_request(&mut self) -> bool {
        if !self.open {
            return true;
        }

        let cooled_down = self
            .last_failure_time
            .map(|at| at.elapsed() >= self.config.cooldown)
            .unwrap_or(true);

        if cooled_down {
            self.open = false;
            true
        } else {
            self.rejected_selections += 1;
            false
        }
    }

    /// Record a successful request; resets the failure counter
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.open = false;
    }

    /// Record a failed request.
    ///
    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_time = Some(Instant::now());

        if !self.open && self.consecutive_failures >= self.config.max_retries {
            self.open = true;
            self.times_opened += 1;
            return true;
        }
        false
    }

    /// Current state without applying the cool-down transition
    pub fn state(&self) -> CircuitState {
        if self.open {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Number of consecutive failures
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Get the configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Snapshot for stats endpoints
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        CircuitBreakerSnapshot {
            state: self.state(),
            consecutive_failures: self.consecutive_failures,
            times_opened: self.times_opened,
            rejected_selections: self.rejected_selections,
            seconds_since_last_failure: self.last_failure_time.map(|at| at.elapsed().as_secs_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(max_retries: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig { max_retries, cooldown })
    }

    #[test]
    fn test_circuit_breaker_initial_state() {
        let mut cb = breaker(3, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allows_request());
    }

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let mut cb = breaker(3, Duration::from_secs(60));

        assert!(!cb.record_failure());
        assert!(!cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.record_failure());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allows_request());
        assert_eq!(cb.snapshot().rejected_selections, 1);
    }

    #[test]
    fn test_success_resets_failures() {
        let mut cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.consecutive_failures(), 0);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_closes_after_cooldown() {
        let mut cb = breaker(2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.allows_request());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.allows_request());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cb.allows_request());
        assert_eq!(cb.state(), CircuitState::Closed);

        // Failure count is kept, so one more failure re-opens immediately
        assert!(cb.record_failure());
        assert_eq!(cb.snapshot().times_opened, 2);
    }
}
