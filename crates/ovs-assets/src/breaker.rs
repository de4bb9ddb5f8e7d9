//! Circuit breaker guarding the inventory transport.
//!
//! Closed → Open after 3 consecutive failures; Open → HalfOpen after the
//! cool-down; one probe decides between Closed and Open again. While open,
//! callers get `CIRCUIT_OPEN` without the transport being invoked.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

pub const FAILURE_THRESHOLD: u32 = 3;
pub const OPEN_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Shared breaker; all methods take `&self`.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    threshold: u32,
    cooldown: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, OPEN_COOLDOWN)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            threshold,
            cooldown,
        }
    }

    /// May a call proceed right now? Moves Open → HalfOpen once the
    /// cool-down has elapsed (the caller becomes the probe).
    pub async fn allow(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    info!("circuit half-open; next call probes the backend");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: closes from any state.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != BreakerState::Closed {
            info!("circuit closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    /// Record a failed call. A HalfOpen probe failure re-opens immediately;
    /// in Closed the threshold applies.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("circuit re-opened after failed probe");
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit opened after consecutive failures"
                    );
                }
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_three_consecutive_failures() {
        let b = CircuitBreaker::default();
        for _ in 0..2 {
            b.record_failure().await;
            assert_eq!(b.state().await, BreakerState::Closed);
        }
        b.record_failure().await;
        assert_eq!(b.state().await, BreakerState::Open);
        assert!(!b.allow().await);
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let b = CircuitBreaker::default();
        b.record_failure().await;
        b.record_failure().await;
        b.record_success().await;
        b.record_failure().await;
        b.record_failure().await;
        assert_eq!(b.state().await, BreakerState::Closed, "streak was broken");
    }

    #[tokio::test]
    async fn half_open_after_cooldown_then_close_on_success() {
        let b = CircuitBreaker::new(3, Duration::from_millis(10));
        for _ in 0..3 {
            b.record_failure().await;
        }
        assert!(!b.allow().await);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.allow().await, "cooldown elapsed → probe allowed");
        assert_eq!(b.state().await, BreakerState::HalfOpen);

        b.record_success().await;
        assert_eq!(b.state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn failed_probe_reopens_immediately() {
        let b = CircuitBreaker::new(3, Duration::from_millis(10));
        for _ in 0..3 {
            b.record_failure().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.allow().await);
        b.record_failure().await;
        assert_eq!(b.state().await, BreakerState::Open);
        assert!(!b.allow().await);
    }
}
