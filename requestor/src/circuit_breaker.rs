//! Global pause after repeated rate limit rejections.
//!
//! ```text
//! CLOSED -> OPEN:   `threshold` rejections within one window
//! OPEN -> CLOSED:   check_and_wait() slept out the rest of the window
//! ```
//!
//! The window slides: a rejection arriving after the window has elapsed starts
//! a fresh window with a count of one.
use crate::config::CircuitBreakerConfig;
use crate::metrics_defs::CIRCUIT_BREAKER_OPENED;
use shared::counter;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, sleep};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

struct Window {
    state: CircuitState,
    started_at: Option<Instant>,
    rejections: u32,
}

impl Window {
    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.started_at = None;
        self.rejections = 0;
    }
}

pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    inner: Mutex<Window>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            threshold: config.threshold.max(1),
            window: config.window(),
            inner: Mutex::new(Window {
                state: CircuitState::Closed,
                started_at: None,
                rejections: 0,
            }),
        }
    }

    /// Record one rate limit rejection from the remote API.
    pub async fn record_rejection(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let expired = inner
            .started_at
            .is_none_or(|start| now.duration_since(start) > self.window);
        if expired && inner.state == CircuitState::Closed {
            inner.started_at = Some(now);
            inner.rejections = 0;
        }

        inner.rejections += 1;

        if inner.state == CircuitState::Closed && inner.rejections >= self.threshold {
            inner.state = CircuitState::Open;
            counter!(CIRCUIT_BREAKER_OPENED).increment(1);
            tracing::warn!(
                rejections = inner.rejections,
                window_secs = self.window.as_secs(),
                "Circuit breaker opened, pausing outbound calls"
            );
        }
    }

    /// Call before every outbound request. If the breaker is open, waits out
    /// the remainder of the window and closes it again.
    pub async fn check_and_wait(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Closed {
            return;
        }

        let elapsed = inner
            .started_at
            .map(|start| start.elapsed())
            .unwrap_or(self.window);
        let remaining = self.window.saturating_sub(elapsed);

        if !remaining.is_zero() {
            tracing::warn!(
                remaining_secs = remaining.as_secs(),
                "Circuit breaker open, waiting for cool-down"
            );
            sleep(remaining).await;
        }

        inner.reset();
        tracing::info!("Circuit breaker closed");
    }

    #[cfg(test)]
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }
}
