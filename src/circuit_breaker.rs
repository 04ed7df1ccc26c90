//! Circuit breaker guarding calls to the tile origin.
//!
//! # State Machine
//!
//! ```text
//! Closed   --[failure_threshold consecutive failures]--> Open
//! Open     --[recovery_timeout elapsed, next call]-----> HalfOpen (one probe)
//! HalfOpen --[probe succeeds]--------------------------> Closed
//! HalfOpen --[probe fails]-----------------------------> Open (cooldown restarts)
//! HalfOpen --[trial inconclusive or cancelled]---------> Open (next call retries)
//! ```
//!
//! Only origin fetches go through the breaker. Cache tier operations never do.

use std::future::Future;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::CircuitError;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, every call is attempted.
    Closed,
    /// Calls fail fast until the cooldown elapses.
    Open,
    /// A single probe call is testing the origin.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Run `f` under the breaker.
    ///
    /// Returns [`CircuitError::Open`] without calling `f` while the circuit is
    /// open, or while another probe is already in flight.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(f, |_| true).await
    }

    /// Like [`call`](Self::call), but an `Ok` value for which `is_healthy`
    /// returns false is inconclusive. It leaves the failure count alone, and
    /// in HalfOpen it neither closes the circuit nor restarts the cooldown.
    pub async fn call_with<F, Fut, T, E, H>(&self, f: F, is_healthy: H) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnOnce(&T) -> bool,
    {
        let admission = self.admit().ok_or(CircuitError::Open)?;
        let mut guard = CallGuard {
            breaker: self,
            admission,
            settled: false,
        };

        match f().await {
            Ok(value) => {
                if is_healthy(&value) {
                    guard.settle(true);
                } else {
                    guard.release();
                }
                Ok(value)
            }
            Err(e) => {
                guard.settle(false);
                Err(CircuitError::Inner(e))
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    fn admit(&self) -> Option<Admission> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.recovery_timeout);
                if !cooled_down {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                tracing::info!("Circuit breaker half-open, probing origin");
                Some(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return None;
                }
                inner.probe_in_flight = true;
                Some(Admission::Probe)
            }
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (admission, inner.state) {
            (Admission::Probe, _) => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                tracing::info!("Circuit breaker CLOSED, origin recovered");
            }
            (Admission::Normal, CircuitState::Closed) => {
                inner.consecutive_failures = 0;
            }
            // A call admitted before the trip finished late; the probe decides.
            (Admission::Normal, _) => {}
        }
    }

    fn on_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        match (admission, inner.state) {
            (Admission::Probe, _) => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::warn!("Circuit breaker probe failed, re-opening");
            }
            (Admission::Normal, CircuitState::Closed) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        recovery_secs = self.config.recovery_timeout.as_secs(),
                        "Circuit breaker OPENED, origin calls short-circuited"
                    );
                }
            }
            (Admission::Normal, _) => {}
        }
    }

    /// A HalfOpen trial that was dropped or came back inconclusive frees the
    /// slot and leaves the circuit open with its original trip time, so the
    /// next caller is admitted.
    fn on_released(&self, admission: Admission) {
        if admission != Admission::Probe {
            return;
        }
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
        }
        tracing::debug!("Circuit breaker trial released without a verdict");
    }
}

/// Records the outcome of an admitted call, including cancellation.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        if success {
            self.breaker.on_success(self.admission);
        } else {
            self.breaker.on_failure(self.admission);
        }
    }

    fn release(&mut self) {
        self.settled = true;
        self.breaker.on_released(self.admission);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_released(self.admission);
        }
    }
}
