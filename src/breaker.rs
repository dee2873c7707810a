//! Three-state circuit breaker (spec.md §4.F). The pre-check and
//! post-record are separate critical sections; the wrapped call always
//! runs outside any lock, so closed-state calls run fully concurrently.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use snafu::Snafu;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Snafu)]
pub enum BreakerError<E> {
    #[snafu(display("circuit breaker is open"))]
    CircuitOpen,
    #[snafu(display("call failed: {source}"))]
    Inner { source: E },
}

struct Inner {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    open_since: Option<Instant>,
}

pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub half_open_max_calls: u32,
}

/// A fail-fast wrapper around a fallible async call.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    half_open_in_flight: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                open_since: None,
            }),
            half_open_in_flight: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Pre-check: may transition open -> half_open if the timeout has
    /// elapsed, and reserves a half-open call slot. Returns `Err` if the
    /// call should be short-circuited.
    fn pre_check(&self) -> Result<bool, ()> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Ok(false),
            State::Open => {
                let elapsed = inner
                    .open_since
                    .map(|t| t.elapsed() >= self.config.timeout)
                    .unwrap_or(false);
                if elapsed {
                    inner.state = State::HalfOpen;
                    inner.consecutive_successes = 0;
                    drop(inner);
                    self.try_reserve_half_open()
                } else {
                    Err(())
                }
            }
            State::HalfOpen => {
                drop(inner);
                self.try_reserve_half_open()
            }
        }
    }

    fn try_reserve_half_open(&self) -> Result<bool, ()> {
        loop {
            let current = self.half_open_in_flight.load(Ordering::Acquire);
            if current >= self.config.half_open_max_calls {
                return Err(());
            }
            if self
                .half_open_in_flight
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(true);
            }
        }
    }

    fn post_record(&self, reserved_half_open: bool, success: bool) {
        if reserved_half_open {
            self.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        let mut inner = self.inner.lock();
        if success {
            inner.consecutive_failures = 0;
            match inner.state {
                State::Closed => {}
                State::HalfOpen => {
                    inner.consecutive_successes += 1;
                    if inner.consecutive_successes >= self.config.success_threshold {
                        inner.state = State::Closed;
                        inner.open_since = None;
                        info!("circuit breaker closed after successful half-open probes");
                    }
                }
                State::Open => {}
            }
        } else {
            inner.consecutive_successes = 0;
            match inner.state {
                State::Closed => {
                    inner.consecutive_failures += 1;
                    if inner.consecutive_failures >= self.config.failure_threshold {
                        inner.state = State::Open;
                        inner.open_since = Some(Instant::now());
                        warn!("circuit breaker opened after consecutive failures");
                    }
                }
                State::HalfOpen => {
                    inner.state = State::Open;
                    inner.open_since = Some(Instant::now());
                    warn!("circuit breaker re-opened after half-open probe failure");
                }
                State::Open => {}
            }
        }
    }

    /// Runs `call` if the breaker allows it. The call is invoked with no
    /// locks held.
    pub async fn call<F, Fut, T, E>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let reserved = match self.pre_check() {
            Ok(reserved) => reserved,
            Err(()) => return Err(BreakerError::CircuitOpen),
        };

        let result = call().await;
        match result {
            Ok(value) => {
                self.post_record(reserved, true);
                Ok(value)
            }
            Err(e) => {
                self.post_record(reserved, false);
                Err(BreakerError::Inner { source: e })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, timeout: Duration, half_open_max: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold: 1,
            timeout,
            half_open_max_calls: half_open_max,
        })
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let b = breaker(2, Duration::from_secs(60), 1);
        let _ = b.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(b.state(), State::Closed);
        let _ = b.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(b.state(), State::Open);
    }

    #[tokio::test]
    async fn open_short_circuits_without_invoking_call() {
        let b = breaker(1, Duration::from_secs(60), 1);
        let _ = b.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(b.state(), State::Open);

        let mut invoked = false;
        let result = b
            .call(|| {
                invoked = true;
                async { Ok::<(), &str>(()) }
            })
            .await;
        assert!(!invoked);
        assert!(matches!(result, Err(BreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn half_open_allows_one_probe_after_timeout() {
        let b = breaker(1, Duration::from_millis(10), 1);
        let _ = b.call(|| async { Err::<(), _>("boom") }).await;
        assert_eq!(b.state(), State::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = b.call(|| async { Ok::<_, &str>(42) }).await;
        assert!(result.is_ok());
        assert_eq!(b.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let b = breaker(1, Duration::from_millis(10), 1);
        let _ = b.call(|| async { Err::<(), _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = b.call(|| async { Err::<(), _>("still broken") }).await;
        assert_eq!(b.state(), State::Open);
    }
}
