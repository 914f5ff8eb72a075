use parking_lot::Mutex;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    circuit: CircuitState,
    consecutive_failures: u32,
}

/// Stops hammering a backend that keeps failing; reopens for a single
/// trial call once `recovery_timeout` has passed.
#[derive(Debug)]
pub struct CircuitBreaker {
    backend_id: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            backend_id: backend_id.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            state: Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
            }),
        }
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, BackendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.admit()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        result
    }

    fn admit(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if let CircuitState::Open { opened_at } = state.circuit {
            if opened_at.elapsed() < self.recovery_timeout {
                debug!("Circuit for '{}' is open, rejecting call", self.backend_id);
                return Err(BackendError::CircuitOpen);
            }
            state.circuit = CircuitState::HalfOpen;
            info!("Circuit for '{}' half-open, allowing trial call", self.backend_id);
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        if state.circuit != CircuitState::Closed {
            state.circuit = CircuitState::Closed;
            info!("Circuit for '{}' closed after successful call", self.backend_id);
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;

        let trip = state.circuit == CircuitState::HalfOpen
            || state.consecutive_failures >= self.failure_threshold;
        if trip {
            if !matches!(state.circuit, CircuitState::Open { .. }) {
                warn!(
                    "Circuit for '{}' opened after {} consecutive failures",
                    self.backend_id, state.consecutive_failures
                );
            }
            state.circuit = CircuitState::Open {
                opened_at: Instant::now(),
            };
        }
    }

    /// Closes the circuit, e.g. after a passing health probe.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if state.circuit != CircuitState::Closed {
            info!("Circuit for '{}' reset", self.backend_id);
        }
        state.circuit = CircuitState::Closed;
        state.consecutive_failures = 0;
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().circuit
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), CircuitState::Open { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn failure() -> BackendError {
        BackendError::transport("connection refused")
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("test", 3, Duration::from_millis(100));

        for i in 0..3 {
            let result = cb.call(|| async { Err::<(), _>(failure()) }).await;
            assert!(result.is_err());
            assert_eq!(cb.is_open(), i == 2);
        }

        let rejected = cb.call(|| async { Ok::<_, BackendError>(()) }).await;
        assert_eq!(rejected, Err(BackendError::CircuitOpen));
        assert_eq!(cb.consecutive_failures(), 3);
    }

    #[tokio::test]
    async fn test_recovers_through_half_open() {
        let cb = CircuitBreaker::new("test", 2, Duration::from_millis(50));
        for _ in 0..2 {
            let _ = cb.call(|| async { Err::<(), _>(failure()) }).await;
        }
        assert!(cb.is_open());

        sleep(Duration::from_millis(60)).await;

        let result = cb.call(|| async { Ok::<_, BackendError>(7) }).await;
        assert_eq!(result, Ok(7));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_millis(50));
        let _ = cb.call(|| async { Err::<(), _>(failure()) }).await;
        assert!(cb.is_open());

        sleep(Duration::from_millis(60)).await;

        let result = cb.call(|| async { Err::<(), _>(failure()) }).await;
        assert_eq!(result, Err(failure()));
        assert!(cb.is_open());
    }

    #[tokio::test]
    async fn test_reset_closes() {
        let cb = CircuitBreaker::new("test", 1, Duration::from_secs(60));
        let _ = cb.call(|| async { Err::<(), _>(failure()) }).await;
        assert!(cb.is_open());
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
