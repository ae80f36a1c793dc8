//! A circuit breaker for external-service clients: `closed` while healthy,
//! `open` after repeated failures, `half-open` to probe after a cooldown.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit is open; request rejected")]
    Open,
    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    /// Consecutive failures that trip the circuit.
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            threshold,
            cooldown,
        }
    }

    fn check(&self) -> Result<(), ()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } | State::HalfOpen => Ok(()),
            State::Open { until } => {
                if Instant::now() >= until {
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(())
                }
            }
        }
    }

    fn record(&self, success: bool) {
        let mut state = self.state.lock().unwrap();
        *state = match (&*state, success) {
            (_, true) => State::Closed { failures: 0 },
            (State::HalfOpen, false) => State::Open {
                until: Instant::now() + self.cooldown,
            },
            (State::Closed { failures }, false) => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    State::Open {
                        until: Instant::now() + self.cooldown,
                    }
                } else {
                    State::Closed { failures }
                }
            }
            (State::Open { until }, false) => State::Open { until: *until },
        };
    }

    /// Run `fut` under the breaker. While open, the call is rejected without
    /// running; a half-open probe that succeeds closes the circuit again.
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if self.check().is_err() {
            return Err(BreakerError::Open);
        }
        match fut.await {
            Ok(value) => {
                self.record(true);
                Ok(value)
            }
            Err(err) => {
                self.record(false);
                Err(BreakerError::Inner(err))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        breaker.call(async { Err::<(), _>("boom") }).await
    }

    #[tokio::test]
    async fn trips_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(20));

        for _ in 0..3 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        }
        // Tripped: rejected without running.
        assert!(matches!(fail(&breaker).await, Err(BreakerError::Open)));

        tokio::time::sleep(Duration::from_millis(30)).await;

        // Half-open probe succeeds and the circuit closes.
        let ok = breaker.call(async { Ok::<_, &'static str>(7) }).await;
        assert_eq!(ok.unwrap(), 7);
        assert!(breaker.call(async { Ok::<_, &'static str>(8) }).await.is_ok());
    }

    #[tokio::test]
    async fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(20));
        let _ = fail(&breaker).await;
        assert!(matches!(fail(&breaker).await, Err(BreakerError::Open)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        assert!(matches!(fail(&breaker).await, Err(BreakerError::Open)));
    }
}
