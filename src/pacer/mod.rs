//! Rate-adaptive retry pacing for calls against the storage service.
//!
//! Every server-touching operation runs through [`Pacer::call`]: the pacer
//! sleeps its current delay before each attempt, jumps the delay towards
//! the maximum on failure and decays it back towards the minimum on
//! success. The delay is shared state, so one congested call slows its
//! siblings down too.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// HTTP statuses that warrant another attempt.
pub const RETRY_ERROR_CODES: [u16; 6] = [429, 500, 502, 503, 504, 509];

/// Implemented by error types the pacer can classify. `cancelled()`
/// constructs the error returned when the token fires mid-retry.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    fn cancelled() -> Self;
}

#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub min_sleep: Duration,
    pub max_sleep: Duration,
    /// Shift applied when decaying the delay after a success:
    /// `sleep -= sleep >> decay`.
    pub decay_constant: u32,
    /// Shift applied when ramping the delay after a failure; zero jumps
    /// straight to `max_sleep`.
    pub attack_constant: u32,
    pub max_attempts: u32,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_sleep: Duration::from_millis(400),
            max_sleep: Duration::from_secs(5),
            decay_constant: 2,
            attack_constant: 0,
            max_attempts: 10,
        }
    }
}

struct PacerState {
    sleep: Duration,
    consecutive_retries: u32,
}

pub struct Pacer {
    config: PacerConfig,
    state: Mutex<PacerState>,
    retries_total: AtomicU64,
    cancel: CancellationToken,
}

impl Pacer {
    pub fn new(config: PacerConfig, cancel: CancellationToken) -> Self {
        let sleep = config.min_sleep;
        Self {
            config,
            state: Mutex::new(PacerState {
                sleep,
                consecutive_retries: 0,
            }),
            retries_total: AtomicU64::new(0),
            cancel,
        }
    }

    /// Total retries recorded over the pacer's lifetime.
    pub fn retries(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    /// Current inter-call delay.
    pub fn current_sleep(&self) -> Duration {
        self.state.lock().sleep
    }

    /// Run `f` until it succeeds, it fails non-retryably, the attempt
    /// budget is spent, or the token is cancelled.
    pub async fn call<T, E, F, Fut>(&self, mut f: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempts = 0u32;
        loop {
            if self.pace().await.is_err() {
                return Err(E::cancelled());
            }

            attempts += 1;
            let outcome = tokio::select! {
                result = f() => result,
                _ = self.cancel.cancelled() => return Err(E::cancelled()),
            };
            match outcome {
                Ok(v) => {
                    self.on_success();
                    return Ok(v);
                }
                Err(e) => {
                    let retry = e.is_retryable()
                        && attempts < self.config.max_attempts
                        && !self.cancel.is_cancelled();
                    self.on_failure();
                    if !retry {
                        return Err(e);
                    }
                    self.retries_total.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        attempt = attempts,
                        sleep_ms = self.current_sleep().as_millis() as u64,
                        "retrying after pacer delay"
                    );
                }
            }
        }
    }

    async fn pace(&self) -> Result<(), ()> {
        let delay = self.state.lock().sleep;
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(()),
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_retries += 1;

        let attack = self.config.attack_constant;
        let next = if attack == 0 {
            self.config.max_sleep
        } else {
            let nanos = state.sleep.as_nanos() as u64;
            let scaled = (nanos << attack) / ((1u64 << attack) - 1);
            Duration::from_nanos(scaled).min(self.config.max_sleep)
        };
        state.sleep = next;
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_retries = 0;

        let decay = self.config.decay_constant;
        let nanos = state.sleep.as_nanos() as u64;
        let decayed = nanos - (nanos >> decay);
        state.sleep = Duration::from_nanos(decayed).max(self.config.min_sleep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
        fn cancelled() -> Self {
            TestError { retryable: false }
        }
    }

    fn quick_pacer() -> Pacer {
        Pacer::new(
            PacerConfig {
                min_sleep: Duration::from_millis(1),
                max_sleep: Duration::from_millis(20),
                decay_constant: 2,
                attack_constant: 1,
                max_attempts: 10,
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let pacer = quick_pacer();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_inner = calls.clone();
        let result: Result<u32, TestError> = pacer
            .call(move || {
                let calls = calls_inner.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 3 {
                        Err(TestError { retryable: true })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(pacer.retries() >= 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let pacer = quick_pacer();
        let calls = Arc::new(AtomicU32::new(0));

        let calls_inner = calls.clone();
        let result: Result<(), TestError> = pacer
            .call(move || {
                let calls = calls_inner.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError { retryable: false })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pacer.retries(), 0);
    }

    #[tokio::test]
    async fn test_attempt_budget_is_bounded() {
        let pacer = Pacer::new(
            PacerConfig {
                min_sleep: Duration::from_millis(1),
                max_sleep: Duration::from_millis(2),
                decay_constant: 2,
                attack_constant: 1,
                max_attempts: 3,
            },
            CancellationToken::new(),
        );
        let calls = Arc::new(AtomicU32::new(0));

        let calls_inner = calls.clone();
        let result: Result<(), TestError> = pacer
            .call(move || {
                let calls = calls_inner.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError { retryable: true })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_delay_ramps_on_failure_and_decays_on_success() {
        let pacer = quick_pacer();
        assert_eq!(pacer.current_sleep(), Duration::from_millis(1));

        pacer.on_failure();
        let after_failure = pacer.current_sleep();
        assert!(after_failure > Duration::from_millis(1));

        pacer.on_failure();
        assert!(pacer.current_sleep() >= after_failure);
        assert!(pacer.current_sleep() <= Duration::from_millis(20));

        for _ in 0..32 {
            pacer.on_success();
        }
        assert_eq!(pacer.current_sleep(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_attack_zero_jumps_to_max() {
        let pacer = Pacer::new(
            PacerConfig {
                min_sleep: Duration::from_millis(1),
                max_sleep: Duration::from_millis(50),
                decay_constant: 2,
                attack_constant: 0,
                max_attempts: 5,
            },
            CancellationToken::new(),
        );
        pacer.on_failure();
        assert_eq!(pacer.current_sleep(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits() {
        let token = CancellationToken::new();
        let pacer = Pacer::new(
            PacerConfig {
                min_sleep: Duration::from_secs(5),
                ..Default::default()
            },
            token.clone(),
        );
        token.cancel();

        let result: Result<(), TestError> = pacer.call(|| async { Ok(()) }).await;
        assert!(result.is_err());
    }
}
