//! Overall operation deadline.

use crate::ResilienceError;
use std::future::Future;
use std::time::{Duration, Instant};

/// Bounds a whole operation, retries and backoff included.
#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("timeout must be non-zero (got {0:?})")]
pub struct TimeoutError(pub Duration);

impl TimeoutPolicy {
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() {
            return Err(TimeoutError(duration));
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        Op: FnOnce() -> Fut,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, operation()).await {
            Ok(result) => result,
            Err(_) => Err(ResilienceError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(String);

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[test]
    fn zero_duration_rejected() {
        assert_eq!(TimeoutPolicy::new(Duration::ZERO).unwrap_err(), TimeoutError(Duration::ZERO));
    }

    #[tokio::test]
    async fn completes_before_timeout() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(100)).unwrap();
        let result = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, ResilienceError<TestError>>(42)
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_long_operation() {
        let timeout = TimeoutPolicy::new(Duration::from_millis(50)).unwrap();
        let result = timeout
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, ResilienceError<TestError>>(())
            })
            .await;

        match result.unwrap_err() {
            ResilienceError::Timeout { timeout, .. } => {
                assert_eq!(timeout, Duration::from_millis(50));
            }
            e => panic!("expected Timeout, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn propagates_operation_errors() {
        let timeout = TimeoutPolicy::new(Duration::from_secs(1)).unwrap();
        let result = timeout
            .execute(|| async {
                Err::<(), _>(ResilienceError::Inner(TestError("operation failed".into())))
            })
            .await;
        assert_eq!(result.unwrap_err().into_inner().unwrap().0, "operation failed");
    }
}
