//! Sleeping abstraction for backoff delays and inter-batch pauses.
//!
//! Production code sleeps on the tokio timer; tests swap in [`InstantSleeper`] or
//! [`TrackingSleeper`] so retry schedules can be asserted without waiting.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Records every requested delay and returns immediately. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in call order.
    pub fn delays(&self) -> Vec<Duration> {
        self.calls.lock().expect("tracking sleeper poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().expect("tracking sleeper poisoned").len()
    }

    /// Sum of all requested delays.
    pub fn total(&self) -> Duration {
        self.calls.lock().expect("tracking sleeper poisoned").iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("tracking sleeper poisoned").clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().expect("tracking sleeper poisoned").push(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_doesnt_sleep() {
        let start = std::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_calls() {
        let sleeper = TrackingSleeper::new();
        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(200)).await;

        assert_eq!(sleeper.count(), 2);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(sleeper.total(), Duration::from_millis(300));

        sleeper.clear();
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_advances_timer() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
