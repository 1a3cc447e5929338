//! Bounded-concurrency batch processor with per-item retry.
//!
//! Items are split into contiguous batches of `batch_size` that run strictly one after
//! another, separated by `inter_batch_pause`. Inside a batch every item is driven on the
//! calling task through a `FuturesUnordered`; a shared [`ConcurrencyLimiter`] keeps at most
//! `max_concurrency` handler invocations running at once. A permit is held only while the
//! handler runs, never while an item waits out its retry delay.
//!
//! A run never aborts: each item ends up as exactly one [`ProcessingOutcome`], in input
//! order, carrying the original item whether it succeeded or not.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::classify::Classify;
use crate::config::{BatchConfig, ConfigError};
use crate::limiter::{ConcurrencyLimiter, LimiterError};
use crate::sleeper::{Sleeper, TokioSleeper};

/// What to do after a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Try again after the backoff delay, if attempts remain.
    Retry,
    /// Stop retrying this item and record the failure.
    Skip,
    /// Escalate: record the item as failed and log it loudly. Other items keep running.
    Fail,
}

/// Why an item ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Every allowed attempt failed.
    Exhausted,
    Skipped,
    Escalated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemFailure<E> {
    /// The error from the last attempt.
    pub error: E,
    pub disposition: FailureDisposition,
}

/// The result of processing one item.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingOutcome<T, R, E> {
    /// Position in the input.
    pub index: usize,
    pub item: T,
    pub result: Result<R, ItemFailure<E>>,
    pub attempts: usize,
    /// Time from first attempt to final result, retry delays included.
    pub elapsed: Duration,
}

impl<T, R, E> ProcessingOutcome<T, R, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct BatchReport<T, R, E> {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub batches: usize,
    /// One per input item, in input order.
    pub outcomes: Vec<ProcessingOutcome<T, R, E>>,
    pub duration: Duration,
}

impl<T, R, E> BatchReport<T, R, E> {
    /// Mean of per-item elapsed times.
    pub fn mean_item_time(&self) -> Duration {
        if self.total == 0 {
            return Duration::ZERO;
        }
        let sum: Duration = self.outcomes.iter().map(|o| o.elapsed).sum();
        sum / u32::try_from(self.total).unwrap_or(u32::MAX)
    }

    /// Items per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.total as f64 / secs
        }
    }

    pub fn successes(&self) -> impl Iterator<Item = &ProcessingOutcome<T, R, E>> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProcessingOutcome<T, R, E>> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Items that failed, consuming the report. Handy for re-queuing.
    pub fn into_failed_items(self) -> Vec<T> {
        self.outcomes.into_iter().filter(|o| o.result.is_err()).map(|o| o.item).collect()
    }
}

type ProgressFn<'a, T> = Box<dyn Fn(usize, usize, &T) + Send + Sync + 'a>;
type ErrorPolicyFn<'a, T, E> = Box<dyn Fn(&E, &T, usize) -> ErrorAction + Send + Sync + 'a>;

/// Optional hooks for a run.
pub struct ProcessOptions<'a, T, E> {
    progress: Option<ProgressFn<'a, T>>,
    error_policy: Option<ErrorPolicyFn<'a, T, E>>,
}

impl<T, E> Default for ProcessOptions<'_, T, E> {
    fn default() -> Self {
        Self { progress: None, error_policy: None }
    }
}

impl<T, E> fmt::Debug for ProcessOptions<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("progress", &self.progress.is_some())
            .field("error_policy", &self.error_policy.is_some())
            .finish()
    }
}

impl<'a, T, E> ProcessOptions<'a, T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per completed item with `(processed, total, item)`.
    pub fn on_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(usize, usize, &T) + Send + Sync + 'a,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Decide per failure whether to retry, skip or escalate. Receives the error, the item
    /// and the 1-based attempt that just failed.
    pub fn on_error<F>(mut self, policy: F) -> Self
    where
        F: Fn(&E, &T, usize) -> ErrorAction + Send + Sync + 'a,
    {
        self.error_policy = Some(Box::new(policy));
        self
    }

    fn action(&self, error: &E, item: &T, attempt: usize) -> ErrorAction {
        match &self.error_policy {
            Some(policy) => policy(error, item, attempt),
            None => ErrorAction::Retry,
        }
    }
}

impl<'a, T, E: Classify> ProcessOptions<'a, T, E> {
    /// Retry retryable kinds, skip `Validation` failures.
    pub fn classified(self) -> Self {
        self.on_error(|error: &E, _: &T, _| {
            if error.is_retryable() {
                ErrorAction::Retry
            } else {
                ErrorAction::Skip
            }
        })
    }
}

/// Runs a handler over many items with bounded concurrency.
#[derive(Clone)]
pub struct BatchProcessor {
    config: BatchConfig,
    limiter: ConcurrencyLimiter,
    backoff: Backoff,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field("max_concurrency", &self.limiter.max_concurrency())
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = ConcurrencyLimiter::new(config.max_concurrency)
            .map_err(|_| ConfigError::Zero { field: "batch.max_concurrency" })?;
        Ok(Self {
            backoff: Backoff::exponential(config.retry_delay),
            config,
            limiter,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Replace the sleeper used for retry delays and inter-batch pauses.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// The limiter shared by every run of this processor.
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Change the concurrency ceiling; applies to the next permit handed out.
    pub fn set_max_concurrency(&self, max: usize) -> Result<(), LimiterError> {
        self.limiter.set_max_concurrency(max)
    }

    pub async fn process_items<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        handler: F,
        label: &str,
    ) -> BatchReport<T, R, E>
    where
        F: Fn(&T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: fmt::Display,
    {
        self.process_items_with(items, handler, label, ProcessOptions::default()).await
    }

    pub async fn process_items_with<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        handler: F,
        label: &str,
        options: ProcessOptions<'_, T, E>,
    ) -> BatchReport<T, R, E>
    where
        F: Fn(&T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let total = items.len();
        let batch_size = self.config.batch_size;
        let batch_count = total.div_ceil(batch_size);
        info!(
            target: "breakwater::batch",
            label,
            total,
            batches = batch_count,
            batch_size,
            max_concurrency = self.limiter.max_concurrency(),
            "starting run"
        );

        let handler = &handler;
        let hooks = &options;
        let mut outcomes = Vec::with_capacity(total);
        let mut processed = 0;
        let mut remaining = items.into_iter();

        for batch_index in 0..batch_count {
            let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
            let first = batch_index * batch_size;

            let mut results: Vec<Option<ItemResult<R, E>>> = Vec::new();
            results.resize_with(batch.len(), || None);
            {
                let mut running: FuturesUnordered<_> = batch
                    .iter()
                    .enumerate()
                    .map(|(offset, item)| async move {
                        let result =
                            self.run_item(first + offset, item, handler, hooks, label).await;
                        (offset, result)
                    })
                    .collect();

                while let Some((offset, result)) = running.next().await {
                    processed += 1;
                    if let Some(progress) = &hooks.progress {
                        progress(processed, total, &batch[offset]);
                    }
                    results[offset] = Some(result);
                }
            }

            let mut batch_failed = 0;
            for (offset, (item, result)) in batch.into_iter().zip(results).enumerate() {
                // every future in the batch resolved before the stream ended
                let Some(result) = result else { continue };
                batch_failed += usize::from(result.result.is_err());
                outcomes.push(ProcessingOutcome {
                    index: first + offset,
                    item,
                    result: result.result,
                    attempts: result.attempts,
                    elapsed: result.elapsed,
                });
            }
            debug!(
                target: "breakwater::batch",
                label,
                batch = batch_index + 1,
                of = batch_count,
                failed = batch_failed,
                "batch finished"
            );

            if batch_index + 1 < batch_count && !self.config.inter_batch_pause.is_zero() {
                self.sleeper.sleep(self.config.inter_batch_pause).await;
            }
        }

        let successful = outcomes.iter().filter(|o| o.is_success()).count();
        let report = BatchReport {
            total,
            successful,
            failed: outcomes.len() - successful,
            batches: batch_count,
            outcomes,
            duration: started.elapsed(),
        };
        info!(
            target: "breakwater::batch",
            label,
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            batches = report.batches,
            duration_ms = report.duration.as_millis() as u64,
            throughput = report.throughput(),
            "run finished"
        );
        report
    }

    async fn run_item<T, R, E, F, Fut>(
        &self,
        index: usize,
        item: &T,
        handler: &F,
        options: &ProcessOptions<'_, T, E>,
        label: &str,
    ) -> ItemResult<R, E>
    where
        F: Fn(&T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let max_attempts = self.config.retry_attempts;
        let mut attempt = 1;

        loop {
            let outcome = {
                // the limiter is never closed, so a permit is always granted
                let _permit = self.limiter.acquire().await.ok();
                handler(item).await
            };
            let error = match outcome {
                Ok(value) => {
                    return ItemResult { result: Ok(value), attempts: attempt, elapsed: started.elapsed() }
                }
                Err(error) => error,
            };

            let disposition = match options.action(&error, item, attempt) {
                ErrorAction::Retry if attempt < max_attempts => None,
                ErrorAction::Retry => Some(FailureDisposition::Exhausted),
                ErrorAction::Skip => Some(FailureDisposition::Skipped),
                ErrorAction::Fail => Some(FailureDisposition::Escalated),
            };

            if let Some(disposition) = disposition {
                if disposition == FailureDisposition::Escalated {
                    error!(target: "breakwater::batch", label, index, attempt, error = %error, "item escalated");
                } else {
                    warn!(
                        target: "breakwater::batch",
                        label,
                        index,
                        attempts = attempt,
                        disposition = ?disposition,
                        error = %error,
                        "item failed"
                    );
                }
                return ItemResult {
                    result: Err(ItemFailure { error, disposition }),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }

            let delay = self.backoff.delay(attempt);
            debug!(
                target: "breakwater::batch",
                label,
                index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying item"
            );
            self.sleeper.sleep(delay).await;
            attempt += 1;
        }
    }
}

struct ItemResult<R, E> {
    result: Result<R, ItemFailure<E>>,
    attempts: usize,
    elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn processor(max_concurrency: usize, batch_size: usize, retry_attempts: usize) -> BatchProcessor {
        BatchProcessor::new(BatchConfig {
            max_concurrency,
            batch_size,
            retry_attempts,
            retry_delay: Duration::from_millis(100),
            inter_batch_pause: Duration::from_millis(100),
        })
        .unwrap()
        .with_sleeper(InstantSleeper)
    }

    #[test]
    fn rejects_invalid_config() {
        let config = BatchConfig { batch_size: 0, ..BatchConfig::default() };
        assert!(matches!(BatchProcessor::new(config), Err(ConfigError::Zero { .. })));
    }

    #[tokio::test]
    async fn empty_input() {
        let report = processor(2, 10, 3)
            .process_items(Vec::<u32>::new(), |_| async { Ok::<_, String>(()) }, "empty")
            .await;
        assert_eq!((report.total, report.batches, report.outcomes.len()), (0, 0, 0));
        assert_eq!(report.mean_item_time(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_delays_double() {
        let sleeper = TrackingSleeper::new();
        let processor = processor(1, 10, 4).with_sleeper(sleeper.clone());
        let report = processor
            .process_items(vec!["always-fails"], |_| async { Err::<(), _>("boom") }, "delays")
            .await;

        assert_eq!(report.outcomes[0].attempts, 4);
        assert_eq!(
            report.outcomes[0].result.as_ref().unwrap_err().disposition,
            FailureDisposition::Exhausted
        );
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(400)]
        );
    }

    #[tokio::test]
    async fn pauses_only_between_batches() {
        let sleeper = TrackingSleeper::new();
        let processor = processor(5, 10, 1).with_sleeper(sleeper.clone());
        let report =
            processor.process_items((0..25).collect(), |_| async { Ok::<_, String>(()) }, "pause").await;
        assert_eq!(report.batches, 3);
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(100); 2]);
    }

    #[tokio::test]
    async fn skip_stops_retrying() {
        let calls = AtomicUsize::new(0);
        let options = ProcessOptions::new().on_error(|_: &String, _: &u32, _| ErrorAction::Skip);
        let report = processor(1, 10, 5)
            .process_items_with(
                vec![1u32],
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("bad input".to_string()) }
                },
                "skip",
                options,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let failure = report.outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(failure.disposition, FailureDisposition::Skipped);
        assert_eq!(failure.error, "bad input");
    }

    #[tokio::test]
    async fn policy_sees_attempt_numbers() {
        let seen = Mutex::new(Vec::new());
        let options = ProcessOptions::new().on_error(|_: &&str, item: &u32, attempt| {
            seen.lock().unwrap().push((*item, attempt));
            if attempt < 2 {
                ErrorAction::Retry
            } else {
                ErrorAction::Fail
            }
        });
        let report = processor(1, 10, 5)
            .process_items_with(vec![9u32], |_| async { Err::<(), _>("nope") }, "attempts", options)
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![(9, 1), (9, 2)]);
        assert_eq!(report.outcomes[0].attempts, 2);
    }

    #[tokio::test]
    async fn progress_counts_every_item() {
        let ticks = Mutex::new(Vec::new());
        let options = ProcessOptions::<u32, String>::new()
            .on_progress(|done, total, item| ticks.lock().unwrap().push((done, total, *item)));
        processor(3, 4, 1)
            .process_items_with((0..10).collect(), |_| async { Ok::<_, String>(()) }, "progress", options)
            .await;
        let ticks = ticks.into_inner().unwrap();
        assert_eq!(ticks.len(), 10);
        assert_eq!(ticks.iter().map(|t| t.0).collect::<Vec<_>>(), (1..=10).collect::<Vec<_>>());
        assert!(ticks.iter().all(|t| t.1 == 10));
    }

    #[tokio::test]
    async fn runtime_limit_change_applies() {
        let processor = processor(4, 10, 1);
        processor.set_max_concurrency(1).unwrap();
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        processor
            .process_items(
                (0..6).collect::<Vec<u32>>(),
                |_| {
                    let current = &current;
                    let peak = &peak;
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    }
                },
                "resize",
            )
            .await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn classified_policy_skips_validation() {
        use crate::classify::{FetchError, RequestContext};
        use reqwest::Method;

        let options = ProcessOptions::<&str, FetchError>::new().classified();
        let report = processor(2, 10, 3)
            .process_items_with(
                vec!["https://example.org/missing"],
                |url| {
                    let context = RequestContext::new(Method::GET, *url);
                    async move { Err::<(), _>(FetchError::from_status(context, 404).unwrap()) }
                },
                "classified",
                options,
            )
            .await;
        assert_eq!(report.outcomes[0].attempts, 1);
        assert_eq!(
            report.outcomes[0].result.as_ref().unwrap_err().disposition,
            FailureDisposition::Skipped
        );
    }
}
