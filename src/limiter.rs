//! Concurrency limiting for handler invocations.
//!
//! Callers wait for a permit instead of being rejected. The ceiling can be changed at
//! runtime: raising it releases extra permits immediately, lowering it retires permits as
//! in-flight work finishes, so the number of concurrent holders never exceeds the newest
//! limit once the excess has drained.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    #[error("max_concurrency must be greater than zero")]
    ZeroConcurrency,
    #[error("concurrency limiter closed")]
    Closed,
}

#[derive(Debug)]
struct LimiterInner {
    semaphore: Arc<Semaphore>,
    max: AtomicUsize,
    /// Permits still owed to the semaphore after a shrink; paid back as holders release.
    debt: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Shared async concurrency ceiling. Clones share the same permits.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    inner: Arc<LimiterInner>,
}

/// Held while a unit of work runs; releases (or retires) its slot on drop.
#[derive(Debug)]
pub struct LimiterPermit {
    permit: Option<OwnedSemaphorePermit>,
    inner: Arc<LimiterInner>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::AcqRel);
        let Some(permit) = self.permit.take() else { return };
        let paid = self
            .inner
            .debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok();
        if paid {
            permit.forget();
        }
    }
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize) -> Result<Self, LimiterError> {
        if max_concurrency == 0 {
            return Err(LimiterError::ZeroConcurrency);
        }
        Ok(Self {
            inner: Arc::new(LimiterInner {
                semaphore: Arc::new(Semaphore::new(max_concurrency)),
                max: AtomicUsize::new(max_concurrency),
                debt: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
            }),
        })
    }

    /// Wait until a slot is free.
    pub async fn acquire(&self) -> Result<LimiterPermit, LimiterError> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LimiterError::Closed)?;
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(LimiterPermit { permit: Some(permit), inner: self.inner.clone() })
    }

    /// Change the ceiling. Work already running is never interrupted.
    pub fn set_max_concurrency(&self, new_max: usize) -> Result<(), LimiterError> {
        if new_max == 0 {
            return Err(LimiterError::ZeroConcurrency);
        }
        let old = self.inner.max.swap(new_max, Ordering::AcqRel);
        if new_max > old {
            let mut grow = new_max - old;
            // Cancel outstanding debt before minting new permits.
            while grow > 0 {
                let debt = self.inner.debt.load(Ordering::Acquire);
                if debt == 0 {
                    break;
                }
                let cancel = debt.min(grow);
                if self
                    .inner
                    .debt
                    .compare_exchange(debt, debt - cancel, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    grow -= cancel;
                }
            }
            self.inner.semaphore.add_permits(grow);
        } else if new_max < old {
            let shrink = old - new_max;
            let forgotten = self.inner.semaphore.forget_permits(shrink);
            self.inner.debt.fetch_add(shrink - forgotten, Ordering::AcqRel);
        }
        debug!(
            target: "breakwater::limiter",
            old,
            new = new_max,
            debt = self.inner.debt.load(Ordering::Acquire),
            "concurrency limit changed"
        );
        Ok(())
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max.load(Ordering::Acquire)
    }

    /// Permits currently held.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }
}
