//! Process-wide pipeline state shared between stages.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

use crate::config::PipelineConfig;

/// Granularity of the byte budget. Semaphore permits count units, not bytes.
const BUDGET_UNIT: u64 = 1024;

/// Memory bound on bytes fetched but not yet compressed.
///
/// Admission blocks until enough of the budget is free. An object larger
/// than the whole budget is admitted alone once everything else drained.
#[derive(Debug)]
pub struct ByteBudget {
    semaphore: Arc<Semaphore>,
    capacity_units: u32,
    in_flight: AtomicU64,
    peak: AtomicU64,
}

impl ByteBudget {
    pub fn new(bytes: u64) -> Arc<Self> {
        let capacity_units = u32::try_from(bytes.div_ceil(BUDGET_UNIT).max(1)).unwrap_or(u32::MAX);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(capacity_units as usize)),
            capacity_units,
            in_flight: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        })
    }

    /// Wait until `bytes` fit in the budget, then reserve them.
    pub async fn acquire(self: &Arc<Self>, bytes: u64) -> Result<BudgetPermit, AcquireError> {
        let units = u32::try_from(bytes.div_ceil(BUDGET_UNIT))
            .unwrap_or(u32::MAX)
            .clamp(1, self.capacity_units);
        let permit = self.semaphore.clone().acquire_many_owned(units).await?;
        let now = self.in_flight.fetch_add(bytes, Ordering::AcqRel) + bytes;
        self.peak.fetch_max(now, Ordering::AcqRel);
        Ok(BudgetPermit {
            budget: Arc::clone(self),
            bytes,
            _permit: permit,
        })
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest in-flight byte count seen so far.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }
}

/// A reservation against the [`ByteBudget`]; released on drop.
#[derive(Debug)]
pub struct BudgetPermit {
    budget: Arc<ByteBudget>,
    bytes: u64,
    _permit: OwnedSemaphorePermit,
}

impl BudgetPermit {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.budget.in_flight.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Per-stage counters, for progress logging.
#[derive(Debug, Default)]
pub struct StageCounters {
    pub listed: AtomicU64,
    pub skipped: AtomicU64,
    pub fetched: AtomicU64,
    pub compressed: AtomicU64,
    pub committed: AtomicU64,
    pub failed: AtomicU64,
}

impl StageCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State that lives for the whole run.
#[derive(Debug)]
pub struct PipelineState {
    pub budget: Arc<ByteBudget>,

    /// One permit per object admitted by the lister and not yet consumed,
    /// in order, by the assembler. Bounds the reorder buffer.
    pub window: Arc<Semaphore>,

    pub counters: StageCounters,

    /// Index + 1 of the volume being assembled, zero when none is open.
    open_volume: AtomicU64,

    listing_complete: AtomicBool,
}

impl PipelineState {
    pub fn new(config: &PipelineConfig) -> Arc<Self> {
        Arc::new(Self {
            budget: ByteBudget::new(config.in_flight_byte_budget),
            window: Arc::new(Semaphore::new(config.reorder_window)),
            counters: StageCounters::default(),
            open_volume: AtomicU64::new(0),
            listing_complete: AtomicBool::new(false),
        })
    }

    /// Set once the lister has walked the whole source.
    pub fn mark_listing_complete(&self) {
        self.listing_complete.store(true, Ordering::Release);
    }

    pub fn listing_complete(&self) -> bool {
        self.listing_complete.load(Ordering::Acquire)
    }

    pub fn set_open_volume(&self, index: Option<u64>) {
        self.open_volume
            .store(index.map_or(0, |i| i + 1), Ordering::Release);
    }

    pub fn open_volume(&self) -> Option<u64> {
        self.open_volume.load(Ordering::Acquire).checked_sub(1)
    }

    /// Objects admitted into the pipeline and not yet consumed by the
    /// assembler.
    pub fn admitted(&self, reorder_window: usize) -> usize {
        reorder_window.saturating_sub(self.window.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn budget_blocks_until_released() {
        let budget = ByteBudget::new(10 * BUDGET_UNIT);
        let first = budget.acquire(6 * BUDGET_UNIT).await.unwrap();
        assert_eq!(budget.in_flight(), 6 * BUDGET_UNIT);

        let waiting = {
            let budget = budget.clone();
            tokio::spawn(async move { budget.acquire(6 * BUDGET_UNIT).await.map(|p| p.bytes()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(first);
        assert_eq!(waiting.await.unwrap().unwrap(), 6 * BUDGET_UNIT);
        assert_eq!(budget.in_flight(), 0);
        assert_eq!(budget.peak(), 6 * BUDGET_UNIT);
    }

    #[tokio::test]
    async fn oversized_request_is_admitted_alone() {
        let budget = ByteBudget::new(4 * BUDGET_UNIT);
        let permit = budget.acquire(100 * BUDGET_UNIT).await.unwrap();
        assert_eq!(budget.in_flight(), 100 * BUDGET_UNIT);
        drop(permit);
        assert_eq!(budget.in_flight(), 0);
    }

    #[test]
    fn open_volume_round_trips() {
        let state = PipelineState::new(&PipelineConfig::default());
        assert_eq!(state.open_volume(), None);
        state.set_open_volume(Some(0));
        assert_eq!(state.open_volume(), Some(0));
        state.set_open_volume(None);
        assert_eq!(state.open_volume(), None);
    }
}
