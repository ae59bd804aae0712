//! Control-context handle
//!
//! Wraps the swap coordinator with the edit cycle collaborators use:
//! clone the published state, edit the inactive one, publish with a bounded
//! number of swap retries.

use ampdsp_core::domain::{
    ConfigSwapCoordinator, DspError, EngineMetrics, MetricsSnapshot, PipelineState, SwapHealth,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retries of a contended swap, with doubling backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_millis(2),
        }
    }
}

#[derive(Clone)]
pub struct ControlHandle {
    coordinator: Arc<ConfigSwapCoordinator>,
    metrics: Arc<EngineMetrics>,
    retry: RetryPolicy,
    /// Serializes clone/edit/swap cycles between control callers
    session: Arc<Mutex<()>>,
}

impl ControlHandle {
    pub fn new(coordinator: Arc<ConfigSwapCoordinator>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            coordinator,
            metrics,
            retry: RetryPolicy::default(),
            session: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn coordinator(&self) -> &Arc<ConfigSwapCoordinator> {
        &self.coordinator
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn health(&self) -> SwapHealth {
        self.coordinator.health()
    }

    /// Swap, retrying contention; returns the number of attempts used
    pub fn swap_with_retry(&self) -> Result<u32, DspError> {
        let attempts = self.retry.attempts.max(1);
        let mut backoff = self.retry.backoff;
        let mut attempt = 1;
        loop {
            match self.coordinator.swap() {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(attempt, "Swap succeeded after retry");
                    }
                    return Ok(attempt);
                }
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %e, "Swap contended, retrying");
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempt, error = %e, "Swap failed");
                    return Err(e);
                }
            }
        }
    }

    /// Clone the published state, run `edit` on the copy and publish it
    ///
    /// If `edit` fails nothing is published; the next cycle starts again
    /// from the published state, discarding whatever the failed edit left.
    pub fn apply<T>(
        &self,
        edit: impl FnOnce(&mut PipelineState) -> Result<T, DspError>,
    ) -> Result<T, DspError> {
        let _session = self.session.lock();
        self.coordinator.clone_active_into_inactive();
        let value = self.coordinator.edit(edit)?;
        self.swap_with_retry()?;
        Ok(value)
    }

    /// Read the last published configuration; never touches the active slot
    pub fn inspect<T>(&self, read: impl FnOnce(&PipelineState) -> T) -> T {
        self.coordinator.read_published(read)
    }
}
