//! Double-buffered configuration
//!
//! Two [`PipelineState`] instances live behind their own mutex. An atomic
//! selector names the active one:
//! - The audio context only `try_lock`s the active slot ([`ConfigSwapCoordinator::get_active`])
//!   and never blocks. If it cannot get the slot, the caller emits silence.
//! - The control context edits the inactive slot ([`ConfigSwapCoordinator::get_inactive`])
//!   and publishes it with [`ConfigSwapCoordinator::swap`].
//!
//! The control context never locks the active slot outside a swap. A third,
//! control-owned copy of the last published configuration serves clones
//! ([`ConfigSwapCoordinator::clone_active_into_inactive`]) and reads
//! ([`ConfigSwapCoordinator::read_published`]).
//!
//! A swap raises a publishing flag and only proceeds when no audio reader is
//! counted; readers arriving meanwhile wait for the flag to drop. It then
//! carries runtime state (filter memories, envelopes, pool contents) from the
//! old active instance into the new one and flips the selector with a single
//! release store. Contention never blocks the caller indefinitely: it comes
//! back as [`DspError::SwapBusy`] or [`DspError::SwapTimeout`] and is counted
//! in [`SwapHealth`].
//!
//! # Deadlocks
//! [`InactiveConfig`] holds the coordinator's swap lock for as long as it
//! lives. Calling any coordinator method that takes the inactive slot
//! (`get_inactive`, the CRUD wrappers, `clone_active_into_inactive`) while a
//! guard is alive on the same thread deadlocks; `swap` returns `SwapBusy`.

use crate::domain::error::{DspError, Result};
use crate::domain::stage::StageType;
use crate::domain::state::PipelineState;
use crossbeam::utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Spins the audio context waits out a publish before giving up on a buffer
const PUBLISH_WAIT_SPINS: usize = 4096;

/// Bounds on how long control operations wait for the audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwapPolicy {
    /// How long `swap` waits for a concurrent swap or edit session
    pub lock_timeout_ms: u64,
    /// Waits for the audio context before giving up
    pub wait_iterations: u32,
    pub wait_interval_ms: u64,
}

impl Default for SwapPolicy {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5,
            wait_iterations: 100,
            wait_interval_ms: 1,
        }
    }
}

impl SwapPolicy {
    fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }
}

/// Outcome of one step of the swap wait loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapDecision {
    /// Safe to migrate and publish
    Success,
    /// Another swap or edit session holds the lock
    Busy,
    /// The audio context stayed busy for every allowed wait
    Timeout,
    /// The audio context is busy; wait and ask again
    StillWaiting,
}

/// Pure decision table behind [`ConfigSwapCoordinator::swap`]
pub fn swap_decision(lock_acquired: bool, processing_active: bool, retries_remaining: u32) -> SwapDecision {
    match (lock_acquired, processing_active, retries_remaining) {
        (false, _, _) => SwapDecision::Busy,
        (true, true, 0) => SwapDecision::Timeout,
        (true, true, _) => SwapDecision::StillWaiting,
        (true, false, _) => SwapDecision::Success,
    }
}

/// Swap counters, surfaced as a health signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SwapHealth {
    pub successes: u64,
    pub failures: u64,
    /// Time of the last failure, measured from coordinator creation
    pub last_failure: Option<Duration>,
}

// ============================================================================
// GUARDS
// ============================================================================

/// Audio-context access to the active state; uncounts the reader on drop
pub struct ActiveConfig<'a> {
    state: MutexGuard<'a, PipelineState>,
    processing: &'a AtomicUsize,
}

impl Deref for ActiveConfig<'_> {
    type Target = PipelineState;

    fn deref(&self) -> &PipelineState {
        &self.state
    }
}

impl DerefMut for ActiveConfig<'_> {
    fn deref_mut(&mut self) -> &mut PipelineState {
        &mut self.state
    }
}

impl Drop for ActiveConfig<'_> {
    fn drop(&mut self) {
        self.processing.fetch_sub(1, Ordering::Release);
    }
}

/// Control-context edit session on the inactive state
///
/// Holds the swap lock, so the slot cannot become active underneath it.
pub struct InactiveConfig<'a> {
    state: MutexGuard<'a, PipelineState>,
    _swap: MutexGuard<'a, ()>,
}

impl Deref for InactiveConfig<'_> {
    type Target = PipelineState;

    fn deref(&self) -> &PipelineState {
        &self.state
    }
}

impl DerefMut for InactiveConfig<'_> {
    fn deref_mut(&mut self) -> &mut PipelineState {
        &mut self.state
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct ConfigSwapCoordinator {
    states: [Mutex<PipelineState>; 2],
    active: CachePadded<AtomicUsize>,
    /// Audio readers between `get_active` and the guard's drop
    processing: CachePadded<AtomicUsize>,
    /// Raised by `swap` while it inspects readers and flips the selector
    publishing: CachePadded<AtomicBool>,
    /// Configuration of the active slot as last published
    published: Mutex<PipelineState>,
    /// Copy of the slot being published; becomes `published` on success
    staged: Mutex<PipelineState>,
    swap_lock: Mutex<()>,
    policy: SwapPolicy,
    created: Instant,
    successes: AtomicU64,
    failures: AtomicU64,
    /// Milliseconds since `created` plus one; zero means no failure yet
    last_failure_ms: AtomicU64,
}

impl ConfigSwapCoordinator {
    /// Every copy starts as `initial`; slot 0 is active
    pub fn new(initial: PipelineState, policy: SwapPolicy) -> Self {
        let copy = |from: &PipelineState| {
            let mut state = PipelineState::new(from.sample_rate());
            state.copy_from(from);
            state
        };
        let (inactive, published) = (copy(&initial), copy(&initial));
        Self {
            states: [Mutex::new(initial), Mutex::new(inactive)],
            active: CachePadded::new(AtomicUsize::new(0)),
            processing: CachePadded::new(AtomicUsize::new(0)),
            publishing: CachePadded::new(AtomicBool::new(false)),
            staged: Mutex::new(PipelineState::new(published.sample_rate())),
            published: Mutex::new(published),
            swap_lock: Mutex::new(()),
            policy,
            created: Instant::now(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> SwapPolicy {
        self.policy
    }

    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// True while the audio context holds the active state
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire) > 0
    }

    /// Audio context: the active state, or `None` if it is momentarily held elsewhere
    ///
    /// Never blocks. A publish in progress is waited out for a bounded
    /// number of spins; the index is loaded only once it is over.
    pub fn get_active(&self) -> Option<ActiveConfig<'_>> {
        self.processing.fetch_add(1, Ordering::SeqCst);
        let mut spins = 0;
        while self.publishing.load(Ordering::SeqCst) {
            if spins == PUBLISH_WAIT_SPINS {
                self.processing.fetch_sub(1, Ordering::Release);
                return None;
            }
            spins += 1;
            std::hint::spin_loop();
        }
        let index = self.active.load(Ordering::Acquire);
        match self.states[index].try_lock() {
            Some(state) => Some(ActiveConfig {
                state,
                processing: &self.processing,
            }),
            // Another audio reader holds the slot
            None => {
                self.processing.fetch_sub(1, Ordering::Release);
                None
            }
        }
    }

    /// Control context: open an edit session on the inactive state
    pub fn get_inactive(&self) -> InactiveConfig<'_> {
        let swap = self.swap_lock.lock();
        let index = 1 - self.active.load(Ordering::Acquire);
        InactiveConfig {
            state: self.states[index].lock(),
            _swap: swap,
        }
    }

    /// Deep-copy the published configuration (chains and pool contents) into the inactive state
    ///
    /// Reads the control-owned copy, so it never contends with the audio context.
    pub fn clone_active_into_inactive(&self) {
        let _swap = self.swap_lock.lock();
        let inactive_index = 1 - self.active.load(Ordering::Acquire);
        let mut inactive = self.states[inactive_index].lock();
        inactive.copy_from(&self.published.lock());
        debug!(inactive = inactive_index, "Published state cloned into inactive");
    }

    /// Run `read` against the last published configuration
    ///
    /// Runtime fields (filter memories, envelopes) in the copy are not live.
    pub fn read_published<T>(&self, read: impl FnOnce(&PipelineState) -> T) -> T {
        read(&self.published.lock())
    }

    /// Publish the inactive state
    ///
    /// Runtime state of every stage that kept its type and position is
    /// carried over first, so the audio context continues without a
    /// discontinuity.
    pub fn swap(&self) -> Result<()> {
        let Some(_swap) = self.swap_lock.try_lock_for(self.policy.lock_timeout()) else {
            return Err(self.record_failure(SwapDecision::Busy));
        };

        let old = self.active.load(Ordering::Acquire);
        let new = 1 - old;
        let mut next = self.states[new].lock();
        self.staged.lock().copy_from(&next);

        let mut remaining = self.policy.wait_iterations;
        loop {
            self.publishing.store(true, Ordering::SeqCst);
            let processing = self.processing.load(Ordering::SeqCst) > 0;
            match swap_decision(true, processing, remaining) {
                SwapDecision::Success => {
                    // A reader that just dropped its count may still be unlocking
                    if let Some(previous) = self.states[old].try_lock() {
                        next.carry_runtime_from(&previous);
                        self.active.store(new, Ordering::Release);
                        drop(previous);
                        drop(next);
                        self.publishing.store(false, Ordering::SeqCst);

                        std::mem::swap(&mut *self.published.lock(), &mut *self.staged.lock());
                        self.successes.fetch_add(1, Ordering::Relaxed);
                        info!(active = new, "Configuration swapped");
                        return Ok(());
                    }
                    self.publishing.store(false, Ordering::SeqCst);
                    if remaining == 0 {
                        return Err(self.record_failure(SwapDecision::Timeout));
                    }
                }
                SwapDecision::StillWaiting => self.publishing.store(false, Ordering::SeqCst),
                decision @ (SwapDecision::Busy | SwapDecision::Timeout) => {
                    self.publishing.store(false, Ordering::SeqCst);
                    return Err(self.record_failure(decision));
                }
            }
            remaining -= 1;
            std::thread::sleep(self.policy.wait_interval());
        }
    }

    fn record_failure(&self, decision: SwapDecision) -> DspError {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_failure_ms.store(elapsed + 1, Ordering::Relaxed);
        match decision {
            SwapDecision::Timeout => {
                error!(
                    waits = self.policy.wait_iterations,
                    "Swap timed out, audio context busy"
                );
                DspError::SwapTimeout
            }
            _ => {
                warn!("Swap failed, lock busy");
                DspError::SwapBusy
            }
        }
    }

    pub fn health(&self) -> SwapHealth {
        let last = self.last_failure_ms.load(Ordering::Relaxed);
        SwapHealth {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_failure: (last > 0).then(|| Duration::from_millis(last - 1)),
        }
    }

    // ------------------------------------------------------------------------
    // Inactive-state wrappers
    // ------------------------------------------------------------------------

    /// Run `edit` against the inactive state
    pub fn edit<T>(&self, edit: impl FnOnce(&mut PipelineState) -> T) -> T {
        let mut inactive = self.get_inactive();
        edit(&mut inactive)
    }

    pub fn add_stage(
        &self,
        channel: usize,
        stage_type: StageType,
        position: Option<usize>,
    ) -> Result<usize> {
        self.edit(|state| state.add_stage(channel, stage_type, position))
    }

    pub fn remove_stage(&self, channel: usize, index: usize) -> Result<()> {
        self.edit(|state| state.remove_stage(channel, index).map(|_| ()))
    }

    pub fn reorder_stages(&self, channel: usize, order: &[usize]) -> Result<()> {
        self.edit(|state| state.reorder_stages(channel, order))
    }

    pub fn set_stage_enabled(&self, channel: usize, index: usize, enabled: bool) -> Result<()> {
        self.edit(|state| state.set_stage_enabled(channel, index, enabled))
    }
}
