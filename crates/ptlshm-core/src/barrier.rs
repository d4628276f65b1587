//! Process-wide init/fini barrier around the communication pad
//!
//! Any number of threads may call [`InitBarrier::acquire`] concurrently. The
//! first caller of a cycle becomes the leader: it reads the launch
//! parameters, maps the pad, announces its arrival and waits for every
//! sibling process to do the same. Everyone else waits for the leader to
//! publish the outcome and shares it, success or failure. The last
//! [`release`](InitBarrier::release) unmaps the pad and resets the barrier so
//! a later cycle can start over.
//!
//! Reference count and phase live in a single atomic word so that election,
//! joining and teardown are each decided by one compare-and-swap.

use crate::layout::RegionLayout;
use crate::params::{page_size, LaunchParams, NiLimits};
use crate::region::CommPad;
use crate::wait::{Spin, WaitStrategy};
use crate::{Error, Result};
use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const COUNT_MASK: u64 = u32::MAX as u64;
const PHASE_SHIFT: u32 = 32;

/// Lifecycle phase of the process-wide state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Uninitialized = 0,
    /// A leader has been elected and is setting up the pad
    Racing = 1,
    Ready = 2,
    Failed = 3,
    /// The last reference is gone and the pad is being unmapped
    TearingDown = 4,
}

impl Phase {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Phase::Uninitialized),
            1 => Some(Phase::Racing),
            2 => Some(Phase::Ready),
            3 => Some(Phase::Failed),
            4 => Some(Phase::TearingDown),
            _ => None,
        }
    }
}

fn pack(phase: Phase, count: u32) -> u64 {
    ((phase as u64) << PHASE_SHIFT) | count as u64
}

fn unpack(word: u64) -> (Phase, u32) {
    // only `pack` ever writes the word
    let phase = Phase::from_u8((word >> PHASE_SHIFT) as u8).unwrap_or(Phase::Uninitialized);
    (phase, (word & COUNT_MASK) as u32)
}

/// Counters for observing the exactly-once guarantees
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierStats {
    pub leader_elections: usize,
    pub mappings_created: usize,
    pub mappings_released: usize,
}

#[derive(Default)]
struct StatCounters {
    leader_elections: AtomicUsize,
    mappings_created: AtomicUsize,
    mappings_released: AtomicUsize,
}

/// Everything the leader publishes to the other callers of its cycle
struct Published {
    pad: CommPad,
    params: LaunchParams,
    limits: NiLimits,
}

/// Reference-counted init/fini barrier
pub struct InitBarrier<W = Spin> {
    state: AtomicU64,
    // Written only by the leader while Racing, taken only by the last
    // releaser while TearingDown. Read only by holders of a reference after
    // an acquire load has observed Ready.
    published: UnsafeCell<Option<Published>>,
    // Same discipline, with Failed in place of Ready.
    failure: UnsafeCell<Option<Error>>,
    wait: W,
    stats: StatCounters,
}

// SAFETY: the cells are only touched under the phase discipline above.
unsafe impl<W: Sync> Sync for InitBarrier<W> {}

impl InitBarrier<Spin> {
    /// A barrier that busy-waits
    pub const fn new() -> Self {
        Self::with_wait(Spin)
    }
}

impl Default for InitBarrier<Spin> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> InitBarrier<W> {
    /// A barrier that waits with the given strategy
    pub const fn with_wait(wait: W) -> Self {
        Self {
            state: AtomicU64::new(0),
            published: UnsafeCell::new(None),
            failure: UnsafeCell::new(None),
            wait,
            stats: StatCounters {
                leader_elections: AtomicUsize::new(0),
                mappings_created: AtomicUsize::new(0),
                mappings_released: AtomicUsize::new(0),
            },
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// Number of outstanding references
    pub fn ref_count(&self) -> usize {
        unpack(self.state.load(Ordering::Acquire)).1 as usize
    }

    pub fn stats(&self) -> BarrierStats {
        BarrierStats {
            leader_elections: self.stats.leader_elections.load(Ordering::Relaxed),
            mappings_created: self.stats.mappings_created.load(Ordering::Relaxed),
            mappings_released: self.stats.mappings_released.load(Ordering::Relaxed),
        }
    }

    /// Take a further reference on an already initialized pad
    ///
    /// Unlike [`acquire`](Self::acquire) this never starts a cycle.
    pub fn join(&self) -> Result<PadGuard<'_, W>> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let (phase, count) = unpack(cur);
            if phase != Phase::Ready {
                return Err(Error::LifecycleMisuse("communication pad is not initialized"));
            }
            if count == u32::MAX {
                return Err(Error::LifecycleMisuse("reference count overflow"));
            }
            match self.state.compare_exchange_weak(
                cur,
                pack(phase, count + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return self.guard(),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Give back one reference; the last one unmaps the pad
    ///
    /// Only needed for references kept alive with [`PadGuard::forget`].
    pub fn release(&self) -> Result<()> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let (phase, count) = unpack(cur);
            if count == 0 {
                tracing::warn!(?phase, "release without an outstanding reference");
                return Err(Error::LifecycleMisuse("release without a matching acquire"));
            }
            let last = count == 1;
            if last && phase == Phase::Racing {
                // the only reference belongs to a leader still setting up
                tracing::warn!("release while initialization is in progress");
                return Err(Error::LifecycleMisuse("release during initialization"));
            }
            let next = if last {
                pack(Phase::TearingDown, 0)
            } else {
                pack(phase, count - 1)
            };
            match self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if last {
                        self.teardown(phase);
                    }
                    return Ok(());
                }
                Err(actual) => cur = actual,
            }
        }
    }

    fn teardown(&self, from: Phase) {
        // SAFETY: phase is TearingDown with no references: no guard exists,
        // and acquirers spin until the reset below.
        let published = unsafe { (*self.published.get()).take() };
        let failure = unsafe { (*self.failure.get()).take() };

        if let Some(published) = published {
            published.pad.close();
            self.stats.mappings_released.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(?from, failed = failure.is_some(), "init barrier reset");

        self.state
            .store(pack(Phase::Uninitialized, 0), Ordering::Release);
    }

    /// Increment the count, returning whether this caller leads the cycle
    fn enter(&self) -> Result<bool> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            let (phase, count) = unpack(cur);
            let next = match phase {
                Phase::TearingDown => {
                    std::hint::spin_loop();
                    cur = self.state.load(Ordering::Acquire);
                    continue;
                }
                Phase::Uninitialized => pack(Phase::Racing, 1),
                _ if count == u32::MAX => {
                    return Err(Error::LifecycleMisuse("reference count overflow"));
                }
                _ => pack(phase, count + 1),
            };
            match self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(phase == Phase::Uninitialized),
                Err(actual) => cur = actual,
            }
        }
    }

    fn publish_phase(&self, phase: Phase) {
        // the count may move under us; only the phase bits change
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(pack(phase, unpack(word).1))
            });
    }

    fn guard(&self) -> Result<PadGuard<'_, W>> {
        // SAFETY: the caller holds a reference and has observed Ready.
        match unsafe { (*self.published.get()).as_ref() } {
            Some(published) => Ok(PadGuard {
                barrier: self,
                published,
            }),
            None => {
                self.release()?;
                Err(Error::InitFailed("no communication pad published".to_string()))
            }
        }
    }
}

impl<W: WaitStrategy> InitBarrier<W> {
    /// Acquire using the launch parameters from the process environment
    pub fn acquire(&self) -> Result<PadGuard<'_, W>> {
        self.acquire_with(LaunchParams::from_env)
    }

    /// Acquire a reference, initializing the pad if this caller is first
    ///
    /// `load` runs only on the leader.
    pub fn acquire_with<F>(&self, load: F) -> Result<PadGuard<'_, W>>
    where
        F: FnOnce() -> Result<LaunchParams>,
    {
        if self.enter()? {
            self.lead(load)
        } else {
            self.follow()
        }
    }

    fn lead<F>(&self, load: F) -> Result<PadGuard<'_, W>>
    where
        F: FnOnce() -> Result<LaunchParams>,
    {
        self.stats.leader_elections.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("elected init leader");

        match self.initialize(load) {
            Ok(published) => {
                // SAFETY: phase is Racing and we are the leader.
                unsafe { *self.published.get() = Some(published) };
                self.publish_phase(Phase::Ready);
                tracing::debug!("communication pad ready");
                self.guard()
            }
            Err(err) => {
                tracing::warn!(error = %err, "initialization failed");
                // SAFETY: as above.
                unsafe { *self.failure.get() = Some(err.clone()) };
                self.publish_phase(Phase::Failed);
                self.release()?;
                Err(err)
            }
        }
    }

    fn initialize<F>(&self, load: F) -> Result<Published>
    where
        F: FnOnce() -> Result<LaunchParams>,
    {
        let params = load()?;
        let layout = RegionLayout::for_params(&params, page_size())?;
        let pad = CommPad::open(&params.shm_name, layout)?;
        self.stats.mappings_created.fetch_add(1, Ordering::Relaxed);

        let arrived = pad.announce(params.rank).and_then(|_| {
            tracing::debug!(
                rank = params.rank,
                siblings = params.num_siblings,
                "waiting for siblings"
            );
            self.wait.wait_until(&mut || pad.all_arrived())
        });
        if let Err(err) = arrived {
            tracing::debug!(pending = ?pad.pending(), "giving up on siblings");
            pad.close();
            self.stats.mappings_released.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        let limits = params.limits();
        Ok(Published {
            pad,
            params,
            limits,
        })
    }

    fn follow(&self) -> Result<PadGuard<'_, W>> {
        let mut outcome = Phase::Racing;
        let waited = self.wait.wait_until(&mut || {
            outcome = unpack(self.state.load(Ordering::Acquire)).0;
            matches!(outcome, Phase::Ready | Phase::Failed)
        });
        if let Err(err) = waited {
            self.release()?;
            return Err(err);
        }

        if outcome == Phase::Ready {
            return self.guard();
        }

        // SAFETY: we hold a reference and observed Failed.
        let err = unsafe { (*self.failure.get()).clone() }
            .unwrap_or_else(|| Error::InitFailed("no failure recorded".to_string()));
        self.release()?;
        Err(err)
    }
}

/// A live reference on the communication pad
///
/// Dropping the guard releases the reference.
pub struct PadGuard<'a, W = Spin> {
    barrier: &'a InitBarrier<W>,
    published: &'a Published,
}

impl<'a, W> PadGuard<'a, W> {
    /// Launch parameters the pad was set up with
    ///
    /// The reference lives only as long as the guard:
    ///
    /// ```compile_fail
    /// let params = ptlshm_core::with_comm_pad(|pad| pad.params());
    /// ```
    pub fn params(&self) -> &LaunchParams {
        &self.published.params
    }

    pub fn limits(&self) -> &NiLimits {
        &self.published.limits
    }

    pub fn rank(&self) -> usize {
        self.published.params.rank
    }

    /// Keep the reference outstanding after the guard is gone
    ///
    /// Pair with a later [`InitBarrier::release`].
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl<W> Deref for PadGuard<'_, W> {
    type Target = CommPad;

    fn deref(&self) -> &CommPad {
        &self.published.pad
    }
}

impl<W> Drop for PadGuard<'_, W> {
    fn drop(&mut self) {
        if let Err(err) = self.barrier.release() {
            tracing::warn!(error = %err, "failed to release communication pad");
        }
    }
}

static PROCESS: InitBarrier = InitBarrier::new();

/// The barrier shared by the whole process image
pub fn process_barrier() -> &'static InitBarrier {
    &PROCESS
}

/// Initialize the library for this process from the launch environment
///
/// Every successful call must be matched by a call to [`fini`].
pub fn init() -> Result<()> {
    PROCESS.acquire()?.forget();
    Ok(())
}

/// Drop one reference taken by [`init`]
pub fn fini() -> Result<()> {
    PROCESS.release()
}

/// Run `f` against the process-wide pad, which must already be initialized
pub fn with_comm_pad<R, F>(f: F) -> Result<R>
where
    F: FnOnce(&PadGuard<'static>) -> R,
{
    let guard = PROCESS.join()?;
    Ok(f(&guard))
}
