/// Memory pool: a named budget of slabs divided across allocation
/// classes.
///
/// Classes are fixed at pool creation and ordered by ascending chunk
/// size; requests route to the smallest class that fits. The pool grows
/// one slab at a time against its byte budget and shrinks lazily through
/// slab releases.
mod manager;
mod sizes;

pub(crate) use manager::PoolManager;
pub use manager::AllocatorStats;
pub use sizes::{generate_alloc_sizes, DEFAULT_MIN_ALLOC_SIZE, DEFAULT_SIZE_FACTOR};

use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::debug;

use crate::class::{AllocationClass, ReleaseMode, SlabReleaseContext, StartOutcome};
use crate::error::{Error, Result};
use crate::slab::{ClassId, PoolId, SlabAllocator, SLAB_SIZE};

/// Point-in-time snapshot of one pool's budget.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub pool_id: PoolId,
    pub name: String,
    pub target_size_bytes: usize,
    pub current_size_bytes: usize,
    pub class_count: usize,
    /// Whole slabs the pool could still claim before hitting its target.
    pub free_slab_headroom: usize,
}

#[derive(Debug)]
struct PoolBudget {
    target_size: usize,
    current_size: usize,
}

#[derive(Debug)]
pub(crate) struct MemoryPool {
    id: PoolId,
    name: String,
    /// Ascending by `alloc_size`; index == `ClassId`. Fixed after
    /// construction.
    classes: Vec<AllocationClass>,
    budget: Mutex<PoolBudget>,
}

impl MemoryPool {
    pub(crate) fn new(id: PoolId, name: String, target_size: usize, alloc_sizes: &[u32]) -> Self {
        let classes = alloc_sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| AllocationClass::new(id, ClassId(i as u8), size))
            .collect();
        Self {
            id,
            name,
            classes,
            budget: Mutex::new(PoolBudget {
                target_size,
                current_size: 0,
            }),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> PoolId {
        self.id
    }

    pub(crate) fn class(&self, id: ClassId) -> Result<&AllocationClass> {
        self.classes
            .get(id.0 as usize)
            .ok_or(Error::UnknownClass(id.0))
    }

    /// Smallest class whose chunk size fits `size`.
    pub(crate) fn classify(&self, size: usize) -> Result<ClassId> {
        self.classes
            .iter()
            .position(|c| c.alloc_size() as usize >= size)
            .map(|i| ClassId(i as u8))
            .ok_or_else(|| Error::SizeTooLarge {
                size,
                largest: self.largest_alloc_size(),
            })
    }

    pub(crate) fn get_alloc_size(&self, id: ClassId) -> Result<u32> {
        Ok(self.class(id)?.alloc_size())
    }

    fn largest_alloc_size(&self) -> usize {
        self.classes
            .last()
            .map(|c| c.alloc_size() as usize)
            .unwrap_or(0)
    }

    /// Serve `size` bytes from the fitting class, claiming a fresh slab
    /// from the slab allocator if the budget allows. `Ok(None)` means the
    /// pool is out of memory.
    pub(crate) fn allocate(
        &self,
        slabs: &SlabAllocator,
        size: usize,
    ) -> Result<Option<NonNull<u8>>> {
        let class = self.class(self.classify(size)?)?;

        if let Some(ptr) = class.pop_free() {
            return Ok(Some(ptr));
        }

        let mut budget = self.budget.lock();
        // Another thread may have carved a slab while we waited for the
        // budget lock.
        if let Some(ptr) = class.pop_free() {
            return Ok(Some(ptr));
        }
        if budget.current_size + SLAB_SIZE > budget.target_size {
            return Ok(None);
        }
        let Some(slab_index) = slabs.acquire_free_slab() else {
            return Ok(None);
        };
        budget.current_size += SLAB_SIZE;
        drop(budget);

        let was_advised = slabs.assign_slab(slab_index, self.id, class.id(), class.alloc_size());
        debug_assert!(
            !was_advised,
            "free slab {} carried the advised flag",
            slab_index
        );
        let base = slabs.slab_for_index(slab_index)?;
        class.adopt_slab(slab_index, base);

        debug!(
            pool = self.id.0,
            class = class.id().0,
            slab = slab_index,
            alloc_size = class.alloc_size(),
            "assigned slab to class"
        );
        Ok(class.pop_free())
    }

    pub(crate) fn grow_target(&self, bytes: usize) {
        self.budget.lock().target_size += bytes;
    }

    /// Shrink the target by `bytes` if the target covers it.
    pub(crate) fn try_shrink_target(&self, bytes: usize) -> bool {
        let mut budget = self.budget.lock();
        if bytes > budget.target_size {
            return false;
        }
        budget.target_size -= bytes;
        true
    }

    pub(crate) fn target_size(&self) -> usize {
        self.budget.lock().target_size
    }

    pub(crate) fn current_size(&self) -> usize {
        self.budget.lock().current_size
    }

    pub(crate) fn is_over_limit(&self) -> bool {
        let budget = self.budget.lock();
        budget.current_size > budget.target_size
    }

    /// True when the pool cannot claim another slab within its target.
    pub(crate) fn all_slabs_allocated(&self) -> bool {
        let budget = self.budget.lock();
        budget.current_size + SLAB_SIZE > budget.target_size
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let budget = self.budget.lock();
        PoolStats {
            pool_id: self.id,
            name: self.name.clone(),
            target_size_bytes: budget.target_size,
            current_size_bytes: budget.current_size,
            class_count: self.classes.len(),
            free_slab_headroom: budget.target_size.saturating_sub(budget.current_size)
                / SLAB_SIZE,
        }
    }

    /// Begin releasing one slab from `victim`. For rebalance releases the
    /// slab will re-carve into `receiver`; for resize releases it returns
    /// to the slab allocator. If the slab has no live allocations the
    /// disposition happens before this returns. The second value reports
    /// whether disposing cleared an advised flag the caller must account
    /// for.
    pub(crate) fn start_slab_release(
        &self,
        slabs: &SlabAllocator,
        victim: ClassId,
        receiver: Option<ClassId>,
        mode: ReleaseMode,
        hint_slab: Option<usize>,
        should_abort: Option<&dyn Fn() -> bool>,
    ) -> Result<(SlabReleaseContext, bool)> {
        match (mode, receiver) {
            (ReleaseMode::Rebalance, Some(r)) => {
                if r == victim {
                    return Err(Error::BadReleaseTarget);
                }
                self.class(r)?;
            }
            (ReleaseMode::Resize, None) => {}
            _ => return Err(Error::BadReleaseTarget),
        }

        let outcome =
            self.class(victim)?
                .start_release(slabs, mode, receiver, hint_slab, should_abort);
        match outcome? {
            StartOutcome::Pending(ctx) => Ok((ctx, false)),
            StartOutcome::Drained(ctx) => {
                let advised_cleared = self.dispose_released_slab(slabs, &ctx)?;
                Ok((ctx, advised_cleared))
            }
        }
    }

    /// Block until the context's live allocations drain, then dispose of
    /// the slab. No-op for contexts released at start time. Returns
    /// whether disposing cleared an advised flag the caller must account
    /// for.
    pub(crate) fn complete_slab_release(
        &self,
        slabs: &SlabAllocator,
        ctx: &SlabReleaseContext,
    ) -> Result<bool> {
        if ctx.is_released() {
            return Ok(false);
        }
        self.class(ctx.victim_class())?.wait_release_drained(ctx)?;
        self.dispose_released_slab(slabs, ctx)
    }

    /// Hand a fully drained slab to its destination: the slab allocator
    /// (resize) or the receiver class (rebalance). Returns whether the
    /// header's advised flag was cleared in the process; victim selection
    /// refuses advised slabs, but a slab may be advised while its release
    /// is already pending.
    fn dispose_released_slab(
        &self,
        slabs: &SlabAllocator,
        ctx: &SlabReleaseContext,
    ) -> Result<bool> {
        let advised_cleared = match ctx.mode() {
            ReleaseMode::Resize => {
                self.budget.lock().current_size -= SLAB_SIZE;
                slabs.release_slab(ctx.slab_index())
            }
            ReleaseMode::Rebalance => {
                let receiver = self.class(ctx.receiver_class().ok_or(Error::BadReleaseTarget)?)?;
                let cleared = slabs.assign_slab(
                    ctx.slab_index(),
                    self.id,
                    receiver.id(),
                    receiver.alloc_size(),
                );
                let base = slabs.slab_for_index(ctx.slab_index())?;
                receiver.adopt_slab(ctx.slab_index(), base);
                cleared
            }
        };
        debug!(
            pool = self.id.0,
            slab = ctx.slab_index(),
            mode = ?ctx.mode(),
            "completed slab release"
        );
        Ok(advised_cleared)
    }

    pub(crate) fn abort_slab_release(
        &self,
        slabs: &SlabAllocator,
        ctx: &SlabReleaseContext,
    ) -> Result<()> {
        if ctx.is_released() {
            return Err(Error::ReleaseAlreadyDrained);
        }
        self.class(ctx.victim_class())?
            .abort_release(slabs, ctx)
            .map(|_| ())
    }
}
