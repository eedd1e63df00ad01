/// Allocator façade.
///
/// Builds the slab allocator and pool manager over the caller's memory
/// regions and dispatches every public operation. Pointer-keyed calls
/// (`free`, `get_alloc_info`) resolve the owning pool and class through
/// the slab header in constant time.
use std::ptr::NonNull;

use crate::class::{ReleaseMode, SlabReleaseContext};
use crate::error::{Error, Result};
use crate::pool::{
    generate_alloc_sizes, AllocatorStats, PoolManager, PoolStats, DEFAULT_MIN_ALLOC_SIZE,
    DEFAULT_SIZE_FACTOR,
};
use crate::slab::{ClassId, PoolId, SlabAllocator, SlabFlags, SLAB_SIZE};

/// Identity of one allocation, read straight from its slab header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocInfo {
    pub pool_id: PoolId,
    pub class_id: ClassId,
    pub alloc_size: u32,
}

/// Verdict returned by the `for_each_allocation` callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IterDecision {
    /// Keep going.
    Continue,
    /// Skip the rest of the current slab.
    SkipSlab,
    /// Abort the whole traversal.
    Stop,
}

/// Construction-time settings.
#[derive(Clone, Debug)]
pub struct MemoryAllocatorConfig {
    /// Chunk-size ladder for pools created without an explicit list.
    /// Ascending, aligned, each at most one slab.
    pub default_alloc_sizes: Vec<u32>,
}

impl Default for MemoryAllocatorConfig {
    fn default() -> Self {
        let default_alloc_sizes = generate_alloc_sizes(
            DEFAULT_SIZE_FACTOR,
            DEFAULT_MIN_ALLOC_SIZE,
            SLAB_SIZE as u32,
            true,
        )
        .expect("default ladder parameters");
        Self {
            default_alloc_sizes,
        }
    }
}

pub struct MemoryAllocator {
    slabs: SlabAllocator,
    pools: PoolManager,
    config: MemoryAllocatorConfig,
}

// All shared state sits behind the subsystem locks and header atomics;
// the raw region pointers are never handed out mutably.
unsafe impl Send for MemoryAllocator {}
unsafe impl Sync for MemoryAllocator {}

impl MemoryAllocator {
    /// Build an allocator over the caller's header and slab regions.
    ///
    /// # Safety
    ///
    /// Both regions must stay valid, unaliased, and untouched by the
    /// caller for the allocator's lifetime.
    pub unsafe fn new(
        config: MemoryAllocatorConfig,
        header_start: *mut u8,
        header_size: usize,
        slab_start: *mut u8,
        slab_size: usize,
    ) -> Result<Self> {
        let slabs = SlabAllocator::new(header_start, header_size, slab_start, slab_size)?;
        let total_usable = slabs.usable_slab_count() * SLAB_SIZE;
        Ok(Self {
            slabs,
            pools: PoolManager::new(total_usable),
            config,
        })
    }

    /// Create a named pool with `size` bytes of budget. `alloc_sizes`
    /// defaults to the configured ladder.
    pub fn add_pool(
        &self,
        name: &str,
        size: usize,
        alloc_sizes: Option<&[u32]>,
        ensure_provisionable: bool,
    ) -> Result<PoolId> {
        let sizes = alloc_sizes.unwrap_or(&self.config.default_alloc_sizes);
        self.pools.add_pool(name, size, sizes, ensure_provisionable)
    }

    pub fn get_pool_id(&self, name: &str) -> Result<PoolId> {
        self.pools.pool_by_name(name)
    }

    /// Serve `size` bytes from `pool`. `Ok(None)` means the pool is out
    /// of memory; the caller decides whether to shrink someone else.
    pub fn allocate(&self, pool: PoolId, size: usize) -> Result<Option<NonNull<u8>>> {
        self.pools.pool(pool)?.allocate(&self.slabs, size)
    }

    /// Return an allocation to its class, located via the slab header.
    pub fn free(&self, ptr: *mut u8) -> Result<()> {
        let index = self
            .slabs
            .slab_index_of(ptr)
            .ok_or(Error::ForeignPointer)?;
        let header = self.slabs.header(index);
        if !header.is_assigned() {
            return Err(Error::ForeignPointer);
        }
        let pool = self.pools.pool(header.pool())?;
        let class = pool.class(header.class())?;
        let base = self.slabs.slab_for_index(index)? as usize;
        class.free(ptr as usize, index, base)
    }

    /// Pool, class, and chunk size owning `ptr`.
    pub fn get_alloc_info(&self, ptr: *const u8) -> Result<AllocInfo> {
        let header = self
            .slabs
            .header_for_ptr(ptr)
            .ok_or(Error::ForeignPointer)?;
        if !header.is_assigned() {
            return Err(Error::ForeignPointer);
        }
        Ok(AllocInfo {
            pool_id: header.pool(),
            class_id: header.class(),
            alloc_size: header.alloc_size(),
        })
    }

    /// Smallest class of `pool` that fits `size`.
    pub fn classify(&self, pool: PoolId, size: usize) -> Result<ClassId> {
        self.pools.pool(pool)?.classify(size)
    }

    pub fn get_alloc_size(&self, pool: PoolId, class: ClassId) -> Result<u32> {
        self.pools.pool(pool)?.get_alloc_size(class)
    }

    pub fn grow_pool(&self, pool: PoolId, bytes: usize) -> Result<bool> {
        self.pools.grow_pool(pool, bytes)
    }

    pub fn shrink_pool(&self, pool: PoolId, bytes: usize) -> Result<bool> {
        self.pools.shrink_pool(pool, bytes)
    }

    pub fn resize_pools(&self, src: PoolId, dst: PoolId, bytes: usize) -> Result<bool> {
        self.pools.resize_pools(src, dst, bytes)
    }

    pub fn get_pools_over_limit(&self) -> Vec<PoolId> {
        self.pools.pools_over_limit()
    }

    /// Begin releasing one slab from `(pool, victim)`.
    ///
    /// Rebalance mode re-carves the slab into `receiver` once drained;
    /// resize mode hands it back for other pools. `hint` pins the victim
    /// to the slab containing it. `should_abort` is polled while the
    /// release start waits or scans; a true return abandons the start.
    pub fn start_slab_release(
        &self,
        pool: PoolId,
        victim: ClassId,
        receiver: Option<ClassId>,
        mode: ReleaseMode,
        hint: Option<*const u8>,
        should_abort: Option<&dyn Fn() -> bool>,
    ) -> Result<SlabReleaseContext> {
        let hint_slab = match hint {
            Some(ptr) => Some(
                self.slabs
                    .slab_index_of(ptr)
                    .ok_or(Error::ForeignPointer)?,
            ),
            None => None,
        };
        let (ctx, advised_cleared) = self.pools.pool(pool)?.start_slab_release(
            &self.slabs,
            victim,
            receiver,
            mode,
            hint_slab,
            should_abort,
        )?;
        if advised_cleared {
            self.pools.note_advised(false);
        }
        Ok(ctx)
    }

    /// If `ptr` is still live under `ctx`, run `f` on it and mark it
    /// quiesced. Returns whether `f` ran. `f` must not call back into
    /// the allocator.
    pub fn process_alloc_for_release(
        &self,
        ctx: &SlabReleaseContext,
        ptr: *mut u8,
        f: impl FnOnce(*mut u8),
    ) -> Result<bool> {
        if ctx.is_released() || self.slabs.slab_index_of(ptr) != Some(ctx.slab_index()) {
            return Ok(false);
        }
        let pool = self.pools.pool(ctx.pool_id())?;
        pool.class(ctx.victim_class())?
            .process_for_release(ctx, ptr as usize, f)
    }

    /// True iff `ptr` lies in the releasing slab and no caller holds it.
    pub fn is_alloc_free(&self, ctx: &SlabReleaseContext, ptr: *const u8) -> Result<bool> {
        if self.slabs.slab_index_of(ptr) != Some(ctx.slab_index()) {
            return Ok(false);
        }
        if ctx.is_released() {
            return Ok(true);
        }
        let base = self.slabs.slab_for_index(ctx.slab_index())? as usize;
        let pool = self.pools.pool(ctx.pool_id())?;
        pool.class(ctx.victim_class())?
            .is_alloc_free(ctx, ptr as usize, base)
    }

    pub fn all_allocs_freed(&self, ctx: &SlabReleaseContext) -> Result<bool> {
        Ok(self.live_allocation_count(ctx)? == 0)
    }

    /// Allocations still held by callers under `ctx`.
    pub fn live_allocation_count(&self, ctx: &SlabReleaseContext) -> Result<usize> {
        if ctx.is_released() {
            return Ok(0);
        }
        let pool = self.pools.pool(ctx.pool_id())?;
        pool.class(ctx.victim_class())?.live_count(ctx)
    }

    /// Block until every live allocation in the context's slab is freed,
    /// then move the slab to its destination. Consumes the context.
    pub fn complete_slab_release(&self, ctx: SlabReleaseContext) -> Result<()> {
        let advised_cleared = self
            .pools
            .pool(ctx.pool_id())?
            .complete_slab_release(&self.slabs, &ctx)?;
        if advised_cleared {
            self.pools.note_advised(false);
        }
        Ok(())
    }

    /// Cancel a pending release and return the slab to serving.
    /// Allocations freed while the release was pending stay free. Fails
    /// once the live set has drained; complete the release instead.
    pub fn abort_slab_release(&self, ctx: &SlabReleaseContext) -> Result<()> {
        self.pools
            .pool(ctx.pool_id())?
            .abort_slab_release(&self.slabs, ctx)
    }

    /// Walk every chunk of every serving slab. Slabs that are unassigned,
    /// advised, or mid-release are skipped; their count is returned. The
    /// callback sees allocated and free chunks alike.
    pub fn for_each_allocation(
        &self,
        mut f: impl FnMut(*mut u8, u32) -> IterDecision,
    ) -> usize {
        let mut skipped = 0;
        for index in 0..self.slabs.usable_slab_count() {
            let header = self.slabs.header(index);
            let flags = header.flags();
            if !header.is_assigned()
                || flags.intersects(SlabFlags::ADVISED | SlabFlags::MARKED_FOR_RELEASE)
            {
                skipped += 1;
                continue;
            }
            let alloc_size = header.alloc_size();
            if alloc_size == 0 {
                // Racing reset between the assignment check and here.
                skipped += 1;
                continue;
            }
            let base = match self.slabs.slab_for_index(index) {
                Ok(base) => base,
                Err(_) => break,
            };
            for k in 0..SLAB_SIZE / alloc_size as usize {
                let ptr = unsafe { base.add(k * alloc_size as usize) };
                match f(ptr, alloc_size) {
                    IterDecision::Continue => {}
                    IterDecision::SkipSlab => break,
                    IterDecision::Stop => return skipped,
                }
            }
        }
        skipped
    }

    /// Record that the slab containing `ptr` had its physical memory
    /// handed to (or reclaimed from) the OS. Returns whether the flag
    /// changed. The slab stays logically owned; traversals skip it and
    /// release-victim selection refuses it until un-advised. Advising a
    /// slab whose release is already pending is allowed; the flag and
    /// its accounting are reconciled when the slab is disposed of.
    pub fn mark_slab_advised(&self, ptr: *const u8, advised: bool) -> Result<bool> {
        let index = self
            .slabs
            .slab_index_of(ptr)
            .ok_or(Error::ForeignPointer)?;
        if !self.slabs.header(index).is_assigned() {
            return Err(Error::ForeignPointer);
        }
        let changed = self.slabs.try_set_advised(index, advised);
        if changed {
            self.pools.note_advised(advised);
        }
        Ok(changed)
    }

    pub fn usable_slab_count(&self) -> usize {
        self.slabs.usable_slab_count()
    }

    pub fn all_slabs_allocated(&self) -> bool {
        self.slabs.all_slabs_allocated()
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            usable_slabs: self.slabs.usable_slab_count(),
            free_slabs: self.slabs.free_slab_count(),
            bytes_unreserved: self.pools.bytes_unreserved(),
            bytes_advised: self.pools.bytes_advised(),
        }
    }

    pub fn pool_stats(&self, pool: PoolId) -> Result<PoolStats> {
        Ok(self.pools.pool(pool)?.stats())
    }

    /// Bytes not yet promised to any pool.
    pub fn bytes_unreserved(&self) -> usize {
        self.pools.bytes_unreserved()
    }

    /// Total bytes the slab region can serve.
    pub fn total_usable_bytes(&self) -> usize {
        self.pools.total_usable()
    }
}
