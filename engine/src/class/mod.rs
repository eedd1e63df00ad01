/// Allocation class: per-size free-list manager inside one pool.
///
/// A class owns a set of slabs, all carved into chunks of one fixed
/// `alloc_size`. The free list is a LIFO stack of chunk addresses, so a
/// freshly freed chunk is the next one handed out. The tail
/// `SLAB_SIZE % alloc_size` bytes of every slab are never allocated.
mod release;

pub use release::{ReleaseMode, SlabReleaseContext};
pub(crate) use release::ReleaseState;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ptr::NonNull;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Error, Result};
use crate::slab::{ClassId, PoolId, SlabAllocator, SlabFlags, SLAB_SIZE};

/// How many chunks to scan between abort-predicate checks while a release
/// collects live allocations.
const ABORT_CHECK_STRIDE: usize = 4096;

/// How long to spin on the class lock between abort-predicate checks.
const ABORT_LOCK_POLL: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub(crate) struct AllocationClass {
    pool: PoolId,
    id: ClassId,
    alloc_size: u32,
    inner: Mutex<ClassInner>,
    /// Signaled whenever a release loses its last live allocation.
    drained: Condvar,
}

#[derive(Debug)]
struct ClassInner {
    /// LIFO stack of free chunk addresses across all serving slabs.
    free_list: Vec<usize>,
    /// Indices of every slab this class owns, marked ones included.
    slabs_held: BTreeSet<usize>,
    /// MARKED slabs, keyed by slab index.
    releases: HashMap<usize, ReleaseState>,
}

/// Outcome of `start_release`: either the slab still has live allocations
/// and stays MARKED, or it drained instantly and the caller disposes it.
#[derive(Debug)]
pub(crate) enum StartOutcome {
    Pending(SlabReleaseContext),
    Drained(SlabReleaseContext),
}

impl AllocationClass {
    pub(crate) fn new(pool: PoolId, id: ClassId, alloc_size: u32) -> Self {
        Self {
            pool,
            id,
            alloc_size,
            inner: Mutex::new(ClassInner {
                free_list: Vec::new(),
                slabs_held: BTreeSet::new(),
                releases: HashMap::new(),
            }),
            drained: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> ClassId {
        self.id
    }

    #[inline]
    pub(crate) fn alloc_size(&self) -> u32 {
        self.alloc_size
    }

    #[inline]
    pub(crate) fn chunks_per_slab(&self) -> usize {
        SLAB_SIZE / self.alloc_size as usize
    }

    pub(crate) fn slabs_held_count(&self) -> usize {
        self.inner.lock().slabs_held.len()
    }

    pub(crate) fn free_list_len(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Pop a free chunk, if any slab has one.
    pub(crate) fn pop_free(&self) -> Option<NonNull<u8>> {
        let addr = self.inner.lock().free_list.pop()?;
        NonNull::new(addr as *mut u8)
    }

    /// Take ownership of `slab_index` and push every chunk onto the free
    /// list. The caller has already written the slab header.
    pub(crate) fn adopt_slab(&self, slab_index: usize, slab_base: *mut u8) {
        let base = slab_base as usize;
        let mut inner = self.inner.lock();
        let inserted = inner.slabs_held.insert(slab_index);
        debug_assert!(inserted, "slab {} adopted twice", slab_index);
        inner
            .free_list
            .extend((0..self.chunks_per_slab()).map(|k| base + k * self.alloc_size as usize));
    }

    /// Return one chunk to the free list, or to the release bookkeeping if
    /// its slab is mid-release.
    pub(crate) fn free(&self, addr: usize, slab_index: usize, slab_base: usize) -> Result<()> {
        if (addr - slab_base) % self.alloc_size as usize != 0 {
            return Err(Error::MisalignedPointer);
        }

        let mut inner = self.inner.lock();
        if !inner.slabs_held.contains(&slab_index) {
            return Err(Error::InconsistentState);
        }

        if let Some(release) = inner.releases.get_mut(&slab_index) {
            // Mid-release slab: the chunk leaves the live set instead of
            // rejoining the free list; the slab is disposed of wholesale.
            let removed = release.live.remove(&addr);
            debug_assert!(removed, "double free of {:#x} during slab release", addr);
            if removed && release.live.is_empty() {
                self.drained.notify_all();
            }
            return Ok(());
        }

        inner.free_list.push(addr);
        Ok(())
    }

    /// Mark one slab for release and collect its still-live allocations.
    ///
    /// The victim is the slab containing `hint` when given, otherwise the
    /// held slab with the most free chunks (least quiesce work). Free-list
    /// entries inside the victim are stripped; the remaining chunk
    /// addresses form the live set. An empty live set releases
    /// immediately: the slab leaves `slabs_held` and the caller disposes
    /// of it.
    pub(crate) fn start_release(
        &self,
        slabs: &SlabAllocator,
        mode: ReleaseMode,
        receiver: Option<ClassId>,
        hint_slab: Option<usize>,
        should_abort: Option<&dyn Fn() -> bool>,
    ) -> Result<StartOutcome> {
        let mut inner = self.lock_abortable(should_abort)?;

        let victim = self.pick_victim(slabs, &inner, hint_slab)?;
        let base = slabs.slab_for_index(victim)? as usize;
        let size = self.alloc_size as usize;
        let end = base + self.chunks_per_slab() * size;

        // Strip the victim's chunks out of the free list. Everything the
        // free list did not cover is still held by a caller.
        let mut freed = HashSet::new();
        let mut kept = Vec::with_capacity(inner.free_list.len());
        for addr in inner.free_list.drain(..) {
            if (base..end).contains(&addr) {
                freed.insert(addr);
            } else {
                kept.push(addr);
            }
        }
        inner.free_list = kept;

        let mut live = HashSet::new();
        for (k, chunk) in (0..self.chunks_per_slab()).map(|k| (k, base + k * size)) {
            if k % ABORT_CHECK_STRIDE == 0 {
                if let Some(abort) = should_abort {
                    if abort() {
                        // Undo the strip and leave the slab serving.
                        inner.free_list.extend(freed.iter().copied());
                        return Err(Error::ReleaseAborted);
                    }
                }
            }
            if !freed.contains(&chunk) {
                live.insert(chunk);
            }
        }

        slabs.set_flag(victim, SlabFlags::MARKED_FOR_RELEASE, true);

        debug!(
            pool = self.pool.0,
            class = self.id.0,
            slab = victim,
            live = live.len(),
            ?mode,
            "started slab release"
        );

        if live.is_empty() {
            inner.slabs_held.remove(&victim);
            return Ok(StartOutcome::Drained(SlabReleaseContext::new(
                self.pool, self.id, receiver, mode, victim, true,
            )));
        }

        inner.releases.insert(
            victim,
            ReleaseState {
                mode,
                receiver,
                live,
            },
        );
        Ok(StartOutcome::Pending(SlabReleaseContext::new(
            self.pool, self.id, receiver, mode, victim, false,
        )))
    }

    /// If `addr` is still live in the context's release, run `f` on it and
    /// drop it from the live set. Returns whether it was live. `f` runs
    /// with the class lock held and must not call back into the allocator.
    pub(crate) fn process_for_release(
        &self,
        ctx: &SlabReleaseContext,
        addr: usize,
        f: impl FnOnce(*mut u8),
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        let release = self.release_entry_mut(&mut inner, ctx)?;
        if !release.live.contains(&addr) {
            return Ok(false);
        }
        f(addr as *mut u8);
        release.live.remove(&addr);
        if release.live.is_empty() {
            self.drained.notify_all();
        }
        Ok(true)
    }

    /// True iff the chunk at `addr` inside the releasing slab is no longer
    /// held by any caller.
    pub(crate) fn is_alloc_free(
        &self,
        ctx: &SlabReleaseContext,
        addr: usize,
        slab_base: usize,
    ) -> Result<bool> {
        if (addr - slab_base) % self.alloc_size as usize != 0 {
            return Err(Error::MisalignedPointer);
        }
        let mut inner = self.inner.lock();
        let release = self.release_entry_mut(&mut inner, ctx)?;
        Ok(!release.live.contains(&addr))
    }

    pub(crate) fn live_count(&self, ctx: &SlabReleaseContext) -> Result<usize> {
        let mut inner = self.inner.lock();
        Ok(self.release_entry_mut(&mut inner, ctx)?.live.len())
    }

    /// Block until the release's live set drains, then drop the slab from
    /// this class. The caller disposes of the slab (back to the slab
    /// allocator, or re-carved by the receiver class).
    pub(crate) fn wait_release_drained(&self, ctx: &SlabReleaseContext) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            let release = self.release_entry_mut(&mut inner, ctx)?;
            if release.live.is_empty() {
                break;
            }
            self.drained.wait(&mut inner);
        }
        inner.releases.remove(&ctx.slab_index());
        inner.slabs_held.remove(&ctx.slab_index());
        Ok(())
    }

    /// Cancel a release that still has live allocations. The slab returns
    /// to serving; every chunk not in the live set (stripped at start or
    /// freed while the release was pending) rejoins the free list.
    pub(crate) fn abort_release(
        &self,
        slabs: &SlabAllocator,
        ctx: &SlabReleaseContext,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        {
            let release = self.release_entry_mut(&mut inner, ctx)?;
            if release.live.is_empty() {
                return Err(Error::ReleaseAlreadyDrained);
            }
        }
        let release = inner
            .releases
            .remove(&ctx.slab_index())
            .expect("entry checked above");

        let base = slabs.slab_for_index(ctx.slab_index())? as usize;
        let size = self.alloc_size as usize;
        let mut restored = 0;
        for chunk in (0..self.chunks_per_slab()).map(|k| base + k * size) {
            if !release.live.contains(&chunk) {
                inner.free_list.push(chunk);
                restored += 1;
            }
        }
        slabs.set_flag(ctx.slab_index(), SlabFlags::MARKED_FOR_RELEASE, false);

        debug!(
            pool = self.pool.0,
            class = self.id.0,
            slab = ctx.slab_index(),
            restored,
            "aborted slab release"
        );
        Ok(restored)
    }

    fn release_entry_mut<'a>(
        &self,
        inner: &'a mut ClassInner,
        ctx: &SlabReleaseContext,
    ) -> Result<&'a mut ReleaseState> {
        let release = inner
            .releases
            .get_mut(&ctx.slab_index())
            .ok_or(Error::ReleaseStateMismatch)?;
        if release.mode != ctx.mode() || release.receiver != ctx.receiver_class() {
            return Err(Error::ReleaseStateMismatch);
        }
        Ok(release)
    }

    fn pick_victim(
        &self,
        slabs: &SlabAllocator,
        inner: &ClassInner,
        hint_slab: Option<usize>,
    ) -> Result<usize> {
        // An advised slab has no physical memory behind it; it stays
        // pinned to its class until explicitly un-advised.
        let releasable = |index: usize| {
            !inner.releases.contains_key(&index)
                && !slabs.header(index).flags().contains(SlabFlags::ADVISED)
        };

        if let Some(index) = hint_slab {
            if inner.slabs_held.contains(&index) && releasable(index) {
                return Ok(index);
            }
            return Err(Error::NoReleasableSlab);
        }

        // Count free chunks per candidate slab; the emptiest slab needs
        // the least quiescing.
        let mut free_per_slab: HashMap<usize, usize> = inner
            .slabs_held
            .iter()
            .copied()
            .filter(|&i| releasable(i))
            .map(|i| (i, 0))
            .collect();
        if free_per_slab.is_empty() {
            return Err(Error::NoReleasableSlab);
        }
        for &addr in &inner.free_list {
            if let Some(index) = slabs.slab_index_of(addr as *const u8) {
                if let Some(count) = free_per_slab.get_mut(&index) {
                    *count += 1;
                }
            }
        }
        let victim = free_per_slab
            .iter()
            .max_by_key(|(&index, &count)| (count, core::cmp::Reverse(index)))
            .map(|(&index, _)| index)
            .expect("candidate set is non-empty");
        Ok(victim)
    }

    fn lock_abortable(
        &self,
        should_abort: Option<&dyn Fn() -> bool>,
    ) -> Result<MutexGuard<'_, ClassInner>> {
        let Some(abort) = should_abort else {
            return Ok(self.inner.lock());
        };
        loop {
            if abort() {
                return Err(Error::ReleaseAborted);
            }
            if let Some(guard) = self.inner.try_lock_for(ABORT_LOCK_POLL) {
                return Ok(guard);
            }
        }
    }
}
