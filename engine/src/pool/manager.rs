/// Pool directory and global slab budget.
///
/// Owns every pool, maps names to ids, and guards the invariant that the
/// sum of pool targets plus the unreserved remainder always equals the
/// total usable bytes of the backing region. Growing or shrinking a pool
/// moves bytes between its target and the unreserved remainder; no slabs
/// move until a release runs.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pool::MemoryPool;
use crate::slab::{PoolId, MAX_CLASSES_PER_POOL, MAX_POOLS, MIN_ALLOC_ALIGNMENT, SLAB_SIZE};

/// Point-in-time snapshot of the whole allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatorStats {
    pub usable_slabs: usize,
    pub free_slabs: usize,
    pub bytes_unreserved: usize,
    pub bytes_advised: usize,
}

struct ManagerInner {
    /// Index == `PoolId`. Pools are append-only.
    pools: Vec<Arc<MemoryPool>>,
    names: HashMap<String, PoolId>,
    bytes_unreserved: usize,
    bytes_advised: usize,
}

pub(crate) struct PoolManager {
    total_usable: usize,
    inner: Mutex<ManagerInner>,
}

impl PoolManager {
    pub(crate) fn new(total_usable: usize) -> Self {
        Self {
            total_usable,
            inner: Mutex::new(ManagerInner {
                pools: Vec::new(),
                names: HashMap::new(),
                bytes_unreserved: total_usable,
                bytes_advised: 0,
            }),
        }
    }

    /// Create a pool with `size` bytes of target budget carved from the
    /// unreserved remainder.
    pub(crate) fn add_pool(
        &self,
        name: &str,
        size: usize,
        alloc_sizes: &[u32],
        ensure_provisionable: bool,
    ) -> Result<PoolId> {
        validate_alloc_sizes(alloc_sizes)?;
        if name.is_empty() {
            return Err(Error::EmptyPoolName);
        }

        let mut inner = self.inner.lock();
        if inner.names.contains_key(name) {
            return Err(Error::DuplicatePoolName(name.to_string()));
        }
        if size > inner.bytes_unreserved {
            return Err(Error::SizeExceedsUnreserved {
                requested: size,
                unreserved: inner.bytes_unreserved,
            });
        }
        if inner.pools.len() >= MAX_POOLS {
            return Err(Error::TooManyPools { limit: MAX_POOLS });
        }
        if ensure_provisionable && size < alloc_sizes.len() * SLAB_SIZE {
            return Err(Error::NotProvisionable {
                size,
                classes: alloc_sizes.len(),
            });
        }

        let id = PoolId(inner.pools.len() as u8);
        inner
            .pools
            .push(Arc::new(MemoryPool::new(id, name.to_string(), size, alloc_sizes)));
        inner.names.insert(name.to_string(), id);
        inner.bytes_unreserved -= size;

        debug!(
            pool = id.0,
            name,
            size,
            classes = alloc_sizes.len(),
            "created memory pool"
        );
        Ok(id)
    }

    pub(crate) fn pool(&self, id: PoolId) -> Result<Arc<MemoryPool>> {
        self.inner
            .lock()
            .pools
            .get(id.0 as usize)
            .cloned()
            .ok_or(Error::UnknownPool(id.0))
    }

    pub(crate) fn pool_by_name(&self, name: &str) -> Result<PoolId> {
        self.inner
            .lock()
            .names
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownPool(PoolId::INVALID.0))
    }

    /// Move `bytes` from the unreserved remainder into the pool's target.
    /// `Ok(false)` when not enough bytes remain unreserved.
    pub(crate) fn grow_pool(&self, id: PoolId, bytes: usize) -> Result<bool> {
        let mut inner = self.inner.lock();
        let pool = inner
            .pools
            .get(id.0 as usize)
            .cloned()
            .ok_or(Error::UnknownPool(id.0))?;
        if bytes > inner.bytes_unreserved {
            return Ok(false);
        }
        inner.bytes_unreserved -= bytes;
        pool.grow_target(bytes);
        debug!(pool = id.0, bytes, "grew pool target");
        Ok(true)
    }

    /// Move `bytes` from the pool's target back to the unreserved
    /// remainder. `Ok(false)` when the target does not cover `bytes`.
    pub(crate) fn shrink_pool(&self, id: PoolId, bytes: usize) -> Result<bool> {
        let mut inner = self.inner.lock();
        let pool = inner
            .pools
            .get(id.0 as usize)
            .cloned()
            .ok_or(Error::UnknownPool(id.0))?;
        if !pool.try_shrink_target(bytes) {
            return Ok(false);
        }
        inner.bytes_unreserved += bytes;
        debug!(pool = id.0, bytes, "shrank pool target");
        Ok(true)
    }

    /// Atomically move `bytes` of target from `src` to `dst`. Succeeds
    /// iff `src`'s target covers `bytes`.
    pub(crate) fn resize_pools(&self, src: PoolId, dst: PoolId, bytes: usize) -> Result<bool> {
        let inner = self.inner.lock();
        let src_pool = inner
            .pools
            .get(src.0 as usize)
            .cloned()
            .ok_or(Error::UnknownPool(src.0))?;
        let dst_pool = inner
            .pools
            .get(dst.0 as usize)
            .cloned()
            .ok_or(Error::UnknownPool(dst.0))?;
        if !src_pool.try_shrink_target(bytes) {
            return Ok(false);
        }
        dst_pool.grow_target(bytes);
        debug!(src = src.0, dst = dst.0, bytes, "moved target between pools");
        Ok(true)
    }

    /// Pools currently holding more slab bytes than their target allows.
    pub(crate) fn pools_over_limit(&self) -> Vec<PoolId> {
        let pools: Vec<Arc<MemoryPool>> = self.inner.lock().pools.clone();
        pools
            .iter()
            .filter(|p| p.is_over_limit())
            .map(|p| p.id())
            .collect()
    }

    pub(crate) fn pool_count(&self) -> usize {
        self.inner.lock().pools.len()
    }

    pub(crate) fn bytes_unreserved(&self) -> usize {
        self.inner.lock().bytes_unreserved
    }

    pub(crate) fn bytes_advised(&self) -> usize {
        self.inner.lock().bytes_advised
    }

    /// Track a slab's worth of bytes entering or leaving the advised
    /// state.
    pub(crate) fn note_advised(&self, advised: bool) {
        let mut inner = self.inner.lock();
        if advised {
            inner.bytes_advised += SLAB_SIZE;
        } else {
            inner.bytes_advised -= SLAB_SIZE;
        }
    }

    pub(crate) fn total_usable(&self) -> usize {
        self.total_usable
    }
}

/// Class sizes must be non-empty, strictly ascending, aligned, at most
/// one slab each, and no more than the per-pool class limit.
fn validate_alloc_sizes(alloc_sizes: &[u32]) -> Result<()> {
    if alloc_sizes.is_empty() {
        return Err(Error::BadAllocSizes("list is empty"));
    }
    if alloc_sizes.len() > MAX_CLASSES_PER_POOL {
        return Err(Error::BadAllocSizes("more classes than the per-pool limit"));
    }
    for &size in alloc_sizes {
        if size == 0 || size as usize % MIN_ALLOC_ALIGNMENT != 0 {
            return Err(Error::BadAllocSizes(
                "size is not a multiple of the minimum alignment",
            ));
        }
        if size as usize > SLAB_SIZE {
            return Err(Error::BadAllocSizes("size exceeds one slab"));
        }
    }
    if !alloc_sizes.windows(2).all(|w| w[0] < w[1]) {
        return Err(Error::BadAllocSizes("sizes must be strictly ascending"));
    }
    Ok(())
}
