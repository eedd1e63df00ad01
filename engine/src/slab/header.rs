/// Slab headers and the id spaces shared by every layer.
///
/// One header per slab lives in the caller-provided header region, parallel
/// to the slab region. The header answers "which pool and class owns this
/// address, at what chunk size" without any per-allocation metadata.
use core::mem;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Size of one slab. Also the upper bound on a single allocation, since
/// every allocation is carved from exactly one slab.
pub const SLAB_SIZE: usize = 4 * 1024 * 1024;

/// Minimum alignment of every allocation. Class sizes must be multiples
/// of this at pool-configuration time.
pub const MIN_ALLOC_ALIGNMENT: usize = mem::align_of::<*const u8>();

/// Pools per allocator. Valid ids are `0..MAX_POOLS`.
pub const MAX_POOLS: usize = 128;

/// Classes per pool. Valid ids are `0..MAX_CLASSES_PER_POOL`.
pub const MAX_CLASSES_PER_POOL: usize = 128;

/// Identifier of a memory pool. Values of 128 and above are sentinels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PoolId(pub u8);

impl PoolId {
    /// Sentinel for "no pool".
    pub const INVALID: PoolId = PoolId(u8::MAX);

    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_POOLS
    }
}

/// Identifier of an allocation class within one pool. Values of 128 and
/// above are sentinels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ClassId(pub u8);

impl ClassId {
    /// Sentinel for "no class".
    pub const INVALID: ClassId = ClassId(u8::MAX);

    #[inline]
    pub const fn is_valid(self) -> bool {
        (self.0 as usize) < MAX_CLASSES_PER_POOL
    }
}

bitflags! {
    /// Header flag byte. Written under the slab-allocator lock, read with
    /// a plain atomic load; traversals tolerate a stale read and re-check.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SlabFlags: u8 {
        /// Physical memory handed back to the OS. The slab is still
        /// logically owned by its class.
        const ADVISED = 1 << 0;
        /// Slab is mid-release; traversals must skip it.
        const MARKED_FOR_RELEASE = 1 << 1;
    }
}

/// Per-slab header.
///
/// All fields are atomics so `slab_header(ptr)` readers never take a lock.
/// `pool`/`class`/`alloc_size` only change while the slab is unowned or at
/// the end of a release, always under the slab-allocator lock.
#[repr(C)]
pub struct SlabHeader {
    pool: AtomicU8,
    class: AtomicU8,
    flags: AtomicU8,
    _reserved: u8,
    alloc_size: AtomicU32,
}

const_assert_eq!(mem::size_of::<SlabHeader>(), 8);
const_assert_eq!(mem::align_of::<SlabHeader>(), 4);

impl SlabHeader {
    pub(crate) const fn unowned() -> Self {
        Self {
            pool: AtomicU8::new(PoolId::INVALID.0),
            class: AtomicU8::new(ClassId::INVALID.0),
            flags: AtomicU8::new(0),
            _reserved: 0,
            alloc_size: AtomicU32::new(0),
        }
    }

    /// Clear back to the unowned state: invalid pool/class, no flags.
    pub(crate) fn reset(&self) {
        self.pool.store(PoolId::INVALID.0, Ordering::Release);
        self.class.store(ClassId::INVALID.0, Ordering::Release);
        self.alloc_size.store(0, Ordering::Release);
        self.flags.store(0, Ordering::Release);
    }

    /// Hand the slab to `(pool, class)` serving `alloc_size` chunks.
    /// Clears any release/advise flags from a previous owner.
    pub(crate) fn assign(&self, pool: PoolId, class: ClassId, alloc_size: u32) {
        self.pool.store(pool.0, Ordering::Release);
        self.class.store(class.0, Ordering::Release);
        self.alloc_size.store(alloc_size, Ordering::Release);
        self.flags.store(0, Ordering::Release);
    }

    #[inline]
    pub fn pool(&self) -> PoolId {
        PoolId(self.pool.load(Ordering::Acquire))
    }

    #[inline]
    pub fn class(&self) -> ClassId {
        ClassId(self.class.load(Ordering::Acquire))
    }

    #[inline]
    pub fn alloc_size(&self) -> u32 {
        self.alloc_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn flags(&self) -> SlabFlags {
        SlabFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// An unowned header has both ids at their sentinels.
    #[inline]
    pub fn is_assigned(&self) -> bool {
        self.pool().is_valid() && self.class().is_valid()
    }

    pub(crate) fn set_flag(&self, flag: SlabFlags, on: bool) {
        if on {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }
}
