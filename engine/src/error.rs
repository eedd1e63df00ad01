/// Engine error types.
///
/// Out-of-memory is deliberately not represented here: `allocate` returns
/// `Ok(None)` when a pool cannot grow, and the budget operations on the
/// pool manager return `Ok(false)` when the requested bytes are not
/// available. Everything in this enum is a caller mistake or a detected
/// inconsistency.
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No pool with this id exists.
    #[error("unknown pool id {0}")]
    UnknownPool(u8),

    /// No class with this id exists in the pool.
    #[error("unknown class id {0}")]
    UnknownClass(u8),

    /// The pointer does not fall inside any slab owned by this allocator,
    /// or falls inside a slab that is not assigned to a class.
    #[error("pointer is not owned by this allocator")]
    ForeignPointer,

    /// The pointer lies inside an owned slab but is not on a chunk
    /// boundary for the owning class.
    #[error("pointer is not aligned to a chunk of its class")]
    MisalignedPointer,

    /// The request is larger than the largest class in the pool.
    #[error("requested size {size} exceeds largest class size {largest}")]
    SizeTooLarge { size: usize, largest: usize },

    /// Slab index past the end of the slab region.
    #[error("slab index {0} out of range")]
    BadSlabIndex(usize),

    #[error("pool name must not be empty")]
    EmptyPoolName,

    #[error("duplicate pool name {0:?}")]
    DuplicatePoolName(String),

    #[error("pool limit of {limit} pools reached")]
    TooManyPools { limit: usize },

    /// `add_pool` asked for more memory than remains unreserved.
    #[error("pool size {requested} exceeds unreserved bytes {unreserved}")]
    SizeExceedsUnreserved { requested: usize, unreserved: usize },

    /// `ensure_provisionable` was set and the pool cannot hold one slab
    /// per allocation class.
    #[error("pool of {size} bytes cannot provision {classes} classes")]
    NotProvisionable { size: usize, classes: usize },

    /// The allocation-size list is malformed (empty, unsorted, not a
    /// multiple of the minimum alignment, larger than a slab, or longer
    /// than the class limit).
    #[error("invalid allocation sizes: {0}")]
    BadAllocSizes(&'static str),

    #[error("size-class factor must be greater than 1.0")]
    BadSizeFactor,

    /// min/max size bounds are inverted, below the minimum alignment, or
    /// above the slab size.
    #[error("size-class bounds are invalid")]
    BadSizeBounds,

    /// Fragmentation rounding collapsed two consecutive generated sizes
    /// into one; the factor is too small for the requested range.
    #[error("size-class generation stalled between consecutive sizes")]
    SizeLadderStalled,

    /// The class holds no slab that could be released (none held, or all
    /// already mid-release).
    #[error("class holds no slab eligible for release")]
    NoReleasableSlab,

    /// Rebalance releases need a receiver class; resize releases must not
    /// name one.
    #[error("release mode and receiver class do not agree")]
    BadReleaseTarget,

    /// The caller's abort predicate fired during `start_slab_release`.
    #[error("slab release aborted by caller")]
    ReleaseAborted,

    /// `abort_slab_release` on a release whose live allocations have all
    /// drained; the release must be completed instead.
    #[error("cannot abort a release with no live allocations")]
    ReleaseAlreadyDrained,

    /// A release context does not match the class's release bookkeeping;
    /// either the context was already consumed or state was corrupted.
    #[error("release context does not match class state")]
    ReleaseStateMismatch,

    /// Slab header and class bookkeeping disagree about ownership.
    #[error("slab header and class bookkeeping disagree")]
    InconsistentState,

    #[error("header region too small: need {needed} bytes, got {got}")]
    HeaderRegionTooSmall { needed: usize, got: usize },

    /// A caller-supplied memory region is null or under-aligned.
    #[error("memory region is not aligned to {0} bytes")]
    MisalignedRegion(usize),

    /// The slab region is smaller than a single slab.
    #[error("slab region smaller than one slab")]
    NoUsableSlabs,
}
