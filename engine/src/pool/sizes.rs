/// Size-class ladder generator.
///
/// Starting at `min_size`, each class is the previous one multiplied by
/// `factor` and rounded up to the minimum alignment. With
/// `reduce_fragmentation` every class is additionally snapped up to the
/// largest aligned size that still yields the same number of chunks per
/// slab, shrinking the unallocatable tail of each slab. The generator
/// fails when a step produces no growth, which happens when the factor is
/// too small for the integer rounding to move the size forward.
use crate::error::{Error, Result};
use crate::slab::{MIN_ALLOC_ALIGNMENT, SLAB_SIZE};

/// Growth factor used for pools created without an explicit size list.
pub const DEFAULT_SIZE_FACTOR: f64 = 1.25;

/// Smallest class used for pools created without an explicit size list.
pub const DEFAULT_MIN_ALLOC_SIZE: u32 = 64;

#[inline]
fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Largest aligned size that keeps `floor(SLAB_SIZE / size)` chunks per
/// slab.
#[inline]
fn snap_to_chunk_boundary(size: usize) -> usize {
    let chunks = SLAB_SIZE / size;
    SLAB_SIZE / chunks / MIN_ALLOC_ALIGNMENT * MIN_ALLOC_ALIGNMENT
}

/// Generate an ascending list of allocation sizes in
/// `[min_size, max_size]`.
///
/// Fails if `factor <= 1.0`, if the bounds are inverted, below the
/// minimum alignment, or above one slab, or if rounding collapses two
/// consecutive sizes into one.
pub fn generate_alloc_sizes(
    factor: f64,
    min_size: u32,
    max_size: u32,
    reduce_fragmentation: bool,
) -> Result<Vec<u32>> {
    if !(factor > 1.0) {
        return Err(Error::BadSizeFactor);
    }
    let min = min_size as usize;
    let max = max_size as usize;
    if min < MIN_ALLOC_ALIGNMENT || min > max || max > SLAB_SIZE {
        return Err(Error::BadSizeBounds);
    }

    let mut sizes: Vec<u32> = Vec::new();
    let mut size = round_up(min, MIN_ALLOC_ALIGNMENT);
    loop {
        let entry = if reduce_fragmentation {
            snap_to_chunk_boundary(size)
        } else {
            size
        };
        if entry > max {
            break;
        }
        sizes.push(entry as u32);

        let next = round_up((entry as f64 * factor) as usize, MIN_ALLOC_ALIGNMENT);
        if next <= entry {
            return Err(Error::SizeLadderStalled);
        }
        if next > max {
            break;
        }
        size = next;
    }

    if sizes.is_empty() {
        return Err(Error::BadSizeBounds);
    }
    Ok(sizes)
}
