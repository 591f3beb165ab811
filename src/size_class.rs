//! Size classes.
//!
//! Class 0 is reserved for large allocations, which bypass the classes entirely. The
//! allocator only depends on the [`SizeClasses`] trait; [`SizeClassTable`] is the default.

use crate::{
  SB_SIZE, align_up,
  block::MIN_BLOCK_SIZE,
  error::{Error, Result},
  meta::MAX_SIZE_CLASSES,
};

/// Class index of large allocations.
pub const LARGE_CLASS: usize = 0;

/// A pure mapping from request sizes to block sizes.
///
/// `classify` must be monotonic and `block_size(classify(size)) >= size` for every size up
/// to `max_size`.
pub trait SizeClasses: Send + Sync {
  /// Number of classes, including the reserved class 0.
  fn count(&self) -> usize;

  /// Largest request served from a size class.
  fn max_size(&self) -> usize;

  /// Class serving `size`. Only called with `size <= max_size()`.
  fn classify(&self, size: usize) -> usize;

  fn block_size(&self, class: usize) -> usize;

  fn blocks_per_superblock(&self, class: usize) -> usize {
    SB_SIZE / self.block_size(class)
  }

  /// Thread cache length at which frees drain the cache back to the superblocks.
  fn cache_threshold(&self, class: usize) -> usize {
    self.blocks_per_superblock(class)
  }
}

/// Checks the invariants the allocator relies on.
pub(crate) fn validate(classes: &dyn SizeClasses) -> Result<()> {
  let count = classes.count();
  if !(2..=MAX_SIZE_CLASSES).contains(&count) {
    return Err(Error::InvalidConfig(format!(
      "{count} size classes, expected 2..={MAX_SIZE_CLASSES}"
    )));
  }
  for class in 1..count {
    let size = classes.block_size(class);
    let blocks = classes.blocks_per_superblock(class);
    if size < MIN_BLOCK_SIZE || size % MIN_BLOCK_SIZE != 0 {
      return Err(Error::InvalidConfig(format!(
        "class {class}: block size {size} is not a positive multiple of {MIN_BLOCK_SIZE}"
      )));
    }
    if blocks < 2 || size * blocks > SB_SIZE {
      return Err(Error::InvalidConfig(format!(
        "class {class}: {blocks} blocks of {size} bytes do not fit a superblock"
      )));
    }
    if classes.cache_threshold(class) == 0 {
      return Err(Error::InvalidConfig(format!("class {class}: zero cache threshold")));
    }
  }
  let top = classes.classify(classes.max_size());
  if top == LARGE_CLASS || top >= count || classes.block_size(top) < classes.max_size() {
    return Err(Error::InvalidConfig("largest size does not map to a class that holds it".into()));
  }
  Ok(())
}

// =============================================================================
// Default table
// =============================================================================

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// Largest small block; four of them fill a superblock.
pub const CLASSES_MAX_SIZE: usize = SB_SIZE / 4;

/// Sub-class multipliers for geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

/// Number of small classes, computed at compile time.
const fn count_size_classes() -> usize {
  let mut class = 0;
  loop {
    if small_class_to_size(class) >= CLASSES_MAX_SIZE {
      return class + 1;
    }
    class += 1;
  }
}

const SMALL_CLASSES: usize = count_size_classes();

const _: () = assert!(SMALL_CLASSES < MAX_SIZE_CLASSES);
const _: () = assert!(small_class_to_size(0) == 16);
const _: () = assert!(small_class_to_size(SMALL_CLASSES - 1) == CLASSES_MAX_SIZE);

/// Small class index to block size; small class `i` is table class `i + 1`.
const fn small_class_to_size(class: usize) -> usize {
  if class < CLASSES_LINEAR {
    (class + 1) * CLASSES_LINEAR_STEP
  } else {
    let geo_index = class - CLASSES_LINEAR + 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;

    let base = 128 << order;
    let size = align_up((base * GEO_MULTIPLIERS[sub]) / 16, 16);

    if size > CLASSES_MAX_SIZE {
      CLASSES_MAX_SIZE
    } else {
      size
    }
  }
}

/// Inverse of `small_class_to_size`.
fn size_to_small_class(size: usize) -> usize {
  if size == 0 {
    return 0;
  }

  // Linear range: ceil(size / 16) - 1
  if size <= 128 {
    return (size - 1) / CLASSES_LINEAR_STEP;
  }

  // Geometric range: find order via log2, then sub-class via thresholds
  let log2 = (usize::BITS as usize - 1) - size.leading_zeros() as usize;
  let order = log2.saturating_sub(7);
  let base = 128usize << order;

  let t1 = align_up((base * GEO_MULTIPLIERS[1]) >> 4, 16);
  let t2 = align_up((base * GEO_MULTIPLIERS[2]) >> 4, 16);
  let t3 = align_up((base * GEO_MULTIPLIERS[3]) >> 4, 16);

  let exceeded =
    (size > base) as usize + (size > t1) as usize + (size > t2) as usize + (size > t3) as usize;

  // If exceeded == 4, bump to next order
  let final_order = order + (exceeded >> 2);
  let sub = exceeded & 3;
  CLASSES_LINEAR + final_order * CLASSES_PER_DOUBLING + sub - 1
}

/// 16-byte steps up to 128 bytes, then four classes per doubling up to [`CLASSES_MAX_SIZE`].
#[derive(Clone, Copy, Debug, Default)]
pub struct SizeClassTable;

impl SizeClasses for SizeClassTable {
  #[inline]
  fn count(&self) -> usize {
    SMALL_CLASSES + 1
  }

  #[inline]
  fn max_size(&self) -> usize {
    CLASSES_MAX_SIZE
  }

  #[inline]
  fn classify(&self, size: usize) -> usize {
    debug_assert!(size <= CLASSES_MAX_SIZE);
    size_to_small_class(size) + 1
  }

  #[inline]
  fn block_size(&self, class: usize) -> usize {
    debug_assert!(class != LARGE_CLASS && class <= SMALL_CLASSES);
    small_class_to_size(class - 1)
  }
}
