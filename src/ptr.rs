//! Position-independent pointers.
//!
//! - [`AtomicRelPtr`]: self-relative offset for links that stay inside one region.
//! - [`AtomicCrossPtr`]: offset into a named region, for links that cross regions.
//! - [`AtomicCountedPtr`]: region offset in the low [`MAX_OFFSET_BITS`] bits and a generation
//!   counter in the remaining high bits, so a lock-free stack head can tell a recycled
//!   descriptor from an untouched one.

use core::{
  fmt,
  marker::PhantomData,
  ptr::NonNull,
  sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

use crate::{
  MAX_OFFSET_BITS,
  region::{RegionIndex, Regions},
};

const OFFSET_MASK: u64 = (1 << MAX_OFFSET_BITS) - 1;

/// Names the region a cross-region pointer refers into.
pub trait RegionKind {
  const INDEX: RegionIndex;
}

pub struct InSuperblocks;
pub struct InDescriptors;
pub struct InMeta;

impl RegionKind for InSuperblocks {
  const INDEX: RegionIndex = RegionIndex::Superblock;
}

impl RegionKind for InDescriptors {
  const INDEX: RegionIndex = RegionIndex::Descriptor;
}

impl RegionKind for InMeta {
  const INDEX: RegionIndex = RegionIndex::Meta;
}

// =============================================================================
// Relative pointer
// =============================================================================

/// Offset from the pointer's own address; 0 is null.
#[repr(transparent)]
pub struct AtomicRelPtr<T> {
  delta: AtomicI64,
  _marker: PhantomData<fn() -> T>,
}

impl<T> AtomicRelPtr<T> {
  #[inline]
  fn origin(&self) -> isize {
    self as *const Self as isize
  }

  #[inline]
  pub fn load(&self) -> Option<NonNull<T>> {
    match self.delta.load(Ordering::Acquire) {
      0 => None,
      delta => NonNull::new((self.origin() + delta as isize) as *mut T),
    }
  }

  #[inline]
  pub fn store(&self, target: Option<NonNull<T>>) {
    let delta = target.map_or(0, |t| t.as_ptr() as isize - self.origin());
    self.delta.store(delta as i64, Ordering::Release);
  }
}

// =============================================================================
// Cross-region pointer
// =============================================================================

/// Byte offset into region `R`; 0 is null.
#[repr(transparent)]
pub struct AtomicCrossPtr<T, R: RegionKind> {
  offset: AtomicU64,
  _marker: PhantomData<fn() -> (T, R)>,
}

impl<T, R: RegionKind> AtomicCrossPtr<T, R> {
  #[inline]
  pub fn load(&self, rgs: &Regions) -> Option<NonNull<T>> {
    match self.offset.load(Ordering::Acquire) {
      0 => None,
      offset => Some(rgs.translate(R::INDEX, offset).cast()),
    }
  }

  #[inline]
  pub fn store(&self, rgs: &Regions, target: Option<NonNull<T>>) {
    self.offset.store(encode::<T, R>(rgs, target), Ordering::Release);
  }

  #[inline]
  pub fn store_null(&self) {
    self.offset.store(0, Ordering::Release);
  }

  #[inline]
  pub fn swap(&self, rgs: &Regions, target: Option<NonNull<T>>) -> Option<NonNull<T>> {
    match self.offset.swap(encode::<T, R>(rgs, target), Ordering::AcqRel) {
      0 => None,
      offset => Some(rgs.translate(R::INDEX, offset).cast()),
    }
  }

  #[inline]
  pub fn offset(&self) -> u64 {
    self.offset.load(Ordering::Acquire)
  }

  #[inline]
  pub fn is_null(&self) -> bool {
    self.offset() == 0
  }
}

#[inline]
fn encode<T, R: RegionKind>(rgs: &Regions, target: Option<NonNull<T>>) -> u64 {
  target.map_or(0, |t| rgs.untranslate(R::INDEX, t.as_ptr().cast()))
}

// =============================================================================
// Counted pointer
// =============================================================================

/// Decoded value of an [`AtomicCountedPtr`].
pub struct Counted<T> {
  pub ptr: Option<NonNull<T>>,
  pub counter: u64,
}

impl<T> Counted<T> {
  #[inline]
  pub fn new(ptr: Option<NonNull<T>>, counter: u64) -> Self {
    Self { ptr, counter }
  }
}

impl<T> Clone for Counted<T> {
  fn clone(&self) -> Self {
    *self
  }
}

impl<T> Copy for Counted<T> {}

impl<T> PartialEq for Counted<T> {
  fn eq(&self, other: &Self) -> bool {
    self.ptr == other.ptr && self.counter == other.counter
  }
}

impl<T> fmt::Debug for Counted<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Counted")
      .field("ptr", &self.ptr)
      .field("counter", &self.counter)
      .finish()
  }
}

#[repr(transparent)]
pub struct AtomicCountedPtr<T, R: RegionKind> {
  word: AtomicU64,
  _marker: PhantomData<fn() -> (T, R)>,
}

impl<T, R: RegionKind> AtomicCountedPtr<T, R> {
  #[inline]
  fn pack(rgs: &Regions, value: Counted<T>) -> u64 {
    let offset = encode::<T, R>(rgs, value.ptr);
    debug_assert!(offset <= OFFSET_MASK);
    (value.counter << MAX_OFFSET_BITS) | offset
  }

  #[inline]
  fn unpack(rgs: &Regions, word: u64) -> Counted<T> {
    let ptr = match word & OFFSET_MASK {
      0 => None,
      offset => Some(rgs.translate(R::INDEX, offset).cast()),
    };
    Counted::new(ptr, word >> MAX_OFFSET_BITS)
  }

  #[inline]
  pub fn load(&self, rgs: &Regions) -> Counted<T> {
    Self::unpack(rgs, self.word.load(Ordering::Acquire))
  }

  /// On failure returns the value actually observed.
  #[inline]
  pub fn compare_exchange_weak(
    &self,
    rgs: &Regions,
    current: Counted<T>,
    new: Counted<T>,
  ) -> Result<Counted<T>, Counted<T>> {
    self
      .word
      .compare_exchange_weak(
        Self::pack(rgs, current),
        Self::pack(rgs, new),
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .map(|w| Self::unpack(rgs, w))
      .map_err(|w| Self::unpack(rgs, w))
  }

  /// Null head with counter 0.
  #[inline]
  pub fn clear(&self) {
    self.word.store(0, Ordering::Release);
  }
}
