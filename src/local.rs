//! Per-thread allocation handle.

use core::{fmt, ptr::NonNull};

use crate::{
  Ralloc, SB_SIZE,
  block::Block,
  error::Result,
  persist,
  size_class::{SizeClassTable, SizeClasses},
  tcache::TCaches,
};

/// A thread's view of a [`Ralloc`] heap.
///
/// Owns one cache bin per size class. Small allocations and frees touch only the bins
/// until a bin runs dry or overflows. Dropping the handle drains every bin back to the
/// shared superblocks, which is what a thread does on exit.
pub struct LocalHeap<'a, S: SizeClasses = SizeClassTable> {
  heap: &'a Ralloc<S>,
  caches: TCaches,
}

impl<'a, S: SizeClasses> LocalHeap<'a, S> {
  pub(crate) fn new(heap: &'a Ralloc<S>) -> Self {
    Self {
      heap,
      caches: TCaches::new(heap.size_classes().count()),
    }
  }

  #[inline]
  pub fn heap(&self) -> &'a Ralloc<S> {
    self.heap
  }

  /// Allocates at least `size` bytes, 8-byte aligned (superblock-aligned above
  /// [`SizeClasses::max_size`]). A zero-byte request is served from the smallest class.
  #[inline]
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    self.heap.do_malloc(size, &mut self.caches)
  }

  /// Allocates and zeroes the whole usable block, with the zeroes made durable.
  pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>> {
    let ptr = self.allocate(size)?;
    let len = self.heap.usable_size(ptr.as_ptr()).unwrap_or(size);
    unsafe { Block::from_ptr(ptr).zero(len) };
    persist::flush_range(ptr.as_ptr(), len);
    persist::fence();
    Ok(ptr)
  }

  /// Resizes the block at `ptr`. The block is kept when its usable size already matches
  /// what `new_size` would get; otherwise the contents move to a new block and the old one
  /// is freed. `None` allocates.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this heap. On success it must no longer be used
  /// unless it is the returned pointer. On error it stays valid.
  pub unsafe fn reallocate(
    &mut self,
    ptr: Option<NonNull<u8>>,
    new_size: usize,
  ) -> Result<NonNull<u8>> {
    let Some(old) = ptr else {
      return self.allocate(new_size);
    };
    let old_size = self.heap.usable_size(old.as_ptr()).unwrap_or(0);
    if old_size == self.target_size(new_size) {
      return Ok(old);
    }

    let new = self.allocate(new_size)?;
    let len = old_size.min(new_size);
    unsafe { Block::from_ptr(old).copy_to(Block::from_ptr(new), len) };
    persist::flush_range(new.as_ptr(), len);
    persist::fence();
    unsafe { self.deallocate(old) };
    Ok(new)
  }

  /// Returns the block at `ptr` to the heap.
  ///
  /// # Safety
  /// `ptr` must be a live allocation of this heap and must not be used afterwards.
  #[inline]
  pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
    unsafe { self.heap.do_free(ptr, &mut self.caches) }
  }

  /// Drains every bin back to its superblocks.
  pub fn flush(&mut self) {
    let heap = self.heap;
    for class in 1..heap.size_classes().count() {
      let bin = self.caches.bin(class);
      if !bin.is_empty() {
        heap.flush_cache(class, bin);
      }
    }
  }

  /// Blocks currently held in the bin of `class`.
  #[inline]
  pub fn cached(&self, class: usize) -> usize {
    self.caches.bins()[class].len() as usize
  }

  /// Discards the handle without draining its bins, as a thread killed mid-run would.
  /// The cached blocks stay allocated until the next dirty recovery.
  pub fn abandon(mut self) {
    self.caches.forget_all();
  }

  /// Usable size a fresh allocation of `size` bytes would get.
  fn target_size(&self, size: usize) -> usize {
    let classes = self.heap.size_classes();
    if size > classes.max_size() {
      size.checked_next_multiple_of(SB_SIZE).unwrap_or(0)
    } else {
      classes.block_size(classes.classify(size))
    }
  }
}

impl<S: SizeClasses> Drop for LocalHeap<'_, S> {
  fn drop(&mut self) {
    self.flush();
  }
}

impl<S: SizeClasses> fmt::Debug for LocalHeap<'_, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let cached: usize = self.caches.bins().iter().map(|bin| bin.len() as usize).sum();
    f.debug_struct("LocalHeap")
      .field("heap", &self.heap.path())
      .field("cached", &cached)
      .finish()
  }
}
