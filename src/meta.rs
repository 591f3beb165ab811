//! The persistent root record of a heap.

use core::{
  mem::size_of,
  ptr::NonNull,
  sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use crate::{
  dirty::DirtyLock,
  heap::{DescriptorStack, ProcHeap},
  persist,
  ptr::{AtomicCrossPtr, InSuperblocks},
};

/// Magic number identifying formatted metadata.
const META_MAGIC: u64 = 0x5241_4C4C_4F43_4D44; // "RALLOCMD"

/// Capacity of the heap table; bounds the number of size classes.
pub const MAX_SIZE_CLASSES: usize = 64;

/// Capacity of the application root table.
pub const MAX_ROOTS: usize = 1024;

#[repr(C, align(64))]
pub struct BaseMeta {
  magic: AtomicU64,
  /// Superblock slots the heap was formatted with.
  superblocks: AtomicU64,
  /// Set by a simulated crash; consumed by the next open.
  fake_dirty: AtomicBool,
  pub dirty: DirtyLock,
  /// Unused superblocks, linked through `next_free`.
  pub avail_sb: DescriptorStack,
  pub heaps: [ProcHeap; MAX_SIZE_CLASSES],
  pub roots: [AtomicCrossPtr<u8, InSuperblocks>; MAX_ROOTS],
}

/// Bytes the metadata region needs after its header.
pub const BASE_META_SIZE: usize = size_of::<BaseMeta>();

impl BaseMeta {
  #[inline]
  pub fn is_formatted(&self) -> bool {
    self.magic.load(Ordering::Acquire) == META_MAGIC
  }

  /// Initializes zeroed metadata. The magic is written last.
  pub fn format(&self, superblocks: u64) -> Result<(), i32> {
    self.superblocks.store(superblocks, Ordering::Relaxed);
    self.fake_dirty.store(false, Ordering::Relaxed);
    self.dirty.init()?;
    self.avail_sb.clear();
    for (class, heap) in self.heaps.iter().enumerate() {
      heap.partial.clear();
      heap.set_class(class);
    }
    self.roots.iter().for_each(AtomicCrossPtr::store_null);
    persist::flush(self);
    persist::fence();
    self.magic.store(META_MAGIC, Ordering::Release);
    persist::flush(&self.magic);
    persist::fence();
    Ok(())
  }

  #[inline]
  pub fn superblocks(&self) -> u64 {
    self.superblocks.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn heap(&self, class: usize) -> &ProcHeap {
    &self.heaps[class]
  }

  /// Class of a heap reference read from a descriptor, if it names one of our heaps.
  pub fn class_of(&self, heap: NonNull<ProcHeap>) -> Option<usize> {
    let base = self.heaps.as_ptr() as usize;
    let addr = heap.as_ptr() as usize;
    let offset = addr.checked_sub(base)?;
    let class = offset / size_of::<ProcHeap>();
    (offset % size_of::<ProcHeap>() == 0 && class < MAX_SIZE_CLASSES).then_some(class)
  }

  /// Persists a fake-dirty mark so the next open recovers conservatively.
  pub fn mark_fake_dirty(&self) {
    self.fake_dirty.store(true, Ordering::Release);
    persist::flush(&self.fake_dirty);
    persist::fence();
  }

  /// Clears and returns the fake-dirty mark.
  pub fn take_fake_dirty(&self) -> bool {
    let was = self.fake_dirty.swap(false, Ordering::AcqRel);
    persist::flush(&self.fake_dirty);
    persist::fence();
    was
  }

  /// Writes back the whole record.
  pub fn persist(&self) {
    persist::flush(self);
    persist::fence();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn zeroed() -> Box<BaseMeta> {
    unsafe { Box::new_zeroed().assume_init() }
  }

  #[test]
  fn format_sets_classes_and_magic() {
    let meta = zeroed();
    assert!(!meta.is_formatted());
    meta.format(128).unwrap();
    assert!(meta.is_formatted());
    assert_eq!(meta.superblocks(), 128);
    assert_eq!(meta.heap(7).class(), 7);
    assert!(meta.roots.iter().all(AtomicCrossPtr::is_null));
  }

  #[test]
  fn class_of_rejects_foreign_pointers() {
    let meta = zeroed();
    let heap = NonNull::from(meta.heap(5));
    assert_eq!(meta.class_of(heap), Some(5));
    let inside = unsafe { heap.cast::<u8>().add(8).cast::<ProcHeap>() };
    assert_eq!(meta.class_of(inside), None);
    let before = NonNull::from(&*meta).cast::<ProcHeap>();
    assert_eq!(meta.class_of(before), None);
  }

  #[test]
  fn fake_dirty_is_consumed() {
    let meta = zeroed();
    meta.format(8).unwrap();
    assert!(!meta.take_fake_dirty());
    meta.mark_fake_dirty();
    assert!(meta.take_fake_dirty());
    assert!(!meta.take_fake_dirty());
  }
}
