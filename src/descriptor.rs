//! Per-superblock descriptors.
//!
//! Descriptor `i` lives at offset `i << DESC_SHIFT` of the descriptor region and describes
//! superblock `i` for the lifetime of the heap. Descriptors are never freed, only
//! reinitialized in place.

use core::{
  mem::{offset_of, size_of},
  ptr::NonNull,
  sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use crate::{
  DESC_SIZE,
  anchor::{Anchor, AtomicAnchor},
  heap::ProcHeap,
  persist,
  ptr::{AtomicCrossPtr, AtomicRelPtr, InMeta, InSuperblocks},
  region::Regions,
};

#[repr(C, align(64))]
pub struct Descriptor {
  /// Owning heap; null means the slot is unused. Heap 0 marks a large allocation.
  heap: AtomicCrossPtr<ProcHeap, InMeta>,
  superblock: AtomicCrossPtr<u8, InSuperblocks>,
  /// Bytes per block; for a large allocation, the whole span.
  block_size: AtomicU64,
  maxcount: AtomicU32,
  pub anchor: AtomicAnchor,
  /// Link while on the free-superblock stack.
  pub next_free: AtomicRelPtr<Descriptor>,
  /// Link while on a heap's partial stack.
  pub next_partial: AtomicRelPtr<Descriptor>,
}

const _: () = assert!(size_of::<Descriptor>() == DESC_SIZE);
const _: () = assert!(offset_of!(Descriptor, heap) == 0);

impl Descriptor {
  /// Publishes a superblock. Every other field is durable before `heap` is written, so a
  /// crash at any point leaves either an unused slot or a complete descriptor.
  pub fn init(
    &self,
    rgs: &Regions,
    heap: NonNull<ProcHeap>,
    superblock: NonNull<u8>,
    block_size: usize,
    maxcount: u32,
    anchor: Anchor,
  ) {
    self.superblock.store(rgs, Some(superblock));
    self.block_size.store(block_size as u64, Ordering::Relaxed);
    self.maxcount.store(maxcount, Ordering::Relaxed);
    self.anchor.store(anchor);
    self.clear_links();
    persist::flush(self);
    persist::fence();
    self.heap.store(rgs, Some(heap));
    persist::flush(self);
    persist::fence();
  }

  /// Returns the slot to the unused state. `heap` is cleared and made durable first.
  pub fn reset(&self) {
    self.heap.store_null();
    persist::flush(self);
    persist::fence();
    self.superblock.store_null();
    self.block_size.store(0, Ordering::Relaxed);
    self.maxcount.store(0, Ordering::Relaxed);
    self.anchor.store(Anchor::from_raw(0));
    self.clear_links();
    persist::flush(self);
    persist::fence();
  }

  #[inline]
  pub fn clear_links(&self) {
    self.next_free.store(None);
    self.next_partial.store(None);
  }

  #[inline]
  pub fn heap(&self, rgs: &Regions) -> Option<NonNull<ProcHeap>> {
    self.heap.load(rgs)
  }

  #[inline]
  pub fn is_unused(&self) -> bool {
    self.heap.is_null()
  }

  #[inline]
  pub fn superblock_offset(&self) -> u64 {
    self.superblock.offset()
  }

  #[inline]
  pub fn block_size(&self) -> usize {
    self.block_size.load(Ordering::Relaxed) as usize
  }

  #[inline]
  pub fn maxcount(&self) -> u32 {
    self.maxcount.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn persist(&self) {
    persist::flush(self);
  }
}
