//! Free path.
//!
//! Frees land in the thread cache. A full cache is drained back to the superblocks in runs:
//! consecutive cached blocks of one superblock go back with a single anchor CAS.

use core::ptr::NonNull;

use crate::{
  Ralloc, SB_SHIFT, SB_SIZE,
  anchor::{Anchor, SbState},
  block::Block,
  descriptor::Descriptor,
  heap::Link,
  size_class::{LARGE_CLASS, SizeClasses},
  tcache::{TCacheBin, TCaches},
};

impl<S: SizeClasses> Ralloc<S> {
  /// # Safety
  /// `ptr` must have been returned by this heap's allocation path and not freed since.
  pub(crate) unsafe fn do_free(&self, ptr: NonNull<u8>, caches: &mut TCaches) {
    debug_assert!(self.contains(ptr.as_ptr()));
    let desc = self.desc_lookup(ptr.as_ptr());
    let Some(heap) = desc.heap(&self.regions) else {
      log::error!("free of {ptr:p} outside any live superblock");
      return;
    };
    let class = unsafe { heap.as_ref() }.class();

    if class == LARGE_CLASS {
      self.large_sb_retire(desc);
      return;
    }

    // Drain before pushing so the block just freed is the next one handed out.
    let bin = caches.bin(class);
    if bin.len() as usize >= self.classes.cache_threshold(class) {
      self.flush_cache(class, bin);
    }
    bin.push_block(unsafe { Block::from_ptr(ptr) });
  }

  /// Returns every block of `bin` to its superblock.
  pub(crate) fn flush_cache(&self, class: usize, bin: &mut TCacheBin) {
    while let Some(head) = bin.peek() {
      let slot = self.slot_of(head.as_ptr().as_ptr());
      let desc_ptr = self.desc_ptr(slot);
      let desc = unsafe { desc_ptr.as_ref() };
      let sb = self.sb_at(slot);
      let sb_start = sb.as_ptr() as usize;

      // Once the anchor CAS succeeds the superblock may be retired and reused, so its
      // geometry is read first.
      let block_size = desc.block_size();
      let maxcount = desc.maxcount();

      let mut tail = head;
      let mut run = 1;
      while bin.len() > run {
        match tail.next() {
          Some(next) if (sb_start..sb_start + SB_SIZE).contains(&next.addr()) => {
            tail = next;
            run += 1;
          }
          _ => break,
        }
      }
      bin.pop_list(tail.next(), run);

      let idx = ((head.addr() - sb_start) / block_size) as u32;
      let mut old = desc.anchor.load();
      let new = loop {
        debug_assert_ne!(old.state(), SbState::Empty);
        let chain = (old.count() > 0)
          .then(|| unsafe { Block::at(sb, block_size, old.avail() as usize) });
        tail.set_next(chain);

        let total = old.count() + run;
        debug_assert!(total <= maxcount);
        let new = if total == maxcount {
          Anchor::new(idx, maxcount - 1, SbState::Empty)
        } else {
          Anchor::new(idx, total, SbState::Partial)
        };
        match desc.anchor.compare_exchange_weak(old, new) {
          Ok(_) => break new,
          Err(current) => old = current,
        }
      };

      // A superblock that was partial is already on its heap's stack; whoever pops it next
      // deals with it becoming empty.
      if old.state() == SbState::Full {
        if new.state() == SbState::Empty {
          self.small_sb_retire(desc_ptr);
        } else {
          self.heap(class).partial.push(&self.regions, desc_ptr, Link::Partial);
        }
      }
    }
  }

  /// Returns every superblock of a large allocation to the pool.
  fn large_sb_retire(&self, desc: &Descriptor) {
    let span = desc.block_size();
    let first = self.slot_of_desc(desc.into());
    debug_assert!(span > 0 && span % SB_SIZE == 0);
    log::trace!("retiring large allocation of {span} bytes at slot {first}");
    self.organize_sb_list(first, span >> SB_SHIFT);
  }
}

#[cfg(test)]
mod tests {
  use crate::{Config, Ralloc, SB_SIZE, SbState, size_class::SizeClasses};

  fn open(dir: &std::path::Path) -> Ralloc {
    let config = Config::new(dir.join("heap"))
      .size(32 * SB_SIZE as u64)
      .expand_superblocks(2);
    Ralloc::open(&config).unwrap()
  }

  #[test]
  fn free_then_allocate_returns_same_block() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(dir.path());
    let mut local = heap.local();
    let _warm = local.allocate(100).unwrap();
    let p = local.allocate(100).unwrap();
    unsafe { local.deallocate(p) };
    assert_eq!(local.allocate(100).unwrap(), p);
  }

  #[test]
  fn full_cache_drains_before_push() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(dir.path());
    let mut local = heap.local();
    let class = heap.size_classes().classify(1024);
    let maxcount = heap.size_classes().blocks_per_superblock(class);
    let threshold = heap.size_classes().cache_threshold(class);

    // Take one whole superblock plus one block of the next.
    let blocks: Vec<_> = (0..=maxcount).map(|_| local.allocate(1024).unwrap()).collect();
    let info = heap.superblock_info(blocks[0].as_ptr()).unwrap();
    assert_eq!((info.free, info.state), (0, SbState::Full));

    for &p in &blocks[..maxcount] {
      unsafe { local.deallocate(p) };
    }
    // The cache held `maxcount - 1` spare blocks of the second superblock, so it overflowed
    // and was drained back at least once.
    assert!(local.cached(class) <= threshold);
    local.flush();
    assert_eq!(local.cached(class), 0);

    // Emptied while on the partial stack: marked, and retired by whoever pops it next.
    let first = heap.superblock_info(blocks[0].as_ptr()).unwrap();
    assert_eq!(first.state, SbState::Empty);
    assert_eq!(first.free as usize, maxcount - 1);
    let second = heap.superblock_info(blocks[maxcount].as_ptr()).unwrap();
    assert_eq!(second.state, SbState::Partial);
    assert_eq!(second.free as usize, maxcount - 1);
  }

  #[test]
  fn partial_superblock_is_reclaimed_by_next_fill() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(dir.path());
    let mut a = heap.local();
    let blocks: Vec<_> = (0..10).map(|_| a.allocate(256).unwrap()).collect();
    for &p in &blocks[..4] {
      unsafe { a.deallocate(p) };
    }
    drop(a);

    let info = heap.superblock_info(blocks[4].as_ptr()).unwrap();
    assert_eq!(info.state, SbState::Partial);
    let free = info.free;

    let mut b = heap.local();
    let p = b.allocate(256).unwrap();
    assert_eq!(heap.superblock_info(p.as_ptr()).unwrap().state, SbState::Full);
    assert_eq!(b.cached(heap.size_classes().classify(256)), free as usize - 1);
    assert!(!blocks[4..].contains(&p));
  }

  #[test]
  fn large_free_returns_every_slot_to_pool() {
    let dir = tempfile::tempdir().unwrap();
    let heap = open(dir.path());
    let mut local = heap.local();
    let big = local.allocate(3 * SB_SIZE).unwrap();
    let used = heap.slots_in_use();
    unsafe { local.deallocate(big) };
    assert_eq!(heap.usable_size(big.as_ptr()), None);

    // Small superblocks now come from the retired span without growing the region.
    let classes = heap.size_classes();
    let sizes = [16, 1024, 8192];
    let ptrs: Vec<_> = sizes.iter().map(|&s| local.allocate(s).unwrap()).collect();
    assert_eq!(heap.slots_in_use(), used);
    for (p, s) in ptrs.iter().zip(sizes) {
      assert_eq!(heap.usable_size(p.as_ptr()), Some(classes.block_size(classes.classify(s))));
    }
  }
}
