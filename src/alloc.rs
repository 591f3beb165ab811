//! Allocation path.
//!
//! Thread cache first, then a partial superblock of the class, then a free superblock,
//! then region growth. Requests above the largest class get their own run of superblocks.

use core::ptr::NonNull;

use crate::{
  Ralloc, SB_SHIFT, SB_SIZE,
  anchor::{Anchor, SbState},
  block::Block,
  descriptor::Descriptor,
  error::{Error, Result},
  heap::Link,
  region::RegionIndex,
  size_class::{LARGE_CLASS, SizeClasses},
  tcache::{TCacheBin, TCaches},
};

impl<S: SizeClasses> Ralloc<S> {
  pub(crate) fn do_malloc(&self, size: usize, caches: &mut TCaches) -> Result<NonNull<u8>> {
    if size > self.classes.max_size() {
      return self.alloc_large(size);
    }

    let class = self.classes.classify(size);
    let bin = caches.bin(class);
    if bin.is_empty() {
      self.fill_cache(class, bin)?;
    }
    bin
      .pop_block()
      .map(Block::as_ptr)
      .ok_or(Error::OutOfMemory { requested: size })
  }

  /// Maps a fresh run of superblocks for one allocation. Large spans never come from the
  /// free-superblock pool.
  fn alloc_large(&self, size: usize) -> Result<NonNull<u8>> {
    let oom = Error::OutOfMemory { requested: size };
    let Some(span) = size.checked_next_multiple_of(SB_SIZE) else {
      return Err(oom);
    };
    let Some(sb) = self.regions.expand(RegionIndex::Superblock, span, SB_SIZE) else {
      return Err(oom);
    };

    let desc = self.desc_lookup(sb.as_ptr());
    desc.init(
      &self.regions,
      self.heap(LARGE_CLASS).into(),
      sb,
      span,
      1,
      Anchor::new(0, 0, SbState::Full),
    );
    log::trace!("large allocation of {span} bytes at slot {}", self.slot_of(sb.as_ptr()));
    Ok(sb)
  }

  fn fill_cache(&self, class: usize, bin: &mut TCacheBin) -> Result<()> {
    if self.malloc_from_partial(class, bin) {
      return Ok(());
    }
    self.malloc_from_newsb(class, bin)
  }

  /// Claims every free block of one partial superblock. Returns `false` if the class has no
  /// partial superblock.
  fn malloc_from_partial(&self, class: usize, bin: &mut TCacheBin) -> bool {
    let heap = self.heap(class);
    loop {
      let Some(ptr) = heap.partial.pop(&self.regions, Link::Partial) else {
        return false;
      };
      let desc = unsafe { ptr.as_ref() };
      let maxcount = desc.maxcount();

      // Frees may still add blocks concurrently; the CAS takes whatever is recorded.
      let mut old = desc.anchor.load();
      let claimed = loop {
        if old.state() == SbState::Empty {
          break None;
        }
        debug_assert_eq!(old.state(), SbState::Partial);
        debug_assert!(old.count() > 0);
        let new = Anchor::new(maxcount, 0, SbState::Full);
        match desc.anchor.compare_exchange_weak(old, new) {
          Ok(_) => break Some(old),
          Err(current) => old = current,
        }
      };

      match claimed {
        // Emptied while it sat on the partial stack.
        None => self.small_sb_retire(ptr),
        Some(old) => {
          let sb = self.sb_at(self.slot_of_desc(ptr));
          let head = unsafe { Block::at(sb, desc.block_size(), old.avail() as usize) };
          bin.push_list(head, old.count());
          return true;
        }
      }
    }
  }

  /// Carves a free superblock into blocks of `class` and hands all of them to the cache.
  fn malloc_from_newsb(&self, class: usize, bin: &mut TCacheBin) -> Result<()> {
    let block_size = self.classes.block_size(class);
    let maxcount = self.classes.blocks_per_superblock(class) as u32;
    let sb = self.small_sb_alloc()?;

    let head = unsafe { Block::link_run(sb, block_size, maxcount as usize) };
    let desc = self.desc_lookup(sb.as_ptr());
    desc.init(
      &self.regions,
      self.heap(class).into(),
      sb,
      block_size,
      maxcount,
      Anchor::new(maxcount, 0, SbState::Full),
    );
    bin.push_list(head, maxcount);
    Ok(())
  }

  /// Takes a superblock from the pool, growing the region when the pool is dry.
  fn small_sb_alloc(&self) -> Result<NonNull<u8>> {
    let pool = &self.meta().avail_sb;
    if let Some(desc) = pool.pop(&self.regions, Link::Free) {
      return Ok(self.sb_at(self.slot_of_desc(desc)));
    }

    let mut count = self.expand_superblocks;
    loop {
      let claimed = self.regions.expand(RegionIndex::Superblock, count << SB_SHIFT, SB_SIZE);
      if let Some(start) = claimed {
        let first = self.slot_of(start.as_ptr());
        log::debug!("claimed {count} superblocks at slot {first}");
        if count > 1 {
          self.organize_sb_list(first + 1, count - 1);
        }
        return Ok(start);
      }
      if count == 1 {
        break;
      }
      count /= 2;
    }

    // The region is full; a concurrent free may still have refilled the pool.
    pool
      .pop(&self.regions, Link::Free)
      .map(|desc| self.sb_at(self.slot_of_desc(desc)))
      .ok_or(Error::OutOfMemory { requested: SB_SIZE })
  }

  /// Resets slots `first .. first + count` and pushes them onto the pool with one CAS.
  pub(crate) fn organize_sb_list(&self, first: usize, count: usize) {
    debug_assert!(count > 0);
    let last = first + count - 1;
    for slot in first..=last {
      let desc = self.desc_at(slot);
      desc.reset();
      if slot < last {
        desc.next_free.store(Some(self.desc_ptr(slot + 1)));
      }
    }
    self
      .meta()
      .avail_sb
      .push_chain(&self.regions, self.desc_ptr(first), self.desc_ptr(last), Link::Free);
  }

  /// Returns an empty small superblock to the pool.
  pub(crate) fn small_sb_retire(&self, desc: NonNull<Descriptor>) {
    unsafe { desc.as_ref() }.reset();
    self.meta().avail_sb.push(&self.regions, desc, Link::Free);
  }
}
