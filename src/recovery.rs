//! Metadata reconstruction at open.
//!
//! A single pass over the superblock grid rebuilds the free-superblock stack and every
//! partial stack from the descriptors alone. Dirty mode trusts only what is written
//! durably when a superblock is created (owning heap, geometry) and treats every small
//! superblock as fully allocated. Clean mode also trusts the anchors and their free lists.

use core::ptr::NonNull;

use crate::{
  Ralloc, SB_SHIFT, SB_SIZE,
  anchor::{Anchor, SbState},
  block::Block,
  error::{Error, Result},
  heap::Link,
  persist,
  size_class::{LARGE_CLASS, SizeClasses},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecoveryMode {
  /// The previous owner died: anchors and free lists may be stale.
  Dirty,
  /// The previous owner drained its caches and released the heap.
  Clean,
}

/// What a recovery pass found, in superblocks.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct RecoveryStats {
  pub free: usize,
  pub partial: usize,
  pub full: usize,
  /// Large allocations, each counted once regardless of span.
  pub large: usize,
}

enum SlotKind {
  Unused,
  Small { class: usize, maxcount: u32 },
  Large { span: usize },
}

impl<S: SizeClasses> Ralloc<S> {
  /// Classifies slot `slot` from its descriptor. `end` is the first slot never handed out.
  fn classify_slot(&self, slot: usize, end: usize, mode: RecoveryMode) -> Result<SlotKind> {
    let desc = self.desc_at(slot);
    let Some(heap) = desc.heap(&self.regions) else {
      return Ok(SlotKind::Unused);
    };
    // An empty superblock may still sit on a partial stack; after a clean shutdown it is
    // simply free.
    if mode == RecoveryMode::Clean && desc.anchor.load().state() == SbState::Empty {
      return Ok(SlotKind::Unused);
    }

    let fail = |reason| Error::Recovery { slot, reason };
    let class = self
      .meta()
      .class_of(heap)
      .filter(|&class| class < self.classes.count())
      .ok_or_else(|| fail("descriptor names no heap of this allocator"))?;
    if desc.superblock_offset() != (slot << SB_SHIFT) as u64 {
      return Err(fail("descriptor does not point at its own superblock"));
    }

    let block_size = desc.block_size();
    let maxcount = desc.maxcount();
    if class == LARGE_CLASS {
      if maxcount != 1 || block_size == 0 || block_size % SB_SIZE != 0 {
        return Err(fail("malformed large allocation"));
      }
      let span = block_size >> SB_SHIFT;
      if slot + span > end {
        return Err(fail("large allocation runs past the end of the superblock grid"));
      }
      Ok(SlotKind::Large { span })
    } else {
      if block_size != self.classes.block_size(class)
        || maxcount as usize != self.classes.blocks_per_superblock(class)
      {
        return Err(fail("superblock geometry differs from its size class"));
      }
      Ok(SlotKind::Small { class, maxcount })
    }
  }

  /// Rebuilds all transient allocator state. The heap must be quiescent.
  pub(crate) fn run_recovery(&self, mode: RecoveryMode) -> Result<RecoveryStats> {
    let meta = self.meta();
    meta.avail_sb.clear();
    for class in 0..self.classes.count() {
      self.heap(class).partial.clear();
    }

    let end = self.slots_in_use();
    let mut stats = RecoveryStats::default();
    let mut slot = 1;
    while slot < end {
      let desc = self.desc_at(slot);
      match self.classify_slot(slot, end, mode)? {
        SlotKind::Unused => {
          desc.reset();
          meta.avail_sb.push(&self.regions, self.desc_ptr(slot), Link::Free);
          stats.free += 1;
          slot += 1;
        }
        SlotKind::Large { span } => {
          desc.clear_links();
          desc.anchor.store(Anchor::new(0, 0, SbState::Full));
          desc.persist();
          stats.large += 1;
          slot += span;
        }
        SlotKind::Small { class, maxcount } => {
          let anchor = match mode {
            RecoveryMode::Dirty => Anchor::new(maxcount, 0, SbState::Full),
            RecoveryMode::Clean => self.checked_anchor(slot, desc.anchor.load(), maxcount)?,
          };
          desc.clear_links();
          desc.anchor.store(anchor);
          desc.persist();
          if anchor.state() == SbState::Partial {
            self.heap(class).partial.push(&self.regions, self.desc_ptr(slot), Link::Partial);
            stats.partial += 1;
          } else {
            stats.full += 1;
          }
          slot += 1;
        }
      }
    }

    persist::fence();
    meta.persist();
    log::info!(
      "{mode:?} recovery of {} superblocks: {} free, {} partial, {} full, {} large",
      end.saturating_sub(1),
      stats.free,
      stats.partial,
      stats.full,
      stats.large,
    );
    Ok(stats)
  }

  /// Validates a persisted anchor and its free list, returning the anchor to keep.
  fn checked_anchor(&self, slot: usize, anchor: Anchor, maxcount: u32) -> Result<Anchor> {
    let fail = |reason| Error::Recovery { slot, reason };
    if !anchor.is_valid() {
      return Err(fail("anchor holds an unknown state"));
    }
    match anchor.state() {
      SbState::Full if anchor.count() == 0 => Ok(Anchor::new(maxcount, 0, SbState::Full)),
      SbState::Full => Err(fail("full superblock records free blocks")),
      SbState::Partial => {
        if anchor.count() == 0 || anchor.count() >= maxcount {
          return Err(fail("partial superblock records an impossible free count"));
        }
        self
          .free_map(slot, anchor)
          .ok_or_else(|| fail("free list leaves its superblock or loops"))?;
        Ok(anchor)
      }
      SbState::Empty => Err(fail("empty superblock classified as in use")),
    }
  }

  /// Marks the blocks on the free list recorded by `anchor`, or `None` if the list is
  /// shorter than recorded, loops, or leaves the superblock.
  fn free_map(&self, slot: usize, anchor: Anchor) -> Option<Vec<bool>> {
    let desc = self.desc_at(slot);
    let block_size = desc.block_size();
    let maxcount = desc.maxcount() as usize;
    let sb = self.sb_at(slot);
    let start = sb.as_ptr() as usize;

    let mut free = vec![false; maxcount];
    let mut idx = anchor.avail() as usize;
    for remaining in (0..anchor.count()).rev() {
      if idx >= maxcount || free[idx] {
        return None;
      }
      free[idx] = true;
      if remaining == 0 {
        break;
      }
      let offset = unsafe { Block::at(sb, block_size, idx) }.next()?.addr().wrapping_sub(start);
      if offset % block_size != 0 {
        return None;
      }
      idx = offset / block_size;
    }
    Some(free)
  }
}

// =============================================================================
// In-use iteration
// =============================================================================

struct SuperblockCursor {
  start: NonNull<u8>,
  block_size: usize,
  free: Vec<bool>,
  next: usize,
}

/// Iterator over allocated blocks, as `(pointer, usable size)`.
///
/// Small blocks are reported unless they sit on their superblock's free list, so blocks
/// stranded in an abandoned thread cache are reported as allocated.
pub struct InUseBlocks<'a, S: SizeClasses> {
  heap: &'a Ralloc<S>,
  slot: usize,
  end: usize,
  cursor: Option<SuperblockCursor>,
}

impl<'a, S: SizeClasses> InUseBlocks<'a, S> {
  pub(crate) fn new(heap: &'a Ralloc<S>) -> Self {
    Self {
      heap,
      slot: 1,
      end: heap.slots_in_use(),
      cursor: None,
    }
  }
}

impl<S: SizeClasses> Iterator for InUseBlocks<'_, S> {
  type Item = (NonNull<u8>, usize);

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if let Some(cursor) = &mut self.cursor {
        while cursor.next < cursor.free.len() {
          let idx = cursor.next;
          cursor.next += 1;
          if !cursor.free[idx] {
            let block = unsafe { cursor.start.add(idx * cursor.block_size) };
            return Some((block, cursor.block_size));
          }
        }
        self.cursor = None;
      }

      if self.slot >= self.end {
        return None;
      }
      let slot = self.slot;
      let heap = self.heap;
      match heap.classify_slot(slot, self.end, RecoveryMode::Clean) {
        Ok(SlotKind::Large { span }) => {
          self.slot += span;
          return Some((heap.sb_at(slot), span << SB_SHIFT));
        }
        Ok(SlotKind::Small { maxcount, .. }) => {
          self.slot += 1;
          let desc = heap.desc_at(slot);
          let anchor = desc.anchor.load();
          let free = match anchor.state() {
            SbState::Partial => heap.free_map(slot, anchor),
            _ => None,
          };
          self.cursor = Some(SuperblockCursor {
            start: heap.sb_at(slot),
            block_size: desc.block_size(),
            free: free.unwrap_or_else(|| vec![false; maxcount as usize]),
            next: 0,
          });
        }
        Ok(SlotKind::Unused) | Err(_) => self.slot += 1,
      }
    }
  }
}
