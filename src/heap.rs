//! Lock-free descriptor stacks and per-class heaps.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicU64, Ordering},
};

use crate::{
  descriptor::Descriptor,
  ptr::{AtomicCountedPtr, AtomicRelPtr, Counted, InDescriptors},
  region::Regions,
};

/// Which intrusive link of a descriptor a stack threads through.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Link {
  Free,
  Partial,
}

impl Link {
  #[inline]
  fn of(self, desc: &Descriptor) -> &AtomicRelPtr<Descriptor> {
    match self {
      Link::Free => &desc.next_free,
      Link::Partial => &desc.next_partial,
    }
  }
}

/// Treiber stack of descriptors with a generation-counted head.
///
/// Push increments the counter and pop keeps it, so a head that was popped and pushed
/// back between a reader's load and its CAS no longer compares equal.
#[repr(transparent)]
pub struct DescriptorStack {
  head: AtomicCountedPtr<Descriptor, InDescriptors>,
}

impl DescriptorStack {
  #[inline]
  pub fn push(&self, rgs: &Regions, desc: NonNull<Descriptor>, link: Link) {
    self.push_chain(rgs, desc, desc, link);
  }

  /// Pushes the already linked chain `first ..= last` with a single CAS.
  pub fn push_chain(
    &self,
    rgs: &Regions,
    first: NonNull<Descriptor>,
    last: NonNull<Descriptor>,
    link: Link,
  ) {
    let tail = link.of(unsafe { last.as_ref() });
    let mut old = self.head.load(rgs);
    loop {
      debug_assert_ne!(old.ptr, Some(first));
      tail.store(old.ptr);
      let new = Counted::new(Some(first), old.counter + 1);
      match self.head.compare_exchange_weak(rgs, old, new) {
        Ok(_) => return,
        Err(current) => old = current,
      }
    }
  }

  pub fn pop(&self, rgs: &Regions, link: Link) -> Option<NonNull<Descriptor>> {
    let mut old = self.head.load(rgs);
    loop {
      let desc = old.ptr?;
      // Descriptors are never unmapped, so reading a stale link is harmless; the CAS
      // rejects it.
      let next = link.of(unsafe { desc.as_ref() }).load();
      match self.head.compare_exchange_weak(rgs, old, Counted::new(next, old.counter)) {
        Ok(_) => return Some(desc),
        Err(current) => old = current,
      }
    }
  }

  #[cfg(test)]
  pub fn is_empty(&self, rgs: &Regions) -> bool {
    self.head.load(rgs).ptr.is_none()
  }

  /// Empties the stack and restarts the generation counter.
  #[inline]
  pub fn clear(&self) {
    self.head.clear();
  }
}

/// Shared state of one size class.
#[repr(C, align(64))]
pub struct ProcHeap {
  /// Descriptors of this class in the PARTIAL state.
  pub partial: DescriptorStack,
  class: AtomicU64,
}

impl ProcHeap {
  #[inline]
  pub fn class(&self) -> usize {
    self.class.load(Ordering::Relaxed) as usize
  }

  pub(crate) fn set_class(&self, class: usize) {
    self.class.store(class as u64, Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    DESC_SIZE,
    region::{Region, RegionIndex},
  };
  use std::{collections::HashSet, sync::Barrier};

  const SLOTS: usize = 64;

  fn regions(dir: &std::path::Path) -> Regions {
    let (sb, _) = Region::open(&dir.join("sb"), 1 << 20, 1 << 16).unwrap();
    let (desc, _) = Region::open(&dir.join("desc"), SLOTS * DESC_SIZE, DESC_SIZE).unwrap();
    let (meta, _) = Region::open(&dir.join("meta"), 4096, 64).unwrap();
    Regions::new(sb, desc, meta)
  }

  fn desc(rgs: &Regions, slot: usize) -> NonNull<Descriptor> {
    rgs.translate(RegionIndex::Descriptor, (slot * DESC_SIZE) as u64).cast()
  }

  fn stack(rgs: &Regions) -> &DescriptorStack {
    unsafe { rgs.translate(RegionIndex::Meta, 64).cast::<DescriptorStack>().as_ref() }
  }

  #[test]
  fn lifo_order() {
    let dir = tempfile::tempdir().unwrap();
    let rgs = regions(dir.path());
    let s = stack(&rgs);
    assert!(s.pop(&rgs, Link::Free).is_none());
    for slot in 1..4 {
      s.push(&rgs, desc(&rgs, slot), Link::Free);
    }
    assert_eq!(s.pop(&rgs, Link::Free), Some(desc(&rgs, 3)));
    assert_eq!(s.pop(&rgs, Link::Free), Some(desc(&rgs, 2)));
    assert_eq!(s.pop(&rgs, Link::Free), Some(desc(&rgs, 1)));
    assert!(s.is_empty(&rgs));
  }

  #[test]
  fn chain_push_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let rgs = regions(dir.path());
    let s = stack(&rgs);
    s.push(&rgs, desc(&rgs, 9), Link::Free);
    for slot in 1..4 {
      let d = unsafe { desc(&rgs, slot).as_ref() };
      d.next_free.store(Some(desc(&rgs, slot + 1)));
    }
    s.push_chain(&rgs, desc(&rgs, 1), desc(&rgs, 4), Link::Free);
    let popped: Vec<_> = core::iter::from_fn(|| s.pop(&rgs, Link::Free)).collect();
    let expected: Vec<_> = [1, 2, 3, 4, 9].iter().map(|&i| desc(&rgs, i)).collect();
    assert_eq!(popped, expected);
  }

  #[test]
  fn recycled_head_fails_stale_cas() {
    let dir = tempfile::tempdir().unwrap();
    let rgs = regions(dir.path());
    let s = stack(&rgs);
    let (a, b) = (desc(&rgs, 1), desc(&rgs, 2));
    s.push(&rgs, b, Link::Partial);
    s.push(&rgs, a, Link::Partial);

    // A reader observes `a -> b`, then another thread pops both and pushes `a` back.
    let observed = s.head.load(&rgs);
    assert_eq!(observed.ptr, Some(a));
    s.pop(&rgs, Link::Partial);
    s.pop(&rgs, Link::Partial);
    s.push(&rgs, a, Link::Partial);

    let swing = Counted::new(Some(b), observed.counter);
    let current = s.head.compare_exchange_weak(&rgs, observed, swing).unwrap_err();
    assert_eq!(current.ptr, Some(a));
    assert_ne!(current.counter, observed.counter);
  }

  #[test]
  fn concurrent_push_pop_loses_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let rgs = regions(dir.path());
    let s = stack(&rgs);
    for slot in 1..SLOTS {
      s.push(&rgs, desc(&rgs, slot), Link::Free);
    }

    let barrier = Barrier::new(4);
    std::thread::scope(|scope| {
      for _ in 0..4 {
        scope.spawn(|| {
          barrier.wait();
          for _ in 0..10_000 {
            let mut held = Vec::new();
            for _ in 0..3 {
              if let Some(d) = s.pop(&rgs, Link::Free) {
                held.push(d);
              }
            }
            for d in held {
              s.push(&rgs, d, Link::Free);
            }
          }
        });
      }
    });

    let drained: HashSet<_> = core::iter::from_fn(|| s.pop(&rgs, Link::Free)).collect();
    assert_eq!(drained.len(), SLOTS - 1);
  }
}
