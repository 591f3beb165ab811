use std::{collections::HashSet, path::Path, ptr::NonNull};

use ralloc::{
  CLASSES_MAX_SIZE, Config, Error, LARGE_CLASS, MAX_ROOTS, Ralloc, SB_SIZE, SbState,
  SizeClasses,
};

fn config(dir: &Path) -> Config {
  Config::new(dir.join("heap"))
    .size(128 * SB_SIZE as u64)
    .expand_superblocks(4)
}

#[test]
fn roots_survive_remapping() {
  let dir = tempfile::tempdir().unwrap();
  let heap = Ralloc::open(&config(dir.path())).unwrap();
  let (first, second) = {
    let mut local = heap.local();
    let a = local.allocate(24).unwrap();
    let b = local.allocate(5000).unwrap();
    unsafe {
      a.as_ptr().cast::<u64>().write(0xFEED);
      b.as_ptr().cast::<u64>().write(0xBEEF);
    }
    (a, b)
  };
  heap.set_root(0, Some(first)).unwrap();
  heap.set_root(MAX_ROOTS - 1, Some(second)).unwrap();
  heap.close().unwrap();

  // Another heap of the same shape tends to take over the old address range.
  let other_dir = tempfile::tempdir().unwrap();
  let _other = Ralloc::open(&config(other_dir.path())).unwrap();

  let heap = Ralloc::open(&config(dir.path())).unwrap();
  assert!(heap.is_restart());
  let a = heap.get_root(0).unwrap().unwrap();
  let b = heap.get_root(MAX_ROOTS - 1).unwrap().unwrap();
  assert!(heap.contains(a.as_ptr()) && heap.contains(b.as_ptr()));
  assert_eq!(unsafe { a.as_ptr().cast::<u64>().read() }, 0xFEED);
  assert_eq!(unsafe { b.as_ptr().cast::<u64>().read() }, 0xBEEF);
  let classes = heap.size_classes();
  assert_eq!(heap.usable_size(b.as_ptr()), Some(classes.block_size(classes.classify(5000))));
  assert_eq!(heap.get_root(1).unwrap(), None);
}

#[test]
fn clearing_a_root_returns_previous_value() {
  let dir = tempfile::tempdir().unwrap();
  let heap = Ralloc::open(&config(dir.path())).unwrap();
  let mut local = heap.local();
  let p = local.allocate(64).unwrap();
  assert_eq!(heap.set_root(3, Some(p)).unwrap(), None);
  assert_eq!(heap.set_root(3, None).unwrap(), Some(p));
  assert_eq!(heap.get_root(3).unwrap(), None);
}

#[test]
fn free_then_malloc_round_trips_per_class() {
  let dir = tempfile::tempdir().unwrap();
  let heap = Ralloc::open(&config(dir.path())).unwrap();
  let mut local = heap.local();
  for size in [0, 1, 8, 17, 129, 1000, 4097, CLASSES_MAX_SIZE] {
    let p = local.allocate(size).unwrap();
    unsafe { local.deallocate(p) };
    assert_eq!(local.allocate(size).unwrap(), p, "size {size}");
  }
}

/// Blocks of `class` the superblock at `start` counts as handed out: neither recorded free
/// nor retired with it.
fn handed_out(heap: &Ralloc, start: NonNull<u8>, class: usize) -> usize {
  match heap.superblock_info(start.as_ptr()) {
    Some(info) if info.class == class && info.state != SbState::Empty => {
      (info.maxcount - info.free) as usize
    }
    _ => 0,
  }
}

#[test]
fn superblock_accounting_tracks_live_and_cached_blocks() {
  let dir = tempfile::tempdir().unwrap();
  let heap = Ralloc::open(&config(dir.path())).unwrap();
  let class = heap.size_classes().classify(256);
  let mut local = heap.local();
  let mut live: Vec<NonNull<u8>> = Vec::new();
  let mut starts: HashSet<NonNull<u8>> = HashSet::new();

  let mut rng = 0x2545_F491_4F6C_DD1D_u64;
  for step in 0..3000 {
    rng ^= rng << 13;
    rng ^= rng >> 7;
    rng ^= rng << 17;
    // Mostly allocate for the first half, mostly free for the second.
    let grow = if step < 1500 { rng % 4 != 0 } else { rng % 4 == 0 };
    if grow || live.is_empty() {
      let p = local.allocate(256).unwrap();
      starts.insert(heap.superblock_info(p.as_ptr()).unwrap().start);
      live.push(p);
    } else {
      let p = live.swap_remove((rng >> 32) as usize % live.len());
      unsafe { local.deallocate(p) };
    }

    let handed: usize = starts.iter().map(|&start| handed_out(&heap, start, class)).sum();
    assert_eq!(handed, live.len() + local.cached(class), "step {step}");

    // With the cache drained the identity holds superblock by superblock.
    if step % 100 == 99 {
      local.flush();
      assert_eq!(local.cached(class), 0);
      for &start in &starts {
        let here = live
          .iter()
          .filter(|p| heap.superblock_info(p.as_ptr()).unwrap().start == start)
          .count();
        assert_eq!(handed_out(&heap, start, class), here, "step {step}");
      }
    }
  }
}

#[test]
fn class_boundary_and_large_boundary() {
  let dir = tempfile::tempdir().unwrap();
  let heap = Ralloc::open(&config(dir.path())).unwrap();
  let classes = heap.size_classes();
  let mut local = heap.local();

  let top = local.allocate(CLASSES_MAX_SIZE).unwrap();
  let info = heap.superblock_info(top.as_ptr()).unwrap();
  assert_ne!(info.class, LARGE_CLASS);
  assert_eq!(info.block_size, CLASSES_MAX_SIZE);
  assert_eq!(info.maxcount as usize, classes.blocks_per_superblock(info.class));

  let large = local.allocate(CLASSES_MAX_SIZE + 1).unwrap();
  let info = heap.superblock_info(large.as_ptr()).unwrap();
  assert_eq!((info.class, info.maxcount, info.state), (LARGE_CLASS, 1, SbState::Full));

  let huge = local.allocate(5 * SB_SIZE).unwrap();
  assert_eq!(heap.usable_size(huge.as_ptr()), Some(5 * SB_SIZE));
  // Interior superblocks of a span resolve to nothing.
  assert_eq!(heap.usable_size(unsafe { huge.as_ptr().add(2 * SB_SIZE) }), None);
}

#[test]
fn large_allocations_survive_clean_restart() {
  let dir = tempfile::tempdir().unwrap();
  let heap = Ralloc::open(&config(dir.path())).unwrap();
  let p = heap.local().allocate(3 * SB_SIZE).unwrap();
  heap.set_root(0, Some(p)).unwrap();
  heap.close().unwrap();

  let mut heap = Ralloc::open(&config(dir.path())).unwrap();
  let p = heap.get_root(0).unwrap().unwrap();
  assert_eq!(heap.usable_size(p.as_ptr()), Some(3 * SB_SIZE));
  let spans: Vec<_> = heap.in_use_blocks().collect();
  assert_eq!(spans, vec![(p, 3 * SB_SIZE)]);
}

#[test]
fn invalid_configs_are_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let tiny = config(dir.path()).size(SB_SIZE as u64);
  assert!(matches!(Ralloc::open(&tiny), Err(Error::InvalidConfig(_))));
  let no_growth = config(dir.path()).expand_superblocks(0);
  assert!(matches!(Ralloc::open(&no_growth), Err(Error::InvalidConfig(_))));
  let huge = config(dir.path()).size(1 << 41);
  assert!(matches!(Ralloc::open(&huge), Err(Error::InvalidConfig(_))));
}

/// Powers of two from 16 to 2048 bytes.
struct Pow2Classes;

impl SizeClasses for Pow2Classes {
  fn count(&self) -> usize {
    9
  }

  fn max_size(&self) -> usize {
    2048
  }

  fn classify(&self, size: usize) -> usize {
    size.max(16).next_power_of_two().trailing_zeros() as usize - 3
  }

  fn block_size(&self, class: usize) -> usize {
    8 << class
  }
}

#[test]
fn custom_size_classes_drive_allocation() {
  let dir = tempfile::tempdir().unwrap();
  let heap = Ralloc::with_size_classes(&config(dir.path()), Pow2Classes).unwrap();
  let mut local = heap.local();

  let p = local.allocate(100).unwrap();
  assert_eq!(heap.usable_size(p.as_ptr()), Some(128));
  assert_eq!(local.cached(4), SB_SIZE / 128 - 1);

  let q = local.allocate(2049).unwrap();
  assert_eq!(heap.usable_size(q.as_ptr()), Some(SB_SIZE));
}

/// A table whose last class cannot hold `max_size`.
struct ShortTable;

impl SizeClasses for ShortTable {
  fn count(&self) -> usize {
    2
  }

  fn max_size(&self) -> usize {
    64
  }

  fn classify(&self, _: usize) -> usize {
    1
  }

  fn block_size(&self, _: usize) -> usize {
    32
  }
}

#[test]
fn inconsistent_size_classes_are_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let err = Ralloc::with_size_classes(&config(dir.path()), ShortTable).unwrap_err();
  assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
}
