//! Lock-free, crash-consistent size-class allocator for persistent memory.
//!
//! A heap lives in three memory-mapped files: raw superblocks, one descriptor per
//! superblock, and a root record. Every persistent pointer is an offset, so a heap
//! reopened at a different base stays valid. Opening a heap detects whether the previous
//! owner shut down cleanly and rebuilds the allocator metadata before any allocation is
//! served.
//!
//! ```no_run
//! use ralloc::{Config, Ralloc};
//!
//! let heap = Ralloc::open(&Config::new("/mnt/pmem/app").size(1 << 28))?;
//! let mut local = heap.local();
//! let ptr = local.allocate(64)?;
//! heap.set_root(0, Some(ptr))?;
//! drop(local);
//! heap.close()?;
//! # Ok::<(), ralloc::Error>(())
//! ```

#![allow(clippy::missing_safety_doc)]

use core::{
  fmt,
  ptr::NonNull,
  sync::atomic::{AtomicU8, Ordering},
};
use std::path::{Path, PathBuf};

mod alloc;
mod anchor;
mod block;
mod config;
mod descriptor;
mod dirty;
mod error;
mod free;
mod heap;
mod local;
mod meta;
mod persist;
mod ptr;
mod recovery;
mod region;
mod size_class;
mod tcache;

pub use anchor::SbState;
pub use config::{Config, DEFAULT_EXPAND_SUPERBLOCKS, DEFAULT_HEAP_SIZE};
pub use error::{Error, Result};
pub use local::LocalHeap;
pub use meta::{MAX_ROOTS, MAX_SIZE_CLASSES};
pub use recovery::{InUseBlocks, RecoveryMode, RecoveryStats};
pub use size_class::{CLASSES_MAX_SIZE, LARGE_CLASS, SizeClassTable, SizeClasses};

use descriptor::Descriptor;
use dirty::LockState;
use heap::ProcHeap;
use meta::{BASE_META_SIZE, BaseMeta};
use region::{REGION_HEADER_SIZE, Region, RegionIndex, Regions};

// =============================================================================
// Constants
// =============================================================================

pub const SB_SHIFT: usize = 16;
/// Superblock size; the heap is a grid of superblocks.
pub const SB_SIZE: usize = 1 << SB_SHIFT; // 64KB

const DESC_SHIFT: usize = 6;
const DESC_SIZE: usize = 1 << DESC_SHIFT;

/// Bits of a counted pointer that hold the region offset; the rest hold the counter.
const MAX_OFFSET_BITS: u32 = 40;

const PAGE_SIZE: usize = 4096;

const META_REGION_SIZE: usize = align_up(REGION_HEADER_SIZE + BASE_META_SIZE, PAGE_SIZE);

const _: () = assert!(SB_SIZE.is_power_of_two());
const _: () = assert!(DESC_SIZE == size_of::<Descriptor>());
const _: () = assert!(REGION_HEADER_SIZE % align_of::<BaseMeta>() == 0);

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Heap state
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapState {
  Uninitialized = 0,
  /// The previous owner died holding the heap, or a dirty restart was forced.
  DirtyDetected = 1,
  CleanDetected = 2,
  Recovering = 3,
  Ready = 4,
}

impl HeapState {
  fn from_u8(v: u8) -> Self {
    match v {
      1 => HeapState::DirtyDetected,
      2 => HeapState::CleanDetected,
      3 => HeapState::Recovering,
      4 => HeapState::Ready,
      _ => HeapState::Uninitialized,
    }
  }
}

/// Snapshot of one superblock's metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SuperblockInfo {
  /// First byte of the superblock (of the whole span for a large allocation).
  pub start: NonNull<u8>,
  /// Size class, or [`LARGE_CLASS`].
  pub class: usize,
  pub block_size: usize,
  pub maxcount: u32,
  /// Free blocks recorded at the superblock level; blocks in thread caches are not counted.
  pub free: u32,
  pub state: SbState,
}

// =============================================================================
// Ralloc
// =============================================================================

/// An open persistent heap.
///
/// The heap is shared between threads by reference; each thread allocates through its own
/// [`LocalHeap`]. The handle is pinned to the thread that opened it, which owns the
/// crash-detection lock until [`Ralloc::close`].
pub struct Ralloc<S: SizeClasses = SizeClassTable> {
  regions: Regions,
  meta: NonNull<BaseMeta>,
  classes: S,
  expand_superblocks: usize,
  path: PathBuf,
  restart: bool,
  dirty: bool,
  state: AtomicU8,
  /// The lock has been released; nothing is left to do on drop.
  closed: bool,
}

// Shared state is reached through atomics only. `Send` is withheld: the dirty lock must be
// released by the thread that took it.
unsafe impl<S: SizeClasses> Sync for Ralloc<S> {}

impl Ralloc {
  /// Opens or creates the heap described by `config` with the default size classes.
  pub fn open(config: &Config) -> Result<Self> {
    Self::with_size_classes(config, SizeClassTable)
  }
}

impl<S: SizeClasses> Ralloc<S> {
  pub fn with_size_classes(config: &Config, classes: S) -> Result<Self> {
    config.validate()?;
    size_class::validate(&classes)?;

    let superblocks = config.superblocks() as usize;
    let (sb, _) = Region::open(&config.file("_sb"), superblocks << SB_SHIFT, SB_SIZE)?;
    let (desc, desc_fresh) =
      Region::open(&config.file("_desc"), superblocks << DESC_SHIFT, DESC_SIZE)?;
    let (meta, _) = Region::open(&config.file("_basemd"), META_REGION_SIZE, REGION_HEADER_SIZE)?;
    // Another live instance holds the file lock until it closes or dies.
    if !meta.try_lock()? {
      return Err(Error::Busy(config.path().to_owned()));
    }
    let meta_ptr = meta.translate(REGION_HEADER_SIZE as u64).cast::<BaseMeta>();
    let sb_used = sb.used() > sb.reserved();
    let regions = Regions::new(sb, desc, meta);

    let base = unsafe { meta_ptr.as_ref() };
    let restart = base.is_formatted();
    let mismatch = |reason| Error::LayoutMismatch {
      path: config.path().to_owned(),
      reason,
    };
    if restart {
      if desc_fresh {
        return Err(mismatch("descriptor file was recreated under existing metadata"));
      }
      if base.superblocks() != superblocks as u64 {
        return Err(mismatch("heap was formatted with a different size"));
      }
    } else {
      if sb_used {
        return Err(mismatch("superblocks are in use but the metadata is unformatted"));
      }
      base.format(superblocks as u64).map_err(Error::CorruptLock)?;
    }

    let lock = base.dirty.take_over().map_err(Error::CorruptLock)?;
    if lock == LockState::Busy {
      return Err(Error::Busy(config.path().to_owned()));
    }
    let fake = base.take_fake_dirty();
    let dirty = lock == LockState::OwnerDied || fake || config.force_dirty;

    let mut heap = Self {
      regions,
      meta: meta_ptr,
      classes,
      expand_superblocks: config.expand_superblocks,
      path: config.path().to_owned(),
      restart,
      dirty,
      state: AtomicU8::new(HeapState::Uninitialized as u8),
      closed: false,
    };
    heap.set_state(if dirty {
      HeapState::DirtyDetected
    } else {
      HeapState::CleanDetected
    });
    log::info!(
      "opened {} heap at {} ({} superblocks, {})",
      if restart { "existing" } else { "new" },
      heap.path.display(),
      superblocks,
      if dirty { "dirty" } else { "clean" },
    );

    let mode = if dirty {
      RecoveryMode::Dirty
    } else {
      RecoveryMode::Clean
    };
    heap.set_state(HeapState::Recovering);
    if let Err(err) = heap.run_recovery(mode) {
      // Leave the heap marked dirty so the next attempt does not trust it either.
      base.mark_fake_dirty();
      if let Err(errno) = base.dirty.release() {
        log::warn!("failed to release heap lock after aborted open (errno {errno})");
      }
      heap.closed = true;
      return Err(err);
    }
    heap.set_state(HeapState::Ready);
    Ok(heap)
  }

  // ===========================================================================
  // Public API
  // ===========================================================================

  /// A new per-thread allocation handle.
  pub fn local(&self) -> LocalHeap<'_, S> {
    LocalHeap::new(self)
  }

  /// Whether the heap existed before this open.
  #[inline]
  pub fn is_restart(&self) -> bool {
    self.restart
  }

  /// Whether this open ran conservative recovery.
  #[inline]
  pub fn was_dirty(&self) -> bool {
    self.dirty
  }

  #[inline]
  pub fn state(&self) -> HeapState {
    HeapState::from_u8(self.state.load(Ordering::Acquire))
  }

  #[inline]
  pub fn size_classes(&self) -> &S {
    &self.classes
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Whether `ptr` lies in the allocated part of the superblock region.
  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    self.sb_region().contains(ptr)
  }

  /// Usable bytes of the block at `ptr`, or `None` if no live superblock owns it.
  pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    if !self.contains(ptr) {
      return None;
    }
    let desc = self.desc_lookup(ptr);
    (!desc.is_unused()).then(|| desc.block_size())
  }

  /// Metadata of the superblock holding `ptr`.
  pub fn superblock_info(&self, ptr: *const u8) -> Option<SuperblockInfo> {
    if !self.contains(ptr) {
      return None;
    }
    let slot = self.slot_of(ptr);
    let desc = self.desc_at(slot);
    let class = self.meta().class_of(desc.heap(&self.regions)?)?;
    let anchor = desc.anchor.load();
    Some(SuperblockInfo {
      start: self.sb_at(slot),
      class,
      block_size: desc.block_size(),
      maxcount: desc.maxcount(),
      free: anchor.count(),
      state: anchor.state(),
    })
  }

  /// Stores `ptr` in root slot `index` and returns the previous value.
  pub fn set_root(&self, index: usize, ptr: Option<NonNull<u8>>) -> Result<Option<NonNull<u8>>> {
    let slot = self.meta().roots.get(index).ok_or(Error::RootIndex(index))?;
    if let Some(p) = ptr
      && !self.contains(p.as_ptr())
    {
      return Err(Error::ForeignPointer(p.as_ptr() as usize));
    }
    let old = slot.swap(&self.regions, ptr);
    persist::flush(slot);
    persist::fence();
    Ok(old)
  }

  pub fn get_root(&self, index: usize) -> Result<Option<NonNull<u8>>> {
    let slot = self.meta().roots.get(index).ok_or(Error::RootIndex(index))?;
    Ok(slot.load(&self.regions))
  }

  /// Reruns clean recovery on the quiescent heap.
  pub fn recover(&mut self) -> Result<RecoveryStats> {
    self.set_state(HeapState::Recovering);
    let stats = self.run_recovery(RecoveryMode::Clean)?;
    self.set_state(HeapState::Ready);
    Ok(stats)
  }

  /// Every block the metadata considers allocated, as `(pointer, usable size)`.
  pub fn in_use_blocks(&mut self) -> InUseBlocks<'_, S> {
    InUseBlocks::new(self)
  }

  /// Writes everything back and releases the heap, marking the shutdown clean.
  pub fn close(mut self) -> Result<()> {
    self.closed = true;
    self.shutdown()
  }

  /// Releases the heap as if the process had died: nothing is drained and the next open
  /// runs dirty recovery.
  pub fn simulate_crash(mut self) {
    self.closed = true;
    self.meta().mark_fake_dirty();
    if let Err(errno) = self.meta().dirty.release() {
      log::warn!("failed to release heap lock of {} (errno {errno})", self.path.display());
    }
  }

  fn shutdown(&self) -> Result<()> {
    let rgs = &self.regions;
    rgs.get(RegionIndex::Superblock).sync()?;
    rgs.get(RegionIndex::Descriptor).sync()?;
    self.meta().persist();
    self.meta().dirty.release().map_err(Error::CorruptLock)?;
    rgs.get(RegionIndex::Meta).sync()?;
    log::info!("closed heap at {}", self.path.display());
    Ok(())
  }

  // ===========================================================================
  // Internal accessors
  // ===========================================================================

  #[inline]
  fn set_state(&self, state: HeapState) {
    self.state.store(state as u8, Ordering::Release);
  }

  #[inline]
  pub(crate) fn meta(&self) -> &BaseMeta {
    unsafe { self.meta.as_ref() }
  }

  #[cfg(test)]
  pub(crate) fn regions(&self) -> &Regions {
    &self.regions
  }

  #[inline]
  pub(crate) fn sb_region(&self) -> &Region {
    self.regions.get(RegionIndex::Superblock)
  }

  #[inline]
  pub(crate) fn heap(&self, class: usize) -> &ProcHeap {
    self.meta().heap(class)
  }

  /// Superblock slot containing `ptr`.
  #[inline]
  pub(crate) fn slot_of(&self, ptr: *const u8) -> usize {
    (self.sb_region().untranslate(ptr) >> SB_SHIFT) as usize
  }

  #[inline]
  pub(crate) fn sb_at(&self, slot: usize) -> NonNull<u8> {
    self.regions.translate(RegionIndex::Superblock, (slot << SB_SHIFT) as u64)
  }

  #[inline]
  pub(crate) fn desc_ptr(&self, slot: usize) -> NonNull<Descriptor> {
    self.regions.translate(RegionIndex::Descriptor, (slot << DESC_SHIFT) as u64).cast()
  }

  #[inline]
  pub(crate) fn desc_at(&self, slot: usize) -> &Descriptor {
    unsafe { self.desc_ptr(slot).as_ref() }
  }

  #[inline]
  pub(crate) fn desc_lookup(&self, ptr: *const u8) -> &Descriptor {
    self.desc_at(self.slot_of(ptr))
  }

  #[inline]
  pub(crate) fn slot_of_desc(&self, desc: NonNull<Descriptor>) -> usize {
    let offset = self.regions.untranslate(RegionIndex::Descriptor, desc.as_ptr().cast());
    (offset >> DESC_SHIFT) as usize
  }

  /// Superblock slots handed out so far, including the reserved slot 0.
  #[inline]
  pub(crate) fn slots_in_use(&self) -> usize {
    self.sb_region().used() >> SB_SHIFT
  }
}

impl<S: SizeClasses> Drop for Ralloc<S> {
  fn drop(&mut self) {
    if self.closed {
      return;
    }
    if let Err(err) = self.shutdown() {
      log::warn!("unclean close of {}: {err}", self.path.display());
    }
  }
}

impl<S: SizeClasses> fmt::Debug for Ralloc<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Ralloc")
      .field("path", &self.path)
      .field("state", &self.state())
      .field("restart", &self.restart)
      .field("dirty", &self.dirty)
      .field("slots_in_use", &self.slots_in_use())
      .finish()
  }
}
