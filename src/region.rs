//! File-backed persistent regions and offset translation.
//!
//! Every persistent pointer is stored as a byte offset into one of three regions, so a heap
//! can be remapped at a different base after a restart. Offset 0 always lands on the region
//! header and therefore doubles as null.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU64, Ordering},
};
use std::{
  fs::{File, OpenOptions},
  io,
  os::fd::AsRawFd,
  path::Path,
};

use crate::{
  align_up,
  error::{Error, Result},
  persist,
};

/// Magic number identifying an initialized region header.
const REGION_MAGIC: u64 = 0x5241_4C4C_4F43_5247; // "RALLOCRG"

pub const REGION_HEADER_SIZE: usize = size_of::<RegionHeader>();

const _: () = assert!(REGION_HEADER_SIZE == persist::CACHE_LINE_SIZE);

#[repr(usize)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionIndex {
  /// Raw superblock bytes.
  Superblock = 0,
  /// Descriptor records, one per superblock slot.
  Descriptor = 1,
  /// The `BaseMeta` root record.
  Meta = 2,
}

pub const REGION_COUNT: usize = 3;

/// Persistent header at offset 0 of every region file.
#[repr(C, align(64))]
struct RegionHeader {
  magic: AtomicU64,
  capacity: AtomicU64,
  /// Bytes at the start of the region that are never handed out.
  reserved: AtomicU64,
  /// High-water mark: offset of the first byte never returned by `expand`.
  used: AtomicU64,
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap_shared(fd: i32, size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_SHARED,
      fd,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Non-blocking exclusive `flock`. `Ok(false)` means another open file holds it.
fn os_try_flock(fd: i32) -> io::Result<bool> {
  if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } == 0 {
    return Ok(true);
  }
  let err = io::Error::last_os_error();
  if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
    Ok(false)
  } else {
    Err(err)
  }
}

unsafe fn os_msync(ptr: *mut u8, size: usize) -> io::Result<()> {
  if unsafe { libc::msync(ptr.cast(), size, libc::MS_SYNC) } == 0 {
    Ok(())
  } else {
    Err(io::Error::last_os_error())
  }
}

// =============================================================================
// Region
// =============================================================================

/// One memory-mapped file of fixed capacity that grows by bumping its persistent high-water
/// mark.
pub struct Region {
  base: NonNull<u8>,
  capacity: usize,
  file: File,
}

// The mapping is shared memory; all mutation of the header goes through atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
  /// Maps `path`, creating it sparse with `capacity` bytes if it does not exist.
  ///
  /// Returns the region and whether its header had to be initialized.
  pub fn open(path: &Path, capacity: usize, reserved: usize) -> Result<(Self, bool)> {
    debug_assert!(reserved >= REGION_HEADER_SIZE && reserved < capacity);

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
      file.set_len(capacity as u64)?;
    } else if len != capacity as u64 {
      return Err(Error::LayoutMismatch {
        path: path.to_owned(),
        reason: "file size differs from the configured capacity",
      });
    }

    let raw = unsafe { os_mmap_shared(file.as_raw_fd(), capacity) };
    let Some(base) = NonNull::new(raw) else {
      return Err(Error::Map {
        path: path.to_owned(),
        source: io::Error::last_os_error(),
      });
    };

    let region = Self {
      base,
      capacity,
      file,
    };

    let header = region.header();
    let fresh = header.magic.load(Ordering::Acquire) != REGION_MAGIC;
    if fresh {
      header.capacity.store(capacity as u64, Ordering::Relaxed);
      header.reserved.store(reserved as u64, Ordering::Relaxed);
      header.used.store(reserved as u64, Ordering::Relaxed);
      persist::flush(header);
      persist::fence();
      header.magic.store(REGION_MAGIC, Ordering::Release);
      persist::flush(header);
      persist::fence();
    } else if header.capacity.load(Ordering::Relaxed) != capacity as u64
      || header.reserved.load(Ordering::Relaxed) != reserved as u64
    {
      return Err(Error::LayoutMismatch {
        path: path.to_owned(),
        reason: "region header describes a different geometry",
      });
    }

    Ok((region, fresh))
  }

  #[inline]
  fn header(&self) -> &RegionHeader {
    unsafe { self.base.cast::<RegionHeader>().as_ref() }
  }

  /// Current high-water offset.
  #[inline]
  pub fn used(&self) -> usize {
    self.header().used.load(Ordering::Acquire) as usize
  }

  #[inline]
  pub fn reserved(&self) -> usize {
    self.header().reserved.load(Ordering::Relaxed) as usize
  }

  /// Claims `size` bytes whose offset is a multiple of `align`.
  ///
  /// Returns `None` once the file capacity is exhausted; the region never remaps.
  pub fn expand(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    debug_assert!(align.is_power_of_two());
    let header = self.header();
    let mut used = header.used.load(Ordering::Acquire);
    loop {
      let start = align_up(used as usize, align);
      let end = start.checked_add(size)?;
      if end > self.capacity {
        return None;
      }
      match header.used.compare_exchange_weak(
        used,
        end as u64,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => {
          persist::flush(&header.used);
          persist::fence();
          return Some(self.translate(start as u64));
        }
        Err(current) => used = current,
      }
    }
  }

  #[inline]
  pub fn translate(&self, offset: u64) -> NonNull<u8> {
    debug_assert!((offset as usize) < self.capacity);
    unsafe { self.base.add(offset as usize) }
  }

  #[inline]
  pub fn untranslate(&self, ptr: *const u8) -> u64 {
    debug_assert!(self.in_mapping(ptr));
    (ptr as usize - self.base.as_ptr() as usize) as u64
  }

  #[inline]
  fn in_mapping(&self, ptr: *const u8) -> bool {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + self.capacity
  }

  /// Whether `ptr` lies in the handed-out part of the region.
  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= base + self.reserved() && addr < base + self.used()
  }

  /// Takes the advisory lock of the backing file, held until the region is dropped.
  ///
  /// The kernel drops the lock with the last descriptor of the file, so it never survives its
  /// holder: not a killed process, not a reboot, not a copy of the file.
  pub fn try_lock(&self) -> Result<bool> {
    os_try_flock(self.file.as_raw_fd()).map_err(Error::from)
  }

  /// Writes the whole mapping back to its file.
  pub fn sync(&self) -> Result<()> {
    unsafe { os_msync(self.base.as_ptr(), self.capacity) }.map_err(Error::from)
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.capacity) };
  }
}

/// The three regions of one heap, indexed by [`RegionIndex`].
pub struct Regions {
  regions: [Region; REGION_COUNT],
}

impl Regions {
  pub fn new(superblocks: Region, descriptors: Region, meta: Region) -> Self {
    Self {
      regions: [superblocks, descriptors, meta],
    }
  }

  #[inline]
  pub fn get(&self, idx: RegionIndex) -> &Region {
    &self.regions[idx as usize]
  }

  #[inline]
  pub fn translate(&self, idx: RegionIndex, offset: u64) -> NonNull<u8> {
    self.get(idx).translate(offset)
  }

  #[inline]
  pub fn untranslate(&self, idx: RegionIndex, ptr: *const u8) -> u64 {
    self.get(idx).untranslate(ptr)
  }

  #[inline]
  pub fn expand(&self, idx: RegionIndex, size: usize, align: usize) -> Option<NonNull<u8>> {
    self.get(idx).expand(size, align)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const CAP: usize = 1 << 20;

  #[test]
  fn expand_respects_alignment_and_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let (region, fresh) = Region::open(&dir.path().join("r"), CAP, 4096).unwrap();
    assert!(fresh);
    assert_eq!(region.used(), 4096);

    let a = region.expand(100, 64).unwrap();
    assert_eq!(region.untranslate(a.as_ptr()), 4096);
    let b = region.expand(64, 4096).unwrap();
    assert_eq!(region.untranslate(b.as_ptr()), 8192);
    assert!(region.contains(a.as_ptr()));
    assert!(!region.contains(region.translate(0).as_ptr()));

    assert!(region.expand(CAP, 64).is_none());
    assert_eq!(region.used(), 8192 + 64);
  }

  #[test]
  fn reopen_preserves_contents_and_high_water() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r");
    let offset = {
      let (region, _) = Region::open(&path, CAP, 4096).unwrap();
      let p = region.expand(8, 8).unwrap();
      unsafe { p.cast::<u64>().write(0xDEAD_BEEF) };
      region.sync().unwrap();
      region.untranslate(p.as_ptr())
    };

    let (region, fresh) = Region::open(&path, CAP, 4096).unwrap();
    assert!(!fresh);
    assert_eq!(region.used(), 4096 + 8);
    let p = region.translate(offset);
    assert_eq!(unsafe { p.cast::<u64>().read() }, 0xDEAD_BEEF);
  }

  #[test]
  fn reopen_with_other_capacity_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r");
    drop(Region::open(&path, CAP, 4096).unwrap());
    assert!(matches!(
      Region::open(&path, CAP * 2, 4096),
      Err(Error::LayoutMismatch { .. })
    ));
  }

  #[test]
  fn concurrent_expansion_hands_out_disjoint_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let (region, _) = Region::open(&dir.path().join("r"), CAP, 64).unwrap();
    let mut offsets: Vec<u64> = std::thread::scope(|scope| {
      let handles: Vec<_> = (0..4)
        .map(|_| {
          scope.spawn(|| {
            (0..64)
              .map(|_| region.untranslate(region.expand(128, 128).unwrap().as_ptr()))
              .collect::<Vec<_>>()
          })
        })
        .collect();
      handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });
    offsets.sort_unstable();
    offsets.dedup();
    assert_eq!(offsets.len(), 256);
  }

  #[test]
  fn file_lock_is_exclusive_and_dies_with_its_holder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r");
    let (first, _) = Region::open(&path, CAP, 4096).unwrap();
    let (second, _) = Region::open(&path, CAP, 4096).unwrap();
    assert!(first.try_lock().unwrap());
    assert!(!second.try_lock().unwrap());

    // A copy of the file carries none of the lock.
    let copy = dir.path().join("copy");
    std::fs::copy(&path, &copy).unwrap();
    let (copied, _) = Region::open(&copy, CAP, 4096).unwrap();
    assert!(copied.try_lock().unwrap());

    drop(first);
    assert!(second.try_lock().unwrap());
  }
}
