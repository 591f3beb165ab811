//! Typed handle over a free block.
//!
//! A free block stores its successor in its own first word as a self-relative offset, so
//! block lists stay valid when the superblock region is mapped at a different base. This is
//! the only module that reads or writes block memory.

use core::{fmt, ptr::NonNull};

/// Smallest block able to hold the link word.
pub const MIN_BLOCK_SIZE: usize = size_of::<i64>();

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Block(NonNull<u8>);

impl Block {
  /// # Safety
  /// `ptr` must point to at least [`MIN_BLOCK_SIZE`] writable bytes, 8-byte aligned, that
  /// nobody else accesses while the handle is in use.
  #[inline]
  pub unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
    debug_assert!(ptr.as_ptr() as usize % MIN_BLOCK_SIZE == 0);
    Self(ptr)
  }

  #[inline]
  pub fn as_ptr(self) -> NonNull<u8> {
    self.0
  }

  #[inline]
  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  #[inline]
  fn link(self) -> *mut i64 {
    self.0.as_ptr().cast()
  }

  #[inline]
  pub fn next(self) -> Option<Block> {
    match unsafe { self.link().read() } {
      0 => None,
      delta => NonNull::new(self.addr().wrapping_add_signed(delta as isize) as *mut u8).map(Block),
    }
  }

  #[inline]
  pub fn set_next(self, next: Option<Block>) {
    let delta = next.map_or(0, |n| n.addr().wrapping_sub(self.addr()) as isize);
    unsafe { self.link().write(delta as i64) };
  }

  /// Builds the list `start -> start + size -> ... ` over `count` consecutive blocks and
  /// returns its head. The last block links to nothing.
  ///
  /// # Safety
  /// The `count * size` bytes at `start` must be writable and owned by the caller.
  pub unsafe fn link_run(start: NonNull<u8>, size: usize, count: usize) -> Block {
    debug_assert!(count > 0 && size >= MIN_BLOCK_SIZE && size % MIN_BLOCK_SIZE == 0);
    let head = unsafe { Block::from_ptr(start) };
    let mut block = head;
    for _ in 1..count {
      let next = unsafe { Block::from_ptr(block.0.add(size)) };
      block.set_next(Some(next));
      block = next;
    }
    block.set_next(None);
    head
  }

  /// Block `index` of a run of `size`-byte blocks starting at `start`.
  ///
  /// # Safety
  /// Same contract as [`Block::from_ptr`] for the computed address.
  #[inline]
  pub unsafe fn at(start: NonNull<u8>, size: usize, index: usize) -> Block {
    unsafe { Block::from_ptr(start.add(index * size)) }
  }

  /// Zeroes `len` bytes starting at this block.
  ///
  /// # Safety
  /// The range must be owned by the caller.
  pub unsafe fn zero(self, len: usize) {
    unsafe { self.0.as_ptr().write_bytes(0, len) };
  }

  /// # Safety
  /// Both ranges must be valid for `len` bytes and must not overlap.
  pub unsafe fn copy_to(self, dst: Block, len: usize) {
    unsafe { core::ptr::copy_nonoverlapping(self.0.as_ptr(), dst.0.as_ptr(), len) };
  }
}

impl fmt::Debug for Block {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Block({:p})", self.0)
  }
}
