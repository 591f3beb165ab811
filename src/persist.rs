//! Cache-line write-back primitives.
//!
//! A store that a restarted process must observe as a unit is followed by [`flush`] of the
//! containing lines and a [`fence`] before the structure is published to other threads.

use core::mem::size_of;

pub const CACHE_LINE_SIZE: usize = 64;

#[inline]
pub fn flush<T>(ptr: *const T) {
  flush_range(ptr.cast(), size_of::<T>());
}

/// Writes back every cache line overlapping `[ptr, ptr + len)`.
#[inline]
pub fn flush_range(ptr: *const u8, len: usize) {
  if len == 0 {
    return;
  }
  let start = ptr as usize & !(CACHE_LINE_SIZE - 1);
  let end = ptr as usize + len;
  let mut line = start;
  while line < end {
    flush_line(line as *const u8);
    line += CACHE_LINE_SIZE;
  }
}

#[cfg(all(target_arch = "x86_64", not(feature = "skip-flush")))]
#[inline(always)]
fn flush_line(line: *const u8) {
  // SAFETY: clflush only requires the address to be mapped, which holds for every
  // caller since they flush memory they just wrote.
  unsafe { core::arch::x86_64::_mm_clflush(line) };
}

#[cfg(any(not(target_arch = "x86_64"), feature = "skip-flush"))]
#[inline(always)]
fn flush_line(_line: *const u8) {}

/// Orders all preceding flushes before any later store.
#[cfg(target_arch = "x86_64")]
#[inline]
#[allow(unused_unsafe)]
pub fn fence() {
  // SAFETY: sse is part of the x86_64 baseline.
  unsafe { core::arch::x86_64::_mm_sfence() };
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub fn fence() {
  core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
