//! The anchor: one atomic word per superblock.
//!
//! ```text
//!  63          33 32           2 1   0
//! +--------------+--------------+-----+
//! |    count     |    avail     |state|
//! +--------------+--------------+-----+
//! ```
//!
//! Every transition of a superblock's free list is a single CAS on this word.

use core::{
  fmt,
  sync::atomic::{AtomicU64, Ordering},
};

const STATE_BITS: u32 = 2;
const AVAIL_BITS: u32 = 31;
const COUNT_BITS: u32 = 31;

const STATE_MASK: u64 = (1 << STATE_BITS) - 1;
const AVAIL_SHIFT: u32 = STATE_BITS;
const AVAIL_MASK: u64 = (1 << AVAIL_BITS) - 1;
const COUNT_SHIFT: u32 = STATE_BITS + AVAIL_BITS;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

const _: () = assert!(STATE_BITS + AVAIL_BITS + COUNT_BITS == u64::BITS);

/// Largest value `avail` and `count` can hold.
pub const ANCHOR_FIELD_MAX: u32 = AVAIL_MASK as u32;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SbState {
  /// No free block is recorded at the superblock level.
  Full = 0,
  /// Some blocks are free; the descriptor sits on its heap's partial stack.
  Partial = 1,
  /// Every block is free; the superblock is being returned to the pool.
  Empty = 2,
}

impl SbState {
  #[inline]
  fn from_bits(bits: u64) -> Option<Self> {
    match bits {
      0 => Some(SbState::Full),
      1 => Some(SbState::Partial),
      2 => Some(SbState::Empty),
      _ => None,
    }
  }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Anchor(u64);

impl Anchor {
  #[inline]
  pub const fn new(avail: u32, count: u32, state: SbState) -> Self {
    debug_assert!(avail <= ANCHOR_FIELD_MAX && count <= ANCHOR_FIELD_MAX);
    Self(
      (state as u64)
        | ((avail as u64 & AVAIL_MASK) << AVAIL_SHIFT)
        | ((count as u64 & COUNT_MASK) << COUNT_SHIFT),
    )
  }

  #[inline]
  pub const fn from_raw(raw: u64) -> Self {
    Self(raw)
  }

  /// Index of the first free block.
  #[inline]
  pub const fn avail(self) -> u32 {
    ((self.0 >> AVAIL_SHIFT) & AVAIL_MASK) as u32
  }

  /// Free blocks recorded at the superblock level.
  #[inline]
  pub const fn count(self) -> u32 {
    ((self.0 >> COUNT_SHIFT) & COUNT_MASK) as u32
  }

  /// Lifecycle state. A word with the reserved state pattern reads as `Full`; use
  /// [`Anchor::is_valid`] to reject it.
  #[inline]
  pub fn state(self) -> SbState {
    SbState::from_bits(self.0 & STATE_MASK).unwrap_or(SbState::Full)
  }

  #[inline]
  pub fn is_valid(self) -> bool {
    SbState::from_bits(self.0 & STATE_MASK).is_some()
  }
}

impl fmt::Debug for Anchor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Anchor")
      .field("avail", &self.avail())
      .field("count", &self.count())
      .field("state", &self.state())
      .finish()
  }
}

#[repr(transparent)]
pub struct AtomicAnchor(AtomicU64);

impl AtomicAnchor {
  #[inline]
  pub fn load(&self) -> Anchor {
    Anchor(self.0.load(Ordering::Acquire))
  }

  #[inline]
  pub fn store(&self, anchor: Anchor) {
    self.0.store(anchor.0, Ordering::Release);
  }

  /// On failure returns the anchor actually observed.
  #[inline]
  pub fn compare_exchange_weak(&self, current: Anchor, new: Anchor) -> Result<Anchor, Anchor> {
    self
      .0
      .compare_exchange_weak(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
      .map(Anchor)
      .map_err(Anchor)
  }
}
