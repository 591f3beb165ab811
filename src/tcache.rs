//! Per-thread block caches.
//!
//! A bin is an intrusive list of free blocks of one class plus its length. The length, not
//! the links, bounds the list: blocks spliced in from a superblock keep whatever link their
//! tail had.

use crate::block::Block;

#[derive(Debug, Default)]
pub struct TCacheBin {
  head: Option<Block>,
  len: u32,
}

impl TCacheBin {
  #[inline]
  pub fn len(&self) -> u32 {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub fn peek(&self) -> Option<Block> {
    if self.len == 0 { None } else { self.head }
  }

  #[inline]
  pub fn push_block(&mut self, block: Block) {
    block.set_next(self.peek());
    self.head = Some(block);
    self.len += 1;
  }

  /// Splices in a list of `len` linked blocks. Only used to refill an empty bin.
  #[inline]
  pub fn push_list(&mut self, head: Block, len: u32) {
    debug_assert!(self.is_empty());
    self.head = Some(head);
    self.len = len;
  }

  #[inline]
  pub fn pop_block(&mut self) -> Option<Block> {
    let block = self.peek()?;
    self.len -= 1;
    self.head = if self.len == 0 { None } else { block.next() };
    Some(block)
  }

  /// Drops the first `len` blocks, leaving `rest` as the new head.
  #[inline]
  pub fn pop_list(&mut self, rest: Option<Block>, len: u32) {
    debug_assert!(self.len >= len);
    self.len -= len;
    self.head = if self.len == 0 { None } else { rest };
  }

  /// Forgets every cached block without returning it anywhere.
  #[inline]
  pub fn forget(&mut self) {
    self.head = None;
    self.len = 0;
  }
}

/// One bin per size class.
pub struct TCaches {
  bins: Box<[TCacheBin]>,
}

impl TCaches {
  pub fn new(classes: usize) -> Self {
    Self {
      bins: (0..classes).map(|_| TCacheBin::default()).collect(),
    }
  }

  #[inline]
  pub fn bin(&mut self, class: usize) -> &mut TCacheBin {
    &mut self.bins[class]
  }

  #[inline]
  pub fn bins(&self) -> &[TCacheBin] {
    &self.bins
  }

  pub fn forget_all(&mut self) {
    self.bins.iter_mut().for_each(TCacheBin::forget);
  }
}
