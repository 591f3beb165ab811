use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors surfaced by opening, growing or closing a persistent heap.
///
/// CAS contention is never an error: every lock-free loop retries until it wins.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Io(#[from] io::Error),

  #[error("failed to map `{path}`: {source}")]
  Map {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  /// The superblock region cannot be grown to satisfy the request.
  #[error("persistent heap exhausted: {requested} bytes requested")]
  OutOfMemory { requested: usize },

  /// Another live owner holds the dirty-detection lock.
  #[error("heap `{0}` is held by another live instance")]
  Busy(PathBuf),

  /// The dirty-detection lock itself is unusable, so heap consistency cannot be judged.
  #[error("dirty-detection lock is corrupted (errno {0})")]
  CorruptLock(i32),

  #[error("`{path}` does not match the configured layout: {reason}")]
  LayoutMismatch { path: PathBuf, reason: &'static str },

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  /// Metadata walked during recovery is in a state no execution can produce.
  #[error("recovery failed at superblock {slot}: {reason}")]
  Recovery { slot: usize, reason: &'static str },

  #[error("root index {0} is out of range")]
  RootIndex(usize),

  /// A root may only point into the heap's superblock region.
  #[error("pointer {0:#x} does not belong to this heap")]
  ForeignPointer(usize),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
