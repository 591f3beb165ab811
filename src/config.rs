use std::path::{Path, PathBuf};

use crate::{
  MAX_OFFSET_BITS, SB_SIZE,
  error::{Error, Result},
};

/// Default superblock region capacity. Files are created sparse.
pub const DEFAULT_HEAP_SIZE: u64 = 1 << 30; // 1GB

/// Superblocks claimed from the region each time the free-superblock pool runs dry.
pub const DEFAULT_EXPAND_SUPERBLOCKS: usize = 64;

/// Minimum number of superblock slots, including the reserved header slot.
const MIN_SUPERBLOCKS: u64 = 4;

/// Settings for [`Ralloc::open`](crate::Ralloc::open).
#[derive(Debug, Clone)]
pub struct Config {
  /// File prefix. The heap lives in `<path>_sb`, `<path>_desc` and `<path>_basemd`.
  pub path: PathBuf,
  /// Capacity of the superblock region in bytes, rounded up to whole superblocks.
  pub size: u64,
  pub expand_superblocks: usize,
  /// Run dirty recovery even if the previous owner released the heap cleanly.
  pub force_dirty: bool,
}

impl Config {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      size: DEFAULT_HEAP_SIZE,
      expand_superblocks: DEFAULT_EXPAND_SUPERBLOCKS,
      force_dirty: false,
    }
  }

  pub fn size(mut self, size: u64) -> Self {
    self.size = size;
    self
  }

  pub fn expand_superblocks(mut self, count: usize) -> Self {
    self.expand_superblocks = count;
    self
  }

  pub fn force_dirty(mut self, force: bool) -> Self {
    self.force_dirty = force;
    self
  }

  /// Number of superblock slots backing this configuration.
  pub fn superblocks(&self) -> u64 {
    self.size.div_ceil(SB_SIZE as u64)
  }

  pub(crate) fn file(&self, suffix: &str) -> PathBuf {
    let mut name = self.path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
  }

  pub(crate) fn validate(&self) -> Result<()> {
    if self.path.as_os_str().is_empty() {
      return Err(Error::InvalidConfig("heap path is empty".into()));
    }
    let superblocks = self.superblocks();
    if superblocks < MIN_SUPERBLOCKS {
      return Err(Error::InvalidConfig(format!(
        "heap of {} bytes holds fewer than {MIN_SUPERBLOCKS} superblocks",
        self.size
      )));
    }
    if superblocks * SB_SIZE as u64 >= 1 << MAX_OFFSET_BITS {
      return Err(Error::InvalidConfig(format!(
        "heap of {} bytes exceeds the {MAX_OFFSET_BITS}-bit offset range",
        self.size
      )));
    }
    if self.expand_superblocks == 0 {
      return Err(Error::InvalidConfig("expand_superblocks must be at least 1".into()));
    }
    Ok(())
  }

  pub(crate) fn path(&self) -> &Path {
    &self.path
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn file_names_share_prefix() {
    let config = Config::new("/tmp/heap");
    assert_eq!(config.file("_sb"), PathBuf::from("/tmp/heap_sb"));
    assert_eq!(config.file("_basemd"), PathBuf::from("/tmp/heap_basemd"));
  }

  #[test]
  fn size_rounds_up_to_superblocks() {
    let config = Config::new("h").size(SB_SIZE as u64 * 8 + 1);
    assert_eq!(config.superblocks(), 9);
  }

  #[test]
  fn rejects_tiny_heaps() {
    let config = Config::new("h").size(SB_SIZE as u64);
    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
  }

  #[test]
  fn rejects_zero_expansion() {
    let config = Config::new("h").expand_superblocks(0);
    assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
  }

  #[test]
  fn rejects_empty_path() {
    assert!(Config::new("").validate().is_err());
  }
}
