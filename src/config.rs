use std::path::PathBuf;
use std::time::Duration;

/// Defines how often a shard flushes appended records to the physical disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
  /// Call `fdatasync` after every mutating transaction.
  /// Safest, but highest latency.
  Strict,

  /// Never call `fsync` automatically. Relies on the OS background
  /// flush mechanism. Fastest, but a power failure may lose the most
  /// recent writes (the log remains consistent either way).
  Async,
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// Root directory of the cache. One subdirectory is created per shard.
  pub dir: PathBuf,

  /// Number of independent shards. Fixed for the lifetime of the cache
  /// directory; opening an existing directory with a different count
  /// splits keys across disjoint stores.
  /// Default: 8.
  pub shard_count: u16,

  /// Retry budget for operations that hit shard lock contention.
  /// A zero budget means "fail fast": a single attempt is made even
  /// when the caller asks for retries.
  /// Default: 25 ms.
  pub timeout: Duration,

  /// Build the per-shard tag index at open time. Equivalent to calling
  /// `create_tag_index` right after `open`.
  /// Default: false.
  pub tag_index: bool,

  /// Values larger than this many bytes are stored as separate blob
  /// files instead of inline in the shard log.
  /// Default: 32 KiB.
  pub inline_threshold: usize,

  /// Durability of mutating transactions.
  /// Default: `Strict`.
  pub sync_mode: SyncMode,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      dir: PathBuf::from("./cache_data"),
      shard_count: 8,
      timeout: Duration::from_millis(25),
      tag_index: false,
      inline_threshold: 32 * 1024, // 32 KiB
      sync_mode: SyncMode::Strict,
    }
  }
}

impl CacheOptions {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      ..Default::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let opts = CacheOptions::default();
    assert_eq!(opts.shard_count, 8);
    assert_eq!(opts.timeout, Duration::from_millis(25));
    assert!(!opts.tag_index);
    assert_eq!(opts.inline_threshold, 32 * 1024);
    assert_eq!(opts.sync_mode, SyncMode::Strict);
  }

  #[test]
  fn test_new_overrides_dir_only() {
    let opts = CacheOptions::new("/tmp/somewhere");
    assert_eq!(opts.dir, PathBuf::from("/tmp/somewhere"));
    assert_eq!(opts.shard_count, 8);
  }
}
