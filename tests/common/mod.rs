#![allow(dead_code)]

use shardcache::{Cache, CacheOptions};
use std::time::Duration;
use tempfile::TempDir;

pub struct TestEnv {
  pub cache: Cache,
  pub dir: TempDir,
}

impl TestEnv {
  pub fn new(shard_count: u16) -> Self {
    Self::with_options(|opts| opts.shard_count = shard_count)
  }

  pub fn with_default() -> Self {
    Self::with_options(|_| {})
  }

  pub fn with_options(f: impl FnOnce(&mut CacheOptions)) -> Self {
    let dir = TempDir::new().unwrap();
    let mut opts = CacheOptions::new(dir.path());
    // Generous budget so CI scheduling hiccups don't fail tests.
    opts.timeout = Duration::from_secs(2);
    f(&mut opts);
    let cache = Cache::open(opts).unwrap();
    TestEnv { cache, dir }
  }
}
