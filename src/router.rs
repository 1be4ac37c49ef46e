//! Key-based routing to determine shard assignment.
//!
//! Routing must agree across every process sharing a cache directory,
//! and across compiler and crate versions, so it uses CRC32 of the raw
//! key bytes rather than the standard library's randomized hasher.

/// Routes keys to shard IDs.
pub(crate) struct Router {
  shard_count: u16,
}

impl Router {
  /// Creates a new router with the specified shard count.
  ///
  /// # Panics
  ///
  /// Panics if `shard_count` is zero. `Cache::open` validates the
  /// configured count before constructing a router.
  pub fn new(shard_count: u16) -> Self {
    assert!(shard_count > 0, "shard_count must be greater than zero");
    Self { shard_count }
  }

  /// Routes a key to its assigned shard ID, in `0..shard_count`.
  ///
  /// The same key always routes to the same shard.
  #[inline]
  pub fn route(&self, key: &str) -> u16 {
    (crc32fast::hash(key.as_bytes()) % self.shard_count as u32) as u16
  }

  /// Directory name for a shard: `"shard_00"`, `"shard_01"`, ...
  pub fn shard_dir(&self, shard_id: u16) -> String {
    debug_assert!(shard_id < self.shard_count);
    format!("shard_{:02}", shard_id)
  }

  pub fn shard_count(&self) -> u16 {
    self.shard_count
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_deterministic_routing() {
    let router = Router::new(16);
    let shard1 = router.route("user_123");
    let shard2 = router.route("user_123");
    assert_eq!(shard1, shard2);
  }

  #[test]
  fn test_routing_is_stable_across_instances() {
    // Two routers (as two processes would build them) must agree.
    let a = Router::new(8);
    let b = Router::new(8);
    for i in 0..100 {
      let key = format!("key_{}", i);
      assert_eq!(a.route(&key), b.route(&key));
    }
  }

  #[test]
  fn test_routes_within_range() {
    let router = Router::new(16);
    for i in 0..1000 {
      let key = format!("key_{}", i);
      assert!(router.route(&key) < 16);
    }
  }

  #[test]
  fn test_uniform_distribution() {
    let router = Router::new(16);
    let mut counts = vec![0usize; 16];

    for i in 0..10_000 {
      let key = format!("key_{}", i);
      counts[router.route(&key) as usize] += 1;
    }

    for (shard_id, count) in counts.iter().enumerate() {
      assert!(
        *count > 400 && *count < 900,
        "Shard {} has uneven distribution: {} keys",
        shard_id,
        count
      );
    }
  }

  #[test]
  fn test_small_shard_counts_all_used() {
    let router = Router::new(4);
    let mut assigned = HashSet::new();
    for i in 0..200 {
      assigned.insert(router.route(&format!("key_{}", i)));
    }
    assert_eq!(assigned.len(), 4);
  }

  #[test]
  fn test_single_shard_routes_everything_to_zero() {
    let router = Router::new(1);
    for i in 0..100 {
      assert_eq!(router.route(&format!("key_{}", i)), 0);
    }
  }

  #[test]
  fn test_shard_dir_format() {
    let router = Router::new(100);
    assert_eq!(router.shard_dir(0), "shard_00");
    assert_eq!(router.shard_dir(9), "shard_09");
    assert_eq!(router.shard_dir(99), "shard_99");
  }

  #[test]
  #[should_panic(expected = "shard_count must be greater than zero")]
  fn test_panics_on_zero_shards() {
    Router::new(0);
  }
}
