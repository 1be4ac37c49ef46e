//! The public cache handle: routes each key to its shard and fans
//! aggregate operations out across all shards.

use crate::config::CacheOptions;
use crate::entry::{Entry, Value, ValueReader};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::router::Router;
use crate::store::ShardStore;
use crate::util;

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// A disk-backed, multi-process-safe key/value cache.
///
/// The cache directory is split into a fixed number of shards, each an
/// independent store with its own lock domain. Single-key operations
/// touch exactly one shard and run fully in parallel with operations on
/// other shards; operations on the same shard serialize at transaction
/// granularity, across threads and across processes sharing the
/// directory.
///
/// Operations that take a `retry` flag go through the configured retry
/// budget when the shard lock is contended; with `retry == false`, lock
/// contention surfaces as [`Error::Timeout`] immediately.
///
/// # Example
///
/// ```no_run
/// use shardcache::{Cache, CacheOptions};
///
/// # fn main() -> shardcache::Result<()> {
/// let cache = Cache::open(CacheOptions::new("./cache_data"))?;
///
/// cache.set("session:42", "payload", None, None, true)?;
/// let value = cache.get("session:42", false)?;
///
/// // Atomic counter, seeded to 0 when absent.
/// let hits = cache.incr("hits", 1, Some(0), true)?;
/// # Ok(())
/// # }
/// ```
pub struct Cache {
  shards: Vec<Mutex<ShardStore>>,
  router: Router,
  policy: RetryPolicy,
  closed: AtomicBool,
}

impl Cache {
  /// Opens (creating if necessary) the cache rooted at `options.dir`.
  ///
  /// The shard count is fixed for the directory's lifetime: reopening
  /// an existing directory with a different count splits keys across
  /// disjoint stores.
  pub fn open(options: CacheOptions) -> Result<Self> {
    if options.shard_count == 0 {
      return Err(Error::Config(
        "shard_count must be greater than zero".into(),
      ));
    }

    fs::create_dir_all(&options.dir)?;

    let options = Arc::new(options);
    let router = Router::new(options.shard_count);

    let mut shards = Vec::with_capacity(options.shard_count as usize);
    for shard_id in 0..options.shard_count {
      let dir = options.dir.join(router.shard_dir(shard_id));
      shards.push(Mutex::new(ShardStore::open(dir, options.clone())?));
    }

    let cache = Self {
      shards,
      router,
      policy: RetryPolicy::new(options.timeout),
      closed: AtomicBool::new(false),
    };

    if options.tag_index {
      cache.create_tag_index()?;
    }

    Ok(cache)
  }

  /// Unconditional upsert: replaces the value, expire time, and tag.
  /// `ttl` of zero makes the entry immediately expired.
  pub fn set(
    &self,
    key: &str,
    value: impl Into<Value>,
    ttl: Option<Duration>,
    tag: Option<&str>,
    retry: bool,
  ) -> Result<()> {
    self.ensure_open()?;
    let value = value.into();
    let shard = self.shard(key);
    self.policy.run(retry, || shard.lock().set(key, &value, ttl, tag))
  }

  /// Inserts only if `key` is absent or expired. Returns whether the
  /// write occurred; a `false` result leaves the existing entry intact.
  pub fn add(
    &self,
    key: &str,
    value: impl Into<Value>,
    ttl: Option<Duration>,
    tag: Option<&str>,
    retry: bool,
  ) -> Result<bool> {
    self.ensure_open()?;
    let value = value.into();
    let shard = self.shard(key);
    self.policy.run(retry, || shard.lock().add(key, &value, ttl, tag))
  }

  /// Returns the value for `key`, or `None` if it is missing or
  /// expired.
  pub fn get(&self, key: &str, retry: bool) -> Result<Option<Value>> {
    Ok(self.get_entry(key, retry)?.map(|entry| entry.value))
  }

  /// Like [`get`](Self::get), but returns the entry's metadata (expire
  /// time, tag, size) alongside the value.
  pub fn get_entry(&self, key: &str, retry: bool) -> Result<Option<Entry>> {
    self.ensure_open()?;
    let shard = self.shard(key);
    self.policy.run(retry, || shard.lock().get(key))
  }

  /// Removes `key` if present. Returns whether a live entry was
  /// removed; deleting a missing or expired key is a no-op.
  pub fn delete(&self, key: &str, retry: bool) -> Result<bool> {
    self.ensure_open()?;
    let shard = self.shard(key);
    self.policy.run(retry, || shard.lock().delete(key))
  }

  /// Atomically adds `delta` to the integer value at `key` and returns
  /// the new value. Concurrent increments never lose updates, across
  /// threads and across processes.
  ///
  /// If the key is missing or expired: with no `default` this fails
  /// with [`Error::KeyNotFound`]; otherwise the value is seeded to
  /// `default` before `delta` is applied. A seeded entry has no expire
  /// time and no tag. An existing increment preserves both.
  pub fn incr(&self, key: &str, delta: i64, default: Option<i64>, retry: bool) -> Result<i64> {
    self.ensure_open()?;
    let shard = self.shard(key);
    self.policy.run(retry, || shard.lock().incr(key, delta, default))
  }

  /// Atomically subtracts `delta`; `decr` is [`incr`](Self::incr) with
  /// the delta negated. Values may go below zero.
  pub fn decr(&self, key: &str, delta: i64, default: Option<i64>, retry: bool) -> Result<i64> {
    self.incr(key, delta.wrapping_neg(), default, retry)
  }

  /// Membership test honoring expiration. Single attempt: lock
  /// contention surfaces as [`Error::Timeout`] without retrying.
  pub fn contains(&self, key: &str) -> Result<bool> {
    self.ensure_open()?;
    self.shard(key).lock().contains(key)
  }

  /// Physically removes every entry across all shards whose expire
  /// time has passed, returning the total count removed.
  pub fn expire(&self) -> Result<usize> {
    self.ensure_open()?;
    let now = util::now_millis();
    let mut total = 0;
    for shard in &self.shards {
      total += self.policy.run(true, || shard.lock().expire(now))?;
    }
    Ok(total)
  }

  /// Builds the tag index on every shard. Idempotent.
  pub fn create_tag_index(&self) -> Result<()> {
    self.ensure_open()?;
    for shard in &self.shards {
      self.policy.run(true, || shard.lock().create_tag_index())?;
    }
    Ok(())
  }

  /// Drops the tag index on every shard. Idempotent.
  pub fn drop_tag_index(&self) -> Result<()> {
    self.ensure_open()?;
    for shard in &self.shards {
      self.policy.run(true, || shard.lock().drop_tag_index())?;
    }
    Ok(())
  }

  /// Removes every entry carrying `tag` across all shards and returns
  /// the count removed. Uses the tag index when present; otherwise
  /// falls back to a full per-entry scan of each shard.
  ///
  /// Like all aggregates, this fans out shard by shard: a failure on
  /// one shard does not roll back removals already committed on others.
  pub fn evict(&self, tag: &str) -> Result<usize> {
    self.ensure_open()?;
    let mut total = 0;
    for shard in &self.shards {
      total += self.policy.run(true, || shard.lock().evict(tag))?;
    }
    Ok(total)
  }

  /// Removes every entry in every shard, returning the count removed.
  pub fn clear(&self) -> Result<usize> {
    self.ensure_open()?;
    let mut total = 0;
    for shard in &self.shards {
      total += self.policy.run(true, || shard.lock().clear())?;
    }
    Ok(total)
  }

  /// Opens a streaming reader over the value at `key` without
  /// materializing it in memory. Fails with [`Error::KeyNotFound`] if
  /// the key is missing or expired.
  ///
  /// The reader stays on the value version current at open time even if
  /// the entry is overwritten or deleted afterwards.
  pub fn open_stream(&self, key: &str) -> Result<ValueReader> {
    self.ensure_open()?;
    let shard = self.shard(key);
    self.policy.run(false, || shard.lock().open_stream(key))
  }

  /// Number of live (non-expired) entries across all shards.
  pub fn len(&self) -> Result<usize> {
    self.ensure_open()?;
    let now = util::now_millis();
    let mut total = 0;
    for shard in &self.shards {
      total += self.policy.run(true, || shard.lock().len(now))?;
    }
    Ok(total)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  pub fn shard_count(&self) -> u16 {
    self.router.shard_count()
  }

  /// Closes the cache, releasing process-local shard resources.
  /// Idempotent; any other operation after `close` fails with
  /// [`Error::Closed`]. Other processes sharing the directory are
  /// unaffected.
  pub fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    for shard in &self.shards {
      shard.lock().close();
    }
  }

  fn ensure_open(&self) -> Result<()> {
    if self.closed.load(Ordering::Acquire) {
      return Err(Error::Closed);
    }
    Ok(())
  }

  fn shard(&self, key: &str) -> &Mutex<ShardStore> {
    &self.shards[self.router.route(key) as usize]
  }
}

impl Drop for Cache {
  fn drop(&mut self) {
    self.close();
  }
}
