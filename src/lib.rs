//! # ShardCache
//!
//! `shardcache` is a disk-backed, multi-process-safe key/value cache
//! with TTL expiration, atomic counters, tagging, and sharded
//! concurrency control.
//!
//! The cache directory is divided into independent shards, each with
//! its own record log, blob area, and advisory file lock. Multiple
//! processes may open the same directory concurrently; operations on
//! the same shard serialize at transaction granularity while operations
//! on different shards proceed in parallel. Lock contention degrades to
//! bounded retry/backoff latency rather than failure, up to the
//! caller's timeout budget.
//!
//! ## Key Features
//!
//! * **Crash consistency**: CRC-framed append-only logs with torn-tail
//!   recovery; blob files placed atomically before metadata commits.
//! * **Atomic counters**: `incr`/`decr` are read-modify-write inside
//!   one shard transaction; concurrent updates are never lost.
//! * **Tagging**: bulk eviction by tag, with an optional persistent
//!   per-shard tag index.
//! * **Bounded-latency retries**: contended operations retry with
//!   backoff inside a caller-specified budget, then fail with
//!   `Timeout`.
//!
//! ## Example
//!
//! ```no_run
//! use shardcache::{Cache, CacheOptions};
//! use std::time::Duration;
//!
//! # fn main() -> shardcache::Result<()> {
//! let cache = Cache::open(CacheOptions::new("./cache_data"))?;
//!
//! // Upsert with a 5 minute TTL and a tag for bulk eviction.
//! cache.set(
//!   "user:42",
//!   "profile_data",
//!   Some(Duration::from_secs(300)),
//!   Some("profiles"),
//!   true,
//! )?;
//!
//! let value = cache.get("user:42", false)?;
//! let evicted = cache.evict("profiles")?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod entry;
mod error;
mod record;
mod retry;
mod router;
mod store;
mod util;

// Re-exports for the flat public API
pub use cache::Cache;
pub use config::{CacheOptions, SyncMode};
pub use entry::{Entry, Value, ValueReader};
pub use error::{Error, Result};
