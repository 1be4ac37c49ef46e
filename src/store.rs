//! One shard's persistent store.
//!
//! A shard is a self-contained directory: a `lock` file serializing
//! access across processes, an append-only record log, and a `blobs/`
//! area for oversized values. Every operation, reads included, runs as
//! one short transaction:
//!
//! 1. take the advisory file lock (contention surfaces as `Timeout`);
//! 2. replay any records appended by other processes since the last
//!    transaction, rebuilding from scratch if the log generation
//!    changed (another process compacted it);
//! 3. perform the operation, appending records for mutations;
//! 4. fsync per the configured [`SyncMode`] and release the lock.
//!
//! The entry table lives in memory and is only ever a replica of the
//! log, so concurrent processes converge on the same state. A torn
//! record at the log tail (crash mid-append) is truncated on the next
//! transaction; corruption anywhere else is fatal for the shard and is
//! reported so the caller can decide to rebuild it.

use crate::config::{CacheOptions, SyncMode};
use crate::entry::{Entry, Stored, Value, ValueReader};
use crate::error::{Error, Result};
use crate::record::{self, Record};
use crate::util;

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fs2::FileExt;

const LOG_FILE: &str = "entries.log";
const LOCK_FILE: &str = "lock";
const BLOB_DIR: &str = "blobs";

/// Logs smaller than this are never compacted.
const COMPACT_MIN_BYTES: u64 = 1 << 20; // 1 MiB

#[derive(Debug, Clone)]
struct EntryMeta {
  value: Stored,
  expire_at: Option<u64>,
  tag: Option<String>,
  /// Framed length of the record currently backing this entry, for
  /// dead-space accounting.
  rec_len: u64,
}

impl EntryMeta {
  fn is_live(&self, now: u64) -> bool {
    self.expire_at.map_or(true, |t| t > now)
  }
}

/// An open transaction: the log file handle plus a dirty flag that
/// tracks whether anything was appended.
struct Txn {
  log: File,
  dirty: bool,
}

pub(crate) struct ShardStore {
  dir: PathBuf,
  opts: Arc<CacheOptions>,
  /// Flock target. `None` once the cache is closed.
  lock: Option<File>,
  entries: HashMap<String, EntryMeta>,
  /// Tag index: `Some` iff the index is enabled for this shard.
  tags: Option<HashMap<String, BTreeSet<String>>>,
  generation: u64,
  /// Replayed byte offset; equals the log length after a transaction.
  offset: u64,
  /// Bytes occupied by records that still back a live table row.
  live_bytes: u64,
}

impl ShardStore {
  pub fn open(dir: PathBuf, opts: Arc<CacheOptions>) -> Result<Self> {
    fs::create_dir_all(dir.join(BLOB_DIR))?;

    let lock = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(dir.join(LOCK_FILE))?;

    Ok(Self {
      dir,
      opts,
      lock: Some(lock),
      entries: HashMap::new(),
      tags: None,
      generation: 0,
      offset: 0,
      live_bytes: 0,
    })
  }

  /// Releases the process-local lock handle. On-disk state is untouched
  /// and other processes sharing the directory are unaffected.
  pub fn close(&mut self) {
    self.lock = None;
  }

  // --- Operations (each runs as one transaction) ---

  pub fn set(
    &mut self,
    key: &str,
    value: &Value,
    ttl: Option<Duration>,
    tag: Option<&str>,
  ) -> Result<()> {
    self.with_txn(|s, txn| {
      let stored = s.store_value(value)?;
      let expire_at = expire_from_ttl(ttl);
      let old = s.put(txn, key, stored, expire_at, tag.map(str::to_string))?;
      if let Some(old) = old {
        s.discard_blob(&old.value)?;
      }
      Ok(())
    })
  }

  pub fn add(
    &mut self,
    key: &str,
    value: &Value,
    ttl: Option<Duration>,
    tag: Option<&str>,
  ) -> Result<bool> {
    self.with_txn(|s, txn| {
      let now = util::now_millis();
      if s.live(key, now).is_some() {
        return Ok(false);
      }

      let stored = s.store_value(value)?;
      let expire_at = expire_from_ttl(ttl);
      let old = s.put(txn, key, stored, expire_at, tag.map(str::to_string))?;
      if let Some(old) = old {
        s.discard_blob(&old.value)?;
      }
      Ok(true)
    })
  }

  pub fn get(&mut self, key: &str) -> Result<Option<Entry>> {
    self.with_txn(|s, _| {
      let now = util::now_millis();
      let Some(meta) = s.live(key, now) else {
        return Ok(None);
      };

      let value = match &meta.value {
        Stored::Int(i) => Value::Int(*i),
        Stored::Bytes(b) => Value::Bytes(b.clone()),
        Stored::Blob { file, size } => {
          let mut buf = Vec::with_capacity(*size as usize);
          File::open(s.dir.join(BLOB_DIR).join(file))?.read_to_end(&mut buf)?;
          Value::Bytes(buf)
        }
      };

      Ok(Some(Entry {
        value,
        expire_at: meta.expire_at.map(|t| UNIX_EPOCH + Duration::from_millis(t)),
        tag: meta.tag.clone(),
        size: meta.value.size(),
      }))
    })
  }

  pub fn delete(&mut self, key: &str) -> Result<bool> {
    self.with_txn(|s, txn| {
      if !s.entries.contains_key(key) {
        return Ok(false);
      }

      // Expired rows are removed physically but do not count as a
      // deletion the caller can observe.
      let was_live = s.live(key, util::now_millis()).is_some();
      if let Some(old) = s.remove(txn, key)? {
        s.discard_blob(&old.value)?;
      }
      Ok(was_live)
    })
  }

  pub fn incr(&mut self, key: &str, delta: i64, default: Option<i64>) -> Result<i64> {
    self.with_txn(|s, txn| {
      let now = util::now_millis();
      match s.live(key, now) {
        Some(meta) => {
          let current = match &meta.value {
            Stored::Int(i) => *i,
            _ => return Err(Error::NotAnInteger),
          };
          let expire_at = meta.expire_at;
          let tag = meta.tag.clone();

          let new = current.wrapping_add(delta);
          s.put(txn, key, Stored::Int(new), expire_at, tag)?;
          Ok(new)
        }
        None => {
          let Some(seed) = default else {
            return Err(Error::KeyNotFound);
          };
          let new = seed.wrapping_add(delta);
          let old = s.put(txn, key, Stored::Int(new), None, None)?;
          if let Some(old) = old {
            s.discard_blob(&old.value)?;
          }
          Ok(new)
        }
      }
    })
  }

  pub fn contains(&mut self, key: &str) -> Result<bool> {
    self.with_txn(|s, _| Ok(s.live(key, util::now_millis()).is_some()))
  }

  pub fn len(&mut self, now: u64) -> Result<usize> {
    self.with_txn(|s, _| Ok(s.entries.values().filter(|m| m.is_live(now)).count()))
  }

  /// Physically removes every entry whose expire time has passed `now`.
  pub fn expire(&mut self, now: u64) -> Result<usize> {
    self.with_txn(|s, txn| {
      let expired: Vec<String> = s
        .entries
        .iter()
        .filter(|(_, m)| !m.is_live(now))
        .map(|(k, _)| k.clone())
        .collect();

      let mut removed = 0;
      for key in expired {
        if let Some(old) = s.remove(txn, &key)? {
          s.discard_blob(&old.value)?;
          removed += 1;
        }
      }
      Ok(removed)
    })
  }

  /// Removes every entry carrying `tag`, via the tag index when it is
  /// enabled and a full table scan otherwise (the documented slow path).
  pub fn evict(&mut self, tag: &str) -> Result<usize> {
    self.with_txn(|s, txn| {
      let keys: Vec<String> = match &s.tags {
        Some(tags) => tags
          .get(tag)
          .map(|set| set.iter().cloned().collect())
          .unwrap_or_default(),
        None => s
          .entries
          .iter()
          .filter(|(_, m)| m.tag.as_deref() == Some(tag))
          .map(|(k, _)| k.clone())
          .collect(),
      };

      let mut removed = 0;
      for key in keys {
        if let Some(old) = s.remove(txn, &key)? {
          s.discard_blob(&old.value)?;
          removed += 1;
        }
      }
      Ok(removed)
    })
  }

  /// Removes every entry. The tag index setting survives.
  pub fn clear(&mut self) -> Result<usize> {
    self.with_txn(|s, txn| {
      let removed = s.entries.len();
      let blobs: Vec<String> = s
        .entries
        .values()
        .filter_map(|m| match &m.value {
          Stored::Blob { file, .. } => Some(file.clone()),
          _ => None,
        })
        .collect();

      s.entries.clear();
      if let Some(tags) = s.tags.as_mut() {
        tags.clear();
      }
      s.rewrite_log(txn)?;

      for file in blobs {
        s.remove_blob_file(&file)?;
      }
      Ok(removed)
    })
  }

  pub fn create_tag_index(&mut self) -> Result<()> {
    self.with_txn(|s, txn| {
      if s.tags.is_some() {
        return Ok(());
      }
      let rec = Record::TagIndexOn;
      let rec_len = s.append(txn, &rec)?;
      s.apply(rec, rec_len);
      Ok(())
    })
  }

  pub fn drop_tag_index(&mut self) -> Result<()> {
    self.with_txn(|s, txn| {
      if s.tags.is_none() {
        return Ok(());
      }
      let rec = Record::TagIndexOff;
      let rec_len = s.append(txn, &rec)?;
      s.apply(rec, rec_len);
      Ok(())
    })
  }

  pub fn open_stream(&mut self, key: &str) -> Result<ValueReader> {
    self.with_txn(|s, _| {
      let now = util::now_millis();
      let Some(meta) = s.live(key, now) else {
        return Err(Error::KeyNotFound);
      };

      match &meta.value {
        Stored::Blob { file, size } => {
          let handle = File::open(s.dir.join(BLOB_DIR).join(file))?;
          Ok(ValueReader::file(handle, *size))
        }
        Stored::Bytes(b) => Ok(ValueReader::inline(b.clone())),
        Stored::Int(i) => Ok(ValueReader::inline(i.to_le_bytes().to_vec())),
      }
    })
  }

  // --- Transaction plumbing ---

  fn with_txn<T>(&mut self, f: impl FnOnce(&mut Self, &mut Txn) -> Result<T>) -> Result<T> {
    self.acquire_lock()?;
    let mut txn = match self.prepare() {
      Ok(txn) => txn,
      Err(e) => {
        self.release_lock();
        return Err(e);
      }
    };
    let res = f(self, &mut txn);
    self.finish(txn, res)
  }

  fn acquire_lock(&self) -> Result<()> {
    let lock = self.lock.as_ref().ok_or(Error::Closed)?;
    match lock.try_lock_exclusive() {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::Timeout),
      Err(e) => Err(e.into()),
    }
  }

  fn release_lock(&self) {
    if let Some(lock) = &self.lock {
      let _ = fs2::FileExt::unlock(lock);
    }
  }

  /// Opens the log and catches the in-memory table up with whatever
  /// other processes appended since our last transaction.
  fn prepare(&mut self) -> Result<Txn> {
    let mut log = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(self.dir.join(LOG_FILE))?;

    let len = log.metadata()?.len();
    if len < record::LOG_HEADER_SIZE {
      if len > 0 {
        tracing::warn!(
          target: "shardcache::store",
          shard = %self.dir.display(),
          "discarding torn log header"
        );
      }
      log.set_len(0)?;
      log.seek(SeekFrom::Start(0))?;
      record::write_log_header(&mut log, 1)?;
      log.sync_data()?;
      util::sync_dir(&self.dir)?;
      self.reset_state(1);
    } else {
      log.seek(SeekFrom::Start(0))?;
      let generation = record::read_log_header(&mut log)?;
      if generation != self.generation {
        self.reset_state(generation);
      }
      self.replay(&mut log, len)?;
    }

    Ok(Txn { log, dirty: false })
  }

  fn replay(&mut self, log: &mut File, len: u64) -> Result<()> {
    if self.offset >= len {
      return Ok(());
    }

    log.seek(SeekFrom::Start(self.offset))?;
    let mut reader = BufReader::new(&mut *log);
    let mut pos = self.offset;
    let mut truncate_from = None;

    while pos < len {
      match Record::decode(&mut reader, pos, len - pos) {
        Ok((rec, next)) => {
          self.apply(rec, next - pos);
          pos = next;
        }
        Err(e) => {
          // Appends are framed, so a decode failure here can only be a
          // torn tail from a crash mid-append.
          tracing::warn!(
            target: "shardcache::store",
            shard = %self.dir.display(),
            offset = pos,
            error = %e,
            "truncating corrupt log tail"
          );
          truncate_from = Some(pos);
          break;
        }
      }
    }
    drop(reader);

    if let Some(at) = truncate_from {
      log.set_len(at)?;
      log.sync_data()?;
    }

    self.offset = pos;
    Ok(())
  }

  fn finish<T>(&mut self, mut txn: Txn, res: Result<T>) -> Result<T> {
    let res = res.and_then(|value| {
      if txn.dirty {
        self.maybe_compact(&mut txn)?;
        if txn.dirty && self.opts.sync_mode == SyncMode::Strict {
          txn.log.sync_data()?;
        }
      }
      Ok(value)
    });
    self.release_lock();
    res
  }

  fn reset_state(&mut self, generation: u64) {
    self.entries.clear();
    self.tags = None;
    self.generation = generation;
    self.offset = record::LOG_HEADER_SIZE;
    self.live_bytes = 0;
  }

  // --- Record application ---

  /// Appends a framed record at the end of the log.
  fn append(&mut self, txn: &mut Txn, rec: &Record) -> Result<u64> {
    let buf = rec.encode()?;
    txn.log.seek(SeekFrom::End(0))?;
    txn.log.write_all(&buf)?;
    txn.dirty = true;
    self.offset += buf.len() as u64;
    Ok(buf.len() as u64)
  }

  /// Applies a record to the in-memory table, returning the entry it
  /// displaced (if any). Used both on replay and after an append.
  fn apply(&mut self, rec: Record, rec_len: u64) -> Option<EntryMeta> {
    match rec {
      Record::Put {
        key,
        value,
        expire_at,
        tag,
      } => {
        let old = self.entries.remove(&key);
        if let Some(old) = &old {
          self.live_bytes = self.live_bytes.saturating_sub(old.rec_len);
          self.untag(&key, &old.tag);
        }

        if let (Some(tags), Some(t)) = (self.tags.as_mut(), tag.as_ref()) {
          tags.entry(t.clone()).or_default().insert(key.clone());
        }

        self.live_bytes += rec_len;
        self.entries.insert(
          key,
          EntryMeta {
            value,
            expire_at,
            tag,
            rec_len,
          },
        );
        old
      }
      Record::Delete { key } => {
        let old = self.entries.remove(&key);
        if let Some(old) = &old {
          self.live_bytes = self.live_bytes.saturating_sub(old.rec_len);
          self.untag(&key, &old.tag);
        }
        old
      }
      Record::TagIndexOn => {
        if self.tags.is_none() {
          let mut tags: HashMap<String, BTreeSet<String>> = HashMap::new();
          for (key, meta) in &self.entries {
            if let Some(t) = &meta.tag {
              tags.entry(t.clone()).or_default().insert(key.clone());
            }
          }
          self.tags = Some(tags);
        }
        None
      }
      Record::TagIndexOff => {
        self.tags = None;
        None
      }
    }
  }

  fn put(
    &mut self,
    txn: &mut Txn,
    key: &str,
    value: Stored,
    expire_at: Option<u64>,
    tag: Option<String>,
  ) -> Result<Option<EntryMeta>> {
    let rec = Record::Put {
      key: key.to_string(),
      value,
      expire_at,
      tag,
    };
    let rec_len = self.append(txn, &rec)?;
    Ok(self.apply(rec, rec_len))
  }

  fn remove(&mut self, txn: &mut Txn, key: &str) -> Result<Option<EntryMeta>> {
    let rec = Record::Delete {
      key: key.to_string(),
    };
    let rec_len = self.append(txn, &rec)?;
    Ok(self.apply(rec, rec_len))
  }

  fn untag(&mut self, key: &str, tag: &Option<String>) {
    if let (Some(tags), Some(t)) = (self.tags.as_mut(), tag.as_ref()) {
      if let Some(set) = tags.get_mut(t) {
        set.remove(key);
        if set.is_empty() {
          tags.remove(t);
        }
      }
    }
  }

  fn live(&self, key: &str, now: u64) -> Option<&EntryMeta> {
    self.entries.get(key).filter(|m| m.is_live(now))
  }

  // --- Values ---

  /// Converts a caller value into its stored form. Oversized byte
  /// payloads are placed durably in the blob area before the metadata
  /// record referencing them is ever written.
  fn store_value(&self, value: &Value) -> Result<Stored> {
    match value {
      Value::Int(i) => Ok(Stored::Int(*i)),
      Value::Bytes(b) if b.len() > self.opts.inline_threshold => {
        let file = util::blob_filename();
        util::write_atomic(&self.dir.join(BLOB_DIR).join(&file), b)?;
        Ok(Stored::Blob {
          file,
          size: b.len() as u64,
        })
      }
      Value::Bytes(b) => Ok(Stored::Bytes(b.clone())),
    }
  }

  /// Unlinks the blob behind a displaced value, if it had one. Readers
  /// holding an open stream keep the unlinked inode alive until they
  /// drop it.
  fn discard_blob(&self, value: &Stored) -> Result<()> {
    if let Stored::Blob { file, .. } = value {
      self.remove_blob_file(file)?;
    }
    Ok(())
  }

  fn remove_blob_file(&self, file: &str) -> Result<()> {
    match fs::remove_file(self.dir.join(BLOB_DIR).join(file)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  // --- Compaction ---

  fn maybe_compact(&mut self, txn: &mut Txn) -> Result<()> {
    let data = self.offset.saturating_sub(record::LOG_HEADER_SIZE);
    if self.offset > COMPACT_MIN_BYTES && self.live_bytes * 2 < data {
      let before = self.offset;
      self.rewrite_log(txn)?;
      tracing::debug!(
        target: "shardcache::store",
        shard = %self.dir.display(),
        before,
        after = self.offset,
        "compacted shard log"
      );
    }
    Ok(())
  }

  /// Rewrites the log to hold only live rows, bumping the generation so
  /// other processes rebuild. Expired rows are dropped for good here.
  fn rewrite_log(&mut self, txn: &mut Txn) -> Result<()> {
    let now = util::now_millis();
    let expired: Vec<String> = self
      .entries
      .iter()
      .filter(|(_, m)| !m.is_live(now))
      .map(|(k, _)| k.clone())
      .collect();
    for key in expired {
      if let Some(old) = self.entries.remove(&key) {
        self.untag(&key, &old.tag);
        self.discard_blob(&old.value)?;
      }
    }

    let mut buf = Vec::new();
    record::write_log_header(&mut buf, self.generation.wrapping_add(1))?;
    if self.tags.is_some() {
      buf.extend_from_slice(&Record::TagIndexOn.encode()?);
    }

    let mut live_bytes = 0u64;
    for (key, meta) in self.entries.iter_mut() {
      let rec = Record::Put {
        key: key.clone(),
        value: meta.value.clone(),
        expire_at: meta.expire_at,
        tag: meta.tag.clone(),
      };
      let bytes = rec.encode()?;
      meta.rec_len = bytes.len() as u64;
      live_bytes += meta.rec_len;
      buf.extend_from_slice(&bytes);
    }

    util::write_atomic(&self.dir.join(LOG_FILE), &buf)?;

    self.generation = self.generation.wrapping_add(1);
    self.offset = buf.len() as u64;
    self.live_bytes = live_bytes;
    // The rewrite is already durable; nothing left to fsync on the old
    // file handle.
    txn.dirty = false;
    Ok(())
  }
}

fn expire_from_ttl(ttl: Option<Duration>) -> Option<u64> {
  ttl.map(|d| util::now_millis().saturating_add(d.as_millis() as u64))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn test_store(opts: CacheOptions) -> (ShardStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut opts = opts;
    opts.dir = dir.path().to_path_buf();
    let store = ShardStore::open(dir.path().join("shard_00"), Arc::new(opts)).unwrap();
    (store, dir)
  }

  #[test]
  fn test_set_get_roundtrip() {
    let (mut store, _dir) = test_store(CacheOptions::default());

    store.set("k", &Value::from("v"), None, None).unwrap();
    let entry = store.get("k").unwrap().unwrap();
    assert_eq!(entry.value, Value::from("v"));
    assert_eq!(entry.size, 1);
    assert!(entry.expire_at.is_none());
  }

  #[test]
  fn test_lazy_expiry_on_read() {
    let (mut store, _dir) = test_store(CacheOptions::default());

    store
      .set("k", &Value::from("v"), Some(Duration::ZERO), None)
      .unwrap();
    assert!(store.get("k").unwrap().is_none());
    assert!(!store.contains("k").unwrap());
    // The row is still physically present until swept.
    assert!(store.entries.contains_key("k"));

    let removed = store.expire(util::now_millis()).unwrap();
    assert_eq!(removed, 1);
    assert!(!store.entries.contains_key("k"));
  }

  #[test]
  fn test_evict_scan_matches_index() {
    let (mut store, _dir) = test_store(CacheOptions::default());

    for i in 0..10 {
      let tag = if i % 2 == 0 { Some("even") } else { None };
      store
        .set(&format!("k{}", i), &Value::Int(i), None, tag)
        .unwrap();
    }

    // Full-scan path.
    assert_eq!(store.evict("even").unwrap(), 5);

    // Index path.
    store.create_tag_index().unwrap();
    for i in 0..10 {
      let tag = if i % 2 == 0 { Some("even") } else { None };
      store
        .set(&format!("k{}", i), &Value::Int(i), None, tag)
        .unwrap();
    }
    assert_eq!(store.evict("even").unwrap(), 5);
    assert_eq!(store.len(util::now_millis()).unwrap(), 5);
  }

  #[test]
  fn test_replay_after_external_append() {
    let dir = TempDir::new().unwrap();
    let opts = Arc::new(CacheOptions::default());
    let shard_dir = dir.path().join("shard_00");

    let mut writer = ShardStore::open(shard_dir.clone(), opts.clone()).unwrap();
    let mut reader = ShardStore::open(shard_dir, opts).unwrap();

    writer.set("k", &Value::Int(1), None, None).unwrap();
    assert_eq!(
      reader.get("k").unwrap().unwrap().value,
      Value::Int(1),
      "second handle must replay the first handle's append"
    );

    writer.delete("k").unwrap();
    assert!(reader.get("k").unwrap().is_none());
  }

  #[test]
  fn test_closed_store_times_out_nothing() {
    let (mut store, _dir) = test_store(CacheOptions::default());
    store.close();
    assert!(matches!(store.get("k"), Err(Error::Closed)));
  }
}
