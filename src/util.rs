use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

/// Atomically places `bytes` at `path` using the temp-file + rename +
/// directory-fsync pattern. A reader never observes a partially written
/// file at `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
  let temp_path = path.with_extension("tmp");

  let mut file = File::create(&temp_path)?;
  file.write_all(bytes)?;
  file.sync_all()?;
  drop(file);

  fs::rename(&temp_path, path)?;

  if let Some(dir) = path.parent() {
    sync_dir(dir)?;
  }

  Ok(())
}

/// Fsyncs a directory so a preceding rename survives a crash.
pub(crate) fn sync_dir(dir: &Path) -> io::Result<()> {
  let handle = OpenOptions::new().read(true).open(dir)?;
  handle.sync_all()
}

static BLOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generates a blob filename that is unique across the processes
/// sharing a cache directory (pid + wall clock + per-process counter).
pub(crate) fn blob_filename() -> String {
  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_nanos() as u64;
  let seq = BLOB_SEQ.fetch_add(1, Ordering::Relaxed);
  format!("{:08x}-{:016x}-{:04x}.val", std::process::id(), nanos, seq & 0xFFFF)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;
  use tempfile::TempDir;

  #[test]
  fn test_write_atomic_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("target.bin");

    write_atomic(&path, b"first").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"first");

    write_atomic(&path, b"second").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"second");
  }

  #[test]
  fn test_write_atomic_ignores_stale_temp() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("target.bin");

    // Simulate a crash that left a temp file behind.
    fs::write(dir.path().join("target.tmp"), b"garbage").unwrap();

    write_atomic(&path, b"clean").unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"clean");
  }

  #[test]
  fn test_blob_filenames_unique() {
    let names: HashSet<String> = (0..1000).map(|_| blob_filename()).collect();
    assert_eq!(names.len(), 1000);
  }

  #[test]
  fn test_now_millis_advances() {
    let a = now_millis();
    let b = now_millis();
    assert!(b >= a);
  }
}
