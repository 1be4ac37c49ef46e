use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::time::SystemTime;

/// A cache value: a signed 64-bit integer (required for counters) or an
/// opaque byte payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
  Int(i64),
  Bytes(Vec<u8>),
}

impl Value {
  pub fn as_int(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      Value::Bytes(_) => None,
    }
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Value::Int(_) => None,
      Value::Bytes(b) => Some(b),
    }
  }

  pub fn into_bytes(self) -> Option<Vec<u8>> {
    match self {
      Value::Int(_) => None,
      Value::Bytes(b) => Some(b),
    }
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Int(v)
  }
}

impl From<Vec<u8>> for Value {
  fn from(v: Vec<u8>) -> Self {
    Value::Bytes(v)
  }
}

impl From<&[u8]> for Value {
  fn from(v: &[u8]) -> Self {
    Value::Bytes(v.to_vec())
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::Bytes(v.as_bytes().to_vec())
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::Bytes(v.into_bytes())
  }
}

/// One entry with its metadata, as returned by `Cache::get_entry`.
#[derive(Debug, Clone)]
pub struct Entry {
  pub value: Value,
  /// Absolute expiration time. `None` means the entry never expires.
  pub expire_at: Option<SystemTime>,
  pub tag: Option<String>,
  /// Payload size in bytes (8 for integers, blob file size for
  /// oversized values).
  pub size: u64,
}

/// The on-disk representation of a value inside a shard.
///
/// Payloads at or below the inline threshold live directly in the shard
/// log; larger payloads live in a separate blob file referenced by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Stored {
  Int(i64),
  Bytes(Vec<u8>),
  Blob { file: String, size: u64 },
}

impl Stored {
  pub(crate) fn size(&self) -> u64 {
    match self {
      Stored::Int(_) => 8,
      Stored::Bytes(b) => b.len() as u64,
      Stored::Blob { size, .. } => *size,
    }
  }
}

/// Streaming reader over a value, returned by `Cache::open_stream`.
///
/// Blob values are read straight from their file without materializing
/// the payload in memory. Inline values are served from an in-memory
/// cursor; integer values stream as their 8-byte little-endian form.
///
/// The reader stays valid even if the entry is overwritten or deleted
/// after it was opened: the open file handle pins the blob version
/// current at open time until the reader is dropped.
#[derive(Debug)]
pub struct ValueReader {
  size: u64,
  inner: ReaderKind,
}

#[derive(Debug)]
enum ReaderKind {
  File(BufReader<File>),
  Inline(Cursor<Vec<u8>>),
}

impl ValueReader {
  pub(crate) fn file(file: File, size: u64) -> Self {
    Self {
      size,
      inner: ReaderKind::File(BufReader::new(file)),
    }
  }

  pub(crate) fn inline(bytes: Vec<u8>) -> Self {
    Self {
      size: bytes.len() as u64,
      inner: ReaderKind::Inline(Cursor::new(bytes)),
    }
  }

  /// Total size of the underlying value in bytes.
  pub fn size(&self) -> u64 {
    self.size
  }
}

impl Read for ValueReader {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match &mut self.inner {
      ReaderKind::File(r) => r.read(buf),
      ReaderKind::Inline(c) => c.read(buf),
    }
  }
}
