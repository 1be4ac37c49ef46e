use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
  #[error("I/O Error: {0}")]
  Io(#[from] io::Error),

  #[error("Data Corruption: {0}")]
  Corruption(String),

  #[error("Configuration Error: {0}")]
  Config(String),

  /// The shard lock could not be acquired within the retry budget.
  /// The triggering operation has no observable side effect.
  #[error("Timeout: shard lock not acquired within the retry budget")]
  Timeout,

  /// A key required to exist (incr/decr without a default, open_stream)
  /// is absent or expired.
  #[error("Key not found")]
  KeyNotFound,

  /// Counter arithmetic was attempted on a non-integer value.
  #[error("Value is not an integer")]
  NotAnInteger,

  /// The cache handle has been closed.
  #[error("Cache is closed")]
  Closed,
}
