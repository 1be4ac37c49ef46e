//! Bounded-deadline retry around operations that may hit shard lock
//! contention.
//!
//! Each attempt is fully atomic on its own: an attempt that fails to
//! acquire the shard lock has no observable side effect, so retrying
//! changes latency and failure visibility, never correctness.

use crate::error::{Error, Result};
use std::thread;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(16);

pub(crate) struct RetryPolicy {
  budget: Duration,
}

impl RetryPolicy {
  pub fn new(budget: Duration) -> Self {
    Self { budget }
  }

  /// Runs `attempt` under this policy.
  ///
  /// With `retry == false` a single attempt is made and lock contention
  /// surfaces as `Timeout` immediately. With `retry == true`, contended
  /// attempts are repeated with doubling backoff until the budget is
  /// exhausted. A zero budget fails fast either way.
  pub fn run<T>(&self, retry: bool, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    let deadline = Instant::now() + self.budget;
    let mut backoff = INITIAL_BACKOFF;

    loop {
      match attempt() {
        Err(Error::Timeout) if retry => {
          let now = Instant::now();
          if now >= deadline {
            return Err(Error::Timeout);
          }
          thread::sleep(backoff.min(deadline - now));
          backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        other => return other,
      }
    }
  }
}
