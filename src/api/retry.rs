//! Bounded retry of timed-out requests.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{FetchError, TransportError};

/// How timed-out requests are retried.
///
/// Only [`TransportError::Timeout`] is retried. Any other failure ends the
/// request on first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Extra attempts after the first one times out
  pub timeout_retries: u32,
  /// Pause between attempts
  pub delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      timeout_retries: 2,
      delay: Duration::from_millis(200),
    }
  }
}

impl RetryPolicy {
  /// Never retry.
  pub fn none() -> Self {
    Self {
      timeout_retries: 0,
      delay: Duration::ZERO,
    }
  }

  /// Run `op` until it succeeds, fails with a non-timeout error, or runs out
  /// of attempts.
  pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
  {
    let mut attempts = 0u32;
    loop {
      attempts += 1;
      match op().await {
        Ok(value) => return Ok(value),
        Err(TransportError::Timeout) if attempts <= self.timeout_retries => {
          warn!(attempt = attempts, "request timed out, retrying");
          if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
          }
        }
        Err(TransportError::Timeout) => return Err(FetchError::Timeout { attempts }),
        Err(err) => return Err(err.into()),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[tokio::test(start_paused = true)]
  async fn test_retries_timeouts_then_succeeds() {
    let attempts = &AtomicU32::new(0);
    let policy = RetryPolicy::default();

    let result = policy
      .run(|| async move {
        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
          Err(TransportError::Timeout)
        } else {
          Ok("done")
        }
      })
      .await;

    assert_eq!(result, Ok("done"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gives_up_after_retries() {
    let attempts = &AtomicU32::new(0);
    let policy = RetryPolicy {
      timeout_retries: 2,
      delay: Duration::from_millis(10),
    };

    let result: Result<(), _> = policy
      .run(|| async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Timeout)
      })
      .await;

    assert_eq!(result, Err(FetchError::Timeout { attempts: 3 }));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_other_errors_are_not_retried() {
    let attempts = &AtomicU32::new(0);

    let result: Result<(), _> = RetryPolicy::default()
      .run(|| async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Other("connection refused".to_string()))
      })
      .await;

    assert_eq!(
      result,
      Err(FetchError::Transport("connection refused".to_string()))
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_none_fails_on_first_timeout() {
    let result: Result<(), _> = RetryPolicy::none()
      .run(|| async { Err(TransportError::Timeout) })
      .await;
    assert_eq!(result, Err(FetchError::Timeout { attempts: 1 }));
  }
}
