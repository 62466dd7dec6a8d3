//! Error types for cached reads.

use thiserror::Error;

/// Failure reported by a [`Transport`](crate::api::Transport) before any
/// response was received.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  /// The request did not complete within the transport's deadline.
  #[error("request timed out")]
  Timeout,
  /// Connection, TLS or protocol failure.
  #[error("transport failure: {0}")]
  Other(String),
}

/// Outcome of a failed cached read.
///
/// One network call may be shared by many callers, so the error is `Clone`
/// and every consumer of the call receives the same value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// Every attempt timed out.
  #[error("request timed out after {attempts} attempt(s)")]
  Timeout { attempts: u32 },

  /// The server answered with a non-2xx status.
  #[error("server returned status {status}: {body}")]
  Status { status: u16, body: String },

  /// The response body was not valid JSON.
  #[error("malformed response payload: {0}")]
  Malformed(String),

  /// Connection-level failure other than a timeout.
  #[error("transport failure: {0}")]
  Transport(String),

  /// The payload is valid JSON but does not fit the requested type.
  #[error("failed to decode payload: {0}")]
  Decode(String),

  /// The fetch panicked, was cancelled, or had no Tokio runtime to run on.
  #[error("fetch task aborted: {0}")]
  Aborted(String),
}

impl From<TransportError> for FetchError {
  fn from(err: TransportError) -> Self {
    match err {
      TransportError::Timeout => FetchError::Timeout { attempts: 1 },
      TransportError::Other(msg) => FetchError::Transport(msg),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transport_timeout_maps_to_timeout() {
    let err: FetchError = TransportError::Timeout.into();
    assert_eq!(err, FetchError::Timeout { attempts: 1 });

    let err: FetchError = TransportError::Other("connection reset".into()).into();
    assert_eq!(err, FetchError::Transport("connection reset".into()));
  }

  #[test]
  fn test_status_error_message() {
    let err = FetchError::Status {
      status: 404,
      body: "not found".to_string(),
    };
    assert_eq!(err.to_string(), "server returned status 404: not found");
  }
}
