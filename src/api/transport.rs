//! Network transport for read requests.

use reqwest::Client;
use std::future::Future;
use std::time::Duration;
use url::Url;

use crate::cache::Params;
use crate::error::TransportError;

/// Raw response from the API before any decoding.
#[derive(Debug, Clone)]
pub struct RawResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

impl RawResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      body: body.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Performs one GET request against the API.
///
/// Implementations report timeouts as [`TransportError::Timeout`] so the
/// caller can retry them.
pub trait Transport: Send + Sync + 'static {
  fn perform(
    &self,
    path: &str,
    params: &Params,
  ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
    let base_url = Url::parse(base_url)
      .map_err(|e| TransportError::Other(format!("invalid base url {}: {}", base_url, e)))?;

    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TransportError::Other(format!("failed to build http client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  /// Full request URL for a path and its parameters.
  pub fn url_for(&self, path: &str, params: &Params) -> Url {
    let mut url = self.base_url.clone();
    let joined = format!(
      "{}/{}",
      url.path().trim_end_matches('/'),
      path.trim_start_matches('/')
    );
    url.set_path(&joined);

    let pairs = params.query_pairs();
    if pairs.is_empty() {
      url.set_query(None);
    } else {
      url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url
  }
}

impl Transport for HttpTransport {
  async fn perform(&self, path: &str, params: &Params) -> Result<RawResponse, TransportError> {
    let url = self.url_for(path, params);

    let response = self
      .client
      .get(url)
      .header(reqwest::header::ACCEPT, "application/json")
      .send()
      .await
      .map_err(classify)?;

    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(classify)?;

    Ok(RawResponse::new(status, body.to_vec()))
  }
}

fn classify(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::Timeout
  } else {
    TransportError::Other(err.to_string())
  }
}
