use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::redirect::Policy;

use super::{header_pairs, FetchError, Request, Response};

/// The network side of the fetch boundary.
#[async_trait]
pub trait Fetcher: Send + Sync {
  /// Issue the request and capture the whole response.
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Fetcher backed by a shared reqwest client.
///
/// Redirects are returned to the caller untouched so the browser on the
/// other side of the proxy sees them.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .redirect(Policy::none())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
        continue;
      }
      builder = builder.header(name.as_str(), value.as_str());
    }

    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::network(&request.url, e))?;

    let status = response.status().as_u16();
    let headers = header_pairs(response.headers());

    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::network(&request.url, e))?;

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

/// Headers that describe a single connection and must not be forwarded.
pub fn is_hop_by_hop(name: &str) -> bool {
  matches!(
    name.to_ascii_lowercase().as_str(),
    "connection"
      | "keep-alive"
      | "proxy-authenticate"
      | "proxy-authorization"
      | "te"
      | "trailer"
      | "transfer-encoding"
      | "upgrade"
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_hop_by_hop_headers() {
    assert!(is_hop_by_hop("Connection"));
    assert!(is_hop_by_hop("transfer-encoding"));
    assert!(!is_hop_by_hop("content-type"));
    assert!(!is_hop_by_hop("cache-control"));
  }
}
