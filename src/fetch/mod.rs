//! Request and response types exchanged at the fetch boundary.

mod client;

pub use client::{is_hop_by_hop, Fetcher, HttpFetcher};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Header the host attaches to navigation preload requests.
pub const PRELOAD_HEADER: &str = "service-worker-navigation-preload";

/// How a request was initiated. Mirrors the `Sec-Fetch-Mode` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  #[default]
  SameOrigin,
  NoCors,
  Cors,
  Websocket,
}

impl RequestMode {
  /// Parse a `Sec-Fetch-Mode` header value.
  pub fn from_header(value: &str) -> Option<Self> {
    match value.trim().to_ascii_lowercase().as_str() {
      "navigate" => Some(Self::Navigate),
      "same-origin" => Some(Self::SameOrigin),
      "no-cors" => Some(Self::NoCors),
      "cors" => Some(Self::Cors),
      "websocket" => Some(Self::Websocket),
      _ => None,
    }
  }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Request {
  /// A plain same-origin GET.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::SameOrigin,
      headers: Vec::new(),
      body: Bytes::new(),
    }
  }

  /// A GET issued by a top-level navigation.
  #[cfg(test)]
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }
}

/// A captured HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  #[cfg(test)]
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// True for 2xx statuses.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// Copy a header map into text pairs.
///
/// Values that are not valid UTF-8 cannot be carried and are skipped.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter_map(|(name, value)| match value.to_str() {
      Ok(v) => Some((name.as_str().to_string(), v.to_string())),
      Err(_) => {
        debug!(header = %name, "skipping header value that is not UTF-8");
        None
      }
    })
    .collect()
}

/// A fetch that did not produce a response at all.
///
/// Non-2xx statuses are responses, not errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error("network error for {url}: {reason}")]
  Network { url: String, reason: String },

  #[error("navigation preload aborted: {0}")]
  Preload(String),
}

impl FetchError {
  pub fn network(url: &Url, reason: impl ToString) -> Self {
    Self::Network {
      url: url.to_string(),
      reason: reason.to_string(),
    }
  }
}

#[cfg(test)]
pub mod testing {
  //! A scripted fetcher for exercising the worker without a network.

  use super::{FetchError, Fetcher, Request, Response};
  use async_trait::async_trait;
  use std::collections::{HashMap, VecDeque};
  use std::sync::Mutex;
  use std::time::Duration;
  use url::Url;

  /// Replies from a per-URL script. The last scripted reply for a URL
  /// repeats forever; unknown URLs fail like an unreachable network.
  #[derive(Default)]
  pub struct ScriptedFetcher {
    script: Mutex<HashMap<String, VecDeque<Result<Response, FetchError>>>>,
    calls: Mutex<Vec<Request>>,
    delay: Option<Duration>,
  }

  impl ScriptedFetcher {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn respond(mut self, url: &str, response: Response) -> Self {
      self.push(url, Ok(response));
      self
    }

    pub fn fail(mut self, url: &str) -> Self {
      let parsed = Url::parse(url).unwrap();
      self.push(url, Err(FetchError::network(&parsed, "connection refused")));
      self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
      self.delay = Some(delay);
      self
    }

    fn push(&mut self, url: &str, reply: Result<Response, FetchError>) {
      self
        .script
        .get_mut()
        .unwrap()
        .entry(url.to_string())
        .or_default()
        .push_back(reply);
    }

    /// Every request seen so far, in order.
    pub fn calls(&self) -> Vec<Request> {
      self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url.as_str() == url)
        .count()
    }
  }

  #[async_trait]
  impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
      self.calls.lock().unwrap().push(request.clone());

      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }

      let mut script = self.script.lock().unwrap();
      match script.get_mut(request.url.as_str()) {
        Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
        Some(queue) if !queue.is_empty() => queue[0].clone(),
        _ => Err(FetchError::network(&request.url, "no scripted reply")),
      }
    }
  }
}
