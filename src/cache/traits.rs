//! Core types for the response cache.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use url::Url;

use crate::fetch::Response;

/// Cache key for a request URL: the absolute URL without its fragment.
pub fn request_key(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// Headers that are never written to the store.
const UNSTORED_HEADERS: &[&str] = &["set-cookie", "set-cookie2"];

/// The copy of `response` that goes into the store, without its cookies.
pub fn storable(response: &Response) -> Response {
  let mut stored = response.clone();
  stored
    .headers
    .retain(|(name, _)| !UNSTORED_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)));
  stored
}

/// A response read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub url: String,
  pub response: Response,
  /// When the response was written
  pub cached_at: DateTime<Utc>,
}

/// Listing row for a cached entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
  pub url: String,
  pub status: u16,
  pub cached_at: DateTime<Utc>,
}

/// A response handed back to the host, with metadata about its origin.
#[derive(Debug)]
pub struct Served {
  /// The response to send
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background refresh started for a stale-while-revalidate hit
  pub revalidation: Option<JoinHandle<()>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
      revalidation: None,
    }
  }

  pub fn from_preload(response: Response) -> Self {
    Self {
      source: CacheSource::Preload,
      ..Self::from_network(response)
    }
  }

  pub fn from_cache(
    response: Response,
    cached_at: DateTime<Utc>,
    revalidation: Option<JoinHandle<()>>,
  ) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      revalidation,
    }
  }

  /// The offline page served after a failed navigation.
  pub fn offline(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
      revalidation: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live network fetch
  Network,
  /// Navigation preload started by the host
  Preload,
  /// Cached copy, refreshed in the background
  Cache,
  /// Offline fallback page
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Preload => "preload",
      Self::Cache => "cache",
      Self::Offline => "offline",
    }
  }
}
