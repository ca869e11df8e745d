//! Stale-while-revalidate strategy over a cache store and a fetcher.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{request_key, storable, Served};
use crate::fetch::{FetchError, Fetcher, Request, Response};

/// Serves cached responses immediately and refreshes them in the background.
///
/// 1. Check cache - if present, return it and start a background fetch
/// 2. On a miss, fetch from network and store the result
/// 3. Only `200` responses are written to the store
#[derive(Clone)]
pub struct StaleWhileRevalidate {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  cache_name: String,
}

impl StaleWhileRevalidate {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    cache_name: impl Into<String>,
  ) -> Self {
    Self {
      storage,
      fetcher,
      cache_name: cache_name.into(),
    }
  }

  /// Handle one request.
  ///
  /// Fails only when nothing is cached and the network fails too.
  pub async fn handle(&self, request: Request) -> Result<Served, FetchError> {
    let key = request_key(&request.url);

    match self.storage.match_url(&self.cache_name, &key) {
      Ok(Some(cached)) => {
        debug!(url = %key, "serving cached copy, revalidating");
        let revalidation = self.revalidate(request, key);
        return Ok(Served::from_cache(
          cached.response,
          cached.cached_at,
          Some(revalidation),
        ));
      }
      Ok(None) => {}
      Err(e) => warn!(url = %key, error = %e, "cache lookup failed, going to network"),
    }

    let response = self.fetcher.fetch(&request).await?;
    store(self.storage.as_ref(), &self.cache_name, &key, &response);

    Ok(Served::from_network(response))
  }

  /// Refresh `key` from the network without blocking the caller.
  fn revalidate(&self, request: Request, key: String) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let fetcher = Arc::clone(&self.fetcher);
    let cache_name = self.cache_name.clone();

    tokio::spawn(async move {
      match fetcher.fetch(&request).await {
        Ok(response) => store(storage.as_ref(), &cache_name, &key, &response),
        Err(e) => warn!(url = %key, error = %e, "background revalidation failed"),
      }
    })
  }
}

fn store(storage: &dyn CacheStorage, cache_name: &str, key: &str, response: &Response) {
  if response.status != 200 {
    debug!(url = %key, status = response.status, "not caching non-200 response");
    return;
  }

  if let Err(e) = storage.put(cache_name, key, &storable(response)) {
    warn!(url = %key, error = %e, "failed to update cache");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::fetch::testing::ScriptedFetcher;
  use bytes::Bytes;
  use std::time::Duration;
  use url::Url;

  const CACHE: &str = "swr-test";
  const STYLE: &str = "http://app.test/static/site.css";

  fn request() -> Request {
    Request::get(Url::parse(STYLE).unwrap())
  }

  #[tokio::test]
  async fn test_hit_serves_cache_then_refreshes() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    storage.put(CACHE, STYLE, &Response::new(200, "old")).unwrap();
    let fetcher = Arc::new(
      ScriptedFetcher::new()
        .respond(STYLE, Response::new(200, "new"))
        .with_delay(Duration::from_millis(20)),
    );
    let swr = StaleWhileRevalidate::new(storage.clone(), fetcher.clone(), CACHE);

    let served = swr.handle(request()).await.unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.response.body, Bytes::from("old"));

    served.revalidation.unwrap().await.unwrap();
    let cached = storage.match_url(CACHE, STYLE).unwrap().unwrap();
    assert_eq!(cached.response.body, Bytes::from("new"));
    assert_eq!(fetcher.calls_to(STYLE), 1);
  }

  #[tokio::test]
  async fn test_miss_fetches_and_stores() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new().respond(STYLE, Response::new(200, "body")));
    let swr = StaleWhileRevalidate::new(storage.clone(), fetcher, CACHE);

    let served = swr.handle(request()).await.unwrap();
    assert_eq!(served.source, CacheSource::Network);
    assert!(served.revalidation.is_none());
    assert!(storage.match_url(CACHE, STYLE).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_non_200_is_served_but_not_stored() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new().respond(STYLE, Response::new(404, "gone")));
    let swr = StaleWhileRevalidate::new(storage.clone(), fetcher, CACHE);

    let served = swr.handle(request()).await.unwrap();
    assert_eq!(served.response.status, 404);
    assert!(storage.match_url(CACHE, STYLE).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_miss_with_network_failure_is_an_error() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(ScriptedFetcher::new().fail(STYLE));
    let swr = StaleWhileRevalidate::new(storage, fetcher, CACHE);

    assert!(matches!(
      swr.handle(request()).await,
      Err(FetchError::Network { .. })
    ));
  }

  #[tokio::test]
  async fn test_cookies_are_not_replayed_from_cache() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    let fetcher = Arc::new(
      ScriptedFetcher::new().respond(
        STYLE,
        Response::new(200, "body").with_header("set-cookie", "sessionid=OLD; Path=/"),
      ),
    );
    let swr = StaleWhileRevalidate::new(storage.clone(), fetcher, CACHE);

    let first = swr.handle(request()).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert!(first.response.headers.iter().any(|(n, _)| n == "set-cookie"));

    let second = swr.handle(request()).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert!(second
      .response
      .headers
      .iter()
      .all(|(n, _)| !n.eq_ignore_ascii_case("set-cookie")));
    second.revalidation.unwrap().await.unwrap();
  }

  #[tokio::test]
  async fn test_failed_revalidation_keeps_cached_copy() {
    let storage: Arc<dyn CacheStorage> = Arc::new(MemoryStorage::new());
    storage.put(CACHE, STYLE, &Response::new(200, "old")).unwrap();
    let fetcher = Arc::new(ScriptedFetcher::new().fail(STYLE));
    let swr = StaleWhileRevalidate::new(storage.clone(), fetcher, CACHE);

    let served = swr.handle(request()).await.unwrap();
    served.revalidation.unwrap().await.unwrap();

    let cached = storage.match_url(CACHE, STYLE).unwrap().unwrap();
    assert_eq!(cached.response.body, Bytes::from("old"));
  }
}
