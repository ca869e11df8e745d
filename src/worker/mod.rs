//! The offline navigation worker.
//!
//! A worker owns one configuration snapshot and handles three events:
//! - install: precache a fixed list of URLs, all-or-nothing
//! - fetch: navigations go to the network and fall back to the cached
//!   offline page; routed subresources are served stale-while-revalidate
//! - message: `SKIP_WAITING` asks the registration to activate a waiting
//!   version immediately
//!
//! Lifecycle (installing, waiting, active versions) lives in [`Registration`].

mod install;
mod lifecycle;
mod message;
mod router;

pub use install::handle_install;
pub use lifecycle::Registration;
pub use message::{handle_message, ControlAction};
pub use router::Router;

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{request_key, CacheStorage, Served, StaleWhileRevalidate};
use crate::config::{CacheConfig, Config};
use crate::fetch::{FetchError, Fetcher, Request, Response};

/// An in-flight navigation preload started by the host.
///
/// Resolves to `None` when the host decided not to preload after all.
pub type Preload = BoxFuture<'static, Result<Option<Response>, FetchError>>;

/// Everything a worker version needs to know, passed in explicitly.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
  /// Origin the worker controls; precache paths resolve against it
  pub origin: Url,
  pub cache_name: String,
  pub precache: Vec<String>,
  pub offline_page: String,
  /// Regex patterns for stale-while-revalidate routing
  pub routes: Vec<String>,
  pub navigation_preload: bool,
}

impl WorkerConfig {
  /// Default cache settings for `origin`.
  #[cfg(test)]
  pub fn new(origin: Url) -> Self {
    Self::with_cache(origin, &CacheConfig::default())
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self::with_cache(config.upstream_url()?, &config.cache))
  }

  fn with_cache(origin: Url, cache: &CacheConfig) -> Self {
    Self {
      origin,
      cache_name: cache.name.clone(),
      precache: cache.precache.clone(),
      offline_page: cache.offline_page.clone(),
      routes: cache.routes.clone(),
      navigation_preload: cache.navigation_preload,
    }
  }

  /// Resolve a configured path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path '{}': {}", path, e))
  }
}

/// One intercepted request, plus the preload the host may have started.
pub struct FetchEvent {
  pub request: Request,
  pub preload: Option<Preload>,
}

impl FetchEvent {
  pub fn new(request: Request) -> Self {
    Self {
      request,
      preload: None,
    }
  }

  pub fn with_preload(mut self, preload: Preload) -> Self {
    self.preload = Some(preload);
    self
  }
}

/// A worker version: configuration plus the store and network it talks to.
pub struct OfflineWorker {
  config: WorkerConfig,
  precache: Vec<Url>,
  offline_url: Url,
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn Fetcher>,
  router: Router,
  swr: StaleWhileRevalidate,
}

impl OfflineWorker {
  pub fn new(
    config: WorkerConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    let precache = config
      .precache
      .iter()
      .map(|path| config.resolve(path))
      .collect::<Result<Vec<_>>>()?;
    let offline_url = config.resolve(&config.offline_page)?;
    let router = Router::new(config.origin.clone(), &config.routes)?;
    let swr = StaleWhileRevalidate::new(
      Arc::clone(&storage),
      Arc::clone(&fetcher),
      config.cache_name.clone(),
    );

    Ok(Self {
      config,
      precache,
      offline_url,
      storage,
      fetcher,
      router,
      swr,
    })
  }

  pub fn from_config(
    config: &Config,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
  ) -> Result<Self> {
    Self::new(WorkerConfig::from_config(config)?, storage, fetcher)
  }

  pub fn config(&self) -> &WorkerConfig {
    &self.config
  }

  pub fn fetcher(&self) -> Arc<dyn Fetcher> {
    Arc::clone(&self.fetcher)
  }

  pub fn navigation_preload_enabled(&self) -> bool {
    self.config.navigation_preload
  }

  /// Precache this version's list into its cache.
  pub async fn install(&self) -> Result<usize> {
    handle_install(
      self.storage.as_ref(),
      &self.config.cache_name,
      &self.precache,
      self.fetcher.as_ref(),
    )
    .await
  }

  /// Handle one fetch event.
  ///
  /// `Ok(None)` means the worker has nothing to offer: a navigation failed
  /// and the offline page is not cached.
  pub async fn handle_fetch(&self, event: FetchEvent) -> Result<Option<Served>, FetchError> {
    let FetchEvent { request, preload } = event;

    if request.is_navigation() {
      return Ok(self.handle_navigation(request, preload).await);
    }

    if self.router.matches(&request) {
      return self.swr.handle(request).await.map(Some);
    }

    debug!(method = %request.method, url = %request.url, "no route, passing through");
    let response = self.fetcher.fetch(&request).await?;
    Ok(Some(Served::from_network(response)))
  }

  async fn handle_navigation(&self, request: Request, preload: Option<Preload>) -> Option<Served> {
    let outcome: Result<Served, FetchError> = async {
      if let Some(preload) = preload {
        if let Some(response) = preload.await? {
          return Ok(Served::from_preload(response));
        }
      }

      let response = self.fetcher.fetch(&request).await?;
      Ok(Served::from_network(response))
    }
    .await;

    match outcome {
      Ok(served) => Some(served),
      Err(e) => {
        warn!(url = %request.url, error = %e, "navigation failed, serving offline page");
        self.offline_fallback()
      }
    }
  }

  fn offline_fallback(&self) -> Option<Served> {
    let key = request_key(&self.offline_url);

    match self.storage.match_url(&self.config.cache_name, &key) {
      Ok(Some(cached)) => Some(Served::offline(cached.response, cached.cached_at)),
      Ok(None) => {
        warn!(url = %key, "offline page is not cached");
        None
      }
      Err(e) => {
        warn!(url = %key, error = %e, "offline page lookup failed");
        None
      }
    }
  }
}
