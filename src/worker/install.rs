use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use tracing::{debug, info};
use url::Url;

use crate::cache::{request_key, storable, CacheStorage};
use crate::fetch::{Fetcher, Request};

/// Precache `urls` into the named cache.
///
/// Every URL is fetched before anything is written. A network error or a
/// non-2xx status on any entry fails the whole install and leaves the store
/// untouched. Re-running over the same list overwrites the same keys.
///
/// Returns the number of entries written.
pub async fn handle_install(
  storage: &dyn CacheStorage,
  cache_name: &str,
  urls: &[Url],
  fetcher: &dyn Fetcher,
) -> Result<usize> {
  let fetches = urls.iter().map(|url| async move {
    let response = fetcher
      .fetch(&Request::get(url.clone()))
      .await
      .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;

    if !response.ok() {
      return Err(eyre!(
        "Failed to precache {}: status {}",
        url,
        response.status
      ));
    }

    debug!(url = %url, status = response.status, "fetched precache entry");
    Ok::<_, color_eyre::Report>((request_key(url), storable(&response)))
  });

  let entries = try_join_all(fetches).await?;

  storage
    .put_all(cache_name, &entries)
    .map_err(|e| eyre!("Failed to write precache entries: {}", e))?;

  info!(cache = cache_name, entries = entries.len(), "precache complete");
  Ok(entries.len())
}
