//! Install-time precache manifest.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use url::Url;

use crate::cache::CachedEntry;
use crate::net::{Network, Request};

/// Ordered, de-duplicated list of URLs fetched at install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheManifest {
  urls: Vec<Url>,
}

impl PrecacheManifest {
  /// Resolve `paths` against `origin`, dropping repeats.
  pub fn resolve(origin: &Url, paths: &[String]) -> Result<Self> {
    let mut urls: Vec<Url> = Vec::with_capacity(paths.len());
    for path in paths {
      let url = origin
        .join(path)
        .map_err(|e| eyre!("Invalid precache path '{}': {}", path, e))?;
      if !urls.contains(&url) {
        urls.push(url);
      }
    }
    Ok(Self { urls })
  }

  /// Fetch every URL concurrently.
  ///
  /// Fails on the first network error or non-2xx response, so callers never
  /// see a partial set.
  pub async fn fetch_all(&self, network: &dyn Network) -> Result<Vec<CachedEntry>> {
    let fetches = self.urls.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = network
        .fetch(&request)
        .await
        .map_err(|e| e.wrap_err(format!("Failed to precache {}", url)))?;

      if !response.is_ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          url,
          response.status
        ));
      }

      Ok::<_, color_eyre::Report>(CachedEntry::from_response(request.cache_key(), &response))
    });

    try_join_all(fetches).await
  }
}
