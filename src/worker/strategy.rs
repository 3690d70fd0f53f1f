//! Response strategies applied to routed requests.

use color_eyre::Result;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::cache::{CachedEntry, GenerationCache};
use crate::net::{cache_key, Network, Request, Response, ResponseSource};

use super::background::BackgroundTasks;
use super::routing::Strategy;

/// Everything a strategy needs from its worker.
pub(super) struct Context<'a> {
  pub cache: &'a GenerationCache,
  pub network: &'a Arc<dyn Network>,
  pub background: &'a BackgroundTasks,
  pub origin: &'a Url,
}

impl Context<'_> {
  /// Store a snapshot of `response` without waiting for the write.
  fn store_detached(&self, key: String, response: &Response) {
    let entry = CachedEntry::from_response(key, response);
    let cache = self.cache.clone();
    self
      .background
      .spawn(format!("cache write {}", entry.url), async move {
        store_if_current(&cache, &entry)
      });
  }
}

/// Detached writes never recreate a generation that activation removed.
fn store_if_current(cache: &GenerationCache, entry: &CachedEntry) -> Result<()> {
  if !cache.put_existing(entry)? {
    debug!(url = %entry.url, generation = %cache.name(), "generation gone, dropping cache write");
  }
  Ok(())
}

/// Answer `request` with `strategy`. `Passthrough` yields `None`.
pub(super) async fn respond(
  strategy: &Strategy,
  request: &Request,
  cx: &Context<'_>,
) -> Result<Option<Response>> {
  let response = match strategy {
    Strategy::Passthrough => return Ok(None),
    Strategy::NetworkFirst { fallback } => network_first(request, fallback.as_deref(), cx).await?,
    Strategy::StaleWhileRevalidate => stale_while_revalidate(request, cx).await?,
    Strategy::CacheFirst => cache_first(request, cx).await?,
  };
  Ok(Some(response))
}

async fn network_first(
  request: &Request,
  fallback: Option<&str>,
  cx: &Context<'_>,
) -> Result<Response> {
  let key = match fallback {
    Some(path) => cache_key(&cx.origin.join(path)?),
    None => request.cache_key(),
  };

  match cx.network.fetch(request).await {
    Ok(response) => {
      cx.store_detached(key, &response);
      Ok(response)
    }
    Err(err) => {
      debug!(url = %request.url, error = %err, "network failed, trying cache");
      match cx.cache.lookup(&key)? {
        Some(entry) => Ok(entry.into_response(ResponseSource::Offline)),
        None => Err(err.wrap_err(format!("No cached fallback for {}", key))),
      }
    }
  }
}

async fn stale_while_revalidate(request: &Request, cx: &Context<'_>) -> Result<Response> {
  let key = request.cache_key();

  let Some(cached) = cx.cache.lookup(&key)? else {
    let response = cx.network.fetch(request).await?;
    cx.store_detached(key, &response);
    return Ok(response);
  };

  let cache = cx.cache.clone();
  let network = Arc::clone(cx.network);
  let request = request.clone();
  let previous = cached.digest();
  cx.background.spawn(format!("revalidate {}", key), async move {
    // On failure the stale entry stays in place
    let response = network.fetch(&request).await?;
    let fresh = CachedEntry::from_response(key, &response);
    if fresh.digest() != previous {
      debug!(url = %fresh.url, "revalidated entry changed");
    }
    store_if_current(&cache, &fresh)
  });

  Ok(cached.into_response(ResponseSource::Cache))
}

async fn cache_first(request: &Request, cx: &Context<'_>) -> Result<Response> {
  let key = request.cache_key();

  if let Some(cached) = cx.cache.lookup(&key)? {
    return Ok(cached.into_response(ResponseSource::Cache));
  }

  let response = cx.network.fetch(request).await?;
  cx.store_detached(key, &response);
  Ok(response)
}
