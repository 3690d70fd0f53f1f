//! In-process network double for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use url::Url;

use super::client::Network;
use super::types::{cache_key, Request, Response};

/// Serves canned responses keyed by URL and records every request it sees.
pub struct StubNetwork {
  origin: Url,
  responses: Mutex<HashMap<String, Response>>,
  online: AtomicBool,
  requests: Mutex<Vec<String>>,
}

impl StubNetwork {
  pub fn new(origin: &str) -> Self {
    Self {
      origin: Url::parse(origin).expect("valid test origin"),
      responses: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      requests: Mutex::new(Vec::new()),
    }
  }

  pub fn url(&self, path: &str) -> Url {
    self.origin.join(path).expect("valid test path")
  }

  /// Serve `body` with status 200 for `path`.
  pub fn serve(&self, path: &str, body: &str) {
    self.serve_response(path, Response::new(200, body));
  }

  pub fn serve_response(&self, path: &str, response: Response) {
    let key = cache_key(&self.url(path));
    self.responses.lock().unwrap().insert(key, response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Number of requests seen for `path`, including failed ones.
  pub fn hits(&self, path: &str) -> usize {
    let key = cache_key(&self.url(path));
    self
      .requests
      .lock()
      .unwrap()
      .iter()
      .filter(|k| **k == key)
      .count()
  }

  pub fn total_hits(&self) -> usize {
    self.requests.lock().unwrap().len()
  }
}

#[async_trait]
impl Network for StubNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let key = request.cache_key();
    self.requests.lock().unwrap().push(key.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("Network unavailable: {}", key));
    }

    Ok(
      self
        .responses
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
