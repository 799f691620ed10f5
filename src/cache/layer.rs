//! Cache manager: generation-named caches, strategies, and the storage policy.

use chrono::{Duration, Utc};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedResponse, Strategy};
use crate::error::{Error, Result};
use crate::http::sanitize::carries_credentials;
use crate::http::types::{header_pairs, Request, Response};
use crate::http::Network;

/// Name of the app-shell cache for a generation.
pub fn static_cache(generation: &str) -> String {
  format!("static-{}", generation)
}

/// Name of the API read side cache for a generation.
pub fn api_cache(generation: &str) -> String {
  format!("api-{}", generation)
}

/// Whether a response to `request` may be persisted.
///
/// Credentialed requests and user-specific responses are never stored.
pub fn is_storable(request: &Request, response: &Response) -> bool {
  if request.method != reqwest::Method::GET || carries_credentials(request) {
    return false;
  }
  if !response.is_success() || response.headers.contains_key(reqwest::header::SET_COOKIE) {
    return false;
  }
  let private = response
    .headers
    .get_all(reqwest::header::CACHE_CONTROL)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|d| d.trim().to_ascii_lowercase())
    .any(|d| d == "private" || d == "no-store");
  !private
}

/// Orchestrates cache lookups, network fetches and background refreshes.
///
/// All cache writes go through [`CacheManager::put`], which applies
/// [`is_storable`].
pub struct CacheManager<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  /// Entries older than this are not served as an offline fallback
  max_fallback_age: Option<Duration>,
  revalidations: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage + 'static> CacheManager<S> {
  /// Create a new cache manager with the given storage backend.
  pub fn new(storage: S, network: Arc<dyn Network>) -> Self {
    Self {
      storage: Arc::new(storage),
      network,
      max_fallback_age: None,
      revalidations: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  /// Limit how old a NetworkFirst fallback may be.
  pub fn with_max_fallback_age(mut self, age: Option<Duration>) -> Self {
    self.max_fallback_age = age;
    self
  }

  fn too_old(&self, entry: &CachedResponse) -> bool {
    match self.max_fallback_age {
      Some(max) => Utc::now() - entry.cached_at > max,
      None => false,
    }
  }

  /// Fetch every URL, then store them all under the generation's static
  /// cache in one transaction. Any failure stores nothing.
  pub async fn precache(&self, generation: &str, urls: &[Url]) -> Result<usize> {
    let fetches = urls.iter().map(|url| {
      let network = Arc::clone(&self.network);
      let request = Request::get(url.clone());
      async move {
        let response = network
          .fetch(&request)
          .await
          .map_err(|e| Error::PrecacheFailure {
            url: url.to_string(),
            reason: e.to_string(),
          })?;
        if !response.is_success() {
          return Err(Error::PrecacheFailure {
            url: url.to_string(),
            reason: format!("status {}", response.status),
          });
        }
        if !is_storable(&request, &response) {
          return Err(Error::PrecacheFailure {
            url: url.to_string(),
            reason: "response is marked private or sets cookies".into(),
          });
        }
        Ok((request.cache_key(), to_entry(&request, &response)))
      }
    });

    let entries = try_join_all(fetches).await?;
    let name = static_cache(generation);
    self.storage.put_all(&name, &entries)?;
    info!(cache = %name, count = entries.len(), "precache complete");
    Ok(entries.len())
  }

  /// Delete every cache that does not belong to `generation`, and make sure
  /// the generation's own caches exist. Returns the deleted names.
  pub fn activate(&self, generation: &str) -> Result<Vec<String>> {
    let keep = [static_cache(generation), api_cache(generation)];
    let mut deleted = Vec::new();
    for name in self.storage.cache_names()? {
      if !keep.contains(&name) {
        self.storage.delete_cache(&name)?;
        info!(cache = %name, "deleted cache from previous generation");
        deleted.push(name);
      }
    }
    for name in &keep {
      self.storage.open_cache(name)?;
    }
    Ok(deleted)
  }

  /// Store `response` for `request` if policy allows. Returns whether it
  /// was stored.
  pub fn put(&self, cache_name: &str, request: &Request, response: &Response) -> Result<bool> {
    if !is_storable(request, response) {
      debug!(url = %request.url, status = response.status, "response not cacheable");
      return Ok(false);
    }
    self
      .storage
      .put(cache_name, &request.cache_key(), &to_entry(request, response))?;
    Ok(true)
  }

  /// Cached entry for `request`, if any.
  pub fn match_request(&self, cache_name: &str, request: &Request) -> Result<Option<CachedResponse>> {
    self.storage.get(cache_name, &request.cache_key())
  }

  /// Serve `request` from `cache_name` and/or the network according to
  /// `strategy`.
  pub async fn lookup_or_fetch(
    &self,
    request: &Request,
    strategy: Strategy,
    cache_name: &str,
  ) -> Result<CacheResult<Response>> {
    match strategy {
      Strategy::NetworkOnly => {
        let response = self.network.fetch(request).await?;
        Ok(CacheResult::from_network(response))
      }

      Strategy::CacheFirst => {
        if let Some(cached) = self.match_request(cache_name, request)? {
          return Ok(CacheResult::from_cache(cached.to_response()?, cached.cached_at));
        }
        self.fetch_and_store(request, cache_name).await
      }

      Strategy::StaleWhileRevalidate => {
        if let Some(cached) = self.match_request(cache_name, request)? {
          self.revalidate(request.clone(), cache_name.to_string()).await;
          return Ok(CacheResult::from_cache(cached.to_response()?, cached.cached_at));
        }
        self.fetch_and_store(request, cache_name).await
      }

      Strategy::NetworkFirst => match self.network.fetch(request).await {
        Ok(response) => {
          self.store_best_effort(cache_name, request, &response);
          Ok(CacheResult::from_network(response))
        }
        Err(e) if e.is_network_unavailable() => {
          match self.match_request(cache_name, request)? {
            Some(cached) if !self.too_old(&cached) => {
              debug!(url = %request.url, "network unavailable, serving cached copy");
              Ok(CacheResult::offline(cached.to_response()?, cached.cached_at))
            }
            _ => Err(e),
          }
        }
        Err(e) => Err(e),
      },
    }
  }

  async fn fetch_and_store(
    &self,
    request: &Request,
    cache_name: &str,
  ) -> Result<CacheResult<Response>> {
    let response = self.network.fetch(request).await?;
    self.store_best_effort(cache_name, request, &response);
    Ok(CacheResult::from_network(response))
  }

  /// A failed cache write never costs the caller a good network response.
  fn store_best_effort(&self, cache_name: &str, request: &Request, response: &Response) {
    if let Err(e) = self.put(cache_name, request, response) {
      warn!(url = %request.url, cache = cache_name, error = %e, "failed to cache response");
    }
  }

  /// Refresh the entry in the background.
  async fn revalidate(&self, request: Request, cache_name: String) {
    let manager = self.clone();
    let mut set = self.revalidations.lock().await;
    // Reap finished refreshes so the set only holds running ones.
    while set.try_join_next().is_some() {}
    set.spawn(async move {
      match manager.network.fetch(&request).await {
        Ok(response) => manager.store_best_effort(&cache_name, &request, &response),
        Err(e) => debug!(url = %request.url, error = %e, "revalidation skipped"),
      }
    });
  }

  /// Wait for background refreshes started so far. Lookups are not blocked
  /// while waiting.
  pub async fn settle(&self) {
    let mut pending = std::mem::take(&mut *self.revalidations.lock().await);
    while pending.join_next().await.is_some() {}
  }

  pub fn cache_names(&self) -> Result<Vec<String>> {
    self.storage.cache_names()
  }

  pub fn entries(&self, cache_name: &str) -> Result<Vec<CachedResponse>> {
    self.storage.entries(cache_name)
  }

  /// Whether any cache holds an entry for `url`.
  pub fn contains_url(&self, url: &Url) -> Result<bool> {
    let request = Request::get(url.clone());
    for name in self.storage.cache_names()? {
      if self.match_request(&name, &request)?.is_some() {
        return Ok(true);
      }
    }
    Ok(false)
  }
}

fn to_entry(request: &Request, response: &Response) -> CachedResponse {
  CachedResponse {
    url: request.normalized_url().to_string(),
    method: request.method.to_string(),
    status: response.status,
    headers: header_pairs(&response.headers),
    body: response.body.clone(),
    cached_at: Utc::now(),
  }
}

impl<S: CacheStorage> Clone for CacheManager<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      max_fallback_age: self.max_fallback_age,
      revalidations: Arc::clone(&self.revalidations),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::db::Database;
  use crate::testing::MockNetwork;

  const APP: &str = "https://erp.test/static/app.js";

  fn setup() -> (Arc<MockNetwork>, CacheManager<SqliteStorage>) {
    let network = MockNetwork::new();
    let storage = SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()));
    let manager = CacheManager::new(storage, network.clone());
    (network, manager)
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  /// Reads work, every write fails as if the disk were full.
  struct FullDisk(SqliteStorage);

  impl CacheStorage for FullDisk {
    fn open_cache(&self, name: &str) -> Result<()> {
      self.0.open_cache(name)
    }
    fn cache_names(&self) -> Result<Vec<String>> {
      self.0.cache_names()
    }
    fn delete_cache(&self, name: &str) -> Result<bool> {
      self.0.delete_cache(name)
    }
    fn get(&self, name: &str, key: &str) -> Result<Option<CachedResponse>> {
      self.0.get(name, key)
    }
    fn put(&self, _name: &str, _key: &str, _entry: &CachedResponse) -> Result<()> {
      Err(Error::StorageUnavailable("disk full".into()))
    }
    fn put_all(&self, _name: &str, _entries: &[(String, CachedResponse)]) -> Result<()> {
      Err(Error::StorageUnavailable("disk full".into()))
    }
    fn entries(&self, name: &str) -> Result<Vec<CachedResponse>> {
      self.0.entries(name)
    }
  }

  #[tokio::test]
  async fn test_precache_stores_all_urls() {
    let (network, manager) = setup();
    network.respond(APP, Response::new(200, "js"));
    network.respond("https://erp.test/", Response::new(200, "<html>"));

    let urls = vec![Url::parse(APP).unwrap(), Url::parse("https://erp.test/").unwrap()];
    assert_eq!(manager.precache("v1", &urls).await.unwrap(), 2);
    assert_eq!(manager.entries("static-v1").unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_precache_is_all_or_nothing() {
    let (network, manager) = setup();
    network.respond(APP, Response::new(200, "js"));
    // Second URL has no route and answers 404.
    let urls = vec![
      Url::parse(APP).unwrap(),
      Url::parse("https://erp.test/missing.css").unwrap(),
    ];

    let err = manager.precache("v1", &urls).await.unwrap_err();
    assert!(matches!(err, Error::PrecacheFailure { ref url, .. } if url.ends_with("missing.css")));
    assert!(manager.cache_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_removes_prior_generations() {
    let (network, manager) = setup();
    network.respond(APP, Response::new(200, "v1"));
    manager.precache("v1", &[Url::parse(APP).unwrap()]).await.unwrap();
    manager.activate("v1").unwrap();

    network.respond(APP, Response::new(200, "v2"));
    manager.precache("v2", &[Url::parse(APP).unwrap()]).await.unwrap();
    let mut deleted = manager.activate("v2").unwrap();
    deleted.sort();

    assert_eq!(deleted, vec!["api-v1".to_string(), "static-v1".to_string()]);
    assert_eq!(
      manager.cache_names().unwrap(),
      vec!["api-v2".to_string(), "static-v2".to_string()]
    );
    let cached = manager.match_request("static-v2", &get(APP)).unwrap().unwrap();
    assert_eq!(cached.body, b"v2".to_vec());
  }

  #[tokio::test]
  async fn test_cache_first_hits_network_once() {
    let (network, manager) = setup();
    network.respond(APP, Response::new(200, "js"));

    let first = manager
      .lookup_or_fetch(&get(APP), Strategy::CacheFirst, "static-v1")
      .await
      .unwrap();
    let second = manager
      .lookup_or_fetch(&get(APP), Strategy::CacheFirst, "static-v1")
      .await
      .unwrap();

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(network.hits(APP), 1);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cached_then_refreshes() {
    let (network, manager) = setup();
    network.respond(APP, Response::new(200, "old"));
    manager
      .lookup_or_fetch(&get(APP), Strategy::StaleWhileRevalidate, "static-v1")
      .await
      .unwrap();

    network.respond(APP, Response::new(200, "new"));
    let served = manager
      .lookup_or_fetch(&get(APP), Strategy::StaleWhileRevalidate, "static-v1")
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Cache);
    assert_eq!(served.data.body, b"old".to_vec());

    manager.settle().await;
    let cached = manager.match_request("static-v1", &get(APP)).unwrap().unwrap();
    assert_eq!(cached.body, b"new".to_vec());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_offline_fails() {
    let (network, manager) = setup();
    network.set_online(false);
    let err = manager
      .lookup_or_fetch(&get(APP), Strategy::StaleWhileRevalidate, "static-v1")
      .await
      .unwrap_err();
    assert!(err.is_network_unavailable());
  }

  #[tokio::test]
  async fn test_network_first_falls_back_only_when_offline() {
    let (network, manager) = setup();
    let url = "https://erp.test/api/products";
    network.respond(url, Response::new(200, "[1]"));
    manager
      .lookup_or_fetch(&get(url), Strategy::NetworkFirst, "api-v1")
      .await
      .unwrap();

    // Server error is returned as-is, not masked by the cache.
    network.respond_once(url, Response::new(500, "boom"));
    let served = manager
      .lookup_or_fetch(&get(url), Strategy::NetworkFirst, "api-v1")
      .await
      .unwrap();
    assert_eq!(served.data.status, 500);

    network.set_online(false);
    let served = manager
      .lookup_or_fetch(&get(url), Strategy::NetworkFirst, "api-v1")
      .await
      .unwrap();
    assert_eq!(served.source, CacheSource::Offline);
    assert_eq!(served.data.body, b"[1]".to_vec());
  }

  #[tokio::test]
  async fn test_network_first_respects_max_fallback_age() {
    let (network, manager) = setup();
    let manager = manager.with_max_fallback_age(Some(Duration::zero()));
    let url = "https://erp.test/api/products";
    network.respond(url, Response::new(200, "[1]"));
    manager
      .lookup_or_fetch(&get(url), Strategy::NetworkFirst, "api-v1")
      .await
      .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    network.set_online(false);
    let err = manager
      .lookup_or_fetch(&get(url), Strategy::NetworkFirst, "api-v1")
      .await
      .unwrap_err();
    assert!(err.is_network_unavailable());
  }

  #[tokio::test]
  async fn test_network_only_never_touches_cache() {
    let (network, manager) = setup();
    network.respond(APP, Response::new(200, "js"));
    manager
      .lookup_or_fetch(&get(APP), Strategy::NetworkOnly, "static-v1")
      .await
      .unwrap();
    assert!(!manager.contains_url(&Url::parse(APP).unwrap()).unwrap());
  }

  #[tokio::test]
  async fn test_put_refuses_credentialed_and_private_responses() {
    let (_network, manager) = setup();
    let authed = get(APP).with_header("Authorization", "Bearer t").unwrap();
    assert!(!manager.put("static-v1", &authed, &Response::new(200, "x")).unwrap());

    let private = Response::new(200, "x").with_header("cache-control", "max-age=60, Private");
    assert!(!manager.put("static-v1", &get(APP), &private).unwrap());

    let cookie = Response::new(200, "x").with_header("set-cookie", "sid=1");
    assert!(!manager.put("static-v1", &get(APP), &cookie).unwrap());

    assert!(!manager.put("static-v1", &get(APP), &Response::new(404, "x")).unwrap());
    assert!(manager.put("static-v1", &get(APP), &Response::new(200, "x")).unwrap());
  }

  #[tokio::test]
  async fn test_failed_cache_write_still_returns_network_response() {
    let network = MockNetwork::new();
    let storage = FullDisk(SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap())));
    let manager = CacheManager::new(storage, network.clone());
    network.respond(APP, Response::new(200, "js"));
    network.respond("https://erp.test/api/catalog", Response::new(200, "[]"));

    let read = manager
      .lookup_or_fetch(&get("https://erp.test/api/catalog"), Strategy::NetworkFirst, "api-v1")
      .await
      .unwrap();
    assert_eq!(read.source, CacheSource::Network);
    assert_eq!(read.data.text(), "[]");

    for strategy in [Strategy::StaleWhileRevalidate, Strategy::CacheFirst] {
      let miss = manager
        .lookup_or_fetch(&get(APP), strategy, "static-v1")
        .await
        .unwrap();
      assert_eq!(miss.source, CacheSource::Network);
      assert_eq!(miss.data.text(), "js");
    }
    assert!(!manager.contains_url(&Url::parse(APP).unwrap()).unwrap());
  }

  #[tokio::test]
  async fn test_finished_revalidations_are_reaped() {
    let (network, manager) = setup();
    network.respond(APP, Response::new(200, "js"));
    manager.put("static-v1", &get(APP), &Response::new(200, "old")).unwrap();

    manager
      .lookup_or_fetch(&get(APP), Strategy::StaleWhileRevalidate, "static-v1")
      .await
      .unwrap();
    while network.hits(APP) < 1 {
      tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    manager
      .lookup_or_fetch(&get(APP), Strategy::StaleWhileRevalidate, "static-v1")
      .await
      .unwrap();
    assert_eq!(manager.revalidations.lock().await.len(), 1);

    manager.settle().await;
    assert!(manager.revalidations.lock().await.is_empty());
    // Lookups still work while and after settling.
    let served = manager
      .lookup_or_fetch(&get(APP), Strategy::StaleWhileRevalidate, "static-v1")
      .await
      .unwrap();
    assert_eq!(served.data.text(), "js");
    manager.settle().await;
  }
}
