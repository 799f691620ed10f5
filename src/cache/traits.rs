//! Core types for the response caches.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::http::types::{headers_from_pairs, Response};

/// How a request is served relative to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Serve the cached entry if present, else fetch and store.
  CacheFirst,
  /// Serve the cached entry immediately and refresh it in the background.
  StaleWhileRevalidate,
  /// Go to the network; fall back to the cache only when it is unreachable.
  NetworkFirst,
  /// Never read or write the cache.
  NetworkOnly,
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub url: String,
  pub method: String,
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  pub fn to_response(&self) -> Result<Response> {
    Ok(Response {
      status: self.status,
      headers: headers_from_pairs(&self.headers)?,
      body: self.body.clone(),
    })
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache by strategy (a refresh may be running)
  Cache,
  /// Network unavailable, serving cached data
  Offline,
}
