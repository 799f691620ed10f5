//! Request and response values passed between the interceptor, caches and
//! the network.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Error, Result};

/// Whether ambient credentials (cookies, auth headers) travel with a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialsMode {
  Omit,
  #[default]
  SameOrigin,
  Include,
}

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub body: Option<Vec<u8>>,
  pub credentials: CredentialsMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      body: None,
      credentials: CredentialsMode::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Add a header, validating name and value.
  pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| Error::InvalidRequest(format!("bad header name {}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
      .map_err(|e| Error::InvalidRequest(format!("bad value for header {}: {}", name, e)))?;
    self.headers.append(name, value);
    Ok(self)
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// GET and HEAD never change server state.
  pub fn is_read(&self) -> bool {
    self.method == Method::GET || self.method == Method::HEAD
  }

  /// URL with the fragment removed, used for cache identity.
  pub fn normalized_url(&self) -> Url {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url
  }

  /// Stable, fixed-length cache key over method and normalized URL.
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method, self.normalized_url());
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response from the network or a cache.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
    if let Ok(value) = HeaderValue::from_str(value) {
      self.headers.append(HeaderName::from_static(name), value);
    }
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Turn a 4xx/5xx into `HttpApplication`, leaving other responses intact.
  pub fn error_for_status(self, url: &Url) -> Result<Self> {
    if self.status >= 400 {
      return Err(Error::HttpApplication {
        status: self.status,
        url: url.to_string(),
      });
    }
    Ok(self)
  }
}

/// Flatten headers into name/value pairs for persistence.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}

/// Rebuild a header map from persisted pairs.
pub fn headers_from_pairs(pairs: &[(String, String)]) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  for (name, value) in pairs {
    let name = HeaderName::from_bytes(name.as_bytes())
      .map_err(|e| Error::InvalidRequest(format!("bad header name {}: {}", name, e)))?;
    let value = HeaderValue::from_str(value)
      .map_err(|e| Error::InvalidRequest(format!("bad value for header {}: {}", name, e)))?;
    headers.append(name, value);
  }
  Ok(headers)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_ignores_fragment() {
    let a = Request::get(url("https://erp.test/app.js#v1"));
    let b = Request::get(url("https://erp.test/app.js"));
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_cache_key_depends_on_method() {
    let get = Request::get(url("https://erp.test/api/items"));
    let head = Request::new(Method::HEAD, url("https://erp.test/api/items"));
    assert_ne!(get.cache_key(), head.cache_key());
  }

  #[test]
  fn test_with_header_rejects_invalid_name() {
    let result = Request::get(url("https://erp.test/")).with_header("bad header", "x");
    assert!(matches!(result, Err(Error::InvalidRequest(_))));
  }

  #[test]
  fn test_error_for_status() {
    let target = url("https://erp.test/api/orders");
    assert!(Response::new(204, "").error_for_status(&target).is_ok());
    let err = Response::new(422, "nope")
      .error_for_status(&target)
      .unwrap_err();
    assert!(matches!(err, Error::HttpApplication { status: 422, .. }));
  }

  #[test]
  fn test_header_pairs_roundtrip_keeps_duplicates() {
    let mut headers = HeaderMap::new();
    headers.append("x-tag", HeaderValue::from_static("a"));
    headers.append("x-tag", HeaderValue::from_static("b"));
    let rebuilt = headers_from_pairs(&header_pairs(&headers)).unwrap();
    assert_eq!(rebuilt.get_all("x-tag").iter().count(), 2);
  }
}
