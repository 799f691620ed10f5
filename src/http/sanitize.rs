//! Removal of credential-bearing headers.
//!
//! Everything that lands in the queue or a cache passes through here first.

use reqwest::header::HeaderMap;

use super::types::{CredentialsMode, Request};

/// Header names that carry credentials, compared case-insensitively.
pub const CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie"];

pub fn is_credential_header(name: &str) -> bool {
  CREDENTIAL_HEADERS
    .iter()
    .any(|h| h.eq_ignore_ascii_case(name))
}

/// Whether the request carries any credential header.
pub fn carries_credentials(request: &Request) -> bool {
  request
    .headers
    .keys()
    .any(|name| is_credential_header(name.as_str()))
}

/// Return a copy of `request` without credential headers and with
/// credentials mode set to `Omit`. The input is left untouched.
pub fn sanitize(request: &Request) -> Request {
  Request {
    method: request.method.clone(),
    url: request.url.clone(),
    headers: strip_headers(&request.headers),
    body: request.body.clone(),
    credentials: CredentialsMode::Omit,
  }
}

pub fn strip_headers(headers: &HeaderMap) -> HeaderMap {
  let mut clean = HeaderMap::with_capacity(headers.len());
  for (name, value) in headers {
    if !is_credential_header(name.as_str()) {
      clean.append(name.clone(), value.clone());
    }
  }
  clean
}

/// Same as [`strip_headers`] for persisted name/value pairs.
pub fn strip_pairs(pairs: &[(String, String)]) -> Vec<(String, String)> {
  pairs
    .iter()
    .filter(|(name, _)| !is_credential_header(name))
    .cloned()
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  fn authed_request() -> Request {
    Request::new(
      reqwest::Method::POST,
      Url::parse("https://erp.test/api/orders").unwrap(),
    )
    .with_header("Authorization", "Bearer secret")
    .unwrap()
    .with_header("Cookie", "session=abc")
    .unwrap()
    .with_header("Content-Type", "application/json")
    .unwrap()
    .with_body(r#"{"qty":1}"#)
  }

  #[test]
  fn test_sanitize_strips_credentials() {
    let clean = sanitize(&authed_request());
    assert!(!carries_credentials(&clean));
    assert_eq!(clean.credentials, CredentialsMode::Omit);
    assert_eq!(
      clean.headers.get("content-type").unwrap(),
      "application/json"
    );
    assert_eq!(clean.body.as_deref(), Some(&br#"{"qty":1}"#[..]));
  }

  #[test]
  fn test_sanitize_does_not_mutate_input() {
    let original = authed_request();
    let _ = sanitize(&original);
    assert!(carries_credentials(&original));
    assert_eq!(original.credentials, CredentialsMode::SameOrigin);
  }

  #[test]
  fn test_is_credential_header_case_insensitive() {
    assert!(is_credential_header("AUTHORIZATION"));
    assert!(is_credential_header("cOoKiE"));
    assert!(!is_credential_header("x-authorization-hint"));
  }

  #[test]
  fn test_strip_pairs() {
    let pairs = vec![
      ("Authorization".to_string(), "Bearer t".to_string()),
      ("X-Request-Id".to_string(), "42".to_string()),
    ];
    let clean = strip_pairs(&pairs);
    assert_eq!(clean, vec![("X-Request-Id".to_string(), "42".to_string())]);
  }
}
