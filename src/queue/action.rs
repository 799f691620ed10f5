//! Queued write records and the page-facing payload they are built from.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::http::sanitize::{sanitize, strip_pairs};
use crate::http::types::{header_pairs, headers_from_pairs, CredentialsMode, Request};

pub type ActionId = i64;

/// Action submitted by the page through `QUEUE_ACTION` or `queue_action`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPayload {
  /// Absolute URL, or a path resolved against the configured origin.
  pub url: String,
  #[serde(default = "default_method")]
  pub method: String,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

fn default_method() -> String {
  "POST".to_string()
}

/// A sanitized action that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAction {
  pub url: String,
  pub method: String,
  pub body: Vec<u8>,
  pub headers: Vec<(String, String)>,
}

impl NewAction {
  /// Build from an intercepted request, dropping credential headers.
  pub fn from_request(request: &Request) -> Self {
    let clean = sanitize(request);
    Self {
      url: clean.url.to_string(),
      method: clean.method.to_string(),
      body: clean.body.unwrap_or_default(),
      headers: header_pairs(&clean.headers),
    }
  }

  pub fn from_payload(payload: ActionPayload, origin: &Url) -> Result<Self> {
    let url = origin.join(&payload.url)?;
    if url.origin() != origin.origin() {
      return Err(Error::InvalidRequest(format!(
        "{} is not on {} and cannot be queued",
        url,
        origin.origin().ascii_serialization()
      )));
    }
    let method = Method::from_str(&payload.method.to_uppercase())
      .map_err(|e| Error::InvalidRequest(format!("bad method {}: {}", payload.method, e)))?;
    if method == Method::GET || method == Method::HEAD {
      return Err(Error::InvalidRequest(format!(
        "{} is not a write and cannot be queued",
        method
      )));
    }
    let headers: Vec<(String, String)> = payload.headers.into_iter().collect();
    // Validate before the pairs reach storage.
    headers_from_pairs(&headers)?;

    Ok(Self {
      url: url.to_string(),
      method: method.to_string(),
      body: payload.body.map(String::into_bytes).unwrap_or_default(),
      headers: strip_pairs(&headers),
    })
  }
}

/// A durably stored write awaiting replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedAction {
  pub id: ActionId,
  pub url: String,
  pub method: String,
  pub body: Vec<u8>,
  pub headers: Vec<(String, String)>,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedAction {
  /// Rebuild the outbound request. It carries no credentials; those are
  /// reattached just before sending.
  pub fn to_request(&self) -> Result<Request> {
    let method = Method::from_str(&self.method)
      .map_err(|e| Error::InvalidRequest(format!("bad method {}: {}", self.method, e)))?;
    let url = Url::parse(&self.url)?;
    Ok(Request {
      method,
      url,
      headers: headers_from_pairs(&self.headers)?,
      body: if self.body.is_empty() {
        None
      } else {
        Some(self.body.clone())
      },
      credentials: CredentialsMode::Omit,
    })
  }

  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    now - self.enqueued_at
  }
}
