//! Volatile credential state and reattachment at replay time.

use std::fmt;
use std::sync::{Arc, RwLock};

use reqwest::header::{HeaderValue, AUTHORIZATION};
use tracing::warn;

use super::types::{CredentialsMode, Request};

/// Bearer token handed over by the authenticated page. Never serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialToken(String);

impl CredentialToken {
  /// Empty or whitespace-only tokens are treated as absent.
  pub fn new(token: impl Into<String>) -> Option<Self> {
    let token = token.into();
    if token.trim().is_empty() {
      None
    } else {
      Some(Self(token))
    }
  }

  fn header_value(&self) -> Option<HeaderValue> {
    let mut value = HeaderValue::from_str(&format!("Bearer {}", self.0)).ok()?;
    value.set_sensitive(true);
    Some(value)
  }
}

impl fmt::Debug for CredentialToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("CredentialToken(<redacted>)")
  }
}

/// In-memory holder for the current credential.
///
/// Written only by the control-message handler, read only by [`reattach`].
///
/// [`reattach`]: CredentialStore::reattach
#[derive(Clone, Default)]
pub struct CredentialStore {
  token: Arc<RwLock<Option<CredentialToken>>>,
}

impl CredentialStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace the held token. `None` or an empty string clears it.
  pub fn set(&self, token: Option<String>) {
    let token = token.and_then(CredentialToken::new);
    let mut guard = self.token.write().unwrap_or_else(|e| e.into_inner());
    *guard = token;
  }

  pub fn clear(&self) {
    self.set(None);
  }

  pub fn is_present(&self) -> bool {
    self
      .token
      .read()
      .map(|t| t.is_some())
      .unwrap_or_else(|e| e.into_inner().is_some())
  }

  /// Return a copy of `request` carrying `Authorization: Bearer <token>`, or
  /// an unchanged copy when no token is held.
  pub fn reattach(&self, request: &Request) -> Request {
    let token = self
      .token
      .read()
      .map(|t| t.clone())
      .unwrap_or_else(|e| e.into_inner().clone());

    let mut out = request.clone();
    let Some(token) = token else {
      return out;
    };

    match token.header_value() {
      Some(value) => {
        out.headers.insert(AUTHORIZATION, value);
        out.credentials = CredentialsMode::Include;
      }
      None => warn!("held credential is not a valid header value; replaying without it"),
    }
    out
  }
}

impl fmt::Debug for CredentialStore {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CredentialStore")
      .field("present", &self.is_present())
      .finish()
  }
}
