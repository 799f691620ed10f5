//! Error kinds surfaced by the relay core.
//!
//! The CLI edge converts these into `color_eyre` reports; library code keeps
//! them typed so the interceptor and sync trigger can branch on the kind.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
  /// The request never reached a server (DNS, connect, reset, timeout).
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  /// A reachable server answered with a 4xx/5xx status.
  #[error("server returned {status} for {url}")]
  HttpApplication { status: u16, url: String },

  /// The queue or cache store could not be opened or written.
  #[error("storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A queued write was replayed without a valid credential.
  #[error("replay of queued action {id} rejected with {status}; re-authentication required")]
  ReplayAuthFailure { id: i64, status: u16 },

  #[error("precache of {url} failed: {reason}")]
  PrecacheFailure { url: String, reason: String },

  #[error("installation did not finish within {0:?}")]
  InstallTimeout(Duration),

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// Operation requires an installed worker generation.
  #[error("worker generation {0} is not installed")]
  NotInstalled(String),
}

impl Error {
  pub fn is_network_unavailable(&self) -> bool {
    matches!(self, Error::NetworkUnavailable(_))
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self {
    Error::StorageUnavailable(e.to_string())
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Error::StorageUnavailable(format!("corrupt record: {}", e))
  }
}

impl From<url::ParseError> for Error {
  fn from(e: url::ParseError) -> Self {
    Error::InvalidRequest(e.to_string())
  }
}
