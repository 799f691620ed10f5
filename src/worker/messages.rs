//! Control messages sent from the page to the worker.

use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::queue::ActionPayload;

/// A `type`-tagged JSON control message.
///
/// ```json
/// {"type": "SKIP_WAITING"}
/// {"type": "SET_TOKEN", "token": "eyJ..."}
/// {"type": "QUEUE_ACTION", "payload": {"url": "/api/orders", "method": "POST", "body": "{}"}}
/// {"type": "FLUSH"}
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  /// Activate an installed worker without waiting
  SkipWaiting,
  /// Replace the in-memory credential; `null` clears it
  SetToken {
    #[serde(default)]
    token: Option<String>,
  },
  /// Enqueue a write directly, bypassing the fetch path
  QueueAction { payload: ActionPayload },
  /// Run a replay pass now
  Flush,
}

impl ControlMessage {
  pub fn parse(line: &str) -> Result<Self> {
    serde_json::from_str(line)
      .map_err(|e| Error::InvalidRequest(format!("bad control message: {}", e)))
  }
}

impl fmt::Debug for ControlMessage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::SkipWaiting => f.write_str("SkipWaiting"),
      Self::SetToken { token } => f
        .debug_struct("SetToken")
        .field("present", &token.is_some())
        .finish(),
      Self::QueueAction { payload } => f
        .debug_struct("QueueAction")
        .field("method", &payload.method)
        .field("url", &payload.url)
        .finish(),
      Self::Flush => f.write_str("Flush"),
    }
  }
}
