//! Replay of queued writes when connectivity returns or a flush is requested.
//!
//! A pass drains the queue oldest-first and stops at the first failure that
//! may succeed later, so ordering is never violated. Halted passes are
//! retried after a fixed interval; auth failures wait for a new token.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::http::sanitize::sanitize;
use crate::http::{CredentialStore, Network};
use crate::queue::{ActionId, QueueStore, QueuedAction};

/// What woke the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
  ConnectivityRestored,
  Flush,
}

/// A queued write the server refused as an application error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
  pub id: ActionId,
  pub url: String,
  pub reason: String,
}

/// Why a pass stopped early.
#[derive(Debug)]
pub struct Halt {
  pub id: ActionId,
  pub error: Error,
}

impl Halt {
  /// Auth failures wait for a new token instead of a timer.
  pub fn needs_token(&self) -> bool {
    matches!(self.error, Error::ReplayAuthFailure { .. })
  }
}

#[derive(Debug, Default)]
pub struct SyncReport {
  pub replayed: Vec<ActionId>,
  pub rejected: Vec<Rejected>,
  pub expired: Vec<QueuedAction>,
  pub halted: Option<Halt>,
  pub remaining: usize,
}

impl SyncReport {
  pub fn is_complete(&self) -> bool {
    self.halted.is_none()
  }

  fn should_retry(&self) -> bool {
    self.halted.as_ref().is_some_and(|h| !h.needs_token())
  }
}

/// Statuses that mean "try again later" rather than "this write is wrong".
fn is_transient(status: u16) -> bool {
  status == 408 || status == 429 || status >= 500
}

/// Drives queue replay.
pub struct SyncTrigger<Q: QueueStore> {
  queue: Arc<Q>,
  network: Arc<dyn Network>,
  credentials: CredentialStore,
  /// Credentials are only ever reattached for this origin.
  origin: Url,
  max_age: Option<chrono::Duration>,
  retry_interval: Duration,
}

impl<Q: QueueStore> SyncTrigger<Q> {
  pub fn new(
    queue: Arc<Q>,
    network: Arc<dyn Network>,
    credentials: CredentialStore,
    origin: Url,
  ) -> Self {
    Self {
      queue,
      network,
      credentials,
      origin,
      max_age: None,
      retry_interval: Duration::from_secs(30),
    }
  }

  /// Drop records older than `max_age` before replaying.
  pub fn with_max_age(mut self, max_age: Option<chrono::Duration>) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn with_retry_interval(mut self, interval: Duration) -> Self {
    self.retry_interval = interval;
    self
  }

  /// Run one ordered drain-and-replay pass.
  pub async fn run_pass(&self) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    if let Some(max_age) = self.max_age {
      report.expired = self.queue.purge_expired(Utc::now() - max_age)?;
      for action in &report.expired {
        warn!(id = action.id, url = %action.url, enqueued_at = %action.enqueued_at, "queued action expired unreplayed");
      }
    }

    for item in self.queue.drain()? {
      let action = item?;
      let request = match action.to_request() {
        Ok(request) => request,
        Err(e) => {
          warn!(id = action.id, error = %e, "dropping unreadable queued action");
          self.queue.remove(action.id)?;
          report.rejected.push(Rejected {
            id: action.id,
            url: action.url.clone(),
            reason: e.to_string(),
          });
          continue;
        }
      };

      if request.url.origin() != self.origin.origin() {
        warn!(id = action.id, url = %action.url, "dropping queued action for a foreign origin");
        self.queue.remove(action.id)?;
        report.rejected.push(Rejected {
          id: action.id,
          url: action.url.clone(),
          reason: "not on the configured origin".to_string(),
        });
        continue;
      }

      let outbound = self.credentials.reattach(&sanitize(&request));
      match self.network.fetch(&outbound).await {
        Ok(response) if response.status < 400 => {
          self.queue.remove(action.id)?;
          info!(id = action.id, status = response.status, url = %action.url, "replayed queued action");
          report.replayed.push(action.id);
        }
        Ok(response) if response.status == 401 || response.status == 403 => {
          warn!(id = action.id, status = response.status, "replay needs re-authentication");
          report.halted = Some(Halt {
            id: action.id,
            error: Error::ReplayAuthFailure {
              id: action.id,
              status: response.status,
            },
          });
          break;
        }
        Ok(response) if is_transient(response.status) => {
          debug!(id = action.id, status = response.status, "server busy, halting pass");
          report.halted = Some(Halt {
            id: action.id,
            error: Error::HttpApplication {
              status: response.status,
              url: action.url.clone(),
            },
          });
          break;
        }
        Ok(response) => {
          warn!(id = action.id, status = response.status, url = %action.url, "server rejected queued action");
          self.queue.remove(action.id)?;
          report.rejected.push(Rejected {
            id: action.id,
            url: action.url.clone(),
            reason: format!("status {}: {}", response.status, response.text()),
          });
        }
        Err(e) => {
          debug!(id = action.id, error = %e, "replay failed, halting pass");
          report.halted = Some(Halt { id: action.id, error: e });
          break;
        }
      }
    }

    report.remaining = self.queue.len()?;
    Ok(report)
  }

  /// Serve signals until the sender side closes. Reports of every pass are
  /// sent on `reports`.
  pub async fn run(
    self,
    mut signals: mpsc::UnboundedReceiver<SyncSignal>,
    reports: mpsc::UnboundedSender<SyncReport>,
  ) {
    let mut retry_at: Option<Instant> = None;

    loop {
      let woke_by = match retry_at {
        Some(at) => tokio::select! {
          signal = signals.recv() => match signal {
            Some(signal) => format!("{:?}", signal),
            None => break,
          },
          _ = tokio::time::sleep_until(at) => "retry".to_string(),
        },
        None => match signals.recv().await {
          Some(signal) => format!("{:?}", signal),
          None => break,
        },
      };
      // Signals queued up while idle fold into this pass.
      while signals.try_recv().is_ok() {}

      debug!(trigger = %woke_by, "starting replay pass");
      match self.run_pass().await {
        Ok(report) => {
          retry_at = report
            .should_retry()
            .then(|| Instant::now() + self.retry_interval);
          if reports.send(report).is_err() {
            break;
          }
        }
        Err(e) => {
          warn!(error = %e, "replay pass failed");
          retry_at = Some(Instant::now() + self.retry_interval);
        }
      }
    }
  }
}
