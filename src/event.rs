use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::http::{Network, Request};
use crate::worker::ControlMessage;

/// Worker events
#[derive(Debug)]
pub enum Event {
  /// Control message read from stdin
  Message(ControlMessage),
  /// Connectivity probe succeeded after failing
  Online,
  /// Connectivity probe failed after succeeding
  Offline,
}

/// Turns probe results into edge events.
#[derive(Debug, Default)]
pub struct ConnectivityTracker {
  online: Option<bool>,
}

impl ConnectivityTracker {
  /// Record a probe result. Emits an event only when the state changes; the
  /// first observation emits `Online` but not `Offline`.
  pub fn observe(&mut self, online: bool) -> Option<Event> {
    let previous = self.online.replace(online);
    match (previous, online) {
      (Some(true), true) | (Some(false), false) => None,
      (None, false) => None,
      (_, true) => Some(Event::Online),
      (Some(true), false) => Some(Event::Offline),
    }
  }
}

/// Event handler that merges control messages and connectivity changes
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Probe `probe_url` every `interval`. Any HTTP response counts as online.
  pub fn spawn_connectivity_probe(&self, network: Arc<dyn Network>, probe_url: Url, interval: Duration) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut tracker = ConnectivityTracker::default();
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let probe = Request::new(Method::HEAD, probe_url.clone());
        let online = match network.fetch(&probe).await {
          Ok(_) => true,
          Err(e) => {
            debug!(error = %e, "connectivity probe failed");
            false
          }
        };
        if let Some(event) = tracker.observe(online) {
          if tx.send(event).is_err() {
            break;
          }
        }
      }
    });
  }

  /// Read one JSON control message per line from stdin.
  pub fn spawn_stdin_reader(&self) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) if line.trim().is_empty() => continue,
          Ok(Some(line)) => match ControlMessage::parse(&line) {
            Ok(message) => {
              if tx.send(Event::Message(message)).is_err() {
                break;
              }
            }
            Err(e) => warn!(error = %e, "ignoring control message"),
          },
          Ok(None) => break,
          Err(e) => {
            warn!(error = %e, "stdin closed");
            break;
          }
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
