//! Scripted network for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::http::{Network, Request, Response};

#[derive(Debug, Clone)]
enum Reply {
  Respond(Response),
  Fail,
}

/// In-memory [`Network`] with an online switch, per-URL replies and a log of
/// every request it saw.
#[derive(Default)]
pub struct MockNetwork {
  offline: AtomicBool,
  delay: Mutex<Option<Duration>>,
  routes: Mutex<HashMap<String, Response>>,
  once: Mutex<HashMap<String, VecDeque<Reply>>>,
  seen: Mutex<Vec<Request>>,
}

impl MockNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn set_online(&self, online: bool) {
    self.offline.store(!online, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Reply to every request for `url` with `response`.
  pub fn respond(&self, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(url.to_string(), response);
  }

  /// Reply once with `response`, ahead of the standing route.
  pub fn respond_once(&self, url: &str, response: Response) {
    self.push_once(url, Reply::Respond(response));
  }

  /// Fail the next request for `url` as if the network were down.
  pub fn fail_once(&self, url: &str) {
    self.push_once(url, Reply::Fail);
  }

  fn push_once(&self, url: &str, reply: Reply) {
    self
      .once
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(reply);
  }

  pub fn requests(&self) -> Vec<Request> {
    self.seen.lock().unwrap().clone()
  }

  pub fn hits(&self, url: &str) -> usize {
    self
      .seen
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    self.seen.lock().unwrap().push(request.clone());
    if self.offline.load(Ordering::SeqCst) {
      return Err(Error::NetworkUnavailable("simulated offline".into()));
    }

    let url = request.url.as_str();
    let scripted = self
      .once
      .lock()
      .unwrap()
      .get_mut(url)
      .and_then(|q| q.pop_front());
    match scripted {
      Some(Reply::Respond(response)) => return Ok(response),
      Some(Reply::Fail) => return Err(Error::NetworkUnavailable("simulated failure".into())),
      None => {}
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(url)
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
