//! Per-request routing: classify, then serve from cache, go to the network,
//! or queue the write.

use std::sync::Arc;

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{api_cache, static_cache, CacheManager, CacheResult, CacheStorage, Strategy};
use crate::config::WriteFailurePolicy;
use crate::error::{Error, Result};
use crate::http::sanitize::carries_credentials;
use crate::http::{Network, Request, Response};
use crate::queue::{NewAction, QueueStore, QueuedAction};

/// Request class decided before any I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Same-origin GET outside the API: documents, scripts, styles, images
  Static,
  /// GET or HEAD under the API prefix
  ApiRead,
  /// Any other method under the API prefix
  ApiWrite,
  /// Everything else goes straight to the network
  Passthrough,
}

impl Route {
  pub fn classify(request: &Request, origin: &Url, api_prefix: &str) -> Self {
    if request.url.origin() != origin.origin() {
      return Route::Passthrough;
    }
    let is_api = request.url.path().starts_with(api_prefix);
    match (is_api, request.is_read()) {
      (true, true) => Route::ApiRead,
      (true, false) => Route::ApiWrite,
      (false, true) if request.method == reqwest::Method::GET => Route::Static,
      _ => Route::Passthrough,
    }
  }
}

/// How an intercepted request settled.
#[derive(Debug)]
pub enum Outcome {
  Response(CacheResult<Response>),
  /// The write could not reach the server and is durably queued.
  Queued(QueuedAction),
}

impl Outcome {
  /// Response handed back to the caller. Queued writes become a synthetic
  /// `202 Accepted`.
  pub fn into_response(self) -> Response {
    match self {
      Outcome::Response(result) => result.data,
      Outcome::Queued(action) => {
        let body = serde_json::json!({ "queued": true, "id": action.id }).to_string();
        let mut response = Response::new(202, body);
        response
          .headers
          .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
      }
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, Outcome::Queued(_))
  }
}

/// The routing state machine.
pub struct Interceptor<S: CacheStorage, Q: QueueStore> {
  cache: CacheManager<S>,
  queue: Arc<Q>,
  network: Arc<dyn Network>,
  origin: Url,
  api_prefix: String,
  write_policy: WriteFailurePolicy,
}

impl<S: CacheStorage + 'static, Q: QueueStore> Interceptor<S, Q> {
  pub fn new(
    cache: CacheManager<S>,
    queue: Arc<Q>,
    network: Arc<dyn Network>,
    origin: Url,
    api_prefix: String,
    write_policy: WriteFailurePolicy,
  ) -> Self {
    Self {
      cache,
      queue,
      network,
      origin,
      api_prefix,
      write_policy,
    }
  }

  pub fn route(&self, request: &Request) -> Route {
    Route::classify(request, &self.origin, &self.api_prefix)
  }

  /// Settle `request` using the caches of `generation`.
  pub async fn handle(&self, request: &Request, generation: &str) -> Result<Outcome> {
    let route = self.route(request);
    debug!(method = %request.method, url = %request.url, ?route, "intercepted");

    match route {
      Route::Static => {
        let result = self
          .cache
          .lookup_or_fetch(
            request,
            Strategy::StaleWhileRevalidate,
            &static_cache(generation),
          )
          .await?;
        Ok(Outcome::Response(result))
      }

      Route::ApiRead => {
        // Authenticated reads are user-specific: never cached, never served stale.
        let strategy = if carries_credentials(request) {
          Strategy::NetworkOnly
        } else {
          Strategy::NetworkFirst
        };
        let result = self
          .cache
          .lookup_or_fetch(request, strategy, &api_cache(generation))
          .await?;
        Ok(Outcome::Response(result))
      }

      Route::ApiWrite => self.handle_write(request).await,

      Route::Passthrough => {
        let response = self.network.fetch(request).await?;
        Ok(Outcome::Response(CacheResult::from_network(response)))
      }
    }
  }

  async fn handle_write(&self, request: &Request) -> Result<Outcome> {
    match self.network.fetch(request).await {
      // Any status from a reachable server, 4xx/5xx included, goes back as-is.
      Ok(response) => Ok(Outcome::Response(CacheResult::from_network(response))),
      Err(Error::NetworkUnavailable(reason)) => {
        let action = NewAction::from_request(request);
        let queued = self.queue.enqueue(&action).map_err(|e| {
          warn!(url = %request.url, error = %e, "write could not be queued and is lost");
          e
        })?;
        info!(id = queued.id, method = %queued.method, url = %queued.url, "network unavailable, write queued");

        match self.write_policy {
          WriteFailurePolicy::ReportQueued => Ok(Outcome::Queued(queued)),
          WriteFailurePolicy::PropagateError => Err(Error::NetworkUnavailable(reason)),
        }
      }
      Err(e) => Err(e),
    }
  }

  /// Enqueue an action supplied directly by the page.
  pub fn queue_action(&self, action: &NewAction) -> Result<QueuedAction> {
    let queued = self.queue.enqueue(action)?;
    info!(id = queued.id, method = %queued.method, url = %queued.url, "action queued by page");
    Ok(queued)
  }

  pub fn cache(&self) -> &CacheManager<S> {
    &self.cache
  }
}
