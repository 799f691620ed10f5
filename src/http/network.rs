//! The network seam: everything that leaves the process goes through
//! [`Network::fetch`].

use std::time::Duration;

use async_trait::async_trait;

use super::types::{Request, Response};
use crate::error::{Error, Result};

/// Sends a request to the origin.
///
/// Transport failures map to `NetworkUnavailable`; HTTP error statuses are
/// returned as ordinary responses so callers can tell the two apart.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| Error::NetworkUnavailable(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone());
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| Error::NetworkUnavailable(format!("{} {}: {}", request.method, request.url, e)))?;

    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp
      .bytes()
      .await
      .map_err(|e| Error::NetworkUnavailable(format!("reading body of {}: {}", request.url, e)))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
