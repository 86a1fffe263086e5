use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::Config;

use super::types::{HttpRequest, HttpResponse};

/// A boxed future resolving to a network response.
///
/// `'static` so the manager can hand it to a spawned revalidation task.
pub type FetchFuture = BoxFuture<'static, Result<HttpResponse>>;

/// The host's network fetch primitive.
pub trait Fetcher: Send + Sync {
  fn fetch(&self, request: &HttpRequest) -> FetchFuture;
}

/// Fetcher backed by a reqwest client bound to a single origin.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let origin = config.origin_url()?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, origin })
  }

  /// Resolve a root-relative path against the origin.
  pub fn request(&self, path: &str) -> Result<HttpRequest> {
    let url = self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid request path {}: {}", path, e))?;
    Ok(HttpRequest::get(url))
  }
}

impl Fetcher for HttpFetcher {
  fn fetch(&self, request: &HttpRequest) -> FetchFuture {
    let client = self.client.clone();
    let request = request.clone();

    Box::pin(async move {
      let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

      let response = client
        .request(method, request.url.clone())
        .send()
        .await
        .map_err(|e| eyre!("Network error fetching {}: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = collect_headers(response.headers());

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Network error reading {}: {}", request.url, e))?
        .to_vec();

      Ok(HttpResponse {
        status,
        headers,
        body,
      })
    })
  }
}

/// Header values are kept as text. Non-ASCII values are kept when they are
/// valid UTF-8; anything else is dropped and logged.
fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter_map(|(name, value)| {
      let text = match value.to_str() {
        Ok(text) => text.to_string(),
        Err(_) => match String::from_utf8(value.as_bytes().to_vec()) {
          Ok(text) => text,
          Err(_) => {
            debug!(header = %name, "Dropping header with non UTF-8 value");
            return None;
          }
        },
      };
      Some((name.as_str().to_string(), text))
    })
    .collect()
}
