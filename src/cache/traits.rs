//! Core types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::{HttpRequest, HttpResponse};

/// Stable storage key for a request: SHA256 of `METHOD url`.
pub fn request_key(request: &HttpRequest) -> String {
  let mut hasher = Sha256::new();
  hasher.update(request.method.as_bytes());
  hasher.update(b" ");
  hasher.update(request.url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

/// Fingerprint of an app shell manifest, recorded per cache store.
pub fn shell_fingerprint(paths: &[String]) -> String {
  let mut hasher = Sha256::new();
  for path in paths {
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
  }
  hex::encode(hasher.finalize())
}

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: HttpResponse,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: ResponseSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: ResponseSource::Cache,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Network response (cache miss)
  Network,
  /// Stored response, possibly stale; a revalidation was started alongside it
  Cache,
}

/// Predicate over request URLs selecting dynamic endpoints that bypass caching.
#[derive(Debug, Clone)]
pub struct DynamicEndpoints {
  markers: Vec<String>,
}

impl DynamicEndpoints {
  pub fn new(markers: impl IntoIterator<Item = impl Into<String>>) -> Self {
    Self {
      markers: markers.into_iter().map(Into::into).collect(),
    }
  }

  /// True when any marker occurs anywhere in the URL.
  pub fn matches(&self, url: &Url) -> bool {
    let url = url.as_str();
    self.markers.iter().any(|marker| url.contains(marker.as_str()))
  }
}
