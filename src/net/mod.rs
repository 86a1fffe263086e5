//! Network fetch primitive used by the cache manager.

mod client;
mod types;

pub use client::{FetchFuture, Fetcher, HttpFetcher};
pub use types::{HttpRequest, HttpResponse};
