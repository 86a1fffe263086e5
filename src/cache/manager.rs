//! Offline cache manager: install, activate and request interception.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{validate_app_shell, Config};
use crate::net::{FetchFuture, Fetcher, HttpRequest, HttpResponse};

use super::registration::Registration;
use super::storage::CacheStorage;
use super::traits::{shell_fingerprint, CacheResult, DynamicEndpoints};

/// Fixed inputs of the manager, injected once at construction.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
  /// Current cache generation identifier
  pub generation: String,
  /// App shell paths as configured, used for the fingerprint
  pub shell_paths: Vec<String>,
  /// App shell resolved against the origin, in install order
  pub app_shell: Vec<HttpRequest>,
  pub bypass: DynamicEndpoints,
}

impl ManagerConfig {
  pub fn new(
    generation: &str,
    origin: &Url,
    shell_paths: &[String],
    bypass: DynamicEndpoints,
  ) -> Result<Self> {
    validate_app_shell(shell_paths)?;

    let app_shell = shell_paths
      .iter()
      .map(|path| {
        let url = origin
          .join(path)
          .map_err(|e| eyre!("Invalid app shell entry {}: {}", path, e))?;
        if url.origin() != origin.origin() {
          return Err(eyre!("App shell entry {} leaves the origin", path));
        }
        if bypass.matches(&url) {
          return Err(eyre!(
            "App shell entry {} is a dynamic endpoint and cannot be cached",
            path
          ));
        }
        Ok(HttpRequest::get(url))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      generation: generation.to_string(),
      shell_paths: shell_paths.to_vec(),
      app_shell,
      bypass,
    })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Self::new(
      &config.cache_name,
      &config.origin_url()?,
      &config.app_shell,
      DynamicEndpoints::new(config.bypass.iter().cloned()),
    )
  }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
  pub generation: String,
  pub cached: usize,
}

/// Outcome of an activate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
  pub generation: String,
  /// Stale stores that were purged
  pub deleted: Vec<String>,
}

/// What happened to the store as a result of a network fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevalidationOutcome {
  /// A 200 GET response replaced the stored entry
  Stored,
  /// The response was not cacheable (non-GET or non-200)
  NotStored,
  /// The network fetch failed; any stored entry is kept
  Failed,
}

/// Handle on the store-write side effect of an intercepted request.
///
/// Dropping it does not cancel the background update.
#[derive(Debug)]
pub enum Revalidation {
  Settled(RevalidationOutcome),
  Pending(JoinHandle<RevalidationOutcome>),
}

impl Revalidation {
  /// Wait for the network fetch to settle.
  pub async fn wait(self) -> RevalidationOutcome {
    match self {
      Self::Settled(outcome) => outcome,
      Self::Pending(handle) => handle.await.unwrap_or(RevalidationOutcome::Failed),
    }
  }
}

/// Result of intercepting a request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not intercepted; the host performs the plain network request
  Passthrough,
  Response {
    result: CacheResult<HttpResponse>,
    revalidation: Revalidation,
  },
}

/// Cache manager that owns the offline cache policy.
///
/// Serves the app shell from the active generation's store and keeps other
/// GET responses fresh with stale-while-revalidate. Dynamic endpoints are
/// never read from or written to any store.
pub struct CacheManager<S: CacheStorage, F: Fetcher> {
  storage: Arc<S>,
  fetcher: Arc<F>,
  config: ManagerConfig,
}

impl<S, F> CacheManager<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
{
  pub fn new(storage: Arc<S>, fetcher: Arc<F>, config: ManagerConfig) -> Self {
    Self {
      storage,
      fetcher,
      config,
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn generation(&self) -> &str {
    &self.config.generation
  }

  /// Install phase: populate the current generation's store with the app shell.
  ///
  /// All entries are fetched before anything is written; a single failure
  /// aborts the install, removes a store this install created, and leaves the
  /// previously active generation serving.
  pub async fn on_install(&self) -> Result<InstallReport> {
    let generation = self.config.generation.as_str();
    let previous = self.storage.load_registration()?;
    let existed = self.storage.has(generation)?;

    let fingerprint = shell_fingerprint(&self.config.shell_paths);
    if existed {
      if let Some(recorded) = self.storage.fingerprint(generation)? {
        if recorded != fingerprint {
          warn!(
            generation,
            "App shell changed but the cache generation was not bumped; repopulating"
          );
        }
      }
    }

    let mut registration = previous.clone();
    registration.begin_install();
    self.storage.save_registration(&registration)?;
    info!(generation, state = %registration.state, "Installing app shell");

    match self.install_shell(generation, &fingerprint, &mut registration).await {
      Ok(cached) => {
        // Waiting is always skipped: the generation can activate right away.
        info!(generation, cached, "App shell installed");
        Ok(InstallReport {
          generation: generation.to_string(),
          cached,
        })
      }
      Err(e) => {
        // Put the registration back before any cleanup that may itself fail.
        if let Err(restore) = self.storage.save_registration(&previous) {
          warn!(generation, "Failed to restore registration: {}", restore);
        }
        if !existed {
          if let Err(cleanup) = self.storage.delete(generation) {
            warn!(generation, "Failed to remove partial cache store: {}", cleanup);
          }
        }
        warn!(generation, "Install failed: {}", e);
        Err(e.wrap_err(format!("Install of cache generation {} failed", generation)))
      }
    }
  }

  async fn install_shell(
    &self,
    generation: &str,
    fingerprint: &str,
    registration: &mut Registration,
  ) -> Result<usize> {
    self.storage.open(generation)?;
    let cached = self.populate(generation, fingerprint).await?;
    registration.install_succeeded(generation);
    self.storage.save_registration(registration)?;
    Ok(cached)
  }

  async fn populate(&self, generation: &str, fingerprint: &str) -> Result<usize> {
    let fetches = self.config.app_shell.iter().map(|request| {
      let network = self.fetcher.fetch(request);
      async move {
        let response = network.await?;
        if !response.is_ok() {
          return Err(eyre!(
            "Failed to cache {}: status {}",
            request.url,
            response.status
          ));
        }
        Ok::<_, color_eyre::Report>((request.clone(), response))
      }
    });

    let entries = try_join_all(fetches).await?;
    self.storage.put_all(generation, &entries)?;
    self.storage.set_fingerprint(generation, fingerprint)?;
    Ok(entries.len())
  }

  /// Activate phase: purge every store but the current generation's, then
  /// claim clients so the current generation serves from now on.
  pub async fn on_activate(&self) -> Result<ActivateReport> {
    let generation = self.config.generation.as_str();
    let mut registration = self.storage.load_registration()?;
    if !registration.can_activate(generation) {
      return Err(eyre!(
        "Cache generation {} has not been installed",
        generation
      ));
    }

    let mut deleted = Vec::new();
    for name in self.storage.keys()? {
      if name == generation {
        continue;
      }
      match self.storage.delete(&name) {
        Ok(_) => {
          info!(store = %name, "Deleted stale cache store");
          deleted.push(name);
        }
        Err(e) => warn!(store = %name, "Failed to delete stale cache store: {}", e),
      }
    }

    registration.activate(generation)?;
    self.storage.save_registration(&registration)?;
    info!(generation, "Activated; clients claimed");

    Ok(ActivateReport {
      generation: generation.to_string(),
      deleted,
    })
  }

  /// Install followed by activate.
  pub async fn update(&self) -> Result<(InstallReport, ActivateReport)> {
    let installed = self.on_install().await?;
    let activated = self.on_activate().await?;
    Ok((installed, activated))
  }

  /// Intercept one request.
  ///
  /// 1. Dynamic endpoints and uncontrolled requests pass through untouched
  /// 2. The store is consulted and the network fetch starts as an independent task
  /// 3. A stored response is returned immediately; the task refreshes the store
  /// 4. On a miss the network outcome is returned (and stored if cacheable)
  pub async fn on_fetch(&self, request: &HttpRequest) -> Result<FetchOutcome> {
    if self.config.bypass.matches(&request.url) {
      debug!(url = %request.url, "Dynamic endpoint, not intercepting");
      return Ok(FetchOutcome::Passthrough);
    }

    let registration = self.storage.load_registration()?;
    let Some(generation) = registration.serving().map(String::from) else {
      debug!(url = %request.url, "No active cache generation, not intercepting");
      return Ok(FetchOutcome::Passthrough);
    };

    let cached = self.storage.match_request(&generation, request)?;
    let network = tokio::spawn(fetch_and_store(
      Arc::clone(&self.storage),
      generation.clone(),
      request.clone(),
      self.fetcher.fetch(request),
    ));

    match cached {
      Some(cached) => {
        debug!(url = %request.url, %generation, "Cache hit, revalidating in background");
        let url = request.url.clone();
        let revalidation = tokio::spawn(async move {
          match network.await {
            Ok(Ok((_, outcome))) => {
              debug!(%url, ?outcome, "Revalidation settled");
              outcome
            }
            Ok(Err(e)) => {
              warn!(%url, "Revalidation failed, keeping cached response: {}", e);
              RevalidationOutcome::Failed
            }
            Err(e) => {
              warn!(%url, "Revalidation task failed: {}", e);
              RevalidationOutcome::Failed
            }
          }
        });

        Ok(FetchOutcome::Response {
          result: CacheResult::from_cache(cached.response, cached.cached_at),
          revalidation: Revalidation::Pending(revalidation),
        })
      }
      None => {
        debug!(url = %request.url, %generation, "Cache miss, waiting for network");
        let (response, outcome) = network
          .await
          .map_err(|e| eyre!("Network task failed for {}: {}", request.url, e))??;

        Ok(FetchOutcome::Response {
          result: CacheResult::from_network(response),
          revalidation: Revalidation::Settled(outcome),
        })
      }
    }
  }
}

/// Await the network and write a cacheable response into the store.
///
/// Writes only into a store that still exists, so a generation purged while
/// the fetch was in flight stays purged. A failed store write is logged; the
/// response still reaches the caller.
async fn fetch_and_store<S: CacheStorage>(
  storage: Arc<S>,
  generation: String,
  request: HttpRequest,
  network: FetchFuture,
) -> Result<(HttpResponse, RevalidationOutcome)> {
  let response = network.await?;

  if !request.is_get() || !response.is_ok() {
    return Ok((response, RevalidationOutcome::NotStored));
  }

  match storage.put(&generation, &request, &response) {
    Ok(true) => Ok((response, RevalidationOutcome::Stored)),
    Ok(false) => {
      debug!(url = %request.url, %generation, "Cache store is gone, response not stored");
      Ok((response, RevalidationOutcome::NotStored))
    }
    Err(e) => {
      warn!(url = %request.url, %generation, "Failed to store response: {}", e);
      Ok((response, RevalidationOutcome::NotStored))
    }
  }
}
