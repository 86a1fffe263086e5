use crate::cache::{CacheManager, CacheStorage, FetchOutcome, ManagerConfig, SqliteStorage};
use crate::commands::Command;
use crate::config::Config;
use crate::net::{Fetcher, HttpFetcher, HttpResponse};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};

/// Host for the cache manager: owns the store, the network and the CLI output.
pub struct App {
  fetcher: Arc<HttpFetcher>,
  manager: CacheManager<SqliteStorage, HttpFetcher>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let storage = Arc::new(SqliteStorage::open(&config.database_path()?)?);
    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let manager = CacheManager::new(
      storage,
      Arc::clone(&fetcher),
      ManagerConfig::from_config(&config)?,
    );

    Ok(Self { fetcher, manager })
  }

  pub async fn run(&self, command: Command) -> Result<()> {
    match command {
      Command::Install => {
        let report = self.manager.on_install().await?;
        println!(
          "Installed {} ({} entries)",
          report.generation, report.cached
        );
      }
      Command::Activate => {
        let report = self.manager.on_activate().await?;
        print_activated(&report.generation, &report.deleted);
      }
      Command::Update => {
        let (installed, activated) = self.manager.update().await?;
        println!(
          "Installed {} ({} entries)",
          installed.generation, installed.cached
        );
        print_activated(&activated.generation, &activated.deleted);
      }
      Command::Fetch { path } => self.fetch(&path).await?,
      Command::Stores => self.list_stores()?,
      Command::Status => self.status()?,
    }

    Ok(())
  }

  /// Handle one request the way an intercepted page load would be.
  async fn fetch(&self, path: &str) -> Result<()> {
    let request = self.fetcher.request(path)?;

    match self.manager.on_fetch(&request).await? {
      FetchOutcome::Passthrough => {
        info!(url = %request.url, "Not intercepted, fetching from network");
        let response = self.fetcher.fetch(&request).await?;
        write_body(&response)?;
      }
      FetchOutcome::Response {
        result,
        revalidation,
      } => {
        info!(
          url = %request.url,
          source = ?result.source,
          status = result.data.status,
          content_type = result.data.header("content-type").unwrap_or("-"),
          cached_at = ?result.cached_at,
          "Responded"
        );
        write_body(&result.data)?;

        // The process is about to exit; let the store update land first.
        let outcome = revalidation.wait().await;
        debug!(url = %request.url, ?outcome, "Store update settled");
      }
    }

    Ok(())
  }

  fn list_stores(&self) -> Result<()> {
    let storage = self.manager.storage();
    let registration = storage.load_registration()?;

    for name in storage.keys()? {
      let marker = if registration.serving() == Some(name.as_str()) {
        " (active)"
      } else if registration.waiting.as_deref() == Some(name.as_str()) {
        " (waiting)"
      } else {
        ""
      };
      println!("{}\t{}{}", name, storage.entry_count(&name)?, marker);
    }

    Ok(())
  }

  fn status(&self) -> Result<()> {
    let registration = self.manager.storage().load_registration()?;

    println!("state:      {}", registration.state);
    println!("configured: {}", self.manager.generation());
    println!(
      "active:     {}",
      registration.active.as_deref().unwrap_or("-")
    );
    println!(
      "waiting:    {}",
      registration.waiting.as_deref().unwrap_or("-")
    );

    Ok(())
  }
}

fn print_activated(generation: &str, deleted: &[String]) {
  if deleted.is_empty() {
    println!("Activated {}", generation);
  } else {
    println!("Activated {} (deleted {})", generation, deleted.join(", "));
  }
}

fn write_body(response: &HttpResponse) -> Result<()> {
  let mut stdout = std::io::stdout().lock();
  stdout
    .write_all(&response.body)
    .and_then(|_| stdout.flush())
    .map_err(|e| eyre!("Failed to write response body: {}", e))
}
