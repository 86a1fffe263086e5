use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the log filter directives.
const LOG_ENV: &str = "SHELLCACHE_LOG";

/// Install the global subscriber, logging to stderr.
///
/// Stdout carries response bodies, so logs never go there. Keep the returned
/// guard alive until exit or buffered lines are lost.
pub fn init() -> Result<WorkerGuard> {
  let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
  let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_writer(writer))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}
