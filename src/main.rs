mod app;
mod cache;
mod commands;
mod config;
mod logging;
mod net;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use commands::Command;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline app-shell cache with stale-while-revalidate serving")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin to fetch from, overrides the config file
  #[arg(short, long)]
  origin: Option<String>,

  /// Cache generation identifier, overrides the config file
  #[arg(long)]
  cache_name: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = logging::init()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command-line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(cache_name) = args.cache_name {
    config.cache_name = cache_name;
  }

  let app = app::App::new(config)?;
  app.run(args.command).await?;

  Ok(())
}
