//! Subcommands: one per lifecycle event, plus inspection.

use clap::Subcommand;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Fetch the app shell into the current generation's store
  Install,
  /// Purge stale stores and make the current generation serve
  Activate,
  /// Install, then activate
  Update,
  /// Handle one request through the cache and write the body to stdout
  Fetch {
    /// Root-relative path, e.g. /static/app.js
    path: String,
  },
  /// List cache stores and their entry counts
  Stores,
  /// Show the registration state
  Status,
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser;

  #[derive(Parser, Debug)]
  struct Cli {
    #[command(subcommand)]
    command: Command,
  }

  #[test]
  fn test_parse_fetch_path() {
    let cli = Cli::try_parse_from(["shellcache", "fetch", "/static/app.js"]).unwrap();
    assert_eq!(
      cli.command,
      Command::Fetch {
        path: "/static/app.js".to_string()
      }
    );
  }

  #[test]
  fn test_parse_lifecycle_commands() {
    for (arg, expected) in [
      ("install", Command::Install),
      ("activate", Command::Activate),
      ("update", Command::Update),
      ("stores", Command::Stores),
      ("status", Command::Status),
    ] {
      let cli = Cli::try_parse_from(["shellcache", arg]).unwrap();
      assert_eq!(cli.command, expected);
    }
  }

  #[test]
  fn test_fetch_requires_path() {
    assert!(Cli::try_parse_from(["shellcache", "fetch"]).is_err());
  }
}
