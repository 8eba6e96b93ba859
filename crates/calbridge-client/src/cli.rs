//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// calbridge - calendar sync worker and its bridge
#[derive(Debug, Parser)]
#[command(name = "calbridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "CALBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Path to the daemon socket
    #[arg(long, env = "CALBRIDGE_SOCKET")]
    pub socket_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the sync worker in the foreground, serving the socket
    Daemon,

    /// Sync one account, or every account, and follow it to completion
    Sync {
        /// Account to sync; all accounts when omitted
        #[arg(long, short)]
        account: Option<String>,
    },

    /// Cancel a running sync
    Cancel {
        /// Account whose sync to cancel
        account: String,
    },

    /// Show network state, accounts and running syncs
    Status,

    /// Print one stored record as JSON
    Get {
        /// Entity kind (Account, Calendar, Event, IcalComponent, ...)
        kind: String,
        /// Record id
        id: String,
    },

    /// Print every stored record of a kind as JSON
    List {
        /// Entity kind
        kind: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the loaded configuration
    Dump,
    /// Check every configured account
    Validate,
    /// Show the configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_sync_with_account() {
        let cli = Cli::try_parse_from(["calbridge", "--debug", "sync", "--account", "work"]).unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Sync { account } => assert_eq!(account.as_deref(), Some("work")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn parses_get() {
        let cli = Cli::try_parse_from(["calbridge", "get", "Event", "e1"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Get { ref kind, ref id } if kind == "Event" && id == "e1"
        ));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["calbridge"]).is_err());
    }
}
