//! calbridge CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use calbridge_client::cli::{Cli, Command, ConfigAction};
use calbridge_client::commands;
use calbridge_client::config::ClientConfig;
use calbridge_client::error::{ClientError, ClientResult};
use calbridge_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let tracing = match cli.command {
        Command::Daemon => TracingConfig::daemon(),
        _ if cli.debug || config.debug => TracingConfig::cli_debug(),
        _ => TracingConfig::default(),
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("warning: {}", e);
    }

    match run(&cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> ClientResult<ClientConfig> {
    match cli.config {
        Some(ref path) => ClientConfig::load_from(path).map_err(ClientError::Config),
        None => ClientConfig::load().map_err(ClientError::Config),
    }
}

async fn run(cli: &Cli, config: &ClientConfig) -> ClientResult<()> {
    match cli.command {
        Command::Daemon => commands::daemon::run(cli, config).await,
        Command::Sync { ref account } => {
            let client = commands::connect(cli, config).await?;
            commands::sync::run(&client, account.as_deref()).await
        }
        Command::Cancel { ref account } => {
            let client = commands::connect(cli, config).await?;
            commands::query::cancel(&client, account).await
        }
        Command::Status => {
            let client = commands::connect(cli, config).await?;
            commands::query::status(&client).await
        }
        Command::Get { ref kind, ref id } => {
            let client = commands::connect(cli, config).await?;
            commands::query::get(&client, kind, id).await
        }
        Command::List { ref kind } => {
            let client = commands::connect(cli, config).await?;
            commands::query::list(&client, kind).await
        }
        Command::Config { ref action } => match action {
            ConfigAction::Dump => commands::config::dump(config),
            ConfigAction::Validate => commands::config::validate(config),
            ConfigAction::Path => commands::config::path(),
        },
    }
}
