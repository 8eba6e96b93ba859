//! Configuration commands.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Prints the loaded configuration. Passwords are shown as configured, so
/// `env::` and `pass::` references stay unresolved.
pub fn dump(config: &ClientConfig) -> ClientResult<()> {
    let toml_str = toml::to_string_pretty(config)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))?;
    println!("# config.toml ({})", ClientConfig::default_path().display());
    println!("{}", toml_str);
    Ok(())
}

pub fn validate(config: &ClientConfig) -> ClientResult<()> {
    config.validate().map_err(ClientError::Config)?;
    println!(
        "Configuration is valid ({} account{}).",
        config.accounts.len(),
        if config.accounts.len() == 1 { "" } else { "s" }
    );
    Ok(())
}

pub fn path() -> ClientResult<()> {
    println!("config: {}", ClientConfig::default_path().display());
    println!("data:   {}", ClientConfig::default_data_dir().display());
    Ok(())
}
