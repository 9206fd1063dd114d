use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use vault::config::Config;

#[derive(Parser, Debug)]
#[command(author, version, about = "Provision the seed vault master key")]
struct Cli {
    /// Path to the vault config file.
    #[arg(short, long, env = "SEED_VAULT_CONFIG")]
    config: Option<PathBuf>,
}

/// Create the master key if it does not exist.
///
/// Idempotent: an existing key is left untouched, since replacing it would
/// make every stored seed undecryptable.
fn provision_key(config: &Config) -> Result<()> {
    let backend = vault::detect_backend(config)?;
    let hardware = backend.is_hardware_backed();

    let created = backend
        .provision()
        .context("master key provisioning failed")?;

    if created {
        log::info!("master key provisioned (hardware backed: {hardware})");
    } else {
        log::info!("master key already exists, nothing to do");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let config = Config::load(&Config::resolve_path(cli.config.as_deref()))?;
    provision_key(&config)
}
