mod commands;
mod prompt;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::thread;
use vault::config::Config;
use vault::{CryptoScheme, SeedVault, StructuralPhraseCheck};

#[derive(Parser, Debug)]
#[command(author, version, about = "Device-local seed phrase vault")]
struct Cli {
    /// Path to the vault config file.
    #[arg(short, long, env = "SEED_VAULT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Store an existing seed phrase, read from stdin.
    Recover {
        name: String,
        #[arg(long, default_value = "sr25519")]
        scheme: CryptoScheme,
    },
    /// Print a stored seed phrase after a PIN check.
    Fetch { name: String },
    /// Remove a stored seed. No PIN needed.
    Delete { name: String },
    /// List stored seed names.
    List,
    /// Remove every stored seed, keeping the master key.
    Wipe,
    /// Remove every seed and destroy the master key.
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Show key backend and record count.
    Info,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config.as_deref());
    let config = Config::load(&config_path)?;

    // Stdin is shared with the PIN prompt; take the phrase before any prompt.
    let phrase = match &cli.command {
        Command::Recover { .. } => Some(commands::read_phrase()?),
        _ => None,
    };

    let backend = vault::detect_backend(&config)?;
    let (vault, dispatcher) = SeedVault::open(
        &config,
        backend,
        prompt::TerminalPrompt::new(config.auth.pin_sha256.clone()),
        Box::new(StructuralPhraseCheck),
    );

    let command = cli.command;
    let worker = thread::Builder::new()
        .name("seed-vault-worker".into())
        .spawn(move || {
            let result = commands::run(&vault, command, phrase);
            // Dropping the vault closes the prompt channel and ends the loop below.
            drop(vault);
            result
        })
        .context("failed to spawn worker thread")?;

    // This thread owns the terminal and serves credential prompts. A PIN
    // reader left waiting on stdin after a timeout does not hold up exit.
    dispatcher.run();

    worker
        .join()
        .map_err(|_| anyhow!("worker thread panicked"))?
}
