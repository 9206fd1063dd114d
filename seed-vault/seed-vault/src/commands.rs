use anyhow::{Result, bail};
use std::io::{self, BufRead};
use vault::SeedVault;
use zeroize::Zeroizing;

use crate::Command;

/// Read one seed phrase line from stdin, collapsing runs of whitespace.
pub fn read_phrase() -> Result<Zeroizing<String>> {
    eprintln!("Enter the seed phrase:");
    let mut line = Zeroizing::new(String::new());
    io::stdin().lock().read_line(&mut line)?;
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        bail!("no seed phrase given");
    }
    Ok(Zeroizing::new(words.join(" ")))
}

/// Execute one command against the vault. Runs on the worker thread.
pub fn run(vault: &SeedVault, command: Command, phrase: Option<Zeroizing<String>>) -> Result<()> {
    match command {
        Command::Recover { name, scheme } => {
            let Some(phrase) = phrase else {
                bail!("no seed phrase given");
            };
            vault.recover(&name, scheme, &phrase)?;
            println!("stored seed {name}");
        }
        Command::Fetch { name } => {
            let phrase = vault.fetch(&name)?;
            println!("{}", phrase.as_str());
        }
        Command::Delete { name } => {
            vault.delete(&name)?;
            println!("deleted seed {name}");
        }
        Command::List => {
            for name in vault.list_names()? {
                println!("{name}");
            }
        }
        Command::Wipe => {
            vault.wipe()?;
            println!("removed all seeds");
        }
        Command::Reset { yes } => {
            if !yes {
                bail!("reset destroys the master key and every seed; pass --yes to confirm");
            }
            vault.factory_reset()?;
            println!("vault reset");
        }
        Command::Info => {
            println!("hardware backed: {}", vault.is_hardware_backed());
            println!("seeds: {}", vault.list_names()?.len());
        }
    }
    Ok(())
}
