use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{AuthConfig, BusyPolicy, PromptInfo};
use crate::key::KeyPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/seed-vault/config.toml";
pub const CONFIG_PATH_ENV: &str = "SEED_VAULT_CONFIG";

const DEFAULT_STORE_PATH: &str = "/var/lib/seed-vault/seeds.toml";
const DEFAULT_KEY_PATH: &str = "/var/lib/seed-vault/master.key";
const DEFAULT_KEY_ALIAS: &str = "SeedVaultMasterKey";
const DEFAULT_DOMAIN_SEPARATOR: &str = "seed-vault/aes-256-gcm/v1";

/// Which key backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// TPM when compiled in and present, else the key file.
    #[default]
    Auto,
    File,
    Tpm,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub vault: VaultSection,
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VaultSection {
    pub store_path: PathBuf,
    pub key_path: PathBuf,
    pub key_alias: String,
    pub domain_separator: String,
    pub auth_validity_ms: u64,
    pub reject_duplicate_phrases: bool,
    pub backend: BackendKind,
}

impl Default for VaultSection {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            key_path: PathBuf::from(DEFAULT_KEY_PATH),
            key_alias: DEFAULT_KEY_ALIAS.to_string(),
            domain_separator: DEFAULT_DOMAIN_SEPARATOR.to_string(),
            auth_validity_ms: 1_000,
            reject_duplicate_phrases: true,
            backend: BackendKind::Auto,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSection {
    pub timeout_secs: u64,
    pub busy_policy: BusyPolicy,
    pub title: String,
    pub subtitle: String,
    /// Hex SHA-256 of the device PIN checked by the terminal prompt.
    pub pin_sha256: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            busy_policy: BusyPolicy::Wait,
            title: "Secret seed protection".to_string(),
            subtitle: "Confirm your device credential to unlock the seed".to_string(),
            pin_sha256: None,
        }
    }
}

impl Config {
    /// Resolve the config path: explicit argument, then `SEED_VAULT_CONFIG`,
    /// then the default location.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Read and validate the config file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            log::warn!("config {} not found, using defaults", path.display());
            return Config::default().validated();
        }

        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let text = std::str::from_utf8(&raw).context("config file is not valid UTF-8")?;
        Config::parse(text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Config> {
        let config: Config = toml::from_str(text).context("failed to parse config TOML")?;
        config.validated()
    }

    fn validated(self) -> Result<Config> {
        if self.vault.domain_separator.is_empty() {
            bail!("vault.domain_separator is empty (security gate)");
        }
        if self.vault.key_alias.is_empty() {
            bail!("vault.key_alias is empty");
        }
        if self.auth.timeout_secs == 0 {
            bail!("auth.timeout_secs must be positive");
        }
        if let Some(pin) = &self.auth.pin_sha256 {
            if pin.len() != 64 || !pin.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("auth.pin_sha256 must be 64 hex characters");
            }
        }
        Ok(self)
    }

    pub fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            key_alias: self.vault.key_alias.clone(),
            domain_separator: self.vault.domain_separator.clone(),
            auth_validity: Duration::from_millis(self.vault.auth_validity_ms),
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            timeout: Duration::from_secs(self.auth.timeout_secs),
            busy_policy: self.auth.busy_policy,
            prompt: PromptInfo {
                title: self.auth.title.clone(),
                subtitle: self.auth.subtitle.clone(),
            },
        }
    }
}
