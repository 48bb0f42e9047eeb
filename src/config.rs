//! Configuration management for the swap coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::swap::{Asset, Identities, Ledger, LedgerKind, Network};

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SWAP_COORDINATOR_CONFIG";

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub actor: ActorConfig,
    pub ledgers: HashMap<String, LedgerConfig>,
    /// Terms for the in-process Maker/Taker run
    #[serde(default)]
    pub pair: Option<PairConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub instance_id: String,
    /// Worker step interval and confirmation poll interval
    pub poll_interval_ms: u64,
    pub action_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Unconfirmed actions in a row before a swap is aborted
    pub max_consecutive_failures: u32,
    pub cleanup_interval_secs: u64,
    /// How long terminal swaps stay queryable
    pub terminal_retention_secs: u64,
    pub health_check_interval_secs: u64,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: "swap-coordinator".to_string(),
            poll_interval_ms: 1_000,
            action_timeout_ms: 10_000,
            max_retries: 3,
            retry_delay_ms: 500,
            max_retry_delay_ms: 5_000,
            max_consecutive_failures: 3,
            cleanup_interval_secs: 60,
            terminal_retention_secs: 3_600,
            health_check_interval_secs: 30,
            event_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    pub port: u16,
}

fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}

/// The party this daemon acts for
#[derive(Debug, Clone, Deserialize)]
pub struct ActorConfig {
    pub name: String,
}

/// A simulated ledger hosted by the daemon
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub kind: LedgerKind,
    pub network: Network,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Background block production; 0 disables the miner
    #[serde(default)]
    pub block_interval_ms: u64,
    #[serde(default = "default_true")]
    pub instant_mining: bool,
    /// Stamp blocks with wall-clock time
    #[serde(default = "default_true")]
    pub wall_clock: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub balances: Vec<BalanceConfig>,
}

impl LedgerConfig {
    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.kind, self.network)
    }
}

fn default_confirmations() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

/// Opening balance credited at startup
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceConfig {
    pub identity: String,
    #[serde(default)]
    pub contract: Option<String>,
    /// Base units; strings allow values beyond the TOML integer range
    #[serde(deserialize_with = "deserialize_quantity")]
    pub amount: u128,
}

impl BalanceConfig {
    pub fn asset(&self, kind: LedgerKind) -> Asset {
        match &self.contract {
            Some(contract) => Asset::token(kind, contract.clone(), self.amount),
            None => Asset::native(kind, self.amount),
        }
    }
}

/// One swap walked by a Maker and a Taker sharing the simulated ledgers
#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    #[serde(default = "default_taker")]
    pub taker: String,
    #[serde(default = "default_maker")]
    pub maker: String,
    /// Keys into `[ledgers]`
    pub alpha_ledger: String,
    pub beta_ledger: String,
    #[serde(default)]
    pub alpha_contract: Option<String>,
    #[serde(deserialize_with = "deserialize_quantity")]
    pub alpha_quantity: u128,
    #[serde(default)]
    pub beta_contract: Option<String>,
    #[serde(deserialize_with = "deserialize_quantity")]
    pub beta_quantity: u128,
    /// Seconds after the ledger's current block time
    #[serde(default = "default_alpha_expiry_secs")]
    pub alpha_expiry_secs: u64,
    #[serde(default = "default_beta_expiry_secs")]
    pub beta_expiry_secs: u64,
    pub identities: Identities,
    #[serde(default = "default_pair_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_taker() -> String {
    "taker".to_string()
}

fn default_maker() -> String {
    "maker".to_string()
}

fn default_alpha_expiry_secs() -> u64 {
    7_200
}

fn default_beta_expiry_secs() -> u64 {
    3_600
}

fn default_pair_timeout_secs() -> u64 {
    120
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Int(u64),
    Str(String),
}

fn deserialize_quantity<'de, D>(deserializer: D) -> std::result::Result<u128, D::Error>
where
    D: Deserializer<'de>,
{
    match RawQuantity::deserialize(deserializer)? {
        RawQuantity::Int(value) => Ok(value as u128),
        RawQuantity::Str(value) => value.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl Settings {
    /// Load settings from the file named by `SWAP_COORDINATOR_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml_str(&config_str)
    }

    /// Parse and validate a TOML document, substituting `${VAR}` first
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.actor.name.trim().is_empty() {
            anyhow::bail!("Actor name must not be empty");
        }

        let engine = &self.engine;
        if engine.poll_interval_ms == 0 {
            anyhow::bail!("engine.poll_interval_ms must be positive");
        }
        if engine.action_timeout_ms < engine.poll_interval_ms {
            anyhow::bail!("engine.action_timeout_ms must be at least poll_interval_ms");
        }
        if engine.max_consecutive_failures == 0 {
            anyhow::bail!("engine.max_consecutive_failures must be positive");
        }
        if engine.retry_delay_ms > engine.max_retry_delay_ms {
            anyhow::bail!("engine.retry_delay_ms exceeds max_retry_delay_ms");
        }

        // At least one ledger must be enabled
        if self.enabled_ledgers().is_empty() {
            anyhow::bail!("At least one ledger must be enabled");
        }

        let mut seen = HashSet::new();
        for (name, ledger) in self.enabled_ledgers() {
            if !seen.insert(ledger.ledger()) {
                anyhow::bail!(
                    "Ledger {} duplicates {} {:?}",
                    name,
                    ledger.kind,
                    ledger.network
                );
            }
            if ledger.confirmations == 0 {
                anyhow::bail!("Ledger {} needs at least one confirmation", name);
            }
            if !ledger.instant_mining && ledger.block_interval_ms == 0 {
                anyhow::bail!("Ledger {} neither mines instantly nor has a block interval", name);
            }
            for balance in &ledger.balances {
                if ledger.kind == LedgerKind::Bitcoin && balance.contract.is_some() {
                    anyhow::bail!("Ledger {} is bitcoin but lists a token balance", name);
                }
            }
        }

        if let Some(pair) = &self.pair {
            self.validate_pair(pair)?;
        }

        Ok(())
    }

    fn validate_pair(&self, pair: &PairConfig) -> Result<()> {
        if pair.taker == pair.maker {
            anyhow::bail!("pair.taker and pair.maker must differ");
        }
        if pair.alpha_ledger == pair.beta_ledger {
            anyhow::bail!("pair.alpha_ledger and pair.beta_ledger must differ");
        }
        for (side, key, contract, quantity) in [
            ("alpha", &pair.alpha_ledger, &pair.alpha_contract, pair.alpha_quantity),
            ("beta", &pair.beta_ledger, &pair.beta_contract, pair.beta_quantity),
        ] {
            let ledger = self
                .ledgers
                .get(key)
                .filter(|l| l.enabled)
                .with_context(|| format!("pair.{}_ledger {} is not an enabled ledger", side, key))?;
            if quantity == 0 {
                anyhow::bail!("pair.{}_quantity must be positive", side);
            }
            if ledger.kind == LedgerKind::Bitcoin && contract.is_some() {
                anyhow::bail!("pair.{}_contract set on bitcoin ledger {}", side, key);
            }
        }
        if pair.beta_expiry_secs == 0 || pair.alpha_expiry_secs <= pair.beta_expiry_secs {
            anyhow::bail!("pair expiries must satisfy alpha_expiry_secs > beta_expiry_secs > 0");
        }
        if pair.timeout_secs == 0 {
            anyhow::bail!("pair.timeout_secs must be positive");
        }
        Ok(())
    }

    /// Get list of enabled ledgers
    pub fn enabled_ledgers(&self) -> Vec<(&String, &LedgerConfig)> {
        let mut ledgers: Vec<_> = self.ledgers.iter().filter(|(_, l)| l.enabled).collect();
        ledgers.sort_by(|a, b| a.0.cmp(b.0));
        ledgers
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| {
            env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
