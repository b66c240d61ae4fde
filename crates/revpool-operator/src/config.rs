//! Operator configuration: TOML file plus environment overrides.
//!
//! The file carries the per-community settings (contracts, fee, freeze
//! window); the environment carries deployment knobs so the same file works
//! across environments. `REVPOOL_*` variables override their file
//! counterparts.

use std::env;
use std::fs;
use std::path::Path;

use alloy_primitives::{Address, U256};
use serde::Deserialize;
use thiserror::Error;

use revpool_core::FEE_SCALE;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid admin fee {0:?}: {1}")]
    InvalidFee(String, String),

    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

/// Raw operator configuration as read from disk / environment.
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Hex signing key of the operator wallet. Only threaded through to the
    /// transaction sender; the core never touches it.
    pub operator_key: Option<String>,

    /// ERC-20 token whose transfers into the vault are revenue.
    pub token_address: Address,

    /// The community vault contract watched for events.
    pub community_address: Address,

    /// Freeze window between commit and withdrawal, seconds.
    #[serde(default = "default_block_freeze")]
    pub block_freeze_seconds: u64,

    /// Admin fee as a decimal fraction string, e.g. "0.2". Converted to the
    /// 1e18-scaled integer form with string arithmetic; never floats.
    #[serde(default = "default_admin_fee")]
    pub admin_fee: String,

    /// Chain JSON-RPC endpoint.
    #[serde(default = "default_chain_url")]
    pub chain_url: String,

    /// Chain network name; "mainnet" enables the bundled timestamp
    /// cold cache.
    #[serde(default = "default_chain_network")]
    pub chain_network: String,

    /// Base URL of the join/part channel node.
    #[serde(default = "default_channel_url")]
    pub channel_url: String,

    /// Persistence directory.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Log only warnings and errors.
    #[serde(default)]
    pub quiet: bool,

    /// Wipe persisted state and resync from the contract's genesis.
    #[serde(default)]
    pub reset: bool,
}

fn default_block_freeze() -> u64 {
    1000
}

fn default_admin_fee() -> String {
    "0".to_string()
}

fn default_chain_url() -> String {
    "http://127.0.0.1:8545".to_string()
}

fn default_chain_network() -> String {
    "local".to_string()
}

fn default_channel_url() -> String {
    "http://127.0.0.1:8890".to_string()
}

fn default_store_dir() -> String {
    "./revpool-data".to_string()
}

impl OperatorConfig {
    /// Load from a TOML file, then apply `REVPOOL_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let mut cfg: OperatorConfig = toml::from_str(&raw)?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Environment overrides for deployment knobs.
    pub fn apply_env(&mut self) {
        if let Ok(v) = env::var("REVPOOL_CHAIN_URL") {
            self.chain_url = v;
        }
        if let Ok(v) = env::var("REVPOOL_CHAIN_NETWORK") {
            self.chain_network = v;
        }
        if let Ok(v) = env::var("REVPOOL_CHANNEL_URL") {
            self.channel_url = v;
        }
        if let Ok(v) = env::var("REVPOOL_STORE_DIR") {
            self.store_dir = v;
        }
        if let Ok(v) = env::var("REVPOOL_QUIET") {
            self.quiet = is_truthy(&v);
        }
        if let Ok(v) = env::var("REVPOOL_RESET") {
            self.reset = is_truthy(&v);
        }
    }

    /// The 1e18-scaled admin fee fraction.
    pub fn admin_fee_scaled(&self) -> Result<U256, ConfigError> {
        parse_fee_fraction(&self.admin_fee)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Parse a decimal fraction in `[0, 1]` (e.g. `"0.2"`, `"1"`, `".05"`) into
/// its 1e18-scaled integer form without going through floating point.
pub fn parse_fee_fraction(input: &str) -> Result<U256, ConfigError> {
    let bad = |why: &str| ConfigError::InvalidFee(input.to_string(), why.to_string());

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(bad("empty"));
    }
    let (whole, frac) = match trimmed.split_once('.') {
        Some((w, f)) => (w, f),
        None => (trimmed, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(bad("no digits"));
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad("non-digit characters"));
    }
    if frac.len() > 18 {
        return Err(bad("more than 18 fractional digits"));
    }

    let whole_units: u64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| bad("whole part out of range"))?
    };
    let mut padded = frac.to_string();
    while padded.len() < 18 {
        padded.push('0');
    }
    let frac_units: u64 = padded
        .parse()
        .map_err(|_| bad("fractional part out of range"))?;

    let scaled = U256::from(whole_units)
        .checked_mul(U256::from(FEE_SCALE))
        .and_then(|w| w.checked_add(U256::from(frac_units)))
        .ok_or_else(|| bad("overflow"))?;
    if scaled > U256::from(FEE_SCALE) {
        return Err(bad("fraction above 1"));
    }
    Ok(scaled)
}
