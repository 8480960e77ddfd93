// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Every tunable the orchestrator, account engine, and execution layer read
// lives here so the engine can be reconfigured without a restart. Fields
// all carry `#[serde(default)]` so that adding a field never breaks loading
// an older config file on disk.
//
// Persistence uses the same atomic tmp + rename pattern as the rest of this
// engine's persisted state, to avoid corruption on crash mid-write.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."`)
// =============================================================================

fn default_true() -> bool {
    true
}
fn default_entry_interval_secs() -> u64 {
    30
}
fn default_notional_usd() -> f64 {
    1000.0
}
fn default_min_funding_rate() -> f64 {
    0.0001
}
fn default_funding_confirmations() -> u32 {
    3
}
fn default_funding_dip_confirmations() -> u32 {
    3
}
fn default_fee_bps() -> f64 {
    2.0
}
fn default_slippage_bps() -> f64 {
    2.0
}
fn default_ioc_price_bps() -> f64 {
    10.0
}
fn default_delta_band_usd() -> f64 {
    50.0
}
fn default_min_exposure_usd() -> f64 {
    10.0
}
fn default_exit_funding_guard_secs() -> u64 {
    120
}
fn default_spot_reconcile_interval_secs() -> u64 {
    60
}
fn default_rest_timeout_ms() -> u64 {
    10_000
}
fn default_entry_timeout_ms() -> u64 {
    15_000
}
fn default_entry_poll_interval_ms() -> u64 {
    500
}
fn default_candle_window() -> usize {
    60
}
fn default_max_volatility() -> f64 {
    0.05
}
fn default_base_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}
fn default_max_notional_usd() -> f64 {
    5000.0
}
fn default_max_open_orders() -> u32 {
    10
}
fn default_min_margin_ratio() -> f64 {
    0.15
}
fn default_min_health_ratio() -> f64 {
    0.2
}
fn default_max_market_age_secs() -> u64 {
    60
}
fn default_max_account_age_secs() -> u64 {
    60
}

// =============================================================================
// Network
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Default for Network {
    fn default() -> Self {
        Self::Mainnet
    }
}

impl Network {
    /// EIP-712 `Agent.source` discriminator (spec §4.1).
    pub fn agent_source(self) -> &'static str {
        match self {
            Network::Mainnet => "a",
            Network::Testnet => "b",
        }
    }

    /// `hyperliquidChain` field on user-signed actions like `usdClassTransfer`.
    pub fn hyperliquid_chain(self) -> &'static str {
        match self {
            Network::Mainnet => "Mainnet",
            Network::Testnet => "Testnet",
        }
    }
}

// =============================================================================
// RiskLimits — operator-adjustable subset (spec §6 `risk set`/`risk reset`)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskLimits {
    #[serde(default = "default_max_notional_usd")]
    pub max_notional_usd: f64,
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders: u32,
    #[serde(default = "default_min_margin_ratio")]
    pub min_margin_ratio: f64,
    #[serde(default = "default_min_health_ratio")]
    pub min_health_ratio: f64,
    #[serde(default = "default_max_market_age_secs")]
    pub max_market_age_secs: u64,
    #[serde(default = "default_max_account_age_secs")]
    pub max_account_age_secs: u64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_notional_usd: default_max_notional_usd(),
            max_open_orders: default_max_open_orders(),
            min_margin_ratio: default_min_margin_ratio(),
            min_health_ratio: default_min_health_ratio(),
            max_market_age_secs: default_max_market_age_secs(),
            max_account_age_secs: default_max_account_age_secs(),
        }
    }
}

impl RiskLimits {
    /// Apply `key=value` pairs from an operator `risk set` command. Unknown
    /// keys are reported but do not abort the whole batch.
    pub fn apply_overrides(&mut self, pairs: &[(String, String)]) -> Vec<String> {
        let mut rejected = Vec::new();
        for (k, v) in pairs {
            let parsed_f64 = v.parse::<f64>();
            let parsed_u32 = v.parse::<u32>();
            let parsed_u64 = v.parse::<u64>();
            match k.as_str() {
                "max_notional_usd" => match parsed_f64 {
                    Ok(f) => self.max_notional_usd = f,
                    Err(_) => rejected.push(k.clone()),
                },
                "max_open_orders" => match parsed_u32 {
                    Ok(n) => self.max_open_orders = n,
                    Err(_) => rejected.push(k.clone()),
                },
                "min_margin_ratio" => match parsed_f64 {
                    Ok(f) => self.min_margin_ratio = f,
                    Err(_) => rejected.push(k.clone()),
                },
                "min_health_ratio" => match parsed_f64 {
                    Ok(f) => self.min_health_ratio = f,
                    Err(_) => rejected.push(k.clone()),
                },
                "max_market_age" | "max_market_age_secs" => match parsed_u64 {
                    Ok(n) => self.max_market_age_secs = n,
                    Err(_) => rejected.push(k.clone()),
                },
                "max_account_age" | "max_account_age_secs" => match parsed_u64 {
                    Ok(n) => self.max_account_age_secs = n,
                    Err(_) => rejected.push(k.clone()),
                },
                other => rejected.push(other.to_string()),
            }
        }
        rejected
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Identity / venue ----------------------------------------------
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub network: Network,
    #[serde(default)]
    pub vault_address: Option<String>,
    #[serde(default)]
    pub spot_symbol: String,
    #[serde(default)]
    pub perp_symbol: String,

    // --- Operational mode ------------------------------------------------
    #[serde(default)]
    pub paused: bool,

    // --- Tick cadence and sizing ------------------------------------------
    #[serde(default = "default_entry_interval_secs")]
    pub entry_interval_secs: u64,
    #[serde(default = "default_notional_usd")]
    pub notional_usd: f64,
    #[serde(default = "default_candle_window")]
    pub candle_window: usize,
    #[serde(default = "default_max_volatility")]
    pub max_volatility: f64,

    // --- Funding / carry thresholds -----------------------------------
    #[serde(default = "default_min_funding_rate")]
    pub min_funding_rate: f64,
    #[serde(default = "default_funding_confirmations")]
    pub funding_confirmations: u32,
    #[serde(default = "default_funding_dip_confirmations")]
    pub funding_dip_confirmations: u32,
    #[serde(default)]
    pub carry_buffer_usd: f64,
    #[serde(default = "default_fee_bps")]
    pub fee_bps: f64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: f64,
    #[serde(default = "default_ioc_price_bps")]
    pub ioc_price_bps: f64,

    // --- Delta band / rebalance -----------------------------------------
    #[serde(default = "default_delta_band_usd")]
    pub delta_band_usd: f64,
    #[serde(default = "default_min_exposure_usd")]
    pub min_exposure_usd: f64,

    // --- Exit-on-funding-dip + funding guard -----------------------------
    #[serde(default = "default_true")]
    pub exit_on_funding_dip: bool,
    #[serde(default = "default_true")]
    pub exit_funding_guard_enabled: bool,
    #[serde(default = "default_exit_funding_guard_secs")]
    pub exit_funding_guard_secs: u64,

    // --- Timings ---------------------------------------------------------
    #[serde(default = "default_spot_reconcile_interval_secs")]
    pub spot_reconcile_interval_secs: u64,
    #[serde(default = "default_rest_timeout_ms")]
    pub rest_timeout_ms: u64,
    #[serde(default = "default_entry_timeout_ms")]
    pub entry_timeout_ms: u64,
    #[serde(default = "default_entry_poll_interval_ms")]
    pub entry_poll_interval_ms: u64,

    // --- Risk limits (operator-adjustable) --------------------------------
    #[serde(default)]
    pub risk: RiskLimits,

    // --- Operator surface --------------------------------------------------
    #[serde(default)]
    pub operator_allowed_user_ids: Vec<i64>,
    #[serde(default)]
    pub telegram_chat_id: Option<i64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            network: Network::default(),
            vault_address: None,
            spot_symbol: "PURR/USDC".to_string(),
            perp_symbol: "PURR".to_string(),
            paused: false,
            entry_interval_secs: default_entry_interval_secs(),
            notional_usd: default_notional_usd(),
            candle_window: default_candle_window(),
            max_volatility: default_max_volatility(),
            min_funding_rate: default_min_funding_rate(),
            funding_confirmations: default_funding_confirmations(),
            funding_dip_confirmations: default_funding_dip_confirmations(),
            carry_buffer_usd: 0.0,
            fee_bps: default_fee_bps(),
            slippage_bps: default_slippage_bps(),
            ioc_price_bps: default_ioc_price_bps(),
            delta_band_usd: default_delta_band_usd(),
            min_exposure_usd: default_min_exposure_usd(),
            exit_on_funding_dip: true,
            exit_funding_guard_enabled: true,
            exit_funding_guard_secs: default_exit_funding_guard_secs(),
            spot_reconcile_interval_secs: default_spot_reconcile_interval_secs(),
            rest_timeout_ms: default_rest_timeout_ms(),
            entry_timeout_ms: default_entry_timeout_ms(),
            entry_poll_interval_ms: default_entry_poll_interval_ms(),
            risk: RiskLimits::default(),
            operator_allowed_user_ids: Vec::new(),
            telegram_chat_id: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), base_url = %config.base_url, "runtime config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise runtime config")?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        Ok(())
    }
}

// =============================================================================
// CLI surface (spec §6)
// =============================================================================

/// HyperBasis — delta-neutral carry trader.
#[derive(Debug, Parser)]
#[command(name = "hyperbasis", version, about)]
pub struct Cli {
    /// Path to the runtime config JSON file.
    pub config: PathBuf,

    /// Exchange wallet address that owns the account being traded.
    #[arg(long, env = "HL_WALLET_ADDRESS")]
    pub wallet_address: String,

    /// Private key used to sign exchange actions.
    #[arg(long, env = "HL_PRIVATE_KEY")]
    pub private_key: String,

    /// Optional sub-account address, if trading on behalf of one.
    #[arg(long, env = "HL_ACCOUNT_ADDRESS")]
    pub account_address: Option<String>,

    /// Optional vault address, if trading through a vault.
    #[arg(long, env = "HL_VAULT_ADDRESS")]
    pub vault_address: Option<String>,

    /// Telegram bot token for the operator alert channel.
    #[arg(long, env = "HL_TELEGRAM_TOKEN")]
    pub telegram_token: Option<String>,

    /// Telegram chat id the operator commands are read from.
    #[arg(long, env = "HL_TELEGRAM_CHAT_ID")]
    pub telegram_chat_id: Option<i64>,

    /// TimescaleDB DSN for the metrics sink. Absent disables the sink.
    #[arg(long, env = "HL_TIMESCALE_DSN")]
    pub timescale_dsn: Option<String>,

    /// SQLite database file backing the key/value store.
    #[arg(long, env = "HL_DB_PATH", default_value = "hyperbasis.db")]
    pub db_path: PathBuf,

    /// Bind address for the Prometheus metrics exporter.
    #[arg(long, env = "HL_METRICS_ADDR", default_value = "0.0.0.0:9100")]
    pub metrics_addr: String,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.entry_interval_secs, 30);
        assert!((cfg.notional_usd - 1000.0).abs() < f64::EPSILON);
        assert!(cfg.exit_on_funding_dip);
        assert!(cfg.exit_funding_guard_enabled);
        assert_eq!(cfg.risk.max_open_orders, 10);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.entry_interval_secs, 30);
        assert_eq!(cfg.risk.max_notional_usd, 5000.0);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "notional_usd": 2500.0, "spot_symbol": "ETH/USDC" }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.notional_usd, 2500.0);
        assert_eq!(cfg.spot_symbol, "ETH/USDC");
        assert_eq!(cfg.funding_confirmations, 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.notional_usd, cfg2.notional_usd);
        assert_eq!(cfg.risk, cfg2.risk);
    }

    #[test]
    fn risk_set_applies_known_keys_and_rejects_unknown() {
        let mut risk = RiskLimits::default();
        let pairs = vec![
            ("max_notional_usd".to_string(), "9000".to_string()),
            ("max_open_orders".to_string(), "4".to_string()),
            ("bogus_key".to_string(), "1".to_string()),
        ];
        let rejected = risk.apply_overrides(&pairs);
        assert_eq!(risk.max_notional_usd, 9000.0);
        assert_eq!(risk.max_open_orders, 4);
        assert_eq!(rejected, vec!["bogus_key".to_string()]);
    }

    #[test]
    fn risk_reset_restores_defaults() {
        let mut risk = RiskLimits::default();
        risk.apply_overrides(&[("max_notional_usd".to_string(), "1".to_string())]);
        assert_ne!(risk, RiskLimits::default());
        risk = RiskLimits::default();
        assert_eq!(risk, RiskLimits::default());
    }

    #[test]
    fn network_agent_source() {
        assert_eq!(Network::Mainnet.agent_source(), "a");
        assert_eq!(Network::Testnet.agent_source(), "b");
    }

    #[test]
    fn network_hyperliquid_chain() {
        assert_eq!(Network::Mainnet.hyperliquid_chain(), "Mainnet");
        assert_eq!(Network::Testnet.hyperliquid_chain(), "Testnet");
    }
}
