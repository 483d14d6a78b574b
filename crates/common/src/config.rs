use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How trade batches of several exchanges for the same pair are merged
/// before they reach strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanInPolicy {
    /// Forward every exchange's batch unchanged.
    #[default]
    Concatenate,
    /// Collapse every batch into one trade at the batch VWAP.
    VolumeWeighted,
}

impl FromStr for FanInPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "concatenate" => Ok(FanInPolicy::Concatenate),
            "volume_weighted" => Ok(FanInPolicy::VolumeWeighted),
            other => Err(Error::Config(format!(
                "TRADE_FAN_IN must be 'concatenate' or 'volume_weighted', got: '{other}'"
            ))),
        }
    }
}

/// Process-wide settings loaded from environment variables at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Files
    pub trade_config_path: String,
    pub feed_path: Option<String>,
    pub checkpoint_path: Option<String>,

    // Candles
    pub keep_candles: usize,
    pub keep_1min_candles: usize,
    pub default_candle_size: u32,
    pub embed_trades: bool,
    /// Longest run of empty 1-minute candles filled between two trades.
    pub max_gap_minutes: u32,

    // Arbitration and routing
    pub main_strategy_always_trade: bool,
    pub arbitrage: bool,
    pub forward_trades_sec: u64,
    pub trade_fan_in: FanInPolicy,
    pub search_all_pairs_for_state: bool,

    // Process
    pub heartbeat_sec: u64,

    // Paper trading
    pub paper_balance: f64,
    pub paper_slippage_bps: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            trade_config_path: "config/trading.toml".to_string(),
            feed_path: None,
            checkpoint_path: None,
            keep_candles: 100,
            keep_1min_candles: 2880,
            default_candle_size: 60,
            embed_trades: false,
            max_gap_minutes: 1440,
            main_strategy_always_trade: false,
            arbitrage: false,
            forward_trades_sec: 0,
            trade_fan_in: FanInPolicy::Concatenate,
            search_all_pairs_for_state: false,
            heartbeat_sec: 10,
            paper_balance: 10_000.0,
            paper_slippage_bps: 10.0,
        }
    }
}

impl ServerConfig {
    /// Load from environment variables. Loads `.env` if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys keep their defaults,
    /// set but unparsable keys are configuration errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let cfg = ServerConfig {
            trade_config_path: lookup("TRADE_CONFIG_PATH").unwrap_or(defaults.trade_config_path),
            feed_path: lookup("FEED_PATH"),
            checkpoint_path: lookup("CHECKPOINT_PATH"),
            keep_candles: parsed(&lookup, "KEEP_CANDLES")?.unwrap_or(defaults.keep_candles),
            keep_1min_candles: parsed(&lookup, "KEEP_1MIN_CANDLES")?
                .unwrap_or(defaults.keep_1min_candles),
            default_candle_size: parsed(&lookup, "DEFAULT_CANDLE_SIZE")?
                .unwrap_or(defaults.default_candle_size),
            embed_trades: flag(&lookup, "EMBED_TRADES")?.unwrap_or(defaults.embed_trades),
            max_gap_minutes: parsed(&lookup, "MAX_GAP_MINUTES")?.unwrap_or(defaults.max_gap_minutes),
            main_strategy_always_trade: flag(&lookup, "MAIN_STRATEGY_ALWAYS_TRADE")?
                .unwrap_or(defaults.main_strategy_always_trade),
            arbitrage: flag(&lookup, "ARBITRAGE")?.unwrap_or(defaults.arbitrage),
            forward_trades_sec: parsed(&lookup, "FORWARD_TRADES_SEC")?
                .unwrap_or(defaults.forward_trades_sec),
            trade_fan_in: parsed(&lookup, "TRADE_FAN_IN")?.unwrap_or(defaults.trade_fan_in),
            search_all_pairs_for_state: flag(&lookup, "SEARCH_ALL_PAIRS_FOR_STATE")?
                .unwrap_or(defaults.search_all_pairs_for_state),
            heartbeat_sec: parsed(&lookup, "HEARTBEAT_SEC")?.unwrap_or(defaults.heartbeat_sec),
            paper_balance: parsed(&lookup, "PAPER_BALANCE")?.unwrap_or(defaults.paper_balance),
            paper_slippage_bps: parsed(&lookup, "PAPER_SLIPPAGE_BPS")?
                .unwrap_or(defaults.paper_slippage_bps),
        };

        if cfg.keep_candles == 0 {
            return Err(Error::Config("KEEP_CANDLES must be at least 1".into()));
        }
        if cfg.default_candle_size == 0 {
            return Err(Error::Config("DEFAULT_CANDLE_SIZE must be at least 1".into()));
        }
        Ok(cfg)
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("environment variable '{key}' has invalid value '{raw}'"))),
    }
}

fn flag<F>(lookup: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(None),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes") => Ok(Some(true)),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no") => Ok(Some(false)),
        Some(v) => Err(Error::Config(format!("environment variable '{key}' is not a boolean: '{v}'"))),
    }
}
