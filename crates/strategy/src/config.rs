use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use common::{ConfigCurrencyPair, CurrencyPair, Error, Result, ServerConfig};

use crate::registry::StrategyRegistry;

/// Trade configuration file (TOML).
///
/// Example `config/trading.toml`:
/// ```toml
/// [[config]]
/// markets = ["BTC_USDT", "ETH_USDT"]
/// exchanges = ["paper"]
/// trade_amount = 0.01
///
/// [[config.strategy]]
/// type = "rsi"
/// candle_size = 15
/// save_state = true
///
/// [config.strategy.params]
/// period = 14
/// oversold = 30.0
///
/// [[config.strategy]]
/// type = "stop_loss"
/// pair = "BTC_USDT"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradeConfigFile {
    #[serde(rename = "config")]
    pub configs: Vec<TradeConfigEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TradeConfigEntry {
    /// Currency pairs traded by this configuration, e.g. "BTC_USDT".
    pub markets: Vec<String>,
    pub exchanges: Vec<String>,
    /// Order size in base units handed to the trader.
    #[serde(default)]
    pub trade_amount: Option<f64>,
    #[serde(rename = "strategy", default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Registry kind tag, e.g. "rsi".
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Restrict the strategy to one market. All markets when omitted.
    #[serde(default)]
    pub pair: Option<String>,
    /// Candle interval in minutes, or "default". No candle ticks when omitted.
    #[serde(default)]
    pub candle_size: Option<CandleSize>,
    #[serde(default)]
    pub save_state: bool,
    #[serde(default)]
    pub enable_log: bool,
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CandleSize {
    Minutes(u32),
    Named(String),
}

impl CandleSize {
    pub fn resolve(&self, default_minutes: u32) -> Result<u32> {
        match self {
            CandleSize::Minutes(0) => Err(Error::Config("candle_size must be at least 1 minute".into())),
            CandleSize::Minutes(m) => Ok(*m),
            CandleSize::Named(name) if name.eq_ignore_ascii_case("default") => Ok(default_minutes),
            CandleSize::Named(other) => Err(Error::Config(format!("unknown candle_size '{other}'"))),
        }
    }
}

/// One configuration after validation.
#[derive(Debug, Clone)]
pub struct TradeConfig {
    /// 1-based configuration index.
    pub index: usize,
    pub markets: Vec<CurrencyPair>,
    pub exchanges: Vec<String>,
    pub trade_amount: Option<f64>,
    pub strategies: Vec<ResolvedStrategy>,
}

/// A strategy bound to one ConfigCurrencyPair.
#[derive(Debug, Clone)]
pub struct ResolvedStrategy {
    pub kind: String,
    pub config_pair: ConfigCurrencyPair,
    pub candle_size: Option<u32>,
    pub save_state: bool,
    pub enable_log: bool,
    /// First strategy configured for its pair.
    pub is_main: bool,
    pub params: HashMap<String, toml::Value>,
}

impl TradeConfigFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read trade config at '{}': {e}", path.display())))?;
        let file = Self::parse(&content)?;
        info!(path = %path.display(), configs = file.configs.len(), "Loaded trade configuration");
        Ok(file)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse trade config: {e}")))
    }

    /// Check every entry and expand strategies per market. Nothing is
    /// returned unless the whole file is valid.
    pub fn validate(&self, registry: &StrategyRegistry, server: &ServerConfig) -> Result<Vec<TradeConfig>> {
        if self.configs.is_empty() {
            return Err(Error::Config("trade config contains no [[config]] entry".into()));
        }
        self.configs
            .iter()
            .enumerate()
            .map(|(i, entry)| entry.validate(i + 1, registry, server))
            .collect()
    }
}

impl TradeConfigEntry {
    fn validate(&self, index: usize, registry: &StrategyRegistry, server: &ServerConfig) -> Result<TradeConfig> {
        let err = |msg: String| Error::Config(format!("config #{index}: {msg}"));

        if self.markets.is_empty() {
            return Err(err("no markets configured".into()));
        }
        let mut markets: Vec<CurrencyPair> = Vec::with_capacity(self.markets.len());
        for market in &self.markets {
            let pair: CurrencyPair = market.parse()?;
            if markets.contains(&pair) {
                return Err(err(format!("market {pair} listed twice")));
            }
            markets.push(pair);
        }

        let distinct: HashSet<&str> = self.exchanges.iter().map(String::as_str).collect();
        if distinct.len() != self.exchanges.len() {
            return Err(err("duplicate exchange".into()));
        }
        match (server.arbitrage, self.exchanges.len()) {
            (true, 2) | (false, 1) => {}
            (true, n) => return Err(err(format!("arbitrage mode needs exactly 2 exchanges, got {n}"))),
            (false, n) => return Err(err(format!("exactly 1 exchange required outside arbitrage mode, got {n}"))),
        }

        if let Some(amount) = self.trade_amount {
            if !amount.is_finite() || amount <= 0.0 {
                return Err(err(format!("trade_amount must be positive, got {amount}")));
            }
        }

        if self.strategies.is_empty() {
            return Err(err("no strategies configured".into()));
        }

        let mut strategies: Vec<ResolvedStrategy> = Vec::new();
        for cfg in &self.strategies {
            if !registry.contains(&cfg.strategy_type) {
                return Err(Error::UnknownStrategy(cfg.strategy_type.clone()));
            }
            let candle_size = cfg
                .candle_size
                .as_ref()
                .map(|size| size.resolve(server.default_candle_size))
                .transpose()
                .map_err(|e| err(format!("strategy '{}': {e}", cfg.strategy_type)))?;

            let pairs = match &cfg.pair {
                Some(pair) => {
                    let pair: CurrencyPair = pair.parse()?;
                    if !markets.contains(&pair) {
                        return Err(err(format!(
                            "strategy '{}' trades {pair} which is not among the markets",
                            cfg.strategy_type
                        )));
                    }
                    vec![pair]
                }
                None => markets.clone(),
            };

            for pair in pairs {
                let config_pair = ConfigCurrencyPair::new(index, pair);
                if strategies
                    .iter()
                    .any(|s| s.kind == cfg.strategy_type && s.config_pair == config_pair)
                {
                    return Err(err(format!(
                        "strategy '{}' configured twice for {}",
                        cfg.strategy_type, config_pair.pair
                    )));
                }
                let is_main = !strategies.iter().any(|s| s.config_pair == config_pair);
                strategies.push(ResolvedStrategy {
                    kind: cfg.strategy_type.clone(),
                    config_pair,
                    candle_size,
                    save_state: cfg.save_state,
                    enable_log: cfg.enable_log,
                    is_main,
                    params: cfg.params.clone(),
                });
            }
        }

        if let Some(idle) = markets
            .iter()
            .find(|m| !strategies.iter().any(|s| &s.config_pair.pair == *m))
        {
            return Err(err(format!("market {idle} has no strategy")));
        }

        Ok(TradeConfig {
            index,
            markets,
            exchanges: self.exchanges.clone(),
            trade_amount: self.trade_amount,
            strategies,
        })
    }
}
