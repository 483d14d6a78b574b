use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// An ordered pair of asset symbols. Canonical form is `BASE_QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into().to_uppercase(),
            quote: quote.into().to_uppercase(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(['_', '/', '-']);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
                Ok(Self::new(base, quote))
            }
            _ => Err(Error::Config(format!("invalid currency pair '{s}'"))),
        }
    }
}

impl TryFrom<String> for CurrencyPair {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CurrencyPair> for String {
    fn from(pair: CurrencyPair) -> Self {
        pair.to_string()
    }
}

/// A currency pair traded under one configuration entry. Indices start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigCurrencyPair {
    pub config: usize,
    pub pair: CurrencyPair,
}

impl ConfigCurrencyPair {
    pub fn new(config: usize, pair: CurrencyPair) -> Self {
        Self { config, pair }
    }

    /// Same pair under another configuration index.
    pub fn with_config(&self, config: usize) -> Self {
        Self {
            config,
            pair: self.pair.clone(),
        }
    }
}

impl fmt::Display for ConfigCurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.config, self.pair)
    }
}

impl FromStr for ConfigCurrencyPair {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (config, pair) = s
            .split_once('-')
            .ok_or_else(|| Error::Config(format!("invalid config currency pair '{s}'")))?;
        let config = config
            .parse()
            .map_err(|_| Error::Config(format!("invalid config index in '{s}'")))?;
        Ok(Self::new(config, pair.parse()?))
    }
}

/// Side of a raw market trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

/// A single decoded market trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub price: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
    pub side: TradeSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
}

impl Trade {
    pub fn new(price: f64, volume: f64, timestamp: DateTime<Utc>, side: TradeSide) -> Self {
        Self {
            price,
            volume,
            timestamp,
            side,
            exchange: None,
        }
    }
}

/// Volume-weighted average price of a batch. Falls back to the plain mean
/// when the batch carries no volume.
pub fn volume_weighted_price(trades: &[Trade]) -> Option<f64> {
    if trades.is_empty() {
        return None;
    }
    let volume: f64 = trades.iter().map(|t| t.volume).sum();
    if volume > 0.0 {
        Some(trades.iter().map(|t| t.price * t.volume).sum::<f64>() / volume)
    } else {
        Some(trades.iter().map(|t| t.price).sum::<f64>() / trades.len() as f64)
    }
}

/// Direction of a candle body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    #[default]
    #[serde(rename = "none")]
    Flat,
}

/// OHLCV aggregate over one time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub pair: CurrencyPair,
    pub start: DateTime<Utc>,
    /// Bucket length in minutes.
    pub interval: u32,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Volume-weighted price.
    pub vwp: f64,
    pub trades: u64,
    #[serde(default)]
    pub trend: Trend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_data: Option<Vec<Trade>>,
}

impl Candle {
    /// A candle opened by its first trade.
    pub fn open_with(pair: CurrencyPair, start: DateTime<Utc>, interval: u32, trade: &Trade) -> Self {
        let mut candle = Self {
            pair,
            start,
            interval,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.volume,
            vwp: trade.price,
            trades: 1,
            trend: Trend::Flat,
            trade_data: None,
        };
        candle.compute_trend();
        candle
    }

    /// A candle for a bucket without trades, flat at `price`.
    pub fn empty(pair: CurrencyPair, start: DateTime<Utc>, interval: u32, price: f64) -> Self {
        Self {
            pair,
            start,
            interval,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
            vwp: price,
            trades: 0,
            trend: Trend::Flat,
            trade_data: None,
        }
    }

    pub fn compute_trend(&mut self) {
        self.trend = if self.close > self.open {
            Trend::Up
        } else if self.close < self.open {
            Trend::Down
        } else {
            Trend::Flat
        };
    }

    /// Start of the bucket following this one.
    pub fn end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::minutes(i64::from(self.interval))
    }

    /// Copy without embedded raw trades.
    pub fn without_trade_data(&self) -> Self {
        Self {
            trade_data: None,
            ..self.clone()
        }
    }
}

/// Decoded exchange feed event for one currency pair.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Trades {
        exchange: String,
        pair: CurrencyPair,
        trades: Vec<Trade>,
    },
    /// Native 1-minute candles from candle-based feeds.
    Candles {
        exchange: String,
        pair: CurrencyPair,
        candles: Vec<Candle>,
    },
}

impl MarketEvent {
    pub fn pair(&self) -> &CurrencyPair {
        match self {
            MarketEvent::Trades { pair, .. } | MarketEvent::Candles { pair, .. } => pair,
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            MarketEvent::Trades { exchange, .. } | MarketEvent::Candles { exchange, .. } => exchange,
        }
    }
}

/// What a strategy recommends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Buy,
    Sell,
    Hold,
    Close,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Buy => write!(f, "buy"),
            ActionKind::Sell => write!(f, "sell"),
            ActionKind::Hold => write!(f, "hold"),
            ActionKind::Close => write!(f, "close"),
        }
    }
}

/// Stable index of a strategy instance inside the advisor's strategy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrategyId(pub usize);

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of the strategy instance an action originates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyRef {
    pub id: StrategyId,
    /// Registry kind tag, e.g. "rsi".
    pub name: String,
    pub config_pair: ConfigCurrencyPair,
    pub is_main: bool,
}

/// A weighted recommendation emitted by a strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub kind: ActionKind,
    pub weight: f64,
    pub reason: String,
    pub exchange: Option<String>,
    pub strategy: StrategyRef,
}

impl Action {
    /// Weight that bypasses arbitration and executes immediately.
    pub const MAX_WEIGHT: f64 = f64::MAX;

    pub fn is_max_weight(&self) -> bool {
        self.weight == Self::MAX_WEIGHT
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.strategy.config_pair.pair
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trade(price: f64, volume: f64) -> Trade {
        Trade::new(price, volume, Utc.timestamp_opt(0, 0).unwrap(), TradeSide::Buy)
    }

    #[test]
    fn pair_parses_common_separators() {
        let expected = CurrencyPair::new("btc", "usdt");
        assert_eq!("BTC_USDT".parse::<CurrencyPair>().unwrap(), expected);
        assert_eq!("btc/usdt".parse::<CurrencyPair>().unwrap(), expected);
        assert_eq!("BTC-USDT".parse::<CurrencyPair>().unwrap(), expected);
        assert_eq!(expected.to_string(), "BTC_USDT");
    }

    #[test]
    fn pair_rejects_garbage() {
        assert!("BTCUSDT".parse::<CurrencyPair>().is_err());
        assert!("A_B_C".parse::<CurrencyPair>().is_err());
        assert!("_USDT".parse::<CurrencyPair>().is_err());
    }

    #[test]
    fn config_pair_string_form() {
        let key = ConfigCurrencyPair::new(2, CurrencyPair::new("ETH", "BTC"));
        assert_eq!(key.to_string(), "2-ETH_BTC");
        assert_eq!("2-ETH_BTC".parse::<ConfigCurrencyPair>().unwrap(), key);
        assert_eq!(key.with_config(1).to_string(), "1-ETH_BTC");
    }

    #[test]
    fn pair_serializes_as_string() {
        let json = serde_json::to_string(&CurrencyPair::new("BTC", "USDT")).unwrap();
        assert_eq!(json, "\"BTC_USDT\"");
        let back: CurrencyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(back, CurrencyPair::new("BTC", "USDT"));
    }

    #[test]
    fn trend_follows_body() {
        let pair = CurrencyPair::new("BTC", "USDT");
        let mut candle = Candle::empty(pair, Utc.timestamp_opt(0, 0).unwrap(), 1, 10.0);
        assert_eq!(candle.trend, Trend::Flat);
        candle.close = 11.0;
        candle.compute_trend();
        assert_eq!(candle.trend, Trend::Up);
        candle.close = 9.0;
        candle.compute_trend();
        assert_eq!(candle.trend, Trend::Down);
    }

    #[test]
    fn vwap_falls_back_to_mean_without_volume() {
        assert_eq!(volume_weighted_price(&[]), None);
        let weighted = volume_weighted_price(&[trade(10.0, 1.0), trade(20.0, 3.0)]).unwrap();
        assert!((weighted - 17.5).abs() < 1e-9);
        let mean = volume_weighted_price(&[trade(10.0, 0.0), trade(20.0, 0.0)]).unwrap();
        assert!((mean - 15.0).abs() < 1e-9);
    }
}
