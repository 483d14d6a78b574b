use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::warn;

use common::{volume_weighted_price, Candle, CurrencyPair, Trade, Trend};

/// Market view of one strategy instance, maintained by its runtime.
#[derive(Debug, Clone)]
pub struct MarketState {
    pair: CurrencyPair,
    candle_size: Option<u32>,
    keep_candles: usize,
    keep_1min_candles: usize,

    market_price: Option<f64>,
    last_market_price: Option<f64>,
    avg_market_price: Option<f64>,
    last_avg_market_price: Option<f64>,
    market_time: Option<DateTime<Utc>>,
    exchange: Option<String>,

    /// Closed candles of `candle_size`, newest first.
    candle_history: VecDeque<Candle>,
    /// Closed 1-minute candles, oldest first.
    candles_1min: VecDeque<Candle>,
    current_candle: Option<Candle>,
    candle_ticks: u64,
}

impl MarketState {
    pub fn new(pair: CurrencyPair, candle_size: Option<u32>, keep_candles: usize, keep_1min_candles: usize) -> Self {
        Self {
            pair,
            candle_size,
            keep_candles,
            keep_1min_candles,
            market_price: None,
            last_market_price: None,
            avg_market_price: None,
            last_avg_market_price: None,
            market_time: None,
            exchange: None,
            candle_history: VecDeque::new(),
            candles_1min: VecDeque::new(),
            current_candle: None,
            candle_ticks: 0,
        }
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    pub fn candle_size(&self) -> Option<u32> {
        self.candle_size
    }

    /// Price of the latest trade.
    pub fn market_price(&self) -> Option<f64> {
        self.market_price
    }

    pub fn last_market_price(&self) -> Option<f64> {
        self.last_market_price
    }

    /// Volume-weighted price of the latest trade tick.
    pub fn avg_market_price(&self) -> Option<f64> {
        self.avg_market_price
    }

    pub fn last_avg_market_price(&self) -> Option<f64> {
        self.last_avg_market_price
    }

    /// Timestamp of the latest trade. Use this instead of the wall clock so
    /// backtests behave like live trading.
    pub fn market_time(&self) -> Option<DateTime<Utc>> {
        self.market_time
    }

    /// Exchange of the latest trade, when the feed tags it.
    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    /// Latest closed candle of the configured size.
    pub fn candle(&self) -> Option<&Candle> {
        self.candle_history.front()
    }

    pub fn candle_trend(&self) -> Trend {
        self.candle().map(|c| c.trend).unwrap_or_default()
    }

    pub fn current_candle(&self) -> Option<&Candle> {
        self.current_candle.as_ref()
    }

    /// Number of candle ticks received since start. Never reset.
    pub fn candle_ticks(&self) -> u64 {
        self.candle_ticks
    }

    /// Closed candles, newest first.
    pub fn history(&self) -> impl Iterator<Item = &Candle> {
        self.candle_history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.candle_history.len()
    }

    /// Closing prices, oldest first.
    pub fn closes(&self) -> Vec<f64> {
        self.candle_history.iter().rev().map(|c| c.close).collect()
    }

    /// The candle `i` ticks back, 0 being the latest closed candle.
    pub fn candle_at(&self, i: usize) -> Option<&Candle> {
        if i >= self.keep_candles {
            warn!(pair = %self.pair, index = i, keep = self.keep_candles, "Candle index beyond retained history");
            return None;
        }
        self.candle_history.get(i)
    }

    /// Closed candles fully inside `[start, end]`, oldest first.
    pub fn candle_history(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Candle> {
        if self.candle_size.is_none() {
            warn!(pair = %self.pair, "Candle history requested by a strategy without candle size");
            return Vec::new();
        }
        self.candle_history
            .iter()
            .rev()
            .filter(|c| c.start >= start)
            .take_while(|c| c.end() <= end)
            .cloned()
            .collect()
    }

    /// The latest `count` candles of `size` minutes built from the 1-minute
    /// history, oldest first. `None` returns every complete candle.
    ///
    /// The newest 1-minute candle always closes the last batch; leftover
    /// older minutes that do not fill a batch are dropped.
    pub fn candles(&self, size: u32, count: Option<usize>) -> Vec<Candle> {
        if size == 0 {
            return Vec::new();
        }
        let size = size as usize;
        let skip = self.candles_1min.len() % size;
        let minutes: Vec<Candle> = self.candles_1min.iter().skip(skip).cloned().collect();

        let mut batched: Vec<Candle> = minutes
            .chunks(size)
            .filter_map(|chunk| candles::batch_candles(chunk, Some(size as u32)))
            .collect();
        if let Some(count) = count {
            let excess = batched.len().saturating_sub(count);
            batched.drain(..excess);
        }
        batched
    }

    pub fn latest_candle(&self, size: u32) -> Option<Candle> {
        self.candles(size, Some(1)).pop()
    }

    /// Batch arbitrary candles into one spanning all of them.
    pub fn batch_candles(&self, candles: &[Candle]) -> Option<Candle> {
        candles::batch_candles(candles, None)
    }

    pub fn average_candle_volume(candles: &[Candle]) -> f64 {
        if candles.is_empty() {
            return 0.0;
        }
        candles.iter().map(|c| c.volume).sum::<f64>() / candles.len() as f64
    }

    pub(crate) fn apply_trades(&mut self, trades: &[Trade]) {
        let Some(last) = trades.last() else {
            return;
        };
        self.last_market_price = self.market_price;
        self.market_price = Some(last.price);
        self.last_avg_market_price = self.avg_market_price;
        self.avg_market_price = volume_weighted_price(trades);
        self.market_time = Some(last.timestamp);
        if last.exchange.is_some() {
            self.exchange = last.exchange.clone();
        }
    }

    pub(crate) fn push_candle(&mut self, candle: Candle) {
        self.candle_ticks += 1;
        self.market_time = Some(self.market_time.map_or(candle.end(), |t| t.max(candle.end())));
        self.candle_history.push_front(candle);
        self.candle_history.truncate(self.keep_candles);
    }

    pub(crate) fn push_minute_candle(&mut self, candle: Candle) {
        self.candles_1min.push_back(candle);
        while self.candles_1min.len() > self.keep_1min_candles {
            self.candles_1min.pop_front();
        }
    }

    /// Store the forming candle, returning whether it opened a new bucket.
    pub(crate) fn set_current_candle(&mut self, candle: Candle) -> bool {
        let is_new = self
            .current_candle
            .as_ref()
            .map_or(true, |c| c.start != candle.start);
        self.current_candle = Some(candle);
        is_new
    }

    pub(crate) fn candle_history_vec(&self) -> Vec<Candle> {
        self.candle_history.iter().map(Candle::without_trade_data).collect()
    }

    pub(crate) fn candles_1min_vec(&self) -> Vec<Candle> {
        self.candles_1min.iter().map(Candle::without_trade_data).collect()
    }

    pub(crate) fn replace_history(&mut self, history: Vec<Candle>, minutes: Vec<Candle>) {
        self.candle_history = history.into_iter().take(self.keep_candles).collect();
        let skip = minutes.len().saturating_sub(self.keep_1min_candles);
        self.candles_1min = minutes.into_iter().skip(skip).collect();
    }
}
