use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use common::{Candle, CurrencyPair, Trade};

/// Longest run of empty minutes filled between two trades by default.
pub const DEFAULT_MAX_GAP_MINUTES: u32 = 1440;

/// What a maker produced from one input batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MakerOutput {
    /// Finalized 1-minute candles, oldest first. Never mutated afterwards.
    pub closed: Vec<Candle>,
    /// Snapshot of the still-forming candle, if any trade touched it.
    pub current: Option<Candle>,
}

impl MakerOutput {
    pub fn is_empty(&self) -> bool {
        self.closed.is_empty() && self.current.is_none()
    }
}

/// Builds 1-minute candles from the raw trades of a single currency pair.
///
/// Buckets follow the trade timestamps, not the wall clock. Minutes without
/// trades are emitted as empty candles at the previous close, up to
/// `max_gap_minutes` of them. Longer gaps are skipped.
#[derive(Debug, Clone)]
pub struct CandleMaker {
    pair: CurrencyPair,
    exchange: Option<String>,
    embed_trades: bool,
    max_gap_minutes: u32,
    current: Option<Candle>,
    /// Σ price·volume of the forming candle.
    price_volume: f64,
    /// Set once the upstream feed delivers native candles.
    candle_feed: bool,
}

impl CandleMaker {
    pub fn new(pair: CurrencyPair, exchange: Option<String>) -> Self {
        Self {
            pair,
            exchange,
            embed_trades: false,
            max_gap_minutes: DEFAULT_MAX_GAP_MINUTES,
            current: None,
            price_volume: 0.0,
            candle_feed: false,
        }
    }

    /// Keep raw trades inside every candle.
    pub fn with_embedded_trades(mut self, embed: bool) -> Self {
        self.embed_trades = embed;
        self
    }

    pub fn with_max_gap(mut self, minutes: u32) -> Self {
        self.max_gap_minutes = minutes;
        self
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }

    pub fn is_candle_feed(&self) -> bool {
        self.candle_feed
    }

    /// The forming candle.
    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    /// Aggregate raw trades. Ignored once the pair runs on a candle feed.
    pub fn add_trades(&mut self, trades: &[Trade]) -> MakerOutput {
        let mut output = MakerOutput::default();
        if self.candle_feed {
            debug!(pair = %self.pair, count = trades.len(), "Candle feed active, raw trades not aggregated");
            return output;
        }

        let mut touched = false;
        for trade in trades {
            if !trade.price.is_finite() || !trade.volume.is_finite() || trade.volume < 0.0 {
                warn!(pair = %self.pair, price = trade.price, volume = trade.volume, "Skipping invalid trade");
                continue;
            }
            let bucket = minute_start(trade.timestamp);
            match self.current.take() {
                None => self.open_bucket(bucket, trade),
                Some(candle) if bucket > candle.start => {
                    let last_close = candle.close;
                    let mut next = candle.start + Duration::minutes(1);
                    output.closed.push(self.finalize(candle));
                    let missing = (bucket - next).num_minutes();
                    if missing > i64::from(self.max_gap_minutes) {
                        warn!(
                            pair = %self.pair,
                            from = %next,
                            to = %bucket,
                            missing,
                            max = self.max_gap_minutes,
                            "Trade gap too long, empty candles not filled"
                        );
                    } else {
                        while next < bucket {
                            output
                                .closed
                                .push(Candle::empty(self.pair.clone(), next, 1, last_close));
                            next += Duration::minutes(1);
                        }
                    }
                    self.open_bucket(bucket, trade);
                }
                Some(mut candle) => {
                    if bucket < candle.start {
                        debug!(pair = %self.pair, trade_time = %trade.timestamp, bucket = %candle.start, "Late trade folded into open candle");
                    }
                    self.fold(&mut candle, trade);
                    self.current = Some(candle);
                }
            }
            touched = true;
        }

        if touched {
            output.current = self.current.as_ref().map(|c| self.snapshot(c));
        }
        output
    }

    /// Take externally built 1-minute candles. Switches the pair to candle-feed mode.
    pub fn add_candles(&mut self, candles: Vec<Candle>) -> MakerOutput {
        if !self.candle_feed {
            debug!(pair = %self.pair, "Switching to native candle feed");
            self.candle_feed = true;
            self.current = None;
            self.price_volume = 0.0;
        }

        let closed = candles
            .into_iter()
            .filter_map(|mut candle| {
                if candle.interval != 1 {
                    warn!(pair = %self.pair, interval = candle.interval, "Ignoring non 1-minute feed candle");
                    return None;
                }
                candle.pair = self.pair.clone();
                candle.compute_trend();
                Some(candle)
            })
            .collect();

        MakerOutput {
            closed,
            current: None,
        }
    }

    fn open_bucket(&mut self, start: DateTime<Utc>, trade: &Trade) {
        let mut candle = Candle::open_with(self.pair.clone(), start, 1, trade);
        if self.embed_trades {
            candle.trade_data = Some(vec![trade.clone()]);
        }
        self.price_volume = trade.price * trade.volume;
        self.current = Some(candle);
    }

    fn fold(&mut self, candle: &mut Candle, trade: &Trade) {
        candle.high = candle.high.max(trade.price);
        candle.low = candle.low.min(trade.price);
        candle.close = trade.price;
        candle.volume += trade.volume;
        candle.trades += 1;
        self.price_volume += trade.price * trade.volume;
        if let Some(data) = candle.trade_data.as_mut() {
            data.push(trade.clone());
        }
    }

    fn snapshot(&self, candle: &Candle) -> Candle {
        let mut candle = candle.clone();
        candle.vwp = if candle.volume > 0.0 {
            self.price_volume / candle.volume
        } else {
            candle.open
        };
        candle.compute_trend();
        candle
    }

    fn finalize(&self, candle: Candle) -> Candle {
        self.snapshot(&candle)
    }
}

/// Start of the minute containing `ts`.
fn minute_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    DateTime::from_timestamp(secs - secs.rem_euclid(60), 0).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{TradeSide, Trend};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn trade_at(secs: i64, price: f64, volume: f64) -> Trade {
        Trade::new(price, volume, t0() + Duration::seconds(secs), TradeSide::Buy)
    }

    fn maker() -> CandleMaker {
        CandleMaker::new(CurrencyPair::new("BTC", "USDT"), Some("paper".into()))
    }

    #[test]
    fn first_trade_opens_candle_without_closing() {
        let mut maker = maker();
        let out = maker.add_trades(&[trade_at(5, 100.0, 1.0)]);
        assert!(out.closed.is_empty());
        let current = out.current.expect("forming candle");
        assert_eq!(current.start, t0());
        assert_eq!(current.open, 100.0);
        assert_eq!(current.trades, 1);
    }

    #[test]
    fn minute_boundary_closes_candle() {
        let mut maker = maker();
        let out = maker.add_trades(&[
            trade_at(1, 100.0, 1.0),
            trade_at(20, 104.0, 3.0),
            trade_at(40, 98.0, 1.0),
            trade_at(61, 101.0, 2.0),
        ]);

        assert_eq!(out.closed.len(), 1);
        let closed = &out.closed[0];
        assert_eq!(closed.start, t0());
        assert_eq!(closed.interval, 1);
        assert_eq!((closed.open, closed.high, closed.low, closed.close), (100.0, 104.0, 98.0, 98.0));
        assert_eq!(closed.volume, 5.0);
        assert_eq!(closed.trades, 3);
        assert!((closed.vwp - (100.0 + 312.0 + 98.0) / 5.0).abs() < 1e-9);
        assert_eq!(closed.trend, Trend::Down);

        let current = out.current.unwrap();
        assert_eq!(current.start, t0() + Duration::minutes(1));
        assert_eq!(current.open, 101.0);
    }

    #[test]
    fn gaps_are_filled_with_empty_candles() {
        let mut maker = maker();
        maker.add_trades(&[trade_at(0, 100.0, 1.0)]);
        let out = maker.add_trades(&[trade_at(185, 110.0, 1.0)]);

        assert_eq!(out.closed.len(), 3);
        assert_eq!(out.closed[1].start, t0() + Duration::minutes(1));
        assert_eq!(out.closed[1].volume, 0.0);
        assert_eq!(out.closed[1].close, 100.0);
        assert_eq!(out.closed[1].vwp, 100.0);
        assert_eq!(out.closed[2].start, t0() + Duration::minutes(2));
        assert_eq!(out.current.unwrap().start, t0() + Duration::minutes(3));
    }

    #[test]
    fn gaps_beyond_the_cap_are_not_filled() {
        let mut maker = maker().with_max_gap(2);
        maker.add_trades(&[trade_at(0, 100.0, 1.0)]);
        let out = maker.add_trades(&[trade_at(185, 110.0, 1.0)]);
        assert_eq!(out.closed.len(), 3);

        let year = 365 * 24 * 3600;
        let out = maker.add_trades(&[trade_at(year, 120.0, 1.0)]);
        assert_eq!(out.closed.len(), 1);
        assert_eq!(out.closed[0].start, t0() + Duration::minutes(3));
        let current = out.current.unwrap();
        assert_eq!(current.start, t0() + Duration::seconds(year));
        assert_eq!(current.open, 120.0);
    }

    #[test]
    fn late_trade_is_folded_into_open_candle() {
        let mut maker = maker();
        maker.add_trades(&[trade_at(65, 100.0, 1.0)]);
        let out = maker.add_trades(&[trade_at(10, 90.0, 1.0)]);
        assert!(out.closed.is_empty());
        let current = out.current.unwrap();
        assert_eq!(current.low, 90.0);
        assert_eq!(current.trades, 2);
    }

    #[test]
    fn embedded_trades_are_kept_when_enabled() {
        let mut maker = maker().with_embedded_trades(true);
        let out = maker.add_trades(&[trade_at(1, 100.0, 1.0), trade_at(2, 101.0, 1.0)]);
        assert_eq!(out.current.unwrap().trade_data.map(|d| d.len()), Some(2));
    }

    #[test]
    fn candle_feed_bypasses_trade_aggregation() {
        let mut maker = maker();
        maker.add_trades(&[trade_at(1, 100.0, 1.0)]);

        let feed = Candle::empty(CurrencyPair::new("BTC", "USDT"), t0(), 1, 100.0);
        let mut hourly = feed.clone();
        hourly.interval = 60;
        let out = maker.add_candles(vec![feed.clone(), hourly]);
        assert_eq!(out.closed, vec![feed]);
        assert!(maker.is_candle_feed());
        assert!(maker.current().is_none());

        let out = maker.add_trades(&[trade_at(70, 105.0, 1.0)]);
        assert!(out.is_empty());
    }

    #[test]
    fn invalid_trades_are_skipped() {
        let mut maker = maker();
        let out = maker.add_trades(&[trade_at(1, f64::NAN, 1.0), trade_at(2, 100.0, -1.0)]);
        assert!(out.is_empty());
    }
}
