use tracing::{debug, warn};

use common::{Candle, CurrencyPair, Error, Result};

/// Combines consecutive 1-minute candles into candles of `interval` minutes.
///
/// Emits exactly one candle per `interval` inputs and keeps nothing buffered
/// after an emission.
#[derive(Debug, Clone)]
pub struct CandleBatcher {
    pair: CurrencyPair,
    interval: u32,
    minute_candles: Vec<Candle>,
    last_candle: Option<Candle>,
    /// Largest batcher of its pair; its output is also forwarded to traders.
    is_max: bool,
}

impl CandleBatcher {
    pub fn new(pair: CurrencyPair, interval: u32) -> Result<Self> {
        if interval == 0 {
            return Err(Error::Config(format!(
                "candle size for {pair} has to be a positive number of minutes"
            )));
        }
        Ok(Self {
            pair,
            interval,
            minute_candles: Vec::with_capacity(interval as usize),
            last_candle: None,
            is_max: false,
        })
    }

    pub fn pair(&self) -> &CurrencyPair {
        &self.pair
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn set_max(&mut self, is_max: bool) {
        self.is_max = is_max;
    }

    pub fn is_max(&self) -> bool {
        self.is_max
    }

    /// Most recent emitted candle.
    pub fn last_candle(&self) -> Option<&Candle> {
        self.last_candle.as_ref()
    }

    /// Number of 1-minute candles waiting for the batch to fill.
    pub fn buffered(&self) -> usize {
        self.minute_candles.len()
    }

    /// Feed one 1-minute candle. Returns the batched candle when the batch is full.
    pub fn add_candle(&mut self, candle: Candle) -> Option<Candle> {
        self.minute_candles.push(candle);
        if self.minute_candles.len() < self.interval as usize {
            return None;
        }

        let batched = batch_candles(&self.minute_candles, Some(self.interval));
        self.minute_candles.clear();
        match batched {
            Some(candle) => {
                debug!(pair = %self.pair, interval = self.interval, start = %candle.start, "Batched candle");
                self.last_candle = Some(candle.clone());
                Some(candle)
            }
            None => {
                warn!(pair = %self.pair, interval = self.interval, "Dropped malformed candle batch");
                None
            }
        }
    }

    pub fn add_candles<I>(&mut self, candles: I) -> Vec<Candle>
    where
        I: IntoIterator<Item = Candle>,
    {
        candles
            .into_iter()
            .filter_map(|candle| self.add_candle(candle))
            .collect()
    }
}

/// Reduce `candles` (oldest first) to one candle.
///
/// `interval` defaults to `first.interval * candles.len()`. Returns `None` for
/// an empty slice, when the first or last candle has no finite open/close, or
/// when the default interval does not fit in a `u32`.
pub fn batch_candles(candles: &[Candle], interval: Option<u32>) -> Option<Candle> {
    let (first, rest) = candles.split_first()?;
    let last = candles.last()?;
    if !is_well_formed(first) || !is_well_formed(last) {
        return None;
    }
    let interval = match interval {
        Some(interval) => interval,
        None => u32::try_from(candles.len())
            .ok()
            .and_then(|n| first.interval.checked_mul(n))?,
    };

    let mut acc = first.clone();
    let mut vwp_numerator = first.vwp * first.volume;

    for m in rest {
        acc.high = acc.high.max(m.high);
        acc.low = acc.low.min(m.low);
        acc.close = m.close;
        acc.volume += m.volume;
        vwp_numerator += m.vwp * m.volume;
        acc.trades += m.trades;
        if let (Some(data), Some(more)) = (acc.trade_data.as_mut(), m.trade_data.as_ref()) {
            data.extend(more.iter().cloned());
        }
    }

    acc.vwp = if acc.volume > 0.0 {
        vwp_numerator / acc.volume
    } else {
        acc.open
    };
    acc.start = first.start;
    acc.interval = interval;
    acc.compute_trend();
    Some(acc)
}

fn is_well_formed(candle: &Candle) -> bool {
    candle.open.is_finite() && candle.close.is_finite()
}
