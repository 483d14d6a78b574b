//! Price indicators over close series (oldest first).

pub mod macd;
pub mod rsi;

pub use macd::{Macd, MacdCross};
pub use rsi::Rsi;

/// EMA series of `data`, seeded with the SMA of the first `period` values.
/// Empty when there are fewer than `period` values.
pub(crate) fn ema_series(data: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || data.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = data[..period].iter().sum::<f64>() / period as f64;

    let mut out = Vec::with_capacity(data.len() - period + 1);
    out.push(seed);
    let mut prev = seed;
    for &value in &data[period..] {
        prev = value * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}
