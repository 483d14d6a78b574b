use common::{Error, Result};

use super::ema_series;

/// Moving Average Convergence/Divergence crossover detector.
///
/// MACD line = EMA(fast) - EMA(slow); signal line = EMA(MACD, signal).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    fast: usize,
    slow: usize,
    signal: usize,
}

/// Relation of the MACD line to its signal line on the latest close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacdCross {
    /// Crossed above the signal line.
    Bullish,
    /// Crossed below the signal line.
    Bearish,
    None,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Result<Self> {
        if fast == 0 || signal == 0 || fast >= slow {
            return Err(Error::Config(format!(
                "invalid MACD periods fast={fast} slow={slow} signal={signal}"
            )));
        }
        Ok(Self { fast, slow, signal })
    }

    /// Closes needed before [`Macd::compute`] yields a value.
    pub fn warmup(&self) -> usize {
        self.slow + self.signal
    }

    /// Latest MACD and signal values.
    pub fn lines(&self, closes: &[f64]) -> Option<(f64, f64)> {
        let (macd, signal) = self.series(closes)?;
        Some((*macd.last()?, *signal.last()?))
    }

    pub fn compute(&self, closes: &[f64]) -> Option<MacdCross> {
        let (macd, signal) = self.series(closes)?;
        if signal.len() < 2 {
            return None;
        }
        // signal[i] lines up with the last signal.len() entries of macd
        let offset = macd.len() - signal.len();
        let n = signal.len();
        let (prev_macd, curr_macd) = (macd[offset + n - 2], macd[offset + n - 1]);
        let (prev_sig, curr_sig) = (signal[n - 2], signal[n - 1]);

        Some(if prev_macd <= prev_sig && curr_macd > curr_sig {
            MacdCross::Bullish
        } else if prev_macd >= prev_sig && curr_macd < curr_sig {
            MacdCross::Bearish
        } else {
            MacdCross::None
        })
    }

    fn series(&self, closes: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
        if closes.len() < self.warmup() {
            return None;
        }
        let fast = ema_series(closes, self.fast);
        let slow = ema_series(closes, self.slow);
        // both end on the latest close; align on the shorter slow series
        let skip = fast.len() - slow.len();
        let macd: Vec<f64> = fast[skip..].iter().zip(&slow).map(|(f, s)| f - s).collect();
        let signal = ema_series(&macd, self.signal);
        if signal.is_empty() {
            return None;
        }
        Some((macd, signal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_slow_plus_signal_closes() {
        let macd = Macd::new(12, 26, 9).unwrap();
        assert!(macd.compute(&[100.0; 34]).is_none());
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        assert!(macd.compute(&closes).is_some());
    }

    #[test]
    fn reversal_produces_bullish_cross() {
        let macd = Macd::new(3, 6, 3).unwrap();
        // accelerating decline keeps MACD below its signal line
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 - (i * i) as f64 * 0.05).collect();
        let mut crossed = false;
        for i in 0..10 {
            closes.push(82.0 + i as f64 * 3.0);
            if macd.compute(&closes) == Some(MacdCross::Bullish) {
                crossed = true;
                break;
            }
        }
        assert!(crossed);
    }

    #[test]
    fn linear_trend_settles_lines() {
        let macd = Macd::new(3, 6, 3).unwrap();
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 0.5).collect();
        // EMA lag on a linear series is slope * (period - 1) / 2
        let (line, signal) = macd.lines(&closes).unwrap();
        assert!((line - 0.75).abs() < 1e-9);
        assert!((signal - 0.75).abs() < 1e-9);
    }

    #[test]
    fn inverted_periods_are_rejected() {
        assert!(Macd::new(26, 12, 9).is_err());
        assert!(Macd::new(0, 12, 9).is_err());
    }
}
