use async_trait::async_trait;

use common::{ActionKind, Candle, Result};

use crate::config::ResolvedStrategy;
use crate::indicators::{Macd, MacdCross};
use crate::registry::{param_f64, param_usize};
use crate::runtime::TickContext;
use crate::Strategy;

/// Follows MACD / signal line crossovers on closed candles.
pub struct MacdStrategy {
    macd: Macd,
    weight: f64,
}

impl MacdStrategy {
    pub const KIND: &'static str = "macd";

    pub fn build(cfg: &ResolvedStrategy) -> Result<Box<dyn Strategy>> {
        let macd = Macd::new(
            param_usize(&cfg.params, "fast", 12),
            param_usize(&cfg.params, "slow", 26),
            param_usize(&cfg.params, "signal", 9),
        )?;
        Ok(Box::new(Self {
            macd,
            weight: param_f64(&cfg.params, "weight", 1.0),
        }))
    }
}

#[async_trait]
impl Strategy for MacdStrategy {
    fn name(&self) -> &str {
        Self::KIND
    }

    async fn candle_tick(&mut self, ctx: &TickContext<'_>, candle: &Candle) -> Result<()> {
        let closes = ctx.market().closes();
        match self.macd.compute(&closes) {
            Some(MacdCross::Bullish) => {
                ctx.emit(ActionKind::Buy, self.weight, format!("MACD crossed above signal at {}", candle.close), None)
            }
            Some(MacdCross::Bearish) => {
                ctx.emit(ActionKind::Sell, self.weight, format!("MACD crossed below signal at {}", candle.close), None)
            }
            Some(MacdCross::None) => {}
            None => ctx.log(format_args!("MACD warming up, {}/{} candles", closes.len(), self.macd.warmup())),
        }
        Ok(())
    }
}
