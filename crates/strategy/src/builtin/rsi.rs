use async_trait::async_trait;
use serde_json::{json, Value};

use common::{ActionKind, Candle, Error, Result};

use crate::config::ResolvedStrategy;
use crate::indicators::Rsi;
use crate::registry::{param_f64, param_usize};
use crate::runtime::TickContext;
use crate::Strategy;

use super::memory_f64;

/// Buys oversold and sells overbought markets on every closed candle.
/// The weight grows with the distance past the threshold.
pub struct RsiStrategy {
    rsi: Rsi,
    overbought: f64,
    oversold: f64,
    last_value: Option<f64>,
}

impl RsiStrategy {
    pub const KIND: &'static str = "rsi";

    pub fn new(period: usize, overbought: f64, oversold: f64) -> Result<Self> {
        if !(0.0..=100.0).contains(&oversold) || !(0.0..=100.0).contains(&overbought) || oversold >= overbought {
            return Err(Error::Config(format!(
                "RSI thresholds must satisfy 0 <= oversold < overbought <= 100, got {oversold}/{overbought}"
            )));
        }
        Ok(Self {
            rsi: Rsi::new(period)?,
            overbought,
            oversold,
            last_value: None,
        })
    }

    pub fn build(cfg: &ResolvedStrategy) -> Result<Box<dyn Strategy>> {
        let period = param_usize(&cfg.params, "period", 14);
        let overbought = param_f64(&cfg.params, "overbought", 70.0);
        let oversold = param_f64(&cfg.params, "oversold", 30.0);
        Ok(Box::new(Self::new(period, overbought, oversold)?))
    }
}

#[async_trait]
impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        Self::KIND
    }

    async fn candle_tick(&mut self, ctx: &TickContext<'_>, _candle: &Candle) -> Result<()> {
        let Some(value) = self.rsi.compute(&ctx.market().closes()) else {
            ctx.log(format_args!(
                "RSI warming up, {}/{} candles",
                ctx.market().history_len(),
                self.rsi.warmup()
            ));
            return Ok(());
        };
        self.last_value = Some(value);
        ctx.log(format_args!("RSI {value:.2}"));

        if value <= self.oversold {
            ctx.emit(
                ActionKind::Buy,
                self.oversold - value + 1.0,
                format!("RSI {value:.2} at or below {}", self.oversold),
                None,
            );
        } else if value >= self.overbought {
            ctx.emit(
                ActionKind::Sell,
                value - self.overbought + 1.0,
                format!("RSI {value:.2} at or above {}", self.overbought),
                None,
            );
        }
        Ok(())
    }

    fn serialize(&self) -> Value {
        json!({ "last_value": self.last_value })
    }

    fn restore(&mut self, state: &Value) -> Result<()> {
        self.last_value = memory_f64(state, "last_value")?;
        Ok(())
    }
}
