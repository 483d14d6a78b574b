use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use common::{Action, ActionKind, Error, Order, Position, Result, Trade, TradeAction, TradeInfo};

use crate::config::ResolvedStrategy;
use crate::registry::param_f64;
use crate::runtime::TickContext;
use crate::Strategy;

use super::memory_f64;

/// Closes the open position once the market moves past a loss or profit
/// limit relative to the entry price. Closing bypasses arbitration.
pub struct StopLossStrategy {
    /// Maximum loss in percent before closing.
    stop_loss_pct: f64,
    /// Gain in percent that closes the position. 0 disables it.
    take_profit_pct: f64,
    entry_price: Option<f64>,
    /// Set once a close was requested for the current entry.
    triggered: bool,
}

impl StopLossStrategy {
    pub const KIND: &'static str = "stop_loss";

    pub fn new(stop_loss_pct: f64, take_profit_pct: f64) -> Result<Self> {
        if !(stop_loss_pct > 0.0 && stop_loss_pct < 100.0) || take_profit_pct < 0.0 {
            return Err(Error::Config(format!(
                "stop_loss_pct must be in (0, 100) and take_profit_pct >= 0, got {stop_loss_pct}/{take_profit_pct}"
            )));
        }
        Ok(Self {
            stop_loss_pct,
            take_profit_pct,
            entry_price: None,
            triggered: false,
        })
    }

    pub fn build(cfg: &ResolvedStrategy) -> Result<Box<dyn Strategy>> {
        Ok(Box::new(Self::new(
            param_f64(&cfg.params, "stop_loss_pct", 2.0),
            param_f64(&cfg.params, "take_profit_pct", 0.0),
        )?))
    }

    fn set_entry(&mut self, entry: Option<f64>) {
        if entry != self.entry_price {
            self.triggered = false;
        }
        self.entry_price = entry;
    }
}

#[async_trait]
impl Strategy for StopLossStrategy {
    fn name(&self) -> &str {
        Self::KIND
    }

    async fn tick(&mut self, ctx: &TickContext<'_>, _trades: &[Trade]) -> Result<()> {
        let (Some(entry), Some(price)) = (self.entry_price, ctx.market().market_price()) else {
            return Ok(());
        };
        if self.triggered || entry <= 0.0 {
            return Ok(());
        }

        let pnl_pct = (price - entry) / entry * 100.0;
        let reason = if pnl_pct <= -self.stop_loss_pct {
            format!("stop loss: {pnl_pct:.2}% from entry {entry}")
        } else if self.take_profit_pct > 0.0 && pnl_pct >= self.take_profit_pct {
            format!("take profit: {pnl_pct:.2}% from entry {entry}")
        } else {
            return Ok(());
        };

        info!(pair = %ctx.strategy().config_pair, price, entry, pnl_pct, "Closing position");
        self.triggered = true;
        ctx.emit(ActionKind::Close, Action::MAX_WEIGHT, reason, None);
        Ok(())
    }

    fn on_trade(&mut self, action: TradeAction, order: &Order, _trades: &[Trade], _info: &TradeInfo) {
        match action {
            TradeAction::Buy if self.entry_price.is_none() => self.set_entry(Some(order.rate)),
            TradeAction::Buy => {}
            TradeAction::Sell | TradeAction::Close => self.set_entry(None),
        }
    }

    fn on_sync_portfolio(&mut self, _balance: f64, position: Option<&Position>, _exchange: Option<&str>) {
        let entry = position.filter(|p| p.amount > 0.0).map(|p| p.entry_price);
        self.set_entry(entry);
    }

    fn serialize(&self) -> Value {
        json!({ "entry_price": self.entry_price })
    }

    fn restore(&mut self, state: &Value) -> Result<()> {
        self.set_entry(memory_f64(state, "entry_price")?);
        Ok(())
    }
}
