pub mod builtin;
pub mod config;
pub mod indicators;
pub mod market;
pub mod registry;
pub mod runtime;

pub use config::{CandleSize, ResolvedStrategy, StrategyConfig, TradeConfig, TradeConfigEntry, TradeConfigFile};
pub use market::MarketState;
pub use registry::{StrategyFactory, StrategyRegistry};
pub use runtime::{RuntimeSettings, StrategyEvent, StrategyEventKind, StrategyHandle, TickContext};

use async_trait::async_trait;
use serde_json::Value;

use common::{Candle, Order, Position, Result, Trade, TradeAction, TradeInfo};

/// Trading logic of one strategy kind.
///
/// The runtime owns the market state and the tick queue; an implementation
/// only reacts to ticks and calls [`TickContext::emit`]. Returning `Err` (or
/// panicking) from a tick counts as "no action this cycle".
#[async_trait]
pub trait Strategy: Send {
    /// Registry kind tag, e.g. "rsi". Also the key of the checkpoint entry.
    fn name(&self) -> &str;

    /// New raw trades since the last tick.
    async fn tick(&mut self, _ctx: &TickContext<'_>, _trades: &[Trade]) -> Result<()> {
        Ok(())
    }

    /// A closed candle of the configured candle size. Already part of the
    /// candle history when this runs.
    async fn candle_tick(&mut self, _ctx: &TickContext<'_>, _candle: &Candle) -> Result<()> {
        Ok(())
    }

    /// Preview of the forming 1-minute candle. `is_new` is set on the first
    /// preview of a bucket.
    async fn current_candle_tick(&mut self, _ctx: &TickContext<'_>, _candle: &Candle, _is_new: bool) -> Result<()> {
        Ok(())
    }

    /// The trader of this strategy's configuration executed an order on its pair.
    fn on_trade(&mut self, _action: TradeAction, _order: &Order, _trades: &[Trade], _info: &TradeInfo) {}

    /// Balance update from the trader.
    fn on_sync_portfolio(&mut self, _balance: f64, _position: Option<&Position>, _exchange: Option<&str>) {}

    /// Strategy-specific memory for checkpoints.
    fn serialize(&self) -> Value {
        Value::Null
    }

    /// Counterpart of [`Strategy::serialize`]. An `Err` rejects the snapshot.
    fn restore(&mut self, _state: &Value) -> Result<()> {
        Ok(())
    }
}
