use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ActionKind, Candle, CurrencyPair, Result, StrategyRef, Trade, TradeSide};

/// The winning action of one decision cycle, handed to the trader of the
/// originating strategy's configuration.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub action: ActionKind,
    pub strategy: StrategyRef,
    pub reason: String,
    pub exchange: Option<String>,
}

impl ExecutionRequest {
    pub fn pair(&self) -> &CurrencyPair {
        &self.strategy.config_pair.pair
    }
}

/// An order as reported back by a trader after execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub pair: CurrencyPair,
    pub side: TradeSide,
    pub amount: f64,
    pub rate: f64,
    pub timestamp: DateTime<Utc>,
}

impl Order {
    pub fn new(pair: CurrencyPair, side: TradeSide, amount: f64, rate: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair,
            side,
            amount,
            rate,
            timestamp,
        }
    }
}

/// Context of an executed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeInfo {
    /// Kind tag of the strategy that triggered the order.
    pub strategy: String,
    pub reason: String,
    pub exchange: Option<String>,
    /// Realized profit/loss in quote currency, for closing orders.
    pub profit_loss: Option<f64>,
}

/// Open position of a pair as held by a trader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub amount: f64,
    pub entry_price: f64,
}

/// Which order event a trader confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
    Close,
}

/// Events a trader emits back to the advisor.
#[derive(Debug, Clone)]
pub enum TraderEvent {
    Trade {
        /// Configuration index the trader belongs to.
        config: usize,
        action: TradeAction,
        order: Order,
        trades: Vec<Trade>,
        info: TradeInfo,
    },
    SyncPortfolio {
        config: usize,
        pair: CurrencyPair,
        balance: f64,
        position: Option<Position>,
        exchange: Option<String>,
    },
}

impl TraderEvent {
    pub fn config(&self) -> usize {
        match self {
            TraderEvent::Trade { config, .. } | TraderEvent::SyncPortfolio { config, .. } => *config,
        }
    }

    pub fn pair(&self) -> &CurrencyPair {
        match self {
            TraderEvent::Trade { order, .. } => &order.pair,
            TraderEvent::SyncPortfolio { pair, .. } => pair,
        }
    }
}

/// Order execution component. One instance per configuration.
///
/// Implementations report fills and balance changes as [`TraderEvent`]s on
/// the channel they were constructed with. Only the trader executor task in
/// `crates/engine` calls into a `dyn Trader`.
#[async_trait]
pub trait Trader: Send + Sync {
    /// Execute the winning action of a decision cycle.
    async fn execute(&self, request: ExecutionRequest) -> Result<()>;

    /// Raw trades of every subscribed pair, used for pricing.
    async fn on_trades(&self, pair: &CurrencyPair, trades: &[Trade]) -> Result<()>;

    /// Candles of the largest configured interval of a pair.
    async fn on_candle(&self, _candle: &Candle) -> Result<()> {
        Ok(())
    }
}
