use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use common::{
    ActionKind, Candle, CurrencyPair, Error, ExecutionRequest, Order, Position, Result, Trade, TradeAction, TradeInfo,
    TradeSide, Trader, TraderEvent,
};

#[derive(Debug, Default)]
struct Book {
    /// Quote currency balance.
    balance: f64,
    positions: HashMap<CurrencyPair, Position>,
    /// Latest price and market time per pair, from trades or closed candles.
    prices: HashMap<CurrencyPair, (f64, DateTime<Utc>)>,
}

/// Simulated trader for backtests and paper trading.
///
/// Fills are simulated at the latest known price with configurable slippage.
/// Long only: sells are capped at the open position.
pub struct PaperTrader {
    config: usize,
    /// Base amount per order. `None` spends the whole balance on buys and
    /// sells the whole position.
    trade_amount: Option<f64>,
    /// Slippage in basis points applied to all fills.
    slippage_bps: f64,
    book: RwLock<Book>,
    events: mpsc::UnboundedSender<TraderEvent>,
}

impl PaperTrader {
    pub fn new(
        config: usize,
        initial_balance: f64,
        slippage_bps: f64,
        trade_amount: Option<f64>,
        events: mpsc::UnboundedSender<TraderEvent>,
    ) -> Self {
        info!(
            config,
            balance = initial_balance,
            slippage_bps,
            trade_amount = ?trade_amount,
            "PaperTrader initialized"
        );
        Self {
            config,
            trade_amount,
            slippage_bps,
            book: RwLock::new(Book {
                balance: initial_balance,
                ..Book::default()
            }),
            events,
        }
    }

    pub async fn balance(&self) -> f64 {
        self.book.read().await.balance
    }

    pub async fn position(&self, pair: &CurrencyPair) -> Option<Position> {
        self.book.read().await.positions.get(pair).copied()
    }

    fn fill_price(&self, mid: f64, side: TradeSide) -> f64 {
        // buys pay more, sells receive less
        match side {
            TradeSide::Buy => mid * (1.0 + self.slippage_bps / 10_000.0),
            TradeSide::Sell => mid * (1.0 - self.slippage_bps / 10_000.0),
        }
    }

    fn publish(&self, event: TraderEvent) {
        if self.events.send(event).is_err() {
            debug!(config = self.config, "Trader event receiver gone");
        }
    }

    fn sync_event(&self, book: &Book, pair: &CurrencyPair, exchange: Option<String>) -> TraderEvent {
        TraderEvent::SyncPortfolio {
            config: self.config,
            pair: pair.clone(),
            balance: book.balance,
            position: book.positions.get(pair).copied(),
            exchange,
        }
    }
}

#[async_trait]
impl Trader for PaperTrader {
    async fn execute(&self, request: ExecutionRequest) -> Result<()> {
        let pair = request.pair().clone();
        let (trade_action, side) = match request.action {
            ActionKind::Hold => {
                debug!(config = self.config, pair = %pair, strategy = %request.strategy.name, "Hold, nothing to do");
                return Ok(());
            }
            ActionKind::Buy => (TradeAction::Buy, TradeSide::Buy),
            ActionKind::Sell => (TradeAction::Sell, TradeSide::Sell),
            ActionKind::Close => (TradeAction::Close, TradeSide::Sell),
        };

        let mut book = self.book.write().await;
        let (mid, timestamp) = book
            .prices
            .get(&pair)
            .copied()
            .ok_or_else(|| Error::Other(format!("PaperTrader has no price for {pair}. Ensure market events are flowing.")))?;
        let rate = self.fill_price(mid, side);

        let (amount, profit_loss) = match side {
            TradeSide::Buy => {
                let affordable = book.balance / rate;
                let amount = self.trade_amount.map_or(affordable, |a| a.min(affordable));
                if amount <= 0.0 {
                    warn!(config = self.config, pair = %pair, balance = book.balance, "Insufficient balance, skipping buy");
                    return Ok(());
                }
                book.balance -= amount * rate;
                let position = book.positions.entry(pair.clone()).or_insert(Position {
                    amount: 0.0,
                    entry_price: rate,
                });
                let total = position.amount + amount;
                position.entry_price = (position.entry_price * position.amount + rate * amount) / total;
                position.amount = total;
                (amount, None)
            }
            TradeSide::Sell => {
                let Some(position) = book.positions.get(&pair).copied() else {
                    warn!(config = self.config, pair = %pair, action = %request.action, "No open position, skipping sell");
                    return Ok(());
                };
                let amount = match (trade_action, self.trade_amount) {
                    (TradeAction::Sell, Some(a)) => a.min(position.amount),
                    _ => position.amount,
                };
                book.balance += amount * rate;
                let remaining = position.amount - amount;
                if remaining <= f64::EPSILON {
                    book.positions.remove(&pair);
                } else if let Some(open) = book.positions.get_mut(&pair) {
                    open.amount = remaining;
                }
                (amount, Some((rate - position.entry_price) * amount))
            }
        };

        let order = Order::new(pair.clone(), side, amount, rate, timestamp);
        info!(
            config = self.config,
            pair = %pair,
            side = %side,
            mid,
            fill = rate,
            amount,
            balance = book.balance,
            "Paper fill simulated"
        );

        let mut fill = Trade::new(rate, amount, timestamp, side);
        fill.exchange = request.exchange.clone();
        self.publish(TraderEvent::Trade {
            config: self.config,
            action: trade_action,
            order,
            trades: vec![fill],
            info: TradeInfo {
                strategy: request.strategy.name.clone(),
                reason: request.reason.clone(),
                exchange: request.exchange.clone(),
                profit_loss,
            },
        });
        let sync = self.sync_event(&book, &pair, request.exchange);
        self.publish(sync);
        Ok(())
    }

    async fn on_trades(&self, pair: &CurrencyPair, trades: &[Trade]) -> Result<()> {
        if let Some(last) = trades.last() {
            self.book
                .write()
                .await
                .prices
                .insert(pair.clone(), (last.price, last.timestamp));
        }
        Ok(())
    }

    async fn on_candle(&self, candle: &Candle) -> Result<()> {
        let mut book = self.book.write().await;
        let end = candle.end();
        // a trade newer than the candle's end keeps its price
        let stale = book.prices.get(&candle.pair).is_some_and(|(_, ts)| *ts > end);
        if !stale {
            book.prices.insert(candle.pair.clone(), (candle.close, end));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::{ConfigCurrencyPair, StrategyId, StrategyRef};

    fn pair() -> CurrencyPair {
        CurrencyPair::new("BTC", "USDT")
    }

    fn request(action: ActionKind) -> ExecutionRequest {
        ExecutionRequest {
            action,
            strategy: StrategyRef {
                id: StrategyId(0),
                name: "rsi".into(),
                config_pair: ConfigCurrencyPair::new(1, pair()),
                is_main: true,
            },
            reason: "test".into(),
            exchange: Some("paper".into()),
        }
    }

    async fn trader(
        balance: f64,
        slippage_bps: f64,
        trade_amount: Option<f64>,
    ) -> (PaperTrader, mpsc::UnboundedReceiver<TraderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let trader = PaperTrader::new(1, balance, slippage_bps, trade_amount, tx);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        trader
            .on_trades(&pair(), &[Trade::new(1000.0, 1.0, ts, TradeSide::Buy)])
            .await
            .unwrap();
        (trader, rx)
    }

    #[tokio::test]
    async fn buy_applies_positive_slippage() {
        let (trader, mut rx) = trader(10_000.0, 10.0, Some(1.0)).await;
        trader.execute(request(ActionKind::Buy)).await.unwrap();

        let expected = 1000.0 * (1.0 + 10.0 / 10_000.0);
        match rx.recv().await.unwrap() {
            TraderEvent::Trade { action, order, info, .. } => {
                assert_eq!(action, TradeAction::Buy);
                assert!((order.rate - expected).abs() < 1e-6);
                assert_eq!(order.amount, 1.0);
                assert_eq!(info.strategy, "rsi");
                assert!(info.profit_loss.is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await.unwrap() {
            TraderEvent::SyncPortfolio { balance, position, .. } => {
                assert!((balance - (10_000.0 - expected)).abs() < 1e-6);
                assert_eq!(position.unwrap().amount, 1.0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn buy_is_capped_by_balance() {
        let (trader, _rx) = trader(500.0, 0.0, Some(1.0)).await;
        trader.execute(request(ActionKind::Buy)).await.unwrap();
        assert!((trader.position(&pair()).await.unwrap().amount - 0.5).abs() < 1e-9);
        assert!(trader.balance().await.abs() < 1e-9);
    }

    #[tokio::test]
    async fn sell_without_position_is_skipped() {
        let (trader, mut rx) = trader(10_000.0, 0.0, Some(1.0)).await;
        trader.execute(request(ActionKind::Sell)).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(trader.balance().await, 10_000.0);
    }

    #[tokio::test]
    async fn close_sells_everything_and_reports_profit() {
        let (trader, mut rx) = trader(10_000.0, 0.0, Some(2.0)).await;
        trader.execute(request(ActionKind::Buy)).await.unwrap();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();
        trader
            .on_trades(&pair(), &[Trade::new(1100.0, 1.0, ts, TradeSide::Sell)])
            .await
            .unwrap();
        trader.execute(request(ActionKind::Close)).await.unwrap();

        let events: Vec<TraderEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(events.len(), 4);
        match &events[2] {
            TraderEvent::Trade { action, order, info, .. } => {
                assert_eq!(*action, TradeAction::Close);
                assert_eq!(order.amount, 2.0);
                assert_eq!(order.timestamp, ts);
                assert!((info.profit_loss.unwrap() - 200.0).abs() < 1e-9);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(trader.position(&pair()).await.is_none());
        assert!((trader.balance().await - 10_200.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn hold_does_nothing() {
        let (trader, mut rx) = trader(10_000.0, 0.0, None).await;
        trader.execute(request(ActionKind::Hold)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn candle_close_prices_fills_without_trades() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let trader = PaperTrader::new(1, 10_000.0, 0.0, Some(1.0), tx);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candle = Candle::empty(pair(), start, 15, 2000.0);
        trader.on_candle(&candle).await.unwrap();
        trader.execute(request(ActionKind::Buy)).await.unwrap();

        match rx.recv().await.unwrap() {
            TraderEvent::Trade { order, .. } => {
                assert_eq!(order.rate, 2000.0);
                assert_eq!(order.timestamp, candle.end());
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!((trader.balance().await - 8_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn older_candle_does_not_override_newer_trade() {
        let (trader, _rx) = trader(10_000.0, 0.0, Some(1.0)).await;
        let start = Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap();
        trader.on_candle(&Candle::empty(pair(), start, 1, 500.0)).await.unwrap();
        trader.execute(request(ActionKind::Buy)).await.unwrap();
        assert!((trader.balance().await - 9_000.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_price_is_an_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let trader = PaperTrader::new(1, 10_000.0, 0.0, None, tx);
        assert!(trader.execute(request(ActionKind::Buy)).await.is_err());
    }
}
