use std::any::Any;
use std::fmt::Display;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use common::{
    Action, ActionKind, Candle, Error, Result, ServerConfig, StrategyId, StrategyRef, StrategySnapshot,
    Trade, TraderEvent,
};

use crate::config::ResolvedStrategy;
use crate::market::MarketState;
use crate::Strategy;

/// Retention bounds of the market state.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub keep_candles: usize,
    pub keep_1min_candles: usize,
}

impl From<&ServerConfig> for RuntimeSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            keep_candles: cfg.keep_candles,
            keep_1min_candles: cfg.keep_1min_candles,
        }
    }
}

/// Signal sent from a strategy runtime to the advisor.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyEvent {
    pub strategy: StrategyId,
    pub kind: StrategyEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyEventKind {
    TickStarted,
    TickDone,
    /// Candle tick of the given interval in minutes.
    CandleTickStarted(u32),
    CandleTickDone(u32),
    Action(Action),
}

// ─── Tick context ─────────────────────────────────────────────────────────────

/// What a strategy sees during one tick.
pub struct TickContext<'a> {
    strategy: &'a StrategyRef,
    market: &'a MarketState,
    events: &'a mpsc::UnboundedSender<StrategyEvent>,
    enable_log: bool,
}

impl<'a> TickContext<'a> {
    pub fn strategy(&self) -> &StrategyRef {
        self.strategy
    }

    pub fn market(&self) -> &MarketState {
        self.market
    }

    /// Recommend an action for the current decision cycle.
    ///
    /// `exchange` defaults to the exchange of the latest trade. Use
    /// [`Action::MAX_WEIGHT`] to execute without waiting for the other
    /// strategies of the pair.
    pub fn emit(&self, kind: ActionKind, weight: f64, reason: impl Into<String>, exchange: Option<&str>) {
        let reason = reason.into();
        if weight.is_nan() {
            warn!(strategy = %self.strategy.name, pair = %self.strategy.config_pair, action = %kind, "Dropping action with NaN weight");
            return;
        }
        let action = Action {
            kind,
            weight,
            reason,
            exchange: exchange.or(self.market.exchange()).map(str::to_string),
            strategy: self.strategy.clone(),
        };
        debug!(strategy = %self.strategy.name, pair = %self.strategy.config_pair, action = %kind, weight, "Action emitted");
        let _ = self.events.send(StrategyEvent {
            strategy: self.strategy.id,
            kind: StrategyEventKind::Action(action),
        });
    }

    /// Strategy log line, printed only when the strategy has `enable_log`.
    pub fn log(&self, message: impl Display) {
        if self.enable_log {
            info!(strategy = %self.strategy.name, pair = %self.strategy.config_pair, "{message}");
        }
    }
}

// ─── Handle ───────────────────────────────────────────────────────────────────

enum Command {
    Trades(Vec<Trade>),
    Candle(Candle),
    MinuteCandle(Candle),
    CurrentCandle(Candle),
    Trader(TraderEvent),
    Serialize(oneshot::Sender<StrategySnapshot>),
    Restore(StrategySnapshot, oneshot::Sender<Result<()>>),
}

/// Owning side of one strategy instance.
///
/// Every call is queued and the worker task runs them strictly one at a
/// time in call order. Tick-started signals are sent on the event channel
/// before the tick is queued, so they always precede the matching done
/// signal.
pub struct StrategyHandle {
    info: StrategyRef,
    candle_size: Option<u32>,
    save_state: bool,
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedSender<StrategyEvent>,
}

impl StrategyHandle {
    /// Start the worker task for `strategy`. Must run inside a tokio runtime.
    pub fn spawn(
        info: StrategyRef,
        cfg: &ResolvedStrategy,
        strategy: Box<dyn Strategy>,
        settings: RuntimeSettings,
        events: mpsc::UnboundedSender<StrategyEvent>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            info: info.clone(),
            candle_size: cfg.candle_size,
            strategy,
            market: MarketState::new(
                info.config_pair.pair.clone(),
                cfg.candle_size,
                settings.keep_candles,
                settings.keep_1min_candles,
            ),
            commands: command_rx,
            events: events.clone(),
            enable_log: cfg.enable_log,
        };
        tokio::spawn(worker.run());

        Self {
            info,
            candle_size: cfg.candle_size,
            save_state: cfg.save_state,
            commands,
            events,
        }
    }

    pub fn info(&self) -> &StrategyRef {
        &self.info
    }

    pub fn id(&self) -> StrategyId {
        self.info.id
    }

    pub fn candle_size(&self) -> Option<u32> {
        self.candle_size
    }

    pub fn save_state(&self) -> bool {
        self.save_state
    }

    /// Queue a trade tick.
    pub fn on_trades(&self, trades: Vec<Trade>) {
        self.signal(StrategyEventKind::TickStarted);
        if self.commands.send(Command::Trades(trades)).is_err() {
            warn!(strategy = %self.info.name, pair = %self.info.config_pair, "Strategy worker gone, closing tick");
            self.signal(StrategyEventKind::TickDone);
        }
    }

    /// Queue a candle tick if the candle matches the configured interval.
    /// Returns whether the tick was started.
    pub fn on_candle(&self, candle: Candle) -> bool {
        if self.candle_size != Some(candle.interval) {
            return false;
        }
        let interval = candle.interval;
        self.signal(StrategyEventKind::CandleTickStarted(interval));
        if self.commands.send(Command::Candle(candle)).is_err() {
            warn!(strategy = %self.info.name, pair = %self.info.config_pair, interval, "Strategy worker gone, closing candle tick");
            self.signal(StrategyEventKind::CandleTickDone(interval));
        }
        true
    }

    /// Feed the 1-minute history. Not synchronized.
    pub fn on_minute_candle(&self, candle: Candle) {
        self.enqueue(Command::MinuteCandle(candle));
    }

    /// Preview of the forming candle. Not synchronized.
    pub fn on_current_candle(&self, candle: Candle) {
        self.enqueue(Command::CurrentCandle(candle));
    }

    /// Trade confirmation or portfolio sync from the trader.
    pub fn on_trader_event(&self, event: TraderEvent) {
        self.enqueue(Command::Trader(event));
    }

    /// Snapshot taken after every tick queued so far.
    pub async fn serialize(&self) -> Result<StrategySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Serialize(tx))
            .map_err(|_| Error::ChannelClosed("strategy commands"))?;
        rx.await.map_err(|_| Error::ChannelClosed("strategy snapshot"))
    }

    /// Whether `snapshot` was taken under the running candle size.
    pub fn can_restore(&self, snapshot: &StrategySnapshot) -> bool {
        snapshot.running_candle_size == self.candle_size
    }

    /// Replace the market history and strategy memory with `snapshot`.
    ///
    /// Returns `Ok(false)` without touching anything when the snapshot was
    /// taken under a different candle size. A snapshot the strategy rejects
    /// is an error and also leaves the live state as it was.
    pub async fn restore(&self, snapshot: StrategySnapshot) -> Result<bool> {
        if !self.can_restore(&snapshot) {
            warn!(
                strategy = %self.info.name,
                pair = %self.info.config_pair,
                saved = ?snapshot.running_candle_size,
                running = ?self.candle_size,
                "Candle size changed, not restoring state"
            );
            return Ok(false);
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Restore(snapshot, tx))
            .map_err(|_| Error::ChannelClosed("strategy commands"))?;
        rx.await.map_err(|_| Error::ChannelClosed("strategy restore"))??;
        Ok(true)
    }

    fn enqueue(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(strategy = %self.info.name, pair = %self.info.config_pair, "Strategy worker gone, dropping update");
        }
    }

    fn signal(&self, kind: StrategyEventKind) {
        let _ = self.events.send(StrategyEvent {
            strategy: self.info.id,
            kind,
        });
    }
}

// ─── Worker ───────────────────────────────────────────────────────────────────

struct Worker {
    info: StrategyRef,
    candle_size: Option<u32>,
    strategy: Box<dyn Strategy>,
    market: MarketState,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<StrategyEvent>,
    enable_log: bool,
}

impl Worker {
    async fn run(mut self) {
        debug!(strategy = %self.info.name, pair = %self.info.config_pair, "Strategy worker running");
        while let Some(command) = self.commands.recv().await {
            self.handle(command).await;
        }
        debug!(strategy = %self.info.name, pair = %self.info.config_pair, "Strategy worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Trades(trades) => {
                self.market.apply_trades(&trades);
                let ctx = TickContext {
                    strategy: &self.info,
                    market: &self.market,
                    events: &self.events,
                    enable_log: self.enable_log,
                };
                let outcome = AssertUnwindSafe(self.strategy.tick(&ctx, &trades))
                    .catch_unwind()
                    .await;
                self.report("tick", outcome);
                self.signal(StrategyEventKind::TickDone);
            }

            Command::Candle(candle) => {
                let interval = candle.interval;
                self.market.push_candle(candle.clone());
                let ctx = TickContext {
                    strategy: &self.info,
                    market: &self.market,
                    events: &self.events,
                    enable_log: self.enable_log,
                };
                let outcome = AssertUnwindSafe(self.strategy.candle_tick(&ctx, &candle))
                    .catch_unwind()
                    .await;
                self.report("candle tick", outcome);
                self.signal(StrategyEventKind::CandleTickDone(interval));
            }

            Command::MinuteCandle(candle) => self.market.push_minute_candle(candle),

            Command::CurrentCandle(candle) => {
                let is_new = self.market.set_current_candle(candle.clone());
                let ctx = TickContext {
                    strategy: &self.info,
                    market: &self.market,
                    events: &self.events,
                    enable_log: self.enable_log,
                };
                let outcome = AssertUnwindSafe(self.strategy.current_candle_tick(&ctx, &candle, is_new))
                    .catch_unwind()
                    .await;
                self.report("current candle", outcome);
            }

            Command::Trader(event) => {
                let strategy = &mut self.strategy;
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match &event {
                    TraderEvent::Trade {
                        action,
                        order,
                        trades,
                        info,
                        ..
                    } => strategy.on_trade(*action, order, trades, info),
                    TraderEvent::SyncPortfolio {
                        balance,
                        position,
                        exchange,
                        ..
                    } => strategy.on_sync_portfolio(*balance, position.as_ref(), exchange.as_deref()),
                }));
                self.report("trader event", outcome.map(Ok));
            }

            Command::Serialize(reply) => {
                let snapshot = StrategySnapshot {
                    running_candle_size: self.candle_size,
                    candle_history: self.market.candle_history_vec(),
                    candles_1min: self.market.candles_1min_vec(),
                    custom: self.strategy.serialize(),
                };
                let _ = reply.send(snapshot);
            }

            Command::Restore(snapshot, reply) => {
                let result = self.strategy.restore(&snapshot.custom);
                match &result {
                    Ok(()) => {
                        let candles = snapshot.candle_history.len();
                        self.market
                            .replace_history(snapshot.candle_history, snapshot.candles_1min);
                        info!(strategy = %self.info.name, pair = %self.info.config_pair, candles, "Restored strategy state");
                    }
                    Err(e) => {
                        warn!(strategy = %self.info.name, pair = %self.info.config_pair, error = %e, "Strategy rejected saved state");
                    }
                }
                let _ = reply.send(result);
            }
        }
    }

    /// Log a failed or panicked strategy call. Either counts as no action.
    fn report(&self, what: &str, outcome: std::result::Result<Result<()>, Box<dyn Any + Send>>) {
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(strategy = %self.info.name, pair = %self.info.config_pair, error = %e, "Strategy {what} failed");
            }
            Err(panic) => {
                error!(
                    strategy = %self.info.name,
                    pair = %self.info.config_pair,
                    panic = panic_message(panic.as_ref()),
                    "Strategy {what} panicked"
                );
            }
        }
    }

    fn signal(&self, kind: StrategyEventKind) {
        let _ = self.events.send(StrategyEvent {
            strategy: self.info.id,
            kind,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
