use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use candles::{CandleBatcher, CandleMaker, MakerOutput};
use common::{
    volume_weighted_price, Action, Candle, Checkpoint, ConfigCurrencyPair, CurrencyPair, Error, ExecutionRequest,
    FanInPolicy, MarketEvent, Result, ServerConfig, StrategyId, StrategyRef, StrategySnapshot, Trade, Trader,
    TraderEvent,
};
use strategy::{RuntimeSettings, StrategyEvent, StrategyEventKind, StrategyHandle, StrategyRegistry, TradeConfig};

use crate::arbiter::{ActionArbitrator, Submission};
use crate::executor::{TraderCommand, TraderExecutor};
use crate::sync::{DoneOutcome, SyncScope, SyncTracker};

/// Advisor settings taken from the server configuration.
#[derive(Debug, Clone)]
pub struct AdvisorSettings {
    pub runtime: RuntimeSettings,
    pub embed_trades: bool,
    pub max_gap_minutes: u32,
    pub main_strategy_always_trade: bool,
    pub arbitrage: bool,
    /// Minimum market time between trade ticks of a pair. 0 forwards every batch.
    pub forward_trades_sec: u64,
    pub trade_fan_in: FanInPolicy,
    pub search_all_pairs_for_state: bool,
}

impl From<&ServerConfig> for AdvisorSettings {
    fn from(cfg: &ServerConfig) -> Self {
        Self {
            runtime: RuntimeSettings::from(cfg),
            embed_trades: cfg.embed_trades,
            max_gap_minutes: cfg.max_gap_minutes,
            main_strategy_always_trade: cfg.main_strategy_always_trade,
            arbitrage: cfg.arbitrage,
            forward_trades_sec: cfg.forward_trades_sec,
            trade_fan_in: cfg.trade_fan_in,
            search_all_pairs_for_state: cfg.search_all_pairs_for_state,
        }
    }
}

/// Key of a candle maker and its batchers. Carries the exchange in
/// arbitrage mode only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedKey {
    pub exchange: Option<String>,
    pub pair: CurrencyPair,
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.exchange {
            Some(exchange) => write!(f, "{exchange}-{}", self.pair),
            None => write!(f, "{}", self.pair),
        }
    }
}

/// Outcome of [`AdvisorHandle::restore_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub skipped: usize,
}

pub enum AdvisorCommand {
    Heartbeat,
    /// Process every queued market event, then reply with their count.
    Drain(oneshot::Sender<usize>),
    Serialize(oneshot::Sender<Result<Checkpoint>>),
    Restore(Checkpoint, oneshot::Sender<RestoreReport>),
    Shutdown,
}

/// Cloneable handle for the feed, the binary and tests.
#[derive(Clone)]
pub struct AdvisorHandle {
    commands: mpsc::Sender<AdvisorCommand>,
    market: mpsc::Sender<MarketEvent>,
}

impl AdvisorHandle {
    /// Push one decoded exchange event.
    pub async fn publish(&self, event: MarketEvent) -> Result<()> {
        self.market
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed("advisor market feed"))
    }

    pub fn market_sender(&self) -> mpsc::Sender<MarketEvent> {
        self.market.clone()
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.send(AdvisorCommand::Heartbeat).await
    }

    /// Returns once every market event published before the call has been
    /// handed to the strategies. Commands sent afterwards reach each
    /// strategy behind those ticks.
    pub async fn drain(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(AdvisorCommand::Drain(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed("advisor drain"))
    }

    /// Snapshot of every strategy with `save_state`.
    pub async fn serialize_all(&self) -> Result<Checkpoint> {
        let (tx, rx) = oneshot::channel();
        self.send(AdvisorCommand::Serialize(tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed("advisor serialize"))?
    }

    pub async fn restore_all(&self, checkpoint: Checkpoint) -> Result<RestoreReport> {
        let (tx, rx) = oneshot::channel();
        self.send(AdvisorCommand::Restore(checkpoint, tx)).await?;
        rx.await.map_err(|_| Error::ChannelClosed("advisor restore"))
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(AdvisorCommand::Shutdown).await;
    }

    async fn send(&self, command: AdvisorCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::ChannelClosed("advisor commands"))
    }
}

#[derive(Debug, Default)]
struct TradeThrottle {
    pending: Vec<Trade>,
    last_sent: Option<DateTime<Utc>>,
}

/// Wires the market feed through candle makers and batchers into the
/// strategies, arbitrates their actions and hands winners to the traders.
///
/// Runs as a single task that owns the synchronization tracker and the
/// arbitrator. Strategies and traders run in their own tasks. Run it on a
/// current-thread runtime: tick-started signals reach the advisor in the
/// order the ticks were handed out only when no strategy task runs while
/// the advisor is dispatching.
pub struct Advisor {
    settings: AdvisorSettings,

    /// Arena indexed by [`StrategyId`].
    strategies: Vec<StrategyHandle>,
    by_config_pair: HashMap<ConfigCurrencyPair, Vec<StrategyId>>,
    by_pair: HashMap<CurrencyPair, Vec<StrategyId>>,
    /// Configurations trading a pair.
    pair_configs: HashMap<CurrencyPair, BTreeSet<usize>>,
    /// Configurations subscribed to (exchange, pair).
    subscriptions: HashMap<(String, CurrencyPair), Vec<usize>>,

    makers: BTreeMap<FeedKey, CandleMaker>,
    /// Sorted by interval, the last one being the max batcher.
    batchers: BTreeMap<FeedKey, Vec<CandleBatcher>>,
    executors: HashMap<usize, mpsc::UnboundedSender<TraderCommand>>,

    tracker: SyncTracker,
    arbiter: ActionArbitrator,
    throttles: HashMap<ConfigCurrencyPair, TradeThrottle>,
    heartbeats: u64,

    market_rx: mpsc::Receiver<MarketEvent>,
    strategy_rx: mpsc::UnboundedReceiver<StrategyEvent>,
    trader_rx: mpsc::UnboundedReceiver<TraderEvent>,
    command_rx: mpsc::Receiver<AdvisorCommand>,
}

impl Advisor {
    /// Build every strategy, maker, batcher and trader executor of the
    /// validated `configs`. Nothing is spawned unless every strategy could
    /// be built. Must run inside a tokio runtime.
    ///
    /// `traders` maps configuration indices to their trader, which reports
    /// back on the sender paired with `trader_events`.
    pub fn new(
        server: &ServerConfig,
        configs: &[TradeConfig],
        registry: &StrategyRegistry,
        traders: HashMap<usize, Arc<dyn Trader>>,
        trader_events: mpsc::UnboundedReceiver<TraderEvent>,
    ) -> Result<(Self, AdvisorHandle)> {
        let settings = AdvisorSettings::from(server);

        if configs.is_empty() {
            return Err(Error::Config("no trade configuration".into()));
        }
        for config in configs {
            if !traders.contains_key(&config.index) {
                return Err(Error::Config(format!("no trader for config #{}", config.index)));
            }
        }

        let mut built = Vec::new();
        for resolved in configs.iter().flat_map(|c| &c.strategies) {
            built.push((resolved, registry.build(resolved)?));
        }

        let mut subscriptions: HashMap<(String, CurrencyPair), Vec<usize>> = HashMap::new();
        let mut pair_configs: HashMap<CurrencyPair, BTreeSet<usize>> = HashMap::new();
        let mut makers = BTreeMap::new();
        let mut intervals: BTreeMap<FeedKey, BTreeSet<u32>> = BTreeMap::new();
        for config in configs {
            for market in &config.markets {
                pair_configs.entry(market.clone()).or_default().insert(config.index);
                let sizes: BTreeSet<u32> = config
                    .strategies
                    .iter()
                    .filter(|s| &s.config_pair.pair == market)
                    .filter_map(|s| s.candle_size)
                    .filter(|&size| size > 1)
                    .collect();

                for exchange in &config.exchanges {
                    subscriptions
                        .entry((exchange.clone(), market.clone()))
                        .or_default()
                        .push(config.index);
                    let key = FeedKey {
                        exchange: settings.arbitrage.then(|| exchange.clone()),
                        pair: market.clone(),
                    };
                    makers.entry(key.clone()).or_insert_with(|| {
                        CandleMaker::new(market.clone(), key.exchange.clone())
                            .with_embedded_trades(settings.embed_trades)
                            .with_max_gap(settings.max_gap_minutes)
                    });
                    intervals.entry(key).or_default().extend(sizes.iter().copied());
                }
            }
        }

        let mut batchers = BTreeMap::new();
        for (key, sizes) in intervals {
            let mut list = sizes
                .into_iter()
                .map(|size| CandleBatcher::new(key.pair.clone(), size))
                .collect::<Result<Vec<_>>>()?;
            if let Some(max) = list.last_mut() {
                max.set_max(true);
            }
            batchers.insert(key, list);
        }

        let mut executors = HashMap::new();
        for (index, trader) in traders {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(TraderExecutor::new(index, trader, rx).run());
            executors.insert(index, tx);
        }

        let (strategy_tx, strategy_rx) = mpsc::unbounded_channel();
        let mut strategies = Vec::with_capacity(built.len());
        let mut by_config_pair: HashMap<ConfigCurrencyPair, Vec<StrategyId>> = HashMap::new();
        let mut by_pair: HashMap<CurrencyPair, Vec<StrategyId>> = HashMap::new();
        for (resolved, strategy) in built {
            let id = StrategyId(strategies.len());
            let info = StrategyRef {
                id,
                name: resolved.kind.clone(),
                config_pair: resolved.config_pair.clone(),
                is_main: resolved.is_main,
            };
            info!(
                id = %id,
                strategy = %info.name,
                pair = %info.config_pair,
                candle_size = ?resolved.candle_size,
                main = info.is_main,
                "Registered strategy"
            );
            strategies.push(StrategyHandle::spawn(info, resolved, strategy, settings.runtime, strategy_tx.clone()));
            by_config_pair.entry(resolved.config_pair.clone()).or_default().push(id);
            by_pair.entry(resolved.config_pair.pair.clone()).or_default().push(id);
        }

        let (command_tx, command_rx) = mpsc::channel(32);
        let (market_tx, market_rx) = mpsc::channel(1024);

        let advisor = Self {
            arbiter: ActionArbitrator::new(settings.main_strategy_always_trade),
            settings,
            strategies,
            by_config_pair,
            by_pair,
            pair_configs,
            subscriptions,
            makers,
            batchers,
            executors,
            tracker: SyncTracker::new(),
            throttles: HashMap::new(),
            heartbeats: 0,
            market_rx,
            strategy_rx,
            trader_rx: trader_events,
            command_rx,
        };
        advisor.log_subscriptions();

        let handle = AdvisorHandle {
            commands: command_tx,
            market: market_tx,
        };
        Ok((advisor, handle))
    }

    /// Run the advisor loop. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!(strategies = self.strategies.len(), makers = self.makers.len(), "Advisor running");
        loop {
            tokio::select! {
                // close open cycles before handing out new ticks
                biased;

                Some(event) = self.strategy_rx.recv() => self.on_strategy_event(event),

                Some(event) = self.trader_rx.recv() => self.on_trader_event(event),

                command = self.command_rx.recv() => match command {
                    Some(AdvisorCommand::Heartbeat) => self.process_heartbeat(),
                    Some(AdvisorCommand::Drain(reply)) => {
                        let _ = reply.send(self.drain_market());
                    }
                    Some(AdvisorCommand::Serialize(reply)) => {
                        let _ = reply.send(self.serialize_all().await);
                    }
                    Some(AdvisorCommand::Restore(checkpoint, reply)) => {
                        let _ = reply.send(self.restore_all(checkpoint).await);
                    }
                    Some(AdvisorCommand::Shutdown) | None => {
                        info!("Advisor shutting down");
                        break;
                    }
                },

                Some(event) = self.market_rx.recv() => self.on_market_event(event),

                else => {
                    warn!("All advisor channels closed");
                    break;
                }
            }
        }
    }

    /// Periodic hook. Only counts and logs for now.
    pub fn process_heartbeat(&mut self) {
        self.heartbeats += 1;
        let pending: usize = self.by_pair.keys().map(|p| self.arbiter.pending(p)).sum();
        debug!(heartbeats = self.heartbeats, pending_actions = pending, "Heartbeat");
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    pub async fn serialize_all(&self) -> Result<Checkpoint> {
        let mut checkpoint = Checkpoint::new();
        let mut count = 0;
        for handle in self.strategies.iter().filter(|h| h.save_state()) {
            let snapshot = handle.serialize().await?;
            checkpoint.insert(&handle.info().config_pair, &handle.info().name, &snapshot)?;
            count += 1;
        }
        info!(strategies = count, "Serialized strategy state");
        Ok(checkpoint)
    }

    /// Restore every strategy with `save_state` from `checkpoint`. Missing,
    /// malformed or mismatched entries are skipped with a warning.
    pub async fn restore_all(&self, checkpoint: Checkpoint) -> RestoreReport {
        let mut report = RestoreReport::default();
        for handle in self.strategies.iter().filter(|h| h.save_state()) {
            let info = handle.info();
            let Some(raw) = self.find_state(&checkpoint, info) else {
                warn!(strategy = %info.name, pair = %info.config_pair, "No saved state");
                report.skipped += 1;
                continue;
            };
            let snapshot: StrategySnapshot = match serde_json::from_value(raw.clone()) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(strategy = %info.name, pair = %info.config_pair, error = %e, "Malformed saved state");
                    report.skipped += 1;
                    continue;
                }
            };
            match handle.restore(snapshot).await {
                Ok(true) => report.restored += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(strategy = %info.name, pair = %info.config_pair, error = %e, "Failed to restore state");
                    report.skipped += 1;
                }
            }
        }
        info!(restored = report.restored, skipped = report.skipped, "Restored strategy state");
        report
    }

    fn find_state<'a>(&self, checkpoint: &'a Checkpoint, info: &StrategyRef) -> Option<&'a serde_json::Value> {
        if let Some(state) = checkpoint.get(&info.config_pair).and_then(|s| s.get(&info.name)) {
            return Some(state);
        }
        if !self.settings.search_all_pairs_for_state {
            return None;
        }
        checkpoint
            .keys()
            .filter_map(|key| key.parse::<ConfigCurrencyPair>().ok())
            .filter(|key| key.pair == info.config_pair.pair && key.config != info.config_pair.config)
            .find_map(|key| {
                let state = checkpoint.get(&key)?.get(&info.name)?;
                info!(strategy = %info.name, pair = %info.config_pair, source = %key, "Using saved state of another config");
                Some(state)
            })
    }

    // ─── Market feed ──────────────────────────────────────────────────────────

    fn on_market_event(&mut self, event: MarketEvent) {
        match event {
            MarketEvent::Trades {
                exchange,
                pair,
                mut trades,
            } => {
                let Some(configs) = self.subscriptions.get(&(exchange.clone(), pair.clone())).cloned() else {
                    debug!(exchange = %exchange, pair = %pair, "Trades for unsubscribed market");
                    return;
                };
                if trades.is_empty() {
                    return;
                }
                for trade in &mut trades {
                    trade.exchange.get_or_insert_with(|| exchange.clone());
                }

                let forwarded = fan_in(self.settings.trade_fan_in, &trades);
                for &config in &configs {
                    self.forward_trades(ConfigCurrencyPair::new(config, pair.clone()), forwarded.clone());
                }

                let key = self.feed_key(&exchange, &pair);
                if let Some(maker) = self.makers.get_mut(&key) {
                    let output = maker.add_trades(&trades);
                    self.route_candles(&key, output);
                }

                for &config in &configs {
                    self.send_trader(
                        config,
                        TraderCommand::Trades {
                            pair: pair.clone(),
                            trades: trades.clone(),
                        },
                    );
                }
            }

            MarketEvent::Candles {
                exchange,
                pair,
                candles,
            } => {
                if !self.subscriptions.contains_key(&(exchange.clone(), pair.clone())) {
                    debug!(exchange = %exchange, pair = %pair, "Candles for unsubscribed market");
                    return;
                }
                let key = self.feed_key(&exchange, &pair);
                if let Some(maker) = self.makers.get_mut(&key) {
                    let output = maker.add_candles(candles);
                    self.route_candles(&key, output);
                }
            }
        }
    }

    fn drain_market(&mut self) -> usize {
        let mut drained = 0;
        while let Ok(event) = self.market_rx.try_recv() {
            self.on_market_event(event);
            drained += 1;
        }
        debug!(events = drained, "Market feed drained");
        drained
    }

    fn feed_key(&self, exchange: &str, pair: &CurrencyPair) -> FeedKey {
        FeedKey {
            exchange: self.settings.arbitrage.then(|| exchange.to_string()),
            pair: pair.clone(),
        }
    }

    /// Hand trades to the strategies of `key`, at most once per throttle
    /// interval of market time.
    fn forward_trades(&mut self, key: ConfigCurrencyPair, trades: Vec<Trade>) {
        let interval = self.settings.forward_trades_sec;
        if interval == 0 {
            self.dispatch_trades(&key, trades);
            return;
        }
        let Some(now) = trades.last().map(|t| t.timestamp) else {
            return;
        };
        let throttle = self.throttles.entry(key.clone()).or_default();
        throttle.pending.extend(trades);
        let due = throttle
            .last_sent
            .map_or(true, |last| (now - last).num_seconds() >= i64::try_from(interval).unwrap_or(i64::MAX));
        if !due {
            return;
        }
        throttle.last_sent = Some(now);
        let batch = std::mem::take(&mut throttle.pending);
        self.dispatch_trades(&key, batch);
    }

    fn dispatch_trades(&self, key: &ConfigCurrencyPair, trades: Vec<Trade>) {
        let Some(ids) = self.by_config_pair.get(key) else {
            return;
        };
        for id in ids {
            self.strategies[id.0].on_trades(trades.clone());
        }
    }

    fn route_candles(&mut self, key: &FeedKey, output: MakerOutput) {
        let MakerOutput { closed, current } = output;
        let has_batchers = self.batchers.get(key).is_some_and(|b| !b.is_empty());

        for minute in closed {
            // without batchers the 1-minute pass-through is the largest interval
            self.dispatch_candle(&minute, true, !has_batchers);

            let batched: Vec<(Candle, bool)> = match self.batchers.get_mut(key) {
                Some(list) => list
                    .iter_mut()
                    .filter_map(|b| {
                        let is_max = b.is_max();
                        b.add_candle(minute.clone()).map(|c| (c, is_max))
                    })
                    .collect(),
                None => Vec::new(),
            };
            for (candle, is_max) in batched {
                self.dispatch_candle(&candle, false, is_max);
            }
        }

        if let Some(current) = current {
            if let Some(ids) = self.by_pair.get(&key.pair) {
                for id in ids {
                    self.strategies[id.0].on_current_candle(current.clone());
                }
            }
        }
    }

    fn dispatch_candle(&self, candle: &Candle, is_minute: bool, to_traders: bool) {
        if let Some(ids) = self.by_pair.get(&candle.pair) {
            for id in ids {
                let handle = &self.strategies[id.0];
                if is_minute {
                    handle.on_minute_candle(candle.clone());
                }
                handle.on_candle(candle.clone());
            }
        }
        if to_traders {
            if let Some(configs) = self.pair_configs.get(&candle.pair) {
                for &config in configs {
                    self.send_trader(config, TraderCommand::Candle(candle.clone()));
                }
            }
        }
    }

    // ─── Strategy signals ─────────────────────────────────────────────────────

    fn on_strategy_event(&mut self, event: StrategyEvent) {
        let Some(handle) = self.strategies.get(event.strategy.0) else {
            warn!(strategy = %event.strategy, "Event from unknown strategy");
            return;
        };
        let pair = handle.info().config_pair.pair.clone();
        let name = handle.info().name.clone();

        match event.kind {
            StrategyEventKind::TickStarted => {
                self.tracker.started(SyncScope::Ticks(pair));
            }
            StrategyEventKind::CandleTickStarted(interval) => {
                self.tracker.started(SyncScope::Candles(pair, interval));
            }
            StrategyEventKind::TickDone => self.finish(SyncScope::Ticks(pair), &name),
            StrategyEventKind::CandleTickDone(interval) => self.finish(SyncScope::Candles(pair, interval), &name),
            StrategyEventKind::Action(action) => self.submit(action),
        }
    }

    fn finish(&mut self, scope: SyncScope, strategy: &str) {
        match self.tracker.done(&scope) {
            DoneOutcome::Pending(_) => {}
            DoneOutcome::Resolve => {
                if let Some(action) = self.arbiter.resolve(scope.pair()) {
                    self.execute(action);
                }
            }
            DoneOutcome::Unbalanced if self.arbiter.has_pending(scope.pair()) => {
                warn!(scope = %scope, strategy = %strategy, "Strategy sent more done than started signals");
            }
            DoneOutcome::Unbalanced => {
                debug!(scope = %scope, strategy = %strategy, "Ignoring done signal of an idle scope");
            }
        }
    }

    fn submit(&mut self, action: Action) {
        match self.arbiter.submit(action) {
            Submission::Queued => {}
            Submission::Execute(action) => {
                self.tracker.reset_pair(action.pair());
                self.execute(action);
            }
        }
    }

    fn execute(&self, action: Action) {
        let config = action.strategy.config_pair.config;
        info!(
            pair = %action.strategy.config_pair,
            action = %action.kind,
            weight = action.weight,
            strategy = %action.strategy.name,
            reason = %action.reason,
            "Executing winning action"
        );
        let request = ExecutionRequest {
            action: action.kind,
            reason: action.reason,
            exchange: action.exchange,
            strategy: action.strategy,
        };
        self.send_trader(config, TraderCommand::Execute(request));
    }

    // ─── Trader events ────────────────────────────────────────────────────────

    fn on_trader_event(&mut self, event: TraderEvent) {
        if let TraderEvent::Trade {
            config,
            action,
            order,
            info,
            ..
        } = &event
        {
            info!(
                config,
                pair = %order.pair,
                action = ?action,
                amount = order.amount,
                rate = order.rate,
                strategy = %info.strategy,
                "Trade executed"
            );
        }

        let key = ConfigCurrencyPair::new(event.config(), event.pair().clone());
        let Some(ids) = self.by_config_pair.get(&key) else {
            debug!(pair = %key, "No strategy interested in trader event");
            return;
        };
        for id in ids {
            self.strategies[id.0].on_trader_event(event.clone());
        }
    }

    fn send_trader(&self, config: usize, command: TraderCommand) {
        match self.executors.get(&config) {
            Some(tx) => {
                if tx.send(command).is_err() {
                    warn!(config, "Trader executor gone");
                }
            }
            None => warn!(config, "No trader for config"),
        }
    }

    fn log_subscriptions(&self) {
        for key in self.makers.keys() {
            info!(feed = %key, "Candle maker active");
        }
        for (key, list) in &self.batchers {
            for batcher in list {
                info!(feed = %key, interval = batcher.interval(), max = batcher.is_max(), "Candle batcher active");
            }
        }
    }
}

/// Merge one exchange batch for strategies according to `policy`.
fn fan_in(policy: FanInPolicy, trades: &[Trade]) -> Vec<Trade> {
    match policy {
        FanInPolicy::Concatenate => trades.to_vec(),
        FanInPolicy::VolumeWeighted => {
            let (Some(last), Some(price)) = (trades.last(), volume_weighted_price(trades)) else {
                return Vec::new();
            };
            let mut merged = last.clone();
            merged.price = price;
            merged.volume = trades.iter().map(|t| t.volume).sum();
            vec![merged]
        }
    }
}
