use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;

use common::{
    Action, ActionKind, Candle, Checkpoint, ConfigCurrencyPair, CurrencyPair, Error, ExecutionRequest, MarketEvent,
    Result, ServerConfig, StrategySnapshot, Trade, TradeSide, Trader, TraderEvent,
};
use engine::{Advisor, AdvisorHandle, RestoreReport};
use paper::PaperTrader;
use strategy::registry::{param_bool, param_f64};
use strategy::{ResolvedStrategy, Strategy, StrategyRegistry, TickContext, TradeConfigFile};

// ─── Test strategies ──────────────────────────────────────────────────────────

/// Emits the same action on every candle tick.
struct Fixed {
    kind: String,
    action: ActionKind,
    weight: f64,
}

fn build_fixed(cfg: &ResolvedStrategy) -> Result<Box<dyn Strategy>> {
    let action = match cfg.params.get("action").and_then(|v| v.as_str()) {
        Some("sell") => ActionKind::Sell,
        Some("close") => ActionKind::Close,
        _ => ActionKind::Buy,
    };
    let weight = if param_bool(&cfg.params, "max", false) {
        Action::MAX_WEIGHT
    } else {
        param_f64(&cfg.params, "weight", 1.0)
    };
    Ok(Box::new(Fixed {
        kind: cfg.kind.clone(),
        action,
        weight,
    }))
}

#[async_trait]
impl Strategy for Fixed {
    fn name(&self) -> &str {
        &self.kind
    }

    async fn candle_tick(&mut self, ctx: &TickContext<'_>, _candle: &Candle) -> Result<()> {
        ctx.emit(self.action, self.weight, format!("{} says {}", self.kind, self.action), None);
        Ok(())
    }
}

/// Buys on every trade tick, naming the seconds of the trades it saw.
struct Echo;

fn build_echo(_cfg: &ResolvedStrategy) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(Echo))
}

#[async_trait]
impl Strategy for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn tick(&mut self, ctx: &TickContext<'_>, trades: &[Trade]) -> Result<()> {
        let seconds: Vec<String> = trades.iter().map(|t| t.timestamp.format("%S").to_string()).collect();
        ctx.emit(ActionKind::Buy, 1.0, seconds.join(","), None);
        Ok(())
    }
}

struct Silent;

fn build_silent(_cfg: &ResolvedStrategy) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(Silent))
}

#[async_trait]
impl Strategy for Silent {
    fn name(&self) -> &str {
        "silent"
    }
}

struct Panicking;

fn build_panicking(_cfg: &ResolvedStrategy) -> Result<Box<dyn Strategy>> {
    Ok(Box::new(Panicking))
}

#[async_trait]
impl Strategy for Panicking {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn candle_tick(&mut self, _ctx: &TickContext<'_>, _candle: &Candle) -> Result<()> {
        panic!("strategy bug");
    }
}

fn registry() -> StrategyRegistry {
    let mut registry = StrategyRegistry::with_builtin();
    registry.register("fixed_a", build_fixed);
    registry.register("fixed_b", build_fixed);
    registry.register("echo", build_echo);
    registry.register("silent", build_silent);
    registry.register("panicking", build_panicking);
    registry
}

// ─── Harness ──────────────────────────────────────────────────────────────────

/// Trader that only records what it was asked to execute.
struct RecordingTrader {
    executed: mpsc::UnboundedSender<ExecutionRequest>,
}

#[async_trait]
impl Trader for RecordingTrader {
    async fn execute(&self, request: ExecutionRequest) -> Result<()> {
        let _ = self.executed.send(request);
        Ok(())
    }

    async fn on_trades(&self, _pair: &CurrencyPair, _trades: &[Trade]) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    handle: AdvisorHandle,
    executed: mpsc::UnboundedReceiver<ExecutionRequest>,
}

impl Harness {
    fn start(content: &str, server: ServerConfig) -> Self {
        let registry = registry();
        let configs = TradeConfigFile::parse(content)
            .unwrap()
            .validate(&registry, &server)
            .unwrap();
        let (executed_tx, executed) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let mut traders: HashMap<usize, Arc<dyn Trader>> = HashMap::new();
        traders.insert(1, Arc::new(RecordingTrader { executed: executed_tx }));

        let (advisor, handle) = Advisor::new(&server, &configs, &registry, traders, events_rx).unwrap();
        tokio::spawn(advisor.run());
        Self { handle, executed }
    }

    async fn candles(&self, pair: CurrencyPair, minutes: &[i64]) {
        let candles = minutes.iter().map(|&m| minute(&pair, m, 100.0)).collect();
        self.handle
            .publish(MarketEvent::Candles {
                exchange: "paper".into(),
                pair,
                candles,
            })
            .await
            .unwrap();
    }

    async fn trade(&self, pair: CurrencyPair, second: i64, price: f64) {
        let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(second);
        self.handle
            .publish(MarketEvent::Trades {
                exchange: "paper".into(),
                pair,
                trades: vec![Trade::new(price, 1.0, ts, TradeSide::Buy)],
            })
            .await
            .unwrap();
    }

    async fn next_execution(&mut self) -> ExecutionRequest {
        tokio::time::timeout(Duration::from_secs(2), self.executed.recv())
            .await
            .expect("timed out waiting for an execution")
            .expect("executor closed")
    }

    async fn assert_idle(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(150), self.executed.recv()).await;
        assert!(extra.is_err(), "unexpected execution: {extra:?}");
    }
}

fn btc() -> CurrencyPair {
    CurrencyPair::new("BTC", "USDT")
}

fn minute(pair: &CurrencyPair, i: i64, close: f64) -> Candle {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(i);
    let mut candle = Candle::empty(pair.clone(), start, 1, close);
    candle.volume = 1.0;
    candle
}

const WEIGHTED: &str = r#"
    [[config]]
    markets = ["BTC_USDT"]
    exchanges = ["paper"]

    [[config.strategy]]
    type = "fixed_a"
    candle_size = 1
    [config.strategy.params]
    action = "buy"
    weight = 5.0

    [[config.strategy]]
    type = "fixed_b"
    candle_size = 1
    [config.strategy.params]
    action = "sell"
    weight = 8.0

    [[config.strategy]]
    type = "silent"
    candle_size = 1
"#;

// ─── Arbitration ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn highest_weight_wins_once_every_strategy_is_done() {
    let mut harness = Harness::start(WEIGHTED, ServerConfig::default());
    harness.candles(btc(), &[0]).await;

    let winner = harness.next_execution().await;
    assert_eq!(winner.action, ActionKind::Sell);
    assert_eq!(winner.strategy.name, "fixed_b");
    assert_eq!(winner.reason, "fixed_b says sell");
    assert_eq!(winner.exchange, None);
    harness.assert_idle().await;
}

#[tokio::test]
async fn every_cycle_resolves_exactly_once() {
    let mut harness = Harness::start(WEIGHTED, ServerConfig::default());
    for m in 0..3 {
        harness.candles(btc(), &[m]).await;
        assert_eq!(harness.next_execution().await.strategy.name, "fixed_b");
    }
    harness.assert_idle().await;
}

#[tokio::test]
async fn burst_of_candles_is_one_cycle() {
    let mut harness = Harness::start(WEIGHTED, ServerConfig::default());
    harness.candles(btc(), &[0, 1, 2]).await;
    assert_eq!(harness.next_execution().await.action, ActionKind::Sell);
    harness.assert_idle().await;
}

#[tokio::test]
async fn max_weight_executes_immediately_and_drops_pending() {
    let content = WEIGHTED
        .replace(r#"action = "sell""#, r#"action = "close""#)
        .replace("weight = 8.0", "max = true");
    let mut harness = Harness::start(&content, ServerConfig::default());
    harness.candles(btc(), &[0]).await;

    let winner = harness.next_execution().await;
    assert_eq!(winner.action, ActionKind::Close);
    assert_eq!(winner.strategy.name, "fixed_b");
    harness.assert_idle().await;
}

#[tokio::test]
async fn main_strategy_trades_without_arbitration_when_enabled() {
    let server = ServerConfig {
        main_strategy_always_trade: true,
        ..ServerConfig::default()
    };
    let content = WEIGHTED.replace("weight = 5.0", "weight = 1.0");
    let mut harness = Harness::start(&content, server);
    harness.candles(btc(), &[0]).await;

    let first = harness.next_execution().await;
    assert_eq!(first.action, ActionKind::Buy);
    assert!(first.strategy.is_main);
}

#[tokio::test]
async fn panicking_strategy_does_not_stall_the_cycle() {
    let content = WEIGHTED.replace(r#"type = "fixed_b""#, r#"type = "panicking""#);
    let mut harness = Harness::start(&content, ServerConfig::default());
    harness.candles(btc(), &[0]).await;

    let winner = harness.next_execution().await;
    assert_eq!(winner.action, ActionKind::Buy);
    assert_eq!(winner.strategy.name, "fixed_a");

    // the worker survives and keeps taking part in later cycles
    harness.candles(btc(), &[1]).await;
    assert_eq!(harness.next_execution().await.strategy.name, "fixed_a");
}

#[tokio::test]
async fn unsubscribed_market_is_ignored() {
    let mut harness = Harness::start(WEIGHTED, ServerConfig::default());
    harness.candles(CurrencyPair::new("ETH", "USDT"), &[0]).await;
    harness
        .handle
        .publish(MarketEvent::Candles {
            exchange: "kraken".into(),
            pair: btc(),
            candles: vec![minute(&btc(), 0, 100.0)],
        })
        .await
        .unwrap();
    harness.assert_idle().await;
}

#[tokio::test]
async fn larger_candle_sizes_come_from_batchers() {
    let content = r#"
        [[config]]
        markets = ["BTC_USDT"]
        exchanges = ["paper"]

        [[config.strategy]]
        type = "fixed_a"
        candle_size = 3
    "#;
    let mut harness = Harness::start(content, ServerConfig::default());
    harness.candles(btc(), &[0, 1]).await;
    harness.assert_idle().await;
    harness.candles(btc(), &[2]).await;
    assert_eq!(harness.next_execution().await.action, ActionKind::Buy);
}

// ─── Trade forwarding ─────────────────────────────────────────────────────────

const ECHO: &str = r#"
    [[config]]
    markets = ["BTC_USDT", "ETH_USDT"]
    exchanges = ["paper"]

    [[config.strategy]]
    type = "echo"
"#;

#[tokio::test]
async fn throttled_trades_are_held_and_forwarded_together() {
    let server = ServerConfig {
        forward_trades_sec: 10,
        ..ServerConfig::default()
    };
    let mut harness = Harness::start(ECHO, server);
    harness.trade(btc(), 0, 100.0).await;
    assert_eq!(harness.next_execution().await.reason, "00");

    // throttled per config pair: ETH is not held back by BTC
    harness.trade(CurrencyPair::new("ETH", "USDT"), 7, 10.0).await;
    let eth = harness.next_execution().await;
    assert_eq!((eth.pair().to_string(), eth.reason.as_str()), ("ETH_USDT".to_string(), "07"));

    harness.trade(btc(), 5, 101.0).await;
    harness.assert_idle().await;

    harness.trade(btc(), 12, 102.0).await;
    let held = harness.next_execution().await;
    assert_eq!((held.pair().to_string(), held.reason.as_str()), ("BTC_USDT".to_string(), "05,12"));
    harness.assert_idle().await;
}

#[tokio::test]
async fn unthrottled_trades_tick_per_batch() {
    let mut harness = Harness::start(ECHO, ServerConfig::default());
    harness.trade(btc(), 0, 100.0).await;
    assert_eq!(harness.next_execution().await.reason, "00");
    harness.trade(btc(), 5, 101.0).await;
    assert_eq!(harness.next_execution().await.reason, "05");
    harness.assert_idle().await;
}

#[tokio::test]
async fn drain_hands_every_queued_event_to_strategies() {
    let content = r#"
        [[config]]
        markets = ["BTC_USDT"]
        exchanges = ["paper"]

        [[config.strategy]]
        type = "silent"
        candle_size = 1
        save_state = true
    "#;
    let harness = Harness::start(content, ServerConfig::default());
    for m in 0..5 {
        harness.candles(btc(), &[m]).await;
    }
    harness.handle.drain().await.unwrap();

    let checkpoint = harness.handle.serialize_all().await.unwrap();
    let raw = checkpoint
        .get(&ConfigCurrencyPair::new(1, btc()))
        .and_then(|s| s.get("silent"))
        .cloned()
        .unwrap();
    let snapshot: StrategySnapshot = serde_json::from_value(raw).unwrap();
    assert_eq!(snapshot.candles_1min.len(), 5);
    assert_eq!(snapshot.candle_history.len(), 5);
}

// ─── Setup ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn every_config_needs_a_trader() {
    let server = ServerConfig::default();
    let registry = registry();
    let configs = TradeConfigFile::parse(WEIGHTED)
        .unwrap()
        .validate(&registry, &server)
        .unwrap();
    let (_tx, rx) = mpsc::unbounded_channel();
    let result = Advisor::new(&server, &configs, &registry, HashMap::new(), rx);
    assert!(matches!(result, Err(Error::Config(_))));
}

// ─── Trader feedback and checkpoints ──────────────────────────────────────────

const WITH_STOP_LOSS: &str = r#"
    [[config]]
    markets = ["BTC_USDT"]
    exchanges = ["paper"]
    trade_amount = 1.0

    [[config.strategy]]
    type = "fixed_a"
    candle_size = 1

    [[config.strategy]]
    type = "stop_loss"
    save_state = true
"#;

fn start_paper(content: &str) -> AdvisorHandle {
    let server = ServerConfig::default();
    let registry = registry();
    let configs = TradeConfigFile::parse(content)
        .unwrap()
        .validate(&registry, &server)
        .unwrap();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<TraderEvent>();
    let mut traders: HashMap<usize, Arc<dyn Trader>> = HashMap::new();
    traders.insert(1, Arc::new(PaperTrader::new(1, 10_000.0, 0.0, Some(1.0), events_tx)));
    let (advisor, handle) = Advisor::new(&server, &configs, &registry, traders, events_rx).unwrap();
    tokio::spawn(advisor.run());
    handle
}

fn entry_price(checkpoint: &Checkpoint) -> Option<f64> {
    checkpoint
        .get(&ConfigCurrencyPair::new(1, btc()))?
        .get("stop_loss")?
        .get("custom")?
        .get("entry_price")?
        .as_f64()
}

#[tokio::test]
async fn fills_reach_strategies_and_survive_a_checkpoint() {
    let handle = start_paper(WITH_STOP_LOSS);
    let ts = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 30).unwrap();
    handle
        .publish(MarketEvent::Trades {
            exchange: "paper".into(),
            pair: btc(),
            trades: vec![Trade::new(100.0, 1.0, ts, TradeSide::Buy)],
        })
        .await
        .unwrap();
    handle
        .publish(MarketEvent::Candles {
            exchange: "paper".into(),
            pair: btc(),
            candles: vec![minute(&btc(), 0, 100.0)],
        })
        .await
        .unwrap();

    let checkpoint = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let checkpoint = handle.serialize_all().await.unwrap();
            if entry_price(&checkpoint).is_some() {
                return checkpoint;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fill never reached the stop loss strategy");
    assert_eq!(entry_price(&checkpoint), Some(100.0));
    // fixed_a does not save state
    assert_eq!(checkpoint.get(&ConfigCurrencyPair::new(1, btc())).unwrap().len(), 1);
    handle.shutdown().await;

    let fresh = start_paper(WITH_STOP_LOSS);
    assert_eq!(entry_price(&fresh.serialize_all().await.unwrap()), None);
    let report = fresh.restore_all(checkpoint).await.unwrap();
    assert_eq!(report, RestoreReport { restored: 1, skipped: 0 });
    assert_eq!(entry_price(&fresh.serialize_all().await.unwrap()), Some(100.0));
}

#[tokio::test]
async fn candle_feed_alone_prices_paper_fills() {
    let handle = start_paper(WITH_STOP_LOSS);
    handle
        .publish(MarketEvent::Candles {
            exchange: "paper".into(),
            pair: btc(),
            candles: vec![minute(&btc(), 0, 250.0)],
        })
        .await
        .unwrap();

    let entry = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(price) = entry_price(&handle.serialize_all().await.unwrap()) {
                return price;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("candle-only feed never produced a fill");
    assert_eq!(entry, 250.0);
}

#[tokio::test]
async fn missing_state_is_skipped() {
    let handle = start_paper(WITH_STOP_LOSS);
    let report = handle.restore_all(Checkpoint::new()).await.unwrap();
    assert_eq!(report, RestoreReport { restored: 0, skipped: 1 });
}

#[tokio::test]
async fn state_of_another_config_is_found_when_enabled() {
    let two_configs = format!("{WITH_STOP_LOSS}\n{}", WITH_STOP_LOSS.replace("trade_amount = 1.0", ""));
    let server = ServerConfig {
        search_all_pairs_for_state: true,
        ..ServerConfig::default()
    };
    let registry = registry();
    let configs = TradeConfigFile::parse(&two_configs)
        .unwrap()
        .validate(&registry, &server)
        .unwrap();
    assert_eq!(configs.len(), 2);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut traders: HashMap<usize, Arc<dyn Trader>> = HashMap::new();
    for index in [1, 2] {
        traders.insert(index, Arc::new(PaperTrader::new(index, 10_000.0, 0.0, None, events_tx.clone())));
    }
    let (advisor, handle) = Advisor::new(&server, &configs, &registry, traders, events_rx).unwrap();
    tokio::spawn(advisor.run());

    // a checkpoint holding config 1 only
    let saved = handle.serialize_all().await.unwrap();
    assert_eq!(saved.len(), 2);
    let first = ConfigCurrencyPair::new(1, btc());
    let raw = saved.get(&first).unwrap().get("stop_loss").unwrap().clone();
    let snapshot: StrategySnapshot = serde_json::from_value(raw).unwrap();
    let mut only_first = Checkpoint::new();
    only_first.insert(&first, "stop_loss", &snapshot).unwrap();

    let report = handle.restore_all(only_first).await.unwrap();
    assert_eq!(report, RestoreReport { restored: 2, skipped: 0 });
}
