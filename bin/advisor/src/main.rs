mod feed;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{CheckpointStore, JsonFileStore, ServerConfig, Trader, TraderEvent};
use engine::Advisor;
use paper::PaperTrader;
use strategy::{StrategyRegistry, TradeConfigFile};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = ServerConfig::from_env().context("invalid server configuration")?;
    info!(
        trade_config = %cfg.trade_config_path,
        arbitrage = cfg.arbitrage,
        main_always_trades = cfg.main_strategy_always_trade,
        "Trade advisor starting"
    );

    let registry = StrategyRegistry::with_builtin();
    let configs = TradeConfigFile::load(&cfg.trade_config_path)?
        .validate(&registry, &cfg)
        .context("invalid trade configuration")?;

    // ── Traders ───────────────────────────────────────────────────────────────
    let (trader_tx, trader_rx) = mpsc::unbounded_channel::<TraderEvent>();
    let mut traders: HashMap<usize, Arc<dyn Trader>> = HashMap::new();
    for config in &configs {
        info!(config = config.index, markets = config.markets.len(), "Paper trader for config");
        traders.insert(
            config.index,
            Arc::new(PaperTrader::new(
                config.index,
                cfg.paper_balance,
                cfg.paper_slippage_bps,
                config.trade_amount,
                trader_tx.clone(),
            )),
        );
    }
    drop(trader_tx);

    // ── Advisor ───────────────────────────────────────────────────────────────
    let (advisor, handle) = Advisor::new(&cfg, &configs, &registry, traders, trader_rx)?;
    let advisor_task = tokio::spawn(advisor.run());

    let store = cfg.checkpoint_path.as_ref().map(JsonFileStore::new);
    if let Some(store) = &store {
        if let Some(checkpoint) = store.load()? {
            let report = handle.restore_all(checkpoint).await?;
            info!(restored = report.restored, skipped = report.skipped, "Checkpoint applied");
        }
    }

    // ── Heartbeat ─────────────────────────────────────────────────────────────
    let heartbeat = {
        let handle = handle.clone();
        let period = Duration::from_secs(cfg.heartbeat_sec.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if handle.heartbeat().await.is_err() {
                    break;
                }
            }
        })
    };

    // ── Feed ──────────────────────────────────────────────────────────────────
    match &cfg.feed_path {
        Some(path) => {
            tokio::select! {
                result = feed::replay(path, handle.market_sender()) => {
                    result.with_context(|| format!("feed replay from '{path}' failed"))?;
                    let drained = handle.drain().await?;
                    info!(drained, "Feed fully handed to strategies");
                }
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            }
        }
        None => {
            warn!("FEED_PATH not set, waiting for shutdown signal");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────
    heartbeat.abort();
    if let Some(store) = &store {
        match handle.serialize_all().await {
            Ok(checkpoint) => store.save(&checkpoint)?,
            Err(e) => error!(error = %e, "Could not serialize strategies, checkpoint not written"),
        }
    }
    handle.shutdown().await;
    advisor_task.await?;
    info!("Trade advisor stopped");
    Ok(())
}
