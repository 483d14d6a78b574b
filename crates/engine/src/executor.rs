use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use common::{Candle, CurrencyPair, ExecutionRequest, Trade, Trader};

/// Work queued for one trader.
#[derive(Debug, Clone)]
pub enum TraderCommand {
    Execute(ExecutionRequest),
    Trades { pair: CurrencyPair, trades: Vec<Trade> },
    Candle(Candle),
}

/// Drives one [`Trader`] from its command queue.
///
/// This is the only component that calls into a trader, so a trader sees
/// price updates and executions in the order the advisor produced them.
pub struct TraderExecutor {
    config: usize,
    trader: Arc<dyn Trader>,
    commands: mpsc::UnboundedReceiver<TraderCommand>,
}

impl TraderExecutor {
    pub fn new(config: usize, trader: Arc<dyn Trader>, commands: mpsc::UnboundedReceiver<TraderCommand>) -> Self {
        Self {
            config,
            trader,
            commands,
        }
    }

    /// Run the executor loop. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        info!(config = self.config, "Trader executor running");
        while let Some(command) = self.commands.recv().await {
            match command {
                TraderCommand::Execute(request) => {
                    info!(
                        config = self.config,
                        pair = %request.pair(),
                        action = %request.action,
                        strategy = %request.strategy.name,
                        reason = %request.reason,
                        "Executing action"
                    );
                    let pair = request.pair().clone();
                    if let Err(e) = self.trader.execute(request).await {
                        error!(config = self.config, pair = %pair, error = %e, "Trader failed to execute action");
                    }
                }
                TraderCommand::Trades { pair, trades } => {
                    if let Err(e) = self.trader.on_trades(&pair, &trades).await {
                        warn!(config = self.config, pair = %pair, error = %e, "Trader rejected trade update");
                    }
                }
                TraderCommand::Candle(candle) => {
                    if let Err(e) = self.trader.on_candle(&candle).await {
                        warn!(config = self.config, pair = %candle.pair, error = %e, "Trader rejected candle");
                    }
                }
            }
        }
        warn!(config = self.config, "Trader executor: command channel closed");
    }
}
