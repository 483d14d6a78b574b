pub mod checkpoint;
pub mod config;
pub mod error;
pub mod trader;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointStore, JsonFileStore, StrategySnapshot};
pub use config::{FanInPolicy, ServerConfig};
pub use error::{Error, Result};
pub use trader::{ExecutionRequest, Order, Position, TradeAction, TradeInfo, Trader, TraderEvent};
pub use types::*;
