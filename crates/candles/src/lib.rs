//! Candle aggregation: raw trades → 1-minute candles → N-minute candles.
//!
//! Both stages are synchronous and deterministic so the same code path serves
//! backtests and live trading.

pub mod batcher;
pub mod maker;

pub use batcher::{batch_candles, CandleBatcher};
pub use maker::{CandleMaker, MakerOutput};
