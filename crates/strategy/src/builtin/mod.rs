//! Strategies shipped with the advisor.

mod macd;
mod rsi;
mod stop_loss;

pub use macd::MacdStrategy;
pub use rsi::RsiStrategy;
pub use stop_loss::StopLossStrategy;

use serde_json::Value;

use common::{Error, Result};

/// Optional float field of a saved strategy memory.
fn memory_f64(state: &Value, key: &str) -> Result<Option<f64>> {
    match state.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::Checkpoint(format!("'{key}' is not a number: {v}"))),
    }
}
