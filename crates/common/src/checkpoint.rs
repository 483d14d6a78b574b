use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{Candle, ConfigCurrencyPair, Error, Result};

/// Serialized memory of one strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySnapshot {
    /// Candle size the state was recorded under. `None` for trade-only strategies.
    pub running_candle_size: Option<u32>,
    /// Closed candles, newest first.
    pub candle_history: Vec<Candle>,
    /// 1-minute candles, oldest first.
    pub candles_1min: Vec<Candle>,
    /// Strategy-specific state.
    #[serde(default)]
    pub custom: Value,
}

/// Checkpoint blob: config currency pair → strategy name → raw snapshot.
///
/// Snapshots stay raw JSON until restore so that one malformed entry does not
/// poison the whole file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint {
    pairs: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &ConfigCurrencyPair, strategy: &str, snapshot: &StrategySnapshot) -> Result<()> {
        let value = serde_json::to_value(snapshot)?;
        self.pairs
            .entry(key.to_string())
            .or_default()
            .insert(strategy.to_string(), value);
        Ok(())
    }

    pub fn get(&self, key: &ConfigCurrencyPair) -> Option<&BTreeMap<String, Value>> {
        self.pairs.get(&key.to_string())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Opaque storage of the checkpoint blob. Used for backtest continuation only.
pub trait CheckpointStore: Send + Sync {
    /// `Ok(None)` when nothing was stored yet.
    fn load(&self) -> Result<Option<Checkpoint>>;
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// Checkpoint kept as a pretty-printed JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for JsonFileStore {
    fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No checkpoint file");
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            Error::Checkpoint(format!("failed to parse '{}': {e}", self.path.display()))
        })?;
        info!(path = %self.path.display(), pairs = checkpoint.len(), "Checkpoint loaded");
        Ok(Some(checkpoint))
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = serde_json::to_string_pretty(checkpoint)?;
        // write-then-rename keeps the previous checkpoint intact on failure
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        info!(path = %self.path.display(), pairs = checkpoint.len(), "Checkpoint written");
        Ok(())
    }
}
