use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use common::{Error, Result};

use crate::builtin::{MacdStrategy, RsiStrategy, StopLossStrategy};
use crate::config::ResolvedStrategy;
use crate::Strategy;

/// Builds a strategy from its resolved configuration.
pub type StrategyFactory = fn(&ResolvedStrategy) -> Result<Box<dyn Strategy>>;

/// Static mapping of strategy kind tags to factories, filled at startup.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the strategies shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(RsiStrategy::KIND, RsiStrategy::build);
        registry.register(MacdStrategy::KIND, MacdStrategy::build);
        registry.register(StopLossStrategy::KIND, StopLossStrategy::build);
        registry
    }

    /// Add or replace a factory.
    pub fn register(&mut self, kind: impl Into<String>, factory: StrategyFactory) {
        let kind = kind.into();
        debug!(kind = %kind, "Registered strategy kind");
        self.factories.insert(kind, factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(&self, cfg: &ResolvedStrategy) -> Result<Box<dyn Strategy>> {
        let factory = self
            .factories
            .get(&cfg.kind)
            .ok_or_else(|| Error::UnknownStrategy(cfg.kind.clone()))?;
        factory(cfg)
    }
}

impl std::fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.kinds()).finish()
    }
}

// ─── Parameter helpers ────────────────────────────────────────────────────────

/// Float parameter; integers are accepted too.
pub fn param_f64(params: &HashMap<String, toml::Value>, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
        .unwrap_or(default)
}

pub fn param_usize(params: &HashMap<String, toml::Value>, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(|v| v.as_integer())
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

pub fn param_bool(params: &HashMap<String, toml::Value>, key: &str, default: bool) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}
