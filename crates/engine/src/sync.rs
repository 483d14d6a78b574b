use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use common::CurrencyPair;

/// Counter scope: plain ticks per pair, candle ticks per (pair, interval).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncScope {
    Ticks(CurrencyPair),
    Candles(CurrencyPair, u32),
}

impl SyncScope {
    pub fn pair(&self) -> &CurrencyPair {
        match self {
            SyncScope::Ticks(pair) | SyncScope::Candles(pair, _) => pair,
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncScope::Ticks(pair) => write!(f, "{pair} ticks"),
            SyncScope::Candles(pair, interval) => write!(f, "{pair} {interval}m candles"),
        }
    }
}

/// Result of a done signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    /// Strategies are still working on the scope.
    Pending(usize),
    /// Last outstanding strategy finished. Resolve the pair's actions now.
    Resolve,
    /// More done than started signals. Nothing changed.
    Unbalanced,
}

/// Counts the strategies still working on the current tick of each scope.
///
/// A scope missing from the map is idle. Counters never go below zero.
#[derive(Debug, Default)]
pub struct SyncTracker {
    outstanding: HashMap<SyncScope, usize>,
}

impl SyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A strategy started a tick. Returns the new outstanding count.
    pub fn started(&mut self, scope: SyncScope) -> usize {
        let count = self.outstanding.entry(scope).or_insert(0);
        *count += 1;
        *count
    }

    pub fn done(&mut self, scope: &SyncScope) -> DoneOutcome {
        match self.outstanding.get_mut(scope) {
            None => DoneOutcome::Unbalanced,
            Some(count) if *count > 1 => {
                *count -= 1;
                DoneOutcome::Pending(*count)
            }
            Some(_) => {
                self.outstanding.remove(scope);
                DoneOutcome::Resolve
            }
        }
    }

    /// Force every scope of `pair` back to idle.
    pub fn reset_pair(&mut self, pair: &CurrencyPair) {
        let before = self.outstanding.len();
        self.outstanding.retain(|scope, _| scope.pair() != pair);
        if before != self.outstanding.len() {
            debug!(pair = %pair, scopes = before - self.outstanding.len(), "Synchronization reset");
        }
    }

    pub fn outstanding(&self, scope: &SyncScope) -> usize {
        self.outstanding.get(scope).copied().unwrap_or(0)
    }

    pub fn is_idle(&self, scope: &SyncScope) -> bool {
        self.outstanding(scope) == 0
    }
}
