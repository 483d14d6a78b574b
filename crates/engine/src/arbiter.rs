use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use tracing::debug;

use common::{Action, CurrencyPair};

/// What happened to a submitted action.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Waiting for the pair's decision cycle to close.
    Queued,
    /// Execute now. The pair's queue has been cleared.
    Execute(Action),
}

/// Heap entry ordered by weight, then by submission order.
#[derive(Debug)]
struct Pending {
    seq: u64,
    action: Action,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.action
            .weight
            .total_cmp(&other.action.weight)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Pending actions of every pair, resolved to one winner per decision cycle.
///
/// Plain and candle ticks of a pair share one queue: a strategy never runs
/// both kinds of tick at the same time.
#[derive(Debug, Default)]
pub struct ActionArbitrator {
    queues: HashMap<CurrencyPair, BinaryHeap<Pending>>,
    next_seq: u64,
    main_always_trades: bool,
}

impl ActionArbitrator {
    pub fn new(main_always_trades: bool) -> Self {
        Self {
            main_always_trades,
            ..Self::default()
        }
    }

    /// Queue `action`, or hand it back for immediate execution when it
    /// carries the maximum weight or comes from a main strategy that always
    /// trades.
    pub fn submit(&mut self, action: Action) -> Submission {
        let pair = action.pair().clone();
        if action.is_max_weight() || (self.main_always_trades && action.strategy.is_main) {
            let dropped = self.clear(&pair);
            debug!(pair = %pair, action = %action.kind, strategy = %action.strategy.name, dropped, "Action bypasses arbitration");
            return Submission::Execute(action);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        debug!(pair = %pair, action = %action.kind, weight = action.weight, strategy = %action.strategy.name, "Action queued");
        self.queues.entry(pair).or_default().push(Pending { seq, action });
        Submission::Queued
    }

    /// Pop the heaviest pending action of `pair` (latest submission wins
    /// ties) and drop the rest.
    pub fn resolve(&mut self, pair: &CurrencyPair) -> Option<Action> {
        let mut queue = self.queues.remove(pair)?;
        let winner = queue.pop()?;
        if !queue.is_empty() {
            debug!(pair = %pair, discarded = queue.len(), "Discarding lower weighted actions");
        }
        Some(winner.action)
    }

    /// Drop every pending action of `pair`. Returns how many were dropped.
    pub fn clear(&mut self, pair: &CurrencyPair) -> usize {
        self.queues.remove(pair).map_or(0, |q| q.len())
    }

    pub fn pending(&self, pair: &CurrencyPair) -> usize {
        self.queues.get(pair).map_or(0, BinaryHeap::len)
    }

    pub fn has_pending(&self, pair: &CurrencyPair) -> bool {
        self.pending(pair) > 0
    }
}
