//! Prune statistics, accumulated across iterations of a prune run.

use std::{collections::BTreeMap, fmt};

/// Result of pruning one inverted index (or one history through its index).
#[derive(Debug, Default, Clone)]
pub struct InvertedIndexPruneStat {
    pub pruned: u64,
    pub min_tx: u64,
    pub max_tx: u64,
}

impl InvertedIndexPruneStat {
    pub fn pruned_nothing(&self) -> bool {
        self.pruned == 0
    }

    pub fn accumulate(&mut self, other: &Self) {
        if other.pruned_nothing() {
            return
        }
        if self.pruned_nothing() {
            self.min_tx = other.min_tx;
            self.max_tx = other.max_tx;
        } else {
            self.min_tx = self.min_tx.min(other.min_tx);
            self.max_tx = self.max_tx.max(other.max_tx);
        }
        self.pruned += other.pruned;
    }
}

impl fmt::Display for InvertedIndexPruneStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pruned {} rows in txs [{}..{}]", self.pruned, self.min_tx, self.max_tx)
    }
}

/// Result of pruning one domain: latest-table rows plus its history layer.
#[derive(Debug, Default, Clone)]
pub struct DomainPruneStat {
    pub values_pruned: u64,
    pub history: InvertedIndexPruneStat,
}

impl DomainPruneStat {
    pub fn pruned_nothing(&self) -> bool {
        self.values_pruned == 0 && self.history.pruned_nothing()
    }

    pub fn accumulate(&mut self, other: &Self) {
        self.values_pruned += other.values_pruned;
        self.history.accumulate(&other.history);
    }
}

impl fmt::Display for DomainPruneStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "values {}; history {}", self.values_pruned, self.history)
    }
}

/// Accumulated statistics of a whole prune cycle, keyed by entity name.
#[derive(Debug, Default)]
pub struct AggregatorPruneStat {
    pub domains: BTreeMap<String, DomainPruneStat>,
    pub indices: BTreeMap<String, InvertedIndexPruneStat>,
}

impl AggregatorPruneStat {
    pub fn pruned_nothing(&self) -> bool {
        self.domains.values().all(|d| d.pruned_nothing()) &&
            self.indices.values().all(|i| i.pruned_nothing())
    }

    pub fn accumulate(&mut self, other: &Self) {
        for (name, stat) in &other.domains {
            self.domains.entry(name.clone()).or_default().accumulate(stat);
        }
        for (name, stat) in &other.indices {
            self.indices.entry(name.clone()).or_default().accumulate(stat);
        }
    }
}

impl fmt::Display for AggregatorPruneStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, stat) in &self.domains {
            if stat.pruned_nothing() {
                continue
            }
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{name}| {stat}")?;
            first = false;
        }
        for (name, stat) in &self.indices {
            if stat.pruned_nothing() {
                continue
            }
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{name}| {stat}")?;
            first = false;
        }
        Ok(())
    }
}
