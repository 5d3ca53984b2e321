//! Logical table names and key encodings shared by all entities.
//!
//! Every domain owns four tables: the latest-value table (`key ++ !step -> value`, one row
//! per key and step until pruned), the history-value table (`key ++ txNum -> previous
//! value`) and the two inverted-index tables (`txNum ++ key -> ()` ordered for pruning,
//! `key ++ txNum -> ()` ordered for queries).

/// Number of state domains.
pub const DOMAIN_COUNT: usize = 4;

/// Identifier of a state domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DomainId {
    Accounts = 0,
    Storage = 1,
    Code = 2,
    Commitment = 3,
}

impl DomainId {
    /// Every domain, in build order. The order matters for merges: accounts and storage must
    /// be submitted before commitment so the commitment value transformer can wait on them.
    pub const ALL: [Self; DOMAIN_COUNT] = [Self::Accounts, Self::Storage, Self::Code, Self::Commitment];

    /// Domains participating in the visible-files minimax. Commitment is excluded: with its
    /// history files disabled, its file end either equals the others or is unbounded and
    /// would pin the minimax at zero.
    pub const STATE: [Self; 3] = [Self::Accounts, Self::Storage, Self::Code];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Storage => "storage",
            Self::Code => "code",
            Self::Commitment => "commitment",
        }
    }

    pub const fn index(&self) -> usize {
        *self as usize
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.name() == name)
    }

    pub const fn tables(&self) -> DomainTables {
        match self {
            Self::Accounts => DomainTables {
                values: "AccountVals",
                history_vals: "AccountHistoryVals",
                idx_keys: "AccountIdxKeys",
                idx_vals: "AccountIdxVals",
            },
            Self::Storage => DomainTables {
                values: "StorageVals",
                history_vals: "StorageHistoryVals",
                idx_keys: "StorageIdxKeys",
                idx_vals: "StorageIdxVals",
            },
            Self::Code => DomainTables {
                values: "CodeVals",
                history_vals: "CodeHistoryVals",
                idx_keys: "CodeIdxKeys",
                idx_vals: "CodeIdxVals",
            },
            Self::Commitment => DomainTables {
                values: "CommitmentVals",
                history_vals: "CommitmentHistoryVals",
                idx_keys: "CommitmentIdxKeys",
                idx_vals: "CommitmentIdxVals",
            },
        }
    }
}

/// Identifier of a standalone inverted index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvertedIdx {
    LogAddrs,
    LogTopics,
    TracesFrom,
    TracesTo,
}

impl InvertedIdx {
    pub const ALL: [Self; 4] = [Self::LogAddrs, Self::LogTopics, Self::TracesFrom, Self::TracesTo];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::LogAddrs => "logaddrs",
            Self::LogTopics => "logtopics",
            Self::TracesFrom => "tracesfrom",
            Self::TracesTo => "tracesto",
        }
    }

    pub const fn tables(&self) -> IiTables {
        match self {
            Self::LogAddrs => IiTables { keys: "LogAddrIdxKeys", vals: "LogAddrIdxVals" },
            Self::LogTopics => IiTables { keys: "LogTopicIdxKeys", vals: "LogTopicIdxVals" },
            Self::TracesFrom => IiTables { keys: "TracesFromIdxKeys", vals: "TracesFromIdxVals" },
            Self::TracesTo => IiTables { keys: "TracesToIdxKeys", vals: "TracesToIdxVals" },
        }
    }
}

/// Table names of one domain.
#[derive(Debug, Clone, Copy)]
pub struct DomainTables {
    pub values: &'static str,
    pub history_vals: &'static str,
    pub idx_keys: &'static str,
    pub idx_vals: &'static str,
}

/// Table names of one inverted index.
#[derive(Debug, Clone, Copy)]
pub struct IiTables {
    pub keys: &'static str,
    pub vals: &'static str,
}

/// Block number to last txNum of the block. Maintained by the execution integration.
pub const TX_NUMS: &str = "TxNums";

/// Execution-progress tables wiped by `reset_exec`, beyond the per-domain ones.
pub const EXEC_TABLES: [&str; 1] = [TX_NUMS];

// Key encoding helpers. All ordered encodings are big-endian so the KV sort order matches the
// numeric order.

pub(crate) fn tx_key(tx_num: u64) -> [u8; 8] {
    tx_num.to_be_bytes()
}

pub(crate) fn key_with_tx(key: &[u8], tx_num: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out
}

pub(crate) fn tx_with_key(tx_num: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(&tx_num.to_be_bytes());
    out.extend_from_slice(key);
    out
}

/// Splits a `key ++ txNum` encoding.
pub(crate) fn split_key_tx(raw: &[u8]) -> Option<(&[u8], u64)> {
    let (key, tx) = raw.split_at_checked(raw.len().checked_sub(8)?)?;
    Some((key, u64::from_be_bytes(tx.try_into().ok()?)))
}

/// Splits a `txNum ++ key` encoding.
pub(crate) fn split_tx_key(raw: &[u8]) -> Option<(u64, &[u8])> {
    let (tx, key) = raw.split_at_checked(8)?;
    Some((u64::from_be_bytes(tx.try_into().ok()?), key))
}

/// Encodes a latest-table row key: `key ++ !step`. The step is bitwise-inverted so a key's
/// newest step sorts first and `seek(key)` lands on it; one row is kept per (key, step) until
/// pruning, so every frozen step's closing value is still collatable.
pub(crate) fn key_with_inverted_step(key: &[u8], step: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out.extend_from_slice(&(!step).to_be_bytes());
    out
}

/// Splits a `key ++ !step` encoding.
pub(crate) fn split_key_inverted_step(raw: &[u8]) -> Option<(&[u8], u64)> {
    let (key, step) = raw.split_at_checked(raw.len().checked_sub(8)?)?;
    Some((key, !u64::from_be_bytes(step.try_into().ok()?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_tx_roundtrip() {
        let raw = key_with_tx(b"some key", 42);
        assert_eq!(split_key_tx(&raw), Some((b"some key".as_slice(), 42)));

        let raw = tx_with_key(7, b"k");
        assert_eq!(split_tx_key(&raw), Some((7, b"k".as_slice())));
    }

    #[test]
    fn inverted_step_roundtrip_and_order() {
        let raw = key_with_inverted_step(b"key", 3);
        assert_eq!(split_key_inverted_step(&raw), Some((b"key".as_slice(), 3)));

        // Newer steps sort first for the same key.
        assert!(key_with_inverted_step(b"key", 7) < key_with_inverted_step(b"key", 2));
    }

    #[test]
    fn ordered_encodings_sort_numerically() {
        assert!(tx_key(255) < tx_key(256));
        assert!(key_with_tx(b"a", u64::MAX) < key_with_tx(b"b", 0));
    }
}
