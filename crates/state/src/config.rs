//! Construction-time configuration of the aggregator.

use alloy_primitives::B256;
use sediment_segment::{Compressors, Lz4, Zstd};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

/// Maximum dirty-page space a gentle prune run may leave in the write transaction before
/// yielding, so the commit stays cheap on the tip of the chain.
pub const MAX_NON_FURIOUS_DIRTY_SPACE_PER_TX: u64 = 64 * 1024 * 1024;

/// Directory layout of a datadir.
#[derive(Debug, Clone)]
pub struct Dirs {
    /// Immutable segment files and their accessors.
    pub snap: PathBuf,
    /// Scratch space for collation spill files.
    pub tmp: PathBuf,
}

impl Dirs {
    /// Creates the layout under `datadir`, making the directories if needed.
    pub fn new(datadir: impl AsRef<Path>) -> io::Result<Self> {
        let datadir = datadir.as_ref();
        let dirs = Self { snap: datadir.join("snapshots"), tmp: datadir.join("temp") };
        std::fs::create_dir_all(&dirs.snap)?;
        std::fs::create_dir_all(&dirs.tmp)?;
        Ok(dirs)
    }
}

/// Aggregator tunables, fixed at construction.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Number of txNums per step, the unit of freezing and merging.
    pub step_size: u64,
    /// Bounded workers for the collate/build phase.
    pub collate_and_build_workers: usize,
    /// Bounded workers for the merge phase.
    pub merge_workers: usize,
    /// Span cap for merged files, in steps. A file of exactly this span is frozen.
    pub steps_in_frozen_file: u64,
    /// Rewrites commitment value references during merges.
    pub commitment_values_transform: bool,
    /// Produce frozen files at all. Disabled for read-only tooling.
    pub produce: bool,
    /// Recent-txn window kept in DB for histories with disabled snapshots.
    pub keep_recent_txns_of_histories_with_disabled_snapshots: u64,
    /// State root of the empty (genesis) state.
    pub genesis_state_root: B256,
    /// Read views held longer than this are reported by the leak detector.
    pub slow_view_threshold: Duration,
    /// Skip fsync on produced files. Test-only.
    pub fsync: bool,
}

impl AggregatorConfig {
    pub fn new(step_size: u64) -> Self {
        Self {
            step_size,
            collate_and_build_workers: 1,
            merge_workers: 1,
            steps_in_frozen_file: 32,
            commitment_values_transform: true,
            produce: true,
            keep_recent_txns_of_histories_with_disabled_snapshots: step_size,
            genesis_state_root: B256::ZERO,
            slow_view_threshold: Duration::from_secs(60),
            fsync: true,
        }
    }
}

/// Compression choice for one file kind of one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressionKind {
    None,
    Zstd,
    Lz4,
}

impl CompressionKind {
    pub(crate) fn build(&self) -> Option<Compressors> {
        match self {
            Self::None => None,
            Self::Zstd => Some(Compressors::Zstd(Zstd::new(false, 0))),
            Self::Lz4 => Some(Compressors::Lz4(Lz4::default())),
        }
    }
}

/// Per-domain file schema.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DomainSchema {
    pub(crate) values_compression: CompressionKind,
    pub(crate) history_compression: CompressionKind,
    /// Histories with disabled snapshots keep a bounded recent window in DB and never freeze.
    pub(crate) history_disabled: bool,
}

pub(crate) fn domain_schema(id: crate::DomainId) -> DomainSchema {
    use crate::DomainId::*;
    match id {
        Accounts | Storage => DomainSchema {
            values_compression: CompressionKind::Zstd,
            history_compression: CompressionKind::Zstd,
            history_disabled: false,
        },
        Code => DomainSchema {
            values_compression: CompressionKind::Lz4,
            history_compression: CompressionKind::Lz4,
            history_disabled: false,
        },
        // Commitment keeps its history in DB only; its values files stay, they carry the
        // coupling with accounts and storage.
        Commitment => DomainSchema {
            values_compression: CompressionKind::Zstd,
            history_compression: CompressionKind::None,
            history_disabled: true,
        },
    }
}
