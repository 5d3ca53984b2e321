//! History: append-only log of previous values, layered over an inverted index.
//!
//! `as_of(key, ts)` resolves to the value a reader would have seen just before `ts`: the
//! history row at the smallest recorded txNum `>= ts` holds, by construction, the value that
//! was current before that write. When no such txNum exists the caller falls back to the
//! latest value.

use crate::{
    collector::Collector,
    config::CompressionKind,
    files::{FileItem, FileSet, StepRange},
    inverted_index::{first_tx_at_or_after, InvertedIndex, InvertedIndexCollation},
    prune::InvertedIndexPruneStat,
    tables::{self, IiTables},
    util::ProgressSet,
    StateError, StateResult,
};
use sediment_kv::{DbTx, DbTxMut};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::*;

/// Spill threshold of collation buffers, in bytes.
const COLLATE_BUFFER_BYTES: usize = 128 * 1024 * 1024;

pub(crate) struct History {
    pub(crate) ii: InvertedIndex,
    pub(crate) vals_table: &'static str,
    /// `.v` previous-value files. Unused when snapshots are disabled for this history.
    pub(crate) files: FileSet,
    pub(crate) snapshots_disabled: bool,
    /// Recent-txn window protected from pruning when snapshots are disabled.
    pub(crate) keep_recent_txns: AtomicU64,
    tmp_dir: PathBuf,
    salt: u32,
    fsync: bool,
}

pub(crate) struct HistoryCollation {
    pub(crate) step: u64,
    pub(crate) values: Collector,
    pub(crate) ii: InvertedIndexCollation,
}

pub(crate) struct HistoryFiles {
    pub(crate) v: Arc<FileItem>,
    pub(crate) ef: Arc<FileItem>,
}

impl HistoryFiles {
    pub(crate) fn cleanup_on_error(&self) {
        self.v.delete_from_disk();
        self.ef.delete_from_disk();
    }
}

#[allow(clippy::too_many_arguments)]
impl History {
    pub(crate) fn new(
        dir: PathBuf,
        tmp_dir: PathBuf,
        base: impl Into<String>,
        ii_tables: IiTables,
        vals_table: &'static str,
        step_size: u64,
        frozen_span: u64,
        compression: CompressionKind,
        snapshots_disabled: bool,
        keep_recent_txns: u64,
        salt: u32,
        fsync: bool,
    ) -> Self {
        let base = base.into();
        Self {
            ii: InvertedIndex::new(
                dir.clone(),
                base.clone(),
                ii_tables,
                step_size,
                frozen_span,
                salt,
                fsync,
            ),
            vals_table,
            files: FileSet::new(dir, base, "v", "vi", step_size, frozen_span, compression),
            snapshots_disabled,
            keep_recent_txns: AtomicU64::new(keep_recent_txns),
            tmp_dir,
            salt,
            fsync,
        }
    }

    /// Records the value `key` had *before* the write at `tx_num`. An empty `prev` means the
    /// key did not exist before.
    pub(crate) fn add_prev<T: DbTxMut>(
        &self,
        tx: &mut T,
        key: &[u8],
        tx_num: u64,
        prev: &[u8],
    ) -> StateResult<()> {
        tx.put(self.vals_table, &tables::key_with_tx(key, tx_num), prev)?;
        self.ii.put(tx, key, tx_num)
    }

    /// Smallest indexed txNum `>= ts`, then the history value stored there. `Ok(None)` means
    /// history ended before `ts` and the latest value applies.
    pub(crate) fn history_seek<T: DbTx>(
        &self,
        v_files: &[Arc<FileItem>],
        ii_files: &[Arc<FileItem>],
        key: &[u8],
        ts: u64,
        tx: &T,
    ) -> StateResult<Option<Vec<u8>>> {
        let Some(found_tx) = first_tx_at_or_after(ii_files, self.ii.tables, key, ts, tx)? else {
            return Ok(None)
        };
        self.value_at(v_files, key, found_tx, tx).map(Some)
    }

    /// Reads the history value at `(key, tx_num)`, files first.
    pub(crate) fn value_at<T: DbTx>(
        &self,
        v_files: &[Arc<FileItem>],
        key: &[u8],
        tx_num: u64,
        tx: &T,
    ) -> StateResult<Vec<u8>> {
        let row_key = tables::key_with_tx(key, tx_num);
        for item in v_files {
            if item.start_tx <= tx_num && tx_num < item.end_tx {
                if let Some(value) = item.segment.lookup(&row_key)? {
                    return Ok(value)
                }
            }
        }
        match tx.get(self.vals_table, &row_key)? {
            Some(value) => Ok(value),
            None => Err(StateError::Corrupt(format!(
                "history of {} misses indexed txn {tx_num}",
                self.ii.name
            ))),
        }
    }

    /// Collates one step of history rows plus the index bitmaps backing them.
    pub(crate) fn collate<T: DbTx>(&self, tx: &T, step: u64) -> StateResult<HistoryCollation> {
        let ii = self.ii.collate(tx, step)?;
        let mut values = Collector::new(&self.tmp_dir, COLLATE_BUFFER_BYTES);
        for (key, bitmap) in &ii.bitmaps {
            for tx_num in bitmap {
                let row_key = tables::key_with_tx(key, tx_num);
                let prev = tx.get(self.vals_table, &row_key)?.ok_or_else(|| {
                    StateError::Corrupt(format!(
                        "history of {} misses row for txn {tx_num} during collation",
                        self.ii.name
                    ))
                })?;
                values.insert(row_key, prev)?;
            }
        }
        Ok(HistoryCollation { step, values, ii })
    }

    /// Builds the `.v` + `.ef` pair for one step. On error every partial output is removed.
    pub(crate) fn build_files(
        &self,
        step: u64,
        mut collation: HistoryCollation,
        progress: &ProgressSet,
    ) -> StateResult<HistoryFiles> {
        let range = StepRange::new(step, step + 1);
        let ef = self.ii.build_files(step, collation.ii, progress)?;

        let guard =
            progress.add(format!("{}.{range}.v", self.ii.name), collation.values.len() as u64);
        let v = match self.files.write_file(
            range,
            collation.values.iter()?.map(|pair| pair.map_err(StateError::from)),
            self.salt,
            false,
            self.fsync,
            Some(guard.progress()),
        ) {
            Ok(v) => v,
            Err(err) => {
                ef.delete_from_disk();
                return Err(err)
            }
        };
        Ok(HistoryFiles { v, ef })
    }

    /// Prunes history rows and their index entries in `[from_tx, to_tx)`. Histories with
    /// disabled snapshots only give up rows older than their recent-txn window.
    pub(crate) fn prune<T: DbTxMut>(
        &self,
        tx: &mut T,
        from_tx: u64,
        mut to_tx: u64,
        limit: u64,
    ) -> StateResult<InvertedIndexPruneStat> {
        if self.snapshots_disabled {
            let keep = self.keep_recent_txns.load(Ordering::Relaxed);
            let max_in_db = self.ii.max_tx_in_db(tx)?;
            to_tx = to_tx.min(max_in_db.saturating_sub(keep));
        }
        let mut stat = InvertedIndexPruneStat::default();
        for (tx_num, key) in self.ii.collect_prunable(tx, from_tx, to_tx, limit)? {
            tx.delete(self.ii.tables.keys, &tables::tx_with_key(tx_num, &key))?;
            tx.delete(self.ii.tables.vals, &tables::key_with_tx(&key, tx_num))?;
            tx.delete(self.vals_table, &tables::key_with_tx(&key, tx_num))?;
            if stat.pruned_nothing() {
                stat.min_tx = tx_num;
            }
            stat.max_tx = stat.max_tx.max(tx_num);
            stat.pruned += 1;
        }
        if !stat.pruned_nothing() {
            trace!(target: "state", history = %self.ii.name, %stat, "pruned history");
        }
        Ok(stat)
    }

    /// Merges consecutive `.v` files (key-ordered heap merge; row keys are unique across the
    /// sources) and the backing `.ef` files.
    pub(crate) fn merge_files(
        &self,
        v_inputs: &[Arc<FileItem>],
        ef_inputs: &[Arc<FileItem>],
        range: StepRange,
        progress: &ProgressSet,
    ) -> StateResult<HistoryFiles> {
        let ef = self.ii.merge_files(ef_inputs, range, progress)?;

        let mut values = Collector::new(&self.tmp_dir, COLLATE_BUFFER_BYTES);
        for item in v_inputs {
            let mut cursor = item.segment.cursor();
            while let Some(key) = cursor.next() {
                let key = key?;
                let value = cursor.next().ok_or_else(|| {
                    StateError::Corrupt(format!("dangling key in {}", item.file_name()))
                })??;
                values.insert(key, value)?;
            }
        }
        let guard = progress.add(format!("{}.{range}.v", self.ii.name), values.len() as u64);
        let v = match self.files.write_file(
            range,
            values.iter()?.map(|pair| pair.map_err(StateError::from)),
            self.salt,
            false,
            self.fsync,
            Some(guard.progress()),
        ) {
            Ok(v) => v,
            Err(err) => {
                ef.delete_from_disk();
                return Err(err)
            }
        };
        Ok(HistoryFiles { v, ef })
    }
}

impl std::fmt::Debug for History {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("History")
            .field("name", &self.ii.name)
            .field("snapshots_disabled", &self.snapshots_disabled)
            .finish()
    }
}
