//! Domain: a named state table composed of a latest-value layer, a history and an inverted
//! index, each persisted as its own file triple per step.
//!
//! `get_latest` consults the DB row first (it is authoritative while present), then the
//! visible values files newest to oldest. `get_as_of` goes through the history and falls back
//! to the latest value when history ended before the requested txNum.

use crate::{
    collector::Collector,
    commitment::ValueTransformer,
    config::domain_schema,
    files::{FileItem, FileSet, StepRange},
    history::{History, HistoryCollation, HistoryFiles},
    prune::DomainPruneStat,
    tables::{self, IiTables},
    util::ProgressSet,
    DomainId, StateError, StateResult,
};
use sediment_kv::{DbCursor, DbTx, DbTxMut};
use sediment_segment::Segment;
use std::{
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc},
};
use tracing::*;

const COLLATE_BUFFER_BYTES: usize = 128 * 1024 * 1024;

pub(crate) struct Domain {
    pub(crate) id: DomainId,
    pub(crate) hist: History,
    pub(crate) values_table: &'static str,
    /// `.kv` latest-value files.
    pub(crate) files: FileSet,
    /// Held true while a commitment merge may still resolve references into this domain's
    /// pre-merge files, blocking their deletion.
    pub(crate) restrict_subset_file_deletions: AtomicBool,
    salt: u32,
    fsync: bool,
    tmp_dir: PathBuf,
}

pub(crate) struct DomainCollation {
    pub(crate) step: u64,
    pub(crate) values: Collector,
    pub(crate) hist: Option<HistoryCollation>,
}

pub(crate) struct DomainFiles {
    pub(crate) kv: Arc<FileItem>,
    pub(crate) hist: Option<HistoryFiles>,
}

impl DomainFiles {
    pub(crate) fn cleanup_on_error(&self) {
        self.kv.delete_from_disk();
        if let Some(hist) = &self.hist {
            hist.cleanup_on_error();
        }
    }
}

/// Merge windows of one domain for one round. History and index merge together; the values
/// window may differ (commitment coupling can hold one back).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DomainRanges {
    pub(crate) values: Option<StepRange>,
    pub(crate) history: Option<StepRange>,
}

impl DomainRanges {
    pub(crate) fn any(&self) -> bool {
        self.values.is_some() || self.history.is_some()
    }
}

pub(crate) struct DomainMergedFiles {
    pub(crate) kv: Option<Arc<FileItem>>,
    pub(crate) hist: Option<HistoryFiles>,
}

impl DomainMergedFiles {
    pub(crate) fn cleanup_on_error(&self) {
        if let Some(kv) = &self.kv {
            kv.delete_from_disk();
        }
        if let Some(hist) = &self.hist {
            hist.cleanup_on_error();
        }
    }
}

impl Domain {
    pub(crate) fn new(
        dir: PathBuf,
        tmp_dir: PathBuf,
        id: DomainId,
        step_size: u64,
        frozen_span: u64,
        keep_recent_txns: u64,
        salt: u32,
        fsync: bool,
    ) -> Self {
        let schema = domain_schema(id);
        let t = id.tables();
        Self {
            hist: History::new(
                dir.clone(),
                tmp_dir.clone(),
                id.name(),
                IiTables { keys: t.idx_keys, vals: t.idx_vals },
                t.history_vals,
                step_size,
                frozen_span,
                schema.history_compression,
                schema.history_disabled,
                keep_recent_txns,
                salt,
                fsync,
            ),
            files: FileSet::new(
                dir,
                id.name(),
                "kv",
                "kvi",
                step_size,
                frozen_span,
                schema.values_compression,
            ),
            id,
            values_table: t.values,
            restrict_subset_file_deletions: AtomicBool::new(false),
            salt,
            fsync,
            tmp_dir,
        }
    }

    /// Exact-now read: DB rows first (a key's newest step sorts first), then visible values
    /// files newest to oldest. The step of a file-served value is the last step the file
    /// covers.
    pub(crate) fn get_latest<T: DbTx>(
        &self,
        key: &[u8],
        kv_files: &[Arc<FileItem>],
        tx: &T,
    ) -> StateResult<Option<(Vec<u8>, u64)>> {
        let mut cursor = tx.cursor(self.values_table)?;
        if let Some((raw_key, value)) = cursor.seek(key)? {
            if let Some((row_key, step)) = tables::split_key_inverted_step(&raw_key) {
                if row_key == key {
                    return Ok(Some((value, step)))
                }
            }
        }
        for item in kv_files.iter().rev() {
            if let Some(value) = item.segment.lookup(key)? {
                return Ok(Some((value, item.range.to_step.saturating_sub(1))))
            }
        }
        Ok(None)
    }

    /// Point-in-time read just before `ts`. An empty stored value means the key was absent.
    pub(crate) fn get_as_of<T: DbTx>(
        &self,
        key: &[u8],
        ts: u64,
        kv_files: &[Arc<FileItem>],
        v_files: &[Arc<FileItem>],
        ef_files: &[Arc<FileItem>],
        tx: &T,
    ) -> StateResult<Option<Vec<u8>>> {
        if let Some(prev) = self.hist.history_seek(v_files, ef_files, key, ts, tx)? {
            return Ok((!prev.is_empty()).then_some(prev))
        }
        match self.get_latest(key, kv_files, tx)? {
            Some((value, _)) if !value.is_empty() => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    /// Collates every key's closing value of `step`, plus the step's history.
    pub(crate) fn collate<T: DbTx>(&self, tx: &T, step: u64) -> StateResult<DomainCollation> {
        let mut values = Collector::new(&self.tmp_dir, COLLATE_BUFFER_BYTES);
        let mut cursor = tx.cursor(self.values_table)?;
        let mut entry = cursor.first()?;
        while let Some((raw_key, value)) = entry {
            let (key, row_step) = tables::split_key_inverted_step(&raw_key).ok_or_else(|| {
                StateError::Corrupt(format!("bad {} row", self.values_table))
            })?;
            if row_step == step {
                values.insert(key.to_vec(), value)?;
            }
            entry = cursor.next()?;
        }
        let hist = if self.hist.snapshots_disabled {
            None
        } else {
            Some(self.hist.collate(tx, step)?)
        };
        Ok(DomainCollation { step, values, hist })
    }

    /// Builds the file triple for one step, removing every partial output on failure.
    pub(crate) fn build_files(
        &self,
        step: u64,
        collation: DomainCollation,
        progress: &ProgressSet,
    ) -> StateResult<DomainFiles> {
        let range = StepRange::new(step, step + 1);
        let mut collation = collation;

        let guard =
            progress.add(format!("{}.{range}.kv", self.id.name()), collation.values.len() as u64);
        let kv = self.files.write_file(
            range,
            collation.values.iter()?.map(|pair| pair.map_err(StateError::from)),
            self.salt,
            true,
            self.fsync,
            Some(guard.progress()),
        )?;
        drop(guard);

        let hist = match collation.hist.take() {
            Some(hist_collation) => match self.hist.build_files(step, hist_collation, progress) {
                Ok(files) => Some(files),
                Err(err) => {
                    kv.delete_from_disk();
                    return Err(err)
                }
            },
            None => None,
        };
        debug!(target: "state", domain = self.id.name(), %range, "built domain files");
        Ok(DomainFiles { kv, hist })
    }

    pub(crate) fn integrate_files(&self, files: DomainFiles) {
        self.files.integrate(files.kv);
        if let Some(hist) = files.hist {
            self.hist.files.integrate(hist.v);
            self.hist.ii.files.integrate(hist.ef);
        }
    }

    /// Deletes latest rows whose step is already covered by files, then prunes history.
    pub(crate) fn prune<T: DbTxMut>(
        &self,
        tx: &mut T,
        step: u64,
        from_tx: u64,
        to_tx: u64,
        limit: u64,
    ) -> StateResult<DomainPruneStat> {
        let mut stat = DomainPruneStat::default();

        let mut doomed = Vec::new();
        let mut cursor = tx.cursor(self.values_table)?;
        let mut entry = cursor.first()?;
        while let Some((raw_key, _)) = entry {
            if doomed.len() as u64 >= limit {
                break
            }
            let (_, row_step) = tables::split_key_inverted_step(&raw_key).ok_or_else(|| {
                StateError::Corrupt(format!("bad {} row", self.values_table))
            })?;
            if row_step <= step {
                doomed.push(raw_key);
            }
            entry = cursor.next()?;
        }
        drop(cursor);
        for raw_key in doomed {
            tx.delete(self.values_table, &raw_key)?;
            stat.values_pruned += 1;
        }

        stat.history = self.hist.prune(tx, from_tx, to_tx, limit)?;
        Ok(stat)
    }

    /// Merges the selected inputs into the window files. Commitment passes a value
    /// transformer; values merged into a frozen file drop deletion markers for good.
    pub(crate) fn merge_files(
        &self,
        kv_inputs: &[Arc<FileItem>],
        v_inputs: &[Arc<FileItem>],
        ef_inputs: &[Arc<FileItem>],
        ranges: DomainRanges,
        transformer: Option<&ValueTransformer>,
        progress: &ProgressSet,
    ) -> StateResult<DomainMergedFiles> {
        let mut out = DomainMergedFiles { kv: None, hist: None };
        let result = (|| -> StateResult<()> {
            if let Some(range) = ranges.values {
                let frozen = range.span() >= self.files.frozen_span();
                let guard = progress.add(format!("{}.{range}.kv", self.id.name()), 0);
                let sources: Vec<PairSource<'_>> =
                    kv_inputs.iter().map(|item| segment_pairs(&item.segment)).collect();
                let merged = MergedPairs::new(sources).filter_map(
                    |pair| -> Option<StateResult<(Vec<u8>, Vec<u8>)>> {
                        let (key, value) = match pair {
                            Ok(pair) => pair,
                            Err(err) => return Some(Err(err)),
                        };
                        if frozen && value.is_empty() {
                            return None
                        }
                        match transformer {
                            Some(transform) => {
                                Some(transform(&key, &value).map(|value| (key, value)))
                            }
                            None => Some(Ok((key, value))),
                        }
                    },
                );
                out.kv = Some(self.files.write_file(
                    range,
                    merged,
                    self.salt,
                    true,
                    self.fsync,
                    Some(guard.progress()),
                )?);
            }
            if let Some(range) = ranges.history {
                out.hist = Some(self.hist.merge_files(v_inputs, ef_inputs, range, progress)?);
            }
            Ok(())
        })();
        if let Err(err) = result {
            out.cleanup_on_error();
            return Err(err)
        }
        Ok(out)
    }

    pub(crate) fn integrate_merged_files(&self, merged: &DomainMergedFiles) {
        if let Some(kv) = &merged.kv {
            self.files.integrate(kv.clone());
        }
        if let Some(hist) = &merged.hist {
            self.hist.files.integrate(hist.v.clone());
            self.hist.ii.files.integrate(hist.ef.clone());
        }
    }

    pub(crate) fn clean_after_merge(&self, merged: &DomainMergedFiles) {
        let restrict = self
            .restrict_subset_file_deletions
            .load(std::sync::atomic::Ordering::Acquire);
        if let Some(kv) = &merged.kv {
            self.files.clean_after_merge(kv, restrict);
        }
        if let Some(hist) = &merged.hist {
            self.hist.files.clean_after_merge(&hist.v, false);
            self.hist.ii.files.clean_after_merge(&hist.ef, false);
        }
    }

    /// Greatest step fully present in the DB tail, judged by the history index.
    pub(crate) fn max_step_in_db<T: DbTx>(&self, tx: &T) -> StateResult<u64> {
        Ok(self.hist.ii.max_tx_in_db(tx)? / self.files.step_size())
    }

    /// Same, for domains that keep no usable history: scans the latest table's step suffix.
    pub(crate) fn max_step_in_db_no_history<T: DbTx>(&self, tx: &T) -> StateResult<u64> {
        let mut max_step = 0;
        let mut cursor = tx.cursor(self.values_table)?;
        let mut entry = cursor.first()?;
        while let Some((raw_key, _)) = entry {
            if let Some((_, row_step)) = tables::split_key_inverted_step(&raw_key) {
                max_step = max_step.max(row_step);
            }
            entry = cursor.next()?;
        }
        Ok(max_step)
    }

    pub(crate) fn can_prune_until<T: DbTx>(&self, tx: &T, until_tx: u64) -> StateResult<bool> {
        if self.hist.ii.can_prune(tx, until_tx)? {
            return Ok(true)
        }
        // Latest rows become prunable once files fully cover their step.
        let mut cursor = tx.cursor(self.values_table)?;
        let mut entry = cursor.first()?;
        while let Some((raw_key, _)) = entry {
            if let Some((_, row_step)) = tables::split_key_inverted_step(&raw_key) {
                if (row_step + 1) * self.files.step_size() <= until_tx {
                    return Ok(true)
                }
            }
            entry = cursor.next()?;
        }
        Ok(false)
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain").field("id", &self.id).field("files", &self.files).finish()
    }
}

pub(crate) type PairSource<'a> = Box<dyn Iterator<Item = StateResult<(Vec<u8>, Vec<u8>)>> + 'a>;

/// Adapts a segment's word cursor into a pair stream.
pub(crate) fn segment_pairs(segment: &Segment) -> PairSource<'_> {
    let mut cursor = segment.cursor();
    Box::new(std::iter::from_fn(move || {
        let key = match cursor.next()? {
            Ok(key) => key,
            Err(err) => return Some(Err(err.into())),
        };
        match cursor.next() {
            Some(Ok(value)) => Some(Ok((key, value))),
            Some(Err(err)) => Some(Err(err.into())),
            None => Some(Err(StateError::Corrupt("dangling key word".to_string()))),
        }
    }))
}

/// Pair stream of a segment starting at the first key `>= from`, ending before `to`.
pub(crate) fn segment_pairs_from(
    segment: &Segment,
    from: &[u8],
    to: Option<&[u8]>,
) -> StateResult<PairSource<'static>> {
    let mut rows = Vec::new();
    let mut row = seek_row(segment, from)?;
    let pairs = segment.pairs();
    while row < pairs {
        let (key, value) = segment.pair_at(row)?;
        if to.is_some_and(|to| key.as_slice() >= to) {
            break
        }
        rows.push((key, value));
        row += 1;
    }
    Ok(Box::new(rows.into_iter().map(Ok)))
}

/// First pair row whose key is `>= target`, by binary search over the sorted key words.
pub(crate) fn seek_row(segment: &Segment, target: &[u8]) -> StateResult<u64> {
    let mut lo = 0u64;
    let mut hi = segment.pairs();
    while lo < hi {
        let mid = (lo + hi) / 2;
        let (key, _) = segment.pair_at(mid)?;
        if key.as_slice() < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Key-ordered merge across sorted pair sources; on equal keys the highest-index (newest)
/// source wins and stale versions are skipped.
pub(crate) struct MergedPairs<'a> {
    sources: Vec<PairSource<'a>>,
    heads: Vec<Option<(Vec<u8>, Vec<u8>)>>,
    init: bool,
}

impl<'a> MergedPairs<'a> {
    pub(crate) fn new(sources: Vec<PairSource<'a>>) -> Self {
        let heads = sources.iter().map(|_| None).collect();
        Self { sources, heads, init: false }
    }

    fn advance(&mut self, source: usize) -> StateResult<()> {
        self.heads[source] = self.sources[source].next().transpose()?;
        Ok(())
    }

    fn next_pair(&mut self) -> StateResult<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.init {
            self.init = true;
            for source in 0..self.sources.len() {
                self.advance(source)?;
            }
        }
        let mut chosen: Option<usize> = None;
        for (source, head) in self.heads.iter().enumerate() {
            let Some((key, _)) = head else { continue };
            match chosen {
                Some(best) => {
                    if key <= &self.heads[best].as_ref().expect("chosen head").0 {
                        chosen = Some(source);
                    }
                }
                None => chosen = Some(source),
            }
        }
        let Some(winner) = chosen else { return Ok(None) };
        let (key, value) = self.heads[winner].take().expect("winner head");
        self.advance(winner)?;
        for source in 0..self.heads.len() {
            while self.heads[source].as_ref().is_some_and(|(k, _)| *k == key) {
                self.advance(source)?;
            }
        }
        Ok(Some((key, value)))
    }
}

impl Iterator for MergedPairs<'_> {
    type Item = StateResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_pair().transpose()
    }
}
