//! Consistent read views over the visible file sets.
//!
//! An [`AggregatorRoTx`] snapshots every entity's visible slice under the shared publication
//! lock and pins the files by refcount, so concurrent merges and prunes can never invalidate
//! it; the last view holding a superseded file unlinks it on close. The view is orthogonal to
//! the DB transaction callers pair it with.

use crate::{
    aggregator::Aggregator,
    commitment,
    domain::{segment_pairs_from, Domain, MergedPairs, PairSource},
    files::FileItem,
    inverted_index::{first_tx_at_or_after, idx_range, IdxRangeIter, InvertedIndex},
    tables, DomainId, InvertedIdx, StateError, StateResult,
};
use sediment_kv::{Database, DbCursor, DbTx};
use std::sync::Arc;

/// Read handle over one domain's visible files.
#[derive(Debug)]
pub struct DomainRoTx {
    pub(crate) d: Arc<Domain>,
    pub(crate) kv_files: Arc<Vec<Arc<FileItem>>>,
    pub(crate) v_files: Arc<Vec<Arc<FileItem>>>,
    pub(crate) ef_files: Arc<Vec<Arc<FileItem>>>,
    closed: bool,
}

impl DomainRoTx {
    pub(crate) fn new(d: &Arc<Domain>) -> Self {
        let kv_files = d.files.visible();
        let v_files = d.hist.files.visible();
        let ef_files = d.hist.ii.files.visible();
        for item in kv_files.iter().chain(v_files.iter()).chain(ef_files.iter()) {
            item.retain();
        }
        Self { d: d.clone(), kv_files, v_files, ef_files, closed: false }
    }

    /// End txNum of this view's values files.
    pub fn files_end_tx(&self) -> u64 {
        self.kv_files.last().map(|item| item.end_tx).unwrap_or_default()
    }

    /// Step ranges of this view's values files.
    pub fn kv_file_ranges(&self) -> Vec<crate::StepRange> {
        self.kv_files.iter().map(|item| item.range).collect()
    }

    /// File names of every file pinned by this view.
    pub fn files(&self) -> Vec<String> {
        self.kv_files
            .iter()
            .chain(self.v_files.iter())
            .chain(self.ef_files.iter())
            .map(|item| item.file_name())
            .collect()
    }

    pub fn get_latest<T: DbTx>(&self, key: &[u8], tx: &T) -> StateResult<Option<(Vec<u8>, u64)>> {
        self.d.get_latest(key, &self.kv_files, tx)
    }

    pub fn get_as_of<T: DbTx>(&self, key: &[u8], ts: u64, tx: &T) -> StateResult<Option<Vec<u8>>> {
        self.d.get_as_of(key, ts, &self.kv_files, &self.v_files, &self.ef_files, tx)
    }

    /// Ordered stream of `(key, latest value)` over `[from_key, to_key)`. Deletion markers are
    /// filtered out.
    pub fn range_latest<'a, T: DbTx>(
        &'a self,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        limit: usize,
        tx: &'a T,
    ) -> StateResult<impl Iterator<Item = StateResult<(Vec<u8>, Vec<u8>)>> + 'a> {
        let mut sources: Vec<PairSource<'a>> = Vec::with_capacity(self.kv_files.len() + 1);
        for item in self.kv_files.iter() {
            sources.push(segment_pairs_from(&item.segment, from_key, to_key)?);
        }
        sources.push(db_latest_source(self.d.values_table, from_key, to_key, tx)?);
        Ok(MergedPairs::new(sources)
            .filter(|pair| pair.as_ref().map(|(_, value)| !value.is_empty()).unwrap_or(true))
            .take(limit))
    }

    /// Ordered stream of `(key, value as of ts)` over `[from_key, to_key)`.
    pub fn range_as_of<'a, T: DbTx>(
        &'a self,
        ts: u64,
        from_key: &[u8],
        to_key: Option<&[u8]>,
        limit: usize,
        tx: &'a T,
    ) -> StateResult<impl Iterator<Item = StateResult<(Vec<u8>, Vec<u8>)>> + 'a> {
        // Keys touched at or after `ts`: their as-of value comes from history (empty meaning
        // the key did not exist yet). Everything else falls through to the latest stream.
        let mut key_sources: Vec<PairSource<'a>> = Vec::with_capacity(self.ef_files.len() + 1);
        for item in self.ef_files.iter() {
            key_sources.push(segment_pairs_from(&item.segment, from_key, to_key)?);
        }
        key_sources.push(db_ii_keys_source(
            self.d.hist.ii.tables.vals,
            from_key,
            to_key,
            tx,
        )?);
        let overlay = MergedPairs::new(key_sources).filter_map(
            move |pair| -> Option<StateResult<(Vec<u8>, Vec<u8>)>> {
                let (key, _) = match pair {
                    Ok(pair) => pair,
                    Err(err) => return Some(Err(err)),
                };
                match first_tx_at_or_after(&self.ef_files, self.d.hist.ii.tables, &key, ts, tx) {
                    Ok(Some(found_tx)) => {
                        match self.d.hist.value_at(&self.v_files, &key, found_tx, tx) {
                            Ok(prev) => Some(Ok((key, prev))),
                            Err(err) => Some(Err(err)),
                        }
                    }
                    Ok(None) => None,
                    Err(err) => Some(Err(err)),
                }
            },
        );

        let latest = {
            let mut sources: Vec<PairSource<'a>> = Vec::with_capacity(self.kv_files.len() + 1);
            for item in self.kv_files.iter() {
                sources.push(segment_pairs_from(&item.segment, from_key, to_key)?);
            }
            sources.push(db_latest_source(self.d.values_table, from_key, to_key, tx)?);
            MergedPairs::new(sources)
        };

        Ok(AsOfMerge {
            overlay: (Box::new(overlay) as PairSource<'a>).peekable(),
            latest: (Box::new(latest) as PairSource<'a>).peekable(),
        }
        .filter(|pair| pair.as_ref().map(|(_, value)| !value.is_empty()).unwrap_or(true))
        .take(limit))
    }

    pub(crate) fn close(&mut self) {
        if self.closed {
            return
        }
        self.closed = true;
        for item in
            self.kv_files.iter().chain(self.v_files.iter()).chain(self.ef_files.iter())
        {
            item.release();
        }
    }
}

impl Drop for DomainRoTx {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read handle over one standalone inverted index.
#[derive(Debug)]
pub struct InvertedIndexRoTx {
    pub(crate) ii: Arc<InvertedIndex>,
    pub(crate) files: Arc<Vec<Arc<FileItem>>>,
    closed: bool,
}

impl InvertedIndexRoTx {
    pub(crate) fn new(ii: &Arc<InvertedIndex>) -> Self {
        let files = ii.files.visible();
        for item in files.iter() {
            item.retain();
        }
        Self { ii: ii.clone(), files, closed: false }
    }

    /// Sorted stream of txNums that touched `key` within `[from, to)`.
    pub fn idx_range<'a, T: DbTx>(
        &self,
        key: &[u8],
        from: u64,
        to: u64,
        asc: bool,
        limit: usize,
        tx: &'a T,
    ) -> StateResult<IdxRangeIter<T::Cursor<'a>>> {
        idx_range(&self.files, self.ii.tables, key, from, to, asc, limit, tx)
    }

    pub(crate) fn close(&mut self) {
        if self.closed {
            return
        }
        self.closed = true;
        for item in self.files.iter() {
            item.release();
        }
    }
}

impl Drop for InvertedIndexRoTx {
    fn drop(&mut self) {
        self.close();
    }
}

/// Snapshot-isolated read view across every domain and standalone index.
#[derive(Debug)]
pub struct AggregatorRoTx<D: Database> {
    pub(crate) a: Option<Arc<Aggregator<D>>>,
    pub(crate) d: Vec<DomainRoTx>,
    pub(crate) iis: Vec<InvertedIndexRoTx>,
    pub(crate) id: u64,
    pub(crate) leak_id: u64,
}

impl<D: Database> AggregatorRoTx<D> {
    /// Auto-incremented id of this view, for tracing.
    pub fn view_id(&self) -> u64 {
        self.id
    }

    pub fn domain(&self, id: DomainId) -> &DomainRoTx {
        &self.d[id.index()]
    }

    /// File names of every file pinned by this view.
    pub fn all_files(&self) -> Vec<String> {
        let mut out: Vec<String> = self.d.iter().flat_map(|d| d.files()).collect();
        for ii in &self.iis {
            out.extend(ii.files.iter().map(|item| item.file_name()));
        }
        out
    }

    pub fn get_latest<T: DbTx>(
        &self,
        id: DomainId,
        key: &[u8],
        tx: &T,
    ) -> StateResult<Option<(Vec<u8>, u64)>> {
        self.domain(id).get_latest(key, tx)
    }

    pub fn get_as_of<T: DbTx>(
        &self,
        id: DomainId,
        key: &[u8],
        ts: u64,
        tx: &T,
    ) -> StateResult<Option<Vec<u8>>> {
        self.domain(id).get_as_of(key, ts, tx)
    }

    pub fn index_range<'a, T: DbTx>(
        &self,
        idx: InvertedIdx,
        key: &[u8],
        from: u64,
        to: u64,
        asc: bool,
        limit: usize,
        tx: &'a T,
    ) -> StateResult<IdxRangeIter<T::Cursor<'a>>> {
        let ii = self
            .iis
            .iter()
            .find(|ro| ro.ii.name == idx.name())
            .ok_or_else(|| StateError::Background(format!("unknown index {idx:?}")))?;
        ii.idx_range(key, from, to, asc, limit, tx)
    }

    /// Resolves the state key referenced by a commitment leaf of `id`.
    pub fn resolve_commitment_ref(
        &self,
        id: DomainId,
        referenced: &crate::KeyRef,
    ) -> StateResult<Vec<u8>> {
        commitment::resolve_key_ref(referenced, id, &self.domain(id).kv_files)
    }

    /// Smallest end txNum among the given domains' visible values files.
    pub fn tx_nums_in_files(&self, domains: &[DomainId]) -> u64 {
        debug_assert!(!domains.is_empty(), "missed arguments");
        domains
            .iter()
            .map(|id| self.domain(*id).files_end_tx())
            .min()
            .unwrap_or_default()
    }

    /// Greatest fully aggregated step of the given domains.
    pub fn steps_in_files(&self, domains: &[DomainId]) -> u64 {
        let tx_num = self.tx_nums_in_files(domains);
        match self.a.as_ref() {
            Some(a) => tx_num.saturating_sub(u64::from(tx_num > 0)) / a.step_size(),
            None => 0,
        }
    }

    /// Toggles kernel readahead for every mapped values file of this view.
    pub fn advise_normal(&self) -> StateResult<()> {
        for d in &self.d {
            for item in d.kv_files.iter() {
                item.segment.advise_normal()?;
            }
        }
        Ok(())
    }

    pub fn disable_readahead(&self) -> StateResult<()> {
        for d in &self.d {
            for item in d.kv_files.iter() {
                item.segment.advise_random()?;
            }
        }
        Ok(())
    }

    /// Idempotent: releases the pinned files and the leak-detector registration.
    pub fn close(&mut self) {
        let Some(a) = self.a.take() else { return };
        a.leak_detector().release(self.leak_id);
        for d in &mut self.d {
            d.close();
        }
        for ii in &mut self.iis {
            ii.close();
        }
    }
}

impl<D: Database> Drop for AggregatorRoTx<D> {
    fn drop(&mut self) {
        self.close();
    }
}

/// DB source for latest-range streams. Rows are `key ++ !step` with the newest step first,
/// so the first row of each key wins and the older step rows are skipped.
fn db_latest_source<'a, T: DbTx>(
    table: &'static str,
    from_key: &[u8],
    to_key: Option<&[u8]>,
    tx: &'a T,
) -> StateResult<PairSource<'a>> {
    let mut cursor = tx.cursor(table)?;
    let mut entry = cursor.seek(from_key)?;
    let to_key = to_key.map(|to| to.to_vec());
    let mut last_key: Option<Vec<u8>> = None;
    Ok(Box::new(std::iter::from_fn(move || loop {
        let (raw_key, value) = entry.take()?;
        entry = match cursor.next() {
            Ok(next) => next,
            Err(err) => return Some(Err(err.into())),
        };
        let Some((key, _)) = tables::split_key_inverted_step(&raw_key) else {
            return Some(Err(StateError::Corrupt(format!("bad {table} row"))))
        };
        if to_key.as_deref().is_some_and(|to| key >= to) {
            return None
        }
        if last_key.as_deref() == Some(key) {
            continue
        }
        last_key = Some(key.to_vec());
        return Some(Ok((key.to_vec(), value)))
    })))
}

/// DB source yielding the distinct keys of an inverted index `key ++ txNum` table.
fn db_ii_keys_source<'a, T: DbTx>(
    table: &'static str,
    from_key: &[u8],
    to_key: Option<&[u8]>,
    tx: &'a T,
) -> StateResult<PairSource<'a>> {
    let mut cursor = tx.cursor(table)?;
    let mut entry = cursor.seek(from_key)?;
    let to_key = to_key.map(|to| to.to_vec());
    let mut last_key: Option<Vec<u8>> = None;
    Ok(Box::new(std::iter::from_fn(move || loop {
        let (raw, _) = entry.take()?;
        entry = match cursor.next() {
            Ok(next) => next,
            Err(err) => return Some(Err(err.into())),
        };
        let Some((key, _)) = tables::split_key_tx(&raw) else {
            return Some(Err(StateError::Corrupt(format!("bad {table} row"))))
        };
        if to_key.as_deref().is_some_and(|to| key >= to) {
            return None
        }
        if last_key.as_deref() == Some(key) {
            continue
        }
        last_key = Some(key.to_vec());
        return Some(Ok((key.to_vec(), Vec::new())))
    })))
}

/// Zip-merge of the history overlay with the latest stream; overlay wins on shared keys.
struct AsOfMerge<'a> {
    overlay: std::iter::Peekable<PairSource<'a>>,
    latest: std::iter::Peekable<PairSource<'a>>,
}

impl Iterator for AsOfMerge<'_> {
    type Item = StateResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let overlay_key = match self.overlay.peek() {
                Some(Ok((key, _))) => Some(key.clone()),
                Some(Err(_)) => return self.overlay.next(),
                None => None,
            };
            let latest_key = match self.latest.peek() {
                Some(Ok((key, _))) => Some(key.clone()),
                Some(Err(_)) => return self.latest.next(),
                None => None,
            };
            return match (overlay_key, latest_key) {
                (Some(o), Some(l)) if o == l => {
                    let _ = self.latest.next();
                    self.overlay.next()
                }
                (Some(o), Some(l)) if o < l => self.overlay.next(),
                (Some(_), Some(_)) | (None, Some(_)) => self.latest.next(),
                (Some(_), None) => self.overlay.next(),
                (None, None) => None,
            }
        }
    }
}
