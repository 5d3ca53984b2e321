//! Inverted index: key -> sorted set of txNums that touched it.
//!
//! The live tail lives in two DB tables, one ordered `txNum ++ key` for pruning and collation,
//! one ordered `key ++ txNum` for queries. Frozen steps live in `.ef` segment files storing a
//! roaring bitmap per key, merged by bitmap union.

use crate::{
    config::CompressionKind,
    files::{FileItem, FileSet, StepRange},
    prune::InvertedIndexPruneStat,
    tables::{self, IiTables},
    util::ProgressSet,
    StateError, StateResult,
};
use roaring::RoaringTreemap;
use sediment_kv::{DbCursor, DbTx, DbTxMut};
use std::{
    collections::{BTreeMap, VecDeque},
    path::PathBuf,
    sync::Arc,
};
use tracing::*;

pub(crate) struct InvertedIndex {
    pub(crate) name: String,
    pub(crate) tables: IiTables,
    pub(crate) files: FileSet,
    pub(crate) salt: u32,
    pub(crate) fsync: bool,
}

/// In-memory result of collating one step out of the DB tail.
#[derive(Debug, Default)]
pub(crate) struct InvertedIndexCollation {
    pub(crate) step: u64,
    pub(crate) bitmaps: BTreeMap<Vec<u8>, RoaringTreemap>,
}

impl InvertedIndex {
    pub(crate) fn new(
        dir: PathBuf,
        name: impl Into<String>,
        tables: IiTables,
        step_size: u64,
        frozen_span: u64,
        salt: u32,
        fsync: bool,
    ) -> Self {
        let name = name.into();
        Self {
            files: FileSet::new(
                dir,
                name.clone(),
                "ef",
                "efi",
                step_size,
                frozen_span,
                CompressionKind::None,
            ),
            name,
            tables,
            salt,
            fsync,
        }
    }

    /// Records that `key` was touched at `tx_num`.
    pub(crate) fn put<T: DbTxMut>(&self, tx: &mut T, key: &[u8], tx_num: u64) -> StateResult<()> {
        tx.put(self.tables.keys, &tables::tx_with_key(tx_num, key), &[])?;
        tx.append(self.tables.vals, &tables::key_with_tx(key, tx_num), &[])?;
        Ok(())
    }

    /// Groups every `(key, txNum)` of `step` from the DB tail into per-key bitmaps.
    pub(crate) fn collate<T: DbTx>(
        &self,
        tx: &T,
        step: u64,
    ) -> StateResult<InvertedIndexCollation> {
        let tx_from = step * self.files.step_size();
        let tx_to = (step + 1) * self.files.step_size();

        let mut collation = InvertedIndexCollation { step, ..Default::default() };
        let mut cursor = tx.cursor(self.tables.keys)?;
        let mut entry = cursor.seek(&tables::tx_key(tx_from))?;
        while let Some((raw, _)) = entry {
            let (tx_num, key) = tables::split_tx_key(&raw)
                .ok_or_else(|| StateError::Corrupt(format!("bad {} row", self.tables.keys)))?;
            if tx_num >= tx_to {
                break
            }
            collation.bitmaps.entry(key.to_vec()).or_default().insert(tx_num);
            entry = cursor.next()?;
        }
        Ok(collation)
    }

    /// Writes the collation into an immutable `.ef` file with its accessor. A step with no
    /// touches still produces an (empty) file so the visible chain stays gap-free.
    pub(crate) fn build_files(
        &self,
        step: u64,
        collation: InvertedIndexCollation,
        progress: &ProgressSet,
    ) -> StateResult<Arc<FileItem>> {
        debug_assert_eq!(step, collation.step);
        let range = StepRange::new(step, step + 1);
        let guard = progress.add(
            format!("{}.{range}.ef", self.name),
            collation.bitmaps.len() as u64,
        );
        let pairs = collation
            .bitmaps
            .into_iter()
            .map(|(key, bitmap)| Ok((key, serialize_bitmap(&bitmap)?)));
        self.files.write_file(range, pairs, self.salt, false, self.fsync, Some(guard.progress()))
    }

    /// Deletes DB rows with `txNum ∈ [from_tx, to_tx)`, at most `limit` of them.
    pub(crate) fn prune<T: DbTxMut>(
        &self,
        tx: &mut T,
        from_tx: u64,
        to_tx: u64,
        limit: u64,
    ) -> StateResult<InvertedIndexPruneStat> {
        let mut stat = InvertedIndexPruneStat::default();
        let rows = self.collect_prunable(tx, from_tx, to_tx, limit)?;
        for (tx_num, key) in rows {
            tx.delete(self.tables.keys, &tables::tx_with_key(tx_num, &key))?;
            tx.delete(self.tables.vals, &tables::key_with_tx(&key, tx_num))?;
            if stat.pruned_nothing() {
                stat.min_tx = tx_num;
            }
            stat.max_tx = stat.max_tx.max(tx_num);
            stat.pruned += 1;
        }
        if !stat.pruned_nothing() {
            trace!(target: "state", index = %self.name, %stat, "pruned inverted index");
        }
        Ok(stat)
    }

    pub(crate) fn collect_prunable<T: DbTx>(
        &self,
        tx: &T,
        from_tx: u64,
        to_tx: u64,
        limit: u64,
    ) -> StateResult<Vec<(u64, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut cursor = tx.cursor(self.tables.keys)?;
        let mut entry = cursor.seek(&tables::tx_key(from_tx))?;
        while let Some((raw, _)) = entry {
            if out.len() as u64 >= limit {
                break
            }
            let (tx_num, key) = tables::split_tx_key(&raw)
                .ok_or_else(|| StateError::Corrupt(format!("bad {} row", self.tables.keys)))?;
            if tx_num >= to_tx {
                break
            }
            out.push((tx_num, key.to_vec()));
            entry = cursor.next()?;
        }
        Ok(out)
    }

    /// Whether the DB tail still holds rows below `to_tx`.
    pub(crate) fn can_prune<T: DbTx>(&self, tx: &T, to_tx: u64) -> StateResult<bool> {
        let mut cursor = tx.cursor(self.tables.keys)?;
        match cursor.first()? {
            Some((raw, _)) => Ok(tables::split_tx_key(&raw)
                .map(|(tx_num, _)| tx_num < to_tx)
                .unwrap_or_default()),
            None => Ok(false),
        }
    }

    /// Greatest txNum present in the DB tail.
    pub(crate) fn max_tx_in_db<T: DbTx>(&self, tx: &T) -> StateResult<u64> {
        let mut cursor = tx.cursor(self.tables.keys)?;
        match cursor.last()? {
            Some((raw, _)) => {
                Ok(tables::split_tx_key(&raw).map(|(tx_num, _)| tx_num).unwrap_or_default())
            }
            None => Ok(0),
        }
    }

    /// Smallest txNum present in the DB tail.
    pub(crate) fn min_tx_in_db<T: DbTx>(&self, tx: &T) -> StateResult<u64> {
        let mut cursor = tx.cursor(self.tables.keys)?;
        match cursor.first()? {
            Some((raw, _)) => {
                Ok(tables::split_tx_key(&raw).map(|(tx_num, _)| tx_num).unwrap_or_default())
            }
            None => Ok(0),
        }
    }

    /// Merges consecutive `.ef` files into one by per-key bitmap union.
    pub(crate) fn merge_files(
        &self,
        inputs: &[Arc<FileItem>],
        range: StepRange,
        progress: &ProgressSet,
    ) -> StateResult<Arc<FileItem>> {
        let mut merged: BTreeMap<Vec<u8>, RoaringTreemap> = BTreeMap::new();
        for item in inputs {
            let mut cursor = item.segment.cursor();
            while let Some(key) = cursor.next() {
                let key = key?;
                let value = cursor.next().ok_or_else(|| {
                    StateError::Corrupt(format!("dangling key in {}", item.file_name()))
                })??;
                let bitmap = RoaringTreemap::deserialize_from(&value[..])
                    .map_err(|err| StateError::Corrupt(err.to_string()))?;
                *merged.entry(key).or_default() |= bitmap;
            }
        }
        let guard = progress.add(format!("{}.{range}.ef", self.name), merged.len() as u64);
        let pairs =
            merged.into_iter().map(|(key, bitmap)| Ok((key, serialize_bitmap(&bitmap)?)));
        self.files.write_file(range, pairs, self.salt, false, self.fsync, Some(guard.progress()))
    }
}

fn serialize_bitmap(bitmap: &RoaringTreemap) -> StateResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(bitmap.serialized_size());
    bitmap.serialize_into(&mut buf)?;
    Ok(buf)
}

impl std::fmt::Debug for InvertedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvertedIndex").field("name", &self.name).field("files", &self.files).finish()
    }
}

/// Reads the bitmap of `key` stored in one `.ef` file.
pub(crate) fn file_bitmap(item: &FileItem, key: &[u8]) -> StateResult<Option<RoaringTreemap>> {
    match item.segment.lookup(key)? {
        Some(raw) => Ok(Some(
            RoaringTreemap::deserialize_from(&raw[..])
                .map_err(|err| StateError::Corrupt(err.to_string()))?,
        )),
        None => Ok(None),
    }
}

/// Smallest txNum `>= ts` recorded for `key`, searching files first, then the DB tail.
pub(crate) fn first_tx_at_or_after<T: DbTx>(
    files: &[Arc<FileItem>],
    ii_tables: IiTables,
    key: &[u8],
    ts: u64,
    tx: &T,
) -> StateResult<Option<u64>> {
    for item in files {
        if item.end_tx <= ts {
            continue
        }
        if let Some(bitmap) = file_bitmap(item, key)? {
            if let Some(found) = bitmap.iter().find(|&tx_num| tx_num >= ts) {
                return Ok(Some(found))
            }
        }
    }
    let files_end = files.last().map(|item| item.end_tx).unwrap_or_default();
    let mut cursor = tx.cursor(ii_tables.vals)?;
    let mut entry = cursor.seek(&tables::key_with_tx(key, ts.max(files_end)))?;
    while let Some((raw, _)) = entry {
        let Some((row_key, tx_num)) = tables::split_key_tx(&raw) else { break };
        if row_key != key {
            break
        }
        if tx_num >= ts {
            return Ok(Some(tx_num))
        }
        entry = cursor.next()?;
    }
    Ok(None)
}

/// Sorted stream of txNums recorded for `key` within `[from, to)`, across files and DB tail.
pub struct IdxRangeIter<C: DbCursor> {
    key: Vec<u8>,
    from: u64,
    to: u64,
    remaining: usize,
    /// Pending ascending sources: file items not yet opened, in ascending range order.
    pending_files: VecDeque<Arc<FileItem>>,
    current: Option<roaring::treemap::IntoIter>,
    /// DB tail, walked after all file sources; starts past the files' covered range.
    db: Option<DbTail<C>>,
    /// Eagerly collected values for descending iteration.
    eager_desc: Option<std::vec::IntoIter<u64>>,
}

struct DbTail<C> {
    cursor: C,
    start_tx: u64,
    started: bool,
}

pub(crate) fn idx_range<'a, T: DbTx>(
    files: &[Arc<FileItem>],
    ii_tables: IiTables,
    key: &[u8],
    from: u64,
    to: u64,
    asc: bool,
    limit: usize,
    tx: &'a T,
) -> StateResult<IdxRangeIter<T::Cursor<'a>>> {
    let relevant: VecDeque<Arc<FileItem>> = files
        .iter()
        .filter(|item| item.end_tx > from && item.start_tx < to)
        .cloned()
        .collect();
    let files_end = files.last().map(|item| item.end_tx).unwrap_or_default();

    let mut iter = IdxRangeIter {
        key: key.to_vec(),
        from,
        to,
        remaining: limit,
        pending_files: relevant,
        current: None,
        db: Some(DbTail {
            cursor: tx.cursor(ii_tables.vals)?,
            start_tx: from.max(files_end),
            started: false,
        }),
        eager_desc: None,
    };
    if !asc {
        let mut all = Vec::new();
        while let Some(value) = iter.next_asc()? {
            all.push(value);
        }
        all.reverse();
        all.truncate(limit);
        iter.eager_desc = Some(all.into_iter());
    }
    Ok(iter)
}

impl<C: DbCursor> IdxRangeIter<C> {
    fn next_asc(&mut self) -> StateResult<Option<u64>> {
        loop {
            if let Some(current) = self.current.as_mut() {
                for value in current.by_ref() {
                    if value < self.from {
                        continue
                    }
                    if value >= self.to {
                        break
                    }
                    return Ok(Some(value))
                }
                self.current = None;
            }
            if let Some(item) = self.pending_files.pop_front() {
                if let Some(bitmap) = file_bitmap(&item, &self.key)? {
                    self.current = Some(bitmap.into_iter());
                }
                continue
            }
            let Some(db) = self.db.as_mut() else { return Ok(None) };
            let entry = if db.started {
                db.cursor.next()?
            } else {
                db.started = true;
                db.cursor.seek(&tables::key_with_tx(&self.key, db.start_tx))?
            };
            let Some((raw, _)) = entry else {
                self.db = None;
                return Ok(None)
            };
            let Some((row_key, tx_num)) = tables::split_key_tx(&raw) else {
                self.db = None;
                return Ok(None)
            };
            if row_key != self.key || tx_num >= self.to {
                self.db = None;
                return Ok(None)
            }
            if tx_num >= self.from && tx_num >= db.start_tx {
                return Ok(Some(tx_num))
            }
        }
    }
}

impl<C: DbCursor> Iterator for IdxRangeIter<C> {
    type Item = StateResult<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None
        }
        if let Some(eager) = self.eager_desc.as_mut() {
            let value = eager.next()?;
            self.remaining -= 1;
            return Some(Ok(value))
        }
        match self.next_asc() {
            Ok(Some(value)) => {
                self.remaining -= 1;
                Some(Ok(value))
            }
            Ok(None) => None,
            Err(err) => {
                self.remaining = 0;
                Some(Err(err))
            }
        }
    }
}
