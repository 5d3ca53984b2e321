//! Dirty and visible file sets of one entity layer.
//!
//! Every domain, history and inverted index owns one [`FileSet`] per file kind. The *dirty*
//! set is every file on disk, including superseded and still-invisible ones; the *visible*
//! set is the published, gap-free, overlap-free selection readers snapshot. Superseded files
//! are unlinked by whichever party drops the last reference: the merge cleanup when no view
//! holds them, or the closing read view otherwise.

use crate::{config::CompressionKind, util::Progress, StateError, StateResult};
use parking_lot::{Mutex, RwLock};
use sediment_segment::Segment;
use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tracing::*;

const FILE_VERSION: &str = "v1";

/// Half-open step span `[from_step, to_step)` identifying one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepRange {
    pub from_step: u64,
    pub to_step: u64,
}

impl StepRange {
    pub const fn new(from_step: u64, to_step: u64) -> Self {
        Self { from_step, to_step }
    }

    pub const fn span(&self) -> u64 {
        self.to_step - self.from_step
    }

    pub const fn tx_from(&self, step_size: u64) -> u64 {
        self.from_step * step_size
    }

    pub const fn tx_to(&self, step_size: u64) -> u64 {
        self.to_step * step_size
    }

    /// Whether `other` lies fully inside `self`.
    pub const fn covers(&self, other: &Self) -> bool {
        self.from_step <= other.from_step && other.to_step <= self.to_step
    }
}

impl fmt::Display for StepRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from_step, self.to_step)
    }
}

/// One immutable file on disk together with its read state.
pub(crate) struct FileItem {
    pub(crate) range: StepRange,
    pub(crate) start_tx: u64,
    pub(crate) end_tx: u64,
    /// A file of the maximum merge span; never merged again.
    pub(crate) frozen: bool,
    pub(crate) segment: Segment,
    pub(crate) data_path: PathBuf,
    pub(crate) accessor_path: PathBuf,
    /// Number of read views currently holding this file.
    refcount: AtomicU64,
    /// Superseded by a merged file; unlink once the refcount drains.
    can_delete: AtomicBool,
}

impl fmt::Debug for FileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileItem")
            .field("path", &self.data_path)
            .field("range", &self.range)
            .field("refs", &self.refcount.load(Ordering::Relaxed))
            .field("can_delete", &self.can_delete.load(Ordering::Relaxed))
            .finish()
    }
}

impl FileItem {
    fn new(
        range: StepRange,
        step_size: u64,
        frozen_span: u64,
        segment: Segment,
        data_path: PathBuf,
        accessor_path: PathBuf,
    ) -> Self {
        Self {
            range,
            start_tx: range.tx_from(step_size),
            end_tx: range.tx_to(step_size),
            frozen: range.span() >= frozen_span,
            segment,
            data_path,
            accessor_path,
            refcount: AtomicU64::new(0),
            can_delete: AtomicBool::new(false),
        }
    }

    pub(crate) fn has_accessor(&self) -> bool {
        self.segment.accessor().is_some()
    }

    pub(crate) fn file_name(&self) -> String {
        self.data_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub(crate) fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; the last holder of a superseded file unlinks it.
    pub(crate) fn release(&self) {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 &&
            self.can_delete.load(Ordering::Acquire)
        {
            self.delete_from_disk();
        }
    }

    pub(crate) fn mark_deleted(&self) {
        self.can_delete.store(true, Ordering::Release);
        if self.refcount.load(Ordering::Acquire) == 0 {
            self.delete_from_disk();
        }
    }

    pub(crate) fn delete_from_disk(&self) {
        debug!(target: "state", file = %self.file_name(), "unlinking");
        for path in [&self.data_path, &self.accessor_path] {
            if path.exists() {
                if let Err(err) = std::fs::remove_file(path) {
                    warn!(target: "state", ?path, %err, "failed to unlink file");
                }
            }
        }
    }
}

pub(crate) type DirtyFiles = BTreeMap<(u64, u64), Arc<FileItem>>;

/// The file layer of one entity and file kind.
pub(crate) struct FileSet {
    /// Filename base, e.g. `accounts` or `logaddrs`.
    base: String,
    ext: &'static str,
    accessor_ext: &'static str,
    dir: PathBuf,
    step_size: u64,
    frozen_span: u64,
    compression: CompressionKind,
    dirty: Mutex<DirtyFiles>,
    visible: RwLock<Arc<Vec<Arc<FileItem>>>>,
}

impl fmt::Debug for FileSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSet")
            .field("base", &self.base)
            .field("ext", &self.ext)
            .field("dirty", &self.dirty.lock().len())
            .field("visible", &self.visible.read().len())
            .finish()
    }
}

impl FileSet {
    pub(crate) fn new(
        dir: PathBuf,
        base: impl Into<String>,
        ext: &'static str,
        accessor_ext: &'static str,
        step_size: u64,
        frozen_span: u64,
        compression: CompressionKind,
    ) -> Self {
        Self {
            base: base.into(),
            ext,
            accessor_ext,
            dir,
            step_size,
            frozen_span,
            compression,
            dirty: Mutex::new(BTreeMap::new()),
            visible: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub(crate) fn data_path(&self, range: StepRange) -> PathBuf {
        self.dir.join(format!("{FILE_VERSION}-{}.{range}.{}", self.base, self.ext))
    }

    pub(crate) fn accessor_path(&self, range: StepRange) -> PathBuf {
        self.dir.join(format!("{FILE_VERSION}-{}.{range}.{}", self.base, self.accessor_ext))
    }

    pub(crate) const fn step_size(&self) -> u64 {
        self.step_size
    }

    pub(crate) const fn frozen_span(&self) -> u64 {
        self.frozen_span
    }

    /// Scans the snapshot directory and (re-)opens every file of this set. Files rejected by
    /// `integrity` are skipped entirely; files lacking their accessor are kept dirty but stay
    /// invisible until [`Self::build_missed_accessor`] handles them.
    pub(crate) fn open_folder(
        &self,
        integrity: impl Fn(StepRange) -> bool,
    ) -> StateResult<()> {
        let mut dirty = self.dirty.lock();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((base, range, ext)) = parse_filename(&name.to_string_lossy()) else {
                continue
            };
            if base != self.base || ext != self.ext {
                continue
            }
            if dirty.contains_key(&(range.from_step, range.to_step)) {
                continue
            }
            if !integrity(range) {
                warn!(target: "state", file = %name.to_string_lossy(), "integrity check rejected file");
                continue
            }
            let item = self.open_file(range)?;
            dirty.insert((range.from_step, range.to_step), Arc::new(item));
        }
        Ok(())
    }

    fn open_file(&self, range: StepRange) -> StateResult<FileItem> {
        let data_path = self.data_path(range);
        let accessor_path = self.accessor_path(range);
        let mut segment = Segment::load(&data_path)?;
        if accessor_path.exists() {
            segment.load_accessor(&accessor_path).map_err(|err| {
                StateError::Corrupt(format!("{}: {err}", data_path.display()))
            })?;
        }
        Ok(FileItem::new(
            range,
            self.step_size,
            self.frozen_span,
            segment,
            data_path,
            accessor_path,
        ))
    }

    /// Writes a new segment file plus its accessor from sorted key-value pairs and returns the
    /// still-unintegrated item. Partial outputs are removed on error.
    pub(crate) fn write_file(
        &self,
        range: StepRange,
        pairs: impl IntoIterator<Item = StateResult<(Vec<u8>, Vec<u8>)>>,
        salt: u32,
        with_filter: bool,
        fsync: bool,
        progress: Option<&Progress>,
    ) -> StateResult<Arc<FileItem>> {
        let data_path = self.data_path(range);
        let accessor_path = self.accessor_path(range);

        let result = (|| -> StateResult<Arc<FileItem>> {
            let mut writer =
                Segment::create(&data_path, self.compression.build())?.with_fsync(fsync);
            for pair in pairs {
                let (key, value) = pair?;
                writer.add_pair(&key, &value)?;
                if let Some(progress) = progress {
                    progress.step(1);
                }
            }
            let (segment, offsets) = writer.finish()?;
            segment.build_accessor(&accessor_path, salt, Some(&offsets), with_filter, fsync)?;

            let item = self.open_file(range)?;
            if !item.has_accessor() {
                return Err(StateError::Corrupt(format!(
                    "freshly built accessor failed to load: {}",
                    accessor_path.display()
                )))
            }
            Ok(Arc::new(item))
        })();

        if result.is_err() {
            for path in [&data_path, &accessor_path] {
                let _ = std::fs::remove_file(path);
            }
        }
        result
    }

    /// Builds accessors for dirty files that lack them, replacing the items in place.
    pub(crate) fn missed_accessor_ranges(&self) -> Vec<StepRange> {
        self.dirty
            .lock()
            .values()
            .filter(|item| !item.has_accessor())
            .map(|item| item.range)
            .collect()
    }

    pub(crate) fn build_missed_accessor(
        &self,
        range: StepRange,
        salt: u32,
        with_filter: bool,
        fsync: bool,
    ) -> StateResult<()> {
        let item = self.dirty.lock().get(&(range.from_step, range.to_step)).cloned();
        let Some(item) = item else { return Ok(()) };
        if item.has_accessor() {
            return Ok(())
        }
        item.segment.build_accessor(&item.accessor_path, salt, None, with_filter, fsync)?;
        let reopened = self.open_file(range)?;
        self.dirty
            .lock()
            .insert((range.from_step, range.to_step), Arc::new(reopened));
        Ok(())
    }

    pub(crate) fn integrate(&self, item: Arc<FileItem>) {
        self.dirty.lock().insert((item.range.from_step, item.range.to_step), item);
    }

    /// Recomputes the published visible slice: the maximal gap-free chain of usable files
    /// starting at txNum 0 and ending at or before `to_tx`.
    pub(crate) fn recalc_visible(&self, to_tx: u64) {
        let dirty = self.dirty.lock();
        let visible = calc_visible(&dirty, to_tx);
        drop(dirty);
        *self.visible.write() = Arc::new(visible);
    }

    pub(crate) fn visible(&self) -> Arc<Vec<Arc<FileItem>>> {
        self.visible.read().clone()
    }

    /// End txNum of the published visible chain.
    pub(crate) fn visible_end_tx(&self) -> u64 {
        self.visible.read().last().map(|item| item.end_tx).unwrap_or_default()
    }

    /// First step that has no visible file yet.
    pub(crate) fn first_step_not_in_files(&self) -> u64 {
        self.visible_end_tx() / self.step_size
    }

    /// End txNum of the maximal gap-free dirty chain, regardless of publication.
    pub(crate) fn dirty_end_tx(&self) -> u64 {
        let dirty = self.dirty.lock();
        calc_visible(&dirty, u64::MAX).last().map(|item| item.end_tx).unwrap_or_default()
    }

    /// Looks up a dirty file by its exact range.
    pub(crate) fn dirty_file_by_range(&self, range: StepRange) -> Option<Arc<FileItem>> {
        self.dirty.lock().get(&(range.from_step, range.to_step)).cloned()
    }

    /// Removes files superseded by `merged` from the dirty set and marks them for deletion.
    /// With `restrict_subset_deletions` the files stay on disk and in the dirty set; a later
    /// cleanup pass retires them once the restriction lifts.
    pub(crate) fn clean_after_merge(&self, merged: &FileItem, restrict_subset_deletions: bool) {
        if restrict_subset_deletions {
            return
        }
        let mut dirty = self.dirty.lock();
        let covered: Vec<(u64, u64)> = dirty
            .iter()
            .filter(|(_, item)| {
                merged.range.covers(&item.range) && item.range != merged.range
            })
            .map(|(key, _)| *key)
            .collect();
        for key in covered {
            if let Some(item) = dirty.remove(&key) {
                item.mark_deleted();
            }
        }
    }

    /// Closes every file of the set. Used on shutdown.
    pub(crate) fn close(&self) {
        self.dirty.lock().clear();
        *self.visible.write() = Arc::new(Vec::new());
    }
}

fn largest_power_of_two_divisor(n: u64) -> u64 {
    n & n.wrapping_neg()
}

/// Widest pending merge window over `files` ending at or before `max_end_tx`, following the
/// power-of-two span progression up to `max_span` txNums.
pub(crate) fn find_merge_range_in(
    files: &[Arc<FileItem>],
    step_size: u64,
    max_end_tx: u64,
    max_span: u64,
) -> Option<StepRange> {
    let mut candidate: Option<(u64, u64)> = None;
    for item in files {
        if item.end_tx > max_end_tx {
            continue
        }
        let end_step = item.end_tx / step_size;
        if end_step == 0 {
            continue
        }
        // Merge windows are aligned: a file ending at step N can be part of a window as wide
        // as the largest power of two dividing N.
        let span = (largest_power_of_two_divisor(end_step) * step_size).min(max_span);
        let start = item.end_tx.saturating_sub(span);
        if start < item.start_tx {
            match candidate {
                Some((from, _)) if from <= start => {}
                _ => candidate = Some((start, item.end_tx)),
            }
        }
    }
    candidate.map(|(from, to)| StepRange::new(from / step_size, to / step_size))
}

/// Step range of the newest file in the slice that is itself a product of a merge.
pub(crate) fn latest_merged_range_in(files: &[Arc<FileItem>]) -> Option<StepRange> {
    files.iter().rev().find(|item| item.range.span() > 1).map(|item| item.range)
}

/// Greedy chain selection: starting at txNum 0, repeatedly pick the widest usable file that
/// begins exactly at the current boundary. Guarantees no overlaps and no gaps.
fn calc_visible(dirty: &DirtyFiles, to_tx: u64) -> Vec<Arc<FileItem>> {
    let mut out: Vec<Arc<FileItem>> = Vec::new();
    let mut next_tx = 0u64;
    loop {
        let mut best: Option<&Arc<FileItem>> = None;
        for item in dirty.values() {
            if item.start_tx != next_tx ||
                item.end_tx > to_tx ||
                !item.has_accessor() ||
                item.can_delete.load(Ordering::Acquire)
            {
                continue
            }
            if best.map(|b| b.end_tx < item.end_tx).unwrap_or(true) {
                best = Some(item);
            }
        }
        match best {
            Some(item) => {
                next_tx = item.end_tx;
                out.push(item.clone());
            }
            None => break,
        }
    }
    out
}

/// Parses `v1-<base>.<from>-<to>.<ext>`.
pub(crate) fn parse_filename(name: &str) -> Option<(String, StepRange, String)> {
    let rest = name.strip_prefix("v1-")?;
    let mut parts = rest.split('.');
    let base = parts.next()?;
    let range = parts.next()?;
    let ext = parts.next()?;
    if parts.next().is_some() {
        return None
    }
    let (from, to) = range.split_once('-')?;
    let range = StepRange::new(from.parse().ok()?, to.parse().ok()?);
    (range.from_step < range.to_step).then(|| (base.to_string(), range, ext.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_roundtrip() {
        let (base, range, ext) = parse_filename("v1-accounts.0-32.kv").unwrap();
        assert_eq!(base, "accounts");
        assert_eq!(range, StepRange::new(0, 32));
        assert_eq!(ext, "kv");

        assert!(parse_filename("accounts.0-1.kv").is_none());
        assert!(parse_filename("v1-accounts.1-1.kv").is_none());
        assert!(parse_filename("v1-accounts.0-1.kv.tmp").is_none());
    }

    #[test]
    fn merge_window_follows_power_of_two_alignment() {
        assert_eq!(largest_power_of_two_divisor(1), 1);
        assert_eq!(largest_power_of_two_divisor(2), 2);
        assert_eq!(largest_power_of_two_divisor(6), 2);
        assert_eq!(largest_power_of_two_divisor(8), 8);
        assert_eq!(largest_power_of_two_divisor(12), 4);
    }

    #[test]
    fn step_range_tx_bounds() {
        let range = StepRange::new(2, 4);
        assert_eq!(range.tx_from(100), 200);
        assert_eq!(range.tx_to(100), 400);
        assert_eq!(range.span(), 2);
        assert!(StepRange::new(0, 4).covers(&range));
        assert!(!range.covers(&StepRange::new(0, 4)));
    }
}
