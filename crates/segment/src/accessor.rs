use crate::{filter::InclusionFilter, Fmph, InclusionFilters, SegmentError};
use memmap2::Mmap;
use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};
use sucds::{
    int_vectors::{Access, PrefixSummedEliasFano},
    Serializable,
};
use tracing::*;

/// Sidecar of a segment data file enabling O(1) keyed retrieval.
///
/// Stores the word offset list, the Elias-Fano index mapping perfect-hash outputs to pair rows,
/// the salted [`Fmph`] itself and an optional inclusion filter. The whole sidecar can be rebuilt
/// from the data file alone.
pub struct Accessor {
    /// File descriptor kept alive as long as the mmap handle.
    #[allow(unused)]
    file: File,
    mmap: Mmap,
    path: PathBuf,
    /// Number of bytes that represents one offset.
    offset_len: usize,
    word_count: u64,
    /// Start of the offset list inside the mmap.
    offsets_start: usize,
    /// Index mapping PHF output to pair rows.
    offsets_index: PrefixSummedEliasFano,
    phf: Option<Fmph>,
    filter: Option<InclusionFilters>,
}

impl Accessor {
    /// Loads the accessor sidecar, restoring the queryable filter state.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SegmentError::MissingFile(path.to_path_buf()))
        }
        let file = File::open(path)?;
        // SAFETY: File is read-only and its descriptor is kept alive as long as the mmap handle.
        let mmap = unsafe { Mmap::map(&file)? };
        let buf = mmap.as_ref();
        if buf.len() < 9 {
            return Err(SegmentError::InconsistentState)
        }

        let offset_len = buf[0] as usize;
        if offset_len > 8 {
            return Err(SegmentError::OffsetSizeTooBig { offset_size: offset_len as u8 })
        }
        if offset_len == 0 {
            return Err(SegmentError::OffsetSizeTooSmall { offset_size: 0 })
        }
        let word_count = u64::from_le_bytes(buf[1..9].try_into().expect("checked length"));

        let offsets_start = 9;
        let offsets_end = offsets_start + (word_count as usize + 1) * offset_len;
        if buf.len() < offsets_end {
            return Err(SegmentError::InconsistentState)
        }

        let mut tail = &buf[offsets_end..];
        let offsets_index = PrefixSummedEliasFano::deserialize_from(&mut tail)?;
        let phf: Option<Fmph> = bincode::deserialize_from(&mut tail)?;
        let mut filter: Option<InclusionFilters> = bincode::deserialize_from(&mut tail)?;
        if let Some(InclusionFilters::Cuckoo(cuckoo)) = filter.as_mut() {
            cuckoo.was_loaded();
        }

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            offset_len,
            word_count,
            offsets_start,
            offsets_index,
            phf,
            filter,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub const fn word_count(&self) -> u64 {
        self.word_count
    }

    pub fn salt(&self) -> Option<u32> {
        self.phf.as_ref().map(|phf| phf.salt())
    }

    /// Returns the data-file offset of the requested word.
    pub fn offset(&self, word: u64) -> Result<u64, SegmentError> {
        if word > self.word_count {
            return Err(SegmentError::WordOutOfBounds { index: word })
        }
        let mut buffer: [u8; 8] = [0; 8];
        let from = self.offsets_start + word as usize * self.offset_len;
        buffer[..self.offset_len].copy_from_slice(&self.mmap[from..from + self.offset_len]);
        Ok(u64::from_le_bytes(buffer))
    }

    /// Returns the pair row a key hashes to, or `None` when the filter or the hash index rule
    /// the key out. A returned row still requires key verification by the caller.
    pub fn row_for(&self, key: &[u8]) -> Result<Option<u64>, SegmentError> {
        if let Some(filter) = &self.filter {
            if !filter.contains(key)? {
                return Ok(None)
            }
        }
        let phf = self.phf.as_ref().ok_or(SegmentError::AccessorMissing)?;
        let Some(hash) = phf.get_index(key)? else { return Ok(None) };
        match self.offsets_index.access(hash as usize) {
            Some(row) => Ok(Some(row as u64)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Accessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accessor")
            .field("path", &self.path)
            .field("word_count", &self.word_count)
            .field("offset_len", &self.offset_len)
            .field("offsets_index (size in bytes)", &self.offsets_index.size_in_bytes())
            .field("phf", &self.phf)
            .field("filter", &self.filter)
            .finish()
    }
}

/// Writes an accessor sidecar to `path`.
pub(crate) fn write_accessor(
    path: &Path,
    offsets: &[u64],
    offsets_index: &PrefixSummedEliasFano,
    phf: &Option<Fmph>,
    filter: &Option<InclusionFilters>,
    fsync: bool,
) -> Result<(), SegmentError> {
    debug_assert!(!offsets.is_empty(), "offset list carries at least the end offset");
    let word_count = offsets.len() as u64 - 1;
    let max_offset = offsets.last().copied().unwrap_or_default();
    let offset_len = (8 - (max_offset.leading_zeros() / 8) as usize).max(1);

    debug!(target: "segment", ?path, word_count, offset_len, "Writing accessor.");

    let mut file = File::create(path)?;
    file.write_all(&[offset_len as u8])?;
    file.write_all(&word_count.to_le_bytes())?;
    for offset in offsets {
        file.write_all(&offset.to_le_bytes()[..offset_len])?;
    }
    offsets_index.serialize_into(&mut file)?;
    bincode::serialize_into(&mut file, phf)?;
    bincode::serialize_into(&mut file, filter)?;

    if fsync {
        file.sync_all()?;
    }
    Ok(())
}
