//! Immutable word-oriented data store format.
//!
//! A segment is an ordered, optionally compressed sequence of variable-length words, written
//! once and then only read through a memory map. Words are length-prefixed inside the data
//! file, so the file supports sequential scans on its own; O(1) keyed retrieval goes through a
//! separate [`Accessor`] sidecar holding the offset list, a salted perfect-hash function over
//! the even-indexed (key) words and an optional inclusion filter. The sidecar can always be
//! rebuilt from the data file.

#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufWriter, Seek, SeekFrom, Write},
    ops::Range,
    path::{Path, PathBuf},
};
use sucds::int_vectors::PrefixSummedEliasFano;
use tracing::*;

pub mod filter;
use filter::{Cuckoo, InclusionFilter, InclusionFilters};

pub mod compression;
pub use compression::{Compression, Compressors, Lz4, Zstd};

mod phf;
pub use phf::Fmph;

mod accessor;
pub use accessor::Accessor;

mod error;
pub use error::SegmentError;

const SEGMENT_VERSION: u16 = 1;

/// On-disk configuration of a segment, serialized at the head of the data file.
#[derive(Debug, Serialize, Deserialize)]
struct SegmentMeta {
    version: u16,
    word_count: u64,
    compressor: Option<Compressors>,
}

/// An immutable sequence of words with optional keyed retrieval.
///
/// Key-value segments store pairs as consecutive words: the word at `2 * row` is the key, the
/// word at `2 * row + 1` its value. [`Segment::lookup`] resolves a key through the accessor and
/// verifies the keyed word before returning, since both the filter and the perfect hash may
/// produce false positives for keys outside the stored set.
pub struct Segment {
    word_count: u64,
    compressor: Option<Compressors>,
    /// Maximum uncompressed word size, used to pre-size decompression buffers.
    max_word_size: u64,
    /// Offset of the first word inside the data file.
    words_start: u64,
    path: PathBuf,
    data: DataReader,
    accessor: Option<Accessor>,
}

impl Segment {
    /// Starts a new segment at `path`. The compressor must be ready (dictionary trained, if
    /// one is in use) before any word is written.
    pub fn create(
        path: impl AsRef<Path>,
        compressor: Option<Compressors>,
    ) -> Result<SegmentWriter, SegmentError> {
        if let Some(compression) = &compressor {
            if !compression.is_ready() {
                return Err(SegmentError::CompressorNotReady)
            }
        }
        SegmentWriter::new(path.as_ref().to_path_buf(), compressor)
    }

    /// Loads the segment configuration and maps the data file. The accessor sidecar is loaded
    /// separately via [`Self::load_accessor`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SegmentError::MissingFile(path.to_path_buf()))
        }
        let data = DataReader::new(path)?;
        if data.size() < 8 {
            return Err(SegmentError::InconsistentState)
        }
        let max_word_size =
            u64::from_le_bytes(data.data(0..8).try_into().expect("slice of checked length"));
        let meta: SegmentMeta = bincode::deserialize(data.data(8..data.size()))?;
        let words_start = 8 + bincode::serialized_size(&meta)?;

        Ok(Self {
            word_count: meta.word_count,
            compressor: meta.compressor,
            max_word_size,
            words_start,
            path: path.to_path_buf(),
            data,
            accessor: None,
        })
    }

    /// Loads the accessor sidecar and cross-checks it against the data file.
    pub fn load_accessor(&mut self, path: impl AsRef<Path>) -> Result<(), SegmentError> {
        let accessor = Accessor::load(path)?;
        if accessor.word_count() != self.word_count {
            return Err(SegmentError::AccessorMismatch(format!(
                "word count {} != {} for {}",
                accessor.word_count(),
                self.word_count,
                self.path.display(),
            )))
        }
        self.accessor = Some(accessor);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of words in the segment.
    pub const fn count(&self) -> u64 {
        self.word_count
    }

    /// Number of key-value pairs in the segment.
    pub const fn pairs(&self) -> u64 {
        self.word_count / 2
    }

    pub const fn accessor(&self) -> Option<&Accessor> {
        self.accessor.as_ref()
    }

    pub const fn compressor(&self) -> Option<&Compressors> {
        self.compressor.as_ref()
    }

    /// Advises the kernel that mapped reads will follow a normal access pattern.
    pub fn advise_normal(&self) -> Result<(), SegmentError> {
        self.data.advise_normal()
    }

    /// Advises the kernel that mapped reads will be random, disabling readahead.
    pub fn advise_random(&self) -> Result<(), SegmentError> {
        self.data.advise_random()
    }

    /// Sequential cursor over all words.
    pub fn cursor(&self) -> SegmentCursor<'_> {
        SegmentCursor { segment: self, word: 0, pos: self.words_start as usize }
    }

    /// Random-access read of the word at `index`. Requires the accessor.
    pub fn word_at(&self, index: u64) -> Result<Vec<u8>, SegmentError> {
        let accessor = self.accessor.as_ref().ok_or(SegmentError::AccessorMissing)?;
        let offset = accessor.offset(index)? as usize;
        let (word, _) = self.word_at_offset(offset)?;
        Ok(word)
    }

    /// Returns the key-value pair stored at `row`.
    pub fn pair_at(&self, row: u64) -> Result<(Vec<u8>, Vec<u8>), SegmentError> {
        Ok((self.word_at(row * 2)?, self.word_at(row * 2 + 1)?))
    }

    /// Keyed value retrieval. Returns `None` for keys outside the stored set.
    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SegmentError> {
        match self.lookup_row(key)? {
            Some(row) => Ok(Some(self.word_at(row * 2 + 1)?)),
            None => Ok(None),
        }
    }

    /// Resolves a key to its pair row, verifying the keyed word to rule out false positives.
    pub fn lookup_row(&self, key: &[u8]) -> Result<Option<u64>, SegmentError> {
        let accessor = self.accessor.as_ref().ok_or(SegmentError::AccessorMissing)?;
        let Some(row) = accessor.row_for(key)? else { return Ok(None) };
        if row >= self.pairs() {
            return Ok(None)
        }
        if self.word_at(row * 2)? != key {
            return Ok(None)
        }
        Ok(Some(row))
    }

    /// Builds the accessor sidecar at `path`.
    ///
    /// `offsets` can be passed through from [`SegmentWriter::finish`] to skip the rescan; when
    /// absent (rebuilding a lost sidecar) the data file is scanned for word boundaries.
    pub fn build_accessor(
        &self,
        path: impl AsRef<Path>,
        salt: u32,
        offsets: Option<&[u64]>,
        with_filter: bool,
        fsync: bool,
    ) -> Result<(), SegmentError> {
        let path = path.as_ref();
        if self.word_count % 2 != 0 {
            return Err(SegmentError::OddWordCount(self.word_count))
        }
        debug!(target: "segment", data = ?self.path, accessor = ?path, pairs = self.pairs(), "Building accessor.");

        let offsets = match offsets {
            Some(offsets) => offsets.to_vec(),
            None => self.scan_offsets()?,
        };
        if offsets.len() as u64 != self.word_count + 1 {
            return Err(SegmentError::AccessorMismatch(format!(
                "scanned {} offsets, expected {}",
                offsets.len(),
                self.word_count + 1,
            )))
        }

        let mut keys = Vec::with_capacity(self.pairs() as usize);
        for (index, word) in self.cursor().enumerate() {
            let word = word?;
            if index % 2 == 0 {
                keys.push(word);
            }
        }

        let mut phf = Fmph::new(salt);
        let mut offsets_index = vec![0u64; keys.len()];
        let mut filter =
            with_filter.then(|| InclusionFilters::Cuckoo(Cuckoo::new(keys.len().max(16))));
        if !keys.is_empty() {
            phf.set_keys(&keys)?;
            for (row, key) in keys.iter().enumerate() {
                if let Some(filter) = filter.as_mut() {
                    filter.add(key)?;
                }
                let index = phf.get_index(key)?.expect("initialized") as usize;
                let _ = std::mem::replace(&mut offsets_index[index], row as u64);
            }
        }
        // Elias-Fano rejects empty inputs; an empty segment gets a one-entry dummy index that
        // is never consulted because the hash function maps everything to `None`.
        let offsets_index = if offsets_index.is_empty() {
            PrefixSummedEliasFano::from_slice(&[0u64])?
        } else {
            PrefixSummedEliasFano::from_slice(&offsets_index)?
        };
        if let Some(InclusionFilters::Cuckoo(cuckoo)) = filter.as_mut() {
            cuckoo.freeze();
        }

        accessor::write_accessor(path, &offsets, &offsets_index, &Some(phf), &filter, fsync)
    }

    /// Scans the data file for word boundaries using the length prefixes.
    fn scan_offsets(&self) -> Result<Vec<u64>, SegmentError> {
        let mut offsets = Vec::with_capacity(self.word_count as usize + 1);
        let mut pos = self.words_start as usize;
        for index in 0..self.word_count {
            offsets.push(pos as u64);
            if pos + 4 > self.data.size() {
                return Err(SegmentError::WordOutOfBounds { index })
            }
            let len =
                u32::from_le_bytes(self.data.data(pos..pos + 4).try_into().expect("checked len"))
                    as usize;
            pos += 4 + len;
        }
        if pos > self.data.size() {
            return Err(SegmentError::InconsistentState)
        }
        offsets.push(pos as u64);
        Ok(offsets)
    }

    /// Reads the length-prefixed word at `offset`, returning it decompressed together with the
    /// offset just past it.
    fn word_at_offset(&self, offset: usize) -> Result<(Vec<u8>, usize), SegmentError> {
        if offset + 4 > self.data.size() {
            return Err(SegmentError::InconsistentState)
        }
        let len =
            u32::from_le_bytes(self.data.data(offset..offset + 4).try_into().expect("checked len"))
                as usize;
        let end = offset + 4 + len;
        if end > self.data.size() {
            return Err(SegmentError::InconsistentState)
        }
        let raw = self.data.data(offset + 4..end);
        let word = match &self.compressor {
            Some(compression) => {
                let mut out = Vec::with_capacity(self.max_word_size as usize);
                compression.decompress_to(raw, &mut out)?;
                out
            }
            None => raw.to_vec(),
        };
        Ok((word, end))
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("word_count", &self.word_count)
            .field("compressor", &self.compressor)
            .field("max_word_size", &self.max_word_size)
            .field("accessor", &self.accessor)
            .finish_non_exhaustive()
    }
}

/// Sequential word cursor over a [`Segment`]. Does not require the accessor.
#[derive(Debug)]
pub struct SegmentCursor<'a> {
    segment: &'a Segment,
    word: u64,
    pos: usize,
}

impl SegmentCursor<'_> {
    /// Returns the next word together with the data-file offset of its length prefix.
    pub fn next_with_offset(&mut self) -> Option<Result<(u64, Vec<u8>), SegmentError>> {
        if self.word >= self.segment.word_count {
            return None
        }
        let offset = self.pos as u64;
        match self.segment.word_at_offset(self.pos) {
            Ok((word, end)) => {
                self.pos = end;
                self.word += 1;
                Some(Ok((offset, word)))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

impl Iterator for SegmentCursor<'_> {
    type Item = Result<Vec<u8>, SegmentError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_with_offset().map(|res| res.map(|(_, word)| word))
    }
}

/// Incremental writer producing a segment data file.
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,
    meta: SegmentMeta,
    file: BufWriter<File>,
    offsets: Vec<u64>,
    pos: u64,
    max_word_size: u64,
    tmp_buf: Vec<u8>,
    fsync: bool,
}

impl SegmentWriter {
    fn new(path: PathBuf, compressor: Option<Compressors>) -> Result<Self, SegmentError> {
        let meta = SegmentMeta { version: SEGMENT_VERSION, word_count: 0, compressor };
        let mut file = BufWriter::new(File::create(&path)?);

        // Placeholder for max_word_size; both it and the meta block are patched in `finish`.
        // Bincode's fixed-width integers keep the meta size stable across the patch.
        file.write_all(&[0; 8])?;
        bincode::serialize_into(&mut file, &meta)?;
        let pos = 8 + bincode::serialized_size(&meta)?;

        Ok(Self {
            path,
            meta,
            file,
            offsets: Vec::new(),
            pos,
            max_word_size: 0,
            tmp_buf: Vec::with_capacity(1_000_000),
            fsync: true,
        })
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub const fn word_count(&self) -> u64 {
        self.meta.word_count
    }

    /// Appends one word.
    pub fn add_word(&mut self, word: &[u8]) -> Result<(), SegmentError> {
        self.offsets.push(self.pos);
        self.max_word_size = self.max_word_size.max(word.len() as u64);

        let stored: &[u8] = match &self.meta.compressor {
            Some(compression) => {
                self.tmp_buf.clear();
                compression.compress_to(word, &mut self.tmp_buf)?;
                &self.tmp_buf
            }
            None => word,
        };
        self.file.write_all(&(stored.len() as u32).to_le_bytes())?;
        self.file.write_all(stored)?;
        self.pos += 4 + stored.len() as u64;
        self.meta.word_count += 1;
        Ok(())
    }

    /// Appends a key-value pair as two consecutive words.
    pub fn add_pair(&mut self, key: &[u8], value: &[u8]) -> Result<(), SegmentError> {
        self.add_word(key)?;
        self.add_word(value)
    }

    /// Patches the header, syncs the file and reopens it for reading. Also returns the word
    /// offset list so an accessor can be built without rescanning.
    pub fn finish(mut self) -> Result<(Segment, Vec<u64>), SegmentError> {
        self.offsets.push(self.pos);
        self.file.flush()?;

        let mut file = self.file.into_inner().map_err(|err| err.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.max_word_size.to_le_bytes())?;
        let meta_buf = bincode::serialize(&self.meta)?;
        file.write_all(&meta_buf)?;
        if self.fsync {
            file.sync_all()?;
        }
        drop(file);

        debug!(target: "segment", path = ?self.path, words = self.meta.word_count, "Finished segment.");
        Ok((Segment::load(&self.path)?, self.offsets))
    }
}

/// Manages reading of the data file using a memory map.
///
/// Holds the file descriptor alive as long as the respective mmap handle.
#[derive(Debug)]
pub struct DataReader {
    #[allow(unused)]
    data_file: File,
    data_mmap: Mmap,
}

impl DataReader {
    /// Maps the file at the provided path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SegmentError> {
        let data_file = File::open(path.as_ref())?;
        // SAFETY: File is read-only and its descriptor is kept alive as long as the mmap handle.
        let data_mmap = unsafe { Mmap::map(&data_file)? };
        Ok(Self { data_file, data_mmap })
    }

    /// Provides the underlying data as a slice on the provided offset range.
    pub fn data(&self, range: Range<usize>) -> &[u8] {
        &self.data_mmap[range]
    }

    /// Returns total size of the data file.
    pub fn size(&self) -> usize {
        self.data_mmap.len()
    }

    pub fn advise_normal(&self) -> Result<(), SegmentError> {
        #[cfg(unix)]
        self.data_mmap.advise(memmap2::Advice::Normal)?;
        Ok(())
    }

    pub fn advise_random(&self) -> Result<(), SegmentError> {
        #[cfg(unix)]
        self.data_mmap.advise(memmap2::Advice::Random)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, RngCore, SeedableRng};

    fn test_pairs(seed: u64, rows: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..rows)
            .map(|_| {
                let mut key = vec![0; 32];
                let mut value = vec![0; 40];
                rng.fill_bytes(&mut key);
                rng.fill_bytes(&mut value);
                (key, value)
            })
            .collect()
    }

    fn write_segment(
        path: &Path,
        pairs: &[(Vec<u8>, Vec<u8>)],
        compressor: Option<Compressors>,
    ) -> (Segment, Vec<u64>) {
        let mut writer = Segment::create(path, compressor).unwrap();
        for (key, value) in pairs {
            writer.add_pair(key, value).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn sequential_scan_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.kv");
        let pairs = test_pairs(1, 100);

        let (segment, _) = write_segment(&path, &pairs, None);
        assert_eq!(segment.count(), 200);
        assert_eq!(segment.pairs(), 100);

        let words: Vec<_> = segment.cursor().map(|w| w.unwrap()).collect();
        for (row, (key, value)) in pairs.iter().enumerate() {
            assert_eq!(&words[row * 2], key);
            assert_eq!(&words[row * 2 + 1], value);
        }
    }

    #[test]
    fn keyed_lookup_with_accessor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyed.kv");
        let accessor_path = dir.path().join("keyed.kvi");
        let pairs = test_pairs(2, 128);

        let (segment, offsets) = write_segment(&path, &pairs, None);
        segment.build_accessor(&accessor_path, 7, Some(&offsets), true, true).unwrap();

        let mut segment = Segment::load(&path).unwrap();
        segment.load_accessor(&accessor_path).unwrap();
        assert_eq!(segment.accessor().unwrap().salt(), Some(7));

        for (key, value) in &pairs {
            assert_eq!(segment.lookup(key).unwrap().as_deref(), Some(value.as_slice()));
        }
        // Keys outside the set must be ruled out by key verification.
        assert_eq!(segment.lookup(b"not a stored key").unwrap(), None);
    }

    #[test]
    fn accessor_rebuild_matches_original() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebuild.kv");
        let accessor_path = dir.path().join("rebuild.kvi");
        let pairs = test_pairs(3, 64);

        let (segment, _) = write_segment(&path, &pairs, None);
        // No offsets passed: forces the data-file rescan used when the sidecar was lost.
        segment.build_accessor(&accessor_path, 11, None, false, false).unwrap();

        let mut segment = Segment::load(&path).unwrap();
        segment.load_accessor(&accessor_path).unwrap();
        for (row, (key, value)) in pairs.iter().enumerate() {
            assert_eq!(segment.lookup_row(key).unwrap(), Some(row as u64));
            assert_eq!(segment.pair_at(row as u64).unwrap().1, *value);
        }
    }

    #[test]
    fn zstd_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zstd.kv");
        let pairs = test_pairs(4, 50);

        let (segment, _) =
            write_segment(&path, &pairs, Some(Compressors::Zstd(Zstd::new(false, 5000))));
        let words: Vec<_> = segment.cursor().map(|w| w.unwrap()).collect();
        assert_eq!(words.len(), 100);
        assert_eq!(words[0], pairs[0].0);
        assert_eq!(words[99], pairs[49].1);
    }

    #[test]
    fn zstd_with_dictionary_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.kv");
        let pairs = test_pairs(5, 200);
        let words: Vec<Vec<u8>> =
            pairs.iter().flat_map(|(k, v)| [k.clone(), v.clone()]).collect();

        let mut zstd = Zstd::new(true, 5000);
        // Writing before the dictionary is trained must fail.
        assert!(matches!(
            Segment::create(&path, Some(Compressors::Zstd(Zstd::new(true, 5000)))),
            Err(SegmentError::CompressorNotReady)
        ));
        zstd.prepare_compression(words.clone()).unwrap();

        let (segment, _) = write_segment(&path, &pairs, Some(Compressors::Zstd(zstd)));
        let read: Vec<_> = segment.cursor().map(|w| w.unwrap()).collect();
        assert_eq!(read, words);
    }

    #[test]
    fn lz4_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lz4.kv");
        let pairs = test_pairs(6, 50);

        let (segment, _) = write_segment(&path, &pairs, Some(Compressors::Lz4(Lz4)));
        let words: Vec<_> = segment.cursor().map(|w| w.unwrap()).collect();
        assert_eq!(words[1], pairs[0].1);
        assert_eq!(words.len(), 100);
    }

    #[test]
    fn accessor_word_count_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.kv");
        let path_b = dir.path().join("b.kv");
        let accessor_path = dir.path().join("a.kvi");

        let (segment_a, offsets) = write_segment(&path_a, &test_pairs(7, 10), None);
        segment_a.build_accessor(&accessor_path, 1, Some(&offsets), false, false).unwrap();

        let (_, _) = write_segment(&path_b, &test_pairs(7, 11), None);
        let mut segment_b = Segment::load(&path_b).unwrap();
        assert!(matches!(
            segment_b.load_accessor(&accessor_path),
            Err(SegmentError::AccessorMismatch(_))
        ));
    }

    #[test]
    fn empty_values_are_stored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.kv");
        let accessor_path = dir.path().join("empty.kvi");
        let pairs = vec![(b"gone".to_vec(), Vec::new()), (b"there".to_vec(), b"v".to_vec())];

        let (segment, offsets) = write_segment(&path, &pairs, None);
        segment.build_accessor(&accessor_path, 0, Some(&offsets), false, false).unwrap();
        let mut segment = Segment::load(&path).unwrap();
        segment.load_accessor(&accessor_path).unwrap();

        assert_eq!(segment.lookup(b"gone").unwrap(), Some(Vec::new()));
        assert_eq!(segment.lookup(b"there").unwrap(), Some(b"v".to_vec()));
    }
}
