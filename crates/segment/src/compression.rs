use crate::SegmentError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::*;
use zstd::bulk::Compressor;

type RawDictionary = Vec<u8>;

/// Trait that will compress words of a segment.
pub trait Compression: Serialize + for<'a> Deserialize<'a> {
    /// Appends decompressed data to the dest buffer. Requires `dest` to have sufficient capacity.
    fn decompress_to(&self, value: &[u8], dest: &mut Vec<u8>) -> Result<(), SegmentError>;

    /// Returns decompressed data.
    fn decompress(&self, value: &[u8]) -> Result<Vec<u8>, SegmentError>;

    /// Appends compressed data from `src` to `dest`. `dest`. Returns number of bytes written.
    fn compress_to(&self, src: &[u8], dest: &mut Vec<u8>) -> Result<usize, SegmentError>;

    /// Compresses data from `src`.
    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, SegmentError>;

    /// Returns `true` if it's ready to compress.
    fn is_ready(&self) -> bool {
        true
    }

    /// If required, prepares compression algorithm with an early pass on the data.
    fn prepare_compression(&mut self, _words: Vec<Vec<u8>>) -> Result<(), SegmentError> {
        Ok(())
    }
}

/// Enum with different [`Compression`] types.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum Compressors {
    /// Zstandard compression, optionally with a trained dictionary.
    Zstd(Zstd),
    /// LZ4 compression.
    Lz4(Lz4),
}

impl Compression for Compressors {
    fn decompress_to(&self, value: &[u8], dest: &mut Vec<u8>) -> Result<(), SegmentError> {
        match self {
            Self::Zstd(zstd) => zstd.decompress_to(value, dest),
            Self::Lz4(lz4) => lz4.decompress_to(value, dest),
        }
    }

    fn decompress(&self, value: &[u8]) -> Result<Vec<u8>, SegmentError> {
        match self {
            Self::Zstd(zstd) => zstd.decompress(value),
            Self::Lz4(lz4) => lz4.decompress(value),
        }
    }

    fn compress_to(&self, src: &[u8], dest: &mut Vec<u8>) -> Result<usize, SegmentError> {
        match self {
            Self::Zstd(zstd) => zstd.compress_to(src, dest),
            Self::Lz4(lz4) => lz4.compress_to(src, dest),
        }
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, SegmentError> {
        match self {
            Self::Zstd(zstd) => zstd.compress(src),
            Self::Lz4(lz4) => lz4.compress(src),
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            Self::Zstd(zstd) => zstd.is_ready(),
            Self::Lz4(lz4) => lz4.is_ready(),
        }
    }

    fn prepare_compression(&mut self, words: Vec<Vec<u8>>) -> Result<(), SegmentError> {
        match self {
            Self::Zstd(zstd) => zstd.prepare_compression(words),
            Self::Lz4(lz4) => lz4.prepare_compression(words),
        }
    }
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum ZstdState {
    #[default]
    PendingDictionary,
    Ready,
}

/// Zstd compression structure. Supports an optional dictionary trained over the word set.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Zstd {
    /// State. Should be ready before compressing.
    pub(crate) state: ZstdState,
    /// Compression level. A level of `0` uses zstd's default (currently `3`).
    pub(crate) level: i32,
    /// Uses a custom dictionary to compress data.
    pub use_dict: bool,
    /// Max size of the dictionary.
    pub(crate) max_dict_size: usize,
    /// Trained dictionary, if any.
    pub(crate) raw_dictionary: Option<RawDictionary>,
}

impl Zstd {
    /// Creates new [`Zstd`].
    pub fn new(use_dict: bool, max_dict_size: usize) -> Self {
        Self {
            state: if use_dict { ZstdState::PendingDictionary } else { ZstdState::Ready },
            level: 0,
            use_dict,
            max_dict_size,
            raw_dictionary: None,
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    fn compressor(&self) -> Result<Option<Compressor<'_>>, SegmentError> {
        match self.state {
            ZstdState::PendingDictionary => Err(SegmentError::CompressorNotReady),
            ZstdState::Ready => match &self.raw_dictionary {
                Some(dict) => Ok(Some(Compressor::with_dictionary(self.level, dict)?)),
                None => Ok(None),
            },
        }
    }
}

impl Compression for Zstd {
    fn decompress_to(&self, value: &[u8], dest: &mut Vec<u8>) -> Result<(), SegmentError> {
        let dict = self.raw_dictionary.as_deref().unwrap_or(&[]);
        let mut decoder = zstd::Decoder::with_dictionary(value, dict)?;
        decoder.read_to_end(dest)?;
        Ok(())
    }

    fn decompress(&self, value: &[u8]) -> Result<Vec<u8>, SegmentError> {
        let mut decompressed = Vec::with_capacity(value.len() * 2);
        self.decompress_to(value, &mut decompressed)?;
        Ok(decompressed)
    }

    fn compress_to(&self, src: &[u8], dest: &mut Vec<u8>) -> Result<usize, SegmentError> {
        let before = dest.len();

        match self.compressor()? {
            Some(mut compressor) => {
                // Compressor requires the destination buffer to be big enough to write into,
                // otherwise it fails. However, we don't know how big it will be. If data is
                // small enough, the compressed buffer will actually be larger. We keep
                // retrying. If we eventually fail, it probably means it's another kind of
                // error.
                let mut multiplier = 1;
                while let Err(err) = compressor.compress_to_buffer(src, dest) {
                    dest.reserve(src.len().max(64) * multiplier);
                    multiplier += 1;
                    if multiplier == 5 {
                        return Err(SegmentError::Disconnect(err))
                    }
                }
            }
            None => {
                let mut encoder = zstd::Encoder::new(&mut *dest, self.level)?;
                encoder.write_all(src)?;
                encoder.finish()?;
            }
        }

        Ok(dest.len() - before)
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, SegmentError> {
        let mut compressed = Vec::with_capacity(src.len());
        self.compress_to(src, &mut compressed)?;
        Ok(compressed)
    }

    fn is_ready(&self) -> bool {
        matches!(self.state, ZstdState::Ready)
    }

    /// If a dictionary is in use, trains it over the word set.
    fn prepare_compression(&mut self, words: Vec<Vec<u8>>) -> Result<(), SegmentError> {
        if !self.use_dict {
            return Ok(())
        }

        // There's a per 2GB hard limit on the data set for training.
        // REFERENCE: https://github.com/facebook/zstd/blob/dev/programs/zstd.1.md#dictionary-builder
        debug!(target: "segment", count = words.len(), "Training zstd dictionary.");

        // ZSTD requires all training data to be continuous in memory, alongside the size of
        // each entry
        let mut sizes = Vec::with_capacity(words.len());
        let data: Vec<_> = words
            .into_iter()
            .flat_map(|word| {
                sizes.push(word.len());
                word
            })
            .collect();

        self.raw_dictionary = Some(zstd::dict::from_continuous(&data, &sizes, self.max_dict_size)?);
        self.state = ZstdState::Ready;

        Ok(())
    }
}

/// LZ4 compression. Words are framed with their decompressed size.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Lz4;

impl Compression for Lz4 {
    fn decompress_to(&self, value: &[u8], dest: &mut Vec<u8>) -> Result<(), SegmentError> {
        let decompressed = self.decompress(value)?;
        dest.extend_from_slice(&decompressed);
        Ok(())
    }

    fn decompress(&self, value: &[u8]) -> Result<Vec<u8>, SegmentError> {
        lz4_flex::decompress_size_prepended(value)
            .map_err(|err| SegmentError::Custom(err.to_string()))
    }

    fn compress_to(&self, src: &[u8], dest: &mut Vec<u8>) -> Result<usize, SegmentError> {
        let compressed = self.compress(src)?;
        dest.extend_from_slice(&compressed);
        Ok(compressed.len())
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, SegmentError> {
        Ok(lz4_flex::compress_prepend_size(src))
    }
}
