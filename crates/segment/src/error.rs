use std::path::PathBuf;
use thiserror::Error;

/// Errors associated with [`crate::Segment`].
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error(transparent)]
    Disconnect(#[from] std::io::Error),
    #[error("{0}")]
    Custom(String),
    #[error(transparent)]
    Bincode(#[from] Box<bincode::ErrorKind>),
    #[error(transparent)]
    EliasFano(#[from] anyhow::Error),
    #[error("compression was enabled, but it's not ready yet")]
    CompressorNotReady,
    #[error("the size of an offset must be at most 8 bytes, got {offset_size}")]
    OffsetSizeTooBig {
        /// The read offset size in number of bytes.
        offset_size: u8,
    },
    #[error("the size of an offset must be at least 1 byte, got {offset_size}")]
    OffsetSizeTooSmall {
        /// The read offset size in number of bytes.
        offset_size: u8,
    },
    #[error("attempted to read an out of bounds word: {index}")]
    WordOutOfBounds {
        /// The index of the word that was being read.
        index: u64,
    },
    #[error("filter has reached max capacity")]
    FilterMaxCapacity,
    #[error("cuckoo was not loaded from disk")]
    FilterCuckooNotLoaded,
    #[error("segment has no accessor sidecar loaded")]
    AccessorMissing,
    #[error("accessor disagrees with data file: {0}")]
    AccessorMismatch(String),
    #[error("a key-value segment requires an even word count, got {0}")]
    OddWordCount(u64),
    #[error("file is in an inconsistent state.")]
    InconsistentState,
    #[error("missing file: {0}.")]
    MissingFile(PathBuf),
}
