use sediment_kv::DatabaseError;
use sediment_segment::SegmentError;
use thiserror::Error;

/// Result alias for state engine operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors surfaced by the state engine.
///
/// Absence (a missed `get_as_of`, an empty range) is not an error and is expressed as `Option`
/// or an empty stream by the respective APIs.
#[derive(Error, Debug)]
pub enum StateError {
    /// Context cancelled or engine shut down. Background jobs propagate this silently.
    #[error("operation cancelled")]
    Cancelled,
    /// A file or its accessor disagrees with what the engine expects. Fatal for the entity.
    #[error("corrupt: {0}")]
    Corrupt(String),
    /// Disk or filesystem failure. Partial outputs are cleaned by the failing phase.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Db(#[from] DatabaseError),
    #[error(transparent)]
    Segment(#[from] SegmentError),
    /// A code or data bug: merging overlapping ranges, pruning beyond the visible boundary.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// A background worker died or another unstructured failure.
    #[error("{0}")]
    Background(String),
}

impl StateError {
    /// Whether the error only signals cancellation.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
