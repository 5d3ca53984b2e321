use crate::{DatabaseError, KvPair};

/// A read-only cursor over one table, positioned between calls.
pub trait DbCursor {
    /// Positions the cursor at the first entry of the table.
    fn first(&mut self) -> Result<Option<KvPair>, DatabaseError>;

    /// Positions the cursor at the last entry of the table.
    fn last(&mut self) -> Result<Option<KvPair>, DatabaseError>;

    /// Positions the cursor at the first entry whose key is `>= key`.
    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError>;

    /// Positions the cursor at `key`, if present.
    fn seek_exact(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError>;

    /// Moves to the next entry.
    fn next(&mut self) -> Result<Option<KvPair>, DatabaseError>;

    /// Moves to the previous entry.
    fn prev(&mut self) -> Result<Option<KvPair>, DatabaseError>;
}

/// A read-write cursor over one table.
pub trait DbCursorMut: DbCursor {
    /// Deletes the entry the cursor is currently positioned at.
    fn delete_current(&mut self) -> Result<(), DatabaseError>;

    /// Inserts or replaces `key`, leaving the cursor positioned at it.
    fn upsert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), DatabaseError>;
}
