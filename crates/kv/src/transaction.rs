use crate::{cursor::{DbCursor, DbCursorMut}, DatabaseError};
use std::fmt::Debug;

/// Read-only transaction over named tables.
pub trait DbTx: Debug + Send {
    /// Cursor type for this transaction.
    type Cursor<'a>: DbCursor + 'a
    where
        Self: 'a;

    /// Gets a value by key.
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError>;

    /// Opens a cursor over `table`.
    fn cursor<'a>(&'a self, table: &str) -> Result<Self::Cursor<'a>, DatabaseError>;

    /// Returns number of entries in the table.
    fn entries(&self, table: &str) -> Result<usize, DatabaseError>;

    /// Commits the transaction. A read-only commit frees the snapshot; the writer atomically
    /// publishes all of its changes. Dropping a transaction without committing aborts it.
    fn commit(self) -> Result<(), DatabaseError>;
}

/// Read-write transaction. At most one is open per database.
pub trait DbTxMut: DbTx {
    /// Read-write cursor type for this transaction.
    type CursorMut<'a>: DbCursorMut + 'a
    where
        Self: 'a;

    /// Puts a value for a key.
    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), DatabaseError>;

    /// Appends a value with the largest key of the table. Same outcome as `put`; ordered
    /// backends provide dedicated fast paths for it.
    fn append(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.put(table, key, value)
    }

    /// Deletes the entry for a key, reporting whether it existed.
    fn delete(&mut self, table: &str, key: &[u8]) -> Result<bool, DatabaseError>;

    /// Removes every entry of the table.
    fn clear(&mut self, table: &str) -> Result<(), DatabaseError>;

    /// Opens a read-write cursor over `table`.
    fn cursor_mut<'a>(&'a mut self, table: &str) -> Result<Self::CursorMut<'a>, DatabaseError>;

    /// Approximate number of bytes of dirty pages held by this transaction.
    fn space_dirty(&self) -> Result<u64, DatabaseError>;
}
