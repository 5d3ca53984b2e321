//! Transactional ordered key-value store abstraction.
//!
//! The state engine treats its backing store as a collaborator behind these traits: an ordered
//! mapping of named tables supporting snapshot-isolated read transactions, a single write
//! transaction, range cursors and a dirty-space probe. Tables are addressed by name, keys and
//! values are raw bytes; all typed encoding happens in the layers above.

#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use thiserror::Error;

mod cursor;
mod transaction;
pub use cursor::{DbCursor, DbCursorMut};
pub use transaction::{DbTx, DbTxMut};

pub mod mem;
pub use mem::MemDb;

/// A key-value pair coming out of a cursor.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Database error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// Failed to open the database.
    #[error("failed to open the database: {0}")]
    Open(String),
    /// Table was not created by the environment.
    #[error("table {0} does not exist")]
    TableMissing(String),
    /// Failed to commit transaction changes into the database.
    #[error("failed to commit transaction changes: {0}")]
    Commit(String),
    /// Write attempted through a second concurrent writer.
    #[error("a write transaction is already open")]
    WriterBusy,
    /// Any other unstructured backend error.
    #[error("{0}")]
    Other(String),
}

/// Main database trait that can open read-only and read-write transactions.
pub trait Database: Send + Sync + 'static {
    /// Read-only transaction type.
    type Tx: DbTx;
    /// Read-write transaction type.
    type TxMut: DbTxMut;

    /// Begins a read-only transaction pinned to the most recent committed state.
    fn begin_ro(&self) -> Result<Self::Tx, DatabaseError>;

    /// Begins the (single) read-write transaction.
    fn begin_rw(&self) -> Result<Self::TxMut, DatabaseError>;

    /// Runs `f` inside a read-only transaction.
    fn view<T>(
        &self,
        f: impl FnOnce(&Self::Tx) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let tx = self.begin_ro()?;
        f(&tx)
    }

    /// Runs `f` inside a read-write transaction, committing on success.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut Self::TxMut) -> Result<T, DatabaseError>,
    ) -> Result<T, DatabaseError> {
        let mut tx = self.begin_rw()?;
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }
}
