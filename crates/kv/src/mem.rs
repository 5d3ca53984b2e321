//! Copy-on-write in-memory database.
//!
//! Committed state is a map of `Arc`-shared immutable tables. Read transactions clone the Arcs
//! and therefore observe a stable snapshot for their whole lifetime; the single writer clones a
//! table on first touch and publishes all touched tables atomically on commit.

use crate::{
    cursor::{DbCursor, DbCursorMut},
    transaction::{DbTx, DbTxMut},
    Database, DatabaseError, KvPair,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::Arc,
};

type TableData = Arc<BTreeMap<Vec<u8>, Vec<u8>>>;

#[derive(Default)]
struct MemDbInner {
    tables: RwLock<HashMap<String, TableData>>,
    /// Single-writer gate. A plain flag + condvar so the write transaction stays `Send`.
    writer_locked: Mutex<bool>,
    writer_cond: Condvar,
}

impl MemDbInner {
    fn lock_writer(&self) {
        let mut locked = self.writer_locked.lock();
        while *locked {
            self.writer_cond.wait(&mut locked);
        }
        *locked = true;
    }

    fn unlock_writer(&self) {
        *self.writer_locked.lock() = false;
        self.writer_cond.notify_one();
    }
}

/// In-memory [`Database`] with snapshot-isolated readers and a single writer.
#[derive(Clone, Default)]
pub struct MemDb(Arc<MemDbInner>);

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDb").field("tables", &self.0.tables.read().len()).finish()
    }
}

impl Database for MemDb {
    type Tx = MemTx;
    type TxMut = MemTxMut;

    fn begin_ro(&self) -> Result<Self::Tx, DatabaseError> {
        Ok(MemTx { tables: self.0.tables.read().clone() })
    }

    fn begin_rw(&self) -> Result<Self::TxMut, DatabaseError> {
        // Blocks until the previous writer commits or aborts.
        self.0.lock_writer();
        Ok(MemTxMut {
            snapshot: self.0.tables.read().clone(),
            inner: self.0.clone(),
            dirty: HashMap::new(),
            dirty_bytes: 0,
        })
    }
}

/// Read-only snapshot transaction.
pub struct MemTx {
    tables: HashMap<String, TableData>,
}

impl std::fmt::Debug for MemTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTx").field("tables", &self.tables.len()).finish()
    }
}

impl DbTx for MemTx {
    type Cursor<'a>
        = MemCursor<'a>
    where
        Self: 'a;

    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.tables.get(table).and_then(|t| t.get(key).cloned()))
    }

    fn cursor<'a>(&'a self, table: &str) -> Result<Self::Cursor<'a>, DatabaseError> {
        Ok(MemCursor::new(self.tables.get(table).map(|t| t.as_ref())))
    }

    fn entries(&self, table: &str) -> Result<usize, DatabaseError> {
        Ok(self.tables.get(table).map(|t| t.len()).unwrap_or_default())
    }

    fn commit(self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

/// The single read-write transaction. Dropping it without [`DbTx::commit`] aborts.
pub struct MemTxMut {
    inner: Arc<MemDbInner>,
    snapshot: HashMap<String, TableData>,
    dirty: HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
    dirty_bytes: u64,
}

impl Drop for MemTxMut {
    fn drop(&mut self) {
        self.inner.unlock_writer();
    }
}

impl MemTxMut {
    fn table(&self, table: &str) -> Option<&BTreeMap<Vec<u8>, Vec<u8>>> {
        match self.dirty.get(table) {
            Some(t) => Some(t),
            None => self.snapshot.get(table).map(|t| t.as_ref()),
        }
    }

    fn table_mut(&mut self, table: &str) -> &mut BTreeMap<Vec<u8>, Vec<u8>> {
        if !self.dirty.contains_key(table) {
            let base = self
                .snapshot
                .get(table)
                .map(|t| t.as_ref().clone())
                .unwrap_or_default();
            self.dirty.insert(table.to_string(), base);
        }
        self.dirty.get_mut(table).expect("just inserted")
    }
}

impl std::fmt::Debug for MemTxMut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTxMut")
            .field("dirty_tables", &self.dirty.len())
            .field("dirty_bytes", &self.dirty_bytes)
            .finish()
    }
}

impl DbTx for MemTxMut {
    type Cursor<'a>
        = MemCursor<'a>
    where
        Self: 'a;

    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, DatabaseError> {
        Ok(self.table(table).and_then(|t| t.get(key).cloned()))
    }

    fn cursor<'a>(&'a self, table: &str) -> Result<Self::Cursor<'a>, DatabaseError> {
        Ok(MemCursor::new(self.table(table)))
    }

    fn entries(&self, table: &str) -> Result<usize, DatabaseError> {
        Ok(self.table(table).map(|t| t.len()).unwrap_or_default())
    }

    fn commit(mut self) -> Result<(), DatabaseError> {
        let mut tables = self.inner.tables.write();
        for (name, data) in self.dirty.drain() {
            tables.insert(name, Arc::new(data));
        }
        Ok(())
    }
}

impl DbTxMut for MemTxMut {
    type CursorMut<'a>
        = MemCursorMut<'a>
    where
        Self: 'a;

    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> Result<(), DatabaseError> {
        self.dirty_bytes += (key.len() + value.len()) as u64;
        self.table_mut(table).insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &[u8]) -> Result<bool, DatabaseError> {
        self.dirty_bytes += key.len() as u64;
        Ok(self.table_mut(table).remove(key).is_some())
    }

    fn clear(&mut self, table: &str) -> Result<(), DatabaseError> {
        self.dirty.insert(table.to_string(), BTreeMap::new());
        Ok(())
    }

    fn cursor_mut<'a>(&'a mut self, table: &str) -> Result<Self::CursorMut<'a>, DatabaseError> {
        Ok(MemCursorMut { table: table.to_string(), pos: Pos::Unpositioned, tx: self })
    }

    fn space_dirty(&self) -> Result<u64, DatabaseError> {
        Ok(self.dirty_bytes)
    }
}

#[derive(Debug, Clone)]
enum Pos {
    Unpositioned,
    At(Vec<u8>),
    End,
}

fn cursor_first(map: Option<&BTreeMap<Vec<u8>, Vec<u8>>>, pos: &mut Pos) -> Option<KvPair> {
    step(map, pos, |m| m.iter().next())
}

fn cursor_last(map: Option<&BTreeMap<Vec<u8>, Vec<u8>>>, pos: &mut Pos) -> Option<KvPair> {
    step(map, pos, |m| m.iter().next_back())
}

fn cursor_seek(
    map: Option<&BTreeMap<Vec<u8>, Vec<u8>>>,
    pos: &mut Pos,
    key: &[u8],
) -> Option<KvPair> {
    step(map, pos, |m| m.range(key.to_vec()..).next())
}

fn cursor_next(map: Option<&BTreeMap<Vec<u8>, Vec<u8>>>, pos: &mut Pos) -> Option<KvPair> {
    match pos.clone() {
        Pos::Unpositioned => cursor_first(map, pos),
        Pos::At(key) => {
            step(map, pos, |m| m.range((Bound::Excluded(key.clone()), Bound::Unbounded)).next())
        }
        Pos::End => None,
    }
}

fn cursor_prev(map: Option<&BTreeMap<Vec<u8>, Vec<u8>>>, pos: &mut Pos) -> Option<KvPair> {
    match pos.clone() {
        Pos::Unpositioned | Pos::End => cursor_last(map, pos),
        Pos::At(key) => step(map, pos, |m| m.range(..key.clone()).next_back()),
    }
}

fn step<'a>(
    map: Option<&'a BTreeMap<Vec<u8>, Vec<u8>>>,
    pos: &mut Pos,
    f: impl FnOnce(&'a BTreeMap<Vec<u8>, Vec<u8>>) -> Option<(&'a Vec<u8>, &'a Vec<u8>)>,
) -> Option<KvPair> {
    match map.and_then(f) {
        Some((k, v)) => {
            *pos = Pos::At(k.clone());
            Some((k.clone(), v.clone()))
        }
        None => {
            *pos = Pos::End;
            None
        }
    }
}

/// Read-only cursor borrowing the table snapshot.
#[derive(Debug)]
pub struct MemCursor<'a> {
    map: Option<&'a BTreeMap<Vec<u8>, Vec<u8>>>,
    pos: Pos,
}

impl<'a> MemCursor<'a> {
    fn new(map: Option<&'a BTreeMap<Vec<u8>, Vec<u8>>>) -> Self {
        Self { map, pos: Pos::Unpositioned }
    }
}

impl DbCursor for MemCursor<'_> {
    fn first(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_first(self.map, &mut self.pos))
    }

    fn last(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_last(self.map, &mut self.pos))
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_seek(self.map, &mut self.pos, key))
    }

    fn seek_exact(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_seek(self.map, &mut self.pos, key).filter(|(k, _)| k == key))
    }

    fn next(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_next(self.map, &mut self.pos))
    }

    fn prev(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_prev(self.map, &mut self.pos))
    }
}

/// Read-write cursor operating on the writer's dirty table.
#[derive(Debug)]
pub struct MemCursorMut<'a> {
    tx: &'a mut MemTxMut,
    table: String,
    pos: Pos,
}

impl DbCursor for MemCursorMut<'_> {
    fn first(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_first(self.tx.table(&self.table), &mut self.pos))
    }

    fn last(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_last(self.tx.table(&self.table), &mut self.pos))
    }

    fn seek(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_seek(self.tx.table(&self.table), &mut self.pos, key))
    }

    fn seek_exact(&mut self, key: &[u8]) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_seek(self.tx.table(&self.table), &mut self.pos, key).filter(|(k, _)| k == key))
    }

    fn next(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_next(self.tx.table(&self.table), &mut self.pos))
    }

    fn prev(&mut self) -> Result<Option<KvPair>, DatabaseError> {
        Ok(cursor_prev(self.tx.table(&self.table), &mut self.pos))
    }
}

impl DbCursorMut for MemCursorMut<'_> {
    fn delete_current(&mut self) -> Result<(), DatabaseError> {
        if let Pos::At(key) = self.pos.clone() {
            // Position stays on the ghost of the deleted key, so `next` continues correctly.
            self.tx.delete(&self.table, &key)?;
        }
        Ok(())
    }

    fn upsert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<(), DatabaseError> {
        self.tx.put(&self.table, &key, &value)?;
        self.pos = Pos::At(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: &str = "Test";

    #[test]
    fn snapshot_isolation() {
        let db = MemDb::new();
        db.update(|tx| tx.put(T, b"a", b"1")).unwrap();

        let ro = db.begin_ro().unwrap();
        db.update(|tx| tx.put(T, b"a", b"2")).unwrap();

        // The reader still sees the state it was pinned to.
        assert_eq!(ro.get(T, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.begin_ro().unwrap().get(T, b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn abort_discards_changes() {
        let db = MemDb::new();
        db.update(|tx| tx.put(T, b"a", b"1")).unwrap();
        {
            let mut tx = db.begin_rw().unwrap();
            tx.put(T, b"a", b"2").unwrap();
            // Dropped without commit.
        }
        assert_eq!(db.begin_ro().unwrap().get(T, b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn cursor_walk_and_seek() {
        let db = MemDb::new();
        db.update(|tx| {
            for i in [1u8, 3, 5, 7] {
                tx.put(T, &[i], &[i * 10])?;
            }
            Ok(())
        })
        .unwrap();

        let tx = db.begin_ro().unwrap();
        let mut cur = tx.cursor(T).unwrap();
        assert_eq!(cur.first().unwrap(), Some((vec![1], vec![10])));
        assert_eq!(cur.next().unwrap(), Some((vec![3], vec![30])));
        assert_eq!(cur.seek(&[4]).unwrap(), Some((vec![5], vec![50])));
        assert_eq!(cur.prev().unwrap(), Some((vec![3], vec![30])));
        assert_eq!(cur.last().unwrap(), Some((vec![7], vec![70])));
        assert_eq!(cur.next().unwrap(), None);
        assert_eq!(cur.seek_exact(&[4]).unwrap(), None);
    }

    #[test]
    fn cursor_mut_delete_walk() {
        let db = MemDb::new();
        let mut tx = db.begin_rw().unwrap();
        for i in 0u8..10 {
            tx.put(T, &[i], &[i]).unwrap();
        }
        {
            let mut cur = tx.cursor_mut(T).unwrap();
            let mut entry = cur.first().unwrap();
            while let Some((key, _)) = entry {
                if key[0] % 2 == 0 {
                    cur.delete_current().unwrap();
                }
                entry = cur.next().unwrap();
            }
        }
        tx.commit().unwrap();

        assert_eq!(db.begin_ro().unwrap().entries(T).unwrap(), 5);
    }

    #[test]
    fn space_dirty_grows() {
        let db = MemDb::new();
        let mut tx = db.begin_rw().unwrap();
        assert_eq!(tx.space_dirty().unwrap(), 0);
        tx.put(T, b"key", b"value").unwrap();
        assert_eq!(tx.space_dirty().unwrap(), 8);
    }
}
