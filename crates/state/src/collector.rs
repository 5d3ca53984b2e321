//! Spill-to-disk sorted collector used by the collation phase.
//!
//! Collations can exceed memory for large steps, so entries are pushed unsorted into a bounded
//! buffer that is sorted and flushed into temporary files; iteration k-way-merges the sorted
//! runs back together. Duplicate keys are yielded in insertion order.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};
use tempfile::NamedTempFile;

/// A sorted key-value collector spilling to `dir` above `buffer_capacity_bytes`.
#[derive(Debug)]
pub(crate) struct Collector {
    dir: std::path::PathBuf,
    files: Vec<SpillFile>,
    buffer_size_bytes: usize,
    buffer_capacity_bytes: usize,
    buffer: Vec<(Vec<u8>, Vec<u8>)>,
    len: usize,
}

impl Collector {
    pub(crate) fn new(dir: &Path, buffer_capacity_bytes: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            files: Vec::new(),
            buffer_size_bytes: 0,
            buffer_capacity_bytes,
            buffer: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> io::Result<()> {
        self.buffer_size_bytes += key.len() + value.len();
        self.buffer.push((key, value));
        self.len += 1;
        if self.buffer_size_bytes > self.buffer_capacity_bytes {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer_size_bytes = 0;
        self.buffer.sort_by(|a, b| a.0.cmp(&b.0));
        let mut buf = Vec::with_capacity(self.buffer.len());
        std::mem::swap(&mut buf, &mut self.buffer);
        self.files.push(SpillFile::new(&self.dir, buf)?);
        Ok(())
    }

    /// Sorted iterator across the buffer and every spilled run.
    pub(crate) fn iter(&mut self) -> io::Result<CollectorIter<'_>> {
        if self.buffer_size_bytes > 0 || !self.buffer.is_empty() {
            self.flush()?;
        }

        let mut heap = BinaryHeap::new();
        for (current_id, file) in self.files.iter_mut().enumerate() {
            if let Some(entry) = file.read_next()? {
                heap.push((Reverse(entry), current_id));
            }
        }
        Ok(CollectorIter { heap, files: &mut self.files })
    }
}

#[derive(Debug)]
pub(crate) struct CollectorIter<'a> {
    #[allow(clippy::type_complexity)]
    heap: BinaryHeap<(Reverse<(Vec<u8>, Vec<u8>)>, usize)>,
    files: &'a mut Vec<SpillFile>,
}

impl Iterator for CollectorIter<'_> {
    type Item = io::Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let (Reverse(entry), id) = self.heap.pop()?;
        match self.files[id].read_next() {
            Ok(Some(next)) => {
                self.heap.push((Reverse(next), id));
                Some(Ok(entry))
            }
            Ok(None) => Some(Ok(entry)),
            Err(err) => Some(Err(err)),
        }
    }
}

/// One sorted temporary run.
#[derive(Debug)]
struct SpillFile {
    file: BufReader<NamedTempFile>,
    len: usize,
}

impl SpillFile {
    fn new(dir: &Path, buffer: Vec<(Vec<u8>, Vec<u8>)>) -> io::Result<Self> {
        let file = NamedTempFile::new_in(dir)?;
        let mut w = BufWriter::new(file);
        for (key, value) in &buffer {
            w.write_all(&(key.len() as u64).to_be_bytes())?;
            w.write_all(&(value.len() as u64).to_be_bytes())?;
            w.write_all(key)?;
            w.write_all(value)?;
        }
        let mut file = BufReader::new(w.into_inner().map_err(io::Error::other)?);
        file.seek(SeekFrom::Start(0))?;
        Ok(Self { file, len: buffer.len() })
    }

    fn read_next(&mut self) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.len == 0 {
            return Ok(None)
        }
        let mut key_len = [0; 8];
        let mut value_len = [0; 8];
        self.file.read_exact(&mut key_len)?;
        self.file.read_exact(&mut value_len)?;

        let mut key = vec![0; u64::from_be_bytes(key_len) as usize];
        let mut value = vec![0; u64::from_be_bytes(value_len) as usize];
        self.file.read_exact(&mut key)?;
        self.file.read_exact(&mut value)?;
        self.len -= 1;
        Ok(Some((key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, RngCore, SeedableRng};

    #[test]
    fn sorted_across_spills() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        let mut entries: Vec<_> = (0..1_000u64)
            .map(|i| {
                let mut key = vec![0; 16];
                rng.fill_bytes(&mut key);
                (key, i.to_be_bytes().to_vec())
            })
            .collect();

        // Tiny capacity forces multiple spill files.
        let mut collector = Collector::new(dir.path(), 256);
        for (k, v) in entries.clone() {
            collector.insert(k, v).unwrap();
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let collected: Vec<_> = collector.iter().unwrap().map(|e| e.unwrap()).collect();
        assert_eq!(collected, entries);
    }
}
