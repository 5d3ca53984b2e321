//! Staging area for a single block's (or transaction batch's) writes.
//!
//! A [`SharedDomains`] buffers keyed writes in memory, folds them into the commitment root on
//! demand and persists everything into the DB tables atomically with the caller's write
//! transaction on [`SharedDomains::flush`]. One writer per instance; concurrency lives in
//! the aggregator behind it.

use crate::{
    aggregator::Aggregator,
    commitment::{
        leaf_hash, tagged_key, xor_fold, CommitmentState, CommitmentValue, KeyRef,
        COMMITMENT_STATE_KEY,
    },
    tables, AggregatorRoTx, DomainId, InvertedIdx, StateResult,
};
use alloy_primitives::B256;
use sediment_kv::{Database, DbTx, DbTxMut};
use std::collections::{BTreeMap, BTreeSet};
use tracing::*;

#[derive(Debug, Clone)]
struct StagedValue {
    value: Vec<u8>,
    step: u64,
}

#[derive(Debug, Clone)]
struct WriteEntry {
    domain: DomainId,
    key: Vec<u8>,
    tx_num: u64,
    prev: Vec<u8>,
}

pub struct SharedDomains<D: Database> {
    agg: std::sync::Arc<Aggregator<D>>,
    view: AggregatorRoTx<D>,
    tx_num: u64,
    block_num: u64,
    /// Latest staged value per domain and key; drained into the DB on flush.
    latest: Vec<BTreeMap<Vec<u8>, StagedValue>>,
    /// Every write in order, feeding history and the inverted indices.
    log: Vec<WriteEntry>,
    /// Standalone inverted index touches.
    index_log: Vec<(InvertedIdx, Vec<u8>, u64)>,
    /// State keys touched since the last commitment fold.
    pending_commitment: BTreeSet<(DomainId, Vec<u8>)>,
    /// Cached commitment root, lazily restored from the commitment domain.
    root: Option<B256>,
}

impl<D: Database> std::fmt::Debug for SharedDomains<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDomains")
            .field("tx_num", &self.tx_num)
            .field("block_num", &self.block_num)
            .field("staged", &self.latest.iter().map(|m| m.len()).sum::<usize>())
            .field("log", &self.log.len())
            .finish()
    }
}

impl<D: Database> SharedDomains<D> {
    pub fn new(agg: &std::sync::Arc<Aggregator<D>>) -> Self {
        Self {
            view: agg.begin_files_ro(),
            agg: agg.clone(),
            tx_num: 0,
            block_num: 0,
            latest: (0..tables::DOMAIN_COUNT).map(|_| BTreeMap::new()).collect(),
            log: Vec::new(),
            index_log: Vec::new(),
            pending_commitment: BTreeSet::new(),
            root: None,
        }
    }

    pub const fn tx_num(&self) -> u64 {
        self.tx_num
    }

    pub const fn block_num(&self) -> u64 {
        self.block_num
    }

    /// Writes arrive in non-decreasing txNum order per writer.
    pub fn set_tx_num(&mut self, tx_num: u64) {
        debug_assert!(tx_num >= self.tx_num, "txNum must be monotonic");
        self.tx_num = tx_num;
    }

    pub fn view(&self) -> &AggregatorRoTx<D> {
        &self.view
    }

    pub fn step_of(&self, tx_num: u64) -> u64 {
        tx_num / self.agg.step_size()
    }

    /// Stages a write. `prev_value` is the value current just before this write (empty when
    /// the key did not exist); `step` is the step the write lands in.
    pub fn put(
        &mut self,
        domain: DomainId,
        key: &[u8],
        sub_key: Option<&[u8]>,
        value: &[u8],
        prev_value: &[u8],
        step: u64,
    ) {
        let mut full_key = key.to_vec();
        if let Some(sub_key) = sub_key {
            full_key.extend_from_slice(sub_key);
        }
        self.log.push(WriteEntry {
            domain,
            key: full_key.clone(),
            tx_num: self.tx_num,
            prev: prev_value.to_vec(),
        });
        if matches!(domain, DomainId::Accounts | DomainId::Storage) {
            self.pending_commitment.insert((domain, full_key.clone()));
        }
        self.latest[domain.index()]
            .insert(full_key, StagedValue { value: value.to_vec(), step });
    }

    /// Deletion is a write of the empty value.
    pub fn delete(&mut self, domain: DomainId, key: &[u8], prev_value: &[u8], step: u64) {
        self.put(domain, key, None, &[], prev_value, step);
    }

    /// Records a standalone inverted index touch at the current txNum.
    pub fn index_add(&mut self, idx: InvertedIdx, key: &[u8]) {
        self.index_log.push((idx, key.to_vec(), self.tx_num));
    }

    /// Read-through: staging first, then DB, then files.
    pub fn get_latest<T: DbTx>(
        &self,
        domain: DomainId,
        key: &[u8],
        tx: &T,
    ) -> StateResult<Option<(Vec<u8>, u64)>> {
        if let Some(staged) = self.latest[domain.index()].get(key) {
            return Ok(Some((staged.value.clone(), staged.step)))
        }
        self.view.get_latest(domain, key, tx)
    }

    /// Persists the staged writes into the DB tables, atomically with `tx`.
    pub fn flush<T: DbTxMut>(&mut self, tx: &mut T) -> StateResult<()> {
        for entry in std::mem::take(&mut self.log) {
            let d = self.agg.domain_entity(entry.domain);
            d.hist.add_prev(tx, &entry.key, entry.tx_num, &entry.prev)?;
        }
        for (idx, key, tx_num) in std::mem::take(&mut self.index_log) {
            self.agg.search_index(idx).put(tx, &key, tx_num)?;
        }
        for (domain, staged) in DomainId::ALL.iter().zip(std::mem::take(&mut self.latest)) {
            let d = self.agg.domain_entity(*domain);
            for (key, staged_value) in staged {
                tx.put(
                    d.values_table,
                    &tables::key_with_inverted_step(&key, staged_value.step),
                    &staged_value.value,
                )?;
            }
        }
        self.latest = (0..tables::DOMAIN_COUNT).map(|_| BTreeMap::new()).collect();
        Ok(())
    }

    /// Folds every staged state change into the commitment domain and returns the root.
    /// With `save_state` the `(root, txNum, blockNum)` resumption marker is staged too.
    pub fn compute_commitment<T: DbTx>(
        &mut self,
        tx: &T,
        save_state: bool,
        block_num: u64,
    ) -> StateResult<B256> {
        let mut root = self.current_root(tx)?;
        let step = self.step_of(self.tx_num);

        let pending = std::mem::take(&mut self.pending_commitment);
        for (domain, key) in pending {
            let ckey = tagged_key(domain, &key);
            let new_value = self
                .get_latest(domain, &key, tx)?
                .map(|(value, _)| value)
                .unwrap_or_default();

            let old_record = self
                .get_latest(DomainId::Commitment, &ckey, tx)?
                .map(|(value, _)| value)
                .unwrap_or_default();
            let old_hash = if old_record.is_empty() {
                B256::ZERO
            } else {
                CommitmentValue::decode(&old_record)?.hash
            };
            let new_hash = if new_value.is_empty() {
                B256::ZERO
            } else {
                leaf_hash(domain, &key, &new_value)
            };
            if old_hash == new_hash {
                continue
            }
            xor_fold(&mut root, &old_hash);
            xor_fold(&mut root, &new_hash);

            let record = if new_hash == B256::ZERO {
                Vec::new()
            } else {
                CommitmentValue { referenced: KeyRef::Plain(key.clone()), hash: new_hash }
                    .encode()
            };
            self.put(DomainId::Commitment, &ckey, None, &record, &old_record, step);
        }
        self.root = Some(root);

        if save_state {
            let old_state = self
                .get_latest(DomainId::Commitment, COMMITMENT_STATE_KEY, tx)?
                .map(|(value, _)| value)
                .unwrap_or_default();
            // The marker stores the resumption point: the first txNum and block that are not
            // yet executed. `seek_commitment` positions a writer exactly there.
            let state =
                CommitmentState { root, tx_num: self.tx_num + 1, block_num: block_num + 1 };
            self.put(
                DomainId::Commitment,
                COMMITMENT_STATE_KEY,
                None,
                &state.encode(),
                &old_state,
                step,
            );
            self.block_num = block_num + 1;
            trace!(target: "state", tx_num = self.tx_num, block_num, %root, "commitment state saved");
        }
        Ok(root)
    }

    /// Positions this writer at the last persisted commitment point: `(txNum, blockNum)` of
    /// the newest saved state, or `(0, 0)` over an empty datadir.
    pub fn seek_commitment<T: DbTx>(&mut self, tx: &T) -> StateResult<(u64, u64)> {
        match self.get_latest(DomainId::Commitment, COMMITMENT_STATE_KEY, tx)? {
            Some((raw, _)) if !raw.is_empty() => {
                let state = CommitmentState::decode(&raw)?;
                self.tx_num = state.tx_num;
                self.block_num = state.block_num;
                self.root = Some(state.root);
                debug!(target: "state", tx_num = state.tx_num, block_num = state.block_num, "seek commitment");
                Ok((state.tx_num, state.block_num))
            }
            _ => {
                self.tx_num = 0;
                self.block_num = 0;
                self.root = None;
                Ok((0, 0))
            }
        }
    }

    fn current_root<T: DbTx>(&self, tx: &T) -> StateResult<B256> {
        if let Some(root) = self.root {
            return Ok(root)
        }
        match self.get_latest(DomainId::Commitment, COMMITMENT_STATE_KEY, tx)? {
            Some((raw, _)) if !raw.is_empty() => Ok(CommitmentState::decode(&raw)?.root),
            _ => Ok(self.agg.config().genesis_state_root),
        }
    }

    /// Drops the staging buffers and the pinned file view.
    pub fn close(mut self) {
        self.view.close();
    }
}
