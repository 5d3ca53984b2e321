//! End-to-end scenarios: execute blocks through `SharedDomains`, freeze steps into files,
//! merge, prune, restart, and check every read path against an in-test model.

use alloy_primitives::B256;
use sediment_kv::{Database, DbCursor, DbTx, MemDb};
use sediment_state::{
    decode_leaf, Aggregator, AggregatorConfig, Dirs, DomainId, InvertedIdx, KeyRef,
    SharedDomains,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
    time::Duration,
};

const STEP_SIZE: u64 = 100;
const BLOCK_SIZE: u64 = 10;

type Agg = Arc<Aggregator<MemDb>>;

/// Per-key write log: `(txNum, value)` in order. The empty value is a deletion.
#[derive(Default)]
struct Model {
    accounts: BTreeMap<Vec<u8>, Vec<(u64, Vec<u8>)>>,
    storage: BTreeMap<Vec<u8>, Vec<(u64, Vec<u8>)>>,
    touches: HashMap<Vec<u8>, Vec<u64>>,
}

impl Model {
    /// Value a reader should see at the boundary just before `ts`.
    fn expected_as_of(log: &BTreeMap<Vec<u8>, Vec<(u64, Vec<u8>)>>, key: &[u8], ts: u64) -> Option<Vec<u8>> {
        let writes = log.get(key)?;
        writes
            .iter()
            .rev()
            .find(|(tx_num, _)| *tx_num < ts)
            .map(|(_, value)| value.clone())
            .filter(|value| !value.is_empty())
    }

    fn expected_latest(log: &BTreeMap<Vec<u8>, Vec<(u64, Vec<u8>)>>, key: &[u8]) -> Option<Vec<u8>> {
        log.get(key)?.last().map(|(_, value)| value.clone()).filter(|value| !value.is_empty())
    }
}

fn test_config() -> AggregatorConfig {
    let mut cfg = AggregatorConfig::new(STEP_SIZE);
    cfg.fsync = false;
    cfg.genesis_state_root = B256::repeat_byte(0x42);
    cfg
}

fn open_aggregator(datadir: &Path, db: &Arc<MemDb>) -> Agg {
    let dirs = Dirs::new(datadir).unwrap();
    let agg = Aggregator::new(dirs, test_config(), db.clone()).unwrap();
    agg.open_folder().unwrap();
    agg
}

fn acct_key(i: u64) -> Vec<u8> {
    let mut key = vec![0xaa; 20];
    key[12..20].copy_from_slice(&i.to_be_bytes());
    key
}

fn slot_key(i: u64) -> Vec<u8> {
    let mut slot = vec![0x55; 32];
    slot[24..32].copy_from_slice(&i.to_be_bytes());
    slot
}

fn value_for(tx_num: u64, salt: u8) -> Vec<u8> {
    let mut value = vec![salt; 24];
    value[16..24].copy_from_slice(&tx_num.to_be_bytes());
    value
}

/// Executes blocks `[from_block, to_block)`. `key_of` picks which account a txNum touches.
fn exec_blocks(
    agg: &Agg,
    db: &Arc<MemDb>,
    from_block: u64,
    to_block: u64,
    key_of: impl Fn(u64) -> u64,
    model: &mut Model,
    hashes: &mut Vec<B256>,
) {
    let mut sd = SharedDomains::new(agg);
    let mut tx = db.begin_rw().unwrap();
    sd.seek_commitment(&tx).unwrap();

    for block in from_block..to_block {
        for offset in 0..BLOCK_SIZE {
            let tx_num = block * BLOCK_SIZE + offset;
            sd.set_tx_num(tx_num);
            let step = sd.step_of(tx_num);

            let key = acct_key(key_of(tx_num));
            let value =
                if tx_num % 53 == 52 { Vec::new() } else { value_for(tx_num, 0x01) };
            let prev = sd
                .get_latest(DomainId::Accounts, &key, &tx)
                .unwrap()
                .map(|(v, _)| v)
                .unwrap_or_default();
            sd.put(DomainId::Accounts, &key, None, &value, &prev, step);
            model.accounts.entry(key.clone()).or_default().push((tx_num, value));
            model.touches.entry(key.clone()).or_default().push(tx_num);
            sd.index_add(InvertedIdx::LogAddrs, &key);

            if tx_num % 3 == 0 {
                let slot = slot_key(tx_num % 5);
                let mut full = key.clone();
                full.extend_from_slice(&slot);
                let value = value_for(tx_num, 0x02);
                let prev = sd
                    .get_latest(DomainId::Storage, &full, &tx)
                    .unwrap()
                    .map(|(v, _)| v)
                    .unwrap_or_default();
                sd.put(DomainId::Storage, &key, Some(&slot), &value, &prev, step);
                model.storage.entry(full).or_default().push((tx_num, value));
            }

            if tx_num % 10 == 7 {
                let code = value_for(tx_num, 0x03);
                let prev = sd
                    .get_latest(DomainId::Code, &key, &tx)
                    .unwrap()
                    .map(|(v, _)| v)
                    .unwrap_or_default();
                sd.put(DomainId::Code, &key, None, &code, &prev, step);
            }
        }
        sd.set_tx_num((block + 1) * BLOCK_SIZE - 1);
        let root = sd.compute_commitment(&tx, true, block).unwrap();
        hashes.push(root);
        sd.flush(&mut tx).unwrap();
    }
    tx.commit().unwrap();
    sd.close();
}

fn prune_all(agg: &Agg, db: &Arc<MemDb>) {
    let at = agg.begin_files_ro();
    let mut tx = db.begin_rw().unwrap();
    while at.prune_small_batches(Duration::from_millis(500), &mut tx).unwrap() {}
    tx.commit().unwrap();
}

fn check_reads(agg: &Agg, db: &Arc<MemDb>, model: &Model) {
    let at = agg.begin_files_ro();
    let tx = db.begin_ro().unwrap();

    for (key, writes) in &model.accounts {
        let latest = at
            .get_latest(DomainId::Accounts, key, &tx)
            .unwrap()
            .map(|(v, _)| v)
            .filter(|v| !v.is_empty());
        assert_eq!(latest, Model::expected_latest(&model.accounts, key), "latest of {key:x?}");

        // Point-in-time reads at write boundaries and in between.
        for &(tx_num, _) in writes {
            for ts in [tx_num, tx_num + 1, tx_num + 7] {
                assert_eq!(
                    at.get_as_of(DomainId::Accounts, key, ts, &tx).unwrap(),
                    Model::expected_as_of(&model.accounts, key, ts),
                    "as_of({ts}) of {key:x?}"
                );
            }
        }
    }
    for (full_key, writes) in &model.storage {
        let (key, slot) = full_key.split_at(20);
        let _ = (key, slot);
        for &(tx_num, _) in writes.iter().take(5) {
            assert_eq!(
                at.get_as_of(DomainId::Storage, full_key, tx_num + 1, &tx).unwrap(),
                Model::expected_as_of(&model.storage, full_key, tx_num + 1),
            );
        }
    }
}

#[test]
fn build_read_back_and_prune() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemDb::new());
    let agg = open_aggregator(dir.path(), &db);

    let mut model = Model::default();
    let mut hashes = Vec::new();
    exec_blocks(&agg, &db, 0, 205, |tx_num| tx_num % 17, &mut model, &mut hashes);

    agg.build_files(2050).unwrap();
    assert!(agg.end_tx_num_minimax() >= 2000, "20 full steps must be frozen");

    // Commitment coupling: commitment may lag at most one step behind accounts/storage.
    {
        let at = agg.begin_files_ro();
        let state_step = at
            .domain(DomainId::Accounts)
            .files_end_tx()
            .min(at.domain(DomainId::Storage).files_end_tx()) /
            STEP_SIZE;
        let commitment_step = at.domain(DomainId::Commitment).files_end_tx() / STEP_SIZE;
        assert!(
            commitment_step + 1 >= state_step,
            "commitment fell behind: {commitment_step} vs {state_step}"
        );
    }

    check_reads(&agg, &db, &model);
    prune_all(&agg, &db);
    // History completeness: answers below the frozen floor are unchanged, now file-served.
    check_reads(&agg, &db, &model);

    // The inverted index stream matches the recorded touches across files and DB tail.
    {
        let at = agg.begin_files_ro();
        let tx = db.begin_ro().unwrap();
        let key = acct_key(3);
        let touches: Vec<u64> = at
            .index_range(InvertedIdx::LogAddrs, &key, 0, u64::MAX, true, usize::MAX, &tx)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(&touches, model.touches.get(&key).unwrap());

        let mut desc: Vec<u64> = at
            .index_range(InvertedIdx::LogAddrs, &key, 0, u64::MAX, false, 10, &tx)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        desc.reverse();
        let all = model.touches.get(&key).unwrap();
        assert_eq!(&desc, &all[all.len() - 10..]);
    }

    // Ordered latest range stream against the model.
    {
        let at = agg.begin_files_ro();
        let tx = db.begin_ro().unwrap();
        let got: Vec<(Vec<u8>, Vec<u8>)> = at
            .domain(DomainId::Accounts)
            .range_latest(&[], None, usize::MAX, &tx)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let want: Vec<(Vec<u8>, Vec<u8>)> = model
            .accounts
            .keys()
            .filter_map(|key| {
                Model::expected_latest(&model.accounts, key).map(|v| (key.clone(), v))
            })
            .collect();
        assert_eq!(got, want);

        // And the same range as of an early point in time.
        let ts = 500;
        let got: Vec<(Vec<u8>, Vec<u8>)> = at
            .domain(DomainId::Accounts)
            .range_as_of(ts, &[], None, usize::MAX, &tx)
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        let want: Vec<(Vec<u8>, Vec<u8>)> = model
            .accounts
            .keys()
            .filter_map(|key| {
                Model::expected_as_of(&model.accounts, key, ts).map(|v| (key.clone(), v))
            })
            .collect();
        assert_eq!(got, want);
    }

    // Replaying the same blocks over a fresh datadir reproduces every commitment root.
    {
        let dir2 = tempfile::tempdir().unwrap();
        let db2 = Arc::new(MemDb::new());
        let agg2 = open_aggregator(dir2.path(), &db2);
        let mut model2 = Model::default();
        let mut hashes2 = Vec::new();
        exec_blocks(&agg2, &db2, 0, 205, |tx_num| tx_num % 17, &mut model2, &mut hashes2);
        assert_eq!(hashes, hashes2);
        agg2.close();
    }

    agg.close();
}

#[test]
fn build_files_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemDb::new());
    let agg = open_aggregator(dir.path(), &db);

    let mut model = Model::default();
    let mut hashes = Vec::new();
    exec_blocks(&agg, &db, 0, 25, |tx_num| tx_num % 7, &mut model, &mut hashes);

    agg.build_files(250).unwrap();
    let at = agg.begin_files_ro();
    let files_before = at.all_files();
    let minimax = agg.end_tx_num_minimax();
    drop(at);

    // The second call observes the already-visible steps and returns an already-closed
    // signal without touching anything.
    agg.build_files(250).unwrap();
    let at = agg.begin_files_ro();
    assert_eq!(files_before, at.all_files());
    assert_eq!(minimax, agg.end_tx_num_minimax());
    drop(at);
    agg.close();
}

#[test]
fn restart_without_db() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemDb::new());
    let agg = open_aggregator(dir.path(), &db);

    let mut model = Model::default();
    let mut hashes = Vec::new();
    exec_blocks(&agg, &db, 0, 205, |tx_num| tx_num % 17, &mut model, &mut hashes);
    agg.build_files(2050).unwrap();
    agg.close();

    // The DB is gone, the datadir remains.
    let db2 = Arc::new(MemDb::new());
    let agg2 = open_aggregator(dir.path(), &db2);
    let tx = db2.begin_ro().unwrap();
    let mut sd = SharedDomains::new(&agg2);

    // Resumption continues at the last fully-stepped point.
    assert_eq!(sd.seek_commitment(&tx).unwrap(), (2000, 200));
    // The root over no new writes equals the root persisted for block 199.
    let root = sd.compute_commitment(&tx, false, 200).unwrap();
    assert_eq!(root, hashes[199]);
    agg2.close();
}

#[test]
fn restart_without_anything() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemDb::new());
    let agg = open_aggregator(dir.path(), &db);

    let tx = db.begin_ro().unwrap();
    let mut sd = SharedDomains::new(&agg);
    assert_eq!(sd.seek_commitment(&tx).unwrap(), (0, 0));
    let root = sd.compute_commitment(&tx, false, 0).unwrap();
    assert_eq!(root, test_config().genesis_state_root);
    agg.close();
}

#[test]
fn commitment_coupling_under_crash() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemDb::new());
    let agg = open_aggregator(dir.path(), &db);

    let mut model = Model::default();
    let mut hashes = Vec::new();
    exec_blocks(&agg, &db, 0, 15, |tx_num| tx_num % 5, &mut model, &mut hashes);
    agg.build_files(150).unwrap();
    assert_eq!(agg.end_tx_num_minimax(), 100);

    let snap = agg.dirs().snap.clone();
    agg.close();

    // Simulate a crash after the accounts file was fsynced but before the commitment file
    // was: the commitment values file of the range disappears.
    std::fs::remove_file(snap.join("v1-commitment.0-1.kv")).unwrap();
    std::fs::remove_file(snap.join("v1-commitment.0-1.kvi")).unwrap();

    let agg2 = open_aggregator(dir.path(), &db);
    // The orphaned accounts file must not become visible, and the minimax stays at zero.
    assert_eq!(agg2.end_tx_num_minimax(), 0);
    let at = agg2.begin_files_ro();
    assert!(at.domain(DomainId::Accounts).kv_file_ranges().is_empty());
    drop(at);
    agg2.close();
}

#[test]
fn prune_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemDb::new());
    let agg = open_aggregator(dir.path(), &db);

    // Write txNums 1..150 straight through one writer.
    let mut sd = SharedDomains::new(&agg);
    let mut tx = db.begin_rw().unwrap();
    let mut model = Model::default();
    for tx_num in 1..150u64 {
        sd.set_tx_num(tx_num);
        let key = acct_key(tx_num % 11);
        let value = value_for(tx_num, 0x07);
        let prev = sd
            .get_latest(DomainId::Accounts, &key, &tx)
            .unwrap()
            .map(|(v, _)| v)
            .unwrap_or_default();
        sd.put(DomainId::Accounts, &key, None, &value, &prev, sd.step_of(tx_num));
        model.accounts.entry(key).or_default().push((tx_num, value));
    }
    sd.compute_commitment(&tx, true, 14).unwrap();
    sd.flush(&mut tx).unwrap();
    tx.commit().unwrap();
    sd.close();

    agg.build_files(150).unwrap();
    assert_eq!(agg.end_tx_num_minimax(), 100);
    prune_all(&agg, &db);

    // txNums 0..99 now live only in files; 100..150 remain in DB.
    let tx = db.begin_ro().unwrap();
    let tables = DomainId::Accounts.tables();
    let mut cursor = tx.cursor(tables.idx_keys).unwrap();
    let (first_row, _) = cursor.first().unwrap().expect("tail rows remain");
    let first_tx = u64::from_be_bytes(first_row[0..8].try_into().unwrap());
    assert!(first_tx >= 100, "history below the boundary must be gone, found {first_tx}");

    // A read at ts=50 is answered from files.
    let at = agg.begin_files_ro();
    for key in model.accounts.keys() {
        assert_eq!(
            at.get_as_of(DomainId::Accounts, key, 50, &tx).unwrap(),
            Model::expected_as_of(&model.accounts, key, 50),
        );
    }
    drop(at);
    agg.close();
}

#[test]
fn parallel_readers_during_merge() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(MemDb::new());
    let agg = open_aggregator(dir.path(), &db);
    agg.set_no_merge(true);

    let mut model = Model::default();
    let mut hashes = Vec::new();
    // Steps 0 and 1 get the whole key set; step 2 touches a single key so most commitment
    // leaves end up served from the merged files after pruning.
    exec_blocks(
        &agg,
        &db,
        0,
        25,
        |tx_num| if tx_num < 200 { tx_num % 17 } else { 1 },
        &mut model,
        &mut hashes,
    );
    agg.build_files(250).unwrap();

    use sediment_state::StepRange;
    let reader_a = agg.begin_files_ro();
    assert_eq!(
        reader_a.domain(DomainId::Accounts).kv_file_ranges(),
        vec![StepRange::new(0, 1), StepRange::new(1, 2)]
    );

    agg.set_no_merge(false);
    agg.merge_loop().unwrap();

    let reader_b = agg.begin_files_ro();
    assert_eq!(
        reader_b.domain(DomainId::Accounts).kv_file_ranges(),
        vec![StepRange::new(0, 2)]
    );

    // Reader A keeps its snapshot: the superseded files stay on disk and readable.
    let snap = agg.dirs().snap.clone();
    assert!(snap.join("v1-accounts.0-1.kv").exists());
    let tx = db.begin_ro().unwrap();
    let key = acct_key(3);
    assert_eq!(
        reader_a.get_as_of(DomainId::Accounts, &key, 150, &tx).unwrap(),
        reader_b.get_as_of(DomainId::Accounts, &key, 150, &tx).unwrap(),
    );
    drop(tx);

    // After pruning, a commitment leaf of a quiet key is served from the merged file and
    // carries a file coordinate that resolves back to the account key.
    prune_all(&agg, &db);
    {
        let tx = db.begin_ro().unwrap();
        let key = acct_key(3);
        let mut ckey = vec![DomainId::Accounts as u8];
        ckey.extend_from_slice(&key);
        let (raw, _) = reader_b
            .get_latest(DomainId::Commitment, &ckey, &tx)
            .unwrap()
            .expect("leaf present");
        let (referenced, _hash) = decode_leaf(&raw).unwrap();
        match &referenced {
            KeyRef::File { range, .. } => assert_eq!(*range, StepRange::new(0, 2)),
            KeyRef::Plain(plain) => assert_eq!(plain, &key),
        }
        assert_eq!(
            reader_b.resolve_commitment_ref(DomainId::Accounts, &referenced).unwrap(),
            key
        );
    }

    // Closing the last holder unlinks the superseded files.
    drop(reader_a);
    assert!(!snap.join("v1-accounts.0-1.kv").exists());
    assert!(!snap.join("v1-accounts.1-2.kv").exists());
    drop(reader_b);
    agg.close();
}
