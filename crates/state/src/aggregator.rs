//! The aggregator owns every domain and standalone inverted index and coordinates the
//! collate/build, merge and prune phases against the visible-file publication protocol.
//!
//! Build and merge are single-flight (CAS flags) background phases; publication swaps the
//! visible slices under the exclusive lock and refreshes the minimax txNum; pruning trims the
//! DB tail strictly below the minimax so every answer it removes is already served by files.

use crate::{
    config::{AggregatorConfig, Dirs, MAX_NON_FURIOUS_DIRTY_SPACE_PER_TX},
    domain::{Domain, DomainCollation, DomainFiles},
    files::StepRange,
    inverted_index::{InvertedIndex, InvertedIndexCollation},
    merge::{self, MergedFiles},
    prune::AggregatorPruneStat,
    tables,
    util::{run_tasks, BuildGate, CancelToken, LeakDetector, ProgressSet, Task},
    view::{AggregatorRoTx, DomainRoTx, InvertedIndexRoTx},
    DomainId, InvertedIdx, StateError, StateResult,
};
use parking_lot::{Mutex, RwLock};
use sediment_kv::{Database, DbTx, DbTxMut};
use std::{
    io::Write,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::*;

type OnFreeze = Arc<dyn Fn(Vec<String>) + Send + Sync>;

/// Completion signal of a background build round. The channel never carries data; the
/// receiving side unblocks when every sender went out of scope.
#[derive(Debug)]
pub struct BuildSignal(mpsc::Receiver<()>);

impl BuildSignal {
    fn pending() -> (mpsc::Sender<()>, Self) {
        let (sender, receiver) = mpsc::channel();
        (sender, Self(receiver))
    }

    fn finished() -> Self {
        let (_, receiver) = mpsc::channel();
        Self(receiver)
    }

    /// Blocks until the round (including its merge phase) finished.
    pub fn wait(&self) {
        let _ = self.0.recv();
    }

    /// Waits up to `timeout`; returns whether the round finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.0.recv_timeout(timeout), Err(mpsc::RecvTimeoutError::Timeout))
    }
}

pub struct Aggregator<D: Database> {
    db: Arc<D>,
    dirs: Dirs,
    cfg: AggregatorConfig,
    salt: u32,
    domains: Vec<Arc<Domain>>,
    iis: Vec<Arc<InvertedIndex>>,

    /// Shared by readers snapshotting, exclusive for the publication swap only.
    visible_files_lock: RwLock<()>,
    /// Greatest txNum below which every state domain has a visible file.
    visible_files_minimax_tx: AtomicU64,
    building_files: AtomicBool,
    merging_files: AtomicBool,
    produce: AtomicBool,
    no_merge: AtomicBool,
    build_gate: Mutex<Option<Arc<BuildGate>>>,

    cancel: CancelToken,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    closed: AtomicBool,

    on_freeze: Mutex<OnFreeze>,
    progress: ProgressSet,
    leak_detector: LeakDetector,
    rotx_auto_increment: AtomicU64,
}

impl<D: Database> std::fmt::Debug for Aggregator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("step_size", &self.cfg.step_size)
            .field("minimax_tx", &self.visible_files_minimax_tx.load(Ordering::Relaxed))
            .field("building", &self.building_files.load(Ordering::Relaxed))
            .field("merging", &self.merging_files.load(Ordering::Relaxed))
            .finish()
    }
}

impl<D: Database> Aggregator<D> {
    pub fn new(dirs: Dirs, cfg: AggregatorConfig, db: Arc<D>) -> StateResult<Arc<Self>> {
        let salt = get_state_indices_salt(&dirs.snap)?;
        let mut domains = Vec::with_capacity(tables::DOMAIN_COUNT);
        for id in DomainId::ALL {
            domains.push(Arc::new(Domain::new(
                dirs.snap.clone(),
                dirs.tmp.clone(),
                id,
                cfg.step_size,
                cfg.steps_in_frozen_file,
                cfg.keep_recent_txns_of_histories_with_disabled_snapshots,
                salt,
                cfg.fsync,
            )));
        }
        let iis = InvertedIdx::ALL
            .into_iter()
            .map(|idx| {
                Arc::new(InvertedIndex::new(
                    dirs.snap.clone(),
                    idx.name(),
                    idx.tables(),
                    cfg.step_size,
                    cfg.steps_in_frozen_file,
                    salt,
                    cfg.fsync,
                ))
            })
            .collect();

        Ok(Arc::new(Self {
            db,
            salt,
            domains,
            iis,
            visible_files_lock: RwLock::new(()),
            visible_files_minimax_tx: AtomicU64::new(0),
            building_files: AtomicBool::new(false),
            merging_files: AtomicBool::new(false),
            produce: AtomicBool::new(cfg.produce),
            no_merge: AtomicBool::new(false),
            build_gate: Mutex::new(None),
            cancel: CancelToken::new(),
            handles: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            on_freeze: Mutex::new(Arc::new(|_frozen: Vec<String>| {})),
            progress: ProgressSet::new(),
            leak_detector: LeakDetector::new(cfg.slow_view_threshold),
            rotx_auto_increment: AtomicU64::new(0),
            dirs,
            cfg,
        }))
    }

    pub const fn step_size(&self) -> u64 {
        self.cfg.step_size
    }

    pub const fn config(&self) -> &AggregatorConfig {
        &self.cfg
    }

    pub fn first_tx_num_of_step(&self, step: u64) -> u64 {
        step * self.cfg.step_size
    }

    pub const fn dirs(&self) -> &Dirs {
        &self.dirs
    }

    pub const fn salt(&self) -> u32 {
        self.salt
    }

    pub fn db(&self) -> &Arc<D> {
        &self.db
    }

    pub fn end_tx_num_minimax(&self) -> u64 {
        self.visible_files_minimax_tx.load(Ordering::Acquire)
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn on_freeze(&self, f: impl Fn(Vec<String>) + Send + Sync + 'static) {
        *self.on_freeze.lock() = Arc::new(f);
    }

    pub fn set_produce(&self, produce: bool) {
        self.produce.store(produce, Ordering::SeqCst);
    }

    /// Prohibits merges entirely. Debug/test knob.
    pub fn set_no_merge(&self, no_merge: bool) {
        self.no_merge.store(no_merge, Ordering::SeqCst);
    }

    /// Optionally gates build phases against external snapshot jobs.
    pub fn set_build_gate(&self, gate: Arc<BuildGate>) {
        *self.build_gate.lock() = Some(gate);
    }

    /// Bounds the recent-txn window kept in DB for histories with disabled snapshots.
    pub fn keep_recent_txns_of_histories_with_disabled_snapshots(&self, recent: u64) {
        for d in &self.domains {
            if d.hist.snapshots_disabled {
                d.hist.keep_recent_txns.store(recent, Ordering::Relaxed);
            }
        }
    }

    pub fn has_background_files_build(&self) -> bool {
        self.building_files.load(Ordering::SeqCst) || self.merging_files.load(Ordering::SeqCst)
    }

    pub fn background_progress(&self) -> String {
        self.progress.status()
    }

    pub(crate) fn progress(&self) -> &ProgressSet {
        &self.progress
    }

    pub(crate) fn leak_detector(&self) -> &LeakDetector {
        &self.leak_detector
    }

    pub(crate) fn merge_workers(&self) -> usize {
        self.cfg.merge_workers
    }

    pub(crate) fn commitment_values_transform(&self) -> bool {
        self.cfg.commitment_values_transform
    }

    pub(crate) fn domain_entity(&self, id: DomainId) -> &Arc<Domain> {
        &self.domains[id.index()]
    }

    pub(crate) fn index_entity(&self, pos: usize) -> &Arc<InvertedIndex> {
        &self.iis[pos]
    }

    pub(crate) fn search_index(&self, idx: InvertedIdx) -> &Arc<InvertedIndex> {
        self.iis
            .iter()
            .find(|ii| ii.name == idx.name())
            .expect("every index is registered at construction")
    }

    pub(crate) fn restrict_subset_file_deletions(&self, restrict: bool) {
        for id in [DomainId::Accounts, DomainId::Storage, DomainId::Commitment] {
            self.domains[id.index()]
                .restrict_subset_file_deletions
                .store(restrict, Ordering::Release);
        }
    }

    /// Scans the snapshot directory, opens every file concurrently and republishes the
    /// visible sets. Span-1 accounts/storage/code values files without their commitment
    /// counterpart are rejected (a crash between the two writes must not skew the root).
    pub fn open_folder(self: &Arc<Self>) -> StateResult<()> {
        let commitment = self.domains[DomainId::Commitment.index()].clone();
        let mut tasks: Vec<Task<'_>> = Vec::new();
        for d in &self.domains {
            let id = d.id;
            let commitment = commitment.clone();
            let cancel = self.cancel.clone();
            tasks.push(Box::new(move || {
                cancel.check()?;
                d.files.open_folder(|range| {
                    domain_integrity_check(id, range, &commitment)
                })?;
                d.hist.files.open_folder(|_| true)?;
                d.hist.ii.files.open_folder(|_| true)?;
                Ok(())
            }));
        }
        for ii in &self.iis {
            tasks.push(Box::new(move || ii.files.open_folder(|_| true)));
        }
        run_tasks(self.domains.len() + self.iis.len(), tasks)?;

        self.recalc_visible_files(self.dirty_files_end_tx_minimax());
        Ok(())
    }

    /// Builds every missing accessor sidecar under a bounded worker group, then republishes.
    pub fn build_missed_accessors(self: &Arc<Self>, workers: usize) -> StateResult<()> {
        let started = Instant::now();
        let mut tasks: Vec<Task<'_>> = Vec::new();

        for d in &self.domains {
            for (set, with_filter) in
                [(&d.files, true), (&d.hist.files, false), (&d.hist.ii.files, false)]
            {
                for range in set.missed_accessor_ranges() {
                    let salt = self.salt;
                    let fsync = self.cfg.fsync;
                    let cancel = self.cancel.clone();
                    let progress = &self.progress;
                    tasks.push(Box::new(move || {
                        cancel.check()?;
                        let _guard = progress.add(format!("accessor {range}"), 1);
                        set.build_missed_accessor(range, salt, with_filter, fsync)
                    }));
                }
            }
        }
        for ii in &self.iis {
            for range in ii.files.missed_accessor_ranges() {
                let salt = self.salt;
                let fsync = self.cfg.fsync;
                let cancel = self.cancel.clone();
                tasks.push(Box::new(move || {
                    cancel.check()?;
                    ii.files.build_missed_accessor(range, salt, false, fsync)
                }));
            }
        }
        if tasks.is_empty() {
            return Ok(())
        }
        info!(target: "state", count = tasks.len(), "building missed accessors");
        run_tasks(workers, tasks)?;
        info!(target: "state", took = ?started.elapsed(), "missed accessors built");

        self.recalc_visible_files(self.dirty_files_end_tx_minimax());
        Ok(())
    }

    /// Consistent snapshot of every entity's visible files.
    pub fn begin_files_ro(self: &Arc<Self>) -> AggregatorRoTx<D> {
        let _shared = self.visible_files_lock.read();
        let d = self.domains.iter().map(DomainRoTx::new).collect();
        let iis = self.iis.iter().map(InvertedIndexRoTx::new).collect();
        AggregatorRoTx {
            a: Some(self.clone()),
            d,
            iis,
            id: self.rotx_auto_increment.fetch_add(1, Ordering::Relaxed) + 1,
            leak_id: self.leak_detector.register(),
        }
    }

    /// Smallest end txNum of the state domains' gap-free dirty chains.
    pub(crate) fn dirty_files_end_tx_minimax(&self) -> u64 {
        DomainId::STATE
            .iter()
            .map(|id| self.domains[id.index()].files.dirty_end_tx())
            .min()
            .unwrap_or_default()
    }

    /// Publishes new visible slices limited to `to_tx` and refreshes the minimax.
    pub(crate) fn recalc_visible_files(&self, to_tx: u64) {
        {
            let _exclusive = self.visible_files_lock.write();
            for d in &self.domains {
                d.files.recalc_visible(to_tx);
                d.hist.files.recalc_visible(to_tx);
                d.hist.ii.files.recalc_visible(to_tx);
            }
            for ii in &self.iis {
                ii.files.recalc_visible(to_tx);
            }
        }
        let minimax = DomainId::STATE
            .iter()
            .map(|id| self.domains[id.index()].files.visible_end_tx())
            .min()
            .unwrap_or_default();
        self.visible_files_minimax_tx.store(minimax, Ordering::Release);
    }

    /// Kicks off the background collate/build round covering everything below `tx_num`.
    /// Returns a signal that closes once the round, including its merge phase, is done. The
    /// signal is already closed when there is nothing to do or a round is in flight.
    pub fn build_files_in_background(self: &Arc<Self>, tx_num: u64) -> BuildSignal {
        if !self.produce.load(Ordering::SeqCst) {
            return BuildSignal::finished()
        }
        if (tx_num + 1) <= self.end_tx_num_minimax() + self.cfg.step_size {
            return BuildSignal::finished()
        }
        if !self.try_start_building() {
            return BuildSignal::finished()
        }

        let (done, signal) = BuildSignal::pending();
        let step = self.end_tx_num_minimax() / self.cfg.step_size;
        let this = self.clone();
        self.spawn(move || {
            let _building = FlagGuard(&this.building_files);
            // Blocking on the gate is fine, we are inside our own thread.
            let _gate_permit =
                this.build_gate.lock().clone().map(|gate| gate.acquire_owned());

            let last_in_db = this.last_step_in_db();
            debug!(target: "state", step, last_in_db, "build round starting");
            if last_in_db <= step {
                // `step` must be fully written: step+1 records have to be visible in DB.
                return
            }

            // Create as many small step files as possible: reduces merge pressure and lets
            // the DB shed old data early. New data may commit while building, so the last
            // step in DB is re-read each iteration.
            let mut step = step;
            while step < this.last_step_in_db() {
                if let Err(err) = this.build_files_step(step) {
                    if !err.is_cancelled() {
                        warn!(target: "state", %err, step, "background file build failed");
                    }
                    break
                }
                step += 1;
            }

            let merger = this.clone();
            merger.clone().spawn(move || {
                if let Err(err) = merger.merge_loop() {
                    if !err.is_cancelled() {
                        warn!(target: "state", %err, "background merge failed");
                    }
                }
                drop(done);
            });
        });
        signal
    }

    /// Foreground wrapper: starts the background round and waits for it, logging progress.
    pub fn build_files(self: &Arc<Self>, to_tx_num: u64) -> StateResult<()> {
        let signal = self.build_files_in_background(to_tx_num);
        if !self.has_background_files_build() {
            return Ok(())
        }
        loop {
            self.cancel.check()?;
            if signal.wait_timeout(Duration::from_secs(20)) {
                return Ok(())
            }
            if !self.has_background_files_build() {
                return Ok(())
            }
            if self.progress.has() {
                info!(target: "state", progress = %self.progress.status(), "files build");
            }
        }
    }

    /// Builds the `[from_step, to_step)` range directly, in the background.
    pub fn build_files_in_range(self: &Arc<Self>, from_step: u64, to_step: u64) -> BuildSignal {
        if !self.try_start_building() {
            return BuildSignal::finished()
        }
        let (done, signal) = BuildSignal::pending();
        let this = self.clone();
        self.spawn(move || {
            let _building = FlagGuard(&this.building_files);
            if to_step > from_step {
                info!(target: "state", from_step, to_step, "build range");
            }
            for step in from_step..to_step {
                if let Err(err) = this.build_files_step(step) {
                    if !err.is_cancelled() {
                        warn!(target: "state", %err, step, "file build failed");
                    }
                    break
                }
            }
            let merger = this.clone();
            merger.clone().spawn(move || {
                if let Err(err) = merger.merge_loop() {
                    if !err.is_cancelled() {
                        warn!(target: "state", %err, "merge failed");
                    }
                }
                drop(done);
            });
        });
        signal
    }

    /// Collates and builds every entity's files for one step, then integrates and publishes.
    fn build_files_step(self: &Arc<Self>, step: u64) -> StateResult<()> {
        self.cancel.check()?;
        let started = Instant::now();
        debug!(
            target: "state",
            step,
            collate_workers = self.cfg.collate_and_build_workers,
            merge_workers = self.cfg.merge_workers,
            "collate and build",
        );

        let domain_slots: Vec<Mutex<Option<DomainFiles>>> =
            self.domains.iter().map(|_| Mutex::new(None)).collect();
        let ii_slots: Vec<Mutex<Option<Arc<crate::files::FileItem>>>> =
            self.iis.iter().map(|_| Mutex::new(None)).collect();

        let result = {
            let mut tasks: Vec<Task<'_>> = Vec::new();
            for (d, slot) in self.domains.iter().zip(domain_slots.iter()) {
                if d.files.first_step_not_in_files() > step {
                    continue
                }
                let this = self;
                tasks.push(Box::new(move || {
                    this.cancel.check()?;
                    let collation: DomainCollation = {
                        let tx = this.db.begin_ro()?;
                        d.collate(&tx, step)?
                    };
                    let files = d.build_files(step, collation, &this.progress)?;
                    *slot.lock() = Some(files);
                    Ok(())
                }));
            }
            for (ii, slot) in self.iis.iter().zip(ii_slots.iter()) {
                if ii.files.first_step_not_in_files() > step {
                    continue
                }
                let this = self;
                tasks.push(Box::new(move || {
                    this.cancel.check()?;
                    let collation: InvertedIndexCollation = {
                        let tx = this.db.begin_ro()?;
                        ii.collate(&tx, step)?
                    };
                    let files = ii.build_files(step, collation, &this.progress)?;
                    *slot.lock() = Some(files);
                    Ok(())
                }));
            }
            run_tasks(self.cfg.collate_and_build_workers, tasks)
        };

        if let Err(err) = result {
            // Clean all partial outputs of the failed round.
            for slot in &domain_slots {
                if let Some(files) = slot.lock().take() {
                    files.cleanup_on_error();
                }
            }
            for slot in &ii_slots {
                if let Some(item) = slot.lock().take() {
                    item.delete_from_disk();
                }
            }
            return Err(err)
        }

        for (d, slot) in self.domains.iter().zip(domain_slots) {
            if let Some(files) = slot.into_inner() {
                d.integrate_files(files);
            }
        }
        for (ii, slot) in self.iis.iter().zip(ii_slots) {
            if let Some(item) = slot.into_inner() {
                ii.files.integrate(item);
            }
        }
        self.recalc_visible_files(self.dirty_files_end_tx_minimax());
        info!(target: "state", step, took = ?started.elapsed(), "aggregated");
        Ok(())
    }

    /// Merges pending neighbor files until no window is proposed. Single-flight; a no-op
    /// while merges are prohibited.
    pub fn merge_loop(self: &Arc<Self>) -> StateResult<()> {
        if self.no_merge.load(Ordering::SeqCst) ||
            self.merging_files
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Ok(())
        }
        let _merging = FlagGuard(&self.merging_files);
        loop {
            self.cancel.check()?;
            if !self.merge_loop_step(self.end_tx_num_minimax())? {
                return Ok(())
            }
        }
    }

    fn merge_loop_step(self: &Arc<Self>, to_tx: u64) -> StateResult<bool> {
        let at = self.begin_files_ro();
        let max_span = self.cfg.steps_in_frozen_file * self.cfg.step_size;

        let ranges = merge::find_merge_ranges(&at, to_tx, max_span);
        if !ranges.any() {
            return Ok(false)
        }
        let selected = merge::selected_files(&at, &ranges)?;
        let merged = merge::merge_files(self, &at, &selected, &ranges)?;

        self.integrate_merged_files(&merged);
        self.recalc_visible_files(self.dirty_files_end_tx_minimax());
        self.clean_after_merge(&merged);

        let frozen = merged.frozen_list();
        if !frozen.is_empty() {
            (self.on_freeze.lock().clone())(frozen);
        }
        Ok(true)
    }

    fn integrate_merged_files(&self, merged: &MergedFiles) {
        for (d, slot) in self.domains.iter().zip(merged.domains.iter()) {
            if let Some(files) = slot {
                d.integrate_merged_files(files);
            }
        }
        for (ii, slot) in self.iis.iter().zip(merged.indices.iter()) {
            if let Some(item) = slot {
                ii.files.integrate(item.clone());
            }
        }
    }

    fn clean_after_merge(&self, merged: &MergedFiles) {
        for (d, slot) in self.domains.iter().zip(merged.domains.iter()) {
            if let Some(files) = slot {
                d.clean_after_merge(files);
            }
        }
        for (ii, slot) in self.iis.iter().zip(merged.indices.iter()) {
            if let Some(item) = slot {
                ii.files.clean_after_merge(item, false);
            }
        }
    }

    /// Wipes execution progress: every domain table and the block boundary table. Used when
    /// the DB is reset while files remain; the next commitment starts from the genesis root.
    pub fn reset_exec(&self, tx: &mut D::TxMut) -> StateResult<()> {
        for id in DomainId::ALL {
            let t = id.tables();
            for table in [t.values, t.history_vals, t.idx_keys, t.idx_vals] {
                tx.clear(table)?;
            }
        }
        for idx in InvertedIdx::ALL {
            let t = idx.tables();
            tx.clear(t.keys)?;
            tx.clear(t.vals)?;
        }
        for table in tables::EXEC_TABLES {
            tx.clear(table)?;
        }
        info!(target: "state", "execution progress reset");
        Ok(())
    }

    /// Cancels background work, waits for it, closes every file and republishes the (now
    /// empty) visible sets. Safe to call multiple times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return
        }
        self.cancel.cancel();
        // A draining background thread may spawn its merge sibling while we join, so drain
        // until the list stays empty.
        loop {
            let handles: Vec<_> = self.handles.lock().drain(..).collect();
            if handles.is_empty() {
                break
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
        for d in &self.domains {
            d.files.close();
            d.hist.files.close();
            d.hist.ii.files.close();
        }
        for ii in &self.iis {
            ii.files.close();
        }
        self.recalc_visible_files(0);
        if self.leak_detector.open_count() > 0 {
            warn!(target: "state", open = self.leak_detector.open_count(), "read views leaked across close");
        }
    }

    fn try_start_building(&self) -> bool {
        self.building_files.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    /// Greatest step fully present in the DB, judged across the state domains plus the
    /// history-less commitment domain.
    fn last_step_in_db(&self) -> u64 {
        let last = (|| -> StateResult<u64> {
            let tx = self.db.begin_ro()?;
            let mut last = 0u64;
            for id in DomainId::STATE {
                last = last.max(self.domains[id.index()].max_step_in_db(&tx)?);
            }
            last = last
                .max(self.domains[DomainId::Commitment.index()].max_step_in_db_no_history(&tx)?);
            Ok(last)
        })();
        match last {
            Ok(last) => last,
            Err(err) => {
                warn!(target: "state", %err, "failed to read last step in DB");
                0
            }
        }
    }

    fn spawn(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        if self.cancel.is_cancelled() {
            return
        }
        let handle = thread::spawn(f);
        self.handles.lock().push(handle);
    }
}

impl<D: Database> AggregatorRoTx<D> {
    fn agg(&self) -> &Arc<Aggregator<D>> {
        self.a.as_ref().expect("view is open")
    }

    /// Whether anything below `until_tx` is still prunable from the DB tail.
    pub fn can_prune<T: DbTx>(&self, tx: &T, until_tx: u64) -> StateResult<bool> {
        for d in &self.d {
            if d.d.can_prune_until(tx, until_tx)? {
                return Ok(true)
            }
        }
        for ii in &self.iis {
            if ii.ii.can_prune(tx, until_tx)? {
                return Ok(true)
            }
        }
        Ok(false)
    }

    /// One prune iteration: deletes up to `limit` rows per entity, strictly below the visible
    /// minimax so every removed answer is already served by files. `None` means nothing was
    /// prunable. The whole iteration commits or aborts with the caller's transaction.
    pub fn prune<T: DbTxMut>(
        &self,
        tx: &mut T,
        limit: u64,
    ) -> StateResult<Option<AggregatorPruneStat>> {
        let limit = if limit == 0 { u64::MAX } else { limit };
        // txFrom is always 0 to avoid dangling keys in indices and history.
        let tx_from = 0;
        let tx_to = self.agg().end_tx_num_minimax();
        if tx_to == 0 || !self.can_prune(tx, tx_to)? {
            return Ok(None)
        }
        // tx_to is the first txNum of the next step; go one back for the step number.
        let step = (tx_to - 1) / self.agg().step_size();

        let mut stat = AggregatorPruneStat::default();
        for d in &self.d {
            let domain_stat = d.d.prune(tx, step, tx_from, tx_to, limit)?;
            stat.domains.insert(d.d.id.name().to_string(), domain_stat);
        }
        for ii in &self.iis {
            let ii_stat = ii.ii.prune(tx, tx_from, tx_to, limit)?;
            stat.indices.insert(ii.ii.name.clone(), ii_stat);
        }
        Ok(Some(stat))
    }

    /// Fills `timeout` with pruning by small batches.
    ///
    /// Long timeouts classify the run as furious (huge fixed batches) or aggressive (batch
    /// size adapted to iteration latency); the default gentle mode additionally yields as
    /// soon as the transaction's dirty space would make the commit expensive. Returns whether
    /// more work remained when the timeout struck. Each iteration is deliberately not
    /// cancellable: a prune either removes all rows related to a key range or none of them.
    pub fn prune_small_batches<T: DbTxMut>(
        &self,
        timeout: Duration,
        tx: &mut T,
    ) -> StateResult<bool> {
        let furious_prune = timeout > Duration::from_secs(5 * 3600);
        let aggressive_prune = !furious_prune && timeout >= Duration::from_secs(60);

        let mut prune_limit: u64 = if furious_prune { 1_000_000 } else { 1_000 };

        let started = Instant::now();
        let log_period = Duration::from_secs(30);
        let mut last_log = Instant::now();
        let mut full_stat = AggregatorPruneStat::default();

        loop {
            if !furious_prune && !aggressive_prune {
                if tx.space_dirty()? > MAX_NON_FURIOUS_DIRTY_SPACE_PER_TX {
                    return Ok(false)
                }
            }
            let iteration_started = Instant::now();
            let stat = self.prune(tx, prune_limit)?;
            match stat {
                Some(stat) if !stat.pruned_nothing() => full_stat.accumulate(&stat),
                _ => {
                    if !full_stat.pruned_nothing() {
                        info!(
                            target: "state",
                            took = ?started.elapsed(),
                            stat = %full_stat,
                            "prune small batches finished",
                        );
                    }
                    return Ok(false)
                }
            }

            if aggressive_prune {
                let took = iteration_started.elapsed();
                if took < Duration::from_secs(2) {
                    prune_limit *= 10;
                }
                if took > log_period {
                    // Integer division may reach 0, which `prune` reads as unlimited.
                    prune_limit /= 10;
                }
            }

            if started.elapsed() >= timeout {
                return Ok(true)
            }
            if last_log.elapsed() >= log_period {
                info!(
                    target: "state",
                    until_commit = ?timeout.saturating_sub(started.elapsed()),
                    prune_limit,
                    aggregated_step = self.steps_in_files(&DomainId::STATE),
                    pruned = %full_stat,
                    "pruning state",
                );
                last_log = Instant::now();
            }
            self.agg().cancel_token().check()?;
        }
    }

    /// Span of steps still sitting in the DB tail, per entity. Diagnostics for prune logs.
    pub fn steps_range_in_db<T: DbTx>(&self, tx: &T) -> StateResult<String> {
        let step_size = self.agg().step_size();
        let mut parts = Vec::with_capacity(self.d.len() + self.iis.len());
        for d in &self.d {
            let min = d.d.hist.ii.min_tx_in_db(tx)?;
            let max = d.d.hist.ii.max_tx_in_db(tx)?;
            parts.push(format!(
                "{}:{:.1}",
                d.d.id.name(),
                max.saturating_sub(min) as f64 / step_size as f64
            ));
        }
        for ii in &self.iis {
            let min = ii.ii.min_tx_in_db(tx)?;
            let max = ii.ii.max_tx_in_db(tx)?;
            parts.push(format!(
                "{}:{:.1}",
                ii.ii.name,
                max.saturating_sub(min) as f64 / step_size as f64
            ));
        }
        Ok(parts.join(", "))
    }
}

/// Resets a single-flight CAS flag when the owning phase ends, panics included.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Integrity check ran while opening a datadir: a freshly built (span-1) accounts, storage or
/// code values file is only usable when the commitment file of the same range exists on disk.
/// After a crash between the two writes the orphan is ignored and rebuilt from DB.
fn domain_integrity_check(id: DomainId, range: StepRange, commitment: &Domain) -> bool {
    match id {
        DomainId::Accounts | DomainId::Storage | DomainId::Code => {
            // Only freshly built files are suspect; merged spans imply the round completed.
            range.span() > 1 || commitment.files.data_path(range).exists()
        }
        DomainId::Commitment => true,
    }
}

/// Reads the accessor salt, creating and fsyncing it on first use.
fn get_state_indices_salt(snap_dir: &Path) -> StateResult<u32> {
    let path = snap_dir.join("salt-state.txt");
    if !path.exists() {
        let salt: u32 = rand::random();
        let mut file = std::fs::File::create(&path)?;
        file.write_all(&salt.to_be_bytes())?;
        file.sync_all()?;
        return Ok(salt)
    }
    let raw = std::fs::read(&path)?;
    let bytes: [u8; 4] = raw
        .as_slice()
        .try_into()
        .map_err(|_| StateError::Corrupt("salt-state.txt is not 4 bytes".to_string()))?;
    Ok(u32::from_be_bytes(bytes))
}

