//! Merge planning and execution.
//!
//! Neighbor files merge into power-of-two aligned spans capped at the frozen span. The
//! commitment domain is coupled to accounts and storage: merged ranges must line up, and its
//! value transformer resolves stored key references against the freshly merged files, so the
//! commitment task waits behind an accounts+storage barrier and subset deletions stay
//! restricted while it runs.

use crate::{
    aggregator::Aggregator,
    commitment::{self, ValueTransformer},
    domain::{DomainMergedFiles, DomainRanges},
    files::{find_merge_range_in, latest_merged_range_in, FileItem, StepRange},
    tables::DOMAIN_COUNT,
    util::{run_tasks, Latch, Task},
    AggregatorRoTx, DomainId, StateError, StateResult,
};
use parking_lot::Mutex;
use sediment_kv::Database;
use std::{fmt, sync::Arc};
use tracing::*;

/// Merge windows selected for one round.
#[derive(Debug, Default)]
pub(crate) struct MergeRanges {
    pub(crate) domains: [DomainRanges; DOMAIN_COUNT],
    pub(crate) indices: Vec<Option<StepRange>>,
}

impl MergeRanges {
    pub(crate) fn any(&self) -> bool {
        self.domains.iter().any(|d| d.any()) || self.indices.iter().any(|r| r.is_some())
    }
}

impl fmt::Display for MergeRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (id, ranges) in DomainId::ALL.iter().zip(self.domains.iter()) {
            if let Some(range) = ranges.values {
                parts.push(format!("{}({range})", id.name()));
            }
            if let Some(range) = ranges.history {
                parts.push(format!("{}-hist({range})", id.name()));
            }
        }
        for (pos, range) in self.indices.iter().enumerate() {
            if let Some(range) = range {
                parts.push(format!("idx{pos}({range})"));
            }
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Inputs selected for one merge round, taken from the view's snapshot.
pub(crate) struct SelectedMergeFiles {
    pub(crate) domains: [SelectedDomainFiles; DOMAIN_COUNT],
    pub(crate) indices: Vec<Vec<Arc<FileItem>>>,
}

#[derive(Default)]
pub(crate) struct SelectedDomainFiles {
    pub(crate) kv: Vec<Arc<FileItem>>,
    pub(crate) v: Vec<Arc<FileItem>>,
    pub(crate) ef: Vec<Arc<FileItem>>,
}

/// Outputs of one merge round.
#[derive(Default)]
pub(crate) struct MergedFiles {
    pub(crate) domains: Vec<Option<DomainMergedFiles>>,
    pub(crate) indices: Vec<Option<Arc<FileItem>>>,
}

impl MergedFiles {
    pub(crate) fn cleanup_on_error(&self) {
        for merged in self.domains.iter().flatten() {
            merged.cleanup_on_error();
        }
        for merged in self.indices.iter().flatten() {
            merged.delete_from_disk();
        }
    }

    /// Names of the newly frozen files, for the freeze notification.
    pub(crate) fn frozen_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        for merged in self.domains.iter().flatten() {
            if let Some(kv) = &merged.kv {
                if kv.frozen {
                    out.push(kv.file_name());
                }
            }
            if let Some(hist) = &merged.hist {
                for item in [&hist.v, &hist.ef] {
                    if item.frozen {
                        out.push(item.file_name());
                    }
                }
            }
        }
        for merged in self.indices.iter().flatten() {
            if merged.frozen {
                out.push(merged.file_name());
            }
        }
        out
    }
}

/// Proposes the widest merge windows ending at or before `max_end_tx`, enforcing the
/// commitment coupling rules.
pub(crate) fn find_merge_ranges<D: Database>(
    at: &AggregatorRoTx<D>,
    mut max_end_tx: u64,
    max_span: u64,
) -> MergeRanges {
    let a = at.a.as_ref().expect("open view");
    let step_size = a.step_size();
    let mut ranges = MergeRanges {
        domains: Default::default(),
        indices: vec![None; at.iis.len()],
    };

    if a.commitment_values_transform() {
        let lmr_acc = latest_merged_range_in(&at.domain(DomainId::Accounts).kv_files);
        let lmr_sto = latest_merged_range_in(&at.domain(DomainId::Storage).kv_files);
        let lmr_com = latest_merged_range_in(&at.domain(DomainId::Commitment).kv_files);
        if lmr_com != lmr_acc || lmr_com != lmr_sto {
            // No further merge progress until the coupled ranges line up again.
            let reached = [lmr_acc, lmr_sto, lmr_com]
                .into_iter()
                .flatten()
                .map(|range| range.tx_to(step_size))
                .max()
                .unwrap_or_default();
            max_end_tx = max_end_tx.min(reached);
            warn!(
                target: "state",
                to = max_end_tx / step_size,
                ?lmr_acc, ?lmr_sto, ?lmr_com,
                "findMergeRange: holding further merges",
            );
        }
    }

    for id in DomainId::ALL {
        let d = at.domain(id);
        ranges.domains[id.index()] = DomainRanges {
            values: find_merge_range_in(&d.kv_files, step_size, max_end_tx, max_span),
            history: if d.d.hist.snapshots_disabled {
                None
            } else {
                find_merge_range_in(&d.v_files, step_size, max_end_tx, max_span)
            },
        };
    }

    if a.commitment_values_transform() {
        if let Some(commitment_range) = ranges.domains[DomainId::Commitment.index()].values {
            let mut restore_prev_range = false;
            for id in DomainId::ALL {
                if id == DomainId::Commitment {
                    continue
                }
                let dr = ranges.domains[id.index()].values;
                if dr == Some(commitment_range) {
                    continue
                }
                // Commitment may run behind if an earlier round was interrupted. When the
                // other domain already has the file commitment needs, hold that domain's
                // values merge for this round; otherwise cancel values merges entirely.
                let behind = match dr {
                    None => true,
                    Some(range) => commitment_range.to_step < range.from_step,
                };
                if behind {
                    if at.a.as_ref().expect("open view").domain_entity(id).files
                        .dirty_file_by_range(commitment_range)
                        .is_some()
                    {
                        debug!(
                            target: "state",
                            domain = id.name(),
                            commitment = %commitment_range,
                            "findMergeRange: range differs but file exists, holding domain merge",
                        );
                        ranges.domains[id.index()].values = None;
                        continue
                    }
                    restore_prev_range = true;
                }
            }
            if restore_prev_range {
                debug!(
                    target: "state",
                    commitment = %commitment_range,
                    "findMergeRange: commitment range differs, cancelling values merges",
                );
                for dr in ranges.domains.iter_mut() {
                    dr.values = None;
                }
            }
        }
    }

    for (pos, ii) in at.iis.iter().enumerate() {
        ranges.indices[pos] = find_merge_range_in(&ii.files, step_size, max_end_tx, max_span);
    }
    ranges
}

/// Collects the merge inputs out of the view's snapshot, verifying contiguity.
pub(crate) fn selected_files<D: Database>(
    at: &AggregatorRoTx<D>,
    ranges: &MergeRanges,
) -> StateResult<SelectedMergeFiles> {
    let a = at.a.as_ref().expect("open view");
    let step_size = a.step_size();
    let mut selected = SelectedMergeFiles {
        domains: Default::default(),
        indices: vec![Vec::new(); at.iis.len()],
    };
    for id in DomainId::ALL {
        let d = at.domain(id);
        let dr = &ranges.domains[id.index()];
        if let Some(range) = dr.values {
            selected.domains[id.index()].kv = files_in_range(&d.kv_files, range, step_size)?;
        }
        if let Some(range) = dr.history {
            selected.domains[id.index()].v = files_in_range(&d.v_files, range, step_size)?;
            selected.domains[id.index()].ef = files_in_range(&d.ef_files, range, step_size)?;
        }
    }
    for (pos, ii) in at.iis.iter().enumerate() {
        if let Some(range) = ranges.indices[pos] {
            selected.indices[pos] = files_in_range(&ii.files, range, step_size)?;
        }
    }
    Ok(selected)
}

fn files_in_range(
    files: &[Arc<FileItem>],
    range: StepRange,
    step_size: u64,
) -> StateResult<Vec<Arc<FileItem>>> {
    let mut out = Vec::new();
    let mut next_tx = range.tx_from(step_size);
    for item in files {
        if item.start_tx < next_tx || item.end_tx > range.tx_to(step_size) {
            continue
        }
        if item.start_tx != next_tx {
            return Err(StateError::InvariantViolation(format!(
                "merge source gap at tx {next_tx} in {range}"
            )))
        }
        next_tx = item.end_tx;
        out.push(item.clone());
    }
    if next_tx != range.tx_to(step_size) {
        return Err(StateError::InvariantViolation(format!("merge sources do not cover {range}")))
    }
    Ok(out)
}

/// Runs the merge tasks under the bounded worker group. Accounts and storage are submitted
/// before commitment; the commitment task waits on the barrier, builds its value transformer
/// against the merged files and runs with subset deletions restricted.
pub(crate) fn merge_files<D: Database>(
    a: &Aggregator<D>,
    at: &AggregatorRoTx<D>,
    selected: &SelectedMergeFiles,
    ranges: &MergeRanges,
) -> StateResult<MergedFiles> {
    info!(target: "state", ranges = %ranges, "merge state");

    let transform = a.commitment_values_transform();
    let barrier_count = [DomainId::Accounts, DomainId::Storage]
        .iter()
        .filter(|id| ranges.domains[id.index()].any())
        .count();
    let acc_storage_merged = Latch::new(if transform { barrier_count } else { 0 });

    let merged_domains: Vec<Mutex<Option<DomainMergedFiles>>> =
        (0..DOMAIN_COUNT).map(|_| Mutex::new(None)).collect();
    let merged_indices: Vec<Mutex<Option<Arc<FileItem>>>> =
        (0..at.iis.len()).map(|_| Mutex::new(None)).collect();

    let result = {
        let mut tasks: Vec<Task<'_>> = Vec::new();
        for id in DomainId::ALL {
            let dr = ranges.domains[id.index()];
            if !dr.any() {
                continue
            }
            let domain = a.domain_entity(id);
            let sel = &selected.domains[id.index()];
            let slot = &merged_domains[id.index()];
            let barrier = &acc_storage_merged;
            let merged_domains = &merged_domains;
            tasks.push(Box::new(move || {
                let mut transformer: Option<ValueTransformer> = None;
                if transform && id == DomainId::Commitment {
                    a.restrict_subset_file_deletions(true);
                    barrier.wait();
                    transformer = Some(build_commitment_transformer(
                        a,
                        at,
                        ranges,
                        selected,
                        merged_domains,
                    )?);
                }
                let result = domain.merge_files(
                    &sel.kv,
                    &sel.v,
                    &sel.ef,
                    dr,
                    transformer.as_ref(),
                    a.progress(),
                );
                // The result slot must be filled before the barrier opens: the commitment
                // transformer reads the merged accounts/storage files out of it.
                match result {
                    Ok(files) => {
                        *slot.lock() = Some(files);
                        if transform {
                            if matches!(id, DomainId::Accounts | DomainId::Storage) {
                                barrier.count_down();
                            }
                            if id == DomainId::Commitment {
                                a.restrict_subset_file_deletions(false);
                            }
                        }
                        Ok(())
                    }
                    Err(err) => {
                        if transform && matches!(id, DomainId::Accounts | DomainId::Storage) {
                            barrier.count_down();
                        }
                        Err(err)
                    }
                }
            }));
        }
        for (pos, range) in ranges.indices.iter().enumerate() {
            let Some(range) = *range else { continue };
            let ii = a.index_entity(pos);
            let inputs = &selected.indices[pos];
            let slot = &merged_indices[pos];
            tasks.push(Box::new(move || {
                *slot.lock() = Some(ii.merge_files(inputs, range, a.progress())?);
                Ok(())
            }));
        }
        run_tasks(a.merge_workers(), tasks)
    };

    let merged = MergedFiles {
        domains: merged_domains.into_iter().map(|slot| slot.into_inner()).collect(),
        indices: merged_indices.into_iter().map(|slot| slot.into_inner()).collect(),
    };
    match result {
        Ok(()) => {
            info!(target: "state", ranges = %ranges, "merge state done");
            Ok(merged)
        }
        Err(err) => {
            warn!(target: "state", ranges = %ranges, %err, "merge state failed");
            merged.cleanup_on_error();
            Err(err)
        }
    }
}

/// The commitment transformer needs the post-merge accounts/storage files: either the ones
/// merged this round (published through the result slots by the barrier) or, when a domain
/// was held back, the pre-existing dirty file of the matching range.
fn build_commitment_transformer<D: Database>(
    a: &Aggregator<D>,
    at: &AggregatorRoTx<D>,
    ranges: &MergeRanges,
    selected: &SelectedMergeFiles,
    merged_domains: &[Mutex<Option<DomainMergedFiles>>],
) -> StateResult<ValueTransformer> {
    let commitment_range = ranges.domains[DomainId::Commitment.index()]
        .values
        .ok_or_else(|| {
            StateError::InvariantViolation("commitment transformer without values merge".into())
        })?;
    let new_file = |id: DomainId| -> Option<Arc<FileItem>> {
        let slot = merged_domains[id.index()].lock();
        if let Some(merged) = slot.as_ref().and_then(|m| m.kv.clone()) {
            return Some(merged)
        }
        a.domain_entity(id).files.dirty_file_by_range(commitment_range)
    };
    // Old coordinates may point into any pre-merge file the view still sees, including the
    // ones selected as merge sources.
    let mut old_accounts = at.domain(DomainId::Accounts).kv_files.as_ref().clone();
    old_accounts.extend(selected.domains[DomainId::Accounts.index()].kv.iter().cloned());
    let mut old_storage = at.domain(DomainId::Storage).kv_files.as_ref().clone();
    old_storage.extend(selected.domains[DomainId::Storage.index()].kv.iter().cloned());

    Ok(commitment::commitment_value_transform(
        old_accounts,
        old_storage,
        new_file(DomainId::Accounts),
        new_file(DomainId::Storage),
    ))
}
