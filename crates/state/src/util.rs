//! Small concurrency and diagnostics primitives shared across the engine.

use crate::{StateError, StateResult};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::*;

/// Cooperative cancellation token handed to every long-running loop and background job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns [`StateError::Cancelled`] once the token fired.
    pub fn check(&self) -> StateResult<()> {
        if self.is_cancelled() {
            return Err(StateError::Cancelled)
        }
        Ok(())
    }
}

pub(crate) type Task<'a> = Box<dyn FnOnce() -> StateResult<()> + Send + 'a>;

/// Runs `tasks` on at most `workers` threads, starting them in submission order.
///
/// Panics inside a task are caught at the worker boundary and surfaced as errors; the first
/// failure wins and cancels the remaining queue. Submission order matters to callers that
/// encode dependencies between tasks (the commitment merge waits on accounts and storage).
pub(crate) fn run_tasks(workers: usize, tasks: Vec<Task<'_>>) -> StateResult<()> {
    if tasks.is_empty() {
        return Ok(())
    }
    let workers = workers.max(1).min(tasks.len());
    let queue = Mutex::new(tasks.into_iter().collect::<VecDeque<_>>());
    let failed = Mutex::new(None::<StateError>);
    let abort = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                if abort.load(Ordering::SeqCst) {
                    return
                }
                let Some(task) = queue.lock().pop_front() else { return };
                let result = match catch_unwind(AssertUnwindSafe(task)) {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        Err(StateError::Background(format!("worker panicked: {msg}")))
                    }
                };
                if let Err(err) = result {
                    abort.store(true, Ordering::SeqCst);
                    let mut failed = failed.lock();
                    if failed.is_none() {
                        *failed = Some(err);
                    }
                }
            });
        }
    });

    match failed.into_inner() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// One-shot barrier: `wait` blocks until `count_down` was called `n` times.
#[derive(Debug)]
pub(crate) struct Latch {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new(n: usize) -> Self {
        Self { remaining: Mutex::new(n), cond: Condvar::new() }
    }

    pub(crate) fn count_down(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            self.cond.wait(&mut remaining);
        }
    }
}

/// Tracks read views that were never closed. A view released after the slow threshold gets a
/// warning with its lifetime, which is usually enough to find the leaking call site.
#[derive(Debug)]
pub(crate) struct LeakDetector {
    slow: Duration,
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, Instant>>,
}

impl LeakDetector {
    pub(crate) fn new(slow: Duration) -> Self {
        Self { slow, next_id: AtomicU64::new(0), open: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn register(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(id, Instant::now());
        id
    }

    pub(crate) fn release(&self, id: u64) {
        if let Some(created) = self.open.lock().remove(&id) {
            let held = created.elapsed();
            if held > self.slow {
                warn!(target: "state", view_id = id, ?held, "slow read view released");
            }
        }
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.lock().len()
    }
}

/// Set of named progress counters reported by long background phases.
#[derive(Debug, Default)]
pub struct ProgressSet {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<Progress>>>,
}

#[derive(Debug)]
pub struct Progress {
    pub name: String,
    pub processed: AtomicU64,
    pub total: AtomicU64,
}

impl Progress {
    pub fn step(&self, delta: u64) {
        self.processed.fetch_add(delta, Ordering::Relaxed);
    }

    fn percent(&self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 100
        }
        self.processed.load(Ordering::Relaxed) * 100 / total
    }
}

impl ProgressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named counter, removed again when the returned guard drops.
    pub fn add(&self, name: impl Into<String>, total: u64) -> ProgressGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let progress = Arc::new(Progress {
            name: name.into(),
            processed: AtomicU64::new(0),
            total: AtomicU64::new(total),
        });
        self.entries.lock().insert(id, progress.clone());
        ProgressGuard { set: self, id, progress }
    }

    pub fn has(&self) -> bool {
        !self.entries.lock().is_empty()
    }

    pub fn status(&self) -> String {
        let entries = self.entries.lock();
        let mut parts: Vec<String> =
            entries.values().map(|p| format!("{}:{}%", p.name, p.percent())).collect();
        parts.sort();
        parts.join(", ")
    }
}

/// Removes its progress entry on drop.
#[derive(Debug)]
pub struct ProgressGuard<'a> {
    set: &'a ProgressSet,
    id: u64,
    progress: Arc<Progress>,
}

impl ProgressGuard<'_> {
    pub fn progress(&self) -> &Progress {
        &self.progress
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.set.entries.lock().remove(&self.id);
    }
}

/// Weighted gate between file builds and external snapshot jobs. A plain counting semaphore
/// with owned permits, so a permit can cross thread boundaries with its phase.
#[derive(Debug)]
pub struct BuildGate {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl BuildGate {
    pub fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self { permits: Mutex::new(permits), cond: Condvar::new() })
    }

    /// Blocks until a permit is available.
    pub fn acquire_owned(self: &Arc<Self>) -> BuildPermit {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
        drop(permits);
        BuildPermit { gate: self.clone() }
    }
}

#[derive(Debug)]
pub struct BuildPermit {
    gate: Arc<BuildGate>,
}

impl Drop for BuildPermit {
    fn drop(&mut self) {
        *self.gate.permits.lock() += 1;
        self.gate.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tasks_run_in_submission_order_with_one_worker() {
        let order = Mutex::new(Vec::new());
        let tasks: Vec<Task<'_>> = (0..5)
            .map(|i| {
                let order = &order;
                Box::new(move || {
                    order.lock().push(i);
                    Ok(())
                }) as Task<'_>
            })
            .collect();
        run_tasks(1, tasks).unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn worker_panic_is_surfaced_as_error() {
        let tasks: Vec<Task<'_>> = vec![Box::new(|| panic!("boom"))];
        let err = run_tasks(2, tasks).unwrap_err();
        assert!(matches!(err, StateError::Background(msg) if msg.contains("boom")));
    }

    #[test]
    fn first_error_aborts_queue() {
        let ran = AtomicU64::new(0);
        let mut tasks: Vec<Task<'_>> = vec![Box::new(|| Err(StateError::Cancelled))];
        for _ in 0..100 {
            let ran = &ran;
            tasks.push(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        assert!(run_tasks(1, tasks).unwrap_err().is_cancelled());
        assert!(ran.load(Ordering::SeqCst) < 100);
    }

    #[test]
    fn latch_releases_after_countdown() {
        let latch = Arc::new(Latch::new(2));
        let l2 = latch.clone();
        let handle = std::thread::spawn(move || {
            l2.count_down();
            l2.count_down();
        });
        latch.wait();
        handle.join().unwrap();
    }

    #[test]
    fn progress_set_status() {
        let set = ProgressSet::new();
        assert!(!set.has());
        let guard = set.add("accounts.0-1", 200);
        guard.progress().step(100);
        assert!(set.has());
        assert_eq!(set.status(), "accounts.0-1:50%");
        drop(guard);
        assert!(!set.has());
    }
}
