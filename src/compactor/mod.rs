/*!
 * Memory Compactor
 *
 * Background worker that asks the kernel to reclaim memory from selected
 * processes. Requests are coalesced per process and the worker re-validates
 * and throttle-gates every action immediately before performing it, so a
 * stale request can never compact a process that has become relevant again.
 */

pub mod types;

pub use types::{CompactAction, CompactTier};

use crate::core::config::SharedTunables;
use crate::core::limits::COMPACT_STATS_CAPACITY;
use crate::core::types::{Pid, ProcKey};
use crate::metrics::{MetricsEvent, MetricsSink, Sampler};
use crate::policy::bands::{ProcState, PERCEPTIBLE_SCORE};
use crate::ports::{KernelReclaimPort, RssSnapshot};
use crate::registry::Registry;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

enum WorkItem {
    Compact {
        key: ProcKey,
        /// Importance state captured at request time; the exclusion throttle
        /// uses this, not whatever the state drifts to later
        state_at_request: ProcState,
    },
    Flush(flume::Sender<()>),
}

/// Per-tier action counters, for dumps and tests
#[derive(Debug, Default)]
pub struct CompactionCounters {
    pub light: AtomicU64,
    pub full: AtomicU64,
    pub persistent: AtomicU64,
    pub bound_fg: AtomicU64,
}

impl CompactionCounters {
    fn bump(&self, tier: CompactTier) {
        let counter = match tier {
            CompactTier::Light => &self.light,
            CompactTier::Full => &self.full,
            CompactTier::Persistent => &self.persistent,
            CompactTier::BoundFg => &self.bound_fg,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.light.load(Ordering::Relaxed)
            + self.full.load(Ordering::Relaxed)
            + self.persistent.load(Ordering::Relaxed)
            + self.bound_fg.load(Ordering::Relaxed)
    }
}

/// Insertion-ordered table of the last post-compaction footprint per pid,
/// bounded in size with the oldest entry evicted first
struct BoundedStats {
    map: HashMap<Pid, RssSnapshot>,
    order: VecDeque<Pid>,
    capacity: usize,
}

impl BoundedStats {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, pid: Pid) -> Option<RssSnapshot> {
        self.map.get(&pid).copied()
    }

    fn insert(&mut self, pid: Pid, snapshot: RssSnapshot) {
        if self.map.insert(pid, snapshot).is_some() {
            // Re-insert to refresh this pid's position in the order.
            self.order.retain(|&p| p != pid);
        }
        self.order.push_back(pid);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Handle to the compaction worker
pub struct Compactor {
    registry: Arc<Mutex<Registry>>,
    tunables: SharedTunables,
    tx: Option<flume::Sender<WorkItem>>,
    worker: Option<JoinHandle<()>>,
    counters: Arc<CompactionCounters>,
}

impl Compactor {
    pub fn spawn(
        registry: Arc<Mutex<Registry>>,
        tunables: SharedTunables,
        reclaim: Arc<dyn KernelReclaimPort>,
        metrics: Arc<dyn MetricsSink>,
        sampler: Sampler,
    ) -> Self {
        let (tx, rx) = flume::unbounded();
        let counters = Arc::new(CompactionCounters::default());
        let worker_ctx = WorkerCtx {
            registry: Arc::clone(&registry),
            tunables: tunables.clone(),
            reclaim,
            metrics,
            sampler,
            counters: Arc::clone(&counters),
            last_stats: BoundedStats::new(COMPACT_STATS_CAPACITY),
        };
        let worker = std::thread::Builder::new()
            .name("compactor".into())
            .spawn(move || worker_loop(worker_ctx, rx))
            .expect("spawn compactor worker");
        info!("Compactor worker started");
        Self {
            registry,
            tunables,
            tx: Some(tx),
            worker: Some(worker),
            counters,
        }
    }

    #[must_use]
    pub fn counters(&self) -> &CompactionCounters {
        &self.counters
    }

    /// Request compaction of one process at the given tier.
    ///
    /// Re-requests while a request is already pending are coalesced into the
    /// single queued item, keeping the strongest requested tier.
    pub fn request(&self, key: ProcKey, tier: CompactTier) {
        let mut registry = self.registry.lock();
        let Some(rec) = registry.get_mut(key) else {
            return;
        };
        rec.requested_compact_tier = Some(match rec.requested_compact_tier {
            Some(existing) => existing.max(tier),
            None => tier,
        });
        if rec.pending_compact {
            return;
        }
        rec.pending_compact = true;
        let item = WorkItem::Compact {
            key,
            state_at_request: rec.set_state,
        };
        drop(registry);
        if let Some(tx) = &self.tx {
            let _ = tx.send(item);
        }
    }

    /// Whether a persistent process is outside its compaction throttle window
    #[must_use]
    pub fn should_compact_persistent(&self, last_compact_at: Option<Instant>) -> bool {
        match last_compact_at {
            None => true,
            Some(at) => at.elapsed() > self.tunables.read().compact_throttle_persistent,
        }
    }

    /// Whether a bound-foreground-service host is outside its throttle window
    #[must_use]
    pub fn should_compact_bound_fg(&self, last_compact_at: Option<Instant>) -> bool {
        match last_compact_at {
            None => true,
            Some(at) => at.elapsed() > self.tunables.read().compact_throttle_bound_fg,
        }
    }

    /// Block until every item queued before this call has been processed
    pub fn flush(&self) {
        if let Some(tx) = &self.tx {
            let (done_tx, done_rx) = flume::bounded(1);
            if tx.send(WorkItem::Flush(done_tx)).is_ok() {
                let _ = done_rx.recv();
            }
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Compactor worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

struct WorkerCtx {
    registry: Arc<Mutex<Registry>>,
    tunables: SharedTunables,
    reclaim: Arc<dyn KernelReclaimPort>,
    metrics: Arc<dyn MetricsSink>,
    sampler: Sampler,
    counters: Arc<CompactionCounters>,
    last_stats: BoundedStats,
}

fn worker_loop(mut ctx: WorkerCtx, rx: flume::Receiver<WorkItem>) {
    for item in rx.iter() {
        match item {
            WorkItem::Compact {
                key,
                state_at_request,
            } => process_item(&mut ctx, key, state_at_request),
            WorkItem::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Compactor worker exiting");
}

fn process_item(ctx: &mut WorkerCtx, key: ProcKey, state_at_request: ProcState) {
    let started = Instant::now();

    // Bounded critical section: re-validate and snapshot what the action
    // needs, then run the kernel calls without the registry lock.
    let (pid, name, tier, last_tier, last_compact_at) = {
        let mut registry = ctx.registry.lock();
        let Some(rec) = registry.get_mut(key) else {
            return;
        };
        rec.pending_compact = false;
        let Some(tier) = rec.requested_compact_tier.take() else {
            return;
        };

        // A process that climbed back to perceptible-or-better since the
        // request is off limits for the opportunistic tiers.
        if matches!(tier, CompactTier::Light | CompactTier::Full)
            && rec.set_score <= PERCEPTIBLE_SCORE
        {
            debug!("Skipping {} compaction for {}: perceptible again", tier.label(), rec.name);
            return;
        }

        (
            rec.pid,
            rec.name.clone(),
            tier,
            rec.last_compact_tier,
            rec.last_compact_at,
        )
    };

    if pid == 0 {
        // Not a real process yet, or already torn down.
        return;
    }

    let (action, anon_throttle_kb, delta_throttle_kb, excluded, sample_rate) = {
        let tunables = ctx.tunables.read();
        let action = match tier {
            CompactTier::Light => tunables.compact_action_light,
            _ => tunables.compact_action_full,
        };
        let throttle = tunables.compact_throttle(last_tier, tier);
        if let Some(at) = last_compact_at {
            let elapsed = at.elapsed();
            if elapsed < throttle {
                debug!(
                    "Skipping {} compaction for {}: throttled ({:?} < {:?})",
                    tier.label(),
                    name,
                    elapsed,
                    throttle
                );
                return;
            }
        }
        (
            action,
            tunables.full_anon_rss_throttle_kb,
            tunables.full_delta_rss_throttle_kb,
            tunables.compact_state_exclude.contains(&state_at_request),
            tunables.compact_sample_rate,
        )
    };

    if action == CompactAction::None {
        return;
    }
    if excluded {
        debug!(
            "Skipping {} compaction for {}: state {:?} excluded",
            tier.label(),
            name,
            state_at_request
        );
        return;
    }

    let rss_before = match ctx.reclaim.rss(pid) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            debug!("Skipping compaction for {}: {}", name, err);
            return;
        }
    };
    if rss_before.is_zero() {
        debug!("Skipping compaction for {}: no memory usage, dead?", name);
        return;
    }

    if action.touches_anon() {
        if anon_throttle_kb > 0 && rss_before.anon_kb < anon_throttle_kb {
            debug!(
                "Skipping {} compaction for {}: anon rss too small ({} KB)",
                tier.label(),
                name,
                rss_before.anon_kb
            );
            return;
        }
        if delta_throttle_kb > 0 {
            if let Some(last) = ctx.last_stats.get(pid) {
                let delta = rss_before.abs_delta_kb(&last);
                if delta <= delta_throttle_kb {
                    debug!(
                        "Skipping {} compaction for {}: footprint moved only {} KB",
                        tier.label(),
                        name,
                        delta
                    );
                    return;
                }
            }
        }
    }

    // All throttles passed; this one counts even if the process dies under us.
    ctx.counters.bump(tier);

    if let Err(err) = ctx.reclaim.reclaim(pid, action) {
        debug!("Compaction of {} failed: {}", name, err);
        return;
    }
    let rss_after = ctx.reclaim.rss(pid).unwrap_or_default();
    let ended = Instant::now();

    {
        let mut registry = ctx.registry.lock();
        if let Some(rec) = registry.get_mut(key) {
            rec.last_compact_at = Some(ended);
            rec.last_compact_tier = Some(tier);
        }
    }
    if action.touches_anon() {
        ctx.last_stats.insert(pid, rss_after);
    }

    debug!(
        "Compacted {} (pid {}) {}: {} -> {} KB anon, {} entries tracked",
        name,
        pid,
        action.token(),
        rss_before.anon_kb,
        rss_after.anon_kb,
        ctx.last_stats.len()
    );

    if ctx.sampler.sample(sample_rate) {
        ctx.metrics.emit(MetricsEvent::CompactionPerformed {
            pid,
            name,
            tier,
            action,
            rss_before,
            rss_after,
            elapsed_ms: ended.duration_since(started).as_millis() as u64,
        });
    }
}
