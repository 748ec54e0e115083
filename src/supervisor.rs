/*!
 * Supervisor
 *
 * The control plane: owns the registry behind its single coarse lock, wires
 * the daemon connection, the compactor, and the freezer together, and turns
 * external importance signals into score pushes, LRU repositioning, and
 * worker requests.
 */

use crate::compactor::{CompactTier, Compactor};
use crate::core::config::{SharedTunables, TunableSource, Tunables};
use crate::core::errors::{LowmemdError, RegistryResult};
use crate::core::types::{OomScore, Pid, PrincipalId, ProcKey};
use crate::freezer::Freezer;
use crate::lowmemd::connection::{DaemonConnection, DaemonListener, DaemonTransport};
use crate::metrics::{LogSink, MetricsEvent, MetricsSink, Sampler};
use crate::policy::bands::{score_tag, ProcState, CACHED_MIN_SCORE, UNKNOWN_SCORE};
use crate::policy::budget::RetentionBudget;
use crate::policy::thresholds::{display_reserve_kb, ThresholdParams, ThresholdTable};
use crate::ports::{FakeFreezePort, FakeKillPort, FakeReclaimPort};
use crate::ports::{FreezePort, KernelReclaimPort, KillPort};
use crate::registry::Registry;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Marks daemon-initiated kills in the registry and surfaces them as events
struct KillListener {
    registry: Arc<Mutex<Registry>>,
    metrics: Arc<dyn MetricsSink>,
}

impl DaemonListener for KillListener {
    fn on_daemon_kill(&self, pid: Pid, principal: PrincipalId) {
        let mut registry = self.registry.lock();
        if let Some(key) = registry.lookup_pid_key(pid) {
            registry.mark_killed(key);
            info!("Reclaim daemon killed pid {} (principal {})", pid, principal);
        } else {
            warn!("Reclaim daemon killed unknown pid {}", pid);
        }
        drop(registry);
        self.metrics.emit(MetricsEvent::DaemonKill { pid, principal });
    }
}

struct ThresholdState {
    table: ThresholdTable,
    /// Set once display geometry is known; later calls are no-ops
    have_display: bool,
    total_mem_mb: u64,
}

/// Builder mirroring the optional-subsystem wiring of the supervisor
pub struct SupervisorBuilder {
    tunables: Tunables,
    tunable_source: Option<Box<dyn TunableSource + Send + Sync>>,
    transport: Option<Box<dyn DaemonTransport>>,
    reclaim_port: Option<Arc<dyn KernelReclaimPort>>,
    freeze_port: Option<Arc<dyn FreezePort>>,
    kill_port: Option<Arc<dyn KillPort>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    total_mem_mb: u64,
    sampler_seed: Option<u64>,
}

impl SupervisorBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tunables: Tunables::default(),
            tunable_source: None,
            transport: None,
            reclaim_port: None,
            freeze_port: None,
            kill_port: None,
            metrics: None,
            total_mem_mb: 1024,
            sampler_seed: None,
        }
    }

    #[must_use]
    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    #[must_use]
    pub fn with_tunable_source(
        mut self,
        source: impl TunableSource + Send + Sync + 'static,
    ) -> Self {
        self.tunables = Tunables::from_source(&source);
        self.tunable_source = Some(Box::new(source));
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: impl DaemonTransport) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    #[must_use]
    pub fn with_reclaim_port(mut self, port: Arc<dyn KernelReclaimPort>) -> Self {
        self.reclaim_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_freeze_port(mut self, port: Arc<dyn FreezePort>) -> Self {
        self.freeze_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_kill_port(mut self, port: Arc<dyn KillPort>) -> Self {
        self.kill_port = Some(port);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    #[must_use]
    pub fn with_total_mem_mb(mut self, total_mem_mb: u64) -> Self {
        self.total_mem_mb = total_mem_mb;
        self
    }

    /// Deterministic metrics sampling for tests
    #[must_use]
    pub fn with_sampler_seed(mut self, seed: u64) -> Self {
        self.sampler_seed = Some(seed);
        self
    }

    #[must_use]
    pub fn build(self) -> Supervisor {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let tunables: SharedTunables = crate::core::config::shared(self.tunables);
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(LogSink));

        let listener = Arc::new(KillListener {
            registry: Arc::clone(&registry),
            metrics: Arc::clone(&metrics),
        });
        let transport = self
            .transport
            .expect("supervisor requires a daemon transport");
        let daemon = DaemonConnection::spawn(transport, listener);

        let reclaim_port = self
            .reclaim_port
            .unwrap_or_else(|| Arc::new(FakeReclaimPort::new()));
        let freeze_port = self
            .freeze_port
            .unwrap_or_else(|| Arc::new(FakeFreezePort::new()));
        let kill_port = self
            .kill_port
            .unwrap_or_else(|| Arc::new(FakeKillPort::new()));

        let sampler = |seed: Option<u64>| match seed {
            Some(seed) => Sampler::with_seed(seed),
            None => Sampler::new(),
        };

        let compactor = Compactor::spawn(
            Arc::clone(&registry),
            tunables.clone(),
            Arc::clone(&reclaim_port),
            Arc::clone(&metrics),
            sampler(self.sampler_seed),
        );
        let freezer = Freezer::spawn(
            Arc::clone(&registry),
            tunables.clone(),
            freeze_port,
            Arc::clone(&kill_port),
            Arc::clone(&metrics),
            sampler(self.sampler_seed),
        );

        let table = ThresholdTable::compute(ThresholdParams::new(self.total_mem_mb, 0));
        info!(
            "Supervisor initialized: {} MB total, thresholds {:?}",
            self.total_mem_mb,
            table.buckets()
        );

        Supervisor {
            registry,
            tunables,
            tunable_source: self.tunable_source,
            daemon,
            compactor,
            freezer,
            kill_port,
            thresholds: Mutex::new(ThresholdState {
                table,
                have_display: false,
                total_mem_mb: self.total_mem_mb,
            }),
        }
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Supervisor {
    registry: Arc<Mutex<Registry>>,
    tunables: SharedTunables,
    tunable_source: Option<Box<dyn TunableSource + Send + Sync>>,
    daemon: DaemonConnection,
    compactor: Compactor,
    freezer: Freezer,
    kill_port: Arc<dyn KillPort>,
    thresholds: Mutex<ThresholdState>,
}

impl Supervisor {
    #[must_use]
    pub fn builder() -> SupervisorBuilder {
        SupervisorBuilder::new()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Mutex<Registry>> {
        &self.registry
    }

    #[must_use]
    pub fn daemon(&self) -> &DaemonConnection {
        &self.daemon
    }

    #[must_use]
    pub fn compactor(&self) -> &Compactor {
        &self.compactor
    }

    #[must_use]
    pub fn freezer(&self) -> &Freezer {
        &self.freezer
    }

    // ---- lifecycle -------------------------------------------------------

    pub fn register_start(&self, name: &str, principal: PrincipalId) -> RegistryResult<ProcKey> {
        self.registry.lock().register_start(name, principal)
    }

    pub fn register_isolated_start(&self, name: &str) -> RegistryResult<ProcKey> {
        self.registry.lock().register_isolated_start(name)
    }

    pub fn commit_start(&self, key: ProcKey, pid: Pid) -> RegistryResult<()> {
        let mut registry = self.registry.lock();
        registry.commit_start(key, pid)?;
        registry.touch_lru(key, false, None);
        Ok(())
    }

    /// Kill a process on our own initiative and tell the daemon to stop
    /// tracking it
    pub fn kill(&self, key: ProcKey, reason: &str) {
        let pid = {
            let mut registry = self.registry.lock();
            let Some(rec) = registry.get(key) else {
                return;
            };
            let pid = rec.pid;
            registry.mark_killed(key);
            pid
        };
        if pid > 0 {
            if let Err(err) = self.kill_port.kill(pid, reason) {
                warn!("Kill of pid {} failed: {}", pid, err);
            }
            self.daemon.remove_pid(pid);
        }
    }

    /// Finalize a record whose pid is confirmed dead
    pub fn reap(&self, key: ProcKey) -> RegistryResult<()> {
        let rec = self.registry.lock().remove(key)?;
        if rec.pid > 0 {
            self.daemon.remove_pid(rec.pid);
        }
        Ok(())
    }

    // ---- importance signals ---------------------------------------------

    /// Apply a newly computed score and importance state: update the record,
    /// push the priority to the daemon, and drive freeze/compaction
    /// transitions at the cached-band boundary.
    pub fn set_score(&self, key: ProcKey, score: OomScore, state: ProcState) {
        let (pid, principal, entering_cached, leaving_cached, frozen) = {
            let mut registry = self.registry.lock();
            let Some(rec) = registry.get_mut(key) else {
                return;
            };
            let prev_score = rec.cur_score;
            let was_cached = prev_score != UNKNOWN_SCORE && prev_score >= CACHED_MIN_SCORE;
            rec.cur_score = score;
            rec.set_score = score;
            rec.verified_score = score;
            rec.cur_state = state;
            rec.set_state = state;
            rec.cached = score >= CACHED_MIN_SCORE;
            rec.empty = rec.cached && state == ProcState::CachedEmpty;
            log::debug!(
                "Score for {} (pid {}): {} [{}], state {:?}",
                rec.name,
                rec.pid,
                score,
                score_tag(score),
                state
            );
            (
                rec.pid,
                rec.principal,
                rec.cached && !was_cached,
                !rec.cached && was_cached,
                rec.frozen,
            )
        };

        self.daemon.set_score(pid, principal, score);

        if entering_cached {
            if self.tunables.read().use_compaction {
                self.compactor.request(key, CompactTier::Full);
            }
            self.freezer.schedule_freeze(key);
        } else if leaving_cached && frozen {
            self.freezer.unfreeze(key);
        }
    }

    /// A session became visible or was torn down in this process
    pub fn report_session_change(&self, key: ProcKey, active: bool) {
        let mut registry = self.registry.lock();
        if let Some(rec) = registry.get_mut(key) {
            rec.hosts_sessions = active;
        }
        registry.touch_lru(key, true, None);
    }

    /// Generic use signal (binding, provider access), optionally on behalf
    /// of a client process
    pub fn touch(&self, key: ProcKey, client: Option<ProcKey>) {
        self.registry.lock().touch_lru(key, false, client);
    }

    // ---- thresholds ------------------------------------------------------

    /// Recompute thresholds once display geometry becomes known and push
    /// the table to the daemon. Idempotent after the first real geometry.
    pub fn apply_display_size(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let mut state = self.thresholds.lock();
        if state.have_display {
            return;
        }
        let screen_px = u64::from(width) * u64::from(height);
        state.table = ThresholdTable::compute(ThresholdParams::new(state.total_mem_mb, screen_px));
        state.have_display = true;
        info!(
            "Display {}x{} known, thresholds {:?}, reserve {} KB",
            width,
            height,
            state.table.buckets(),
            display_reserve_kb(width, height, -1, 0)
        );
        self.daemon.install_thresholds(state.table.daemon_pairs());
    }

    #[must_use]
    pub fn threshold_table(&self) -> ThresholdTable {
        self.thresholds.lock().table.clone()
    }

    // ---- workers ---------------------------------------------------------

    pub fn request_compaction(&self, key: ProcKey, tier: CompactTier) {
        if self.tunables.read().use_compaction {
            self.compactor.request(key, tier);
        }
    }

    pub fn enable_freezer(&self, enable: bool) -> bool {
        self.freezer.enable(enable)
    }

    pub fn unfreeze_temporarily(&self, key: ProcKey) {
        self.freezer.unfreeze_temporarily(key);
    }

    // ---- configuration ---------------------------------------------------

    /// Re-read the tunable namespace; takes effect on next scheduled actions
    pub fn refresh_tunables(&self) {
        if let Some(source) = &self.tunable_source {
            *self.tunables.write() = Tunables::from_source(source.as_ref());
            info!("Tunables refreshed");
        }
    }

    #[must_use]
    pub fn retention_budget(&self) -> RetentionBudget {
        RetentionBudget::derive(&self.tunables.read())
    }

    pub fn kill_count(&self, min_score: OomScore, max_score: OomScore) -> Result<u32, LowmemdError> {
        self.daemon.kill_count(min_score, max_score)
    }

    pub fn shutdown(self) {
        self.compactor.shutdown();
        self.freezer.shutdown();
        self.daemon.shutdown();
        info!("Supervisor shut down");
    }
}
