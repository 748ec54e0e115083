/*!
 * Process Freezer
 *
 * Suspends whole processes (scheduling plus IPC) to save memory and power.
 * Freezes are debounced through a delayed work queue so a process briefly
 * leaving the eligible band is not thrashed, and every transition is
 * bracketed by file-lock and IPC-traffic checks. Any inconsistency is
 * resolved by killing the process; a half-frozen process cannot be trusted.
 */

use crate::core::config::SharedTunables;
use crate::core::types::{Pid, ProcKey};
use crate::metrics::{MetricsEvent, MetricsSink, Sampler};
use crate::policy::bands::CACHED_MIN_SCORE;
use crate::ports::{FreezePort, KillPort};
use crate::registry::Registry;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

enum FreezeCmd {
    /// Arm (or re-arm) a delayed freeze; replaces any pending entry
    Freeze { key: ProcKey, not_before: Instant },
    /// Drop any pending entry for the process
    Cancel { key: ProcKey },
    /// Queue barrier for tests
    Flush(flume::Sender<()>),
}

#[derive(Debug)]
struct EnableState {
    /// Whether the subsystem is configured on at all
    use_freezer: bool,
    /// Net disable count; freezing happens only at zero. Starts disabled
    /// until the first enable.
    disable_count: i32,
}

struct FreezerCore {
    registry: Arc<Mutex<Registry>>,
    tunables: SharedTunables,
    port: Arc<dyn FreezePort>,
    kill: Arc<dyn KillPort>,
    metrics: Arc<dyn MetricsSink>,
    sampler: Sampler,
    enable: Mutex<EnableState>,
}

/// Handle to the freeze worker
pub struct Freezer {
    core: Arc<FreezerCore>,
    tx: Option<flume::Sender<FreezeCmd>>,
    worker: Option<JoinHandle<()>>,
}

impl Freezer {
    pub fn spawn(
        registry: Arc<Mutex<Registry>>,
        tunables: SharedTunables,
        port: Arc<dyn FreezePort>,
        kill: Arc<dyn KillPort>,
        metrics: Arc<dyn MetricsSink>,
        sampler: Sampler,
    ) -> Self {
        let use_freezer = tunables.read().use_freezer;
        let core = Arc::new(FreezerCore {
            registry,
            tunables,
            port,
            kill,
            metrics,
            sampler,
            enable: Mutex::new(EnableState {
                use_freezer,
                disable_count: 1,
            }),
        });
        let (tx, rx) = flume::unbounded();
        let worker_core = Arc::clone(&core);
        let worker = std::thread::Builder::new()
            .name("freezer".into())
            .spawn(move || worker_loop(&worker_core, rx))
            .expect("spawn freezer worker");
        info!("Freezer worker started (configured {})", if use_freezer { "on" } else { "off" });
        Self {
            core,
            tx: Some(tx),
            worker: Some(worker),
        }
    }

    /// Adjust the global enable count. The first enable transitions the
    /// subsystem on; the last disable transitions it off and force-unfreezes
    /// every frozen process before returning.
    pub fn enable(&self, enable: bool) -> bool {
        {
            let mut state = self.core.enable.lock();
            if !state.use_freezer {
                return false;
            }
            if enable {
                state.disable_count -= 1;
                if state.disable_count > 0 {
                    return true;
                }
                if state.disable_count < 0 {
                    error!("Unbalanced freezer enable, ignoring");
                    state.disable_count = 0;
                    return false;
                }
                info!("Freezer enabled");
                return true;
            }
            state.disable_count += 1;
            if state.disable_count > 1 {
                return true;
            }
            info!("Freezer disabled, thawing all frozen processes");
        }

        // Transitioned off: no new freezes can start (the worker re-checks
        // the enable state), and everything frozen thaws before we return.
        let frozen = self.core.registry.lock().frozen_keys();
        for key in frozen {
            self.cancel_pending(key);
            self.core.unfreeze_process(key);
        }
        true
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        let state = self.core.enable.lock();
        state.use_freezer && state.disable_count == 0
    }

    /// Arm a freeze after the grace period, replacing any pending freeze or
    /// unfreeze decision for the same process
    pub fn schedule_freeze(&self, key: ProcKey) {
        if !self.is_enabled() {
            return;
        }
        let not_before = Instant::now() + self.core.tunables.read().freeze_debounce;
        if let Some(tx) = &self.tx {
            let _ = tx.send(FreezeCmd::Freeze { key, not_before });
        }
    }

    /// Cancel any pending freeze and thaw the process now, on the calling
    /// thread
    pub fn unfreeze(&self, key: ProcKey) {
        self.cancel_pending(key);
        self.core.unfreeze_process(key);
    }

    /// Guarantee the process is not frozen for at least the grace period:
    /// thaw it now and re-arm the delayed freeze
    pub fn unfreeze_temporarily(&self, key: ProcKey) {
        if !self.is_enabled() {
            return;
        }
        let frozen = self
            .core
            .registry
            .lock()
            .get(key)
            .map(|rec| rec.frozen)
            .unwrap_or(false);
        if frozen {
            self.unfreeze(key);
            self.schedule_freeze(key);
        }
    }

    /// Block until every command queued before this call has been seen
    pub fn flush(&self) {
        if let Some(tx) = &self.tx {
            let (done_tx, done_rx) = flume::bounded(1);
            if tx.send(FreezeCmd::Flush(done_tx)).is_ok() {
                let _ = done_rx.recv();
            }
        }
    }

    fn cancel_pending(&self, key: ProcKey) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(FreezeCmd::Cancel { key });
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Freezer worker panicked during shutdown");
            }
        }
    }
}

impl Drop for Freezer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

fn worker_loop(core: &Arc<FreezerCore>, rx: flume::Receiver<FreezeCmd>) {
    let mut pending: HashMap<ProcKey, Instant> = HashMap::new();
    loop {
        let next_deadline = pending.values().min().copied();
        let cmd = match next_deadline {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    None
                } else {
                    match rx.recv_timeout(deadline - now) {
                        Ok(cmd) => Some(cmd),
                        Err(flume::RecvTimeoutError::Timeout) => None,
                        Err(flume::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match cmd {
            Some(FreezeCmd::Freeze { key, not_before }) => {
                pending.insert(key, not_before);
            }
            Some(FreezeCmd::Cancel { key }) => {
                pending.remove(&key);
            }
            Some(FreezeCmd::Flush(done)) => {
                let _ = done.send(());
            }
            None => {
                let now = Instant::now();
                let due: Vec<ProcKey> = pending
                    .iter()
                    .filter(|(_, &deadline)| deadline <= now)
                    .map(|(&key, _)| key)
                    .collect();
                for key in due {
                    pending.remove(&key);
                    core.freeze_process(key);
                }
            }
        }
    }
    debug!("Freezer worker exiting");
}

impl FreezerCore {
    fn is_enabled(&self) -> bool {
        let state = self.enable.lock();
        state.use_freezer && state.disable_count == 0
    }

    fn kill_process(&self, key: ProcKey, pid: Pid, name: &str, reason: &str) {
        error!("Killing {} (pid {}): {}", name, pid, reason);
        if let Err(err) = self.kill.kill(pid, reason) {
            warn!("Kill of pid {} failed: {}", pid, err);
        }
        self.registry.lock().mark_killed(key);
    }

    /// Worker-side freeze, after the debounce fired
    fn freeze_process(&self, key: ProcKey) {
        let (pid, name, principal) = {
            let registry = self.registry.lock();
            let Some(rec) = registry.get(key) else {
                return;
            };
            (rec.pid, rec.name.clone(), rec.principal)
        };
        if pid == 0 {
            return;
        }

        // Pre-check for file locks to avoid freezing mid-critical-section.
        match self.port.has_file_locks(pid) {
            Ok(false) => {}
            Ok(true) => {
                debug!("{} (pid {}) holds file locks, not freezing", name, pid);
                return;
            }
            Err(err) => {
                warn!("Not freezing {}: unable to check file locks: {}", name, err);
                return;
            }
        }

        // Re-check under the registry lock that the decision still holds.
        let prior_toggle = {
            let registry = self.registry.lock();
            let Some(rec) = registry.get(key) else {
                return;
            };
            if !self.is_enabled() {
                return;
            }
            if rec.cur_score < CACHED_MIN_SCORE || rec.do_not_freeze {
                debug!(
                    "Skipping freeze for {}: score={} do_not_freeze={}",
                    name, rec.cur_score, rec.do_not_freeze
                );
                return;
            }
            if rec.pid == 0 || rec.frozen || rec.killed {
                return;
            }
            rec.freeze_toggle_at
        };

        // The freeze syscall runs outside the lock; a slow kernel must not
        // stall unrelated registry mutations.
        if let Err(err) = self.port.set_frozen(pid, principal, true) {
            warn!("Unable to freeze {} (pid {}): {}", name, pid, err);
            return;
        }
        let now = Instant::now();
        {
            let mut registry = self.registry.lock();
            if let Some(rec) = registry.get_mut(key) {
                rec.frozen = true;
                rec.freeze_toggle_at = Some(now);
            }
        }
        debug!("Froze {} (pid {})", name, pid);

        // IPC-layer freeze flushes in-flight synchronous calls and starts
        // rejecting new ones. Failure leaves undefined state: kill.
        if let Err(err) = self.port.freeze_ipc(pid, true) {
            warn!("IPC freeze failed for {} (pid {}): {}", name, pid, err);
            self.kill_process(key, pid, &name, "unable to freeze ipc");
            return;
        }

        let sample_rate = self.tunables.read().freeze_sample_rate;
        if self.sampler.sample(sample_rate) {
            let unfrozen_ms = prior_toggle
                .map(|at| now.duration_since(at).as_millis() as u64)
                .unwrap_or(0);
            self.metrics.emit(MetricsEvent::ProcessFrozen {
                pid,
                name: name.clone(),
                unfrozen_ms,
            });
        }

        // Post-check: a file lock acquired in the race window reverses the
        // freeze immediately.
        match self.port.has_file_locks(pid) {
            Ok(false) => {}
            Ok(true) => {
                debug!("{} (pid {}) grabbed file locks, reverting freeze", name, pid);
                self.unfreeze_process(key);
            }
            Err(err) => {
                warn!("Unable to re-check file locks for {}: {}", name, err);
                self.unfreeze_process(key);
            }
        }
    }

    /// Synchronous thaw; used by the public unfreeze paths and the
    /// post-check reversal
    fn unfreeze_process(&self, key: ProcKey) {
        let (pid, name, principal, frozen, toggle_at) = {
            let registry = self.registry.lock();
            let Some(rec) = registry.get(key) else {
                return;
            };
            (
                rec.pid,
                rec.name.clone(),
                rec.principal,
                rec.frozen,
                rec.freeze_toggle_at,
            )
        };
        if !frozen {
            debug!("Skipping unfreeze for {} (pid {}): not frozen", name, pid);
            return;
        }

        // A synchronous call observed while frozen means callers saw state
        // the process never processed; it cannot be resumed safely.
        match self.port.ipc_freeze_info(pid) {
            Ok(traffic) => {
                if traffic.sync_received() {
                    self.kill_process(key, pid, &name, "sync call while frozen");
                    return;
                }
                if traffic.async_received() {
                    debug!("{} (pid {}) received async calls while frozen", name, pid);
                }
            }
            Err(err) => {
                warn!("Unable to query ipc freeze info for {}: {}", name, err);
                self.kill_process(key, pid, &name, "unable to query ipc freeze info");
                return;
            }
        }

        if self.port.freeze_ipc(pid, false).is_err() {
            self.kill_process(key, pid, &name, "unable to unfreeze ipc");
            return;
        }

        if let Err(err) = self.port.set_frozen(pid, principal, false) {
            error!(
                "Unable to unfreeze {} (pid {}): {}. This may cause inconsistency or hangs.",
                name, pid, err
            );
            return;
        }
        let now = Instant::now();
        {
            let mut registry = self.registry.lock();
            if let Some(rec) = registry.get_mut(key) {
                rec.frozen = false;
                rec.freeze_toggle_at = Some(now);
            }
        }
        debug!("Unfroze {} (pid {})", name, pid);

        let sample_rate = self.tunables.read().freeze_sample_rate;
        if self.sampler.sample(sample_rate) {
            let frozen_ms = toggle_at
                .map(|at| now.duration_since(at).as_millis() as u64)
                .unwrap_or(0);
            self.metrics.emit(MetricsEvent::ProcessUnfrozen {
                pid,
                name,
                frozen_ms,
            });
        }
    }
}
