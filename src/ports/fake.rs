/*!
 * Fake Ports
 *
 * In-memory, scriptable implementations of the OS ports. Shipped outside
 * `#[cfg(test)]` so integration tests can drive the workers end to end.
 */

use super::{FreezePort, FreezeTraffic, KernelReclaimPort, KillPort, RssSnapshot};
use crate::compactor::types::CompactAction;
use crate::core::errors::PortError;
use crate::core::types::{Pid, PrincipalId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

fn gone(pid: Pid) -> PortError {
    PortError::ProcessGone(pid)
}

/// Fake reclaim port: scripted RSS per pid, records every reclaim call
#[derive(Debug, Default)]
pub struct FakeReclaimPort {
    state: Mutex<FakeReclaimState>,
}

#[derive(Debug, Default)]
struct FakeReclaimState {
    rss: HashMap<Pid, RssSnapshot>,
    reclaims: Vec<(Pid, CompactAction)>,
    fail_reclaim: bool,
}

impl FakeReclaimPort {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rss(&self, pid: Pid, snapshot: RssSnapshot) {
        self.state.lock().rss.insert(pid, snapshot);
    }

    pub fn set_rss_kb(&self, pid: Pid, file_kb: u64, anon_kb: u64, swap_kb: u64) {
        self.set_rss(
            pid,
            RssSnapshot {
                total_kb: file_kb + anon_kb,
                file_kb,
                anon_kb,
                swap_kb,
            },
        );
    }

    pub fn fail_reclaims(&self, fail: bool) {
        self.state.lock().fail_reclaim = fail;
    }

    #[must_use]
    pub fn reclaim_calls(&self) -> Vec<(Pid, CompactAction)> {
        self.state.lock().reclaims.clone()
    }

    #[must_use]
    pub fn reclaim_count(&self) -> usize {
        self.state.lock().reclaims.len()
    }
}

impl KernelReclaimPort for FakeReclaimPort {
    fn rss(&self, pid: Pid) -> Result<RssSnapshot, PortError> {
        self.state.lock().rss.get(&pid).copied().ok_or_else(|| gone(pid))
    }

    fn reclaim(&self, pid: Pid, action: CompactAction) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if state.fail_reclaim {
            return Err(PortError::Io {
                op: "reclaim",
                pid,
                source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
            });
        }
        if !state.rss.contains_key(&pid) {
            return Err(gone(pid));
        }
        state.reclaims.push((pid, action));
        Ok(())
    }
}

/// Fake freeze port with scriptable file locks, traffic bits, and failures
#[derive(Debug, Default)]
pub struct FakeFreezePort {
    state: Mutex<FakeFreezeState>,
}

#[derive(Debug, Default)]
struct FakeFreezeState {
    frozen: HashSet<Pid>,
    ipc_frozen: HashSet<Pid>,
    file_locks: HashSet<Pid>,
    /// Pids whose file locks appear only after the OS freeze (race window)
    late_file_locks: HashSet<Pid>,
    traffic: HashMap<Pid, u32>,
    fail_ipc_freeze: HashSet<Pid>,
    fail_freeze_info: HashSet<Pid>,
    transitions: Vec<(Pid, bool)>,
}

impl FakeFreezePort {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_file_locks(&self, pid: Pid, held: bool) {
        let mut state = self.state.lock();
        if held {
            state.file_locks.insert(pid);
        } else {
            state.file_locks.remove(&pid);
        }
    }

    /// Make a file lock appear right after the OS-level freeze lands,
    /// exercising the post-check race path
    pub fn set_late_file_lock(&self, pid: Pid) {
        self.state.lock().late_file_locks.insert(pid);
    }

    pub fn set_traffic(&self, pid: Pid, bits: u32) {
        self.state.lock().traffic.insert(pid, bits);
    }

    pub fn fail_ipc_freeze(&self, pid: Pid) {
        self.state.lock().fail_ipc_freeze.insert(pid);
    }

    pub fn fail_freeze_info(&self, pid: Pid) {
        self.state.lock().fail_freeze_info.insert(pid);
    }

    #[must_use]
    pub fn is_frozen(&self, pid: Pid) -> bool {
        self.state.lock().frozen.contains(&pid)
    }

    #[must_use]
    pub fn is_ipc_frozen(&self, pid: Pid) -> bool {
        self.state.lock().ipc_frozen.contains(&pid)
    }

    /// Every (pid, frozen) OS-level transition in order
    #[must_use]
    pub fn transitions(&self) -> Vec<(Pid, bool)> {
        self.state.lock().transitions.clone()
    }
}

impl FreezePort for FakeFreezePort {
    fn set_frozen(&self, pid: Pid, _principal: PrincipalId, frozen: bool) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if frozen {
            state.frozen.insert(pid);
            if state.late_file_locks.remove(&pid) {
                state.file_locks.insert(pid);
            }
        } else {
            state.frozen.remove(&pid);
        }
        state.transitions.push((pid, frozen));
        Ok(())
    }

    fn freeze_ipc(&self, pid: Pid, frozen: bool) -> Result<(), PortError> {
        let mut state = self.state.lock();
        if state.fail_ipc_freeze.contains(&pid) {
            return Err(PortError::Io {
                op: "ipc freeze",
                pid,
                source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
            });
        }
        if frozen {
            state.ipc_frozen.insert(pid);
        } else {
            state.ipc_frozen.remove(&pid);
        }
        Ok(())
    }

    fn ipc_freeze_info(&self, pid: Pid) -> Result<FreezeTraffic, PortError> {
        let state = self.state.lock();
        if state.fail_freeze_info.contains(&pid) {
            return Err(PortError::Io {
                op: "ipc freeze info",
                pid,
                source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
            });
        }
        Ok(FreezeTraffic(state.traffic.get(&pid).copied().unwrap_or(0)))
    }

    fn has_file_locks(&self, pid: Pid) -> Result<bool, PortError> {
        Ok(self.state.lock().file_locks.contains(&pid))
    }
}

/// Fake kill port recording every kill
#[derive(Debug, Default)]
pub struct FakeKillPort {
    kills: Mutex<Vec<(Pid, String)>>,
}

impl FakeKillPort {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn kills(&self) -> Vec<(Pid, String)> {
        self.kills.lock().clone()
    }

    #[must_use]
    pub fn killed(&self, pid: Pid) -> bool {
        self.kills.lock().iter().any(|(p, _)| *p == pid)
    }
}

impl KillPort for FakeKillPort {
    fn kill(&self, pid: Pid, reason: &str) -> Result<(), PortError> {
        self.kills.lock().push((pid, reason.to_string()));
        Ok(())
    }
}
