/*!
 * Linux Port Implementations
 *
 * Real implementations backed by the per-process pseudo-filesystem and the
 * cgroup freezer. The proc root is injectable so tests can point them at a
 * scratch tree.
 */

use super::{FreezePort, FreezeTraffic, KernelReclaimPort, KillPort, RssSnapshot};
use crate::compactor::types::CompactAction;
use crate::core::errors::PortError;
use crate::core::types::{Pid, PrincipalId};
use log::debug;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid as NixPid;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

fn io_err(op: &'static str, pid: Pid, source: std::io::Error) -> PortError {
    if source.kind() == std::io::ErrorKind::NotFound {
        PortError::ProcessGone(pid)
    } else {
        PortError::Io { op, pid, source }
    }
}

/// Reclaim port writing action tokens to `<root>/<pid>/reclaim` and reading
/// the breakdown from `<root>/<pid>/status`
#[derive(Debug, Clone)]
pub struct ProcfsReclaimPort {
    root: PathBuf,
}

impl ProcfsReclaimPort {
    #[must_use]
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    #[must_use]
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn proc_path(&self, pid: Pid, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }
}

impl Default for ProcfsReclaimPort {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelReclaimPort for ProcfsReclaimPort {
    fn rss(&self, pid: Pid) -> Result<RssSnapshot, PortError> {
        let status = fs::read_to_string(self.proc_path(pid, "status"))
            .map_err(|e| io_err("read rss", pid, e))?;
        let mut snapshot = RssSnapshot::default();
        for line in status.lines() {
            let Some((field, rest)) = line.split_once(':') else {
                continue;
            };
            let value = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .unwrap_or(0);
            match field {
                "VmRSS" => snapshot.total_kb = value,
                "RssFile" => snapshot.file_kb = value,
                "RssAnon" => snapshot.anon_kb = value,
                "VmSwap" => snapshot.swap_kb = value,
                _ => {}
            }
        }
        Ok(snapshot)
    }

    fn reclaim(&self, pid: Pid, action: CompactAction) -> Result<(), PortError> {
        if action == CompactAction::None {
            return Ok(());
        }
        debug!("Reclaim {} for pid {}", action.token(), pid);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.proc_path(pid, "reclaim"))
            .map_err(|e| io_err("open reclaim", pid, e))?;
        file.write_all(action.token().as_bytes())
            .map_err(|e| io_err("write reclaim", pid, e))
    }
}

/// Freeze port backed by the cgroup freezer plus the IPC driver's freeze
/// control files
#[derive(Debug, Clone)]
pub struct CgroupFreezePort {
    cgroup_root: PathBuf,
    proc_root: PathBuf,
}

impl CgroupFreezePort {
    #[must_use]
    pub fn new() -> Self {
        Self::with_roots("/sys/fs/cgroup/frozen", "/proc")
    }

    #[must_use]
    pub fn with_roots(cgroup_root: impl AsRef<Path>, proc_root: impl AsRef<Path>) -> Self {
        Self {
            cgroup_root: cgroup_root.as_ref().to_path_buf(),
            proc_root: proc_root.as_ref().to_path_buf(),
        }
    }

    /// Whether this host exposes the cgroup freezer at all
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.cgroup_root.join("cgroup.freeze").exists()
    }
}

impl FreezePort for CgroupFreezePort {
    fn set_frozen(&self, pid: Pid, principal: PrincipalId, frozen: bool) -> Result<(), PortError> {
        let path = self
            .cgroup_root
            .join(format!("p{principal}"))
            .join(format!("{pid}"))
            .join("cgroup.freeze");
        fs::write(&path, if frozen { "1" } else { "0" })
            .map_err(|e| io_err("cgroup freeze", pid, e))
    }

    fn freeze_ipc(&self, pid: Pid, frozen: bool) -> Result<(), PortError> {
        let path = self.proc_root.join(pid.to_string()).join("ipc_freeze");
        fs::write(&path, if frozen { "1" } else { "0" }).map_err(|e| io_err("ipc freeze", pid, e))
    }

    fn ipc_freeze_info(&self, pid: Pid) -> Result<FreezeTraffic, PortError> {
        let path = self.proc_root.join(pid.to_string()).join("ipc_freeze");
        let raw = fs::read_to_string(&path).map_err(|e| io_err("ipc freeze info", pid, e))?;
        let bits = raw.trim().parse::<u32>().map_err(|_| PortError::Io {
            op: "ipc freeze info",
            pid,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, raw.trim().to_string()),
        })?;
        Ok(FreezeTraffic(bits))
    }

    fn has_file_locks(&self, pid: Pid) -> Result<bool, PortError> {
        let locks = fs::read_to_string(self.proc_root.join("locks"))
            .map_err(|e| io_err("read locks", pid, e))?;
        let needle = format!(" {} ", pid);
        Ok(locks.lines().any(|line| line.contains(&needle)))
    }
}

/// Kill port delivering SIGKILL
#[derive(Debug, Clone, Default)]
pub struct SignalKillPort;

impl KillPort for SignalKillPort {
    fn kill(&self, pid: Pid, reason: &str) -> Result<(), PortError> {
        log::warn!("Killing pid {}: {}", pid, reason);
        kill(NixPid::from_raw(pid), Signal::SIGKILL).map_err(|errno| PortError::Io {
            op: "kill",
            pid,
            source: std::io::Error::from_raw_os_error(errno as i32),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn rss_parses_status_fields() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("42");
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(
            proc_dir.join("status"),
            "Name:\tworker\nVmRSS:\t  1024 kB\nRssAnon:\t 600 kB\nRssFile:\t 400 kB\nVmSwap:\t 24 kB\n",
        )
        .unwrap();

        let port = ProcfsReclaimPort::with_root(dir.path());
        let snap = port.rss(42).unwrap();
        assert_eq!(snap.total_kb, 1024);
        assert_eq!(snap.anon_kb, 600);
        assert_eq!(snap.file_kb, 400);
        assert_eq!(snap.swap_kb, 24);
    }

    #[test]
    fn rss_of_dead_process_is_process_gone() {
        let dir = tempfile::tempdir().unwrap();
        let port = ProcfsReclaimPort::with_root(dir.path());
        assert!(matches!(port.rss(999), Err(PortError::ProcessGone(999))));
    }

    #[test]
    fn reclaim_writes_action_token() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("42");
        fs::create_dir_all(&proc_dir).unwrap();
        fs::write(proc_dir.join("reclaim"), "").unwrap();

        let port = ProcfsReclaimPort::with_root(dir.path());
        port.reclaim(42, CompactAction::All).unwrap();
        assert_eq!(fs::read_to_string(proc_dir.join("reclaim")).unwrap(), "all");
    }

    #[test]
    fn file_lock_scan_matches_pid_column() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("locks"),
            "1: POSIX  ADVISORY  WRITE 42 00:2f:123 0 EOF\n",
        )
        .unwrap();
        let port = CgroupFreezePort::with_roots(dir.path().join("cg"), dir.path());
        assert!(port.has_file_locks(42).unwrap());
        assert!(!port.has_file_locks(43).unwrap());
    }
}
