/*!
 * OS Ports
 *
 * Small trait seams in front of every kernel-level operation the warden
 * performs, with real Linux implementations and in-memory fakes for tests.
 * Workers hold these as trait objects injected at construction.
 */

pub mod fake;
pub mod linux;

pub use fake::{FakeFreezePort, FakeKillPort, FakeReclaimPort};
pub use linux::{CgroupFreezePort, ProcfsReclaimPort, SignalKillPort};

use crate::compactor::types::CompactAction;
use crate::core::errors::PortError;
use crate::core::types::{Pid, PrincipalId};
use serde::Serialize;

/// Resident-memory breakdown of one process, in KiB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RssSnapshot {
    pub total_kb: u64,
    pub file_kb: u64,
    pub anon_kb: u64,
    pub swap_kb: u64,
}

impl RssSnapshot {
    /// All-zero usually means the process is already dead
    #[inline]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.total_kb == 0 && self.file_kb == 0 && self.anon_kb == 0 && self.swap_kb == 0
    }

    /// Sum of absolute per-segment deltas, excluding the total
    #[must_use]
    pub fn abs_delta_kb(&self, other: &RssSnapshot) -> u64 {
        self.file_kb.abs_diff(other.file_kb)
            + self.anon_kb.abs_diff(other.anon_kb)
            + self.swap_kb.abs_diff(other.swap_kb)
    }
}

/// Kernel-level memory reclaim for one process
pub trait KernelReclaimPort: Send + Sync {
    /// Read the resident-memory breakdown
    fn rss(&self, pid: Pid) -> Result<RssSnapshot, PortError>;

    /// Ask the kernel to reclaim memory of the given kind
    fn reclaim(&self, pid: Pid, action: CompactAction) -> Result<(), PortError>;
}

/// What arrived at a process while its IPC was frozen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreezeTraffic(pub u32);

impl FreezeTraffic {
    pub const SYNC_RECEIVED: u32 = 1;
    pub const ASYNC_RECEIVED: u32 = 2;

    /// A synchronous call arrived while frozen; the process state can no
    /// longer be trusted
    #[inline]
    #[must_use]
    pub const fn sync_received(self) -> bool {
        self.0 & Self::SYNC_RECEIVED != 0
    }

    #[inline]
    #[must_use]
    pub const fn async_received(self) -> bool {
        self.0 & Self::ASYNC_RECEIVED != 0
    }
}

/// Process freezing: the scheduler-level freeze plus the IPC-layer freeze
/// that flushes in-flight synchronous calls
pub trait FreezePort: Send + Sync {
    /// Suspend or resume scheduling of the whole process
    fn set_frozen(&self, pid: Pid, principal: PrincipalId, frozen: bool) -> Result<(), PortError>;

    /// Freeze or unfreeze the IPC layer. Freezing synchronously flushes
    /// in-flight synchronous calls, then rejects new ones.
    fn freeze_ipc(&self, pid: Pid, frozen: bool) -> Result<(), PortError>;

    /// Query what arrived while the IPC layer was frozen
    fn ipc_freeze_info(&self, pid: Pid) -> Result<FreezeTraffic, PortError>;

    /// Whether the process currently holds OS-level file locks
    fn has_file_locks(&self, pid: Pid) -> Result<bool, PortError>;
}

/// Forced termination
pub trait KillPort: Send + Sync {
    fn kill(&self, pid: Pid, reason: &str) -> Result<(), PortError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rss_abs_delta_ignores_total() {
        let a = RssSnapshot {
            total_kb: 100,
            file_kb: 40,
            anon_kb: 50,
            swap_kb: 10,
        };
        let b = RssSnapshot {
            total_kb: 900,
            file_kb: 35,
            anon_kb: 60,
            swap_kb: 10,
        };
        assert_eq!(a.abs_delta_kb(&b), 15);
    }

    #[test]
    fn freeze_traffic_bits() {
        assert!(FreezeTraffic(1).sync_received());
        assert!(!FreezeTraffic(2).sync_received());
        assert!(FreezeTraffic(3).async_received());
        assert!(!FreezeTraffic(0).sync_received());
    }
}
