/*!
 * Error Types
 * Centralized error handling with thiserror
 */

use crate::core::types::{Pid, PrincipalId, ProcKey};
use thiserror::Error;

/// Registry operation result
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Process registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Process not found: key {0}")]
    NotFound(ProcKey),

    #[error("Process not found for pid {0}")]
    PidNotFound(Pid),

    #[error("Process {name}/{principal} already running")]
    AlreadyRunning { name: String, principal: PrincipalId },

    #[error("Process {name}/{principal} already has a successor pending")]
    SuccessorPending { name: String, principal: PrincipalId },

    #[error("Isolated identity range exhausted")]
    IdentityExhausted,

    #[error("Cannot remove process {0}: still running")]
    StillRunning(ProcKey),
}

/// Reclaim-daemon channel errors
#[derive(Error, Debug)]
pub enum LowmemdError {
    #[error("Reclaim daemon unavailable")]
    Unavailable,

    #[error("Reply did not match request opcode {expected}: got {got}")]
    ReplyMismatch { expected: i32, got: i32 },

    #[error("Short frame: {0} bytes")]
    ShortFrame(usize),

    #[error("Daemon I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Kernel/OS port errors
#[derive(Error, Debug)]
pub enum PortError {
    #[error("Process {0} is gone")]
    ProcessGone(Pid),

    #[error("{op} failed for pid {pid}: {source}")]
    Io {
        op: &'static str,
        pid: Pid,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} unsupported on this host")]
    Unsupported { op: &'static str },
}
