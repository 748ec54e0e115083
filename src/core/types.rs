/*!
 * Core Types
 * Common types used across the warden
 */

/// OS-level process handle; 0 means the process has not been started yet
pub type Pid = i32;

/// Owning security principal of one or more processes
pub type PrincipalId = u32;

/// Stable arena key for a process record, never reused within a run
pub type ProcKey = u64;

/// Eviction priority score; smaller is more important
pub type OomScore = i32;

/// Monotonic sequence number (start sequences, state sequences, LRU cycles)
pub type Seq = u64;
