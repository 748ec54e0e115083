/*!
 * System Limits and Constants
 *
 * Centralized location for system-wide limits, thresholds, and magic numbers,
 * grouped by domain.
 */

use std::time::Duration;

// =============================================================================
// MEMORY / THRESHOLD LIMITS
// =============================================================================

/// Kernel page size assumed when converting min-free levels to pages
pub const PAGE_SIZE_BYTES: u64 = 4 * 1024;

/// The reclaim daemon accepts at most this many (min-free, score) buckets
pub const MAX_DAEMON_BUCKETS: usize = 6;

// =============================================================================
// DAEMON CONNECTION
// =============================================================================

/// Delay between reconnect attempts to the reclaim daemon
pub const DAEMON_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// A blocking exchange waits at most this many reconnect cycles before
/// failing soft
pub const DAEMON_EXCHANGE_RETRY_CYCLES: u32 = 3;

/// Largest frame either side may send (TARGET with a full bucket table)
pub const MAX_DAEMON_FRAME_BYTES: usize = 4 * (2 * MAX_DAEMON_BUCKETS + 1);

// =============================================================================
// PROCESS LIFECYCLE
// =============================================================================

/// How long to wait for a kill to be confirmed before escalating
pub const PROC_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Never trim below this many cached processes
pub const MIN_CACHED_PROCESSES: usize = 2;

// =============================================================================
// COMPACTION
// =============================================================================

/// Capacity of the per-process post-compaction footprint table; oldest
/// entries are evicted first
pub const COMPACT_STATS_CAPACITY: usize = 100;
