/*!
 * Process Record
 * The mutable entity tracked for every hosted worker process
 */

use crate::compactor::types::CompactTier;
use crate::core::types::{OomScore, Pid, PrincipalId, ProcKey, Seq};
use crate::policy::bands::{ProcState, INVALID_SCORE, UNKNOWN_SCORE};
use std::time::Instant;

/// One hosted worker process.
///
/// A record with `pid > 0` is starting, running, or already asked to die;
/// a record is removed from the registry only once its pid is confirmed
/// dead and dependents have been notified.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    /// Stable arena key; cross-references between records use this
    pub key: ProcKey,
    pub name: String,
    pub principal: PrincipalId,
    pub pid: Pid,
    /// Monotonic start sequence, unique across all starts in this run
    pub start_seq: Seq,
    pub isolated: bool,
    pub persistent: bool,
    pub pending_start: bool,
    pub killed: bool,

    /// Ceiling the score may never rise above (numerically)
    pub max_score: OomScore,
    /// Score computed by the most recent evaluation
    pub cur_score: OomScore,
    /// Score last applied (pushed to the reclaim daemon)
    pub set_score: OomScore,
    /// Score last confirmed as actually installed
    pub verified_score: OomScore,
    pub cur_state: ProcState,
    pub set_state: ProcState,

    /// Retained only opportunistically, hosting no foreground-relevant work
    pub cached: bool,
    /// Cached and hosting nothing at all
    pub empty: bool,

    /// Hosts visible interactive sessions (or recently did)
    pub hosts_sessions: bool,
    /// Hosts sessions on behalf of clients in other processes
    pub client_sessions: bool,
    /// Bound in a way that should rank it with session hosts
    pub treat_like_session: bool,
    /// Hosts running background services
    pub hosts_services: bool,

    /// Client-session cluster this process belongs to; 0 = none
    pub group: u32,
    /// Caller-assigned ordering within the cluster; smaller = more important
    pub group_importance: u32,

    /// LRU reorder cycle that last moved this record
    pub lru_seq: Seq,
    pub last_activity_at: Option<Instant>,

    pub frozen: bool,
    /// Last freeze or unfreeze transition
    pub freeze_toggle_at: Option<Instant>,
    /// Sticky override: never freeze this process
    pub do_not_freeze: bool,

    pub last_compact_at: Option<Instant>,
    pub last_compact_tier: Option<CompactTier>,
    pub requested_compact_tier: Option<CompactTier>,
    pub pending_compact: bool,

    /// Prior incarnation of the same logical process, still dying
    pub predecessor: Option<ProcKey>,
    /// Replacement incarnation already being started
    pub successor: Option<ProcKey>,

    /// Service hosts this process is bound to (pulled along in the LRU)
    pub connections: Vec<ProcKey>,
    /// Content-provider hosts this process is using
    pub providers: Vec<ProcKey>,
}

impl ProcessRecord {
    #[must_use]
    pub fn new(key: ProcKey, name: String, principal: PrincipalId, start_seq: Seq) -> Self {
        Self {
            key,
            name,
            principal,
            pid: 0,
            start_seq,
            isolated: false,
            persistent: false,
            pending_start: true,
            killed: false,
            max_score: UNKNOWN_SCORE,
            cur_score: UNKNOWN_SCORE,
            set_score: UNKNOWN_SCORE,
            verified_score: INVALID_SCORE,
            cur_state: ProcState::Nonexistent,
            set_state: ProcState::Nonexistent,
            cached: false,
            empty: false,
            hosts_sessions: false,
            client_sessions: false,
            treat_like_session: false,
            hosts_services: false,
            group: 0,
            group_importance: 0,
            lru_seq: 0,
            last_activity_at: None,
            frozen: false,
            freeze_toggle_at: None,
            do_not_freeze: false,
            last_compact_at: None,
            last_compact_tier: None,
            requested_compact_tier: None,
            pending_compact: false,
            predecessor: None,
            successor: None,
            connections: Vec::new(),
            providers: Vec::new(),
        }
    }

    /// Whether LRU placement should treat this record as a session host
    #[inline]
    #[must_use]
    pub fn session_bound(&self) -> bool {
        self.hosts_sessions || self.client_sessions || self.treat_like_session
    }

    /// Hosts its own sessions, as opposed to serving someone else's
    #[inline]
    #[must_use]
    pub fn hosts_own_sessions(&self) -> bool {
        self.hosts_sessions || self.treat_like_session
    }

    /// Whether the OS handle refers to a live (or at least started) process
    #[inline]
    #[must_use]
    pub const fn has_os_process(&self) -> bool {
        self.pid > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_has_no_os_handle() {
        let rec = ProcessRecord::new(1, "worker".into(), 1000, 1);
        assert!(!rec.has_os_process());
        assert!(rec.pending_start);
        assert_eq!(rec.cur_score, UNKNOWN_SCORE);
        assert_eq!(rec.verified_score, INVALID_SCORE);
    }

    #[test]
    fn session_bound_covers_all_roles() {
        let mut rec = ProcessRecord::new(1, "worker".into(), 1000, 1);
        assert!(!rec.session_bound());
        rec.client_sessions = true;
        assert!(rec.session_bound());
        assert!(!rec.hosts_own_sessions());
        rec.treat_like_session = true;
        assert!(rec.hosts_own_sessions());
    }
}
