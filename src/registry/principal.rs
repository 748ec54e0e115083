/*!
 * Principal Aggregate
 * Per-principal bookkeeping shared by all of a principal's processes
 */

use crate::core::types::{PrincipalId, Seq};

/// Aggregate record for one owning principal.
///
/// State sequence numbers are drawn from a registry-global counter so they
/// stay monotonic for a principal even when this record is dropped at zero
/// processes and later re-created; consumers can therefore always tell a
/// newer state report from an older one, without ambiguity from handle
/// reuse.
#[derive(Debug, Clone)]
pub struct PrincipalRecord {
    pub id: PrincipalId,
    pub proc_count: usize,
    /// Most recent state sequence issued for this principal
    pub cur_state_seq: Seq,
}

impl PrincipalRecord {
    #[must_use]
    pub fn new(id: PrincipalId) -> Self {
        Self {
            id,
            proc_count: 0,
            cur_state_seq: 0,
        }
    }
}
