/*!
 * Process Registry
 *
 * The central table of process records, keyed by a stable arena key.
 * Cross-references (predecessor/successor, dependents, principal
 * aggregates) are arena keys, not owned pointers. One coarse mutex owned by
 * the control plane guards the whole registry; all mutation is serialized.
 */

pub mod ids;
pub mod lru;
pub mod principal;
pub mod process;

pub use ids::{CyclicIdRange, IdBlockAllocator};
pub use lru::LruList;
pub use principal::PrincipalRecord;
pub use process::ProcessRecord;

use crate::core::errors::{RegistryError, RegistryResult};
use crate::core::types::{Pid, PrincipalId, ProcKey, Seq};
use log::{info, warn};
use std::collections::HashMap;

/// First identity of the global isolated range
pub const FIRST_ISOLATED_ID: u32 = 90_000;
/// Last identity of the global isolated range
pub const LAST_ISOLATED_ID: u32 = 98_999;
/// First identity reserved for per-group isolated blocks
pub const FIRST_GROUP_ISOLATED_ID: u32 = 190_000;
/// Last identity reserved for per-group isolated blocks
pub const LAST_GROUP_ISOLATED_ID: u32 = 198_999;
/// Identities per per-group block
pub const IDS_PER_GROUP_BLOCK: u32 = 100;

#[derive(Debug)]
pub struct Registry {
    arena: HashMap<ProcKey, ProcessRecord>,
    next_key: ProcKey,
    by_name: HashMap<(String, PrincipalId), ProcKey>,
    by_pid: HashMap<Pid, ProcKey>,
    /// Live isolated processes by their isolated identity
    isolated: HashMap<PrincipalId, ProcKey>,
    principals: HashMap<PrincipalId, PrincipalRecord>,
    /// Global counter behind per-principal state sequences
    state_seq_counter: Seq,
    start_seq_counter: Seq,
    pub lru: LruList,
    /// Identities for sandboxed processes not tied to a spawn group
    pub global_isolated: CyclicIdRange,
    /// Per-spawn-group identity blocks; disjoint from the global range
    pub group_isolated: IdBlockAllocator,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        info!("Process registry initialized");
        Self {
            arena: HashMap::new(),
            next_key: 0,
            by_name: HashMap::new(),
            by_pid: HashMap::new(),
            isolated: HashMap::new(),
            principals: HashMap::new(),
            state_seq_counter: 0,
            start_seq_counter: 0,
            lru: LruList::new(),
            global_isolated: CyclicIdRange::new(FIRST_ISOLATED_ID, LAST_ISOLATED_ID),
            group_isolated: IdBlockAllocator::new(
                FIRST_GROUP_ISOLATED_ID,
                LAST_GROUP_ISOLATED_ID,
                IDS_PER_GROUP_BLOCK,
            ),
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: ProcKey) -> Option<&ProcessRecord> {
        self.arena.get(&key)
    }

    #[must_use]
    pub fn get_mut(&mut self, key: ProcKey) -> Option<&mut ProcessRecord> {
        self.arena.get_mut(&key)
    }

    #[must_use]
    pub fn lookup(&self, name: &str, principal: PrincipalId) -> Option<&ProcessRecord> {
        self.by_name
            .get(&(name.to_string(), principal))
            .and_then(|key| self.arena.get(key))
    }

    #[must_use]
    pub fn lookup_pid(&self, pid: Pid) -> Option<&ProcessRecord> {
        self.by_pid.get(&pid).and_then(|key| self.arena.get(key))
    }

    #[must_use]
    pub fn lookup_pid_key(&self, pid: Pid) -> Option<ProcKey> {
        self.by_pid.get(&pid).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.arena.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProcessRecord> {
        self.arena.values_mut()
    }

    /// Next state sequence for a principal, drawn from the global counter so
    /// it stays monotonic across record re-creation
    pub fn next_state_seq(&mut self, principal: PrincipalId) -> Seq {
        self.state_seq_counter += 1;
        let seq = self.state_seq_counter;
        if let Some(rec) = self.principals.get_mut(&principal) {
            rec.cur_state_seq = seq;
        }
        seq
    }

    #[must_use]
    pub fn principal(&self, id: PrincipalId) -> Option<&PrincipalRecord> {
        self.principals.get(&id)
    }

    /// Create a record for a requested start.
    ///
    /// If a previous incarnation of the same logical process is still dying,
    /// the new record is linked as its successor; at most one such pair may
    /// exist at a time. A live, unkilled record with the same identity is an
    /// error.
    pub fn register_start(
        &mut self,
        name: &str,
        principal: PrincipalId,
    ) -> RegistryResult<ProcKey> {
        let predecessor = match self.lookup(name, principal) {
            Some(old) if !old.killed => {
                return Err(RegistryError::AlreadyRunning {
                    name: name.to_string(),
                    principal,
                });
            }
            Some(old) if old.successor.is_some() => {
                return Err(RegistryError::SuccessorPending {
                    name: name.to_string(),
                    principal,
                });
            }
            Some(old) => Some(old.key),
            None => None,
        };

        self.next_key += 1;
        self.start_seq_counter += 1;
        let key = self.next_key;
        let mut rec = ProcessRecord::new(key, name.to_string(), principal, self.start_seq_counter);
        rec.predecessor = predecessor;
        if let Some(old_key) = predecessor {
            if let Some(old) = self.arena.get_mut(&old_key) {
                old.successor = Some(key);
            }
        }

        self.arena.insert(key, rec);
        self.by_name.insert((name.to_string(), principal), key);
        let entry = self
            .principals
            .entry(principal)
            .or_insert_with(|| PrincipalRecord::new(principal));
        entry.proc_count += 1;

        info!(
            "Registered start: {}/{} key={} seq={}",
            name, principal, key, self.start_seq_counter
        );
        Ok(key)
    }

    /// Register a start for a sandboxed process, allocating an isolated
    /// identity from the global pool.
    pub fn register_isolated_start(&mut self, name: &str) -> RegistryResult<ProcKey> {
        let id = self
            .global_isolated
            .allocate()
            .ok_or(RegistryError::IdentityExhausted)?;
        match self.register_start(name, id) {
            Ok(key) => {
                if let Some(rec) = self.arena.get_mut(&key) {
                    rec.isolated = true;
                }
                self.isolated.insert(id, key);
                Ok(key)
            }
            Err(err) => {
                self.global_isolated.free(id);
                Err(err)
            }
        }
    }

    /// Record the OS handle once the spawn has happened
    pub fn commit_start(&mut self, key: ProcKey, pid: Pid) -> RegistryResult<()> {
        let rec = self
            .arena
            .get_mut(&key)
            .ok_or(RegistryError::NotFound(key))?;
        rec.pid = pid;
        rec.pending_start = false;
        self.by_pid.insert(pid, key);
        Ok(())
    }

    /// Mark a record as killed (by us or by the reclaim daemon). The record
    /// stays until the pid is confirmed dead and [`Registry::remove`] runs.
    pub fn mark_killed(&mut self, key: ProcKey) {
        if let Some(rec) = self.arena.get_mut(&key) {
            rec.killed = true;
        }
    }

    /// Drop a record whose OS handle is confirmed dead.
    ///
    /// Unlinks the predecessor/successor pair, updates the principal
    /// aggregate, frees isolated identities, and removes the LRU entry.
    pub fn remove(&mut self, key: ProcKey) -> RegistryResult<ProcessRecord> {
        {
            let rec = self.arena.get(&key).ok_or(RegistryError::NotFound(key))?;
            if rec.has_os_process() && !rec.killed {
                return Err(RegistryError::StillRunning(key));
            }
        }
        let rec = self.arena.remove(&key).ok_or(RegistryError::NotFound(key))?;

        if let Some(pred) = rec.predecessor {
            if let Some(pred_rec) = self.arena.get_mut(&pred) {
                pred_rec.successor = None;
            }
        }
        if let Some(succ) = rec.successor {
            if let Some(succ_rec) = self.arena.get_mut(&succ) {
                succ_rec.predecessor = None;
            }
        }

        // The name slot may already point at a successor; only clear it when
        // it still refers to the record being removed.
        let name_key = (rec.name.clone(), rec.principal);
        if self.by_name.get(&name_key) == Some(&key) {
            self.by_name.remove(&name_key);
        }
        if rec.pid > 0 && self.by_pid.get(&rec.pid) == Some(&key) {
            self.by_pid.remove(&rec.pid);
        }

        if rec.isolated {
            self.isolated.remove(&rec.principal);
            self.global_isolated.free(rec.principal);
        }

        match self.principals.get_mut(&rec.principal) {
            Some(aggregate) => {
                aggregate.proc_count = aggregate.proc_count.saturating_sub(1);
                if aggregate.proc_count == 0 {
                    self.principals.remove(&rec.principal);
                }
            }
            None => warn!("No principal aggregate for {}", rec.principal),
        }

        self.lru.remove(key);
        info!("Removed process {} ({}/{})", key, rec.name, rec.principal);
        Ok(rec)
    }

    /// Reposition a process in the LRU, cascading to dependents
    pub fn touch_lru(&mut self, key: ProcKey, session_change: bool, client: Option<ProcKey>) {
        self.lru.touch(&mut self.arena, key, session_change, client);
    }

    /// Keys of all processes currently frozen
    #[must_use]
    pub fn frozen_keys(&self) -> Vec<ProcKey> {
        self.arena
            .values()
            .filter(|rec| rec.frozen)
            .map(|rec| rec.key)
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn start_commit_lookup() {
        let mut registry = Registry::new();
        let key = registry.register_start("worker.a", 1000).unwrap();
        registry.commit_start(key, 4242).unwrap();
        let rec = registry.lookup("worker.a", 1000).unwrap();
        assert_eq!(rec.pid, 4242);
        assert!(!rec.pending_start);
        assert_eq!(registry.lookup_pid(4242).unwrap().key, key);
        assert_eq!(registry.principal(1000).unwrap().proc_count, 1);
    }

    #[test]
    fn duplicate_start_rejected() {
        let mut registry = Registry::new();
        registry.register_start("worker.a", 1000).unwrap();
        let err = registry.register_start("worker.a", 1000).unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyRunning {
                name: "worker.a".into(),
                principal: 1000
            }
        );
    }

    #[test]
    fn predecessor_successor_linking() {
        let mut registry = Registry::new();
        let old = registry.register_start("worker.a", 1000).unwrap();
        registry.commit_start(old, 100).unwrap();
        registry.mark_killed(old);

        let new = registry.register_start("worker.a", 1000).unwrap();
        assert_eq!(registry.get(new).unwrap().predecessor, Some(old));
        assert_eq!(registry.get(old).unwrap().successor, Some(new));

        // Only one pending pair at a time.
        let err = registry.register_start("worker.a", 1000).unwrap_err();
        assert!(matches!(err, RegistryError::SuccessorPending { .. }));

        registry.remove(old).unwrap();
        assert_eq!(registry.get(new).unwrap().predecessor, None);
        // The name still resolves to the successor.
        assert_eq!(registry.lookup("worker.a", 1000).unwrap().key, new);
    }

    #[test]
    fn remove_refuses_live_process() {
        let mut registry = Registry::new();
        let key = registry.register_start("worker.a", 1000).unwrap();
        registry.commit_start(key, 77).unwrap();
        assert_eq!(registry.remove(key).unwrap_err(), RegistryError::StillRunning(key));
        registry.mark_killed(key);
        registry.remove(key).unwrap();
        assert!(registry.lookup_pid(77).is_none());
        assert!(registry.principal(1000).is_none());
    }

    #[test]
    fn isolated_start_allocates_and_frees_identity() {
        let mut registry = Registry::new();
        let key = registry.register_isolated_start("sandbox.a").unwrap();
        let principal = registry.get(key).unwrap().principal;
        assert!((FIRST_ISOLATED_ID..=LAST_ISOLATED_ID).contains(&principal));
        assert!(registry.global_isolated.in_use(principal));

        registry.commit_start(key, 55).unwrap();
        registry.mark_killed(key);
        registry.remove(key).unwrap();
        assert!(!registry.global_isolated.in_use(principal));
    }

    #[test]
    fn state_seq_monotonic_across_recreation() {
        let mut registry = Registry::new();
        let a = registry.register_start("worker.a", 1000).unwrap();
        let seq1 = registry.next_state_seq(1000);
        registry.mark_killed(a);
        registry.remove(a).unwrap();
        // Aggregate is gone; a fresh record for the same principal must
        // still observe increasing sequences.
        registry.register_start("worker.a", 1000).unwrap();
        let seq2 = registry.next_state_seq(1000);
        assert!(seq2 > seq1);
    }
}
