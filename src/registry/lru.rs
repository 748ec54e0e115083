/*!
 * LRU List
 *
 * The ordered eviction sequence of all live processes. The head is the
 * least-recently-used entry; three conceptual zones run from the tail:
 * session hosts, then service hosts, then everything else, tracked by two
 * boundary indices. Reordering is O(list length), which is fine at the
 * tens-to-hundreds scale this list runs at.
 */

use crate::core::types::{ProcKey, Seq};
use crate::registry::process::ProcessRecord;
use log::{debug, warn};
use std::collections::HashMap;
use std::time::Instant;

pub type Arena = HashMap<ProcKey, ProcessRecord>;

#[derive(Debug, Default)]
pub struct LruList {
    /// Head = least recently used
    entries: Vec<ProcKey>,
    /// Index where the session-hosting zone begins
    session_zone_start: usize,
    /// Index where the service-hosting zone begins; never above
    /// `session_zone_start`
    service_zone_start: usize,
    /// Reorder cycle counter; each dependent moves at most once per cycle
    seq: Seq,
}

impl LruList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn keys(&self) -> &[ProcKey] {
        &self.entries
    }

    /// (session zone start, service zone start)
    #[inline]
    #[must_use]
    pub fn boundaries(&self) -> (usize, usize) {
        (self.session_zone_start, self.service_zone_start)
    }

    #[must_use]
    pub fn index_of(&self, key: ProcKey) -> Option<usize> {
        self.entries.iter().rposition(|&k| k == key)
    }

    /// Reposition `key` to the front of the zone matching its current role,
    /// pulling unvisited dependents along.
    ///
    /// A session-hosting process that is not the subject of an explicit
    /// session change is left untouched: background churn is not evidence of
    /// renewed relevance. When `client` is given, the process is never
    /// lifted above that client's position.
    pub fn touch(
        &mut self,
        arena: &mut Arena,
        key: ProcKey,
        session_change: bool,
        client: Option<ProcKey>,
    ) {
        let (has_session, has_service, persistent) = match arena.get(&key) {
            Some(rec) => (rec.session_bound(), rec.hosts_services, rec.persistent),
            None => return,
        };
        if !session_change && has_session {
            // Only session-driven events may move session hosts; their zone
            // keeps its order through generic churn.
            return;
        }

        self.seq += 1;
        let now = Instant::now();
        if let Some(rec) = arena.get_mut(&key) {
            rec.last_activity_at = Some(now);
        }

        // Quick reject: already at the position it would move to.
        if has_session {
            if self.entries.last() == Some(&key) {
                return;
            }
        } else if self.service_zone_start > 0
            && self.entries.get(self.service_zone_start - 1) == Some(&key)
        {
            return;
        }

        let old_index = self.index_of(key);

        if persistent && old_index.is_some() {
            // Persistent processes just need to be somewhere in the list.
            return;
        }

        if let Some(i) = old_index {
            if i < self.session_zone_start {
                self.session_zone_start -= 1;
            }
            if i < self.service_zone_start {
                self.service_zone_start -= 1;
            }
            self.entries.remove(i);
        }

        let mut next_index: isize;
        let mut next_session_index: isize = -1;

        if has_session {
            let len = self.entries.len();
            next_index = self.service_zone_start as isize;
            let (hosts_own, principal) = {
                let rec = &arena[&key];
                (rec.hosts_own_sessions(), rec.principal)
            };
            if !hosts_own && self.session_zone_start + 1 < len {
                // Serves sessions for clients elsewhere: slot it below the
                // process that is binding to it.
                let mut pos = len - 1;
                while pos > self.session_zone_start {
                    if arena[&self.entries[pos]].principal == principal {
                        break;
                    }
                    pos -= 1;
                }
                self.entries.insert(pos, key);
                let mut end_index = pos as isize - 1;
                if end_index < self.session_zone_start as isize {
                    end_index = self.session_zone_start as isize;
                }
                next_session_index = end_index;
                self.order_client_session_group(
                    arena,
                    key,
                    pos as isize,
                    self.session_zone_start as isize,
                    end_index,
                );
            } else {
                debug!("LRU: moving {} to top of session zone", key);
                self.entries.push(key);
                next_session_index = self.entries.len() as isize - 1;
            }
        } else if has_service {
            debug!("LRU: moving {} to top of service zone", key);
            self.entries.insert(self.session_zone_start, key);
            next_index = self.service_zone_start as isize;
            self.session_zone_start += 1;
        } else {
            let mut index = self.service_zone_start;
            if let Some(client_key) = client {
                // Don't lift the process above its client, but also don't
                // let the restriction push it below where it already was.
                let old = old_index.map_or(-1, |i| i as isize);
                let mut client_index = self.index_of(client_key).map_or(-1, |i| i as isize);
                if client_index < 0 {
                    debug!("LRU: unknown client {} while touching {}", client_key, key);
                }
                if client_index <= old {
                    client_index = old;
                }
                if client_index >= 0 && index as isize > client_index {
                    index = client_index as usize;
                }
            }
            debug!("LRU: inserting {} at {} in background zone", key, index);
            self.entries.insert(index, key);
            next_index = index as isize - 1;
            self.session_zone_start += 1;
            self.service_zone_start += 1;
            if index > 1 {
                self.order_client_session_group(
                    arena,
                    key,
                    self.service_zone_start as isize - 1,
                    0,
                    index as isize - 1,
                );
            }
        }

        if let Some(rec) = arena.get_mut(&key) {
            rec.lru_seq = self.seq;
        }

        // Pull along anything this process is holding onto, bounded by the
        // zone the trigger lives in; each dependent moves once per cycle.
        let seq = self.seq;
        let connections: Vec<ProcKey> = arena[&key].connections.clone();
        for dep in connections.into_iter().rev() {
            let (visited, dep_persistent, dep_client_sessions) = match arena.get(&dep) {
                Some(rec) => (rec.lru_seq == seq, rec.persistent, rec.client_sessions),
                None => continue,
            };
            if visited || dep_persistent {
                continue;
            }
            if dep_client_sessions {
                if next_session_index >= 0 {
                    next_session_index =
                        self.move_dependent(arena, dep, next_session_index, now, key);
                }
            } else {
                next_index = self.move_dependent(arena, dep, next_index, now, key);
            }
        }
        let providers: Vec<ProcKey> = arena[&key].providers.clone();
        for dep in providers.into_iter().rev() {
            let skip = match arena.get(&dep) {
                Some(rec) => rec.lru_seq == seq || rec.persistent,
                None => true,
            };
            if !skip {
                next_index = self.move_dependent(arena, dep, next_index, now, key);
            }
        }
    }

    /// Remove a process from the list, keeping the zone boundaries from
    /// drifting.
    pub fn remove(&mut self, key: ProcKey) {
        if let Some(i) = self.index_of(key) {
            if i < self.session_zone_start {
                self.session_zone_start -= 1;
            }
            if i < self.service_zone_start {
                self.service_zone_start -= 1;
            }
            self.entries.remove(i);
        }
    }

    /// Move one dependent toward `index`, never forward past it, never into
    /// the session zone, and never backwards.
    fn move_dependent(
        &mut self,
        arena: &mut Arena,
        key: ProcKey,
        index: isize,
        now: Instant,
        src: ProcKey,
    ) -> isize {
        let hosts_sessions = match arena.get_mut(&key) {
            Some(rec) => {
                rec.last_activity_at = Some(now);
                rec.hosts_sessions
            }
            None => return index,
        };
        if hosts_sessions {
            // Session hosts keep their own ordering.
            return index;
        }

        let Some(old) = self.index_of(key) else {
            warn!("LRU: dependent {} of {} not on list", key, src);
            return index;
        };
        let old = old as isize;

        if old >= index {
            // Never move a dependent backwards as if it were less recent.
            return index;
        }
        if old >= self.session_zone_start as isize && index < self.session_zone_start as isize {
            return index;
        }

        self.entries.remove(old as usize);
        let index = if index > 0 { index - 1 } else { index };
        debug!("LRU: moving dependent {} from {} to {}", key, old, index);
        self.entries.insert(index as usize, key);
        if let Some(rec) = arena.get_mut(&key) {
            rec.lru_seq = self.seq;
        }
        index
    }

    /// After inserting a process that exists to serve client sessions, make
    /// sure its cluster sits adjacent to it ordered by group importance, and
    /// spread its other entries between foreign apps so one busy process
    /// cannot spam the zone. Only `[bottom_i, top_i]` is touched.
    fn order_client_session_group(
        &mut self,
        arena: &Arena,
        top_key: ProcKey,
        top_i: isize,
        bottom_i: isize,
        mut end_index: isize,
    ) {
        let (principal, group, group_importance) = {
            let rec = &arena[&top_key];
            if rec.hosts_own_sessions() || !rec.client_sessions {
                return;
            }
            (rec.principal, rec.group, rec.group_importance)
        };

        if group > 0 {
            // Pull the rest of the cluster up next to the freshly inserted
            // member, ordered by importance within the cluster.
            let mut end_importance = group_importance;
            let mut i = end_index;
            while i >= bottom_i {
                let sub = self.entries[i as usize];
                let (sub_principal, sub_group, sub_importance) = {
                    let rec = &arena[&sub];
                    (rec.principal, rec.group, rec.group_importance)
                };
                if sub_principal == principal && sub_group == group {
                    if i == end_index && sub_importance >= end_importance {
                        // Already positioned correctly within the cluster.
                        end_index -= 1;
                        end_importance = sub_importance;
                    } else {
                        let mut moved = false;
                        let mut pos = top_i;
                        while pos > end_index {
                            let pos_rec = &arena[&self.entries[pos as usize]];
                            if sub_importance <= pos_rec.group_importance {
                                self.entries.remove(i as usize);
                                self.entries.insert(pos as usize, sub);
                                moved = true;
                                end_index -= 1;
                                break;
                            }
                            pos -= 1;
                        }
                        if !moved {
                            self.entries.remove(i as usize);
                            self.entries.insert(end_index as usize, sub);
                            end_index -= 1;
                            end_importance = sub_importance;
                        }
                    }
                }
                i -= 1;
            }
        }

        // Distribute remaining entries of this process between other apps so
        // a burst of client work cannot flood the zone.
        let mut i = end_index;
        while i >= bottom_i {
            let mut sub = self.entries[i as usize];
            if arena[&sub].principal == principal {
                i -= 1;
                continue;
            }
            if i < end_index {
                let mut has_session_host = false;
                let mut conn_principal = 0;
                let mut conn_group = 0;
                while i >= bottom_i {
                    self.entries.remove(i as usize);
                    self.entries.insert(end_index as usize, sub);
                    i -= 1;
                    if i < bottom_i {
                        break;
                    }
                    sub = self.entries[i as usize];
                    let rec = &arena[&sub];
                    if rec.hosts_own_sessions() {
                        // Pull up at most one session host per gap.
                        if has_session_host {
                            break;
                        }
                        has_session_host = true;
                    } else if rec.client_sessions {
                        if has_session_host {
                            if conn_principal == 0 || conn_principal != rec.principal {
                                break;
                            }
                            if conn_group == 0 || conn_group != rec.group {
                                break;
                            }
                        } else {
                            has_session_host = true;
                            conn_principal = rec.principal;
                            conn_group = rec.group;
                        }
                    }
                    end_index -= 1;
                }
            }
            // Skip past entries of other apps, then past the next whole
            // cluster of this app, keeping existing relative order.
            end_index -= 1;
            while end_index >= bottom_i {
                if arena[&self.entries[end_index as usize]].principal == principal {
                    break;
                }
                end_index -= 1;
            }
            if end_index >= bottom_i {
                let end_group = arena[&self.entries[end_index as usize]].group;
                end_index -= 1;
                while end_index >= bottom_i {
                    let rec = &arena[&self.entries[end_index as usize]];
                    if rec.principal != principal || rec.group != end_group {
                        break;
                    }
                    end_index -= 1;
                }
            }
            i = end_index;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::process::ProcessRecord;

    fn record(key: ProcKey, principal: u32) -> ProcessRecord {
        let mut rec = ProcessRecord::new(key, format!("worker.{key}"), principal, key);
        rec.pid = key as i32 + 100;
        rec
    }

    fn setup(n: u64) -> (Arena, LruList) {
        let mut arena = Arena::new();
        for key in 1..=n {
            arena.insert(key, record(key, 1000 + key as u32));
        }
        (arena, LruList::new())
    }

    fn check_invariants(lru: &LruList) {
        let (session, service) = lru.boundaries();
        assert!(service <= session, "service {} > session {}", service, session);
        assert!(session <= lru.len(), "session {} > len {}", session, lru.len());
    }

    #[test]
    fn background_touch_builds_other_zone() {
        let (mut arena, mut lru) = setup(3);
        lru.touch(&mut arena, 1, false, None);
        lru.touch(&mut arena, 2, false, None);
        lru.touch(&mut arena, 3, false, None);
        // Most recent background entry sits at the top of the other zone.
        assert_eq!(lru.keys(), &[1, 2, 3]);
        assert_eq!(lru.boundaries(), (3, 3));
        check_invariants(&lru);
    }

    #[test]
    fn session_host_goes_to_tail() {
        let (mut arena, mut lru) = setup(3);
        lru.touch(&mut arena, 1, false, None);
        lru.touch(&mut arena, 2, false, None);
        arena.get_mut(&3).unwrap().hosts_sessions = true;
        lru.touch(&mut arena, 3, true, None);
        assert_eq!(*lru.keys().last().unwrap(), 3);
        let (session, _) = lru.boundaries();
        assert_eq!(session, 2);
        check_invariants(&lru);
    }

    #[test]
    fn session_host_ignores_background_churn() {
        let (mut arena, mut lru) = setup(2);
        arena.get_mut(&1).unwrap().hosts_sessions = true;
        lru.touch(&mut arena, 1, true, None);
        lru.touch(&mut arena, 2, false, None);
        let before = lru.keys().to_vec();
        // A non-session touch must not move the session host.
        lru.touch(&mut arena, 1, false, None);
        assert_eq!(lru.keys(), &before[..]);
    }

    #[test]
    fn service_host_enters_service_zone() {
        let (mut arena, mut lru) = setup(3);
        lru.touch(&mut arena, 1, false, None);
        arena.get_mut(&2).unwrap().hosts_sessions = true;
        lru.touch(&mut arena, 2, true, None);
        arena.get_mut(&3).unwrap().hosts_services = true;
        lru.touch(&mut arena, 3, false, None);
        // Service host slots between the other zone and the session zone.
        assert_eq!(lru.keys(), &[1, 3, 2]);
        assert_eq!(lru.boundaries(), (2, 1));
        check_invariants(&lru);
    }

    #[test]
    fn persistent_entries_do_not_move() {
        let (mut arena, mut lru) = setup(2);
        arena.get_mut(&1).unwrap().persistent = true;
        lru.touch(&mut arena, 1, false, None);
        lru.touch(&mut arena, 2, false, None);
        let before = lru.keys().to_vec();
        lru.touch(&mut arena, 1, false, None);
        assert_eq!(lru.keys(), &before[..]);
    }

    #[test]
    fn remove_adjusts_boundaries() {
        let (mut arena, mut lru) = setup(3);
        lru.touch(&mut arena, 1, false, None);
        lru.touch(&mut arena, 2, false, None);
        arena.get_mut(&3).unwrap().hosts_sessions = true;
        lru.touch(&mut arena, 3, true, None);
        let (session_before, service_before) = lru.boundaries();
        lru.remove(1);
        let (session, service) = lru.boundaries();
        assert_eq!(session, session_before - 1);
        assert_eq!(service, service_before - 1);
        assert_eq!(lru.len(), 2);
        check_invariants(&lru);
    }

    #[test]
    fn client_clamp_limits_position() {
        let (mut arena, mut lru) = setup(4);
        lru.touch(&mut arena, 1, false, None); // client, at index 0
        lru.touch(&mut arena, 2, false, None);
        lru.touch(&mut arena, 3, false, None);
        // 4 is touched on behalf of client 1: it may not rise above 1.
        lru.touch(&mut arena, 4, false, Some(1));
        assert_eq!(lru.keys()[0], 4);
        check_invariants(&lru);
    }

    #[test]
    fn dependents_are_pulled_along() {
        let (mut arena, mut lru) = setup(3);
        lru.touch(&mut arena, 2, false, None); // dependent service host
        lru.touch(&mut arena, 1, false, None);
        lru.touch(&mut arena, 3, false, None);
        assert_eq!(lru.keys(), &[2, 1, 3]);
        // 1 binds 2; touching 1 drags 2 up right below it.
        arena.get_mut(&1).unwrap().connections = vec![2];
        lru.touch(&mut arena, 1, false, None);
        assert_eq!(lru.keys(), &[2, 3, 1]);
        let pos2 = lru.index_of(2).unwrap();
        let pos3 = lru.index_of(3).unwrap();
        assert!(pos2 < pos3 || pos2 + 1 == lru.index_of(1).unwrap());
        check_invariants(&lru);
    }

    #[test]
    fn dependent_moves_once_per_cycle() {
        let (mut arena, mut lru) = setup(3);
        lru.touch(&mut arena, 2, false, None);
        lru.touch(&mut arena, 1, false, None);
        lru.touch(&mut arena, 3, false, None);
        arena.get_mut(&1).unwrap().connections = vec![2, 2];
        lru.touch(&mut arena, 1, false, None);
        // Second reference to the same dependent is a no-op for the cycle.
        assert_eq!(lru.index_of(2).unwrap(), 0);
        check_invariants(&lru);
    }

    #[test]
    fn group_members_cluster_by_importance() {
        let (mut arena, mut lru) = setup(5);
        // 5 hosts sessions; 1..3 serve client sessions for principal 1001.
        for key in [1u64, 2, 3] {
            let rec = arena.get_mut(&key).unwrap();
            rec.principal = 2000;
            rec.client_sessions = true;
            rec.group = 7;
            rec.group_importance = key as u32;
        }
        arena.get_mut(&4).unwrap().hosts_sessions = true;
        arena.get_mut(&5).unwrap().hosts_sessions = true;
        arena.get_mut(&5).unwrap().principal = 2000;
        lru.touch(&mut arena, 1, true, None);
        lru.touch(&mut arena, 2, true, None);
        lru.touch(&mut arena, 4, true, None);
        lru.touch(&mut arena, 5, true, None);
        lru.touch(&mut arena, 3, true, None);
        check_invariants(&lru);
        // All three group members are adjacent.
        let positions: Vec<usize> = [1u64, 2, 3]
            .iter()
            .map(|k| lru.index_of(*k).unwrap())
            .collect();
        let min = *positions.iter().min().unwrap();
        let max = *positions.iter().max().unwrap();
        assert_eq!(max - min, 2, "group not adjacent: {:?}", positions);
    }
}
