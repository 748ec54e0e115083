/*!
 * LRU List Tests
 * Boundary invariants under arbitrary operation sequences
 */

use procwarden::registry::lru::LruList;
use procwarden::registry::process::ProcessRecord;
use procwarden::registry::Registry;
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Touch { idx: u8, session_change: bool },
    Remove { idx: u8 },
    SetSessions { idx: u8, on: bool },
    SetServices { idx: u8, on: bool },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..12, any::<bool>()).prop_map(|(idx, session_change)| Op::Touch { idx, session_change }),
        (0u8..12).prop_map(|idx| Op::Remove { idx }),
        (0u8..12, any::<bool>()).prop_map(|(idx, on)| Op::SetSessions { idx, on }),
        (0u8..12, any::<bool>()).prop_map(|(idx, on)| Op::SetServices { idx, on }),
    ]
}

proptest! {
    /// Boundaries never exceed the list length, never go negative, and keep
    /// their mutual ordering, no matter the operation sequence.
    #[test]
    fn boundaries_hold_under_any_sequence(ops in proptest::collection::vec(op_strategy(), 1..200)) {
        let mut arena = HashMap::new();
        let mut lru = LruList::new();
        let mut removed = [false; 12];
        for key in 0u64..12 {
            let mut rec = ProcessRecord::new(key + 1, format!("worker.{key}"), 1000 + key as u32, key);
            rec.pid = 100 + key as i32;
            arena.insert(key + 1, rec);
        }

        for op in ops {
            match op {
                Op::Touch { idx, session_change } => {
                    let key = u64::from(idx % 12) + 1;
                    if !removed[(idx % 12) as usize] {
                        lru.touch(&mut arena, key, session_change, None);
                    }
                }
                Op::Remove { idx } => {
                    let key = u64::from(idx % 12) + 1;
                    lru.remove(key);
                    removed[(idx % 12) as usize] = true;
                }
                Op::SetSessions { idx, on } => {
                    let key = u64::from(idx % 12) + 1;
                    if let Some(rec) = arena.get_mut(&key) {
                        rec.hosts_sessions = on;
                    }
                }
                Op::SetServices { idx, on } => {
                    let key = u64::from(idx % 12) + 1;
                    if let Some(rec) = arena.get_mut(&key) {
                        rec.hosts_services = on;
                    }
                }
            }
            let (session, service) = lru.boundaries();
            prop_assert!(service <= session, "service {} > session {}", service, session);
            prop_assert!(session <= lru.len(), "session {} > len {}", session, lru.len());
            // No duplicates ever.
            let mut keys = lru.keys().to_vec();
            keys.sort_unstable();
            keys.dedup();
            prop_assert_eq!(keys.len(), lru.len());
        }
    }
}

/// A foreground process demoted to the cached band leaves the session zone
/// without disturbing the relative order of the remaining session hosts.
#[test]
fn demotion_moves_between_zones() {
    let mut registry = Registry::new();
    let mut keys = Vec::new();
    for i in 0..3 {
        let key = registry
            .register_start(&format!("session.{i}"), 1000 + i)
            .unwrap();
        registry.commit_start(key, 200 + i as i32).unwrap();
        registry.get_mut(key).unwrap().hosts_sessions = true;
        registry.touch_lru(key, true, None);
        keys.push(key);
    }
    let background = registry.register_start("bg.worker", 2000).unwrap();
    registry.commit_start(background, 300).unwrap();
    registry.touch_lru(background, false, None);

    let (session_before, _) = registry.lru.boundaries();
    assert_eq!(session_before, 1);

    // Demote the middle session host: it stops hosting sessions and is
    // touched back into the background zone.
    registry.get_mut(keys[1]).unwrap().hosts_sessions = false;
    registry.touch_lru(keys[1], true, None);

    let (session, service) = registry.lru.boundaries();
    let demoted_pos = registry.lru.index_of(keys[1]).unwrap();
    assert!(demoted_pos < service, "demoted entry should sit below the zones");

    // The remaining session hosts keep their relative order at the tail.
    let pos0 = registry.lru.index_of(keys[0]).unwrap();
    let pos2 = registry.lru.index_of(keys[2]).unwrap();
    assert!(pos0 >= session && pos2 >= session);
    assert!(pos0 < pos2);
}
