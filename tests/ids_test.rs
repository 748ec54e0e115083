/*!
 * Identity Allocator Tests
 * Exclusivity under arbitrary allocate/free interleavings
 */

use procwarden::registry::ids::{CyclicIdRange, IdBlockAllocator};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    Allocate,
    FreeNth(u8),
}

fn ops() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Allocate),
        1 => (0u8..255).prop_map(Op::FreeNth),
    ]
}

proptest! {
    /// No two concurrently-held identities from one pool are ever equal,
    /// and every handed-out identity stays inside the pool's range.
    #[test]
    fn cyclic_ids_are_exclusive(ops in proptest::collection::vec(ops(), 1..300)) {
        let mut range = CyclicIdRange::new(100, 131);
        let mut held: Vec<u32> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate => {
                    if let Some(id) = range.allocate() {
                        prop_assert!((100..=131).contains(&id));
                        prop_assert!(!held.contains(&id), "duplicate live id {}", id);
                        held.push(id);
                    } else {
                        // Exhausted means every id really is held.
                        prop_assert_eq!(held.len(), 32);
                    }
                }
                Op::FreeNth(n) => {
                    if !held.is_empty() {
                        let id = held.remove(n as usize % held.len());
                        range.free(id);
                    }
                }
            }
        }
    }

    /// Blocks from the range allocator never overlap, across any sequence of
    /// acquisitions and releases.
    #[test]
    fn blocks_stay_disjoint(
        calls in proptest::collection::vec((0u8..6, any::<bool>()), 1..60)
    ) {
        let mut alloc = IdBlockAllocator::new(5_000, 5_399, 100);
        let names = ["a", "b", "c", "d", "e", "f"];

        for (who, release) in calls {
            let name = names[who as usize];
            if release {
                alloc.release(name, 1);
            } else {
                let _ = alloc.get_or_create(name, 1);
            }

            // Collect live block bounds and check pairwise disjointness.
            let mut bounds = Vec::new();
            for name in names {
                if let Some(range) = alloc.get(name, 1) {
                    bounds.push((range.first(), range.last()));
                }
            }
            let unique: HashSet<_> = bounds.iter().copied().collect();
            prop_assert_eq!(unique.len(), bounds.len());
            for (i, a) in bounds.iter().enumerate() {
                for b in &bounds[i + 1..] {
                    prop_assert!(a.1 < b.0 || b.1 < a.0, "overlap {:?} {:?}", a, b);
                }
            }
        }
    }
}
