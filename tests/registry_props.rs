//! Property tests: random acquire/release sequences against a model.
//!
//! The model tracks reference counts per identity tuple. After every step
//! the registry must agree with it, the guest address space must hold
//! exactly one window per live region, and no two live regions may
//! overlap.

use proptest::prelude::*;
use std::collections::HashMap;
use std::time::Duration;
use xtsc_shm::prelude::*;

/// Candidate tuples. Several overlap each other, some are adjacent.
const CANDIDATES: &[(&str, u64, u64, u64)] = &[
    ("a", 0x1000, 0x1000, 0),
    ("a", 0x1000, 0x1000, 0x800),
    ("a", 0x1800, 0x1000, 0),
    ("b", 0x2000, 0x1000, 0),
    ("b", 0x3000, 0x2000, 0x1000),
    ("a", 0x4000, 0x1000, 0),
    ("b", 0x0, 0x10000, 0),
];

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Release(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..CANDIDATES.len()).prop_map(Op::Acquire),
        2 => (0..CANDIDATES.len()).prop_map(Op::Release),
    ]
}

fn key(index: usize) -> RegionKey {
    let (name, address, size, reserved) = CANDIDATES[index];
    RegionKey::new(name, address, size, reserved)
}

fn registry() -> RegionRegistry<RecordingAddressSpace> {
    let directory = MemfdDirectory::new();
    directory.publish("a", 0).unwrap();
    directory.publish("b", 0).unwrap();
    let config = RendezvousConfig::default()
        .with_token(TokenSource::None)
        .with_attempts(1)
        .with_interval(Duration::ZERO);
    let acquirer = SegmentAcquirer::with_opener(config, directory).with_sleeper(|_d: Duration| {});
    RegionRegistry::new(CANDIDATES.len(), acquirer, RecordingAddressSpace::new(), "prop")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_registry_matches_model(ops in prop::collection::vec(op(), 1..40)) {
        let mut registry = registry();
        // candidate index -> (region, refs)
        let mut model: HashMap<usize, (RegionId, usize)> = HashMap::new();

        for op in ops {
            match op {
                Op::Acquire(index) => {
                    let candidate = key(index);
                    let conflicts = model
                        .keys()
                        .any(|&live| live != index && key(live).overlaps(&candidate));
                    let result = registry.acquire(candidate);

                    if conflicts {
                        let is_overlap = matches!(result, Err(Error::Overlap { .. }));
                        prop_assert!(is_overlap);
                    } else {
                        let id = result.unwrap();
                        let entry = model.entry(index).or_insert((id, 0));
                        prop_assert_eq!(entry.0, id);
                        entry.1 += 1;
                    }
                }
                Op::Release(index) => {
                    if let Some((id, refs)) = model.get_mut(&index) {
                        let remaining = registry.release(*id).unwrap();
                        *refs -= 1;
                        prop_assert_eq!(remaining, *refs);
                        if *refs == 0 {
                            model.remove(&index);
                        }
                    }
                }
            }

            prop_assert_eq!(registry.len(), model.len());
            for (&index, &(id, refs)) in &model {
                let region = registry.get(id).unwrap();
                prop_assert_eq!(region.key(), &key(index));
                prop_assert_eq!(region.ref_count(), refs);
            }

            let space = registry.address_space();
            prop_assert_eq!(space.len(), model.len());
            prop_assert_eq!(space.map_calls() - space.unmap_calls(), model.len());

            let live: Vec<_> = registry.regions().map(|(_, r)| r.key().clone()).collect();
            for (i, a) in live.iter().enumerate() {
                for b in &live[i + 1..] {
                    prop_assert!(!a.overlaps(b));
                }
            }
        }

        for (_, (id, refs)) in model {
            for _ in 0..refs {
                registry.release(id).unwrap();
            }
        }
        prop_assert!(registry.is_empty());
        prop_assert!(registry.address_space().is_empty());
    }
}
