//! Randomized workloads: a proptest mix of alloc/free/resize against a
//! shadow model, and a long deterministic churn run with periodic structure
//! checks.

use std::ptr::NonNull;

use proptest::prelude::*;

use stratalloc::{Heap, MEDIUM_MAX, SMALL_MAX};

#[derive(Debug, Clone)]
enum Op {
  Alloc(usize),
  Free(usize),
  Resize(usize, usize),
}

/// Sizes weighted toward the small tier, the way real workloads skew, with
/// enough mass above both thresholds to exercise every engine.
fn size_strategy() -> impl Strategy<Value = usize> {
  prop_oneof![
    4 => 0usize..=SMALL_MAX,
    2 => SMALL_MAX + 1..=MEDIUM_MAX,
    1 => MEDIUM_MAX + 1..=MEDIUM_MAX + 64 * 1024,
  ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
  prop_oneof![
    3 => size_strategy().prop_map(Op::Alloc),
    2 => (0usize..64).prop_map(Op::Free),
    1 => ((0usize..64), size_strategy()).prop_map(|(i, s)| Op::Resize(i, s)),
  ]
}

fn fill(ptr: NonNull<u8>, len: usize, pattern: u8) {
  unsafe { ptr.as_ptr().write_bytes(pattern, len) };
}

fn check(ptr: NonNull<u8>, len: usize, pattern: u8) {
  for i in 0..len {
    assert_eq!(
      unsafe { *ptr.as_ptr().add(i) },
      pattern,
      "payload corrupted at byte {i}"
    );
  }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(48))]

  #[test]
  fn mixed_ops_preserve_structure_and_data(ops in proptest::collection::vec(op_strategy(), 1..200)) {
    let mut heap = Heap::new();
    let mut shadow: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
    let mut next_pattern = 0u8;

    for op in ops {
      match op {
        Op::Alloc(size) => {
          let p = heap.allocate(size).unwrap();
          let len = size.max(1);
          next_pattern = next_pattern.wrapping_add(0x3b) | 1;
          fill(p, len, next_pattern);
          shadow.push((p, len, next_pattern));
        }
        Op::Free(index) => {
          if shadow.is_empty() {
            continue;
          }
          let (p, len, pattern) = shadow.swap_remove(index % shadow.len());
          check(p, len, pattern);
          unsafe { heap.free(p) };
        }
        Op::Resize(index, new_size) => {
          if shadow.is_empty() {
            continue;
          }
          let slot = index % shadow.len();
          let (p, len, pattern) = shadow[slot];
          let q = unsafe { heap.resize(p, new_size).unwrap() };
          let new_len = new_size.max(1);
          check(q, len.min(new_len), pattern);
          fill(q, new_len, pattern);
          shadow[slot] = (q, new_len, pattern);
        }
      }
    }

    heap.verify_integrity().unwrap();
    prop_assert_eq!(heap.statistics().live_blocks(), shadow.len() as u64);

    for (p, len, pattern) in shadow.drain(..) {
      check(p, len, pattern);
      unsafe { heap.free(p) };
    }
    heap.verify_integrity().unwrap();
    prop_assert_eq!(heap.statistics().live_blocks(), 0);
  }
}

/// Unseeded pseudo-random churn: 5000 operations over 128 slots, fixed LCG,
/// structural verification every 256 steps. Deterministic, so a failure here
/// reproduces exactly.
#[test]
fn long_churn_run_stays_consistent() {
  const STEPS: usize = 5000;
  const SLOTS: usize = 128;

  let mut heap = Heap::new();
  let mut slots: Vec<Option<(NonNull<u8>, usize, u8)>> = vec![None; SLOTS];
  let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
  let mut rng = move || {
    state = state
      .wrapping_mul(6364136223846793005)
      .wrapping_add(1442695040888963407);
    state >> 16
  };

  for step in 0..STEPS {
    let r = rng();
    let slot = (r as usize) % SLOTS;
    match slots[slot].take() {
      Some((p, len, pattern)) => {
        check(p, len, pattern);
        if r & 0x100 != 0 {
          // Resize instead of free, one time in two.
          let new_size = pick_size(rng());
          let q = unsafe { heap.resize(p, new_size).unwrap() };
          let new_len = new_size.max(1);
          check(q, len.min(new_len), pattern);
          fill(q, new_len, pattern);
          slots[slot] = Some((q, new_len, pattern));
        } else {
          unsafe { heap.free(p) };
        }
      }
      None => {
        let size = pick_size(r);
        let p = heap.allocate(size).unwrap();
        let len = size.max(1);
        let pattern = (r as u8) | 1;
        fill(p, len, pattern);
        slots[slot] = Some((p, len, pattern));
      }
    }

    if step % 256 == 0 {
      heap.verify_integrity().unwrap();
    }
  }

  heap.verify_integrity().unwrap();
  let live = slots.iter().flatten().count() as u64;
  assert_eq!(heap.statistics().live_blocks(), live);

  for entry in slots.iter_mut() {
    if let Some((p, len, pattern)) = entry.take() {
      check(p, len, pattern);
      unsafe { heap.free(p) };
    }
  }
  heap.verify_integrity().unwrap();
  assert_eq!(heap.statistics().live_blocks(), 0);
}

/// Maps raw bits to a size, skewed toward the small tier.
fn pick_size(r: u64) -> usize {
  match r % 10 {
    0..=5 => (r as usize / 16) % SMALL_MAX + 1,
    6..=8 => SMALL_MAX + 1 + (r as usize / 16) % (MEDIUM_MAX - SMALL_MAX),
    _ => MEDIUM_MAX + 1 + (r as usize / 16) % (128 * 1024),
  }
}
