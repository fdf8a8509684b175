use std::{collections::HashSet, ptr, slice, thread};

use proptest::prelude::*;
use spanalloc::{Config, CountingPages, Heap, MAX_SMALL_SIZE, OsPages, SPAN_SIZE};

fn counting_heap() -> Heap<CountingPages> {
  Heap::with_source(CountingPages::new(OsPages::new()))
}

fn fill(ptr: *mut u8, len: usize, seed: u8) {
  for i in 0..len {
    unsafe { ptr.add(i).write(seed.wrapping_add(i as u8)) };
  }
}

fn holds(ptr: *const u8, len: usize, seed: u8) -> bool {
  let bytes = unsafe { slice::from_raw_parts(ptr, len) };
  bytes
    .iter()
    .enumerate()
    .all(|(i, &b)| b == seed.wrapping_add(i as u8))
}

#[test]
fn single_thread_reuses_freed_slots_in_place() {
  let heap = counting_heap();
  let mut local = heap.local();

  let first: Vec<_> = (0..1000).map(|_| local.allocate(128).unwrap()).collect();
  let maps = heap.source().map_calls();
  let mapped = heap.mapped_bytes();
  for ptr in first.iter().rev() {
    unsafe { local.free(ptr.as_ptr()) };
  }

  let second: Vec<_> = (0..1000).map(|_| local.allocate(128).unwrap()).collect();
  assert_eq!(heap.source().map_calls(), maps, "no new spans were requested");
  assert_eq!(heap.mapped_bytes(), mapped);

  let first: HashSet<_> = first.iter().map(|p| p.as_ptr() as usize).collect();
  let second: HashSet<_> = second.iter().map(|p| p.as_ptr() as usize).collect();
  assert_eq!(first.len(), 1000);
  assert_eq!(first, second);

  for addr in second {
    unsafe { local.free(addr as *mut u8) };
  }
}

#[test]
fn live_allocations_never_overlap() {
  let heap = counting_heap();
  let mut local = heap.local();
  let mut live = Vec::new();
  let mut rnd = 7u32;

  for round in 0..5_000u32 {
    rnd = rnd.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
    let size = match rnd % 16 {
      0 => MAX_SMALL_SIZE + (rnd as usize >> 8) % 100_000,
      1..=3 => 1 + (rnd as usize >> 8) % 8192,
      _ => 1 + (rnd as usize >> 8) % 256,
    };
    let ptr = local.allocate(size).unwrap();
    let usable = unsafe { local.usable_size(ptr.as_ptr()) };
    assert!(usable >= size);
    fill(ptr.as_ptr(), usable, round as u8);
    live.push((ptr, usable, round as u8));

    if rnd & 3 == 0 && !live.is_empty() {
      let (victim, len, seed) = live.swap_remove((rnd as usize >> 4) % live.len());
      assert!(holds(victim.as_ptr(), len, seed));
      unsafe { local.free(victim.as_ptr()) };
    }
  }

  for (ptr, len, seed) in live {
    assert!(holds(ptr.as_ptr(), len, seed), "allocation at {ptr:p} was overwritten");
    unsafe { local.free(ptr.as_ptr()) };
  }
}

#[test]
fn trim_returns_to_baseline() {
  let heap = counting_heap();
  let baseline = heap.source().mapped_pages();
  assert_eq!(baseline, 0);

  let mut local = heap.local();
  let mut ptrs: Vec<_> = (0..20_000)
    .map(|i| local.allocate(16 + (i % 600) * 8).unwrap())
    .collect();
  ptrs.extend((0..8).map(|i| local.allocate(MAX_SMALL_SIZE * (i + 2)).unwrap()));
  assert!(heap.mapped_bytes() > 0);

  for ptr in ptrs {
    unsafe { local.free(ptr.as_ptr()) };
  }
  assert!(local.trim(0) > 0);
  assert_eq!(heap.mapped_bytes(), 0);
  assert_eq!(heap.source().mapped_pages(), baseline);
}

#[test]
fn trim_keeps_the_requested_pad() {
  let heap = Heap::with_config(CountingPages::new(OsPages::new()), Config::new().retained_spans(0));
  let mut local = heap.local();
  let ptrs: Vec<_> = (0..4096).map(|_| local.allocate(1024).unwrap()).collect();
  for ptr in ptrs {
    unsafe { local.free(ptr.as_ptr()) };
  }
  local.trim(3 * SPAN_SIZE);
  assert_eq!(heap.mapped_bytes(), 3 * SPAN_SIZE);
  assert_eq!(heap.stats().pooled_spans, 3);
  assert_eq!(heap.trim(0), 3 * SPAN_SIZE);
}

#[test]
fn thread_exit_makes_freed_slots_available_elsewhere() {
  const N: usize = 4000;
  let heap = counting_heap();

  let kept: Vec<usize> = thread::scope(|s| {
    s.spawn(|| {
      let mut local = heap.local();
      let ptrs: Vec<_> = (0..N).map(|_| local.allocate(256).unwrap()).collect();
      let (freed, kept) = ptrs.split_at(N / 2);
      for ptr in freed {
        unsafe { local.free(ptr.as_ptr()) };
      }
      local.exit();
      kept.iter().map(|p| p.as_ptr() as usize).collect()
    })
    .join()
    .unwrap()
  });

  let mapped = heap.mapped_bytes();
  let maps = heap.source().map_calls();
  let reused: Vec<usize> = thread::scope(|s| {
    s.spawn(|| {
      let mut local = heap.local();
      (0..N / 2)
        .map(|_| local.allocate(256).unwrap().as_ptr() as usize)
        .collect()
    })
    .join()
    .unwrap()
  });
  assert_eq!(heap.mapped_bytes(), mapped);
  assert_eq!(heap.source().map_calls(), maps);

  let kept_set: HashSet<_> = kept.iter().copied().collect();
  assert!(reused.iter().all(|addr| !kept_set.contains(addr)));

  let mut local = heap.local();
  for addr in kept.into_iter().chain(reused) {
    unsafe { local.free(addr as *mut u8) };
  }
  local.trim(0);
  assert_eq!(heap.mapped_bytes(), 0);
}

#[test]
fn frees_from_another_thread_are_accepted() {
  let heap = counting_heap();
  let ptrs: Vec<usize> = {
    let mut local = heap.local();
    (0..3000)
      .map(|i| local.allocate(32 + i % 2000).unwrap().as_ptr() as usize)
      .collect()
  };

  thread::scope(|s| {
    for chunk in ptrs.chunks(1000) {
      let heap = &heap;
      s.spawn(move || {
        let mut local = heap.local();
        for &addr in chunk {
          unsafe { local.free(addr as *mut u8) };
        }
      });
    }
  });
  heap.trim(0);
  assert_eq!(heap.mapped_bytes(), 0);
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(64))]

  #[test]
  fn aligned_allocate_returns_aligned_memory(shift in 0u32..=20, size in 1usize..200_000) {
    let heap = Heap::new();
    let mut local = heap.local();
    let align = 1usize << shift;
    let ptr = local.aligned_allocate(align, size).unwrap();
    prop_assert_eq!(ptr.as_ptr() as usize % align, 0);
    let usable = unsafe { local.usable_size(ptr.as_ptr()) };
    prop_assert!(usable >= size);
    unsafe {
      ptr::write_bytes(ptr.as_ptr(), 0xEE, size);
      local.free(ptr.as_ptr());
    }
  }

  #[test]
  fn reallocate_preserves_the_prefix(
    n in 1usize..70_000,
    grow in 1usize..70_000,
    seed in any::<u8>(),
  ) {
    let heap = Heap::new();
    let mut local = heap.local();
    let ptr = local.allocate(n).unwrap();
    fill(ptr.as_ptr(), n, seed);
    let moved = unsafe { local.reallocate(ptr.as_ptr(), n + grow) }.unwrap().unwrap();
    prop_assert!(holds(moved.as_ptr(), n, seed));
    let usable = unsafe { local.usable_size(moved.as_ptr()) };
    prop_assert!(usable >= n + grow);
    unsafe { local.free(moved.as_ptr()) };
  }
}
