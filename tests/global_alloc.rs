use std::{collections::BTreeMap, sync::Arc, thread};

use spanalloc::{SpanAlloc, global};

#[global_allocator]
static ALLOC: SpanAlloc = SpanAlloc;

#[test]
fn std_collections_run_on_spanalloc() {
  let mut map = BTreeMap::new();
  for i in 0..50_000u64 {
    map.insert(i, format!("value-{i}"));
  }
  let total: usize = map.values().map(String::len).sum();
  assert!(total > 50_000 * 7);

  let mut big: Vec<u64> = (0..1_000_000).collect();
  big.retain(|v| v % 3 == 0);
  big.shrink_to_fit();
  assert_eq!(big.len(), 333_334);

  let boxed = vec![0u8; 1 << 20].into_boxed_slice();
  assert!(unsafe { global::usable_size(boxed.as_ptr() as *mut u8) } >= 1 << 20);
}

#[test]
fn threads_share_and_exit_cleanly() {
  let shared = Arc::new((0..10_000).map(|i| i.to_string()).collect::<Vec<_>>());
  let handles: Vec<_> = (0..8)
    .map(|t| {
      let shared = Arc::clone(&shared);
      thread::spawn(move || {
        let mut local: Vec<String> = shared.iter().map(|s| format!("{t}:{s}")).collect();
        local.sort();
        local.len()
      })
    })
    .collect();
  for handle in handles {
    assert_eq!(handle.join().unwrap(), 10_000);
  }
  drop(shared);
  global::on_thread_exit();
  let _ = global::trim(0);
}

#[test]
fn over_aligned_types_are_aligned() {
  #[repr(align(4096))]
  struct Page([u8; 4096]);

  let pages: Vec<Box<Page>> = (0..64).map(|_| Box::new(Page([7; 4096]))).collect();
  for page in &pages {
    assert_eq!(&**page as *const Page as usize % 4096, 0);
    assert_eq!(page.0[4095], 7);
  }
}
