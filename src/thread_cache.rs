//! Per-thread slot cache.
//!
//! One bounded free list per size class, touched only by the owning thread.
//! Shared state is reached a batch at a time: an empty list pulls a batch from
//! the central store, a list past its high-water mark flushes its coldest one.

use core::{
  mem,
  ptr::{NonNull, null_mut},
};

use crate::{
  central::Batch,
  error::Result,
  heap::Heap,
  platform::PageSource,
  size_class::{CLASS_COUNT, CLASSES},
  span::FreeBlock,
};

#[derive(Clone, Copy)]
struct FreeList {
  head: *mut FreeBlock,
  len: usize,
}

impl FreeList {
  const EMPTY: Self = Self {
    head: null_mut(),
    len: 0,
  };

  #[inline]
  fn pop(&mut self) -> Option<NonNull<u8>> {
    let block = NonNull::new(self.head)?;
    self.head = unsafe { (*block.as_ptr()).next };
    self.len -= 1;
    Some(block.cast())
  }

  #[inline]
  unsafe fn push(&mut self, slot: NonNull<u8>) {
    let block = slot.as_ptr() as *mut FreeBlock;
    unsafe { (*block).next = self.head };
    self.head = block;
    self.len += 1;
  }

  /// Detach the `n` coldest slots, the end of the list, as a null-terminated batch.
  unsafe fn take(&mut self, n: usize) -> Batch {
    debug_assert!(n > 0 && n <= self.len);
    let keep = self.len - n;
    let head = if keep == 0 {
      mem::replace(&mut self.head, null_mut())
    } else {
      let mut last = self.head;
      for _ in 1..keep {
        last = unsafe { (*last).next };
      }
      unsafe { mem::replace(&mut (*last).next, null_mut()) }
    };
    self.len = keep;
    Batch { head, len: n }
  }
}

pub(crate) struct ThreadCache {
  lists: [FreeList; CLASS_COUNT],
}

impl ThreadCache {
  pub(crate) const fn new() -> Self {
    Self {
      lists: [FreeList::EMPTY; CLASS_COUNT],
    }
  }

  /// Slots held across all classes.
  pub(crate) fn cached_slots(&self) -> usize {
    self.lists.iter().map(|list| list.len).sum()
  }

  #[cfg(test)]
  pub(crate) fn cached_in(&self, class: usize) -> usize {
    self.lists[class].len
  }

  #[inline]
  pub(crate) fn allocate<P: PageSource>(
    &mut self,
    heap: &Heap<P>,
    class: usize,
  ) -> Result<NonNull<u8>> {
    match self.lists[class].pop() {
      Some(slot) => Ok(slot),
      None => self.refill(heap, class),
    }
  }

  /// Pull a batch into the empty list for `class` and hand out its first slot.
  #[inline(never)]
  fn refill<P: PageSource>(&mut self, heap: &Heap<P>, class: usize) -> Result<NonNull<u8>> {
    debug_assert_eq!(self.lists[class].len, 0);
    let store = heap.store(class);
    loop {
      let (batch, released) = store.pull_batch(CLASSES[class].batch);
      heap.retire(released);
      if let Some(first) = NonNull::new(batch.head) {
        self.lists[class] = FreeList {
          head: unsafe { (*first.as_ptr()).next },
          len: batch.len - 1,
        };
        return Ok(first.cast());
      }
      // Store is empty: grow it by one span and try again. Another thread may
      // drain the new span first, hence the loop.
      let span = heap.span_allocator().acquire_span(class)?;
      store.carve(span);
    }
  }

  /// # Safety
  ///
  /// `slot` must be a live slot of size class `class` from `heap`.
  #[inline]
  pub(crate) unsafe fn free<P: PageSource>(
    &mut self,
    heap: &Heap<P>,
    slot: NonNull<u8>,
    class: usize,
  ) {
    let list = &mut self.lists[class];
    unsafe { list.push(slot) };
    if list.len > CLASSES[class].high_water {
      let batch = unsafe { list.take(CLASSES[class].batch) };
      heap.retire(heap.store(class).push_batch(batch));
    }
  }

  /// Return every cached slot to the central stores.
  pub(crate) fn flush_all<P: PageSource>(&mut self, heap: &Heap<P>) {
    for class in 0..CLASS_COUNT {
      let list = &mut self.lists[class];
      while list.len > 0 {
        let n = list.len.min(CLASSES[class].batch);
        let batch = unsafe { list.take(n) };
        heap.retire(heap.store(class).push_batch(batch));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    platform::{CountingPages, OsPages},
    size_class::class_for,
  };

  fn heap() -> Heap<CountingPages> {
    Heap::with_source(CountingPages::new(OsPages::new()))
  }

  #[test]
  fn first_allocation_pulls_one_batch() {
    let heap = heap();
    let mut cache = ThreadCache::new();
    let class = class_for(64).unwrap();

    let slot = cache.allocate(&heap, class).unwrap();
    assert_eq!(cache.cached_in(class), CLASSES[class].batch - 1);
    assert_eq!(heap.span_allocator().mapped_bytes(), crate::config::SPAN_SIZE);

    unsafe { cache.free(&heap, slot, class) };
    assert_eq!(cache.cached_in(class), CLASSES[class].batch);
    cache.flush_all(&heap);
    assert_eq!(cache.cached_slots(), 0);
  }

  #[test]
  fn frees_past_high_water_flush_one_batch() {
    let heap = heap();
    let mut cache = ThreadCache::new();
    let class = class_for(256).unwrap();
    let info = CLASSES[class];

    let slots: Vec<_> = (0..info.high_water + 1)
      .map(|_| cache.allocate(&heap, class).unwrap())
      .collect();
    for slot in slots {
      unsafe { cache.free(&heap, slot, class) };
      assert!(cache.cached_in(class) <= info.high_water);
    }
    assert!(cache.cached_in(class) >= info.high_water + 1 - info.batch);

    cache.flush_all(&heap);
    assert_eq!(cache.cached_slots(), 0);
    assert!(heap.trim(0) > 0);
    assert_eq!(heap.mapped_bytes(), 0);
  }

  #[test]
  fn take_cuts_the_coldest_suffix() {
    let mut storage = [[0u64; 2]; 4];
    let mut list = FreeList::EMPTY;
    for block in storage.iter_mut() {
      unsafe { list.push(NonNull::new(block.as_mut_ptr() as *mut u8).unwrap()) };
    }
    let hottest = storage[3].as_mut_ptr() as usize;

    let batch = unsafe { list.take(3) };
    assert_eq!(batch.len, 3);
    assert_eq!(list.len, 1);

    let mut taken = Vec::new();
    let mut block = batch.head;
    while !block.is_null() {
      taken.push(block as usize);
      block = unsafe { (*block).next };
    }
    assert_eq!(taken.len(), 3);
    assert!(!taken.contains(&hottest));
    assert_eq!(list.pop().map(|p| p.as_ptr() as usize), Some(hottest));
    assert!(list.pop().is_none());

    let mut whole = FreeList::EMPTY;
    unsafe { whole.push(NonNull::new(storage[0].as_mut_ptr() as *mut u8).unwrap()) };
    let batch = unsafe { whole.take(1) };
    assert_eq!(batch.len, 1);
    assert!(whole.head.is_null());
  }
}
