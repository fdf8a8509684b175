//! The allocator context and its per-thread façade.

use core::{
  marker::PhantomData,
  ptr::{self, NonNull},
};

use log::debug;

use crate::{
  central::{Batch, CentralStore},
  config::{Config, MIN_ALIGN, SPAN_SIZE},
  error::{AllocError, Result},
  platform::{OsPages, PageSource},
  size_class::{CLASS_COUNT, MAX_SMALL_SIZE, class_for, class_for_aligned},
  span::{SpanAllocator, SpanKind, SpanList, header_of, usable_size},
  thread_cache::ThreadCache,
};

/// Snapshot of a heap's footprint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Bytes currently mapped from the page source, large objects included.
  pub mapped_bytes: usize,
  /// Unassigned spans parked in the span allocator.
  pub pooled_spans: usize,
  /// Fully free spans held in reserve by size classes.
  pub retained_spans: usize,
}

/// Shared allocator state: one central store per size class and the span
/// allocator behind them.
///
/// Threads allocate through a [`LocalHeap`] obtained with [`Heap::local`].
/// Independent heaps share nothing, so each can be created, exercised and
/// dropped in isolation.
///
/// Dropping a heap returns every idle span to the page source. Allocations
/// still outstanding at that point are leaked.
pub struct Heap<P: PageSource = OsPages> {
  stores: [CentralStore; CLASS_COUNT],
  spans: SpanAllocator<P>,
  config: Config,
}

impl Heap<OsPages> {
  pub fn new() -> Self {
    Self::with_source(OsPages::new())
  }
}

impl Default for Heap<OsPages> {
  fn default() -> Self {
    Self::new()
  }
}

impl<P: PageSource> Heap<P> {
  pub fn with_source(source: P) -> Self {
    Self::with_config(source, Config::default())
  }

  pub fn with_config(source: P, config: Config) -> Self {
    Self {
      stores: core::array::from_fn(|class| CentralStore::new(class, config.retained_spans)),
      spans: SpanAllocator::new(source, config.pool_spans),
      config,
    }
  }

  pub fn config(&self) -> Config {
    self.config
  }

  pub fn source(&self) -> &P {
    self.spans.source()
  }

  /// Register the calling thread: a fresh, empty thread cache bound to this heap.
  pub fn local(&self) -> LocalHeap<'_, P> {
    LocalHeap {
      heap: self,
      cache: ThreadCache::new(),
      _not_send: PhantomData,
    }
  }

  pub fn mapped_bytes(&self) -> usize {
    self.spans.mapped_bytes()
  }

  pub fn stats(&self) -> HeapStats {
    HeapStats {
      mapped_bytes: self.spans.mapped_bytes(),
      pooled_spans: self.spans.pooled_spans(),
      retained_spans: self.stores.iter().map(CentralStore::retained_spans).sum(),
    }
  }

  /// Return idle spans to the OS, keeping up to `pad` bytes of them mapped.
  ///
  /// Only slots already handed back to the central stores count as idle;
  /// thread caches are not touched. Returns the number of bytes released.
  pub fn trim(&self, pad: usize) -> usize {
    let mut idle = SpanList::new();
    for store in &self.stores {
      idle.append(store.drain_idle());
    }
    let doomed = self.spans.trim_pool(idle, pad / SPAN_SIZE);
    if doomed.is_empty() {
      return 0;
    }

    let spans = doomed.len();
    self.quiesce();
    let released = unsafe { self.spans.unmap_spans(doomed) };
    debug!("trim({pad}) released {spans} spans ({released} bytes)");
    released
  }

  /// Usable bytes of the allocation at `ptr`: its slot size or large span capacity.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation from this heap.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    match NonNull::new(ptr) {
      Some(ptr) => unsafe { usable_size(header_of(ptr), ptr) },
      None => 0,
    }
  }

  pub(crate) fn store(&self, class: usize) -> &CentralStore {
    &self.stores[class]
  }

  pub(crate) fn span_allocator(&self) -> &SpanAllocator<P> {
    &self.spans
  }

  /// Dispose of spans a central store no longer wants: park what fits in the
  /// pool and unmap the rest.
  pub(crate) fn retire(&self, spans: SpanList) {
    if spans.is_empty() {
      return;
    }
    let overflow = self.spans.park(spans);
    if !overflow.is_empty() {
      self.quiesce();
      let released = unsafe { self.spans.unmap_spans(overflow) };
      debug!("released {released} bytes of idle spans");
    }
  }

  /// Transfer-stack pops may hold a stale pointer into any small span, and a
  /// span may have moved between classes since. Wait them all out.
  fn quiesce(&self) {
    for store in &self.stores {
      store.quiesce();
    }
  }

  /// Cache-less access, for callers that cannot use a thread cache.
  pub(crate) fn uncached(&self) -> Uncached<'_, P> {
    Uncached { heap: self }
  }
}

impl<P: PageSource> Drop for Heap<P> {
  fn drop(&mut self) {
    self.trim(0);
  }
}

// =============================================================================
// Façade operations
// =============================================================================

/// The allocation family, written once over where slots come from.
pub(crate) trait Frontend<P: PageSource> {
  fn heap(&self) -> &Heap<P>;

  fn take_slot(&mut self, class: usize) -> Result<NonNull<u8>>;

  /// # Safety
  ///
  /// `slot` must be a live slot of class `class`.
  unsafe fn give_slot(&mut self, slot: NonNull<u8>, class: usize);

  fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    match class_for(size) {
      Some(class) => self.take_slot(class),
      None => self.heap().spans.acquire_large(size, MIN_ALIGN),
    }
  }

  fn aligned_allocate(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
    if !align.is_power_of_two() {
      return Err(AllocError::InvalidAlignment(align));
    }
    if align <= MIN_ALIGN {
      return self.allocate(size);
    }
    match class_for_aligned(size, align) {
      Some(class) => self.take_slot(class),
      None => self.heap().spans.acquire_large(size, align),
    }
  }

  fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>> {
    let total = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
    let ptr = self.allocate(total)?;
    // Large objects are fresh mappings and already zero.
    unsafe {
      let span = header_of(ptr);
      if (*span).kind == SpanKind::Small {
        ptr::write_bytes(ptr.as_ptr(), 0, (*span).slot_size as usize);
      }
    }
    Ok(ptr)
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  unsafe fn free(&mut self, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    unsafe {
      let span = header_of(ptr);
      match (*span).kind {
        SpanKind::Small => self.give_slot(ptr, (*span).class as usize),
        _ => self.heap().spans.release_large(span),
      }
    }
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    unsafe { self.heap().usable_size(ptr) }
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap. On success the
  /// old pointer must no longer be used unless it was returned unchanged.
  unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
    let Some(old) = NonNull::new(ptr) else {
      return self.allocate(new_size).map(Some);
    };
    if new_size == 0 {
      unsafe { self.free(ptr) };
      return Ok(None);
    }

    let (kind, old_usable) = unsafe {
      let span = header_of(old);
      ((*span).kind, usable_size(span, old))
    };
    let in_place = match kind {
      SpanKind::Small => new_size <= old_usable,
      // Shrinking a large object below the small range moves it into a slot.
      _ => new_size <= old_usable && new_size > MAX_SMALL_SIZE,
    };
    if in_place {
      return Ok(Some(old));
    }

    let new = self.allocate(new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_usable.min(new_size));
      self.free(ptr);
    }
    Ok(Some(new))
  }
}

/// Slots straight from the central stores, one at a time.
pub(crate) struct Uncached<'h, P: PageSource> {
  heap: &'h Heap<P>,
}

impl<P: PageSource> Frontend<P> for Uncached<'_, P> {
  fn heap(&self) -> &Heap<P> {
    self.heap
  }

  fn take_slot(&mut self, class: usize) -> Result<NonNull<u8>> {
    let store = self.heap.store(class);
    loop {
      let (batch, released) = store.pull_batch(1);
      self.heap.retire(released);
      if let Some(slot) = NonNull::new(batch.head) {
        return Ok(slot.cast());
      }
      store.carve(self.heap.spans.acquire_span(class)?);
    }
  }

  unsafe fn give_slot(&mut self, slot: NonNull<u8>, class: usize) {
    let store = self.heap.store(class);
    self.heap.retire(store.push_batch(Batch::single(slot)));
  }
}

// =============================================================================
// LocalHeap
// =============================================================================

/// One thread's view of a [`Heap`]: the heap plus that thread's slot cache.
///
/// Small allocations and frees touch only the cache until it runs dry or
/// overflows. Dropping the `LocalHeap` (or calling [`LocalHeap::exit`]) is the
/// thread-exit hook: every cached slot goes back to the central stores where
/// other threads can pick it up.
///
/// ```
/// use spanalloc::Heap;
///
/// let heap = Heap::new();
/// let mut local = heap.local();
/// let ptr = local.allocate(100).unwrap();
/// assert!(unsafe { local.usable_size(ptr.as_ptr()) } >= 100);
/// unsafe { local.free(ptr.as_ptr()) };
/// local.exit();
/// ```
pub struct LocalHeap<'h, P: PageSource = OsPages> {
  heap: &'h Heap<P>,
  cache: ThreadCache,
  _not_send: PhantomData<*mut ()>,
}

impl<P: PageSource> Frontend<P> for LocalHeap<'_, P> {
  fn heap(&self) -> &Heap<P> {
    self.heap
  }

  #[inline]
  fn take_slot(&mut self, class: usize) -> Result<NonNull<u8>> {
    self.cache.allocate(self.heap, class)
  }

  #[inline]
  unsafe fn give_slot(&mut self, slot: NonNull<u8>, class: usize) {
    unsafe { self.cache.free(self.heap, slot, class) }
  }
}

impl<'h, P: PageSource> LocalHeap<'h, P> {
  pub fn heap(&self) -> &'h Heap<P> {
    self.heap
  }

  /// At least `size` usable bytes, 16-byte aligned. A zero-byte request
  /// returns a unique pointer that must still be freed.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    Frontend::allocate(self, size)
  }

  /// `align` must be a power of two.
  pub fn aligned_allocate(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
    Frontend::aligned_allocate(self, align, size)
  }

  /// `count * size` zeroed bytes; fails on overflow instead of wrapping.
  pub fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>> {
    Frontend::zero_allocate(self, count, size)
  }

  /// Free a pointer from any `LocalHeap` of the same heap. Null is ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap, freed once.
  pub unsafe fn free(&mut self, ptr: *mut u8) {
    unsafe { Frontend::free(self, ptr) }
  }

  /// Resize in place when the current slot already fits, otherwise move.
  ///
  /// A null `ptr` allocates. A zero `new_size` frees and returns `Ok(None)`.
  /// On error the original allocation is untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  pub unsafe fn reallocate(
    &mut self,
    ptr: *mut u8,
    new_size: usize,
  ) -> Result<Option<NonNull<u8>>> {
    unsafe { Frontend::reallocate(self, ptr, new_size) }
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this heap.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    unsafe { self.heap.usable_size(ptr) }
  }

  /// Slots currently held by this thread's cache.
  pub fn cached_slots(&self) -> usize {
    self.cache.cached_slots()
  }

  /// Hand every cached slot back to the central stores.
  pub fn flush(&mut self) {
    self.cache.flush_all(self.heap);
  }

  /// Flush this thread's cache, then [`Heap::trim`].
  pub fn trim(&mut self, pad: usize) -> usize {
    self.flush();
    self.heap.trim(pad)
  }

  /// Thread-exit hook. Equivalent to dropping the `LocalHeap`.
  pub fn exit(self) {}
}

impl<P: PageSource> Drop for LocalHeap<'_, P> {
  fn drop(&mut self) {
    self.flush();
  }
}
