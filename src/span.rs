//! Spans and the span allocator.
//!
//! A span is a 64 KiB region aligned to its own size with a [`SpanHeader`] at
//! offset 0. Small-object spans are carved into equal slots; a large object
//! gets a dedicated mapping whose header sits at the same place. Slots never
//! begin at offset 0, so the header of any live pointer `p` is found at
//! `(p - 1) & !(SPAN_SIZE - 1)` without a per-object header.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use log::debug;

use crate::{
  config::{MIN_ALIGN, SPAN_ALIGN_MASK, SPAN_HEADER_SIZE, SPAN_SIZE},
  error::{AllocError, Result},
  lock::SpinLock,
  platform::PageSource,
  size_class::{CLASSES, align_up},
};

/// Magic number to identify valid SpanHeaders
const SPAN_MAGIC: u64 = 0x5350_414E_414C_4C43; // "SPANALLC"

const _: () = assert!(size_of::<SpanHeader>() == SPAN_HEADER_SIZE);
const _: () = assert!(size_of::<FreeBlock>() <= MIN_ALIGN);

// =============================================================================
// Types
// =============================================================================

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SpanKind {
  /// Carved into slots of one size class.
  Small = 0,
  /// One large object covering the whole mapping.
  Large = 1,
  /// Placeholder inside an over-aligned large object, pointing at the real header.
  Forward = 2,
}

/// Overlay of a free slot.
///
/// `next` chains slots inside a batch or a free list. `next_batch` is only
/// meaningful on the first slot of a batch parked on a central transfer stack.
#[repr(C)]
pub(crate) struct FreeBlock {
  pub(crate) next: *mut FreeBlock,
  pub(crate) next_batch: AtomicPtr<FreeBlock>,
}

/// Span metadata. Sits at offset 0 of each span.
///
/// Everything below `magic`/`kind`/`class` is mutated only under the owning
/// size class's lock (small spans) or by the single caller that holds the
/// large object.
#[repr(C, align(128))]
pub(crate) struct SpanHeader {
  magic: u64,
  pub(crate) kind: SpanKind,
  pub(crate) class: u8,
  /// Linked into its class's partial list.
  pub(crate) in_partial: bool,
  pub(crate) slot_size: u32,
  pub(crate) capacity: u32,
  /// Slots handed out of this span: cached by threads, live with callers, or
  /// parked on the transfer stack.
  pub(crate) used: u32,
  /// Slots returned to this span.
  pub(crate) free: *mut FreeBlock,
  /// Next never-used slot.
  pub(crate) bump: *mut u8,
  pub(crate) bump_end: *mut u8,
  pub(crate) prev: *mut SpanHeader,
  pub(crate) next: *mut SpanHeader,
  /// Whole mapping, for unmapping and large-object usable size.
  pub(crate) map_base: *mut u8,
  pub(crate) map_len: usize,
  /// Real header, for `SpanKind::Forward`.
  forward: *mut SpanHeader,
}

impl SpanHeader {
  fn blank(kind: SpanKind, map_base: *mut u8, map_len: usize) -> Self {
    Self {
      magic: SPAN_MAGIC,
      kind,
      class: 0,
      in_partial: false,
      slot_size: 0,
      capacity: 0,
      used: 0,
      free: null_mut(),
      bump: null_mut(),
      bump_end: null_mut(),
      prev: null_mut(),
      next: null_mut(),
      map_base,
      map_len,
      forward: null_mut(),
    }
  }
}

/// Resolve the header of a pointer previously returned by the allocator.
///
/// # Safety
///
/// `ptr` must be a live allocation of a heap whose spans are still mapped.
#[inline]
pub(crate) unsafe fn header_of(ptr: NonNull<u8>) -> *mut SpanHeader {
  let span = ((ptr.as_ptr() as usize - 1) & SPAN_ALIGN_MASK) as *mut SpanHeader;
  debug_assert!(
    unsafe { (*span).magic } == SPAN_MAGIC,
    "header_of: {:p} does not belong to this allocator",
    ptr
  );
  if unsafe { (*span).kind } == SpanKind::Forward {
    unsafe { (*span).forward }
  } else {
    span
  }
}

/// Bytes the caller may use starting at `ptr`.
///
/// # Safety
///
/// `span` must be `header_of(ptr)`.
#[inline]
pub(crate) unsafe fn usable_size(span: *mut SpanHeader, ptr: NonNull<u8>) -> usize {
  unsafe {
    match (*span).kind {
      SpanKind::Small => (*span).slot_size as usize,
      _ => (*span).map_base as usize + (*span).map_len - ptr.as_ptr() as usize,
    }
  }
}

/// Carve `span` for `class`. Slots are handed out lazily through the bump cursor.
unsafe fn init_small(span: *mut SpanHeader, class: usize) {
  let info = &CLASSES[class];
  let base = span as *mut u8;
  let mut header = SpanHeader::blank(SpanKind::Small, base, SPAN_SIZE);
  header.class = class as u8;
  header.slot_size = info.slot_size as u32;
  header.capacity = info.slots_per_span as u32;
  unsafe {
    header.bump = base.add(SPAN_HEADER_SIZE);
    header.bump_end = header.bump.add(info.slots_per_span * info.slot_size);
    span.write(header);
  }
}

/// Forget every slot of a fully free span: the bump cursor covers them all again.
pub(crate) unsafe fn reset_small(span: *mut SpanHeader) {
  unsafe {
    debug_assert_eq!((*span).used, 0, "reset_small: span still has slots out");
    (*span).free = null_mut();
    (*span).bump = (span as *mut u8).add(SPAN_HEADER_SIZE);
  }
}

// =============================================================================
// Intrusive span list
// =============================================================================

/// Doubly linked list threaded through `SpanHeader::{prev, next}`.
///
/// A span sits on at most one list at a time.
pub(crate) struct SpanList {
  head: *mut SpanHeader,
  len: usize,
}

unsafe impl Send for SpanList {}

impl SpanList {
  pub(crate) const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  #[inline]
  pub(crate) fn head(&self) -> *mut SpanHeader {
    self.head
  }

  pub(crate) unsafe fn push(&mut self, span: *mut SpanHeader) {
    unsafe {
      (*span).prev = null_mut();
      (*span).next = self.head;
      if !self.head.is_null() {
        (*self.head).prev = span;
      }
    }
    self.head = span;
    self.len += 1;
  }

  pub(crate) unsafe fn remove(&mut self, span: *mut SpanHeader) {
    unsafe {
      let prev = (*span).prev;
      let next = (*span).next;
      if prev.is_null() {
        debug_assert_eq!(self.head, span);
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      (*span).prev = null_mut();
      (*span).next = null_mut();
    }
    self.len -= 1;
  }

  pub(crate) fn pop(&mut self) -> Option<*mut SpanHeader> {
    let span = self.head;
    if span.is_null() {
      return None;
    }
    unsafe { self.remove(span) };
    Some(span)
  }

  /// Move every span of `other` onto this list.
  pub(crate) fn append(&mut self, mut other: SpanList) {
    while let Some(span) = other.pop() {
      unsafe { self.push(span) };
    }
  }
}

// =============================================================================
// Span allocator
// =============================================================================

/// Obtains spans from a [`PageSource`], parks idle ones and gives them back.
pub(crate) struct SpanAllocator<P> {
  source: P,
  /// Unassigned small spans, ready to be carved for any class.
  pool: SpinLock<SpanList>,
  pool_limit: usize,
  /// Bytes currently mapped, large objects included.
  mapped: AtomicUsize,
}

impl<P: PageSource> SpanAllocator<P> {
  pub(crate) fn new(source: P, pool_limit: usize) -> Self {
    debug_assert!(
      SPAN_SIZE % source.page_size() == 0,
      "span size must be a whole number of pages"
    );
    Self {
      source,
      pool: SpinLock::new(SpanList::new()),
      pool_limit,
      mapped: AtomicUsize::new(0),
    }
  }

  pub(crate) fn source(&self) -> &P {
    &self.source
  }

  pub(crate) fn mapped_bytes(&self) -> usize {
    self.mapped.load(Ordering::Acquire)
  }

  pub(crate) fn pooled_spans(&self) -> usize {
    self.pool.lock().len()
  }

  /// Map `len` bytes (a multiple of the page size) aligned to `align`.
  fn map_aligned(&self, len: usize, align: usize) -> Result<NonNull<u8>> {
    let page = self.source.page_size();
    let pages = len / page;

    if align <= page {
      let base = self.source.map_pages(pages)?;
      self.mapped.fetch_add(len, Ordering::AcqRel);
      return Ok(base);
    }

    // Over-map, then trim both ends down to an aligned window.
    let total = pages
      .checked_add((align - page) / page)
      .ok_or(AllocError::SizeOverflow)?;
    let raw = self.source.map_pages(total)?;
    let start = raw.as_ptr() as usize;
    let head = (align_up(start, align) - start) / page;
    let tail = total - head - pages;

    unsafe {
      let aligned = NonNull::new_unchecked(raw.as_ptr().add(head * page));
      if head > 0 {
        self.source.unmap_pages(raw, head);
      }
      if tail > 0 {
        self
          .source
          .unmap_pages(NonNull::new_unchecked(aligned.as_ptr().add(len)), tail);
      }
      self.mapped.fetch_add(len, Ordering::AcqRel);
      Ok(aligned)
    }
  }

  unsafe fn unmap(&self, base: *mut u8, len: usize) {
    let page = self.source.page_size();
    unsafe {
      self
        .source
        .unmap_pages(NonNull::new_unchecked(base), len / page)
    };
    self.mapped.fetch_sub(len, Ordering::AcqRel);
  }

  /// A span carved for `class`, from the pool if one is parked there.
  pub(crate) fn acquire_span(&self, class: usize) -> Result<*mut SpanHeader> {
    let pooled = self.pool.lock().pop();
    let span = match pooled {
      Some(span) => span,
      None => {
        let base = self.map_aligned(SPAN_SIZE, SPAN_SIZE)?;
        debug!("mapped span {:p} for class {}", base, class);
        base.as_ptr() as *mut SpanHeader
      }
    };
    unsafe { init_small(span, class) };
    Ok(span)
  }

  /// Map a dedicated region for one object of `size` bytes aligned to `align`.
  pub(crate) fn acquire_large(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
    let align = align.max(MIN_ALIGN);
    let page = self.source.page_size();

    // Worst-case distance from the mapping base to the returned address.
    let offset = if align <= SPAN_SIZE {
      align_up(SPAN_HEADER_SIZE, align)
    } else {
      align
    };
    let len = size
      .checked_add(offset)
      .and_then(|n| n.checked_add(page - 1))
      .ok_or(AllocError::SizeOverflow)?
      & !(page - 1);

    let base = self.map_aligned(len, SPAN_SIZE)?;
    let base_addr = base.as_ptr() as usize;
    let span = base.as_ptr() as *mut SpanHeader;
    unsafe { span.write(SpanHeader::blank(SpanKind::Large, base.as_ptr(), len)) };

    let user_addr = align_up(base_addr + SPAN_HEADER_SIZE, align);
    let lookup_addr = (user_addr - 1) & SPAN_ALIGN_MASK;
    if lookup_addr != base_addr {
      let mut forward = SpanHeader::blank(SpanKind::Forward, base.as_ptr(), len);
      forward.forward = span;
      unsafe {
        (base.as_ptr().add(lookup_addr - base_addr) as *mut SpanHeader).write(forward);
      }
    }

    debug!("mapped large object of {} bytes at {:p}", size, base);
    Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(user_addr - base_addr)) })
  }

  /// Unmap a large object.
  ///
  /// # Safety
  ///
  /// `span` must be the header of a live large object, released exactly once.
  pub(crate) unsafe fn release_large(&self, span: *mut SpanHeader) {
    unsafe {
      debug_assert_eq!((*span).kind, SpanKind::Large);
      let (base, len) = ((*span).map_base, (*span).map_len);
      self.unmap(base, len);
    }
  }

  /// Park fully free spans in the pool. Returns the ones that did not fit.
  pub(crate) fn park(&self, mut spans: SpanList) -> SpanList {
    let mut pool = self.pool.lock();
    while pool.len() < self.pool_limit {
      match spans.pop() {
        Some(span) => unsafe {
          debug_assert_eq!((*span).used, 0, "park: span {span:p} still has slots out");
          pool.push(span);
        },
        None => break,
      }
    }
    spans
  }

  /// Merge `idle` into the pool and take out everything beyond `keep` spans.
  pub(crate) fn trim_pool(&self, idle: SpanList, keep: usize) -> SpanList {
    let mut doomed = SpanList::new();
    let mut pool = self.pool.lock();
    pool.append(idle);
    while pool.len() > keep {
      match pool.pop() {
        Some(span) => unsafe { doomed.push(span) },
        None => break,
      }
    }
    doomed
  }

  /// Return small spans to the OS. Returns the number of bytes released.
  ///
  /// # Safety
  ///
  /// Every span must be fully free and unreachable from any list, thread
  /// cache, or in-flight transfer-stack pop.
  pub(crate) unsafe fn unmap_spans(&self, mut spans: SpanList) -> usize {
    let mut released = 0;
    while let Some(span) = spans.pop() {
      debug_assert!(
        unsafe { (*span).used } == 0,
        "unmap_spans: releasing span {:p} with {} slots out",
        span,
        unsafe { (*span).used }
      );
      unsafe { self.unmap(span as *mut u8, SPAN_SIZE) };
      released += SPAN_SIZE;
    }
    released
  }
}
