//! Central free store: one per size class, shared by every thread.
//!
//! Two layers. Whole batches travel through a lock-free tagged Treiber stack
//! (the common case for thread-cache refill and flush). Everything else goes
//! through a spin-locked set of spans: the partially free spans of the class,
//! plus a few fully free ones it keeps in reserve.

use core::{
  hint,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use crate::{
  lock::SpinLock,
  size_class::CLASSES,
  span::{FreeBlock, SpanHeader, SpanList, header_of, reset_small},
};

/// Pointers fit in the low 48 bits; the high 16 carry the ABA tag.
const TAG_SHIFT: u32 = 48;
const PTR_MASK: u64 = (1 << TAG_SHIFT) - 1;

#[inline]
fn pack(ptr: *mut FreeBlock, tag: u64) -> u64 {
  debug_assert!(ptr as u64 & !PTR_MASK == 0, "pointer {ptr:p} exceeds 48 bits");
  (ptr as u64) | (tag << TAG_SHIFT)
}

#[inline]
fn unpack(packed: u64) -> *mut FreeBlock {
  (packed & PTR_MASK) as *mut FreeBlock
}

#[inline]
fn next_tag(packed: u64) -> u64 {
  ((packed >> TAG_SHIFT) as u16).wrapping_add(1) as u64
}

// =============================================================================
// Batch
// =============================================================================

/// Chain of free slots linked through `FreeBlock::next`, null-terminated.
pub(crate) struct Batch {
  pub(crate) head: *mut FreeBlock,
  pub(crate) len: usize,
}

impl Batch {
  pub(crate) const fn empty() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  pub(crate) fn single(slot: NonNull<u8>) -> Self {
    let block = slot.as_ptr() as *mut FreeBlock;
    unsafe { (*block).next = null_mut() };
    Self {
      head: block,
      len: 1,
    }
  }

  #[cfg(test)]
  pub(crate) fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  unsafe fn push(&mut self, block: *mut FreeBlock) {
    unsafe { (*block).next = self.head };
    self.head = block;
    self.len += 1;
  }
}

// =============================================================================
// Locked span set
// =============================================================================

struct ClassSpans {
  /// Spans with at least one free slot and at least one slot out.
  partial: SpanList,
  /// Fully free spans this class keeps in reserve.
  idle: SpanList,
}

impl ClassSpans {
  /// Move up to `max - batch.len` slots into `batch`, draining one span
  /// before touching the next.
  unsafe fn take(&mut self, batch: &mut Batch, max: usize) {
    while batch.len < max {
      let mut span = self.partial.head();
      if span.is_null() {
        match self.idle.pop() {
          Some(idle) => unsafe {
            self.partial.push(idle);
            (*idle).in_partial = true;
            span = idle;
          },
          None => return,
        }
      }

      unsafe {
        while batch.len < max && !(*span).free.is_null() {
          let block = (*span).free;
          (*span).free = (*block).next;
          batch.push(block);
          (*span).used += 1;
        }

        let slot_size = (*span).slot_size as usize;
        while batch.len < max && (*span).bump < (*span).bump_end {
          let block = (*span).bump as *mut FreeBlock;
          (*span).bump = (*span).bump.add(slot_size);
          batch.push(block);
          (*span).used += 1;
        }

        if (*span).free.is_null() && (*span).bump >= (*span).bump_end {
          self.partial.remove(span);
          (*span).in_partial = false;
        }
      }
    }
  }

  /// Put one slot back into its span. A span that becomes fully free stays in
  /// `idle` while fewer than `retain` are held, otherwise it moves to `out`.
  unsafe fn return_slot(&mut self, block: *mut FreeBlock, out: &mut SpanList, retain: usize) {
    unsafe {
      let span = header_of(NonNull::new_unchecked(block as *mut u8));
      (*block).next = (*span).free;
      (*span).free = block;
      debug_assert!((*span).used > 0, "return_slot: used underflow on {span:p}");
      (*span).used -= 1;

      if (*span).used == 0 {
        self.detach_empty(span, out, retain);
      } else if !(*span).in_partial {
        self.partial.push(span);
        (*span).in_partial = true;
      }
    }
  }

  unsafe fn detach_empty(&mut self, span: *mut SpanHeader, out: &mut SpanList, retain: usize) {
    unsafe {
      if (*span).in_partial {
        self.partial.remove(span);
        (*span).in_partial = false;
      }
      reset_small(span);
      if self.idle.len() < retain {
        self.idle.push(span);
      } else {
        out.push(span);
      }
    }
  }
}

// =============================================================================
// Central store
// =============================================================================

#[repr(align(128))]
pub(crate) struct CentralStore {
  batch: usize,
  retain: usize,
  /// Lock-free stack of full batches, packed as pointer | tag << 48.
  transfer: AtomicU64,
  /// Threads currently inside a transfer-stack pop.
  poppers: AtomicUsize,
  spans: SpinLock<ClassSpans>,
}

impl CentralStore {
  pub(crate) fn new(class: usize, retain: usize) -> Self {
    Self {
      batch: CLASSES[class].batch,
      retain,
      transfer: AtomicU64::new(0),
      poppers: AtomicUsize::new(0),
      spans: SpinLock::new(ClassSpans {
        partial: SpanList::new(),
        idle: SpanList::new(),
      }),
    }
  }

  /// Remove up to `max` slots. The batch is empty only when the store holds
  /// nothing. Spans that folding frees beyond the class's reserve come back
  /// for release, like [`CentralStore::push_batch`].
  pub(crate) fn pull_batch(&self, max: usize) -> (Batch, SpanList) {
    if max >= self.batch
      && let Some(head) = self.pop_transfer()
    {
      let batch = Batch {
        head,
        len: self.batch,
      };
      return (batch, SpanList::new());
    }

    let mut spans = self.spans.lock();
    let mut batch = Batch::empty();
    let mut out = SpanList::new();
    unsafe { spans.take(&mut batch, max) };

    // Slots parked as whole batches count as taken; fold them back so a
    // request smaller than a batch can still be served.
    if batch.len < max && unsafe { self.fold_transfer(&mut spans, &mut out, self.retain) } > 0 {
      unsafe { spans.take(&mut batch, max) };
      // Serve from spans about to be released before the caller maps a new one.
      while batch.len < max
        && let Some(span) = out.pop()
      {
        unsafe {
          spans.idle.push(span);
          spans.take(&mut batch, max);
        }
      }
    }
    drop(spans);
    (batch, out)
  }

  /// Return slots. Spans freed beyond the class's reserve come back for release.
  pub(crate) fn push_batch(&self, batch: Batch) -> SpanList {
    if batch.len == self.batch {
      unsafe { self.push_transfer(batch.head) };
      return SpanList::new();
    }

    let mut out = SpanList::new();
    let mut spans = self.spans.lock();
    let mut block = batch.head;
    while !block.is_null() {
      unsafe {
        let next = (*block).next;
        spans.return_slot(block, &mut out, self.retain);
        block = next;
      }
    }
    drop(spans);
    out
  }

  /// Hand a freshly carved span to this class.
  pub(crate) fn carve(&self, span: *mut SpanHeader) {
    let mut spans = self.spans.lock();
    unsafe {
      spans.partial.push(span);
      (*span).in_partial = true;
    }
  }

  /// Detach every fully free span, reserve included.
  pub(crate) fn drain_idle(&self) -> SpanList {
    let mut out = SpanList::new();
    let mut spans = self.spans.lock();
    unsafe { self.fold_transfer(&mut spans, &mut out, 0) };

    while let Some(span) = spans.idle.pop() {
      unsafe { out.push(span) };
    }

    // Carved spans that nobody pulled from yet.
    let mut cursor = spans.partial.head();
    while !cursor.is_null() {
      unsafe {
        let next = (*cursor).next;
        if (*cursor).used == 0 {
          spans.detach_empty(cursor, &mut out, 0);
        }
        cursor = next;
      }
    }
    out
  }

  pub(crate) fn retained_spans(&self) -> usize {
    self.spans.lock().idle.len()
  }

  /// Wait until every transfer-stack pop that started before this call is done.
  pub(crate) fn quiesce(&self) {
    while self.poppers.load(Ordering::SeqCst) != 0 {
      hint::spin_loop();
    }
  }

  unsafe fn push_transfer(&self, head: *mut FreeBlock) {
    let mut packed = self.transfer.load(Ordering::Relaxed);
    loop {
      unsafe { (*head).next_batch.store(unpack(packed), Ordering::Relaxed) };
      match self.transfer.compare_exchange_weak(
        packed,
        pack(head, next_tag(packed)),
        Ordering::SeqCst,
        Ordering::Relaxed,
      ) {
        Ok(_) => return,
        Err(current) => packed = current,
      }
    }
  }

  fn pop_transfer(&self) -> Option<*mut FreeBlock> {
    self.poppers.fetch_add(1, Ordering::SeqCst);
    let mut packed = self.transfer.load(Ordering::SeqCst);
    let popped = loop {
      let head = unpack(packed);
      if head.is_null() {
        break None;
      }
      // `head` may already belong to someone else; the tag makes the CAS fail then.
      let next = unsafe { (*head).next_batch.load(Ordering::Relaxed) };
      match self.transfer.compare_exchange_weak(
        packed,
        pack(next, next_tag(packed)),
        Ordering::SeqCst,
        Ordering::SeqCst,
      ) {
        Ok(_) => break Some(head),
        Err(current) => packed = current,
      }
    };
    self.poppers.fetch_sub(1, Ordering::SeqCst);
    popped
  }

  /// Empty the transfer stack into the span lists. Returns the slot count.
  unsafe fn fold_transfer(
    &self,
    spans: &mut ClassSpans,
    out: &mut SpanList,
    retain: usize,
  ) -> usize {
    let mut packed = self.transfer.load(Ordering::Relaxed);
    loop {
      match self.transfer.compare_exchange_weak(
        packed,
        pack(null_mut(), next_tag(packed)),
        Ordering::SeqCst,
        Ordering::Relaxed,
      ) {
        Ok(_) => break,
        Err(current) => packed = current,
      }
    }

    let mut folded = 0;
    let mut head = unpack(packed);
    while !head.is_null() {
      unsafe {
        let next_batch = (*head).next_batch.load(Ordering::Relaxed);
        let mut block = head;
        while !block.is_null() {
          let next = (*block).next;
          spans.return_slot(block, out, retain);
          block = next;
          folded += 1;
        }
        head = next_batch;
      }
    }
    folded
  }
}
