//! Heap-overflow detection (enabled with `--features overflow-detection`).
//!
//! Each allocation is laid out as `[pad][size, offset][payload][guard: 8 bytes]`.
//! The 16 bytes before the payload hold the requested size and the distance
//! back to the start of the underlying block. The guard is verified on free;
//! a mismatch is logged and the process aborts.
//!
//! With the feature on, the process-wide entry points (`global`, `SpanAlloc`
//! and the C ABI) all go through [`Guard`].

use core::ptr::{self, NonNull};

use log::error;

use crate::{
  config::MIN_ALIGN,
  error::{AllocError, Result},
  heap::{Frontend, Heap, LocalHeap},
  platform::{OsPages, PageSource},
};

const PREFIX: usize = 16;
const GUARD: usize = 8;
const GUARD_BYTE: u8 = 0xFD;

/// Verify the guard behind `ptr`.
///
/// # Safety
///
/// `ptr` must be a live guarded allocation.
pub unsafe fn check(ptr: NonNull<u8>) -> Result<()> {
  unsafe {
    let size = requested(ptr);
    let guard = core::slice::from_raw_parts(ptr.as_ptr().add(size), GUARD);
    match guard.iter().position(|&b| b != GUARD_BYTE) {
      None => Ok(()),
      Some(at) => Err(AllocError::Corruption {
        addr: ptr.as_ptr() as usize + size + at,
      }),
    }
  }
}

unsafe fn requested(ptr: NonNull<u8>) -> usize {
  unsafe { (ptr.as_ptr().sub(PREFIX) as *const usize).read() }
}

unsafe fn offset(ptr: NonNull<u8>) -> usize {
  unsafe { (ptr.as_ptr().sub(PREFIX / 2) as *const usize).read() }
}

/// Lay out the prefix and the guard inside `raw` and return the payload.
unsafe fn arm(raw: NonNull<u8>, offset: usize, size: usize) -> NonNull<u8> {
  unsafe {
    let user = raw.as_ptr().add(offset);
    (user.sub(PREFIX) as *mut usize).write(size);
    (user.sub(PREFIX / 2) as *mut usize).write(offset);
    ptr::write_bytes(user.add(size), GUARD_BYTE, GUARD);
    NonNull::new_unchecked(user)
  }
}

fn overflowed(err: AllocError) -> ! {
  error!("{err}");
  std::process::abort()
}

// =============================================================================
// Guard
// =============================================================================

/// The allocation family of `F`, with every block wrapped in a prefix and a guard.
pub(crate) struct Guard<'a, F: ?Sized> {
  inner: &'a mut F,
}

impl<'a, F: ?Sized> Guard<'a, F> {
  pub(crate) fn new(inner: &'a mut F) -> Self {
    Self { inner }
  }
}

impl<P: PageSource, F: Frontend<P> + ?Sized> Frontend<P> for Guard<'_, F> {
  fn heap(&self) -> &Heap<P> {
    self.inner.heap()
  }

  fn take_slot(&mut self, class: usize) -> Result<NonNull<u8>> {
    self.inner.take_slot(class)
  }

  unsafe fn give_slot(&mut self, slot: NonNull<u8>, class: usize) {
    unsafe { self.inner.give_slot(slot, class) }
  }

  fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    let total = size
      .checked_add(PREFIX + GUARD)
      .ok_or(AllocError::SizeOverflow)?;
    let raw = self.inner.allocate(total)?;
    Ok(unsafe { arm(raw, PREFIX, size) })
  }

  fn aligned_allocate(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
    if !align.is_power_of_two() {
      return Err(AllocError::InvalidAlignment(align));
    }
    if align <= MIN_ALIGN {
      return Frontend::<P>::allocate(self, size);
    }
    // A whole `align` in front keeps the payload aligned and fits the prefix.
    let total = size
      .checked_add(align + GUARD)
      .ok_or(AllocError::SizeOverflow)?;
    let raw = self.inner.aligned_allocate(align, total)?;
    Ok(unsafe { arm(raw, align, size) })
  }

  fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>> {
    let total = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;
    let ptr = Frontend::<P>::allocate(self, total)?;
    unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
    Ok(ptr)
  }

  unsafe fn free(&mut self, ptr: *mut u8) {
    let Some(user) = NonNull::new(ptr) else {
      return;
    };
    if let Err(err) = unsafe { check(user) } {
      overflowed(err);
    }
    unsafe { self.inner.free(ptr.sub(offset(user))) }
  }

  /// The size originally requested, not the slot size.
  unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    match NonNull::new(ptr) {
      Some(ptr) => unsafe { requested(ptr) },
      None => 0,
    }
  }

  /// Always moves, so the guard is rewritten behind the new size.
  unsafe fn reallocate(&mut self, ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
    let Some(old) = NonNull::new(ptr) else {
      return Frontend::<P>::allocate(self, new_size).map(Some);
    };
    unsafe { check(old)? };
    if new_size == 0 {
      unsafe { Frontend::<P>::free(self, ptr) };
      return Ok(None);
    }

    let new = Frontend::<P>::allocate(self, new_size)?;
    unsafe {
      let keep = requested(old).min(new_size);
      ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), keep);
      Frontend::<P>::free(self, ptr);
    }
    Ok(Some(new))
  }
}

// =============================================================================
// Guarded
// =============================================================================

/// Guard-byte decorator around a [`LocalHeap`].
pub struct Guarded<'h, P: PageSource = OsPages> {
  inner: LocalHeap<'h, P>,
}

impl<'h, P: PageSource> Guarded<'h, P> {
  pub fn new(inner: LocalHeap<'h, P>) -> Self {
    Self { inner }
  }

  pub fn into_inner(self) -> LocalHeap<'h, P> {
    self.inner
  }

  fn guard(&mut self) -> Guard<'_, LocalHeap<'h, P>> {
    Guard::new(&mut self.inner)
  }

  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
    Frontend::<P>::allocate(&mut self.guard(), size)
  }

  pub fn aligned_allocate(&mut self, align: usize, size: usize) -> Result<NonNull<u8>> {
    Frontend::<P>::aligned_allocate(&mut self.guard(), align, size)
  }

  pub fn zero_allocate(&mut self, count: usize, size: usize) -> Result<NonNull<u8>> {
    Frontend::<P>::zero_allocate(&mut self.guard(), count, size)
  }

  /// # Safety
  ///
  /// `ptr` must be a live allocation from this decorator.
  pub unsafe fn check(&self, ptr: NonNull<u8>) -> Result<()> {
    unsafe { check(ptr) }
  }

  /// Aborts the process if the guard was overwritten.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this decorator.
  pub unsafe fn free(&mut self, ptr: *mut u8) {
    unsafe { Frontend::<P>::free(&mut self.guard(), ptr) }
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this decorator.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    match NonNull::new(ptr) {
      Some(ptr) => unsafe { requested(ptr) },
      None => 0,
    }
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live allocation from this decorator.
  pub unsafe fn reallocate(
    &mut self,
    ptr: *mut u8,
    new_size: usize,
  ) -> Result<Option<NonNull<u8>>> {
    unsafe { Frontend::<P>::reallocate(&mut self.guard(), ptr, new_size) }
  }
}
