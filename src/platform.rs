//! The OS virtual-memory service consumed by the span allocator.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use log::warn;

use crate::{
  config::DEFAULT_PAGE_SIZE,
  error::{AllocError, Result},
};

/// Page-granular mapping service.
///
/// Mapped pages must read as zero the first time they are touched. The span
/// allocator is the only caller, and it only ever unmaps page ranges it
/// obtained from `map_pages` on the same source (possibly trimming a mapping
/// from either end).
pub trait PageSource {
  fn page_size(&self) -> usize {
    DEFAULT_PAGE_SIZE
  }

  /// Maps `count` contiguous, page-aligned, zero-filled pages.
  fn map_pages(&self, count: usize) -> Result<NonNull<u8>>;

  /// Returns `count` pages starting at `base` to the OS.
  ///
  /// # Safety
  ///
  /// The range must lie inside a mapping produced by [`PageSource::map_pages`]
  /// and nothing may access it afterwards.
  unsafe fn unmap_pages(&self, base: NonNull<u8>, count: usize);
}

// =============================================================================
// Anonymous mappings
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Private anonymous `mmap`/`munmap`.
#[derive(Debug, Clone, Copy)]
pub struct OsPages {
  page_size: usize,
}

impl OsPages {
  pub fn new() -> Self {
    let reported = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page_size = if reported > 0 {
      reported as usize
    } else {
      DEFAULT_PAGE_SIZE
    };
    Self { page_size }
  }
}

impl Default for OsPages {
  fn default() -> Self {
    Self::new()
  }
}

impl PageSource for OsPages {
  fn page_size(&self) -> usize {
    self.page_size
  }

  fn map_pages(&self, count: usize) -> Result<NonNull<u8>> {
    let size = count
      .checked_mul(self.page_size)
      .ok_or(AllocError::SizeOverflow)?;
    let ptr = unsafe { os_mmap(size) };
    NonNull::new(ptr).ok_or_else(|| {
      warn!("mmap of {count} pages refused");
      AllocError::OutOfMemory { pages: count }
    })
  }

  unsafe fn unmap_pages(&self, base: NonNull<u8>, count: usize) {
    unsafe { os_munmap(base.as_ptr(), count * self.page_size) };
  }
}

// =============================================================================
// Accounting decorator
// =============================================================================

/// Wraps a [`PageSource`] and counts what passes through it.
///
/// An optional page budget makes the source refuse mappings past that limit,
/// which is how tests provoke the out-of-memory path.
#[derive(Debug, Default)]
pub struct CountingPages<P = OsPages> {
  inner: P,
  limit: Option<usize>,
  mapped: AtomicUsize,
  maps: AtomicUsize,
  unmaps: AtomicUsize,
}

impl<P: PageSource> CountingPages<P> {
  pub fn new(inner: P) -> Self {
    Self {
      inner,
      limit: None,
      mapped: AtomicUsize::new(0),
      maps: AtomicUsize::new(0),
      unmaps: AtomicUsize::new(0),
    }
  }

  /// Refuse any mapping that would take the live page count past `pages`.
  pub fn with_limit(mut self, pages: usize) -> Self {
    self.limit = Some(pages);
    self
  }

  /// Pages currently mapped through this source.
  pub fn mapped_pages(&self) -> usize {
    self.mapped.load(Ordering::Acquire)
  }

  /// Number of successful `map_pages` calls.
  pub fn map_calls(&self) -> usize {
    self.maps.load(Ordering::Relaxed)
  }

  /// Number of `unmap_pages` calls.
  pub fn unmap_calls(&self) -> usize {
    self.unmaps.load(Ordering::Relaxed)
  }
}

impl<P: PageSource> PageSource for CountingPages<P> {
  fn page_size(&self) -> usize {
    self.inner.page_size()
  }

  fn map_pages(&self, count: usize) -> Result<NonNull<u8>> {
    let previous = self.mapped.fetch_add(count, Ordering::AcqRel);
    if let Some(limit) = self.limit
      && previous + count > limit
    {
      self.mapped.fetch_sub(count, Ordering::AcqRel);
      return Err(AllocError::OutOfMemory { pages: count });
    }

    match self.inner.map_pages(count) {
      Ok(base) => {
        self.maps.fetch_add(1, Ordering::Relaxed);
        Ok(base)
      }
      Err(err) => {
        self.mapped.fetch_sub(count, Ordering::AcqRel);
        Err(err)
      }
    }
  }

  unsafe fn unmap_pages(&self, base: NonNull<u8>, count: usize) {
    unsafe { self.inner.unmap_pages(base, count) };
    self.mapped.fetch_sub(count, Ordering::AcqRel);
    self.unmaps.fetch_add(1, Ordering::Relaxed);
  }
}

impl<P: PageSource + ?Sized> PageSource for &P {
  fn page_size(&self) -> usize {
    (**self).page_size()
  }

  fn map_pages(&self, count: usize) -> Result<NonNull<u8>> {
    (**self).map_pages(count)
  }

  unsafe fn unmap_pages(&self, base: NonNull<u8>, count: usize) {
    unsafe { (**self).unmap_pages(base, count) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn os_pages_are_zeroed_and_writable() {
    let os = OsPages::new();
    assert!(os.page_size().is_power_of_two());

    let base = os.map_pages(2).unwrap();
    let len = 2 * os.page_size();
    let bytes = unsafe { core::slice::from_raw_parts_mut(base.as_ptr(), len) };
    assert!(bytes.iter().all(|&b| b == 0));
    bytes[len - 1] = 0xAB;
    assert_eq!(bytes[len - 1], 0xAB);
    unsafe { os.unmap_pages(base, 2) };
  }

  #[test]
  fn counting_tracks_live_pages() {
    let pages = CountingPages::new(OsPages::new());
    let a = pages.map_pages(4).unwrap();
    let b = pages.map_pages(1).unwrap();
    assert_eq!(pages.mapped_pages(), 5);
    assert_eq!(pages.map_calls(), 2);

    unsafe { pages.unmap_pages(a, 4) };
    unsafe { pages.unmap_pages(b, 1) };
    assert_eq!(pages.mapped_pages(), 0);
    assert_eq!(pages.unmap_calls(), 2);
  }

  #[test]
  fn limit_refuses_with_out_of_memory() {
    let pages = CountingPages::new(OsPages::new()).with_limit(3);
    let a = pages.map_pages(2).unwrap();
    assert_eq!(
      pages.map_pages(2),
      Err(AllocError::OutOfMemory { pages: 2 })
    );
    assert_eq!(pages.mapped_pages(), 2);
    unsafe { pages.unmap_pages(a, 2) };
  }
}
