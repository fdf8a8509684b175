//! Process-wide allocator: one lazily created [`Heap`] and a cache per thread.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::{Cell, UnsafeCell},
  ptr::{self, NonNull, null_mut},
};
use std::sync::OnceLock;

use crate::{
  config::MIN_ALIGN,
  error::Result,
  heap::{Frontend, Heap, HeapStats, LocalHeap},
  platform::OsPages,
};

#[cfg(feature = "overflow-detection")]
use crate::guard::Guard;

static HEAP: OnceLock<Heap> = OnceLock::new();

thread_local! {
  static LOCAL: UnsafeCell<Option<LocalHeap<'static>>> = const { UnsafeCell::new(None) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

fn heap() -> &'static Heap {
  HEAP.get_or_init(Heap::new)
}

/// Run `f` with the calling thread's cache.
///
/// Registering the thread-local destructor may itself allocate, and the cache
/// is gone once thread teardown has started. Both cases, and any other nested
/// call on the same thread, are served straight from the central stores.
fn with_local<R>(f: impl Fn(&mut dyn Frontend<OsPages>) -> R) -> R {
  let heap = heap();
  let entered = IN_ALLOC
    .try_with(|flag| !flag.replace(true))
    .unwrap_or(false);
  if !entered {
    return run(&f, &mut heap.uncached());
  }

  let cached = LOCAL.try_with(|slot| {
    let local = unsafe { &mut *slot.get() };
    run(&f, local.get_or_insert_with(|| heap.local()))
  });
  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  match cached {
    Ok(result) => result,
    Err(_) => run(&f, &mut heap.uncached()),
  }
}

// Every entry point goes through the guard when overflow detection is built in.
#[cfg(not(feature = "overflow-detection"))]
#[inline(always)]
fn run<R>(f: &impl Fn(&mut dyn Frontend<OsPages>) -> R, front: &mut dyn Frontend<OsPages>) -> R {
  f(front)
}

#[cfg(feature = "overflow-detection")]
fn run<R>(f: &impl Fn(&mut dyn Frontend<OsPages>) -> R, front: &mut dyn Frontend<OsPages>) -> R {
  f(&mut Guard::new(front))
}

/// See [`LocalHeap::allocate`].
pub fn allocate(size: usize) -> Result<NonNull<u8>> {
  with_local(|local| local.allocate(size))
}

/// See [`LocalHeap::free`].
///
/// # Safety
///
/// `ptr` must be null or a live allocation from this module.
pub unsafe fn free(ptr: *mut u8) {
  with_local(|local| unsafe { local.free(ptr) })
}

/// See [`LocalHeap::reallocate`].
///
/// # Safety
///
/// `ptr` must be null or a live allocation from this module.
pub unsafe fn reallocate(ptr: *mut u8, new_size: usize) -> Result<Option<NonNull<u8>>> {
  with_local(|local| unsafe { local.reallocate(ptr, new_size) })
}

pub fn zero_allocate(count: usize, size: usize) -> Result<NonNull<u8>> {
  with_local(|local| local.zero_allocate(count, size))
}

pub fn aligned_allocate(align: usize, size: usize) -> Result<NonNull<u8>> {
  with_local(|local| local.aligned_allocate(align, size))
}

/// # Safety
///
/// `ptr` must be null or a live allocation from this module.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  with_local(|front| unsafe { front.usable_size(ptr) })
}

/// Flush the calling thread's cache, then release idle spans beyond `pad` bytes.
pub fn trim(pad: usize) -> usize {
  let heap = heap();
  let entered = IN_ALLOC
    .try_with(|flag| !flag.replace(true))
    .unwrap_or(false);
  if entered {
    let _ = LOCAL.try_with(|slot| {
      if let Some(local) = unsafe { &mut *slot.get() } {
        local.flush();
      }
    });
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
  heap.trim(pad)
}

/// Return the calling thread's cached slots to the shared stores.
///
/// Threads that exit normally do this on their own when their thread-locals
/// are destroyed. Calling it early is harmless: the next allocation on this
/// thread starts a fresh cache.
pub fn on_thread_exit() {
  let entered = IN_ALLOC
    .try_with(|flag| !flag.replace(true))
    .unwrap_or(false);
  if !entered {
    return;
  }
  let retired = LOCAL.try_with(|slot| unsafe { (*slot.get()).take() });
  drop(retired);
  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
}

pub fn stats() -> HeapStats {
  heap().stats()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `#[global_allocator]` adapter over this module.
///
/// ```no_run
/// #[global_allocator]
/// static ALLOC: spanalloc::SpanAlloc = spanalloc::SpanAlloc;
/// ```
pub struct SpanAlloc;

unsafe impl GlobalAlloc for SpanAlloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    aligned_allocate(layout.align(), layout.size()).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { free(ptr) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return zero_allocate(1, layout.size()).map_or(null_mut(), NonNull::as_ptr);
    }
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return match unsafe { reallocate(ptr, new_size) } {
        Ok(Some(new)) => new.as_ptr(),
        _ => null_mut(),
      };
    }

    // `reallocate` only knows the default alignment.
    if new_size <= unsafe { usable_size(ptr) } {
      return ptr;
    }
    let Ok(new) = aligned_allocate(layout.align(), new_size) else {
      return null_mut();
    };
    unsafe {
      ptr::copy_nonoverlapping(ptr, new.as_ptr(), layout.size().min(new_size));
      free(ptr);
    }
    new.as_ptr()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::thread;

  #[test]
  fn free_functions_round_trip() {
    let ptr = allocate(200).unwrap();
    unsafe {
      assert!(usable_size(ptr.as_ptr()) >= 200);
      ptr::write_bytes(ptr.as_ptr(), 0x3C, 200);
      let grown = reallocate(ptr.as_ptr(), 5000).unwrap().unwrap();
      assert_eq!(grown.as_ptr().add(199).read(), 0x3C);
      assert_eq!(reallocate(grown.as_ptr(), 0), Ok(None));
      assert_eq!(usable_size(null_mut()), 0);
      free(null_mut());
    }
  }

  #[test]
  fn nested_calls_bypass_the_thread_cache() {
    let outer = with_local(|local| {
      assert!(IN_ALLOC.with(Cell::get));
      let inner = allocate(64).unwrap();
      unsafe { free(inner.as_ptr()) };
      local.allocate(64)
    })
    .unwrap();
    assert!(!IN_ALLOC.with(Cell::get));
    unsafe { free(outer.as_ptr()) };
  }

  #[test]
  fn thread_exit_hands_back_the_cache() {
    thread::spawn(|| {
      let ptrs: Vec<_> = (0..100).map(|_| allocate(48).unwrap()).collect();
      for ptr in ptrs {
        unsafe { free(ptr.as_ptr()) };
      }
      let cached =
        LOCAL.with(|slot| unsafe { (*slot.get()).as_ref().map(LocalHeap::cached_slots) });
      assert!(cached.unwrap_or(0) > 0);

      on_thread_exit();
      LOCAL.with(|slot| assert!(unsafe { (*slot.get()).is_none() }));

      // A fresh cache is started on demand.
      let again = allocate(48).unwrap();
      unsafe { free(again.as_ptr()) };
    })
    .join()
    .unwrap();
  }

  #[test]
  fn global_alloc_honours_layouts() {
    let alloc = SpanAlloc;
    for align in [1, 8, 16, 64, 4096, 1 << 17] {
      for size in [1, 100, 40_000] {
        let layout = Layout::from_size_align(size, align).unwrap();
        unsafe {
          let ptr = alloc.alloc_zeroed(layout);
          assert!(!ptr.is_null());
          assert_eq!(ptr as usize % align, 0);
          assert!(core::slice::from_raw_parts(ptr, size).iter().all(|&b| b == 0));
          ptr.write(0x77);

          let grown = alloc.realloc(ptr, layout, size * 3);
          assert_eq!(grown as usize % align, 0);
          assert_eq!(grown.read(), 0x77);
          alloc.dealloc(grown, Layout::from_size_align(size * 3, align).unwrap());
        }
      }
    }
  }

  #[test]
  fn trim_flushes_the_calling_thread() {
    thread::spawn(|| {
      let ptr = allocate(700).unwrap();
      unsafe { free(ptr.as_ptr()) };
      let _ = trim(0);
      let cached =
        LOCAL.with(|slot| unsafe { (*slot.get()).as_ref().map(LocalHeap::cached_slots) });
      assert_eq!(cached, Some(0));
    })
    .join()
    .unwrap();
  }
}
