//! C ABI exports (enabled with `--features c_api`).
//!
//! Errors become null returns, except `posix_memalign` which reports
//! `EINVAL`/`ENOMEM` the way POSIX asks.

use core::{
  ffi::c_int,
  mem::size_of,
  ptr::{NonNull, null_mut},
};

use crate::{error::AllocError, global};

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  global::allocate(size).map_or(null_mut(), NonNull::as_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { global::free(ptr) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  global::zero_allocate(nmemb, size).map_or(null_mut(), NonNull::as_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  match unsafe { global::reallocate(ptr, size) } {
    Ok(Some(new)) => new.as_ptr(),
    _ => null_mut(),
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> c_int {
  if alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }
  match global::aligned_allocate(alignment, size) {
    Ok(ptr) => {
      unsafe { *memptr = ptr.as_ptr() };
      0
    }
    Err(AllocError::InvalidAlignment(_)) => libc::EINVAL,
    Err(_) => libc::ENOMEM,
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  global::aligned_allocate(alignment, size).map_or(null_mut(), NonNull::as_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
  global::aligned_allocate(alignment, size).map_or(null_mut(), NonNull::as_ptr)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { global::usable_size(ptr) }
}

/// Returns 1 when memory was given back to the OS, 0 otherwise.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_trim(pad: usize) -> c_int {
  (global::trim(pad) > 0) as c_int
}

/// For hosts that manage thread lifetimes outside Rust's thread-locals.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn spanalloc_thread_exit() {
  global::on_thread_exit()
}
