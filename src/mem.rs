//! Memory providers: sbrk-style monotonic heap extension.
//!
//! The allocator core is generic over a [`HeapSource`]: grow the segment,
//! query its bounds. Two providers are supplied, one over the program break
//! and one over a fixed `mmap` reservation. Neither ever shrinks; the
//! segment is released only when the provider is dropped (or at process
//! teardown for the program break).

use core::ptr::{NonNull, null_mut};

use libc::{c_void, intptr_t};

use crate::block::DSIZE;

/// An sbrk-style memory provider backing one heap.
///
/// # Safety
///
/// Implementations must uphold the allocator's layout assumptions:
///
/// - every successful [`sbrk`](HeapSource::sbrk) returns a region of `incr`
///   readable, writable bytes exclusively owned by the caller;
/// - successive regions are contiguous: each new region starts exactly where
///   the previous one ended;
/// - the first region starts at an address aligned to [`DSIZE`];
/// - `lo()`/`hi()` bracket every byte handed out so far.
pub unsafe trait HeapSource {
  /// Extend the heap by `incr` bytes and return the base of the new region,
  /// or `None` when the provider refuses. `incr == 0` reports the current
  /// break without growing.
  fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>>;

  /// Lowest address of the heap segment.
  fn lo(&self) -> *mut u8;

  /// Last valid byte of the heap segment. Meaningless before the first
  /// successful extension.
  fn hi(&self) -> *mut u8;
}

const SBRK_FAILED: *mut c_void = usize::MAX as *mut c_void;

/// Provider over the program break via `libc::sbrk`.
///
/// Contiguity holds only while nothing else moves the break, so at most one
/// `SbrkSource` should exist per process and the process must not mix it
/// with other break users.
pub struct SbrkSource {
  lo: *mut u8,
  brk: *mut u8,
}

unsafe impl Send for SbrkSource {}

impl SbrkSource {
  /// Capture the current program break, padding it up to [`DSIZE`] so block
  /// payloads are pointer-pair aligned from the first word.
  pub fn new() -> Option<Self> {
    unsafe {
      let cur = libc::sbrk(0);
      if cur == SBRK_FAILED {
        return None;
      }
      let pad = (cur as usize).next_multiple_of(DSIZE) - cur as usize;
      if pad != 0 && libc::sbrk(pad as intptr_t) == SBRK_FAILED {
        return None;
      }
      let lo = (cur as usize + pad) as *mut u8;
      Some(Self { lo, brk: lo })
    }
  }
}

unsafe impl HeapSource for SbrkSource {
  fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>> {
    if incr > isize::MAX as usize {
      return None;
    }
    let old = unsafe { libc::sbrk(incr as intptr_t) };
    if old == SBRK_FAILED {
      return None;
    }
    let old = old.cast::<u8>();
    self.brk = unsafe { old.add(incr) };
    NonNull::new(old)
  }

  fn lo(&self) -> *mut u8 {
    self.lo
  }

  fn hi(&self) -> *mut u8 {
    self.brk.wrapping_sub(1)
  }
}

/// Provider over a fixed-capacity anonymous `mmap` reservation, consumed by
/// an internal cursor. The reservation is unmapped on drop.
///
/// This is the provider of choice for tests and benches, and for processes
/// whose break is already owned by another allocator.
pub struct ArenaSource {
  base: *mut u8,
  cap: usize,
  len: usize,
}

unsafe impl Send for ArenaSource {}

impl ArenaSource {
  /// Reserve `cap` bytes (rounded up to [`DSIZE`]). Returns `None` when the
  /// mapping fails.
  pub fn new(cap: usize) -> Option<Self> {
    let cap = cap.checked_next_multiple_of(DSIZE)?;
    let base = unsafe { os_mmap(cap) };
    if base.is_null() {
      return None;
    }
    Some(Self { base, cap, len: 0 })
  }

  /// Total bytes the reservation can hand out.
  pub fn capacity(&self) -> usize {
    self.cap
  }
}

unsafe impl HeapSource for ArenaSource {
  fn sbrk(&mut self, incr: usize) -> Option<NonNull<u8>> {
    if incr > self.cap - self.len {
      return None;
    }
    let old = unsafe { self.base.add(self.len) };
    self.len += incr;
    NonNull::new(old)
  }

  fn lo(&self) -> *mut u8 {
    self.base
  }

  fn hi(&self) -> *mut u8 {
    unsafe { self.base.add(self.len).wrapping_sub(1) }
  }
}

impl Drop for ArenaSource {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base, self.cap) }
  }
}

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
    ptr.cast()
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn arena_grows_monotonically_and_refuses_past_capacity() {
    let mut src = ArenaSource::new(4096).expect("reserve arena");
    assert_eq!(src.capacity(), 4096);

    let a = src.sbrk(1024).expect("first grow").as_ptr();
    let b = src.sbrk(1024).expect("second grow").as_ptr();
    assert_eq!(unsafe { a.add(1024) }, b);
    assert_eq!(src.lo(), a);
    assert_eq!(src.hi(), unsafe { a.add(2048).sub(1) });

    assert!(src.sbrk(4096).is_none());
    assert!(src.sbrk(2048).is_some());
    assert!(src.sbrk(1).is_none());
  }

  #[test]
  fn arena_base_is_pointer_pair_aligned() {
    let mut src = ArenaSource::new(64).expect("reserve arena");
    let p = src.sbrk(16).expect("grow").as_ptr();
    assert_eq!(p as usize % DSIZE, 0);
  }

  #[test]
  fn arena_rounds_capacity_up_to_pointer_pair() {
    let src = ArenaSource::new(17).expect("reserve arena");
    assert_eq!(src.capacity(), 32);
  }

  #[test]
  fn zero_increment_reports_the_break() {
    let mut src = ArenaSource::new(64).expect("reserve arena");
    let base = src.sbrk(0).expect("query").as_ptr();
    assert_eq!(base, src.lo());
    src.sbrk(32).expect("grow");
    assert_eq!(src.sbrk(0).expect("query").as_ptr(), unsafe {
      base.add(32)
    });
  }
}
