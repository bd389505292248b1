//! C-compatible single-context convenience form.
//!
//! One process-wide heap over the program break, initialized lazily on the
//! first call. The allocator is single-threaded: these entry points must be
//! externally serialized, and the process must not have another owner of
//! the program break.

use core::cell::UnsafeCell;
use core::ptr::{self, null_mut};

use crate::heap::Heap;
use crate::mem::SbrkSource;

struct GlobalHeap(UnsafeCell<Option<Heap<SbrkSource>>>);

// Callers promise external serialization; see the module docs.
unsafe impl Sync for GlobalHeap {}

static HEAP: GlobalHeap = GlobalHeap(UnsafeCell::new(None));

unsafe fn with_heap<R>(default: R, f: impl FnOnce(&mut Heap<SbrkSource>) -> R) -> R {
  unsafe {
    let slot = &mut *HEAP.0.get();
    if slot.is_none() {
      let Some(src) = SbrkSource::new() else {
        return default;
      };
      let Ok(heap) = Heap::new(src) else {
        return default;
      };
      *slot = Some(heap);
    }
    match slot.as_mut() {
      Some(heap) => f(heap),
      None => default,
    }
  }
}

/// # Safety
///
/// Single-threaded use only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  unsafe { with_heap(null_mut(), |heap| heap.allocate(size)) }
}

/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator; single-threaded
/// use only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  unsafe { with_heap((), |heap| unsafe { heap.free(ptr) }) }
}

/// # Safety
///
/// Single-threaded use only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  unsafe {
    let Some(total) = nmemb.checked_mul(size) else {
      return null_mut();
    };
    if total == 0 {
      return null_mut();
    }
    let ptr = with_heap(null_mut(), |heap| heap.allocate(total));
    if !ptr.is_null() {
      ptr::write_bytes(ptr, 0, total);
    }
    ptr
  }
}

/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator; single-threaded
/// use only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  unsafe { with_heap(null_mut(), |heap| unsafe { heap.resize(ptr, size) }) }
}

/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator; single-threaded
/// use only.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { with_heap(0, |heap| unsafe { heap.usable_size(ptr) }) }
}
