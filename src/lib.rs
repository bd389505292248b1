//! segalloc: a segregated-fit heap allocator with boundary-tag coalescing.
//!
//! The allocator manages a single contiguous heap obtained from an
//! sbrk-style [`HeapSource`]. Every block carries a one-word header and
//! footer packing its size with an allocated bit; free blocks thread two
//! in-payload link words through one of 16 segregated free lists. Small
//! size classes recycle FIFO, large ones stay address-ordered. Placement is
//! first fit within the smallest feasible class, splitting when the
//! remainder can stand alone; freed blocks merge with free neighbours in
//! O(1) through their boundary tags.
//!
//! No metadata lives outside the heap beyond the 16 list heads, and there
//! is no locking: a [`Heap`] is single-threaded, and concurrent use
//! requires an external mutex.
//!
//! ```
//! use segalloc::{ArenaSource, Heap};
//!
//! let src = ArenaSource::new(1 << 20).expect("reserve arena");
//! let mut heap = Heap::new(src).expect("install heap");
//!
//! let p = heap.allocate(64);
//! assert!(!p.is_null());
//! let p = unsafe { heap.resize(p, 256) };
//! unsafe { heap.free(p) };
//! assert!(heap.check());
//! ```
//!
//! The `c_api` feature additionally exports C `malloc`/`free`/`calloc`/
//! `realloc` symbols over one process-wide heap on the program break.

mod block;
mod heap;
mod list;
mod mem;

#[cfg(feature = "c_api")]
mod c_api;

pub use heap::{Heap, InitError};
pub use mem::{ArenaSource, HeapSource, SbrkSource};
