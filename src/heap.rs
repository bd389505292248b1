//! The allocator core: heap layout, placement policy, coalescing, resize.
//!
//! A heap is a sequence of boundary-tagged blocks framed by two sentinels: a
//! minimum-size allocated prologue whose payload is the heap origin, and a
//! zero-size allocated epilogue header at the current heap end. Iterating
//! from the prologue by next-block steps visits every block and terminates
//! at the epilogue. Every interior block is either allocated or present in
//! exactly one free list.

use core::ptr::{self, null_mut};

use thiserror::Error;

use crate::block::{self, CHUNK, DSIZE, LISTS, MIN_BLOCK, WSIZE};
use crate::list::FreeLists;
use crate::mem::HeapSource;

/// The memory provider refused the initial four-word request.
#[derive(Debug, Error)]
#[error("memory provider refused the initial heap request")]
pub struct InitError;

/// A segregated-fit heap over an sbrk-style memory provider.
///
/// All state lives either in-band in the heap segment or in the 16 list
/// heads here; allocated blocks carry no metadata beyond their boundary
/// tags. The heap is single-threaded: concurrent callers need an external
/// mutex, and the provider must not call back into the allocator.
pub struct Heap<M> {
  mem: M,
  /// Prologue payload: the heap origin for blockwise walks.
  base: *mut u8,
  lists: FreeLists,
}

unsafe impl<M: Send> Send for Heap<M> {}

impl<M: HeapSource> Heap<M> {
  /// Install the prologue, epilogue, and empty free lists over `mem`.
  ///
  /// Consumes four words: alignment padding, prologue header and footer,
  /// epilogue header.
  pub fn new(mut mem: M) -> Result<Self, InitError> {
    let start = mem.sbrk(4 * WSIZE).ok_or(InitError)?.as_ptr();
    unsafe {
      block::put(start, 0);
      block::put(start.add(WSIZE), block::pack(DSIZE, true));
      block::put(start.add(2 * WSIZE), block::pack(DSIZE, true));
      block::put(start.add(3 * WSIZE), block::pack(0, true));
      let base = start.add(DSIZE);
      log::debug!("heap installed, origin {base:p}");
      Ok(Self {
        mem,
        base,
        lists: FreeLists::new(),
      })
    }
  }

  /// Allocate a block of at least `size` usable bytes.
  ///
  /// The returned payload is pointer-pair aligned and stays valid until it
  /// is freed or the heap is dropped. Returns null for zero-size requests
  /// and on exhaustion, leaving allocator state unchanged.
  pub fn allocate(&mut self, size: usize) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    let Some(asize) = adjust_request(size) else {
      return null_mut();
    };

    unsafe {
      let bp = self.find_fit(asize);
      if !bp.is_null() {
        self.place(bp, asize);
        log::trace!("allocate({size}) -> {bp:p} (fit, asize {asize})");
        return bp;
      }

      // No fit: grow by at least one chunk and place directly in the new
      // block. The extension is never coalesced with a possibly-free tail
      // block.
      let Some(bp) = self.extend(asize.max(CHUNK) / WSIZE) else {
        return null_mut();
      };
      self.place(bp, asize);
      log::trace!("allocate({size}) -> {bp:p} (extended, asize {asize})");
      bp
    }
  }

  /// Return a block to the heap, merging it with free neighbours.
  ///
  /// # Safety
  ///
  /// `bp` must be null (a no-op) or a payload pointer obtained from
  /// [`allocate`](Self::allocate) or [`resize`](Self::resize) on this heap
  /// and not yet freed.
  pub unsafe fn free(&mut self, bp: *mut u8) {
    if bp.is_null() {
      return;
    }
    unsafe {
      let size = block::block_size(bp);
      block::put(block::header(bp), block::pack(size, false));
      block::put(block::footer(bp), block::pack(size, false));
      let merged = self.coalesce(bp);
      log::trace!("free({bp:p}): {size} bytes, merged block {merged:p}");
    }
  }

  /// Resize `bp` to at least `size` usable bytes.
  ///
  /// Cases are tried in order: shrink in place, merge with a free
  /// successor, extend the epilogue, merge with a free predecessor (the
  /// payload slides down), else allocate-copy-free. On failure returns null
  /// and leaves the original block untouched.
  ///
  /// # Safety
  ///
  /// `bp` must be null (behaves as [`allocate`](Self::allocate)) or a live
  /// payload pointer from this heap.
  pub unsafe fn resize(&mut self, bp: *mut u8, size: usize) -> *mut u8 {
    unsafe {
      if size == 0 {
        self.free(bp);
        return null_mut();
      }
      if bp.is_null() {
        return self.allocate(size);
      }
      let Some(asize) = adjust_request(size) else {
        return null_mut();
      };
      let cur = block::block_size(bp);

      // Shrink in place, splitting off the tail when it can stand alone.
      if asize < cur {
        let remain = cur - asize;
        if remain >= MIN_BLOCK {
          block::put(block::header(bp), block::pack(asize, true));
          block::put(block::footer(bp), block::pack(asize, true));
          let rest = block::next_block(bp);
          block::put(block::header(rest), block::pack(remain, false));
          block::put(block::footer(rest), block::pack(remain, false));
          self.lists.attach(rest, None);
        }
        log::trace!("resize({bp:p}, {size}): shrink in place");
        return bp;
      }

      let next = block::next_block(bp);
      let next_word = block::get(block::header(next));
      let next_size = block::word_size(next_word);

      // The successor is free and the combined span suffices.
      if !block::word_alloc(next_word) && cur + next_size >= asize {
        self.lists.detach(next, None);
        let total = cur + next_size;
        let remain = total - asize;
        if remain >= MIN_BLOCK {
          block::put(block::header(bp), block::pack(asize, true));
          block::put(block::footer(bp), block::pack(asize, true));
          let rest = block::next_block(bp);
          block::put(block::header(rest), block::pack(remain, false));
          block::put(block::footer(rest), block::pack(remain, false));
          self.lists.attach(rest, None);
        } else {
          // A sub-minimum leftover cannot hold its own tags and linkage;
          // the block keeps the whole span.
          block::put(block::header(bp), block::pack(total, true));
          block::put(block::footer(bp), block::pack(total, true));
        }
        log::trace!("resize({bp:p}, {size}): merged with successor");
        return bp;
      }

      // The successor is the epilogue: grow by exactly the shortfall.
      if next_size == 0 {
        let diff = asize - cur;
        if diff > 0 && self.extend(diff / WSIZE).is_none() {
          return null_mut();
        }
        block::put(block::header(bp), block::pack(asize, true));
        block::put(block::footer(bp), block::pack(asize, true));
        log::trace!("resize({bp:p}, {size}): extended epilogue by {diff}");
        return bp;
      }

      // The predecessor is free and the combined span suffices; the
      // payload moves down. The leftover is not split out.
      let prev = block::prev_block(bp);
      let prev_word = block::get(block::header(prev));
      if !block::word_alloc(prev_word) && cur + block::word_size(prev_word) >= asize {
        let total = cur + block::word_size(prev_word);
        self.lists.detach(prev, None);
        ptr::copy(bp, prev, cur);
        block::put(block::header(prev), block::pack(total, true));
        block::put(block::footer(prev), block::pack(total, true));
        log::trace!("resize({bp:p}, {size}): merged with predecessor -> {prev:p}");
        return prev;
      }

      // Fallback: fresh block, copy, free the old one.
      let newp = self.allocate(size);
      if newp.is_null() {
        return null_mut();
      }
      ptr::copy_nonoverlapping(bp, newp, size.min(cur));
      self.free(bp);
      log::trace!("resize({bp:p}, {size}): relocated to {newp:p}");
      newp
    }
  }

  /// Usable payload bytes of an allocated block; 0 for null.
  ///
  /// # Safety
  ///
  /// `bp` must be null or a live payload pointer from this heap.
  pub unsafe fn usable_size(&self, bp: *mut u8) -> usize {
    if bp.is_null() {
      0
    } else {
      unsafe { block::block_size(bp) - DSIZE }
    }
  }

  /// Four-case boundary-tag merge. Consults the neighbours' tags, absorbs
  /// whichever are free, and attaches the result to its free list.
  /// Returns the (possibly relocated) payload of the merged block.
  unsafe fn coalesce(&mut self, bp: *mut u8) -> *mut u8 {
    unsafe {
      // The previous block's footer sits just below our header.
      let prev_alloc = block::word_alloc(block::get(bp.sub(DSIZE)));
      let next = block::next_block(bp);
      let next_alloc = block::word_alloc(block::get(block::header(next)));
      let mut size = block::block_size(bp);

      if prev_alloc && next_alloc {
        self.lists.attach(bp, None);
        return bp;
      }

      if prev_alloc && !next_alloc {
        self.lists.detach(next, None);
        size += block::block_size(next);
        // The absorbed successor's footer becomes the merged footer.
        block::put(block::footer(next), block::pack(size, false));
        block::put(block::header(bp), block::pack(size, false));
        self.lists.attach(bp, None);
        return bp;
      }

      let prev = block::prev_block(bp);
      if !prev_alloc && next_alloc {
        self.lists.detach(prev, None);
        size += block::block_size(prev);
        block::put(block::footer(bp), block::pack(size, false));
        block::put(block::header(prev), block::pack(size, false));
        self.lists.attach(prev, None);
        return prev;
      }

      // Both neighbours free.
      self.lists.detach(next, None);
      self.lists.detach(prev, None);
      size += block::block_size(prev) + block::block_size(next);
      block::put(block::footer(next), block::pack(size, false));
      block::put(block::header(prev), block::pack(size, false));
      self.lists.attach(prev, None);
      prev
    }
  }

  /// Grow the heap by `words` words, rounded up to an even count to keep
  /// pointer-pair alignment. The old epilogue header becomes the new
  /// block's header and a fresh epilogue is laid past its footer. Does not
  /// attach or coalesce; callers decide.
  unsafe fn extend(&mut self, words: usize) -> Option<*mut u8> {
    let size = (words + words % 2) * WSIZE;
    let bp = self.mem.sbrk(size)?.as_ptr();
    unsafe {
      block::put(block::header(bp), block::pack(size, false));
      block::put(block::footer(bp), block::pack(size, false));
      block::put(block::header(block::next_block(bp)), block::pack(0, true));
      log::debug!("heap extended by {size} bytes, block {bp:p}");
      Some(bp)
    }
  }

  /// First fit within the smallest feasible size class, then upward across
  /// classes. Detaches and returns the chosen block, or null.
  unsafe fn find_fit(&mut self, asize: usize) -> *mut u8 {
    unsafe {
      let mut idx = block::bucket_of(asize);
      while idx < LISTS {
        let mut bp = self.lists.head(idx);
        while !bp.is_null() {
          if asize <= block::block_size(bp) {
            self.lists.detach(bp, Some(idx));
            return bp;
          }
          bp = block::next_free(bp);
        }
        idx += 1;
      }
      null_mut()
    }
  }

  /// Write allocated tags over a detached free block, splitting off the
  /// tail as a new free block when at least a minimum block remains.
  unsafe fn place(&mut self, bp: *mut u8, asize: usize) {
    unsafe {
      let bsize = block::block_size(bp);
      let remain = bsize - asize;

      if remain >= MIN_BLOCK {
        block::put(block::header(bp), block::pack(asize, true));
        block::put(block::footer(bp), block::pack(asize, true));
        let rest = block::next_block(bp);
        block::put(block::header(rest), block::pack(remain, false));
        block::put(block::footer(rest), block::pack(remain, false));
        self.lists.attach(rest, None);
      } else {
        block::put(block::header(bp), block::pack(bsize, true));
        block::put(block::footer(bp), block::pack(bsize, true));
      }
    }
  }

  /// Side-effect-free consistency audit.
  ///
  /// Verifies that free-list members are marked free and lie inside the
  /// provider's watermarks, that the heap contains no two adjacent free
  /// blocks, that boundary tags agree, that the sentinels frame the heap,
  /// and that every free heap block sits in the list for its size class.
  /// Failures are reported through `log::error!`; returns `false` on the
  /// first violation.
  pub fn check(&self) -> bool {
    unsafe {
      // Sentinels: minimum-size allocated prologue, zero-size allocated
      // epilogue occupying the final heap word.
      if block::block_size(self.base) != DSIZE || !block::block_alloc(self.base) {
        log::error!("prologue damaged at {:p}", self.base);
        return false;
      }

      // Every free-list member must be marked free and lie in bounds; its
      // physical successor must start past its own span (audits heap
      // adjacency, catching header corruption).
      let lo = self.mem.lo();
      let hi = self.mem.hi();
      for idx in 0..LISTS {
        let mut bp = self.lists.head(idx);
        while !bp.is_null() {
          if bp < lo || bp > hi {
            log::error!("free block {bp:p} outside heap bounds {lo:p}..={hi:p}");
            return false;
          }
          if block::block_alloc(bp) {
            log::error!("free list {idx} holds a block marked allocated at {bp:p}");
            return false;
          }
          let size = block::block_size(bp);
          if size < MIN_BLOCK || size % DSIZE != 0 {
            log::error!("free block {bp:p} has corrupt size {size}");
            return false;
          }
          if block::header(block::next_block(bp)) > hi.wrapping_add(1).wrapping_sub(WSIZE) {
            log::error!("free block {bp:p} overlaps the heap end");
            return false;
          }
          bp = block::next_free(bp);
        }
      }

      // Blockwise walk: tags agree, no two adjacent free blocks, and every
      // free block is a member of the list for its size class.
      let mut bp = self.base;
      while block::block_size(bp) > 0 {
        if block::get(block::header(bp)) != block::get(block::footer(bp)) {
          log::error!("header/footer mismatch at {bp:p}");
          return false;
        }
        let next = block::next_block(bp);
        let next_word = block::get(block::header(next));
        if !block::block_alloc(bp)
          && block::word_size(next_word) > 0
          && !block::word_alloc(next_word)
        {
          log::error!("contiguous free blocks at {bp:p}");
          return false;
        }
        if !block::block_alloc(bp) {
          let idx = block::bucket_of(block::block_size(bp));
          let mut cur = self.lists.head(idx);
          while !cur.is_null() && cur != bp {
            cur = block::next_free(cur);
          }
          if cur.is_null() {
            log::error!("free block {bp:p} missing from list {idx}");
            return false;
          }
        }
        bp = next;
      }

      // The walk ended on the epilogue: allocated, size zero, flush with
      // the heap end.
      if !block::block_alloc(bp) {
        log::error!("epilogue not marked allocated at {bp:p}");
        return false;
      }
      if block::header(bp) as usize + WSIZE != hi as usize + 1 {
        log::error!("epilogue at {bp:p} is not at the heap end");
        return false;
      }

      true
    }
  }
}

/// Round a byte request up to pointer-pair granularity plus one pair of tag
/// overhead. Requests at or below one pointer-pair take a whole minimum
/// block. `None` when rounding would overflow.
fn adjust_request(size: usize) -> Option<usize> {
  if size <= DSIZE {
    Some(2 * DSIZE)
  } else {
    let padded = size.checked_add(DSIZE + (DSIZE - 1))?;
    Some(DSIZE * (padded / DSIZE))
  }
}
