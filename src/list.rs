//! Segregated free-list index.
//!
//! Sixteen doubly-linked lists, null-terminated on both ends with no
//! sentinel node. Buckets at or below [`FIFO_MAX`] push at the head for
//! locality of reuse; higher buckets keep their members sorted by ascending
//! block address so coalescing candidates cluster without a full walk.

use core::ptr::null_mut;

use crate::block::{self, LISTS};

/// Highest bucket index that uses FIFO insertion. Buckets above it are
/// address-ordered.
pub const FIFO_MAX: usize = (LISTS - 1) / 2;

/// The 16 free-list heads. Each head is either null or the first free block
/// in that bucket.
pub struct FreeLists {
  heads: [*mut u8; LISTS],
}

impl FreeLists {
  pub const fn new() -> Self {
    Self {
      heads: [null_mut(); LISTS],
    }
  }

  /// Head of bucket `idx`, null when the bucket is empty.
  #[inline]
  pub fn head(&self, idx: usize) -> *mut u8 {
    self.heads[idx]
  }

  /// Remove `bp` from its list, splicing its neighbours together. `hint`
  /// skips recomputing the bucket when the caller already knows it.
  ///
  /// # Safety
  ///
  /// `bp` must be a free block currently linked into the bucket for its
  /// size (which must equal `hint` when given).
  pub unsafe fn detach(&mut self, bp: *mut u8, hint: Option<usize>) {
    unsafe {
      let idx = match hint {
        Some(idx) => idx,
        None => block::bucket_of(block::block_size(bp)),
      };
      let pre = block::prev_free(bp);
      let suc = block::next_free(bp);

      if !pre.is_null() && !suc.is_null() {
        block::set_next_free(pre, suc);
        block::set_prev_free(suc, pre);
      } else if !pre.is_null() {
        block::set_next_free(pre, null_mut());
      } else if !suc.is_null() {
        block::set_prev_free(suc, null_mut());
        self.heads[idx] = suc;
      } else {
        self.heads[idx] = null_mut();
      }
    }
  }

  /// Insert `bp` into the bucket for its size: head-push for FIFO buckets,
  /// address-ordered scan for the rest.
  ///
  /// # Safety
  ///
  /// `bp` must be a free block with valid boundary tags, not currently on
  /// any list. When given, `hint` must equal the bucket for its size.
  pub unsafe fn attach(&mut self, bp: *mut u8, hint: Option<usize>) {
    unsafe {
      let idx = match hint {
        Some(idx) => idx,
        None => block::bucket_of(block::block_size(bp)),
      };

      if idx > FIFO_MAX {
        let mut curr = self.heads[idx];
        if curr.is_null() {
          block::set_next_free(bp, null_mut());
          block::set_prev_free(bp, null_mut());
          self.heads[idx] = bp;
          return;
        }

        // Scan for the first position where bp fits between neighbours.
        let mut next = block::next_free(curr);
        while !next.is_null() && bp > next {
          curr = next;
          next = block::next_free(curr);
        }
        let prev = block::prev_free(curr);

        if prev.is_null() && bp < curr {
          // New head.
          block::set_next_free(bp, curr);
          block::set_prev_free(curr, bp);
          block::set_prev_free(bp, null_mut());
          self.heads[idx] = bp;
        } else if next.is_null() && bp > curr {
          // New tail.
          block::set_next_free(bp, null_mut());
          block::set_prev_free(bp, curr);
          block::set_next_free(curr, bp);
        } else if next.is_null() && bp < curr {
          // Second to last, in front of the tail.
          block::set_next_free(prev, bp);
          block::set_next_free(bp, curr);
          block::set_prev_free(bp, prev);
          block::set_prev_free(curr, bp);
        } else if !next.is_null() && bp > curr && bp < next {
          // Interior.
          block::set_next_free(bp, next);
          block::set_prev_free(bp, curr);
          block::set_next_free(curr, bp);
          block::set_prev_free(next, bp);
        }
      } else {
        let head = self.heads[idx];
        if !head.is_null() {
          block::set_next_free(bp, head);
          block::set_prev_free(head, bp);
        } else {
          block::set_next_free(bp, null_mut());
        }
        block::set_prev_free(bp, null_mut());
        self.heads[idx] = bp;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block;

  // Fabricate a free block headed at word `off` of the buffer whose header
  // claims `size` bytes. List operations only touch the header and the two
  // link words, so test blocks need not physically span their claimed size.
  fn fake_block(buf: *mut usize, off: usize, size: usize) -> *mut u8 {
    unsafe {
      buf.add(off).write(block::pack(size, false));
      buf.add(off + 1).cast::<u8>()
    }
  }

  fn collect(lists: &FreeLists, idx: usize) -> Vec<*mut u8> {
    let mut out = Vec::new();
    let mut bp = lists.head(idx);
    while !bp.is_null() {
      out.push(bp);
      bp = unsafe { block::next_free(bp) };
    }
    out
  }

  // Every forward neighbour's backward link must point back at us.
  fn assert_well_formed(lists: &FreeLists, idx: usize) {
    unsafe {
      let mut prev = null_mut();
      let mut bp = lists.head(idx);
      while !bp.is_null() {
        assert_eq!(block::prev_free(bp), prev);
        prev = bp;
        bp = block::next_free(bp);
      }
    }
  }

  #[test]
  fn fifo_bucket_pushes_at_head() {
    let mut buf = [0usize; 32];
    let buf = buf.as_mut_ptr();
    let a = fake_block(buf, 0, 32);
    let b = fake_block(buf, 4, 32);
    let c = fake_block(buf, 8, 32);

    let mut lists = FreeLists::new();
    unsafe {
      lists.attach(a, None);
      lists.attach(b, None);
      lists.attach(c, None);
    }

    assert_eq!(collect(&lists, 0), vec![c, b, a]);
    assert_well_formed(&lists, 0);
  }

  #[test]
  fn ordered_bucket_sorts_by_address() {
    let mut buf = [0usize; 64];
    let buf = buf.as_mut_ptr();
    const SIZE: usize = 8192;
    assert_eq!(block::bucket_of(SIZE), FIFO_MAX + 1);

    let a = fake_block(buf, 0, SIZE);
    let b = fake_block(buf, 8, SIZE);
    let c = fake_block(buf, 16, SIZE);
    let d = fake_block(buf, 24, SIZE);

    // Scrambled insertion exercises the singleton, head, tail, and
    // interior subcases.
    let mut lists = FreeLists::new();
    unsafe {
      lists.attach(c, None);
      lists.attach(a, None);
      lists.attach(d, None);
      lists.attach(b, None);
    }

    assert_eq!(collect(&lists, FIFO_MAX + 1), vec![a, b, c, d]);
    assert_well_formed(&lists, FIFO_MAX + 1);
  }

  #[test]
  fn detach_splices_head_interior_and_tail() {
    let mut buf = [0usize; 64];
    let buf = buf.as_mut_ptr();
    const SIZE: usize = 8192;
    let a = fake_block(buf, 0, SIZE);
    let b = fake_block(buf, 8, SIZE);
    let c = fake_block(buf, 16, SIZE);
    let idx = block::bucket_of(SIZE);

    let mut lists = FreeLists::new();
    unsafe {
      lists.attach(a, None);
      lists.attach(b, None);
      lists.attach(c, None);

      lists.detach(b, None);
      assert_eq!(collect(&lists, idx), vec![a, c]);
      assert_well_formed(&lists, idx);

      lists.detach(a, Some(idx));
      assert_eq!(collect(&lists, idx), vec![c]);
      assert_well_formed(&lists, idx);

      lists.detach(c, None);
      assert!(lists.head(idx).is_null());
    }
  }

  #[test]
  fn detach_tail_terminates_predecessor() {
    let mut buf = [0usize; 32];
    let buf = buf.as_mut_ptr();
    let a = fake_block(buf, 0, 32);
    let b = fake_block(buf, 4, 32);

    let mut lists = FreeLists::new();
    unsafe {
      lists.attach(a, None);
      lists.attach(b, None);
      // FIFO order is [b, a]; detaching a removes the tail.
      lists.detach(a, None);
      assert_eq!(collect(&lists, 0), vec![b]);
      assert!(block::next_free(b).is_null());
      assert!(block::prev_free(b).is_null());
    }
  }
}
