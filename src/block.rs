//! Boundary-tag word format and block address arithmetic.
//!
//! Every block is a contiguous span of words framed by a one-word header and
//! a one-word footer. Both tags pack the block's total size (always a
//! multiple of [`DSIZE`], so the low bits are free) with the allocated flag
//! in bit 0. The payload pointer addresses the word right after the header
//! and is what clients see. Free blocks keep their list linkage in the first
//! two payload words; allocated blocks overwrite the linkage with user data.
//!
//! Everything here is pure address arithmetic over payload pointers.
//! Behavior is undefined if a pointer does not address a block inside the
//! heap.

/// Word size in bytes. All heap metadata is stored in words.
pub const WSIZE: usize = size_of::<usize>();
/// Pointer-pair size: the block-size granularity and payload alignment.
pub const DSIZE: usize = 2 * WSIZE;
/// Smallest useful block: header, two link words, footer.
pub const MIN_BLOCK: usize = 4 * WSIZE;
/// Number of segregated free lists.
pub const LISTS: usize = 16;
/// Initial heap growth quantum in bytes.
pub const CHUNK: usize = 1 << 7;

const _: () = assert!(DSIZE.is_power_of_two());
const _: () = assert!(MIN_BLOCK == 2 * DSIZE);
const _: () = assert!(CHUNK % DSIZE == 0);

/// Pack a block size and allocated flag into a boundary-tag word.
///
/// `size` must be a multiple of [`DSIZE`] so the flag bit is free.
#[inline]
pub fn pack(size: usize, alloc: bool) -> usize {
  size | alloc as usize
}

/// Size field of a boundary-tag word.
#[inline]
pub fn word_size(word: usize) -> usize {
  word & !(DSIZE - 1)
}

/// Allocated flag of a boundary-tag word.
#[inline]
pub fn word_alloc(word: usize) -> bool {
  word & 0x1 != 0
}

/// Read the word at `p`.
#[inline]
pub unsafe fn get(p: *mut u8) -> usize {
  unsafe { p.cast::<usize>().read() }
}

/// Write the word at `p`.
#[inline]
pub unsafe fn put(p: *mut u8, word: usize) {
  unsafe { p.cast::<usize>().write(word) }
}

/// Header address of the block with payload `bp`.
#[inline]
pub unsafe fn header(bp: *mut u8) -> *mut u8 {
  unsafe { bp.sub(WSIZE) }
}

/// Total size of the block with payload `bp`, read from its header.
#[inline]
pub unsafe fn block_size(bp: *mut u8) -> usize {
  unsafe { word_size(get(header(bp))) }
}

/// Whether the block with payload `bp` is marked allocated.
#[inline]
pub unsafe fn block_alloc(bp: *mut u8) -> bool {
  unsafe { word_alloc(get(header(bp))) }
}

/// Footer address of the block with payload `bp`; consults the header for
/// the block size.
#[inline]
pub unsafe fn footer(bp: *mut u8) -> *mut u8 {
  unsafe { bp.add(block_size(bp)).sub(DSIZE) }
}

/// Payload of the physically next block.
#[inline]
pub unsafe fn next_block(bp: *mut u8) -> *mut u8 {
  unsafe { bp.add(block_size(bp)) }
}

/// Payload of the physically previous block, located through its footer
/// sitting just below our header.
#[inline]
pub unsafe fn prev_block(bp: *mut u8) -> *mut u8 {
  unsafe { bp.sub(word_size(get(bp.sub(DSIZE)))) }
}

// Free-block linkage: payload word 0 is the forward link, word 1 the
// backward link. Both are null-terminated.

/// Forward link of a free block.
#[inline]
pub unsafe fn next_free(bp: *mut u8) -> *mut u8 {
  unsafe { get(bp) as *mut u8 }
}

/// Backward link of a free block.
#[inline]
pub unsafe fn prev_free(bp: *mut u8) -> *mut u8 {
  unsafe { get(bp.add(WSIZE)) as *mut u8 }
}

#[inline]
pub unsafe fn set_next_free(bp: *mut u8, to: *mut u8) {
  unsafe { put(bp, to as usize) }
}

#[inline]
pub unsafe fn set_prev_free(bp: *mut u8, to: *mut u8) {
  unsafe { put(bp.add(WSIZE), to as usize) }
}

/// Map a block size to its free-list bucket.
///
/// Sizes at or below 32 bytes land in bucket 0. Each halving claims the
/// next bucket; past bucket [`LISTS`]`/2` the shift widens to a full byte,
/// so the tail buckets band very coarsely. Monotonic non-decreasing in
/// `size`.
pub fn bucket_of(size: usize) -> usize {
  let mut size = size;
  let mut idx = 0;
  while idx < LISTS - 1 && size > 32 {
    size >>= if idx > LISTS / 2 { 8 } else { 1 };
    idx += 1;
  }
  idx
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::ptr::null_mut;

  #[test]
  fn pack_splits_back_into_size_and_flag() {
    assert_eq!(word_size(pack(64, true)), 64);
    assert!(word_alloc(pack(64, true)));
    assert_eq!(word_size(pack(128, false)), 128);
    assert!(!word_alloc(pack(128, false)));
    assert_eq!(word_size(pack(0, true)), 0);
  }

  #[test]
  fn bucket_banding_is_exponential_with_a_coarse_tail() {
    assert_eq!(bucket_of(16), 0);
    assert_eq!(bucket_of(32), 0);
    assert_eq!(bucket_of(48), 1);
    assert_eq!(bucket_of(64), 1);
    assert_eq!(bucket_of(80), 2);
    assert_eq!(bucket_of(128), 2);
    assert_eq!(bucket_of(256), 3);
    assert_eq!(bucket_of(512), 4);
    assert_eq!(bucket_of(8192), 8);
    assert_eq!(bucket_of(16384), 9);
    assert_eq!(bucket_of(32768), 10);
    assert_eq!(bucket_of(1 << 24), 11);
  }

  #[test]
  fn bucket_is_monotonic_and_in_range() {
    let mut last = 0;
    for size in (MIN_BLOCK..1 << 20).step_by(DSIZE) {
      let bucket = bucket_of(size);
      assert!(bucket < LISTS);
      assert!(
        bucket >= last,
        "bucket_of({size}) = {bucket} dropped below {last}"
      );
      last = bucket;
    }
  }

  #[test]
  fn neighbour_arithmetic_round_trips() {
    // Two blocks laid out back to back in a word buffer.
    let mut words = [0usize; 16];
    unsafe {
      let base = words.as_mut_ptr().cast::<u8>();
      let a = base.add(WSIZE);
      put(header(a), pack(32, true));
      put(footer(a), pack(32, true));
      let b = next_block(a);
      assert_eq!(b, base.add(WSIZE + 32));
      put(header(b), pack(64, false));
      put(footer(b), pack(64, false));
      assert_eq!(prev_block(b), a);
      assert_eq!(next_block(b), b.add(64));
      assert_eq!(prev_block(next_block(b)), b);
      assert_eq!(block_size(a), 32);
      assert_eq!(block_size(b), 64);
      assert!(block_alloc(a));
      assert!(!block_alloc(b));
      assert_eq!(get(header(b)), get(footer(b)));
    }
  }

  #[test]
  fn free_links_use_first_two_payload_words() {
    let mut words = [0usize; 8];
    unsafe {
      let bp = words.as_mut_ptr().add(1).cast::<u8>();
      set_next_free(bp, bp);
      set_prev_free(bp, null_mut());
      assert_eq!(next_free(bp), bp);
      assert!(prev_free(bp).is_null());
    }
    assert_eq!(words[1], words.as_ptr() as usize + WSIZE);
    assert_eq!(words[2], 0);
  }
}
