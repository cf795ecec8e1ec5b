#![allow(clippy::missing_safety_doc)]

//! Segregated-fit `malloc`/`free`/`realloc`/`calloc` over a single growable arena.
//!
//! Every block is bracketed by 32-bit boundary tags and free blocks are kept in
//! ten size-class lists whose links are arena-relative offsets, so the arena can
//! be any byte region that grows at its high end (see [`MemorySource`]).
//!
//! ```text
//!   offset 0        4          8          16                         len-4   len
//!   +---------+----------+----------+-------------------- ... -----+--------+
//!   | padding | prologue | prologue |  hdr | payload ...  | ftr    |epilogue|
//!   |         |  header  |  footer  |      |              |        | header |
//!   +---------+----------+----------+-------------------- ... -----+--------+
//! ```

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::UnsafeCell,
  fmt, hint,
  iter,
  num::NonZeroU32,
  panic::Location,
  ptr::{NonNull, null_mut},
  slice,
  sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

// =============================================================================
// Constants
// =============================================================================

/// Alignment of every payload, and granularity of every block size.
pub const ALIGNMENT: usize = 8;
/// Width of a boundary tag or a free-list link.
const WORD: usize = 4;
/// Header plus footer.
const TAGS_SIZE: usize = 2 * WORD;
/// Smallest block able to hold both tags and both free-list links.
pub const MIN_BLOCK_SIZE: usize = TAGS_SIZE + 2 * WORD;

/// Number of segregated free lists.
pub const BUCKET_COUNT: usize = 10;
/// Bucket 0 covers every size below `1 << BUCKET_SHIFT`.
const BUCKET_SHIFT: u32 = 4;
/// Requests landing in this bucket or above are placed best-fit.
pub const BEST_FIT_BUCKET: usize = 4;

/// Minimum growth when no free block fits a request.
pub const CHUNK_SIZE: usize = 1 << 9;
/// Growth performed by [`Heap::new`].
pub const INITIAL_CHUNK_SIZE: usize = 1 << 12;

/// Padding, prologue header and footer, epilogue header.
pub const SENTINEL_OVERHEAD: usize = 4 * WORD;
/// Payload offset of the prologue block.
const PROLOGUE: usize = 2 * WORD;
/// Payload offset of the first real block.
const FIRST_PAYLOAD: usize = SENTINEL_OVERHEAD;
/// Largest arena that 32-bit tags and links can describe.
const MAX_ARENA_SIZE: usize = u32::MAX as usize & !(ALIGNMENT - 1);

/// Default growth limit of a [`BufferSource`].
pub const DEFAULT_BUFFER_LIMIT: usize = 20 << 20; // 20MB
/// Default virtual reservation of an [`Allocator`].
pub const DEFAULT_RESERVATION: usize = 1 << 30; // 1GB

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE == 2 * ALIGNMENT);
const _: () = assert!(CHUNK_SIZE % ALIGNMENT == 0);
const _: () = assert!(INITIAL_CHUNK_SIZE % ALIGNMENT == 0);
const _: () = assert!(INITIAL_CHUNK_SIZE >= MIN_BLOCK_SIZE);
const _: () = assert!(SENTINEL_OVERHEAD % ALIGNMENT == 0);
const _: () = assert!(FIRST_PAYLOAD % ALIGNMENT == 0);
const _: () = assert!(BEST_FIT_BUCKET < BUCKET_COUNT);
const _: () = assert!(bucket(usize::MAX) == BUCKET_COUNT - 1);
const _: () = assert!(bucket(MIN_BLOCK_SIZE) == 1);

// =============================================================================
// Types
// =============================================================================

/// Returned when the arena cannot grow any further.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("arena growth refused")
  }
}

impl std::error::Error for OutOfMemory {}

/// Offset of an allocated payload from the start of the arena. Never zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Address(NonZeroU32);

impl Address {
  #[inline]
  fn new(offset: usize) -> Option<Self> {
    u32::try_from(offset).ok().and_then(NonZeroU32::new).map(Self)
  }

  #[inline]
  pub const fn offset(self) -> usize {
    self.0.get() as usize
  }
}

impl fmt::Display for Address {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:#x}", self.0.get())
  }
}

/// Boundary tag: bits 3..32 hold the block size, bit 0 the allocated flag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Tag(u32);

impl Tag {
  const ALLOCATED: u32 = 0x1;
  const FLAGS: u32 = (ALIGNMENT - 1) as u32;
  const EPILOGUE: Tag = Tag::pack(0, true);

  #[inline(always)]
  const fn pack(size: usize, allocated: bool) -> Self {
    debug_assert!(size % ALIGNMENT == 0 && size <= MAX_ARENA_SIZE);
    Tag(size as u32 | allocated as u32)
  }

  #[inline(always)]
  const fn size(self) -> usize {
    (self.0 & !Self::FLAGS) as usize
  }

  #[inline(always)]
  const fn is_allocated(self) -> bool {
    self.0 & Self::ALLOCATED != 0
  }
}

/// Placement policy, chosen per request by [`FitPolicy::for_size`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FitPolicy {
  /// First block large enough, scanning buckets upward in list order.
  FirstFit,
  /// Smallest block large enough; the first one met wins ties.
  BestFit,
}

impl FitPolicy {
  /// Small requests dominate call volume and go first-fit; large ones go best-fit.
  #[inline]
  pub const fn for_size(adjusted_size: usize) -> Self {
    if bucket(adjusted_size) < BEST_FIT_BUCKET {
      FitPolicy::FirstFit
    } else {
      FitPolicy::BestFit
    }
  }
}

/// One physical block, as reported by [`Heap::blocks`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockInfo {
  pub address: Address,
  /// Whole block size, tags included.
  pub size: usize,
  pub allocated: bool,
}

// =============================================================================
// Memory Sources
// =============================================================================

/// The growth primitive behind a [`Heap`]: one contiguous region that only ever
/// grows at its high end.
pub trait MemorySource {
  /// Extends the region by `n` bytes and returns the offset of the first new
  /// byte. On failure the region is left unchanged.
  fn grow(&mut self, n: usize) -> Result<usize, OutOfMemory>;

  fn bytes(&self) -> &[u8];

  fn bytes_mut(&mut self) -> &mut [u8];

  /// Base pointer with write provenance over the whole region.
  fn as_mut_ptr(&mut self) -> *mut u8;

  /// Lowest address of the region.
  #[inline]
  fn start(&self) -> *const u8 {
    self.bytes().as_ptr()
  }

  /// One past the highest address of the region.
  #[inline]
  fn end(&self) -> *const u8 {
    self.bytes().as_ptr_range().end
  }

  #[inline]
  fn len(&self) -> usize {
    self.bytes().len()
  }

  #[inline]
  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Heap-backed region with a hard growth limit.
///
/// The backing buffer may move when it grows, so payloads are only reachable
/// through [`Heap::payload`] and [`Heap::payload_mut`], never through pointers
/// kept across calls.
pub struct BufferSource {
  /// `u64` storage keeps the base double-word aligned.
  words: Vec<u64>,
  len: usize,
  limit: usize,
}

impl BufferSource {
  pub fn new() -> Self {
    Self::with_limit(DEFAULT_BUFFER_LIMIT)
  }

  pub fn with_limit(limit: usize) -> Self {
    Self {
      words: Vec::new(),
      len: 0,
      limit,
    }
  }

  pub fn limit(&self) -> usize {
    self.limit
  }
}

impl Default for BufferSource {
  fn default() -> Self {
    Self::new()
  }
}

impl MemorySource for BufferSource {
  fn grow(&mut self, n: usize) -> Result<usize, OutOfMemory> {
    let old_len = self.len;
    let new_len = old_len
      .checked_add(n)
      .filter(|&len| len <= self.limit)
      .ok_or(OutOfMemory)?;

    let words = new_len.div_ceil(size_of::<u64>());
    self
      .words
      .try_reserve(words.saturating_sub(self.words.len()))
      .map_err(|_| OutOfMemory)?;
    self.words.resize(words, 0);
    self.len = new_len;
    Ok(old_len)
  }

  fn bytes(&self) -> &[u8] {
    // SAFETY: `words` holds at least `len` initialised bytes.
    unsafe { slice::from_raw_parts(self.words.as_ptr().cast(), self.len) }
  }

  fn bytes_mut(&mut self) -> &mut [u8] {
    // SAFETY: `words` holds at least `len` initialised bytes.
    unsafe { slice::from_raw_parts_mut(self.words.as_mut_ptr().cast(), self.len) }
  }

  fn as_mut_ptr(&mut self) -> *mut u8 {
    self.words.as_mut_ptr().cast()
  }
}

/// Fixed virtual reservation handed out from its low end. Addresses never move.
pub struct MmapSource {
  base: NonNull<u8>,
  capacity: usize,
  len: usize,
}

// SAFETY: the mapping is owned exclusively by this value.
unsafe impl Send for MmapSource {}

impl MmapSource {
  /// Reserves `capacity` bytes of address space. Pages are only backed once touched.
  pub fn reserve(capacity: usize) -> Result<Self, OutOfMemory> {
    let raw = unsafe { os_mmap(capacity) };
    let base = NonNull::new(raw).ok_or(OutOfMemory)?;
    Ok(Self {
      base,
      capacity,
      len: 0,
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }
}

impl MemorySource for MmapSource {
  fn grow(&mut self, n: usize) -> Result<usize, OutOfMemory> {
    let old_len = self.len;
    self.len = old_len
      .checked_add(n)
      .filter(|&len| len <= self.capacity)
      .ok_or(OutOfMemory)?;
    Ok(old_len)
  }

  fn bytes(&self) -> &[u8] {
    // SAFETY: the first `len` bytes of the mapping are readable and zero-initialised.
    unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
  }

  fn bytes_mut(&mut self) -> &mut [u8] {
    // SAFETY: as above, and `&mut self` makes the borrow exclusive.
    unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.len) }
  }

  fn as_mut_ptr(&mut self) -> *mut u8 {
    self.base.as_ptr()
  }
}

impl Drop for MmapSource {
  fn drop(&mut self) {
    unsafe { os_munmap(self.base.as_ptr(), self.capacity) };
  }
}

// =============================================================================
// Platform
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

/// Non-zero identifier of the calling thread.
#[inline]
fn current_thread() -> usize {
  unsafe { libc::pthread_self() as usize }
}

// =============================================================================
// Heap
// =============================================================================

/// Free-list link as stored in the arena: a payload offset, `0` for none.
#[inline(always)]
fn decode_link(word: u32) -> Option<usize> {
  (word != 0).then_some(word as usize)
}

#[inline(always)]
fn encode_link(link: Option<usize>) -> u32 {
  link.map_or(0, |offset| offset as u32)
}

/// Block size needed to serve a `size`-byte request, tags included.
///
/// `None` when the request cannot be described by a boundary tag.
#[inline]
pub fn adjusted_size(size: usize) -> Option<usize> {
  if size <= ALIGNMENT {
    return Some(MIN_BLOCK_SIZE);
  }
  size
    .checked_add(TAGS_SIZE + ALIGNMENT - 1)
    .map(|total| total & !(ALIGNMENT - 1))
    .filter(|&total| total <= MAX_ARENA_SIZE)
}

/// Single-caller allocator over one [`MemorySource`].
///
/// Not synchronised: every mutating operation takes `&mut self`. Wrap it in a
/// lock (see [`Allocator`]) to share it.
pub struct Heap<S> {
  source: S,
  /// Head payload offset of each size-class list, `0` when empty.
  heads: [u32; BUCKET_COUNT],
}

impl<S: MemorySource> Heap<S> {
  /// Lays out the sentinels in an empty `source` and grows it by
  /// [`INITIAL_CHUNK_SIZE`]. A source that already holds bytes is refused.
  pub fn new(mut source: S) -> Result<Self, OutOfMemory> {
    if !source.is_empty() {
      log::warn!("heap source already holds {:#x} bytes", source.len());
      return Err(OutOfMemory);
    }
    source.grow(SENTINEL_OVERHEAD)?;

    let mut heap = Self {
      source,
      heads: [0; BUCKET_COUNT],
    };
    heap.write_word(0, 0);
    heap.write_tag(PROLOGUE - WORD, Tag::pack(TAGS_SIZE, true));
    heap.write_tag(PROLOGUE, Tag::pack(TAGS_SIZE, true));
    heap.write_tag(PROLOGUE + WORD, Tag::EPILOGUE);

    heap.extend(INITIAL_CHUNK_SIZE)?;
    log::debug!(
      "heap initialised at {:p} with {:#x} bytes",
      heap.source.start(),
      heap.source.len()
    );
    Ok(heap)
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn into_source(self) -> S {
    self.source
  }

  // ---------------------------------------------------------------------------
  // Public API
  // ---------------------------------------------------------------------------

  /// `None` for a zero-byte request or when the arena cannot grow.
  pub fn malloc(&mut self, size: usize) -> Option<Address> {
    self.try_malloc(size).ok().flatten()
  }

  /// Like [`Heap::malloc`], but tells a zero-byte request apart from exhaustion.
  pub fn try_malloc(&mut self, size: usize) -> Result<Option<Address>, OutOfMemory> {
    if size == 0 {
      return Ok(None);
    }

    let bp = self.allocate(size)?;
    log::trace!("malloc({size}) -> {bp:#x}");
    self.check_after("malloc");
    Ok(Address::new(bp))
  }

  /// `ptr` must come from this heap and still be allocated.
  pub fn free(&mut self, ptr: Option<Address>) {
    let Some(addr) = ptr else {
      return;
    };

    let bp = addr.offset();
    let tag = self.tag(bp);
    debug_assert!(tag.is_allocated(), "free of unallocated block {addr}");

    self.write_block(bp, tag.size(), false);
    self.coalesce(bp);
    log::trace!("free({addr})");
    self.check_after("free");
  }

  /// Moves the allocation to a block of at least `size` bytes.
  ///
  /// On failure `None` is returned and `ptr` stays allocated and untouched.
  pub fn realloc(&mut self, ptr: Option<Address>, size: usize) -> Option<Address> {
    self.try_realloc(ptr, size).ok().flatten()
  }

  pub fn try_realloc(
    &mut self,
    ptr: Option<Address>,
    size: usize,
  ) -> Result<Option<Address>, OutOfMemory> {
    if size == 0 {
      self.free(ptr);
      return Ok(None);
    }
    let Some(old) = ptr else {
      return self.try_malloc(size);
    };

    let bp = self.allocate(size)?;
    let count = self.usable_size(old).min(size);
    self
      .source
      .bytes_mut()
      .copy_within(old.offset()..old.offset() + count, bp);
    log::trace!("realloc({old}, {size}) -> {bp:#x}, moved {count} bytes");

    self.free(Some(old));
    Ok(Address::new(bp))
  }

  /// Zero-filled allocation of `count * size` bytes. An overflowing product can
  /// never be satisfied and yields `None`.
  pub fn calloc(&mut self, count: usize, size: usize) -> Option<Address> {
    self.try_calloc(count, size).ok().flatten()
  }

  pub fn try_calloc(&mut self, count: usize, size: usize) -> Result<Option<Address>, OutOfMemory> {
    let total = count.saturating_mul(size);
    let addr = self.try_malloc(total)?;
    if let Some(addr) = addr {
      self.payload_mut(addr).fill(0);
      log::trace!("calloc({count}, {size}) zeroed {addr}");
    }
    Ok(addr)
  }

  /// Payload capacity of an allocated block; at least the size it was requested with.
  #[inline]
  pub fn usable_size(&self, addr: Address) -> usize {
    self.block_size(addr.offset()) - TAGS_SIZE
  }

  pub fn payload(&self, addr: Address) -> &[u8] {
    let bp = addr.offset();
    &self.source.bytes()[bp..bp + self.usable_size(addr)]
  }

  pub fn payload_mut(&mut self, addr: Address) -> &mut [u8] {
    let bp = addr.offset();
    let end = bp + self.usable_size(addr);
    &mut self.source.bytes_mut()[bp..end]
  }

  /// Raw pointer to the payload. Only stable across calls for sources that never
  /// move, such as [`MmapSource`].
  #[inline]
  pub fn as_ptr(&mut self, addr: Address) -> NonNull<u8> {
    debug_assert!(addr.offset() < self.source.len());
    let base = self.source.as_mut_ptr();
    // SAFETY: `base` is the non-null start of the region and the offset lies inside it.
    unsafe { NonNull::new_unchecked(base.add(addr.offset())) }
  }

  /// Maps a raw pointer back to its arena offset; `None` for null or foreign pointers.
  pub fn address_of(&self, ptr: *const u8) -> Option<Address> {
    if ptr >= self.source.end() {
      return None;
    }
    let offset = (ptr as usize).checked_sub(self.source.start() as usize)?;
    if offset < FIRST_PAYLOAD || offset % ALIGNMENT != 0 {
      return None;
    }
    Address::new(offset)
  }

  /// Physical blocks in address order, sentinels excluded.
  pub fn blocks(&self) -> Blocks<'_, S> {
    Blocks {
      heap: self,
      cursor: FIRST_PAYLOAD,
    }
  }

  // ---------------------------------------------------------------------------
  // Block Codec
  // ---------------------------------------------------------------------------

  #[inline(always)]
  fn read_word(&self, offset: usize) -> u32 {
    let mut word = [0; WORD];
    word.copy_from_slice(&self.source.bytes()[offset..offset + WORD]);
    u32::from_ne_bytes(word)
  }

  /// Bounds-checked read for walks over possibly corrupt metadata.
  #[inline]
  fn try_read_word(&self, offset: usize) -> Option<u32> {
    let bytes = self.source.bytes().get(offset..offset.checked_add(WORD)?)?;
    let mut word = [0; WORD];
    word.copy_from_slice(bytes);
    Some(u32::from_ne_bytes(word))
  }

  #[inline(always)]
  fn write_word(&mut self, offset: usize, value: u32) {
    self.source.bytes_mut()[offset..offset + WORD].copy_from_slice(&value.to_ne_bytes());
  }

  #[inline(always)]
  fn write_tag(&mut self, offset: usize, tag: Tag) {
    self.write_word(offset, tag.0);
  }

  /// Header tag of the block whose payload starts at `bp`.
  #[inline(always)]
  fn tag(&self, bp: usize) -> Tag {
    Tag(self.read_word(bp - WORD))
  }

  #[inline(always)]
  fn block_size(&self, bp: usize) -> usize {
    self.tag(bp).size()
  }

  /// Writes matching header and footer.
  #[inline]
  fn write_block(&mut self, bp: usize, size: usize, allocated: bool) {
    let tag = Tag::pack(size, allocated);
    self.write_tag(bp - WORD, tag);
    self.write_tag(bp + size - TAGS_SIZE, tag);
  }

  #[inline(always)]
  fn next_block(&self, bp: usize) -> usize {
    bp + self.block_size(bp)
  }

  /// Footer tag of the block physically before `bp`.
  #[inline(always)]
  fn prev_tag(&self, bp: usize) -> Tag {
    Tag(self.read_word(bp - TAGS_SIZE))
  }

  #[inline(always)]
  fn prev_block(&self, bp: usize) -> usize {
    bp - self.prev_tag(bp).size()
  }

  // ---------------------------------------------------------------------------
  // Free-List Table
  // ---------------------------------------------------------------------------

  #[inline(always)]
  fn next_link(&self, bp: usize) -> Option<usize> {
    decode_link(self.read_word(bp))
  }

  #[inline(always)]
  fn prev_link(&self, bp: usize) -> Option<usize> {
    decode_link(self.read_word(bp + WORD))
  }

  #[inline(always)]
  fn set_next_link(&mut self, bp: usize, next: Option<usize>) {
    self.write_word(bp, encode_link(next));
  }

  #[inline(always)]
  fn set_prev_link(&mut self, bp: usize, prev: Option<usize>) {
    self.write_word(bp + WORD, encode_link(prev));
  }

  /// Pushes a free, unlisted block on the head of `bucket`.
  fn insert(&mut self, bp: usize, bucket: usize) {
    debug_assert!(!self.tag(bp).is_allocated());
    let head = decode_link(self.heads[bucket]);

    self.set_next_link(bp, head);
    self.set_prev_link(bp, None);
    if let Some(head) = head {
      self.set_prev_link(head, Some(bp));
    }
    self.heads[bucket] = encode_link(Some(bp));
  }

  /// Splices a listed block out of its list. Its tag must still carry the size
  /// it was inserted with, since that is what names the bucket.
  fn remove(&mut self, bp: usize) {
    let next = self.next_link(bp);
    let prev = self.prev_link(bp);

    match prev {
      Some(prev) => self.set_next_link(prev, next),
      None => {
        let bucket = bucket(self.block_size(bp));
        debug_assert_eq!(decode_link(self.heads[bucket]), Some(bp));
        self.heads[bucket] = encode_link(next);
      }
    }
    if let Some(next) = next {
      self.set_prev_link(next, prev);
    }
  }

  /// Blocks of one size class, head to tail.
  fn list(&self, bucket: usize) -> impl Iterator<Item = usize> + '_ {
    iter::successors(decode_link(self.heads[bucket]), |&bp| self.next_link(bp))
  }

  // ---------------------------------------------------------------------------
  // Fit Finder / Placer
  // ---------------------------------------------------------------------------

  fn find_fit(&self, asize: usize) -> Option<usize> {
    let first = bucket(asize);
    match FitPolicy::for_size(asize) {
      FitPolicy::FirstFit => (first..BUCKET_COUNT)
        .flat_map(|bucket| self.list(bucket))
        .find(|&bp| self.block_size(bp) >= asize),
      FitPolicy::BestFit => {
        for bucket in first..BUCKET_COUNT {
          let best = self
            .list(bucket)
            .filter(|&bp| self.block_size(bp) >= asize)
            .min_by_key(|&bp| self.block_size(bp));
          // Bucket ranges are disjoint and ascending: nothing further up is smaller.
          if best.is_some() {
            return best;
          }
        }
        None
      }
    }
  }

  /// Allocates the front `asize` bytes of free block `bp`, returning any
  /// remainder of at least [`MIN_BLOCK_SIZE`] to the free lists.
  fn place(&mut self, bp: usize, asize: usize) {
    let size = self.block_size(bp);
    debug_assert!(!self.tag(bp).is_allocated() && size >= asize);

    self.remove(bp);
    let rest = size - asize;
    if rest >= MIN_BLOCK_SIZE {
      self.write_block(bp, asize, true);
      let remainder = bp + asize;
      self.write_block(remainder, rest, false);
      self.insert(remainder, bucket(rest));
    } else {
      self.write_block(bp, size, true);
    }
  }

  fn allocate(&mut self, size: usize) -> Result<usize, OutOfMemory> {
    let asize = adjusted_size(size).ok_or(OutOfMemory)?;
    let bp = match self.find_fit(asize) {
      Some(bp) => bp,
      None => self.extend(asize.max(CHUNK_SIZE))?,
    };
    self.place(bp, asize);
    Ok(bp)
  }

  // ---------------------------------------------------------------------------
  // Coalescer / Extender
  // ---------------------------------------------------------------------------

  /// Merges the free block `bp` with its free physical neighbours and lists the
  /// result. Returns the payload offset of the merged block.
  fn coalesce(&mut self, bp: usize) -> usize {
    let prev = self.prev_block(bp);
    let next = self.next_block(bp);
    let prev_free = !self.prev_tag(bp).is_allocated();
    let next_free = !self.tag(next).is_allocated();
    let mut size = self.block_size(bp);

    let start = match (prev_free, next_free) {
      (false, false) => bp,
      (true, false) => {
        self.remove(prev);
        size += self.block_size(prev);
        prev
      }
      (false, true) => {
        self.remove(next);
        size += self.block_size(next);
        bp
      }
      (true, true) => {
        self.remove(prev);
        self.remove(next);
        size += self.block_size(prev) + self.block_size(next);
        prev
      }
    };

    self.write_block(start, size, false);
    self.insert(start, bucket(size));
    start
  }

  /// Grows the arena by at least `bytes`, formats the new space as one free
  /// block and merges it with a free tail block.
  fn extend(&mut self, bytes: usize) -> Result<usize, OutOfMemory> {
    let size = align_up(bytes, ALIGNMENT);
    if self.source.len().saturating_add(size) > MAX_ARENA_SIZE {
      log::warn!("arena growth by {size:#x} bytes exceeds the 32-bit offset range");
      return Err(OutOfMemory);
    }

    let bp = self
      .source
      .grow(size)
      .inspect_err(|_| log::warn!("arena growth by {size:#x} bytes refused"))?;

    // The old epilogue becomes the new block's header.
    self.write_block(bp, size, false);
    self.write_tag(bp + size - WORD, Tag::EPILOGUE);
    log::debug!(
      "extended arena by {size:#x} bytes to {:#x}",
      self.source.len()
    );

    Ok(self.coalesce(bp))
  }

  // ---------------------------------------------------------------------------
  // Validator
  // ---------------------------------------------------------------------------

  /// Walks the arena and the free lists independently and reports every broken
  /// invariant. Never mutates the heap.
  pub fn check_consistency(&self, context: impl Into<Context>) -> Vec<Diagnostic> {
    let mut report = Report {
      context: context.into(),
      diagnostics: Vec::new(),
    };

    if !self.check_sentinels(&mut report) {
      return report.diagnostics;
    }
    let arena_free = self.check_blocks(&mut report);
    let listed_free = self.check_free_lists(&mut report);
    if arena_free != listed_free {
      report.push(
        None,
        Violation::FreeCountMismatch {
          arena: arena_free,
          lists: listed_free,
        },
      );
    }

    report.diagnostics
  }

  /// [`Heap::check_consistency`] with the caller's source location as context.
  #[track_caller]
  pub fn check(&self) -> Vec<Diagnostic> {
    self.check_consistency(Location::caller())
  }

  /// Returns `false` when the arena is too broken to walk.
  fn check_sentinels(&self, report: &mut Report) -> bool {
    let len = self.source.len();
    if len < SENTINEL_OVERHEAD || len % ALIGNMENT != 0 {
      report.push(None, Violation::ArenaLength { len });
      return false;
    }
    if self.source.start() as usize % ALIGNMENT != 0 {
      report.push(None, Violation::MisalignedArena);
    }

    let prologue = Tag::pack(TAGS_SIZE, true);
    if self.tag(PROLOGUE) != prologue {
      report.push(Some(PROLOGUE), Violation::PrologueHeader);
    }
    if Tag(self.read_word(PROLOGUE)) != prologue {
      report.push(Some(PROLOGUE), Violation::PrologueFooter);
    }
    if Tag(self.read_word(len - WORD)) != Tag::EPILOGUE {
      report.push(Some(len), Violation::Epilogue);
    }
    true
  }

  /// Arena walk. Returns the number of free blocks met.
  fn check_blocks(&self, report: &mut Report) -> usize {
    let len = self.source.len();
    let base = self.source.start() as usize;
    let mut free = 0;
    let mut total = 0;
    let mut prev_free = None;
    let mut bp = FIRST_PAYLOAD;

    while bp < len {
      let header = Tag(self.read_word(bp - WORD));
      let size = header.size();
      if size == 0 || bp + size > len {
        report.push(Some(bp), Violation::TruncatedBlock { size });
        return free;
      }

      if (base + bp) % ALIGNMENT != 0 {
        report.push(Some(bp), Violation::MisalignedBlock);
      }
      let footer = Tag(self.read_word(bp + size - TAGS_SIZE));
      if footer != header {
        report.push(
          Some(bp),
          Violation::TagMismatch {
            header: header.0,
            footer: footer.0,
          },
        );
      }

      if header.is_allocated() {
        prev_free = None;
      } else {
        free += 1;
        if size < MIN_BLOCK_SIZE {
          report.push(Some(bp), Violation::UndersizedFreeBlock { size });
        }
        if let Some(prev) = prev_free {
          report.push(Some(prev), Violation::ConsecutiveFree { next: bp });
        }
        prev_free = Some(bp);
      }

      total += size;
      bp += size;
    }

    if total + SENTINEL_OVERHEAD != len {
      report.push(
        None,
        Violation::SizeAccounting {
          blocks: total,
          arena: len,
        },
      );
    }
    free
  }

  /// Free-list walk. Returns the number of listed blocks met.
  fn check_free_lists(&self, report: &mut Report) -> usize {
    let len = self.source.len();
    // More entries than the arena can hold means the list loops.
    let limit = len / MIN_BLOCK_SIZE;
    let mut listed = 0;

    for (index, &head) in self.heads.iter().enumerate() {
      let mut prev = None;
      let mut cursor = decode_link(head);
      let mut steps = 0;

      while let Some(bp) = cursor {
        steps += 1;
        if steps > limit {
          report.push(Some(bp), Violation::CyclicList { bucket: index });
          break;
        }
        if bp < FIRST_PAYLOAD || bp % ALIGNMENT != 0 || bp + MIN_BLOCK_SIZE > len {
          report.push(Some(bp), Violation::LinkOutOfBounds { bucket: index });
          break;
        }

        let tag = self.tag(bp);
        if tag.is_allocated() {
          report.push(Some(bp), Violation::AllocatedInList { bucket: index });
        }
        let expected = bucket(tag.size());
        if expected != index {
          report.push(
            Some(bp),
            Violation::WrongBucket {
              bucket: index,
              expected,
            },
          );
        }
        if self.prev_link(bp) != prev {
          report.push(
            Some(bp),
            Violation::BrokenLinks {
              prev: prev.unwrap_or(0),
            },
          );
        }

        listed += 1;
        prev = Some(bp);
        cursor = self.next_link(bp);
      }
    }

    listed
  }

  #[inline]
  fn check_after(&self, operation: &'static str) {
    #[cfg(feature = "heap-check")]
    {
      let diagnostics = self.check_consistency(operation);
      debug_assert!(diagnostics.is_empty(), "{operation}: {diagnostics:?}");
    }
    #[cfg(not(feature = "heap-check"))]
    let _ = operation;
  }
}

/// Iterator returned by [`Heap::blocks`]. Stops early at the first malformed tag.
pub struct Blocks<'a, S> {
  heap: &'a Heap<S>,
  cursor: usize,
}

impl<S: MemorySource> Iterator for Blocks<'_, S> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let bp = self.cursor;
    let tag = Tag(self.heap.try_read_word(bp - WORD)?);
    let size = tag.size();
    if size == 0 || bp + size > self.heap.source.len() {
      return None;
    }

    self.cursor = bp + size;
    Some(BlockInfo {
      address: Address::new(bp)?,
      size,
      allocated: tag.is_allocated(),
    })
  }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Where a consistency check was requested from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Context {
  Label(&'static str),
  Caller(&'static Location<'static>),
}

impl From<&'static str> for Context {
  fn from(label: &'static str) -> Self {
    Context::Label(label)
  }
}

impl From<&'static Location<'static>> for Context {
  fn from(location: &'static Location<'static>) -> Self {
    Context::Caller(location)
  }
}

impl fmt::Display for Context {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Context::Label(label) => f.write_str(label),
      Context::Caller(location) => write!(f, "{}:{}", location.file(), location.line()),
    }
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Violation {
  ArenaLength { len: usize },
  MisalignedArena,
  PrologueHeader,
  PrologueFooter,
  Epilogue,
  MisalignedBlock,
  TruncatedBlock { size: usize },
  TagMismatch { header: u32, footer: u32 },
  UndersizedFreeBlock { size: usize },
  ConsecutiveFree { next: usize },
  SizeAccounting { blocks: usize, arena: usize },
  LinkOutOfBounds { bucket: usize },
  CyclicList { bucket: usize },
  AllocatedInList { bucket: usize },
  WrongBucket { bucket: usize, expected: usize },
  BrokenLinks { prev: usize },
  FreeCountMismatch { arena: usize, lists: usize },
}

impl fmt::Display for Violation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match *self {
      Violation::ArenaLength { len } => write!(f, "arena length {len:#x} cannot hold the sentinels"),
      Violation::MisalignedArena => f.write_str("arena base is not double-word aligned"),
      Violation::PrologueHeader => f.write_str("prologue header corrupted"),
      Violation::PrologueFooter => f.write_str("prologue footer corrupted"),
      Violation::Epilogue => f.write_str("epilogue corrupted"),
      Violation::MisalignedBlock => f.write_str("block is not double-word aligned"),
      Violation::TruncatedBlock { size } => {
        write!(f, "block size {size:#x} runs past the epilogue")
      }
      Violation::TagMismatch { header, footer } => {
        write!(f, "header {header:#x} and footer {footer:#x} differ")
      }
      Violation::UndersizedFreeBlock { size } => {
        write!(f, "free block of {size:#x} bytes cannot hold its links")
      }
      Violation::ConsecutiveFree { next } => write!(f, "free block followed by free block {next:#x}"),
      Violation::SizeAccounting { blocks, arena } => {
        write!(f, "blocks cover {blocks:#x} bytes of a {arena:#x} byte arena")
      }
      Violation::LinkOutOfBounds { bucket } => write!(f, "bucket {bucket} links outside the arena"),
      Violation::CyclicList { bucket } => write!(f, "bucket {bucket} loops"),
      Violation::AllocatedInList { bucket } => write!(f, "allocated block listed in bucket {bucket}"),
      Violation::WrongBucket { bucket, expected } => {
        write!(f, "free block in bucket {bucket}, belongs in {expected}")
      }
      Violation::BrokenLinks { prev } => write!(f, "prev link does not point back to {prev:#x}"),
      Violation::FreeCountMismatch { arena, lists } => {
        write!(f, "{arena} free blocks in the arena but {lists} in the free lists")
      }
    }
  }
}

/// One broken invariant found by [`Heap::check_consistency`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Diagnostic {
  pub context: Context,
  /// Payload offset of the offending block, if there is one.
  pub block: Option<usize>,
  pub violation: Violation,
}

impl fmt::Display for Diagnostic {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.block {
      Some(block) => write!(f, "{}: block {block:#x}: {}", self.context, self.violation),
      None => write!(f, "{}: {}", self.context, self.violation),
    }
  }
}

struct Report {
  context: Context,
  diagnostics: Vec<Diagnostic>,
}

impl Report {
  fn push(&mut self, block: Option<usize>, violation: Violation) {
    let diagnostic = Diagnostic {
      context: self.context,
      block,
      violation,
    };
    log::warn!("{diagnostic}");
    self.diagnostics.push(diagnostic);
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

struct SpinLock {
  locked: AtomicBool,
  /// Thread holding the lock, `0` when free.
  owner: AtomicUsize,
}

/// Releases the lock on drop, unwinding included.
struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl SpinLock {
  const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
      owner: AtomicUsize::new(0),
    }
  }

  /// `None` when the calling thread already holds the lock.
  #[inline]
  fn lock(&self) -> Option<SpinGuard<'_>> {
    let me = current_thread();
    // Only this thread ever stores `me`, and it clears it before releasing.
    if self.owner.load(Ordering::Relaxed) == me {
      return None;
    }

    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    self.owner.store(me, Ordering::Relaxed);
    Some(SpinGuard { lock: self })
  }
}

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.owner.store(0, Ordering::Relaxed);
    self.lock.locked.store(false, Ordering::Release);
  }
}

/// Spin-locked [`Heap`] over an [`MmapSource`], reserved on first use.
///
/// Layouts aligned beyond [`ALIGNMENT`] are refused. A call made from inside
/// another call on the same thread (a logger that allocates, say) gets null
/// instead of spinning on its own lock.
pub struct Allocator {
  lock: SpinLock,
  heap: UnsafeCell<Option<Heap<MmapSource>>>,
  reservation: usize,
}

// SAFETY: `heap` is only reached through `with_heap`, under `lock`.
unsafe impl Sync for Allocator {}

impl Allocator {
  pub const fn new() -> Self {
    Self::with_reservation(DEFAULT_RESERVATION)
  }

  pub const fn with_reservation(bytes: usize) -> Self {
    Self {
      lock: SpinLock::new(),
      heap: UnsafeCell::new(None),
      reservation: bytes,
    }
  }

  /// Runs `f` on the heap under the lock. `None` if the reservation failed or
  /// the calling thread is already inside `with_heap`.
  fn with_heap<R, F: FnOnce(&mut Heap<MmapSource>) -> R>(&self, f: F) -> Option<R> {
    let _guard = self.lock.lock()?;
    // SAFETY: the lock grants exclusive access to the slot.
    let slot = unsafe { &mut *self.heap.get() };
    if slot.is_none() {
      *slot = MmapSource::reserve(self.reservation)
        .and_then(Heap::new)
        .ok();
    }
    slot.as_mut().map(f)
  }
}

impl Default for Allocator {
  fn default() -> Self {
    Self::new()
  }
}

#[inline]
fn raw(heap: &mut Heap<MmapSource>, addr: Option<Address>) -> *mut u8 {
  addr.map_or(null_mut(), |addr| heap.as_ptr(addr).as_ptr())
}

/// `realloc` over raw pointers. A pointer this heap did not hand out is refused
/// with null and left alone, it is not treated as null.
fn realloc_raw(heap: &mut Heap<MmapSource>, ptr: *mut u8, size: usize) -> *mut u8 {
  let old = heap.address_of(ptr);
  if old.is_none() && !ptr.is_null() {
    return null_mut();
  }
  let addr = heap.realloc(old, size);
  raw(heap, addr)
}

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    let size = layout.size().max(1);
    self
      .with_heap(|heap| {
        let addr = heap.malloc(size);
        raw(heap, addr)
      })
      .unwrap_or(null_mut())
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    self.with_heap(|heap| {
      let addr = heap.address_of(ptr);
      heap.free(addr);
    });
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    self
      .with_heap(|heap| realloc_raw(heap, ptr, new_size))
      .unwrap_or(null_mut())
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return null_mut();
    }
    let size = layout.size().max(1);
    self
      .with_heap(|heap| {
        let addr = heap.calloc(1, size);
        raw(heap, addr)
      })
      .unwrap_or(null_mut())
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
static GLOBAL: Allocator = Allocator::new();

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  GLOBAL
    .with_heap(|heap| {
      let addr = heap.malloc(size);
      raw(heap, addr)
    })
    .unwrap_or(null_mut())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  if ptr.is_null() {
    return;
  }
  GLOBAL.with_heap(|heap| {
    let addr = heap.address_of(ptr);
    heap.free(addr);
  });
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  GLOBAL
    .with_heap(|heap| {
      let addr = heap.calloc(nmemb, size);
      raw(heap, addr)
    })
    .unwrap_or(null_mut())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  GLOBAL
    .with_heap(|heap| realloc_raw(heap, ptr, size))
    .unwrap_or(null_mut())
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  GLOBAL
    .with_heap(|heap| heap.address_of(ptr).map_or(0, |addr| heap.usable_size(addr)))
    .unwrap_or(0)
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

// =============================================================================
// Size Classes
// =============================================================================

/// Size class of a block: `[0, 16)` is 0, `[16, 32)` is 1, doubling up to the
/// catch-all class 9 for `4096` and above.
#[inline(always)]
pub const fn bucket(size: usize) -> usize {
  let scaled = size >> BUCKET_SHIFT;
  let bits = (usize::BITS - scaled.leading_zeros()) as usize;
  if bits > BUCKET_COUNT - 1 {
    BUCKET_COUNT - 1
  } else {
    bits
  }
}
