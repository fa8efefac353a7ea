//! Tiered dynamic-memory allocator for latency-sensitive, single-owner use.
//!
//! Requests are routed by size to one of three engines: a size-class small
//! pool (bump chunks plus per-slot LIFO free lists), a boundary-tagged
//! coalescing tier for mid-range blocks, and a dedicated page-source region
//! per large block. Every live allocation is self-describing through a tag
//! word written immediately before the user pointer.
//!
//! The [`Heap`] performs no internal synchronization. Callers that need
//! allocation from several threads wrap an instance in an external mutex or
//! keep one heap per thread.

use core::fmt;
use core::mem::offset_of;
#[cfg(feature = "tracking")]
use core::panic::Location;
use core::ptr::{self, NonNull, null_mut};

use thiserror::Error;
use tracing::{debug, trace, warn};

// =============================================================================
// Constants
// =============================================================================

/// Alignment quantum. Every user pointer and every stored block size is a
/// multiple of this.
pub const ALIGN: usize = 16;

/// Largest payload served by the small-object pool.
pub const SMALL_MAX: usize = 256;

/// Largest payload served by the coalescing tier; anything above gets a
/// dedicated region.
pub const MEDIUM_MAX: usize = 32 * 1024;

/// Number of fixed-size slots in the small tier.
const SMALL_SLOTS: usize = SMALL_MAX / ALIGN;

/// Default size of one small-tier bump chunk.
const DEFAULT_SMALL_CHUNK: usize = 16 * 1024;

/// Default page granularity of the coalescing tier.
const DEFAULT_MEDIUM_PAGE: usize = 64 * 1024;

/// Tag-word layout: low two bits are the tier, bit 2 is the free flag, the
/// stored block size (header plus payload) sits above `TAG_SIZE_SHIFT`.
const TAG_TIER_MASK: usize = 0b0011;
const TAG_FREE: usize = 0b0100;
const TAG_SIZE_SHIFT: u32 = 4;

const TAG_SMALL: usize = Tier::Small as usize;
const TAG_MEDIUM: usize = Tier::Medium as usize;
const TAG_LARGE: usize = Tier::Large as usize;

const SMALL_HDR: usize = size_of::<SmallHeader>();
const SMALL_PAGE_HDR: usize = size_of::<SmallPage>();
#[cfg(not(feature = "compact"))]
const MEDIUM_HDR: usize = size_of::<MediumHeader>();
#[cfg(not(feature = "compact"))]
const MEDIUM_PAGE_HDR: usize = size_of::<MediumPage>();
const LARGE_HDR: usize = size_of::<LargeHeader>();

/// Smallest block the coalescing tier will split off: header plus one quantum.
#[cfg(not(feature = "compact"))]
const MIN_MEDIUM_BLOCK: usize = MEDIUM_HDR + ALIGN;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGN.is_power_of_two());
const _: () = assert!(SMALL_MAX % ALIGN == 0);
const _: () = assert!(SMALL_MAX < MEDIUM_MAX);
const _: () = assert!(DEFAULT_MEDIUM_PAGE.is_power_of_two());
const _: () = assert!(TAG_SMALL == 0 && TAG_MEDIUM == 1 && TAG_LARGE == 2);
const _: () = assert!(size_of::<Link>() <= ALIGN);
const _: () = assert!(size_of::<FreeNode>() <= ALIGN);

// The tag word must sit in the last word of every header, immediately before
// the payload, so free/resize/query can dispatch without knowing the tier in
// advance.
const _: () = assert!(SMALL_HDR % ALIGN == 0);
const _: () = assert!(offset_of!(SmallHeader, word) == SMALL_HDR - size_of::<usize>());
const _: () = assert!(SMALL_PAGE_HDR % ALIGN == 0);
#[cfg(not(feature = "compact"))]
const _: () = assert!(MEDIUM_HDR % ALIGN == 0);
#[cfg(not(feature = "compact"))]
const _: () = assert!(offset_of!(MediumHeader, word) == MEDIUM_HDR - size_of::<usize>());
#[cfg(not(feature = "compact"))]
const _: () = assert!(MEDIUM_PAGE_HDR % ALIGN == 0);
const _: () = assert!(LARGE_HDR % ALIGN == 0);
const _: () = assert!(offset_of!(LargeHeader, word) == LARGE_HDR - size_of::<usize>());
const _: () = assert!(DEFAULT_SMALL_CHUNK >= SMALL_PAGE_HDR + SMALL_HDR + SMALL_MAX);

#[cfg(feature = "tracking")]
const _: () = assert!(offset_of!(TrackInfo, live) == 0);
#[cfg(feature = "tracking")]
const _: () = assert!(offset_of!(SmallHeader, track) == 0);
#[cfg(all(feature = "tracking", not(feature = "compact")))]
const _: () = assert!(offset_of!(MediumHeader, track) == 0);
#[cfg(feature = "tracking")]
const _: () = assert!(offset_of!(LargeHeader, track) == 0);

// =============================================================================
// Types
// =============================================================================

/// Allocation strategy a block belongs to, selected by request size and
/// recorded in the block's tag word for the rest of its life.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tier {
  Small = 0,
  Medium = 1,
  Large = 2,
}

impl Tier {
  pub fn as_str(self) -> &'static str {
    match self {
      Tier::Small => "small",
      Tier::Medium => "medium",
      Tier::Large => "large",
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Node of a doubly-linked intrusive ring. Each ring is anchored by a
/// sentinel that is never removed, so the links always close into a ring and
/// insert/unlink need no null checks.
#[repr(C)]
struct Link {
  prev: *mut Link,
  next: *mut Link,
}

impl Link {
  const fn dangling() -> Self {
    Self {
      prev: null_mut(),
      next: null_mut(),
    }
  }

  /// Closes `l` into a one-element ring; `l` becomes a sentinel.
  unsafe fn init_ring(l: *mut Link) {
    unsafe {
      (*l).prev = l;
      (*l).next = l;
    }
  }

  unsafe fn insert_after(l: *mut Link, at: *mut Link) {
    unsafe {
      let nxt = (*at).next;
      (*l).prev = at;
      (*l).next = nxt;
      (*at).next = l;
      (*nxt).prev = l;
    }
  }

  unsafe fn unlink(l: *mut Link) {
    unsafe {
      let prv = (*l).prev;
      let nxt = (*l).next;
      (*prv).next = nxt;
      (*nxt).prev = prv;
      (*l).prev = null_mut();
      (*l).next = null_mut();
    }
  }
}

/// Debug metadata carried at the head of every block header when call-site
/// tracking is compiled in.
#[cfg(feature = "tracking")]
#[repr(C)]
struct TrackInfo {
  /// Ring of all live allocations, anchored in the heap.
  live: Link,
  /// Call site that requested the allocation.
  loc: &'static Location<'static>,
  /// Size the caller asked for, before rounding.
  requested: usize,
  /// User pointer of this block.
  user: *mut u8,
  _pad: usize,
}

/// A freed small block reinterprets its payload as this single forward link,
/// so slot free lists need no storage of their own.
#[repr(C)]
struct FreeNode {
  next: *mut FreeNode,
}

#[repr(C, align(16))]
struct SmallHeader {
  #[cfg(feature = "tracking")]
  track: TrackInfo,
  _pad: usize,
  word: usize,
}

/// One bump chunk of the small tier. Blocks are carved from `bump` upward
/// and never returned to the page source before teardown.
#[repr(C, align(16))]
struct SmallPage {
  next: *mut SmallPage,
  size: usize,
  bump: *mut u8,
  _pad: usize,
}

#[cfg(not(feature = "compact"))]
#[repr(C, align(16))]
struct MediumHeader {
  #[cfg(feature = "tracking")]
  track: TrackInfo,
  /// Address-ordered ring of all blocks in the owning page.
  all: Link,
  page: *mut MediumPage,
  word: usize,
}

/// One backing page of the coalescing tier. Its block headers tile the
/// region after this header exactly, with no gaps and no overlaps.
#[cfg(not(feature = "compact"))]
#[repr(C, align(16))]
struct MediumPage {
  next: *mut MediumPage,
  size: usize,
  /// Sentinel of the address-ordered all-blocks ring.
  all: Link,
}

#[repr(C, align(16))]
struct LargeHeader {
  #[cfg(feature = "tracking")]
  track: TrackInfo,
  /// Ring of all live large blocks, anchored in the heap.
  all: Link,
  _pad: usize,
  word: usize,
}

#[cfg(not(feature = "compact"))]
struct MediumTier {
  pages: *mut MediumPage,
  /// Sentinel of the free-block ring. Free blocks store their ring link in
  /// the first payload bytes; insertion is LIFO.
  free: Link,
}

#[cfg(not(feature = "compact"))]
impl MediumTier {
  fn boxed() -> Box<Self> {
    let mut tier = Box::new(MediumTier {
      pages: null_mut(),
      free: Link::dangling(),
    });
    unsafe { Link::init_ring(&raw mut tier.free) };
    tier
  }
}

struct LargeTier {
  all: Link,
}

impl LargeTier {
  fn boxed() -> Box<Self> {
    let mut tier = Box::new(LargeTier {
      all: Link::dangling(),
    });
    unsafe { Link::init_ring(&raw mut tier.all) };
    tier
  }
}

#[cfg(feature = "tracking")]
struct LiveRing {
  all: Link,
}

#[cfg(feature = "tracking")]
impl LiveRing {
  fn boxed() -> Box<Self> {
    let mut ring = Box::new(LiveRing {
      all: Link::dangling(),
    });
    unsafe { Link::init_ring(&raw mut ring.all) };
    ring
  }
}

// =============================================================================
// Tag Word
// =============================================================================

#[inline(always)]
fn pack_tag(stored: usize, tier: Tier, free: bool) -> usize {
  (stored << TAG_SIZE_SHIFT) | tier as usize | if free { TAG_FREE } else { 0 }
}

#[inline(always)]
fn tag_stored(word: usize) -> usize {
  word >> TAG_SIZE_SHIFT
}

#[inline(always)]
fn tag_is_free(word: usize) -> bool {
  word & TAG_FREE != 0
}

/// The tag word lives in the word immediately preceding the user pointer.
#[inline(always)]
unsafe fn tag_ptr(user: *mut u8) -> *mut usize {
  unsafe { user.cast::<usize>().sub(1) }
}

#[cfg(feature = "tracking")]
fn tier_from_bits(bits: usize) -> Tier {
  match bits {
    TAG_MEDIUM => Tier::Medium,
    TAG_LARGE => Tier::Large,
    _ => Tier::Small,
  }
}

#[cfg(feature = "tracking")]
fn header_size_for(bits: usize) -> usize {
  match bits {
    #[cfg(not(feature = "compact"))]
    TAG_MEDIUM => MEDIUM_HDR,
    TAG_LARGE => LARGE_HDR,
    _ => SMALL_HDR,
  }
}

// =============================================================================
// Page Source
// =============================================================================

/// Provider of raw backing regions. All three tiers draw their memory from
/// one of these; the heap never touches the platform directly.
///
/// Returned regions must be aligned to at least [`ALIGN`].
pub trait PageSource {
  /// Obtains a region of exactly `size` bytes, or `None` when the platform
  /// is out of memory.
  fn acquire(&mut self, size: usize) -> Option<NonNull<u8>>;

  /// Returns a region to the platform.
  ///
  /// # Safety
  ///
  /// `ptr` and `size` must match a previous successful [`acquire`] that has
  /// not been released since.
  ///
  /// [`acquire`]: PageSource::acquire
  unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);
}

/// Default page source backed by the platform's virtual memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPageSource;

#[cfg(unix)]
impl PageSource for SystemPageSource {
  fn acquire(&mut self, size: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe {
      libc::mmap(
        null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };
    if ptr == libc::MAP_FAILED {
      None
    } else {
      NonNull::new(ptr.cast::<u8>())
    }
  }

  unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
    unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
  }
}

#[cfg(not(unix))]
impl PageSource for SystemPageSource {
  fn acquire(&mut self, size: usize) -> Option<NonNull<u8>> {
    let layout = core::alloc::Layout::from_size_align(size, ALIGN).ok()?;
    NonNull::new(unsafe { std::alloc::alloc(layout) })
  }

  unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
    let layout = unsafe { core::alloc::Layout::from_size_align_unchecked(size, ALIGN) };
    unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
  }
}

// =============================================================================
// Configuration
// =============================================================================

/// Runtime tunables of a [`Heap`].
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
  /// Size of one small-tier bump chunk.
  pub small_chunk_size: usize,
  /// Page granularity of the coalescing tier; also what
  /// [`Heap::page_granularity`] reports. Must be a power of two.
  pub medium_page_size: usize,
  /// Return an entirely-free coalescing-tier page to the page source. Off
  /// by default: pages normally live as long as the heap.
  pub reclaim_empty_pages: bool,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      small_chunk_size: DEFAULT_SMALL_CHUNK,
      medium_page_size: DEFAULT_MEDIUM_PAGE,
      reclaim_empty_pages: false,
    }
  }
}

// =============================================================================
// Errors
// =============================================================================

/// Allocation failure. Retry policy (cache eviction, degraded modes) is the
/// caller's concern, so this always surfaces as an explicit result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("page source could not supply {0} bytes")]
  OutOfMemory(usize),
}

/// A broken structural invariant found by [`Heap::verify_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
  #[error("block {block:#x} carries invalid tier tag {tag:#x}")]
  BadTierTag { block: usize, tag: usize },
  #[error("small chunk {page:#x}: headers do not tile the bump region")]
  SmallChainBroken { page: usize },
  #[error("slot {slot} free list holds block {block:#x} that is not flagged free")]
  SmallFreeFlagMismatch { slot: usize, block: usize },
  #[error("slot {slot} free list holds block {block:#x} of a different slot")]
  SmallSlotMismatch { slot: usize, block: usize },
  #[error("small block {block:#x} is flagged free but missing from its slot free list")]
  SmallFreeListMissing { block: usize },
  #[cfg(not(feature = "compact"))]
  #[error("page {page:#x}: block headers do not tile the page")]
  MediumChainBroken { page: usize },
  #[cfg(not(feature = "compact"))]
  #[error("adjacent free blocks {first:#x} and {second:#x} were not coalesced")]
  Uncoalesced { first: usize, second: usize },
  #[cfg(not(feature = "compact"))]
  #[error("free ring entry {block:#x} is not flagged free")]
  FreeRingFlagMismatch { block: usize },
  #[cfg(not(feature = "compact"))]
  #[error("block {block:#x} is flagged free but missing from the free ring")]
  FreeRingMissing { block: usize },
  #[error("large block {block:#x} stored size {stored} is smaller than its header")]
  LargeSizeInvalid { block: usize, stored: usize },
  #[error("live large block {block:#x} is flagged free")]
  LargeFlaggedFree { block: usize },
  #[error("{tier} tier statistics report more frees than allocations")]
  StatsUnderflow { tier: Tier },
}

// =============================================================================
// Statistics
// =============================================================================

/// Monotonic per-tier counters. `alloc_count - free_count` is the number of
/// live blocks; `bytes_used` (requested payload) never exceeds
/// `bytes_allocated` (stored bytes, headers included).
#[derive(Debug, Clone, Copy, Default)]
pub struct TierStats {
  pub alloc_count: u64,
  pub free_count: u64,
  pub bytes_allocated: u64,
  pub bytes_used: u64,
  /// Smallest payload ever requested from this tier. Zero until the first
  /// allocation.
  #[cfg(feature = "tracking")]
  pub min_payload: u64,
  /// Largest payload ever requested from this tier.
  #[cfg(feature = "tracking")]
  pub max_payload: u64,
}

impl TierStats {
  pub fn live_blocks(&self) -> u64 {
    self.alloc_count - self.free_count
  }

  fn note_alloc(&mut self, stored: usize, requested: usize) {
    #[cfg(feature = "tracking")]
    {
      if self.alloc_count == 0 {
        self.min_payload = requested as u64;
      } else {
        self.min_payload = self.min_payload.min(requested as u64);
      }
      self.max_payload = self.max_payload.max(requested as u64);
    }
    self.alloc_count += 1;
    self.bytes_allocated += stored as u64;
    self.bytes_used += requested as u64;
  }

  fn note_free(&mut self) {
    self.free_count += 1;
  }
}

/// Aggregate counters across all three tiers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
  pub small: TierStats,
  pub medium: TierStats,
  pub large: TierStats,
}

impl Statistics {
  pub fn live_blocks(&self) -> u64 {
    self.small.live_blocks() + self.medium.live_blocks() + self.large.live_blocks()
  }
}

/// One live allocation as reported by [`Heap::live_allocations`].
#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy)]
pub struct LiveAllocation {
  pub address: usize,
  pub requested: usize,
  pub tier: Tier,
  pub file: &'static str,
  pub line: u32,
}

// =============================================================================
// Heap
// =============================================================================

/// The allocator context. One logical owner; all operations take `&mut self`
/// and complete synchronously.
pub struct Heap<S: PageSource = SystemPageSource> {
  source: S,
  config: HeapConfig,
  small_pages: *mut SmallPage,
  small_slots: [*mut FreeNode; SMALL_SLOTS],
  #[cfg(not(feature = "compact"))]
  medium: Box<MediumTier>,
  large: Box<LargeTier>,
  stats: Statistics,
  #[cfg(feature = "tracking")]
  live: Box<LiveRing>,
}

// Raw pointers make Heap !Send by default, but all of them point into memory
// the heap exclusively owns, so moving the whole heap to another thread is
// sound. The sentinel rings live in boxes and survive the move.
unsafe impl<S: PageSource + Send> Send for Heap<S> {}

impl Heap<SystemPageSource> {
  pub fn new() -> Self {
    Self::with_source(SystemPageSource, HeapConfig::default())
  }
}

impl Default for Heap<SystemPageSource> {
  fn default() -> Self {
    Self::new()
  }
}

impl<S: PageSource> Heap<S> {
  /// Builds a heap over a caller-supplied page source.
  ///
  /// Panics if `config` is unusable (non-power-of-two page granularity, or a
  /// small chunk too small to hold one maximum-slot block).
  pub fn with_source(source: S, config: HeapConfig) -> Self {
    assert!(
      config.medium_page_size == ceil_pow2(config.medium_page_size),
      "medium_page_size must be a nonzero power of two"
    );
    assert!(
      config.small_chunk_size >= SMALL_PAGE_HDR + SMALL_HDR + SMALL_MAX,
      "small_chunk_size cannot hold a maximum-slot block"
    );
    Self {
      source,
      config,
      small_pages: null_mut(),
      small_slots: [null_mut(); SMALL_SLOTS],
      #[cfg(not(feature = "compact"))]
      medium: MediumTier::boxed(),
      large: LargeTier::boxed(),
      stats: Statistics::default(),
      #[cfg(feature = "tracking")]
      live: LiveRing::boxed(),
    }
  }

  /// Allocates `size` bytes, 16-aligned. Zero-size requests are served as
  /// one byte. The usable capacity of the block may exceed `size`; see
  /// [`query_size`](Heap::query_size).
  #[cfg_attr(feature = "tracking", track_caller)]
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let user = if size <= SMALL_MAX {
      self.alloc_small(size)?
    } else {
      #[cfg(not(feature = "compact"))]
      let user = if size <= MEDIUM_MAX {
        self.alloc_medium(size)?
      } else {
        self.alloc_large(size)?
      };
      #[cfg(feature = "compact")]
      let user = self.alloc_large(size)?;
      user
    };
    #[cfg(feature = "tracking")]
    unsafe {
      self.track_insert(user.as_ptr(), size, Location::caller());
    }
    Ok(user)
  }

  /// Releases a block.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by this heap's [`allocate`] or [`resize`]
  /// and not freed since. Freeing foreign or stale pointers is undefined
  /// behavior in release builds; debug builds catch the common cases.
  ///
  /// [`allocate`]: Heap::allocate
  /// [`resize`]: Heap::resize
  pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
    let user = ptr.as_ptr();
    let word = unsafe { *tag_ptr(user) };
    #[cfg(feature = "tracking")]
    unsafe {
      self.track_remove(user, word);
    }
    match word & TAG_TIER_MASK {
      TAG_SMALL => unsafe { self.free_small(user) },
      #[cfg(not(feature = "compact"))]
      TAG_MEDIUM => unsafe { self.free_medium(user) },
      TAG_LARGE => unsafe { self.free_large(user) },
      other => debug_assert!(false, "pointer {user:p} carries invalid tier tag {other}"),
    }
  }

  /// Grows or shrinks a block to `new_size` bytes.
  ///
  /// Returns the same pointer when the block's current tier can satisfy the
  /// new size in place; otherwise allocates fresh, copies
  /// `min(old_usable, new_size)` bytes, frees the old block and returns the
  /// new pointer. This is the only operation that may relocate data.
  ///
  /// # Safety
  ///
  /// Same contract as [`free`](Heap::free); additionally the caller must
  /// drop every other pointer into the block across this call.
  #[cfg_attr(feature = "tracking", track_caller)]
  pub unsafe fn resize(
    &mut self,
    ptr: NonNull<u8>,
    new_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let user = ptr.as_ptr();
    let word = unsafe { *tag_ptr(user) };
    let new = new_size.max(1);
    match word & TAG_TIER_MASK {
      TAG_SMALL => {
        let capacity = tag_stored(word) - SMALL_HDR;
        if new <= capacity {
          #[cfg(feature = "tracking")]
          unsafe {
            self.track_update(user, word, new);
          }
          return Ok(ptr);
        }
        unsafe { self.relocate(user, capacity, new_size) }
      }
      #[cfg(not(feature = "compact"))]
      TAG_MEDIUM => unsafe { self.resize_medium(ptr, new_size) },
      TAG_LARGE => {
        let stored = tag_stored(word);
        if LARGE_HDR + align_up(new, ALIGN) == stored {
          #[cfg(feature = "tracking")]
          unsafe {
            self.track_update(user, word, new);
          }
          return Ok(ptr);
        }
        unsafe { self.relocate(user, stored - LARGE_HDR, new_size) }
      }
      other => {
        debug_assert!(false, "pointer {user:p} carries invalid tier tag {other}");
        Ok(ptr)
      }
    }
  }

  /// Returns the usable capacity of a block. This is the slot or stored
  /// size, not the originally requested size, and is always at least what
  /// was requested.
  ///
  /// # Safety
  ///
  /// Same contract as [`free`](Heap::free).
  pub unsafe fn query_size(&self, ptr: NonNull<u8>) -> usize {
    let word = unsafe { *tag_ptr(ptr.as_ptr()) };
    match word & TAG_TIER_MASK {
      TAG_SMALL => tag_stored(word) - SMALL_HDR,
      #[cfg(not(feature = "compact"))]
      TAG_MEDIUM => tag_stored(word) - MEDIUM_HDR,
      TAG_LARGE => tag_stored(word) - LARGE_HDR,
      other => {
        debug_assert!(false, "pointer carries invalid tier tag {other}");
        0
      }
    }
  }

  /// Page granularity of the coalescing tier, for callers sizing their own
  /// budgets around page boundaries.
  pub fn page_granularity(&self) -> usize {
    self.config.medium_page_size
  }

  pub fn config(&self) -> HeapConfig {
    self.config
  }

  pub fn statistics(&self) -> Statistics {
    self.stats
  }

  // ---------------------------------------------------------------------------
  // Small tier
  // ---------------------------------------------------------------------------

  fn alloc_small(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let slot = slot_for(size);
    let stored = SMALL_HDR + (slot + 1) * ALIGN;

    // Slot free list first: O(1), most recently freed block, no chunk touched.
    if let Some(node) = NonNull::new(self.small_slots[slot]) {
      unsafe {
        self.small_slots[slot] = (*node.as_ptr()).next;
        let hdr = node
          .as_ptr()
          .cast::<u8>()
          .sub(SMALL_HDR)
          .cast::<SmallHeader>();
        debug_assert!(tag_is_free((*hdr).word), "free-list block not flagged free");
        (*hdr).word = pack_tag(stored, Tier::Small, false);
      }
      self.stats.small.note_alloc(stored, size.max(1));
      return Ok(node.cast());
    }

    // Bump from the current chunk, growing the chunk list when it is full.
    unsafe {
      let mut page = self.small_pages;
      let exhausted =
        page.is_null() || ((*page).bump as usize + stored) > (page as usize + (*page).size);
      if exhausted {
        let csize = self.config.small_chunk_size;
        let Some(region) = self.source.acquire(csize) else {
          warn!(bytes = csize, tier = "small", "page source exhausted");
          return Err(AllocError::OutOfMemory(csize));
        };
        trace!(bytes = csize, tier = "small", "acquired chunk");
        page = region.as_ptr().cast::<SmallPage>();
        (*page).next = self.small_pages;
        (*page).size = csize;
        (*page).bump = region.as_ptr().add(SMALL_PAGE_HDR);
        (*page)._pad = 0;
        self.small_pages = page;
      }

      let hdr = (*page).bump.cast::<SmallHeader>();
      (*page).bump = (*page).bump.add(stored);
      (*hdr)._pad = 0;
      (*hdr).word = pack_tag(stored, Tier::Small, false);
      self.stats.small.note_alloc(stored, size.max(1));
      Ok(NonNull::new_unchecked(hdr.cast::<u8>().add(SMALL_HDR)))
    }
  }

  unsafe fn free_small(&mut self, user: *mut u8) {
    unsafe {
      let hdr = user.sub(SMALL_HDR).cast::<SmallHeader>();
      let word = (*hdr).word;
      debug_assert!(!tag_is_free(word), "double free of small block {user:p}");
      let stored = tag_stored(word);
      let slot = (stored - SMALL_HDR) / ALIGN - 1;
      (*hdr).word = word | TAG_FREE;

      // The payload is the free-list node for as long as the block stays
      // free; nothing else may observe it.
      let node = user.cast::<FreeNode>();
      (*node).next = self.small_slots[slot];
      self.small_slots[slot] = node;
    }
    self.stats.small.note_free();
  }

  fn small_free_bytes(&self) -> usize {
    let mut total = 0;
    for slot in 0..SMALL_SLOTS {
      let mut node = self.small_slots[slot];
      while !node.is_null() {
        total += (slot + 1) * ALIGN;
        node = unsafe { (*node).next };
      }
    }
    total
  }

  // ---------------------------------------------------------------------------
  // Medium tier
  // ---------------------------------------------------------------------------

  #[cfg(not(feature = "compact"))]
  fn alloc_medium(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let need = MEDIUM_HDR + align_up(size.max(1), ALIGN);

    // First fit over the free ring.
    unsafe {
      let sentinel = &raw mut self.medium.free;
      let mut cursor = (*sentinel).next;
      while cursor != sentinel {
        let block = medium_from_free_link(cursor);
        if tag_stored((*block).word) >= need {
          Link::unlink(cursor);
          medium_set(block, tag_stored((*block).word), false);
          self.carve_medium(block, need);
          self.stats.medium.note_alloc(tag_stored((*block).word), size);
          return Ok(NonNull::new_unchecked(medium_user(block)));
        }
        cursor = (*cursor).next;
      }
    }

    // No free block fits: grow by one page sized to the granularity, or to
    // the next power of two above the request when that is larger.
    let psize = self
      .config
      .medium_page_size
      .max(ceil_pow2(MEDIUM_PAGE_HDR + need));
    let Some(region) = self.source.acquire(psize) else {
      warn!(bytes = psize, tier = "medium", "page source exhausted");
      return Err(AllocError::OutOfMemory(psize));
    };
    trace!(bytes = psize, tier = "medium", "acquired page");

    unsafe {
      let page = region.as_ptr().cast::<MediumPage>();
      (*page).next = self.medium.pages;
      (*page).size = psize;
      Link::init_ring(&raw mut (*page).all);
      self.medium.pages = page;

      let block = region.as_ptr().add(MEDIUM_PAGE_HDR).cast::<MediumHeader>();
      (*block).page = page;
      medium_set(block, psize - MEDIUM_PAGE_HDR, false);
      Link::insert_after(&raw mut (*block).all, &raw mut (*page).all);

      self.carve_medium(block, need);
      self.stats.medium.note_alloc(tag_stored((*block).word), size);
      Ok(NonNull::new_unchecked(medium_user(block)))
    }
  }

  /// Shrinks a used block to `need` stored bytes, releasing any excess that
  /// can hold a minimum block as a new free neighbor.
  #[cfg(not(feature = "compact"))]
  unsafe fn carve_medium(&mut self, block: *mut MediumHeader, need: usize) {
    unsafe {
      let stored = tag_stored((*block).word);
      debug_assert!(stored >= need && !tag_is_free((*block).word));
      let excess = stored - need;
      if excess < MIN_MEDIUM_BLOCK {
        return;
      }
      medium_set(block, need, false);
      let rest = block.cast::<u8>().add(need).cast::<MediumHeader>();
      (*rest).page = (*block).page;
      medium_set(rest, excess, false);
      Link::insert_after(&raw mut (*rest).all, &raw mut (*block).all);
      self.release_medium(rest);
    }
  }

  /// Marks a used block free, coalesces it with free address-neighbors and
  /// puts the result on the free ring. Does not touch statistics.
  #[cfg(not(feature = "compact"))]
  unsafe fn release_medium(&mut self, block: *mut MediumHeader) {
    unsafe {
      let mut block = block;
      let page = (*block).page;
      medium_set(block, tag_stored((*block).word), true);

      // Absorb a free successor.
      if let Some(next) = medium_next(block)
        && tag_is_free((*next).word)
      {
        Link::unlink(medium_free_link(next));
        Link::unlink(&raw mut (*next).all);
        medium_set(
          block,
          tag_stored((*block).word) + tag_stored((*next).word),
          true,
        );
      }

      // A free predecessor absorbs us instead; it already sits on the free
      // ring, so only the all-blocks ring changes.
      if let Some(prev) = medium_prev(block)
        && tag_is_free((*prev).word)
      {
        Link::unlink(&raw mut (*block).all);
        medium_set(
          prev,
          tag_stored((*prev).word) + tag_stored((*block).word),
          true,
        );
        block = prev;
      } else {
        Link::insert_after(medium_free_link(block), &raw mut self.medium.free);
      }

      if self.config.reclaim_empty_pages
        && block as usize == page as usize + MEDIUM_PAGE_HDR
        && tag_stored((*block).word) == (*page).size - MEDIUM_PAGE_HDR
      {
        Link::unlink(medium_free_link(block));
        self.unlink_medium_page(page);
        let psize = (*page).size;
        trace!(bytes = psize, tier = "medium", "released empty page");
        self
          .source
          .release(NonNull::new_unchecked(page.cast::<u8>()), psize);
      }
    }
  }

  #[cfg(not(feature = "compact"))]
  unsafe fn unlink_medium_page(&mut self, page: *mut MediumPage) {
    unsafe {
      if self.medium.pages == page {
        self.medium.pages = (*page).next;
        return;
      }
      let mut cursor = self.medium.pages;
      while !cursor.is_null() {
        if (*cursor).next == page {
          (*cursor).next = (*page).next;
          return;
        }
        cursor = (*cursor).next;
      }
      debug_assert!(false, "page {page:p} not on the page list");
    }
  }

  #[cfg(not(feature = "compact"))]
  unsafe fn free_medium(&mut self, user: *mut u8) {
    unsafe {
      let block = user.sub(MEDIUM_HDR).cast::<MediumHeader>();
      debug_assert!(!tag_is_free((*block).word), "double free of block {user:p}");
      self.stats.medium.note_free();
      self.release_medium(block);
    }
  }

  #[cfg(not(feature = "compact"))]
  #[cfg_attr(feature = "tracking", track_caller)]
  unsafe fn resize_medium(
    &mut self,
    ptr: NonNull<u8>,
    new_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    unsafe {
      let user = ptr.as_ptr();
      let block = user.sub(MEDIUM_HDR).cast::<MediumHeader>();
      let new = new_size.max(1);
      let need = MEDIUM_HDR + align_up(new, ALIGN);
      let stored = tag_stored((*block).word);

      // Shrink (or no-op) in place, giving the excess back to the page.
      if need <= stored {
        self.carve_medium(block, need);
        #[cfg(feature = "tracking")]
        self.track_update(user, (*block).word, new);
        return Ok(ptr);
      }

      // Grow in place when a free successor covers the difference and the
      // result still belongs to this tier.
      if new <= MEDIUM_MAX
        && let Some(next) = medium_next(block)
        && tag_is_free((*next).word)
        && stored + tag_stored((*next).word) >= need
      {
        Link::unlink(medium_free_link(next));
        Link::unlink(&raw mut (*next).all);
        medium_set(block, stored + tag_stored((*next).word), false);
        self.carve_medium(block, need);
        #[cfg(feature = "tracking")]
        self.track_update(user, (*block).word, new);
        return Ok(ptr);
      }

      self.relocate(user, stored - MEDIUM_HDR, new_size)
    }
  }

  #[cfg(not(feature = "compact"))]
  fn medium_free_bytes(&self) -> usize {
    let mut total = 0;
    unsafe {
      let sentinel = (&raw const self.medium.free).cast_mut();
      let mut cursor = (*sentinel).next;
      while cursor != sentinel {
        total += tag_stored((*medium_from_free_link(cursor)).word) - MEDIUM_HDR;
        cursor = (*cursor).next;
      }
    }
    total
  }

  // ---------------------------------------------------------------------------
  // Large tier
  // ---------------------------------------------------------------------------

  fn alloc_large(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let total = size
      .max(1)
      .checked_add(ALIGN - 1)
      .map(|v| v & !(ALIGN - 1))
      .and_then(|v| v.checked_add(LARGE_HDR))
      .ok_or(AllocError::OutOfMemory(size))?;
    let Some(region) = self.source.acquire(total) else {
      warn!(bytes = total, tier = "large", "page source exhausted");
      return Err(AllocError::OutOfMemory(total));
    };
    trace!(bytes = total, tier = "large", "acquired region");

    unsafe {
      let hdr = region.as_ptr().cast::<LargeHeader>();
      (*hdr)._pad = 0;
      (*hdr).word = pack_tag(total, Tier::Large, false);
      Link::insert_after(&raw mut (*hdr).all, &raw mut self.large.all);
      self.stats.large.note_alloc(total, size);
      Ok(NonNull::new_unchecked(region.as_ptr().add(LARGE_HDR)))
    }
  }

  unsafe fn free_large(&mut self, user: *mut u8) {
    unsafe {
      let hdr = user.sub(LARGE_HDR).cast::<LargeHeader>();
      debug_assert!(
        !tag_is_free((*hdr).word),
        "double free of large block {user:p}"
      );
      let total = tag_stored((*hdr).word);
      Link::unlink(&raw mut (*hdr).all);
      self.stats.large.note_free();
      self
        .source
        .release(NonNull::new_unchecked(hdr.cast::<u8>()), total);
    }
  }

  // ---------------------------------------------------------------------------
  // Relocation
  // ---------------------------------------------------------------------------

  #[cfg_attr(feature = "tracking", track_caller)]
  unsafe fn relocate(
    &mut self,
    user: *mut u8,
    old_usable: usize,
    new_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let fresh = self.allocate(new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(user, fresh.as_ptr(), old_usable.min(new_size.max(1)));
      self.free(NonNull::new_unchecked(user));
    }
    Ok(fresh)
  }

  // ---------------------------------------------------------------------------
  // Call-site tracking
  // ---------------------------------------------------------------------------

  #[cfg(feature = "tracking")]
  unsafe fn track_insert(
    &mut self,
    user: *mut u8,
    requested: usize,
    loc: &'static Location<'static>,
  ) {
    unsafe {
      let word = *tag_ptr(user);
      let info = user
        .sub(header_size_for(word & TAG_TIER_MASK))
        .cast::<TrackInfo>();
      (*info).loc = loc;
      (*info).requested = requested.max(1);
      (*info).user = user;
      (*info)._pad = 0;
      Link::insert_after(&raw mut (*info).live, &raw mut self.live.all);
    }
  }

  #[cfg(feature = "tracking")]
  unsafe fn track_remove(&mut self, user: *mut u8, word: usize) {
    unsafe {
      let info = user
        .sub(header_size_for(word & TAG_TIER_MASK))
        .cast::<TrackInfo>();
      Link::unlink(&raw mut (*info).live);
    }
  }

  #[cfg(feature = "tracking")]
  unsafe fn track_update(&mut self, user: *mut u8, word: usize, requested: usize) {
    unsafe {
      let info = user
        .sub(header_size_for(word & TAG_TIER_MASK))
        .cast::<TrackInfo>();
      (*info).requested = requested;
    }
  }

  /// Snapshot of every live allocation with its recorded call site, newest
  /// first.
  #[cfg(feature = "tracking")]
  pub fn live_allocations(&self) -> Vec<LiveAllocation> {
    let mut out = Vec::new();
    unsafe {
      let sentinel = (&raw const self.live.all).cast_mut();
      let mut cursor = (*sentinel).next;
      while cursor != sentinel {
        let info = cursor.cast::<TrackInfo>();
        let word = *tag_ptr((*info).user);
        out.push(LiveAllocation {
          address: (*info).user as usize,
          requested: (*info).requested,
          tier: tier_from_bits(word & TAG_TIER_MASK),
          file: (*info).loc.file(),
          line: (*info).loc.line(),
        });
        cursor = (*cursor).next;
      }
    }
    out
  }

  #[cfg(feature = "tracking")]
  fn report_leaks(&self) {
    let live = self.live_allocations();
    if live.is_empty() {
      return;
    }
    for leak in &live {
      warn!(
        address = leak.address,
        bytes = leak.requested,
        tier = %leak.tier,
        callsite = %format_args!("{}:{}", leak.file, leak.line),
        "leaked allocation"
      );
    }
    warn!(count = live.len(), "allocations never freed at heap teardown");
  }

  // ---------------------------------------------------------------------------
  // Diagnostics
  // ---------------------------------------------------------------------------

  /// Writes one record per live block, then a summary of free bytes per
  /// tier. Intended for budget reviews and leak hunts, not hot paths.
  pub fn dump_usage(&self, out: &mut dyn fmt::Write) -> fmt::Result {
    writeln!(out, "live blocks:")?;
    unsafe {
      let mut page = self.small_pages;
      while !page.is_null() {
        let mut at = page as usize + SMALL_PAGE_HDR;
        let bump = (*page).bump as usize;
        while at < bump {
          let word = (*(at as *const SmallHeader)).word;
          let stored = tag_stored(word);
          if !tag_is_free(word) {
            self.dump_block(out, at + SMALL_HDR, stored - SMALL_HDR, Tier::Small)?;
          }
          at += stored;
        }
        page = (*page).next;
      }

      #[cfg(not(feature = "compact"))]
      {
        let mut page = self.medium.pages;
        while !page.is_null() {
          let sentinel = &raw mut (*page).all;
          let mut cursor = (*sentinel).next;
          while cursor != sentinel {
            let block = medium_from_all_link(cursor);
            let word = (*block).word;
            if !tag_is_free(word) {
              self.dump_block(
                out,
                medium_user(block) as usize,
                tag_stored(word) - MEDIUM_HDR,
                Tier::Medium,
              )?;
            }
            cursor = (*cursor).next;
          }
          page = (*page).next;
        }
      }

      let sentinel = (&raw const self.large.all).cast_mut();
      let mut cursor = (*sentinel).next;
      while cursor != sentinel {
        let hdr = cursor
          .cast::<u8>()
          .sub(offset_of!(LargeHeader, all))
          .cast::<LargeHeader>();
        let word = (*hdr).word;
        self.dump_block(
          out,
          hdr as usize + LARGE_HDR,
          tag_stored(word) - LARGE_HDR,
          Tier::Large,
        )?;
        cursor = (*cursor).next;
      }
    }

    #[cfg(not(feature = "compact"))]
    let medium_free = self.medium_free_bytes();
    #[cfg(feature = "compact")]
    let medium_free = 0usize;
    writeln!(
      out,
      "free bytes: small={} medium={} large=0",
      self.small_free_bytes(),
      medium_free
    )
  }

  fn dump_block(
    &self,
    out: &mut dyn fmt::Write,
    address: usize,
    usable: usize,
    tier: Tier,
  ) -> fmt::Result {
    #[cfg(feature = "tracking")]
    unsafe {
      let info = (address - header_size_for(tier as usize)) as *const TrackInfo;
      writeln!(
        out,
        "  {address:#x} {usable:>8} {tier} {}:{}",
        (*info).loc.file(),
        (*info).loc.line()
      )
    }
    #[cfg(not(feature = "tracking"))]
    writeln!(out, "  {address:#x} {usable:>8} {tier}")
  }

  /// Walks every tier's structures and checks the allocator invariants:
  /// headers tile each page exactly, free flags agree with free-list
  /// membership, no two adjacent free blocks coexist, counters never
  /// underflow. For test harnesses and debug builds.
  pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
    use std::collections::HashSet;

    unsafe {
      // Small tier: collect the free lists first, then walk every chunk's
      // headers against them.
      let mut free_nodes: HashSet<usize> = HashSet::new();
      for slot in 0..SMALL_SLOTS {
        let mut node = self.small_slots[slot];
        while !node.is_null() {
          let block = node as usize;
          let word = (*((block - SMALL_HDR) as *const SmallHeader)).word;
          if !tag_is_free(word) {
            return Err(IntegrityError::SmallFreeFlagMismatch { slot, block });
          }
          if (tag_stored(word) - SMALL_HDR) / ALIGN - 1 != slot {
            return Err(IntegrityError::SmallSlotMismatch { slot, block });
          }
          free_nodes.insert(block);
          node = (*node).next;
        }
      }

      let mut page = self.small_pages;
      while !page.is_null() {
        let base = page as usize;
        let bump = (*page).bump as usize;
        if bump < base + SMALL_PAGE_HDR || bump > base + (*page).size {
          return Err(IntegrityError::SmallChainBroken { page: base });
        }
        let mut at = base + SMALL_PAGE_HDR;
        while at < bump {
          let word = (*(at as *const SmallHeader)).word;
          if word & TAG_TIER_MASK != TAG_SMALL {
            return Err(IntegrityError::BadTierTag {
              block: at,
              tag: word & TAG_TIER_MASK,
            });
          }
          let stored = tag_stored(word);
          if stored < SMALL_HDR + ALIGN || stored % ALIGN != 0 || at + stored > bump {
            return Err(IntegrityError::SmallChainBroken { page: base });
          }
          let user = at + SMALL_HDR;
          if tag_is_free(word) && !free_nodes.contains(&user) {
            return Err(IntegrityError::SmallFreeListMissing { block: user });
          }
          at += stored;
        }
        page = (*page).next;
      }

      #[cfg(not(feature = "compact"))]
      self.verify_medium()?;

      // Large tier: every ring entry must be a live, sane block.
      let sentinel = (&raw const self.large.all).cast_mut();
      let mut cursor = (*sentinel).next;
      while cursor != sentinel {
        let hdr = cursor
          .cast::<u8>()
          .sub(offset_of!(LargeHeader, all))
          .cast::<LargeHeader>();
        let word = (*hdr).word;
        let block = hdr as usize;
        if word & TAG_TIER_MASK != TAG_LARGE {
          return Err(IntegrityError::BadTierTag {
            block,
            tag: word & TAG_TIER_MASK,
          });
        }
        if tag_is_free(word) {
          return Err(IntegrityError::LargeFlaggedFree { block });
        }
        if tag_stored(word) < LARGE_HDR + ALIGN {
          return Err(IntegrityError::LargeSizeInvalid {
            block,
            stored: tag_stored(word),
          });
        }
        cursor = (*cursor).next;
      }
    }

    for (tier, stats) in [
      (Tier::Small, &self.stats.small),
      (Tier::Medium, &self.stats.medium),
      (Tier::Large, &self.stats.large),
    ] {
      if stats.free_count > stats.alloc_count {
        return Err(IntegrityError::StatsUnderflow { tier });
      }
    }

    Ok(())
  }

  #[cfg(not(feature = "compact"))]
  fn verify_medium(&self) -> Result<(), IntegrityError> {
    use std::collections::HashSet;

    unsafe {
      let mut ring_members: HashSet<usize> = HashSet::new();
      let free_sentinel = (&raw const self.medium.free).cast_mut();
      let mut cursor = (*free_sentinel).next;
      while cursor != free_sentinel {
        let block = medium_from_free_link(cursor);
        if !tag_is_free((*block).word) {
          return Err(IntegrityError::FreeRingFlagMismatch {
            block: block as usize,
          });
        }
        ring_members.insert(block as usize);
        cursor = (*cursor).next;
      }

      let mut page = self.medium.pages;
      while !page.is_null() {
        let base = page as usize;
        let end = base + (*page).size;
        let sentinel = (&raw const (*page).all).cast_mut();
        let mut expected = base + MEDIUM_PAGE_HDR;
        let mut prev_free_at: Option<usize> = None;
        let mut cursor = (*sentinel).next;
        while cursor != sentinel {
          let block = medium_from_all_link(cursor);
          let addr = block as usize;
          if addr != expected {
            return Err(IntegrityError::MediumChainBroken { page: base });
          }
          let word = (*block).word;
          if word & TAG_TIER_MASK != TAG_MEDIUM {
            return Err(IntegrityError::BadTierTag {
              block: addr,
              tag: word & TAG_TIER_MASK,
            });
          }
          let stored = tag_stored(word);
          if stored < MIN_MEDIUM_BLOCK || stored % ALIGN != 0 || addr + stored > end {
            return Err(IntegrityError::MediumChainBroken { page: base });
          }
          if tag_is_free(word) {
            if let Some(first) = prev_free_at {
              return Err(IntegrityError::Uncoalesced {
                first,
                second: addr,
              });
            }
            if !ring_members.contains(&addr) {
              return Err(IntegrityError::FreeRingMissing { block: addr });
            }
            prev_free_at = Some(addr);
          } else {
            prev_free_at = None;
          }
          expected = addr + stored;
          cursor = (*cursor).next;
        }
        if expected != end {
          return Err(IntegrityError::MediumChainBroken { page: base });
        }
        page = (*page).next;
      }
    }
    Ok(())
  }
}

impl<S: PageSource> Drop for Heap<S> {
  fn drop(&mut self) {
    #[cfg(feature = "tracking")]
    self.report_leaks();

    unsafe {
      let sentinel = &raw mut self.large.all;
      let mut cursor = (*sentinel).next;
      while cursor != sentinel {
        let next = (*cursor).next;
        let hdr = cursor
          .cast::<u8>()
          .sub(offset_of!(LargeHeader, all))
          .cast::<LargeHeader>();
        let total = tag_stored((*hdr).word);
        self
          .source
          .release(NonNull::new_unchecked(hdr.cast::<u8>()), total);
        cursor = next;
      }

      #[cfg(not(feature = "compact"))]
      {
        let mut page = self.medium.pages;
        while !page.is_null() {
          let next = (*page).next;
          let size = (*page).size;
          self
            .source
            .release(NonNull::new_unchecked(page.cast::<u8>()), size);
          page = next;
        }
      }

      let mut page = self.small_pages;
      while !page.is_null() {
        let next = (*page).next;
        let size = (*page).size;
        self
          .source
          .release(NonNull::new_unchecked(page.cast::<u8>()), size);
        page = next;
      }
    }
    debug!(
      live = self.stats.live_blocks(),
      "heap torn down, all pages returned"
    );
  }
}

// =============================================================================
// Medium-Tier Navigation
// =============================================================================

#[cfg(not(feature = "compact"))]
#[inline(always)]
unsafe fn medium_user(block: *mut MediumHeader) -> *mut u8 {
  unsafe { block.cast::<u8>().add(MEDIUM_HDR) }
}

/// A free block's free-ring link lives in its first payload bytes.
#[cfg(not(feature = "compact"))]
#[inline(always)]
unsafe fn medium_free_link(block: *mut MediumHeader) -> *mut Link {
  unsafe { block.cast::<u8>().add(MEDIUM_HDR).cast::<Link>() }
}

#[cfg(not(feature = "compact"))]
#[inline(always)]
unsafe fn medium_from_free_link(link: *mut Link) -> *mut MediumHeader {
  unsafe { link.cast::<u8>().sub(MEDIUM_HDR).cast::<MediumHeader>() }
}

#[cfg(not(feature = "compact"))]
#[inline(always)]
unsafe fn medium_from_all_link(link: *mut Link) -> *mut MediumHeader {
  unsafe {
    link
      .cast::<u8>()
      .sub(offset_of!(MediumHeader, all))
      .cast::<MediumHeader>()
  }
}

#[cfg(not(feature = "compact"))]
#[inline(always)]
unsafe fn medium_set(block: *mut MediumHeader, stored: usize, free: bool) {
  unsafe { (*block).word = pack_tag(stored, Tier::Medium, free) };
}

/// Address-order successor within the owning page, if any.
#[cfg(not(feature = "compact"))]
unsafe fn medium_next(block: *mut MediumHeader) -> Option<*mut MediumHeader> {
  unsafe {
    let page = (*block).page;
    let next = (*block).all.next;
    if next == &raw mut (*page).all {
      None
    } else {
      Some(medium_from_all_link(next))
    }
  }
}

/// Address-order predecessor within the owning page, if any.
#[cfg(not(feature = "compact"))]
unsafe fn medium_prev(block: *mut MediumHeader) -> Option<*mut MediumHeader> {
  unsafe {
    let page = (*block).page;
    let prev = (*block).all.prev;
    if prev == &raw mut (*page).all {
      None
    } else {
      Some(medium_from_all_link(prev))
    }
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of `align`, which must be a power of
/// two.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Smallest power of two at or above `x`, with `ceil_pow2(0) == 1`.
#[inline(always)]
const fn ceil_pow2(x: usize) -> usize {
  if x <= 1 { 1 } else { x.next_power_of_two() }
}

// =============================================================================
// Size Classes
// =============================================================================

/// Maps a payload size in `[0, SMALL_MAX]` to its slot. All requests in one
/// slot share an identical stored block size, so any freed block of the slot
/// can serve any request mapped to it.
#[inline(always)]
const fn slot_for(size: usize) -> usize {
  let size = if size == 0 { 1 } else { size };
  align_up(size, ALIGN) / ALIGN - 1
}

// =============================================================================
// Unit Tests
// =============================================================================
