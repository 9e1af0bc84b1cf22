#![allow(clippy::missing_safety_doc)]

//! Three-tier concurrent memory pool: a thread-local cache in front of a
//! process-wide central cache in front of a page cache that talks to the OS.
//!
//! Small requests (up to [`MAX_BYTES`]) are rounded into one of 208 size
//! classes and served lock-free from the calling thread's cache. Refills and
//! flushes move whole batches through the central cache (one lock per size
//! class), which in turn carves spans of pages out of the page cache (one
//! global lock, split and coalesce by page count). Requests above the ceiling
//! bypass the tiers and map pages straight from the OS.

use core::{
  cell::UnsafeCell,
  ptr::{self, null_mut},
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};
use std::{collections::HashMap, sync::OnceLock};

use parking_lot::Mutex;

// =============================================================================
// Constants
// =============================================================================

/// Page size exponent; one OS page is 2^12 = 4 KiB.
const PAGE_SHIFT: usize = 12;
/// OS allocation granularity.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest request served by the tiered cache. Anything bigger goes straight
/// to the page cache as a dedicated OS mapping.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size-class buckets covering (0, MAX_BYTES].
const NUM_CLASSES: usize = 208;

/// Largest bucketed span. Page-cache buckets cover 1..=128 pages; fresh OS
/// mappings arrive as whole 128-page runs.
const MAX_PAGES: usize = 128;

/// Pages per metadata slab chunk (128 KiB of span records at a time).
const SLAB_CHUNK_PAGES: usize = 32;
/// Upper bound on metadata slab chunks.
const SLAB_MAX_CHUNKS: usize = 64;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_BYTES % PAGE_SIZE == 0);
const _: () = assert!(class_bytes(0) == 8);
const _: () = assert!(class_bytes(NUM_CLASSES - 1) == MAX_BYTES);
const _: () = assert!(class_index(1) == 0);
const _: () = assert!(class_index(MAX_BYTES) == NUM_CLASSES - 1);
// The intrusive link lives in the block itself, so the smallest class must
// hold a pointer.
const _: () = assert!(class_bytes(0) >= size_of::<*mut u8>());
const _: () = assert!(num_move_size(8) == 512);
const _: () = assert!(num_move_size(MAX_BYTES) == 2);
// The largest tiered refill is exactly one fresh OS run.
const _: () = assert!(num_move_page(MAX_BYTES) == MAX_PAGES);
const _: () = assert!(align_of::<Span>() >= align_of::<u32>());

// =============================================================================
// Platform
// =============================================================================

/// Maps `pages` zero-initialized anonymous pages. Mapping failure is fatal:
/// there is no retry or degradation path for address-space exhaustion.
fn os_map_pages(pages: usize) -> *mut u8 {
  let len = pages << PAGE_SHIFT;
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      len,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };
  if ptr == libc::MAP_FAILED {
    panic!(
      "mmap of {pages} pages failed: {}",
      std::io::Error::last_os_error()
    );
  }
  ptr as *mut u8
}

/// Unmaps a range previously returned by `os_map_pages`.
unsafe fn os_unmap_pages(ptr: *mut u8, pages: usize) {
  unsafe { libc::munmap(ptr.cast(), pages << PAGE_SHIFT) };
}

// =============================================================================
// Size Classes
// =============================================================================

// Five alignment bands over (0, 256 KiB]:
//   (0, 128]           8-byte steps    classes [0, 16)
//   (128, 1 KiB]       16-byte steps   classes [16, 72)
//   (1 KiB, 8 KiB]     128-byte steps  classes [72, 128)
//   (8 KiB, 64 KiB]    1 KiB steps     classes [128, 184)
//   (64 KiB, 256 KiB]  8 KiB steps     classes [184, 208)

/// Rounds `x` up to the next multiple of `align`, a power of two.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  (x + align - 1) & !(align - 1)
}

/// Rounds a request up to its size class' block size.
pub const fn round_up(bytes: usize) -> usize {
  assert!(bytes > 0 && bytes <= MAX_BYTES);
  if bytes <= 128 {
    align_up(bytes, 8)
  } else if bytes <= 1024 {
    align_up(bytes, 16)
  } else if bytes <= 8 * 1024 {
    align_up(bytes, 128)
  } else if bytes <= 64 * 1024 {
    align_up(bytes, 1024)
  } else {
    align_up(bytes, 8 * 1024)
  }
}

/// Bucket position within one band, given the band's step as a shift.
#[inline(always)]
const fn band_index(bytes: usize, align_shift: usize) -> usize {
  ((bytes + (1 << align_shift) - 1) >> align_shift) - 1
}

/// Maps a request size to its size-class bucket.
pub const fn class_index(bytes: usize) -> usize {
  assert!(bytes > 0 && bytes <= MAX_BYTES);
  if bytes <= 128 {
    band_index(bytes, 3)
  } else if bytes <= 1024 {
    16 + band_index(bytes - 128, 4)
  } else if bytes <= 8 * 1024 {
    72 + band_index(bytes - 1024, 7)
  } else if bytes <= 64 * 1024 {
    128 + band_index(bytes - 8 * 1024, 10)
  } else {
    184 + band_index(bytes - 64 * 1024, 13)
  }
}

/// Block size served by bucket `index`; inverse of `class_index`.
pub const fn class_bytes(index: usize) -> usize {
  assert!(index < NUM_CLASSES);
  if index < 16 {
    (index + 1) * 8
  } else if index < 72 {
    128 + (index - 16 + 1) * 16
  } else if index < 128 {
    1024 + (index - 72 + 1) * 128
  } else if index < 184 {
    8 * 1024 + (index - 128 + 1) * 1024
  } else {
    64 * 1024 + (index - 184 + 1) * 8 * 1024
  }
}

/// Objects moved per thread-cache refill: small classes move in big batches,
/// big classes in small ones, always at least two.
pub const fn num_move_size(size: usize) -> usize {
  assert!(size > 0);
  let num = MAX_BYTES / size;
  if num < 2 {
    2
  } else if num > 512 {
    512
  } else {
    num
  }
}

/// Pages the central cache requests per refill of `size`-byte objects.
pub const fn num_move_page(size: usize) -> usize {
  let npage = (num_move_size(size) * size) >> PAGE_SHIFT;
  if npage == 0 { 1 } else { npage }
}

// =============================================================================
// Intrusive Free List
// =============================================================================

/// Reads the link stored in a free block's first machine word. Only valid
/// while the block is known free; a live block's first word is user data.
#[inline(always)]
unsafe fn next_block(block: *mut u8) -> *mut u8 {
  unsafe { *(block as *mut *mut u8) }
}

#[inline(always)]
unsafe fn set_next_block(block: *mut u8, next: *mut u8) {
  unsafe { *(block as *mut *mut u8) = next };
}

/// Singly-linked LIFO of uniform-size free blocks, threaded through the
/// blocks themselves. Carries the slow-start cap for its thread-cache bucket.
struct FreeList {
  head: *mut u8,
  len: usize,
  /// Slow-start cap: how many blocks the next refill may fetch and how many
  /// a bucket holds before it flushes. Starts at one and grows per refill.
  max_size: usize,
}

impl FreeList {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
      max_size: 1,
    }
  }

  fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  fn len(&self) -> usize {
    self.len
  }

  unsafe fn push(&mut self, block: *mut u8) {
    debug_assert!(!block.is_null());
    unsafe { set_next_block(block, self.head) };
    self.head = block;
    self.len += 1;
  }

  unsafe fn pop(&mut self) -> *mut u8 {
    assert!(!self.head.is_null(), "pop on an empty free list");
    let block = self.head;
    self.head = unsafe { next_block(block) };
    self.len -= 1;
    block
  }

  /// Splices a pre-linked chain of `n` blocks onto the head in O(1).
  unsafe fn push_range(&mut self, start: *mut u8, end: *mut u8, n: usize) {
    debug_assert!(!start.is_null() && !end.is_null());
    unsafe { set_next_block(end, self.head) };
    self.head = start;
    self.len += n;
  }

  /// Detaches the first `n` blocks as a null-terminated chain.
  unsafe fn pop_range(&mut self, n: usize) -> (*mut u8, *mut u8) {
    debug_assert!(n >= 1 && n <= self.len);
    let start = self.head;
    let mut end = start;
    for _ in 1..n {
      end = unsafe { next_block(end) };
    }
    self.head = unsafe { next_block(end) };
    unsafe { set_next_block(end, null_mut()) };
    self.len -= n;
    (start, end)
  }
}

// =============================================================================
// Span Records and Metadata Slab
// =============================================================================

/// Stable index of a record in a [`Slab`]. Links between spans are handles,
/// not raw pointers, so list surgery can never leave a dangling edge.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Handle(u32);

impl Handle {
  const NIL: Handle = Handle(u32::MAX);

  fn is_nil(self) -> bool {
    self == Self::NIL
  }
}

/// Descriptor for one contiguous run of pages.
struct Span {
  /// First page number; the run covers `[page_id, page_id + pages)`.
  page_id: u64,
  pages: usize,
  /// Objects currently checked out to thread caches. Mutated only under the
  /// lock of the bucket the span is homed in.
  use_count: usize,
  /// Whether the run is in service. Distinct from `use_count`, which reads
  /// zero transiently while a fresh span is being sliced; coalescing keys
  /// off this flag alone.
  is_used: bool,
  /// Block size the span was sliced for; zero until sliced. Oversized direct
  /// mappings record their full byte length here, which is what routes them
  /// around the tiers on free.
  object_size: usize,
  /// Blocks sliced from this span and currently free.
  free_list: *mut u8,
  prev: Handle,
  next: Handle,
}

impl Span {
  const fn empty() -> Self {
    Self {
      page_id: 0,
      pages: 0,
      use_count: 0,
      is_used: false,
      object_size: 0,
      free_list: null_mut(),
      prev: Handle::NIL,
      next: Handle::NIL,
    }
  }

  /// Base address of the run.
  fn base(&self) -> *mut u8 {
    ((self.page_id as usize) << PAGE_SHIFT) as *mut u8
  }

  fn bytes(&self) -> usize {
    self.pages << PAGE_SHIFT
  }
}

/// Arena for the allocator's own metadata. Grows by whole OS-mapped chunks,
/// hands out stable handles, and recycles freed slots through a private
/// free list stored in the slot itself, so it never recurses into the tiered
/// allocator it supports.
///
/// Mutation (`alloc`/`release`) is only legal under the page-cache lock;
/// `get` is plain pointer math over atomically published chunk pointers and
/// may run under any bucket lock.
struct Slab<T> {
  chunks: [AtomicPtr<T>; SLAB_MAX_CHUNKS],
  state: UnsafeCell<SlabState>,
}

struct SlabState {
  chunks_used: usize,
  /// Slots handed out of the newest chunk.
  cursor: usize,
  /// Head of the recycled-slot chain; the link is a `u32` handle written
  /// into the freed slot's first bytes.
  free_head: u32,
}

const NO_SLOT: u32 = u32::MAX;

unsafe impl<T> Send for Slab<T> {}
unsafe impl<T> Sync for Slab<T> {}

impl<T> Slab<T> {
  const SLOTS_PER_CHUNK: usize = (SLAB_CHUNK_PAGES << PAGE_SHIFT) / size_of::<T>();

  fn new() -> Self {
    const { assert!(size_of::<T>() >= size_of::<u32>()) };
    Self {
      chunks: std::array::from_fn(|_| AtomicPtr::new(null_mut())),
      state: UnsafeCell::new(SlabState {
        chunks_used: 0,
        cursor: 0,
        free_head: NO_SLOT,
      }),
    }
  }

  /// Resolves a handle to its record. The record stays at this address for
  /// the slab's whole lifetime.
  fn get(&self, h: Handle) -> *mut T {
    debug_assert!(!h.is_nil());
    let chunk = self.chunks[h.0 as usize / Self::SLOTS_PER_CHUNK].load(Ordering::Acquire);
    debug_assert!(!chunk.is_null());
    unsafe { chunk.add(h.0 as usize % Self::SLOTS_PER_CHUNK) }
  }

  /// Caller must hold the page-cache lock.
  unsafe fn alloc(&self, value: T) -> Handle {
    let state = unsafe { &mut *self.state.get() };
    if state.free_head != NO_SLOT {
      let h = Handle(state.free_head);
      let slot = self.get(h);
      state.free_head = unsafe { *(slot as *mut u32) };
      unsafe { slot.write(value) };
      return h;
    }
    if state.chunks_used == 0 || state.cursor == Self::SLOTS_PER_CHUNK {
      assert!(state.chunks_used < SLAB_MAX_CHUNKS, "metadata slab exhausted");
      let chunk = os_map_pages(SLAB_CHUNK_PAGES) as *mut T;
      self.chunks[state.chunks_used].store(chunk, Ordering::Release);
      state.chunks_used += 1;
      state.cursor = 0;
    }
    let h = Handle(((state.chunks_used - 1) * Self::SLOTS_PER_CHUNK + state.cursor) as u32);
    state.cursor += 1;
    unsafe { self.get(h).write(value) };
    h
  }

  /// Caller must hold the page-cache lock; `h` must not be used afterwards.
  unsafe fn release(&self, h: Handle) {
    let state = unsafe { &mut *self.state.get() };
    let slot = self.get(h);
    unsafe { ptr::drop_in_place(slot) };
    unsafe { *(slot as *mut u32) = state.free_head };
    state.free_head = h.0;
  }
}

impl<T> Drop for Slab<T> {
  fn drop(&mut self) {
    // Live slots are not dropped; the slab only ever holds plain-data span
    // records.
    let state = self.state.get_mut();
    for i in 0..state.chunks_used {
      let chunk = self.chunks[i].load(Ordering::Relaxed);
      unsafe { os_unmap_pages(chunk as *mut u8, SLAB_CHUNK_PAGES) };
    }
  }
}

// =============================================================================
// Span List
// =============================================================================

/// Sentinel-headed circular doubly-linked list of spans, expressed as handle
/// links over the metadata slab. Every method requires the lock of the
/// bucket that owns this list.
struct SpanList {
  head: Handle,
}

impl SpanList {
  /// Allocates the sentinel; runs during construction, before the lists are
  /// shared.
  unsafe fn new(spans: &Slab<Span>) -> Self {
    let head = unsafe { spans.alloc(Span::empty()) };
    unsafe {
      (*spans.get(head)).prev = head;
      (*spans.get(head)).next = head;
    }
    Self { head }
  }

  fn sentinel(&self) -> Handle {
    self.head
  }

  /// First real span, or the sentinel when empty.
  unsafe fn first(&self, spans: &Slab<Span>) -> Handle {
    unsafe { (*spans.get(self.head)).next }
  }

  unsafe fn is_empty(&self, spans: &Slab<Span>) -> bool {
    unsafe { self.first(spans) == self.head }
  }

  unsafe fn push_front(&mut self, spans: &Slab<Span>, h: Handle) {
    debug_assert!(!h.is_nil() && h != self.head);
    unsafe {
      let next = (*spans.get(self.head)).next;
      (*spans.get(h)).prev = self.head;
      (*spans.get(h)).next = next;
      (*spans.get(next)).prev = h;
      (*spans.get(self.head)).next = h;
    }
  }

  unsafe fn erase(&mut self, spans: &Slab<Span>, h: Handle) {
    debug_assert!(!h.is_nil() && h != self.head);
    unsafe {
      let prev = (*spans.get(h)).prev;
      let next = (*spans.get(h)).next;
      (*spans.get(prev)).next = next;
      (*spans.get(next)).prev = prev;
    }
  }

  unsafe fn pop_front(&mut self, spans: &Slab<Span>) -> Handle {
    let front = unsafe { self.first(spans) };
    assert!(front != self.head, "pop_front on an empty span list");
    unsafe { self.erase(spans, front) };
    front
  }
}

// =============================================================================
// Page Cache
// =============================================================================

/// State behind the page cache's single global lock.
struct PageHeap {
  /// Free spans bucketed by page count; index 0 is unused, 128 holds fresh
  /// whole OS runs.
  buckets: [SpanList; MAX_PAGES + 1],
  /// Page number to owning span. Recovers a span from any live pointer and
  /// finds free neighbors for coalescing.
  page_map: HashMap<u64, Handle>,
}

/// Bottom tier: owns every span record, maps pages from the OS, splits free
/// spans to order and merges adjacent free spans back together. One coarse
/// lock; page operations are rare next to object operations thanks to
/// batching.
struct PageCache {
  spans: Slab<Span>,
  heap: Mutex<PageHeap>,
  /// Pages currently mapped from the OS for object storage (metadata chunks
  /// not included).
  mapped_pages: AtomicUsize,
}

impl PageCache {
  fn new() -> Self {
    let spans = Slab::new();
    let buckets = std::array::from_fn(|_| unsafe { SpanList::new(&spans) });
    Self {
      spans,
      heap: Mutex::new(PageHeap {
        buckets,
        page_map: HashMap::new(),
      }),
      mapped_pages: AtomicUsize::new(0),
    }
  }

  fn spans(&self) -> &Slab<Span> {
    &self.spans
  }

  /// Hands out a `k`-page span for the tiered path and records the block
  /// size it will be sliced for. Oversized requests must not come through
  /// here.
  fn new_span(&self, k: usize, object_size: usize) -> Handle {
    assert!(k >= 1 && k <= MAX_PAGES, "tiered span request of {k} pages");
    debug_assert!(object_size <= MAX_BYTES);
    let mut heap = self.heap.lock();
    let h = unsafe { self.new_span_locked(&mut heap, k) };
    unsafe { (*self.spans.get(h)).object_size = object_size };
    h
  }

  unsafe fn new_span_locked(&self, heap: &mut PageHeap, k: usize) -> Handle {
    loop {
      // Exact fit first.
      if unsafe { !heap.buckets[k].is_empty(&self.spans) } {
        let h = unsafe { heap.buckets[k].pop_front(&self.spans) };
        unsafe {
          (*self.spans.get(h)).is_used = true;
          self.index_span(heap, h);
        }
        return h;
      }

      // Split the first larger free span: carve `k` pages off its head and
      // re-bucket the remainder under its new count.
      for n in k + 1..=MAX_PAGES {
        if unsafe { heap.buckets[n].is_empty(&self.spans) } {
          continue;
        }
        let big = unsafe { heap.buckets[n].pop_front(&self.spans) };
        let big_span = self.spans.get(big);
        let carved = unsafe {
          self.spans.alloc(Span {
            page_id: (*big_span).page_id,
            pages: k,
            is_used: true,
            ..Span::empty()
          })
        };
        unsafe {
          (*big_span).page_id += k as u64;
          (*big_span).pages -= k;
          let rest = (*big_span).pages;
          heap.buckets[rest].push_front(&self.spans, big);
          // Boundary pages of the remainder stay findable for future
          // merges.
          heap.page_map.insert((*big_span).page_id, big);
          heap
            .page_map
            .insert((*big_span).page_id + rest as u64 - 1, big);
          self.index_span(heap, carved);
        }
        return carved;
      }

      // Nothing large enough anywhere: fetch a fresh maximal run from the
      // OS and retry, splitting it on the next pass.
      let base = os_map_pages(MAX_PAGES);
      self.mapped_pages.fetch_add(MAX_PAGES, Ordering::Relaxed);
      let fresh = unsafe {
        self.spans.alloc(Span {
          page_id: (base as usize >> PAGE_SHIFT) as u64,
          pages: MAX_PAGES,
          ..Span::empty()
        })
      };
      unsafe { heap.buckets[MAX_PAGES].push_front(&self.spans, fresh) };
    }
  }

  /// Maps every page of the span to its handle.
  unsafe fn index_span(&self, heap: &mut PageHeap, h: Handle) {
    let span = self.spans.get(h);
    unsafe {
      for i in 0..(*span).pages as u64 {
        heap.page_map.insert((*span).page_id + i, h);
      }
    }
  }

  /// Dedicated OS mapping for a request above `MAX_BYTES`. Never bucketed,
  /// split, or merged; only the first page is indexed since the front door
  /// always frees by base address.
  fn new_oversized_span(&self, k: usize) -> Handle {
    debug_assert!(k >= 1);
    let base = os_map_pages(k);
    self.mapped_pages.fetch_add(k, Ordering::Relaxed);
    let mut heap = self.heap.lock();
    let h = unsafe {
      self.spans.alloc(Span {
        page_id: (base as usize >> PAGE_SHIFT) as u64,
        pages: k,
        is_used: true,
        object_size: k << PAGE_SHIFT,
        ..Span::empty()
      })
    };
    heap.page_map.insert((base as usize >> PAGE_SHIFT) as u64, h);
    h
  }

  /// Recovers the owning span of a live pointer. Every page backing a live
  /// allocation is indexed, so a miss means the pointer never came from
  /// this pool.
  fn span_of(&self, ptr: *mut u8) -> Handle {
    let heap = self.heap.lock();
    let id = (ptr as usize >> PAGE_SHIFT) as u64;
    match heap.page_map.get(&id) {
      Some(&h) => h,
      None => panic!("{ptr:p} does not belong to the pool"),
    }
  }

  /// Takes back a span whose objects are all free, merging it with adjacent
  /// free spans, or returns an oversized mapping to the OS.
  fn release_span(&self, h: Handle) {
    let mut heap = self.heap.lock();
    unsafe { self.release_span_locked(&mut heap, h) };
  }

  unsafe fn release_span_locked(&self, heap: &mut PageHeap, h: Handle) {
    let span = self.spans.get(h);

    unsafe {
      if (*span).object_size > MAX_BYTES {
        // Dedicated mapping: hand the pages straight back.
        heap.page_map.remove(&(*span).page_id);
        self.mapped_pages.fetch_sub((*span).pages, Ordering::Relaxed);
        os_unmap_pages((*span).base(), (*span).pages);
        self.spans.release(h);
        return;
      }

      // Absorb the preceding free neighbor while the merge stays
      // bucketable. `is_used`, not `use_count`, is the gate: a span
      // mid-slice reads use_count == 0 but must not be merged away.
      while (*span).page_id > 0 {
        let Some(&prev_h) = heap.page_map.get(&((*span).page_id - 1)) else {
          break;
        };
        let prev = self.spans.get(prev_h);
        if (*prev).is_used || (*prev).pages + (*span).pages > MAX_PAGES {
          break;
        }
        (*span).page_id = (*prev).page_id;
        (*span).pages += (*prev).pages;
        heap.buckets[(*prev).pages].erase(&self.spans, prev_h);
        self.spans.release(prev_h);
      }

      // Then the following neighbor, symmetrically.
      loop {
        let next_id = (*span).page_id + (*span).pages as u64;
        let Some(&next_h) = heap.page_map.get(&next_id) else {
          break;
        };
        let next = self.spans.get(next_h);
        if (*next).is_used || (*next).pages + (*span).pages > MAX_PAGES {
          break;
        }
        (*span).pages += (*next).pages;
        heap.buckets[(*next).pages].erase(&self.spans, next_h);
        self.spans.release(next_h);
      }

      (*span).is_used = false;
      (*span).object_size = 0;
      (*span).free_list = null_mut();
      (*span).use_count = 0;
      heap.buckets[(*span).pages].push_front(&self.spans, h);
      // Re-point the whole merged range at the surviving descriptor so no
      // page keeps an entry to a recycled one.
      self.index_span(heap, h);
    }
  }

  /// Pages sitting free in the page-count buckets.
  fn idle_pages(&self) -> usize {
    let heap = self.heap.lock();
    let mut total = 0;
    for k in 1..=MAX_PAGES {
      unsafe {
        let mut it = heap.buckets[k].first(&self.spans);
        while it != heap.buckets[k].sentinel() {
          total += (*self.spans.get(it)).pages;
          it = (*self.spans.get(it)).next;
        }
      }
    }
    total
  }

  fn mapped_pages(&self) -> usize {
    self.mapped_pages.load(Ordering::Relaxed)
  }
}

// =============================================================================
// Central Cache
// =============================================================================

/// Middle tier: one span list per size class, one lock per list. Mediates
/// batch transfers between thread caches and the page cache.
struct CentralCache {
  buckets: [Mutex<SpanList>; NUM_CLASSES],
}

impl CentralCache {
  fn new(spans: &Slab<Span>) -> Self {
    Self {
      buckets: std::array::from_fn(|_| Mutex::new(unsafe { SpanList::new(spans) })),
    }
  }

  /// Hands a thread cache up to `batch_num` blocks of its class as a linked
  /// chain `(start, end, actual)`; always at least one.
  fn fetch_range_obj(
    &self,
    pages: &PageCache,
    batch_num: usize,
    size: usize,
  ) -> (*mut u8, *mut u8, usize) {
    debug_assert!(batch_num >= 1);
    let index = class_index(size);
    let spans = pages.spans();
    let mut bucket = self.buckets[index].lock();

    let mut span_h = unsafe { Self::span_with_objects(&bucket, spans) };
    if span_h.is_nil() {
      // Refill. The bucket lock is released while talking to the page
      // cache so frees targeting other spans of this class keep draining.
      drop(bucket);
      let fresh = pages.new_span(num_move_page(size), size);
      unsafe { slice_span(spans.get(fresh), size) };
      bucket = self.buckets[index].lock();
      unsafe { bucket.push_front(spans, fresh) };
      span_h = fresh;
    }

    let span = spans.get(span_h);
    unsafe {
      let start = (*span).free_list;
      debug_assert!(!start.is_null());
      let mut end = start;
      let mut actual = 1;
      while actual < batch_num && !next_block(end).is_null() {
        end = next_block(end);
        actual += 1;
      }
      (*span).free_list = next_block(end);
      set_next_block(end, null_mut());
      (*span).use_count += actual;
      (start, end, actual)
    }
  }

  /// First span in the bucket that still has blocks to hand out. Caller
  /// must hold the bucket lock.
  unsafe fn span_with_objects(list: &SpanList, spans: &Slab<Span>) -> Handle {
    let mut it = unsafe { list.first(spans) };
    while it != list.sentinel() {
      let span = spans.get(it);
      if unsafe { !(*span).free_list.is_null() } {
        return it;
      }
      it = unsafe { (*span).next };
    }
    Handle::NIL
  }

  /// Takes back a chain of freed blocks, returning each to the span it was
  /// sliced from. A span whose last block comes home goes back to the page
  /// cache for coalescing.
  fn release_list_to_spans(&self, pages: &PageCache, start: *mut u8, size: usize) {
    debug_assert!(!start.is_null());
    let index = class_index(size);
    let spans = pages.spans();
    let mut bucket = self.buckets[index].lock();

    let mut cur = start;
    while !cur.is_null() {
      let next = unsafe { next_block(cur) };
      // The page-map lookup nests the page lock inside the bucket lock.
      // Every path that takes both uses this order and the refill path
      // above holds neither while blocked, so no cycle exists.
      let span_h = pages.span_of(cur);
      let span = spans.get(span_h);
      unsafe {
        set_next_block(cur, (*span).free_list);
        (*span).free_list = cur;
        debug_assert!((*span).use_count > 0, "double free into central cache");
        (*span).use_count -= 1;
        if (*span).use_count == 0 {
          bucket.erase(spans, span_h);
          (*span).free_list = null_mut();
          (*span).prev = Handle::NIL;
          (*span).next = Handle::NIL;
          // Hand the span down without holding the bucket lock, then pick
          // the lock back up to keep draining the chain.
          drop(bucket);
          pages.release_span(span_h);
          bucket = self.buckets[index].lock();
        }
      }
      cur = next;
    }
  }
}

/// Cuts a freshly fetched span's raw page range into `size`-byte blocks
/// linked head to tail. Runs without any lock: nobody else can reach a span
/// that is not yet in a bucket. A trailing remainder smaller than one block
/// stays unused until the span is recycled.
unsafe fn slice_span(span: *mut Span, size: usize) {
  unsafe {
    let start = (*span).base();
    let end = start.add((*span).bytes());
    debug_assert!(start.add(size) <= end, "span too small for one block");
    (*span).free_list = start;
    let mut tail = start;
    let mut cur = start.add(size);
    while cur.add(size) <= end {
      set_next_block(tail, cur);
      tail = cur;
      cur = cur.add(size);
    }
    set_next_block(tail, null_mut());
  }
}

// =============================================================================
// Thread Cache
// =============================================================================

/// Top tier: one per thread, exclusively owned by it, so the hot path takes
/// no lock at all.
pub struct ThreadCache {
  lists: [FreeList; NUM_CLASSES],
}

impl ThreadCache {
  pub fn new() -> Self {
    Self {
      lists: [const { FreeList::new() }; NUM_CLASSES],
    }
  }

  fn is_empty(&self) -> bool {
    self.lists.iter().all(FreeList::is_empty)
  }

  fn allocate(&mut self, pool: &Pool, size: usize) -> *mut u8 {
    debug_assert!(size > 0 && size <= MAX_BYTES);
    let aligned = round_up(size);
    let index = class_index(size);
    if !self.lists[index].is_empty() {
      unsafe { self.lists[index].pop() }
    } else {
      self.fetch_from_central(pool, index, aligned)
    }
  }

  fn fetch_from_central(&mut self, pool: &Pool, index: usize, size: usize) -> *mut u8 {
    let list = &mut self.lists[index];
    let batch_num = list.max_size.min(num_move_size(size));
    // Slow start: a refill that used the whole cap earns a bigger one, so
    // hot classes amortize the bucket lock while cold classes stay small.
    if list.max_size == batch_num {
      list.max_size += 1;
    }
    let (start, end, actual) = pool.central.fetch_range_obj(&pool.pages, batch_num, size);
    debug_assert!(actual >= 1);
    if actual == 1 {
      debug_assert!(start == end);
      start
    } else {
      unsafe {
        self.lists[index].push_range(next_block(start), end, actual - 1);
      }
      start
    }
  }

  fn deallocate(&mut self, pool: &Pool, ptr: *mut u8, size: usize) {
    debug_assert!(!ptr.is_null() && size > 0 && size <= MAX_BYTES);
    let index = class_index(size);
    unsafe { self.lists[index].push(ptr) };
    if self.lists[index].len() >= self.lists[index].max_size {
      self.flush_class(pool, index, size);
    }
  }

  fn flush_class(&mut self, pool: &Pool, index: usize, size: usize) {
    let n = self.lists[index].len();
    let (start, _end) = unsafe { self.lists[index].pop_range(n) };
    pool.central.release_list_to_spans(&pool.pages, start, size);
  }

  /// Drains every non-empty bucket back to the central cache. The TLS
  /// wrapper calls this at thread teardown; explicitly wired callers invoke
  /// it themselves before dropping the cache.
  pub fn flush(&mut self, pool: &Pool) {
    for index in 0..NUM_CLASSES {
      if !self.lists[index].is_empty() {
        self.flush_class(pool, index, class_bytes(index));
      }
    }
  }
}

impl Default for ThreadCache {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Pool
// =============================================================================

/// The two process-wide tiers bundled as one explicit service object.
/// Construct one with [`Pool::new`] and wire it through by reference, or use
/// the module-level [`allocate`]/[`deallocate`] which run against the lazily
/// built [`Pool::global`] instance.
pub struct Pool {
  central: CentralCache,
  pages: PageCache,
}

impl Pool {
  pub fn new() -> Self {
    let pages = PageCache::new();
    let central = CentralCache::new(pages.spans());
    Self { central, pages }
  }

  /// The process-wide instance, built once on first use.
  pub fn global() -> &'static Pool {
    static POOL: OnceLock<Pool> = OnceLock::new();
    POOL.get_or_init(Pool::new)
  }

  /// Allocates `size > 0` bytes. Requests up to [`MAX_BYTES`] come from
  /// `cache`'s tier; larger ones are rounded to whole pages and mapped
  /// directly, returning the page-aligned base of the mapping. Never
  /// returns null: running out of address space is fatal.
  pub fn allocate(&self, cache: &mut ThreadCache, size: usize) -> *mut u8 {
    assert!(size > 0, "allocate of zero bytes");
    if size > MAX_BYTES {
      let k = align_up(size, PAGE_SIZE) >> PAGE_SHIFT;
      let h = self.pages.new_oversized_span(k);
      unsafe { (*self.pages.spans().get(h)).base() }
    } else {
      cache.allocate(self, size)
    }
  }

  /// Frees a pointer previously returned by [`Pool::allocate`] on this pool
  /// and not yet freed. No validation is performed; anything else is
  /// undefined behavior.
  pub unsafe fn deallocate(&self, cache: &mut ThreadCache, ptr: *mut u8) {
    assert!(!ptr.is_null());
    let h = self.pages.span_of(ptr);
    let size = unsafe { (*self.pages.spans().get(h)).object_size };
    if size > MAX_BYTES {
      self.pages.release_span(h);
    } else {
      cache.deallocate(self, ptr, size);
    }
  }

  /// Pages sitting free in the page cache.
  pub fn idle_pages(&self) -> usize {
    self.pages.idle_pages()
  }

  /// Pages currently mapped from the OS for object storage.
  pub fn mapped_pages(&self) -> usize {
    self.pages.mapped_pages()
  }
}

impl Default for Pool {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// TLS Front Door
// =============================================================================

/// Thread-local cache for the global pool. The wrapper's `Drop` runs at
/// thread teardown and flushes leftovers back to the shared tiers, so a
/// dying thread abandons nothing.
struct TlsCache(ThreadCache);

impl Drop for TlsCache {
  fn drop(&mut self) {
    if self.0.is_empty() {
      return;
    }
    self.0.flush(Pool::global());
  }
}

thread_local! {
  static CACHE: UnsafeCell<TlsCache> = UnsafeCell::new(TlsCache(ThreadCache::new()));
}

/// Allocates `size > 0` bytes from the global pool via this thread's cache.
pub fn allocate(size: usize) -> *mut u8 {
  CACHE.with(|cell| {
    // Exclusively owned by this thread, never re-entered.
    let cache = unsafe { &mut (*cell.get()).0 };
    Pool::global().allocate(cache, size)
  })
}

/// Frees a pointer previously returned by [`allocate`] and not yet freed.
pub unsafe fn deallocate(ptr: *mut u8) {
  CACHE.with(|cell| {
    let cache = unsafe { &mut (*cell.get()).0 };
    unsafe { Pool::global().deallocate(cache, ptr) }
  })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn size_class_bands_cover_every_size() {
    let mut prev_index = 0;
    for s in 1..=MAX_BYTES {
      let align = match s {
        0..=128 => 8,
        129..=1024 => 16,
        1025..=8192 => 128,
        8193..=65536 => 1024,
        _ => 8 * 1024,
      };
      let r = round_up(s);
      assert!(r >= s);
      assert_eq!(r % align, 0);
      assert!(r - s < align, "round_up({s}) = {r} is not minimal");

      let index = class_index(s);
      assert!(index >= prev_index, "class_index not monotonic at {s}");
      prev_index = index;
      assert_eq!(class_index(r), index);
      assert_eq!(class_bytes(index), r);
    }
  }

  #[test]
  fn size_class_fixed_points() {
    assert_eq!(round_up(1), 8);
    assert_eq!(round_up(17), 24);
    assert_eq!(round_up(5000), 5120);
    assert!((72..128).contains(&class_index(5000)));
    assert_eq!(round_up(MAX_BYTES), MAX_BYTES);
  }

  #[test]
  fn batch_policy_clamps() {
    assert_eq!(num_move_size(8), 512);
    assert_eq!(num_move_size(MAX_BYTES), 2);
    assert_eq!(num_move_page(8), 1);
    assert_eq!(num_move_page(MAX_BYTES), MAX_PAGES);
    for index in 0..NUM_CLASSES {
      let size = class_bytes(index);
      let n = num_move_size(size);
      assert!((2..=512).contains(&n));
      let k = num_move_page(size);
      assert!((1..=MAX_PAGES).contains(&k));
      // A refill always yields at least one whole block.
      assert!(k << PAGE_SHIFT >= size);
    }
  }

  #[test]
  fn free_list_splices() {
    let mut storage = [0usize; 8];
    let base = storage.as_mut_ptr() as *mut u8;
    let block = |i: usize| unsafe { base.add(i * size_of::<usize>()) };

    let mut list = FreeList::new();
    unsafe {
      list.push(block(0));
      list.push(block(1));
      list.push(block(2));
      assert_eq!(list.len(), 3);
      assert_eq!(list.pop(), block(2));

      let (start, end) = list.pop_range(2);
      assert_eq!(start, block(1));
      assert_eq!(end, block(0));
      assert!(next_block(end).is_null());
      assert!(list.is_empty());

      list.push_range(start, end, 2);
      assert_eq!(list.len(), 2);
      assert_eq!(list.pop(), block(1));
      assert_eq!(list.pop(), block(0));
    }
  }

  #[test]
  fn slab_recycles_slots_at_stable_addresses() {
    let slab: Slab<Span> = Slab::new();
    unsafe {
      let a = slab.alloc(Span::empty());
      let b = slab.alloc(Span::empty());
      let c = slab.alloc(Span::empty());
      assert!(a != b && b != c);
      let b_ptr = slab.get(b);
      slab.release(b);
      let d = slab.alloc(Span::empty());
      assert_eq!(d, b, "freed slot is reused first");
      assert_eq!(slab.get(d), b_ptr);
      // Growth does not move existing records.
      let a_ptr = slab.get(a);
      for _ in 0..3 * Slab::<Span>::SLOTS_PER_CHUNK {
        slab.alloc(Span::empty());
      }
      assert_eq!(slab.get(a), a_ptr);
    }
  }

  #[test]
  fn alloc_free_pairs_leave_bucket_occupancy_unchanged() {
    let pool = Pool::new();
    let mut cache = ThreadCache::new();
    for _ in 0..256 {
      let p = pool.allocate(&mut cache, 48);
      unsafe { pool.deallocate(&mut cache, p) };
    }
    let index = class_index(48);
    let before = cache.lists[index].len();
    for _ in 0..1000 {
      let p = pool.allocate(&mut cache, 48);
      unsafe { pool.deallocate(&mut cache, p) };
    }
    assert_eq!(cache.lists[index].len(), before);
    assert!(cache.lists[index].len() <= cache.lists[index].max_size);
  }

  #[test]
  fn slow_start_grows_batches_monotonically() {
    let pool = Pool::new();
    let mut cache = ThreadCache::new();
    let size = 64;
    let index = class_index(size);

    let mut ptrs = Vec::new();
    let mut last_max = 0;
    for _ in 0..3000 {
      ptrs.push(pool.allocate(&mut cache, size));
      let m = cache.lists[index].max_size;
      assert!(m >= last_max);
      last_max = m;
    }
    assert!(last_max > 1, "cap never grew");
    // The working batch is min(max_size, num_move_size), so the cap settles
    // one past the clamp and stops.
    assert!(last_max <= num_move_size(size) + 1);

    for p in ptrs {
      unsafe { pool.deallocate(&mut cache, p) };
    }
    cache.flush(&pool);
    assert_eq!(pool.idle_pages(), pool.mapped_pages());
  }

  #[test]
  fn adjacent_spans_coalesce_and_reindex() {
    let pool = Pool::new();
    let a = pool.pages.new_span(2, 64);
    let b = pool.pages.new_span(3, 64);
    let (a_id, b_id) = unsafe {
      (
        (*pool.pages.spans().get(a)).page_id,
        (*pool.pages.spans().get(b)).page_id,
      )
    };
    // Both carved off the head of the same fresh run.
    assert_eq!(b_id, a_id + 2);

    pool.pages.release_span(a);
    pool.pages.release_span(b);

    // b merged backward into a's range and forward into the idle
    // remainder: the whole fresh run is one free span again.
    assert_eq!(pool.idle_pages(), MAX_PAGES);
    let merged = pool.pages.span_of(((a_id as usize) << PAGE_SHIFT) as *mut u8);
    unsafe {
      assert_eq!((*pool.pages.spans().get(merged)).pages, MAX_PAGES);
      assert!(!(*pool.pages.spans().get(merged)).is_used);
    }
    for i in 0..MAX_PAGES as u64 {
      let page_ptr = (((a_id + i) as usize) << PAGE_SHIFT) as *mut u8;
      assert_eq!(pool.pages.span_of(page_ptr), merged);
    }
  }

  #[test]
  fn oversized_requests_map_and_unmap_directly() {
    let pool = Pool::new();
    let mut cache = ThreadCache::new();
    let size = MAX_BYTES + 1;
    let k = size.div_ceil(PAGE_SIZE);

    let p = pool.allocate(&mut cache, size);
    assert_eq!(p as usize % PAGE_SIZE, 0);
    let h = pool.pages.span_of(p);
    unsafe {
      assert_eq!((*pool.pages.spans().get(h)).pages, k);
      assert_eq!((*pool.pages.spans().get(h)).object_size, k * PAGE_SIZE);
    }
    assert_eq!(pool.mapped_pages(), k);
    // Never touches a size-class bucket or the page buckets.
    assert_eq!(pool.idle_pages(), 0);

    unsafe { pool.deallocate(&mut cache, p) };
    assert_eq!(pool.mapped_pages(), 0);
    assert_eq!(pool.idle_pages(), 0);
  }

  #[test]
  fn concurrent_churn_returns_every_page() {
    let pool = Pool::new();
    std::thread::scope(|s| {
      for seed in 1..=4u64 {
        let pool = &pool;
        s.spawn(move || {
          let mut cache = ThreadCache::new();
          let mut rng = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
          let mut live: Vec<(*mut u8, u8)> = Vec::new();
          for _ in 0..10_000 {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            let size = (rng as usize % 4096) + 1;
            if live.len() < 64 || rng & 1 == 0 {
              let p = pool.allocate(&mut cache, size);
              let tag = (rng >> 32) as u8;
              unsafe { ptr::write_bytes(p, tag, size) };
              live.push((p, tag));
            } else {
              let at = (rng >> 16) as usize % live.len();
              let (p, tag) = live.swap_remove(at);
              unsafe {
                assert_eq!(*p, tag, "block corrupted while live");
                pool.deallocate(&mut cache, p);
              }
            }
          }
          for (p, tag) in live {
            unsafe {
              assert_eq!(*p, tag, "block corrupted while live");
              pool.deallocate(&mut cache, p);
            }
          }
          cache.flush(pool);
        });
      }
    });
    // Every thread exited and flushed: nothing is checked out anywhere.
    assert_eq!(pool.idle_pages(), pool.mapped_pages());
  }

  #[test]
  fn cache_refetches_after_full_flush() {
    let pool = Pool::new();
    let mut cache = ThreadCache::new();
    let mut ptrs: Vec<*mut u8> = (0..200).map(|_| pool.allocate(&mut cache, 256)).collect();
    ptrs.sort();
    ptrs.dedup();
    assert_eq!(ptrs.len(), 200, "live blocks must be distinct");
    for p in ptrs {
      unsafe { pool.deallocate(&mut cache, p) };
    }
    cache.flush(&pool);
    assert!(cache.is_empty());
    // The tier below still serves us after a full drain.
    let p = pool.allocate(&mut cache, 256);
    assert!(!p.is_null());
    unsafe { pool.deallocate(&mut cache, p) };
  }
}
