#![allow(clippy::missing_safety_doc)]

//! Single-threaded block-based region allocator.
//!
//! An [`Arena`] manages one contiguous memory region carved into blocks. Every
//! committed block sits on an address-ordered doubly linked sequence (used for
//! neighbor coalescing); free blocks additionally sit on an unordered doubly
//! linked free list (used for first-fit search). Allocation prefers bumping the
//! tail frontier and falls back to the free list, guarded by a cached maximum
//! free-block size so exhaustion is answered in O(1).

use core::{
  mem::{align_of, size_of},
  ptr::null_mut,
};

// =============================================================================
// Constants
// =============================================================================

/// Granularity of every carved data size. Block headers are laid immediately
/// after the previous block's data, so data sizes must keep headers aligned.
pub const BLOCK_ALIGN: usize = 16;

/// Smallest data size a free block may keep standing alone. A split that
/// would leave less than this is rejected in favor of over-allocating.
pub const MIN_BUFFER_SIZE: usize = 16;

/// Bytes of the per-block header carved out of the region.
pub const BLOCK_HEADER_SIZE: usize = size_of::<Block>();

/// Bytes of the arena header laid at the start of the region.
pub const ARENA_HEADER_SIZE: usize = size_of::<Arena>();

/// Smallest region that can host an arena: one arena header, one block
/// header and one minimum-size buffer.
pub const MIN_ARENA_SIZE: usize = ARENA_HEADER_SIZE + BLOCK_HEADER_SIZE + MIN_BUFFER_SIZE;

/// Magic number identifying a live block header.
#[cfg(feature = "debug-tripwire")]
const BLOCK_MAGIC: u64 = 0x4841_5245_4E41_2121; // "HARENA!!"

/// Freed data is filled with this byte so stale reads are loud.
#[cfg(feature = "debug-tripwire")]
const POISON_BYTE: u8 = 0xA5;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(BLOCK_ALIGN.is_power_of_two());
const _: () = assert!(MIN_BUFFER_SIZE >= BLOCK_ALIGN);
const _: () = assert!(ARENA_HEADER_SIZE % BLOCK_ALIGN == 0);
const _: () = assert!(BLOCK_HEADER_SIZE % BLOCK_ALIGN == 0);
const _: () = assert!(align_of::<Arena>() <= BLOCK_ALIGN);
const _: () = assert!(align_of::<Block>() <= BLOCK_ALIGN);

// =============================================================================
// Types
// =============================================================================

/// Per-allocation header. Lives in the region immediately before its data, so
/// `data - BLOCK_HEADER_SIZE` recovers it from a pointer handed to a caller.
#[repr(C, align(16))]
struct Block {
  /// Usable data bytes owned by this block (header excluded).
  size: usize,
  /// Address-ordered global sequence. `next` is null only for the block
  /// bordering the frontier; the next header otherwise starts exactly at
  /// `data + size`.
  next: *mut Block,
  prev: *mut Block,
  /// Free-list links, meaningful only while `is_free` is set.
  next_free: *mut Block,
  prev_free: *mut Block,
  is_free: bool,
  #[cfg(feature = "debug-tripwire")]
  magic: u64,
}

/// Arena header. Laid at the start of the managed region; the block storage
/// begins right after it.
#[repr(C, align(16))]
pub struct Arena {
  /// Usable bytes in the region, arena header excluded.
  capacity: usize,
  /// Start of block storage.
  data: *mut u8,
  /// Zero-size block bordering the unused frontier. Null only while a
  /// tail-remainder absorption has consumed the frontier entirely.
  tail: *mut Block,
  /// Head of the unordered free list; null when nothing is free.
  free_blocks: *mut Block,
  /// Bytes available beyond `tail` before the region is exhausted.
  free_size_in_tail: usize,
  /// Largest size on the free list (0 when empty) and how many free blocks
  /// have exactly that size. Maintained only by `record_free`/`record_detach`.
  max_free_block_size: usize,
  max_free_block_size_count: usize,
  is_dynamic: bool,
}

/// Aggregate snapshot of an arena, produced by [`Arena::stats`].
///
/// `occupied_data + free_data + metadata + tail_frontier == capacity` holds
/// after every arena operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
  /// Committed blocks, tail included.
  pub block_count: usize,
  /// Blocks currently on the free list.
  pub free_block_count: usize,
  /// Data bytes owned by in-use blocks.
  pub occupied_data: usize,
  /// Data bytes owned by free-list blocks.
  pub free_data: usize,
  /// Header bytes of all committed blocks.
  pub metadata: usize,
  /// Unused bytes beyond the tail block.
  pub tail_frontier: usize,
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
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
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

// =============================================================================
// Utils
// =============================================================================

#[inline(always)]
unsafe fn block_data(block: *mut Block) -> *mut u8 {
  unsafe { block.cast::<u8>().add(BLOCK_HEADER_SIZE) }
}

#[inline(always)]
unsafe fn block_from_data(ptr: *mut u8) -> *mut Block {
  unsafe { ptr.sub(BLOCK_HEADER_SIZE).cast() }
}

unsafe fn init_block(block: *mut Block, size: usize, is_free: bool, next: *mut Block, prev: *mut Block) {
  let header = unsafe { &mut *block };
  header.size = size;
  header.next = next;
  header.prev = prev;
  header.next_free = null_mut();
  header.prev_free = null_mut();
  header.is_free = is_free;
  #[cfg(feature = "debug-tripwire")]
  {
    header.magic = BLOCK_MAGIC;
  }
}

// =============================================================================
// Construction / lifecycle
// =============================================================================

impl Arena {
  /// Lays an arena over a caller-owned buffer of `size` bytes. Returns null if
  /// the buffer (after internal alignment of its base) cannot hold the arena
  /// header, one block header and `MIN_BUFFER_SIZE` bytes of data.
  ///
  /// The caller keeps ownership of the buffer; it must outlive the arena and
  /// must not be touched through any other path while the arena is live.
  pub unsafe fn new_static(memory: *mut u8, size: usize) -> *mut Arena {
    if memory.is_null() {
      return null_mut();
    }

    let offset = memory.align_offset(BLOCK_ALIGN);
    if offset >= size {
      return null_mut();
    }
    let usable = size - offset;
    if usable < MIN_ARENA_SIZE {
      return null_mut();
    }

    let arena = unsafe { memory.add(offset) }.cast::<Arena>();
    unsafe {
      (*arena).capacity = usable - ARENA_HEADER_SIZE;
      (*arena).data = arena.cast::<u8>().add(ARENA_HEADER_SIZE);
      (*arena).is_dynamic = false;
      (*arena).reinit();
    }
    arena
  }

  /// Obtains `size` bytes from the OS and lays an arena over them. Returns
  /// null on mmap failure or when `size` is below the viable minimum.
  pub fn new_dynamic(size: usize) -> *mut Arena {
    if size < MIN_ARENA_SIZE {
      return null_mut();
    }

    let raw = unsafe { os_mmap(size) };
    if raw.is_null() {
      return null_mut();
    }

    // mmap returns page-aligned memory, so layout over it cannot fail.
    let arena = unsafe { Arena::new_static(raw, size) };
    if arena.is_null() {
      unsafe { os_munmap(raw, size) };
      return null_mut();
    }

    unsafe { (*arena).is_dynamic = true };
    arena
  }

  /// Discards all block structure and returns to the single-tail empty state.
  /// Every pointer previously returned by [`Arena::alloc`] becomes invalid.
  /// Data bytes are not zeroed.
  pub fn reset(&mut self) {
    self.reinit();
  }

  /// Releases the backing region if the arena was dynamically constructed.
  /// Static arenas are untouched; their buffer stays with the caller.
  pub unsafe fn destroy(arena: *mut Arena) {
    if arena.is_null() {
      return;
    }
    let (is_dynamic, total) =
      unsafe { ((*arena).is_dynamic, (*arena).capacity + ARENA_HEADER_SIZE) };
    if is_dynamic {
      unsafe { os_munmap(arena.cast(), total) };
    }
  }

  fn reinit(&mut self) {
    let tail = self.data.cast::<Block>();
    unsafe { init_block(tail, 0, true, null_mut(), null_mut()) };
    self.tail = tail;
    self.free_blocks = null_mut();
    self.free_size_in_tail = self.capacity - BLOCK_HEADER_SIZE;
    self.max_free_block_size = 0;
    self.max_free_block_size_count = 0;
  }
}

// =============================================================================
// Accessors
// =============================================================================

impl Arena {
  /// Usable bytes in the region, arena header excluded.
  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes still available for tail bump allocation.
  #[inline]
  pub fn free_size_in_tail(&self) -> usize {
    self.free_size_in_tail
  }

  /// Largest data size currently on the free list, 0 when the list is empty.
  #[inline]
  pub fn max_free_block_size(&self) -> usize {
    self.max_free_block_size
  }

  /// Number of free blocks whose size is exactly [`Arena::max_free_block_size`].
  #[inline]
  pub fn max_free_block_size_count(&self) -> usize {
    self.max_free_block_size_count
  }

  /// Whether teardown will release the backing region to the OS.
  #[inline]
  pub fn is_dynamic(&self) -> bool {
    self.is_dynamic
  }

  /// Whether `ptr` falls inside this arena's block storage.
  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let base = self.data as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + self.capacity
  }
}

// =============================================================================
// Max-free-block cache
// =============================================================================

// The cache invariant (max equals the true maximum over the free list, count
// equals the number of blocks at exactly that size) lives entirely in these
// two primitives. Callers mutate the free list first, then record the size
// that entered or left it.
impl Arena {
  fn record_free(&mut self, size: usize) {
    if size > self.max_free_block_size {
      self.max_free_block_size = size;
      self.max_free_block_size_count = 1;
    } else if size == self.max_free_block_size {
      self.max_free_block_size_count += 1;
    }
  }

  fn record_detach(&mut self, size: usize) {
    if size != self.max_free_block_size {
      debug_assert!(
        size < self.max_free_block_size,
        "detached a free block of {size} bytes above the cached max {}",
        self.max_free_block_size
      );
      return;
    }
    if self.max_free_block_size_count > 1 {
      self.max_free_block_size_count -= 1;
    } else {
      self.rescan_max();
    }
  }

  /// Recomputes the cache from the list. Only reached when the unique holder
  /// of the current max leaves the free list.
  fn rescan_max(&mut self) {
    let mut max = 0;
    let mut count = 0;
    let mut block = self.free_blocks;
    while !block.is_null() {
      unsafe {
        let size = (*block).size;
        if size > max {
          max = size;
          count = 1;
        } else if size == max {
          count += 1;
        }
        block = (*block).next_free;
      }
    }
    self.max_free_block_size = max;
    self.max_free_block_size_count = count;
  }
}

// =============================================================================
// Free-list linkage
// =============================================================================

impl Arena {
  unsafe fn push_free(&mut self, block: *mut Block) {
    unsafe {
      (*block).prev_free = null_mut();
      (*block).next_free = self.free_blocks;
      if !self.free_blocks.is_null() {
        (*self.free_blocks).prev_free = block;
      }
      self.free_blocks = block;
      self.record_free((*block).size);
    }
  }

  unsafe fn unlink_free(&mut self, block: *mut Block) {
    unsafe {
      let prev = (*block).prev_free;
      let next = (*block).next_free;
      if prev.is_null() {
        self.free_blocks = next;
      } else {
        (*prev).next_free = next;
      }
      if !next.is_null() {
        (*next).prev_free = prev;
      }
      (*block).next_free = null_mut();
      (*block).prev_free = null_mut();
    }
  }
}

// =============================================================================
// Allocation
// =============================================================================

impl Arena {
  /// Returns a pointer to at least `size` usable bytes, or null when `size`
  /// is 0 or neither the tail frontier nor the free list can satisfy the
  /// request. Never partially succeeds.
  pub fn alloc(&mut self, size: usize) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    let Some(padded) = size.checked_add(BLOCK_ALIGN - 1) else {
      return null_mut();
    };
    let size = padded & !(BLOCK_ALIGN - 1);

    if self.free_size_in_tail >= size {
      return self.alloc_in_tail(size);
    }
    if self.max_free_block_size >= size {
      return self.alloc_in_free_block(size);
    }
    null_mut()
  }

  /// Carves `size` bytes off the tail block and lays a fresh zero-size tail
  /// after it. A leftover frontier too small for a block header is absorbed
  /// into the allocation instead of standing as an unusable sliver.
  fn alloc_in_tail(&mut self, size: usize) -> *mut u8 {
    let block = self.tail;
    debug_assert!(!block.is_null(), "nonzero frontier without a tail block");

    let remaining = self.free_size_in_tail - size;
    unsafe {
      (*block).size = size;
      (*block).is_free = false;

      if remaining >= BLOCK_HEADER_SIZE {
        let new_tail = block_data(block).add(size).cast::<Block>();
        init_block(new_tail, 0, true, null_mut(), block);
        (*block).next = new_tail;
        self.tail = new_tail;
        self.free_size_in_tail = remaining - BLOCK_HEADER_SIZE;
      } else {
        (*block).size = size + remaining;
        (*block).next = null_mut();
        self.tail = null_mut();
        self.free_size_in_tail = 0;
      }

      block_data(block)
    }
  }

  /// First-fit walk of the free list. The cached max promises a fit exists;
  /// the walk is still bounded, and running off the list end is reported as a
  /// consistency error instead of trusted away.
  fn alloc_in_free_block(&mut self, size: usize) -> *mut u8 {
    unsafe {
      let mut block = self.free_blocks;
      while !block.is_null() && (*block).size < size {
        block = (*block).next_free;
      }
      if block.is_null() {
        debug_assert!(
          false,
          "free list exhausted below cached max {} (cache/list desync)",
          self.max_free_block_size
        );
        return null_mut();
      }

      let found_size = (*block).size;
      if found_size > size + BLOCK_HEADER_SIZE + MIN_BUFFER_SIZE {
        self.split_free_block(block, size);
      } else {
        // Whole-block use: fragmentation inside the block beats an unusable
        // sub-minimum remainder.
        self.unlink_free(block);
        self.record_detach(found_size);
      }

      (*block).is_free = false;
      (*block).next_free = null_mut();
      (*block).prev_free = null_mut();
      block_data(block)
    }
  }

  /// Shrinks `block` to exactly `size` and carves the remainder as a new free
  /// block, spliced into the global sequence after `block` and into `block`'s
  /// old free-list position.
  unsafe fn split_free_block(&mut self, block: *mut Block, size: usize) {
    unsafe {
      let found_size = (*block).size;
      let leftover = found_size - size - BLOCK_HEADER_SIZE;

      let rem = block_data(block).add(size).cast::<Block>();
      init_block(rem, leftover, true, (*block).next, block);
      debug_assert!(
        !(*block).next.is_null(),
        "a free-list block never borders the frontier"
      );
      (*(*block).next).prev = rem;
      (*block).next = rem;
      (*block).size = size;

      (*rem).next_free = (*block).next_free;
      (*rem).prev_free = (*block).prev_free;
      if (*rem).prev_free.is_null() {
        self.free_blocks = rem;
      } else {
        (*(*rem).prev_free).next_free = rem;
      }
      if !(*rem).next_free.is_null() {
        (*(*rem).next_free).prev_free = rem;
      }

      // Insert is recorded before the detach so a rescan sees a list that
      // already contains the remainder.
      self.record_free(leftover);
      self.record_detach(found_size);
    }
  }
}

// =============================================================================
// Deallocation
// =============================================================================

impl Arena {
  /// Returns a block to the arena. `ptr` must have been returned by
  /// [`Arena::alloc`] on this arena and not freed since; in release builds a
  /// violation silently corrupts arena state (with `debug-tripwire` it
  /// panics). The block is merged with free neighbors, then either returned
  /// to the tail frontier (when it borders it) or put on the free list.
  pub unsafe fn free_block(&mut self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    debug_assert!(self.contains(ptr), "free_block: foreign pointer {ptr:p}");

    let mut block = unsafe { block_from_data(ptr) };
    unsafe {
      #[cfg(feature = "debug-tripwire")]
      {
        assert!(
          (*block).magic == BLOCK_MAGIC,
          "free_block: no block header behind {ptr:p}"
        );
        assert!(!(*block).is_free, "free_block: double free of {ptr:p}");
        core::ptr::write_bytes(ptr, POISON_BYTE, (*block).size);
      }
      debug_assert!(!(*block).is_free, "free_block: double free of {ptr:p}");
      (*block).is_free = true;

      // Forward merge with a free successor (never the tail sentinel).
      let next = (*block).next;
      if !next.is_null() && next != self.tail && (*next).is_free {
        self.unlink_free(next);
        self.record_detach((*next).size);
        (*block).size += BLOCK_HEADER_SIZE + (*next).size;
        (*block).next = (*next).next;
        if !(*block).next.is_null() {
          (*(*block).next).prev = block;
        }
      }

      // Backward merge with a free predecessor; it becomes "the" block.
      let prev = (*block).prev;
      if !prev.is_null() && (*prev).is_free {
        self.unlink_free(prev);
        self.record_detach((*prev).size);
        (*prev).size += BLOCK_HEADER_SIZE + (*block).size;
        (*prev).next = (*block).next;
        if !(*prev).next.is_null() {
          (*(*prev).next).prev = prev;
        }
        block = prev;
      }

      // Capacity bordering the frontier is returned to it, not tracked as a
      // free block.
      let next = (*block).next;
      if next.is_null() {
        // The frontier was fully absorbed earlier; this block restores it.
        self.free_size_in_tail += (*block).size;
        (*block).size = 0;
        self.tail = block;
        return;
      }
      if next == self.tail {
        // Swallow the sentinel; its header returns to the frontier too.
        self.free_size_in_tail += (*block).size + BLOCK_HEADER_SIZE;
        (*block).size = 0;
        (*block).next = null_mut();
        self.tail = block;
        return;
      }

      self.push_free(block);
    }
  }
}

// =============================================================================
// Diagnostics
// =============================================================================

impl Arena {
  /// Walks both lists and returns aggregate totals. Pure observer.
  pub fn stats(&self) -> ArenaStats {
    let mut stats = ArenaStats {
      block_count: 0,
      free_block_count: 0,
      occupied_data: 0,
      free_data: 0,
      metadata: 0,
      tail_frontier: self.free_size_in_tail,
    };

    let mut block = self.data.cast::<Block>();
    while !block.is_null() {
      unsafe {
        stats.block_count += 1;
        stats.metadata += BLOCK_HEADER_SIZE;
        if !(*block).is_free {
          stats.occupied_data += (*block).size;
        }
        block = (*block).next;
      }
    }

    let mut block = self.free_blocks;
    while !block.is_null() {
      unsafe {
        stats.free_block_count += 1;
        stats.free_data += (*block).size;
        block = (*block).next_free;
      }
    }

    stats
  }

  /// Prints every block in address order, the free list, and the aggregate
  /// totals. Debugging aid only; no effect on arena state.
  pub fn dump(&self) {
    println!(
      "arena {:p}: capacity={} dynamic={} frontier={} max_free={} (x{})",
      self,
      self.capacity,
      self.is_dynamic,
      self.free_size_in_tail,
      self.max_free_block_size,
      self.max_free_block_size_count,
    );

    let mut block = self.data.cast::<Block>();
    while !block.is_null() {
      unsafe {
        let role = if block == self.tail {
          "tail"
        } else if (*block).is_free {
          "free"
        } else {
          "used"
        };
        println!(
          "  block {:p}: size={:<8} {} next={:?} prev={:?}",
          block,
          (*block).size,
          role,
          (*block).next,
          (*block).prev,
        );
        block = (*block).next;
      }
    }

    let mut block = self.free_blocks;
    while !block.is_null() {
      unsafe {
        println!("  free  {:p}: size={}", block, (*block).size);
        block = (*block).next_free;
      }
    }

    let stats = self.stats();
    println!(
      "  totals: blocks={} free={} occupied_data={} free_data={} metadata={} frontier={}",
      stats.block_count,
      stats.free_block_count,
      stats.occupied_data,
      stats.free_data,
      stats.metadata,
      stats.tail_frontier,
    );
  }
}

// =============================================================================
// Tests
// =============================================================================
