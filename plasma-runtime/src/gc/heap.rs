//! The Plasma heap: a conservative, non-moving, block-structured
//! mark/sweep collector.
//!
//! # Layout
//!
//! The heap owns two OS-mapped chunks of [`GC_CHUNK_SIZE`] bytes. The BOP
//! (block-of-pages) chunk is partitioned into [`GC_BLOCK_SIZE`] blocks, each
//! dedicated to a single cell size of at least [`GC_MIN_CELL_SIZE`] words.
//! A block holds its header (cell size, free-list head, wilderness index),
//! a per-cell bitmap, and the cell payload. The fit chunk is reserved for
//! future large-object allocation and is not yet carved up.
//!
//! # Bitmap
//!
//! Each cell has one bitmap byte:
//!
//! - `VALID | ALLOCATED`: the cell is live.
//! - `VALID` alone: the cell is on the block's free list.
//! - `0`: the cell has never been allocated (wilderness).
//!
//! The mark bit is only meaningful on allocated cells and is cleared by
//! every sweep.
//!
//! # Conservatism
//!
//! Any root word that, after masking the low tag bits, lands inside a live
//! cell keeps that cell alive. Interior pointers are snapped to their cell's
//! start using the block's cell size and the bitmap.

use std::cell::UnsafeCell;
use std::io;
use std::ptr;

use nix::libc;

use super::capability::{can_gc_dyn, GcCapability, Tracer};
use crate::format::WORD_SIZE;

/// Size of each OS-mapped chunk.
pub const GC_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Size of each block within the BOP chunk.
pub const GC_BLOCK_SIZE: usize = 4096;
/// Minimum cell size in words. Requests below this are rounded up.
pub const GC_MIN_CELL_SIZE: usize = 4;

/// Low pointer bits that may carry a tag and are masked off before a root
/// candidate is tested against the heap.
pub const TAG_BITS: usize = WORD_SIZE - 1;

const GC_BITS_ALLOCATED: u8 = 0x01;
const GC_BITS_MARKED: u8 = 0x02;
const GC_BITS_VALID: u8 = 0x04;

const POISON_BYTE: u8 = 0x77;

/// Upper bound on cells per block, across 32- and 64-bit hosts.
const MAX_CELLS_PER_BLOCK: usize = 256;

const NUM_BLOCKS: usize = GC_CHUNK_SIZE / GC_BLOCK_SIZE;

#[repr(C)]
struct BlockHeader {
    /// Cell size in words. Zero marks a block slot that is not in use.
    cell_size: usize,
    /// Index of the next never-allocated cell.
    wilderness: usize,
    /// Head of the free list as a 1-based cell index; zero is empty.
    free_list: usize,
    /// One byte of `GC_BITS_*` state per cell.
    bitmap: [u8; MAX_CELLS_PER_BLOCK],
}

/// Byte offset of the first cell within a block.
const PAYLOAD_OFFSET: usize =
    (std::mem::size_of::<BlockHeader>() + WORD_SIZE - 1) & !(WORD_SIZE - 1);

/// Words of payload available in one block.
const PAYLOAD_WORDS: usize = (GC_BLOCK_SIZE - PAYLOAD_OFFSET) / WORD_SIZE;

fn num_cells(cell_size: usize) -> usize {
    (PAYLOAD_WORDS / cell_size).min(MAX_CELLS_PER_BLOCK)
}

fn remove_tag(p: usize) -> usize {
    p & !TAG_BITS
}

struct Chunk {
    base: *mut u8,
}

impl Chunk {
    fn map() -> io::Result<Chunk> {
        // SAFETY: anonymous private mapping, no file descriptor involved.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                GC_CHUNK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Chunk {
            base: base as *mut u8,
        })
    }

    fn contains(&self, p: usize) -> bool {
        let base = self.base as usize;
        p >= base && p < base + GC_CHUNK_SIZE
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: this mapping was created in Chunk::map and is unmapped
        // exactly once.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, GC_CHUNK_SIZE);
        }
    }
}

/// Development options for the collector, usually read from the
/// environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapOptions {
    /// Force a collection before every allocation while the heap is
    /// non-empty.
    pub zealous: bool,
    /// Overwrite swept cells with a poison pattern.
    pub poison: bool,
}

impl HeapOptions {
    /// Read `PZ_GC_ZEALOUS` and `PZ_GC_POISON` from the environment.
    pub fn from_env() -> Self {
        Self {
            zealous: std::env::var_os("PZ_GC_ZEALOUS").is_some(),
            poison: std::env::var_os("PZ_GC_POISON").is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HeapCounters {
    blocks_used: usize,
    collections: usize,
}

/// The heap. Single-threaded: allocation and collection are gated through
/// the [`GcCapability`] chain, never through shared references across
/// threads.
pub struct Heap {
    bop: Chunk,
    /// Reserved for variable-sized allocation.
    #[allow(dead_code)]
    fit: Chunk,
    options: HeapOptions,
    counters: UnsafeCell<HeapCounters>,
}

impl Heap {
    /// Map both chunks and return an empty heap.
    pub fn new(options: HeapOptions) -> io::Result<Heap> {
        Ok(Heap {
            bop: Chunk::map()?,
            fit: Chunk::map()?,
            options,
            counters: UnsafeCell::new(HeapCounters {
                blocks_used: 0,
                collections: 0,
            }),
        })
    }

    fn counters(&self) -> HeapCounters {
        // SAFETY: single-threaded; the copy is taken before any other
        // heap call can run.
        unsafe { *self.counters.get() }
    }

    fn counters_mut(&self) -> &mut HeapCounters {
        // SAFETY: single-threaded; callers drop this borrow before calling
        // back into tracers or capabilities.
        unsafe { &mut *self.counters.get() }
    }

    /// Allocate `size_in_words` words, collecting and retrying on failure.
    ///
    /// On a second failure the capability's OOM policy runs and null is
    /// returned (capabilities that abort on OOM never return here).
    pub fn alloc(&self, size_in_words: usize, cap: &dyn GcCapability) -> *mut u8 {
        assert!(size_in_words > 0);

        if self.options.zealous && self.counters().blocks_used > 0 && can_gc_dyn(cap) {
            if let Some(tracer) = cap.tracer() {
                self.collect(tracer);
            }
        }

        let mut cell = self.try_allocate(size_in_words);
        if cell.is_null() && can_gc_dyn(cap) {
            if let Some(tracer) = cap.tracer() {
                self.collect(tracer);
                cell = self.try_allocate(size_in_words);
            }
        }
        if cell.is_null() {
            cap.oom(size_in_words * WORD_SIZE);
        }
        cell
    }

    /// Allocate a byte count, rounded up to whole words.
    pub fn alloc_bytes(&self, size_in_bytes: usize, cap: &dyn GcCapability) -> *mut u8 {
        let words = (size_in_bytes + WORD_SIZE - 1) / WORD_SIZE;
        self.alloc(words.max(1), cap)
    }

    /// Number of collections performed so far.
    pub fn collections(&self) -> usize {
        self.counters().collections
    }

    /// Bytes currently allocated.
    pub fn usage(&self) -> usize {
        let blocks_used = self.counters().blocks_used;
        let mut total = 0;
        for i in 0..blocks_used {
            let block = self.block(i);
            // SAFETY: used block headers are initialised.
            unsafe {
                let cell_size = (*block).cell_size;
                if cell_size == 0 {
                    continue;
                }
                for idx in 0..(*block).wilderness {
                    if (*block).bitmap[idx] & GC_BITS_ALLOCATED != 0 {
                        total += cell_size * WORD_SIZE;
                    }
                }
            }
        }
        total
    }

    /// True when nothing has been allocated from the heap yet.
    pub fn is_empty(&self) -> bool {
        self.counters().blocks_used == 0
    }

    /// True when `p` points anywhere inside the BOP chunk.
    pub fn is_heap_address(&self, p: *const u8) -> bool {
        self.bop.contains(p as usize)
    }

    fn block(&self, index: usize) -> *mut BlockHeader {
        debug_assert!(index < NUM_BLOCKS);
        // SAFETY: the chunk is GC_CHUNK_SIZE bytes; index is in range.
        unsafe { self.bop.base.add(index * GC_BLOCK_SIZE) as *mut BlockHeader }
    }

    /// Snap an untagged candidate pointer to the cell containing it.
    ///
    /// Returns the block and cell index only when the cell's bitmap entry
    /// says the cell is live.
    fn find_live_cell(&self, p: usize) -> Option<(*mut BlockHeader, usize)> {
        if !self.bop.contains(p) {
            return None;
        }
        let offset = p - self.bop.base as usize;
        let block_index = offset / GC_BLOCK_SIZE;
        if block_index >= self.counters().blocks_used {
            return None;
        }
        let block = self.block(block_index);
        // SAFETY: used block headers are initialised.
        let cell_size = unsafe { (*block).cell_size };
        if cell_size == 0 {
            return None;
        }
        let block_offset = offset % GC_BLOCK_SIZE;
        if block_offset < PAYLOAD_OFFSET {
            return None;
        }
        let cell_index = (block_offset - PAYLOAD_OFFSET) / (cell_size * WORD_SIZE);
        if cell_index >= num_cells(cell_size) {
            return None;
        }
        let bits = unsafe { (*block).bitmap[cell_index] };
        if bits & (GC_BITS_VALID | GC_BITS_ALLOCATED) == (GC_BITS_VALID | GC_BITS_ALLOCATED) {
            Some((block, cell_index))
        } else {
            None
        }
    }

    /// True when `p` (already untagged) points into a live cell.
    pub fn is_valid_object(&self, p: *const u8) -> bool {
        self.find_live_cell(p as usize).is_some()
    }

    unsafe fn cell_addr(&self, block: *mut BlockHeader, index: usize) -> *mut usize {
        let cell_size = (*block).cell_size;
        (block as *mut u8).add(PAYLOAD_OFFSET + index * cell_size * WORD_SIZE) as *mut usize
    }

    /// Recursively mark the given cell and everything it reaches. Returns
    /// the number of newly marked cells.
    fn mark(&self, block: *mut BlockHeader, cell_index: usize) -> usize {
        let mut num_marked = 1;
        // SAFETY: the cell was just validated against the bitmap.
        unsafe {
            (*block).bitmap[cell_index] |= GC_BITS_MARKED;
            let cell = self.cell_addr(block, cell_index);
            let cell_size = (*block).cell_size;
            for i in 0..cell_size {
                let word = *cell.add(i);
                let candidate = remove_tag(word);
                if let Some((b, idx)) = self.find_live_cell(candidate) {
                    if (*b).bitmap[idx] & GC_BITS_MARKED == 0 {
                        num_marked += self.mark(b, idx);
                    }
                }
            }
        }
        num_marked
    }

    /// Run a full collection: trace roots through `tracer`, then sweep.
    pub fn collect(&self, tracer: &dyn Tracer) {
        let mut mark_state = MarkState {
            heap: self,
            num_marked: 0,
            num_roots_marked: 0,
        };
        tracer.do_trace(&mut mark_state);
        let (num_marked, num_roots) = (mark_state.num_marked, mark_state.num_roots_marked);

        let num_swept = self.sweep();

        let collections = {
            let counters = self.counters_mut();
            counters.collections += 1;
            counters.collections
        };
        tracing::debug!(
            collection = collections,
            roots_marked = num_roots,
            cells_marked = num_marked,
            cells_swept = num_swept,
            "gc collection"
        );
    }

    fn sweep(&self) -> usize {
        let blocks_used = self.counters().blocks_used;
        let poison = self.options.poison;
        let mut num_swept = 0;
        for i in 0..blocks_used {
            let block = self.block(i);
            // SAFETY: used block headers are initialised; cell indices stay
            // below the wilderness.
            unsafe {
                let cell_size = (*block).cell_size;
                if cell_size == 0 {
                    continue;
                }
                (*block).free_list = 0;
                for idx in 0..(*block).wilderness {
                    let bits = (*block).bitmap[idx];
                    if bits & GC_BITS_MARKED != 0 {
                        debug_assert!(bits & GC_BITS_ALLOCATED != 0);
                        (*block).bitmap[idx] &= !GC_BITS_MARKED;
                    } else if bits & GC_BITS_VALID != 0 {
                        if bits & GC_BITS_ALLOCATED != 0 {
                            num_swept += 1;
                        }
                        (*block).bitmap[idx] = GC_BITS_VALID;
                        let cell = self.cell_addr(block, idx);
                        if poison {
                            ptr::write_bytes(cell as *mut u8, POISON_BYTE, cell_size * WORD_SIZE);
                        }
                        *cell = (*block).free_list;
                        (*block).free_list = idx + 1;
                    }
                }
            }
        }
        num_swept
    }

    fn try_allocate(&self, size_in_words: usize) -> *mut u8 {
        let size = size_in_words.max(GC_MIN_CELL_SIZE).next_power_of_two();
        if size > PAYLOAD_WORDS {
            // Too big for any block; the fit chunk does not allocate yet.
            return ptr::null_mut();
        }

        // Best fit: the smallest usable cell size at or above the request.
        let blocks_used = self.counters().blocks_used;
        let mut best: Option<*mut BlockHeader> = None;
        for i in 0..blocks_used {
            let block = self.block(i);
            // SAFETY: used block headers are initialised.
            unsafe {
                let cell_size = (*block).cell_size;
                if cell_size < size {
                    continue;
                }
                if (*block).free_list == 0 && (*block).wilderness >= num_cells(cell_size) {
                    continue;
                }
                match best {
                    Some(b) if (*b).cell_size <= cell_size => {}
                    _ => best = Some(block),
                }
            }
        }

        let block = match best {
            Some(b) => b,
            None => match self.new_block(size) {
                Some(b) => b,
                None => return ptr::null_mut(),
            },
        };

        // SAFETY: the block has a free cell or wilderness space; indices
        // are below num_cells.
        unsafe {
            let index = if (*block).free_list != 0 {
                let index = (*block).free_list - 1;
                (*block).free_list = *self.cell_addr(block, index);
                index
            } else {
                let index = (*block).wilderness;
                (*block).wilderness += 1;
                index
            };
            (*block).bitmap[index] = GC_BITS_VALID | GC_BITS_ALLOCATED;
            let cell = self.cell_addr(block, index);
            ptr::write_bytes(cell as *mut u8, 0, (*block).cell_size * WORD_SIZE);
            cell as *mut u8
        }
    }

    fn new_block(&self, cell_size: usize) -> Option<*mut BlockHeader> {
        let blocks_used = self.counters().blocks_used;
        if blocks_used >= NUM_BLOCKS {
            return None;
        }
        let block = self.block(blocks_used);
        self.counters_mut().blocks_used += 1;
        // Fresh mmap memory is zeroed; only the header fields need values.
        // SAFETY: the block slot is unused and within the chunk.
        unsafe {
            (*block).cell_size = cell_size;
            (*block).wilderness = 0;
            (*block).free_list = 0;
            (*block).bitmap = [0; MAX_CELLS_PER_BLOCK];
        }
        tracing::trace!(cell_size, "gc new block");
        Some(block)
    }

    /// Scan every block for bitmap/free-list consistency. Panics on
    /// corruption; development aid and test hook.
    pub fn check_consistency(&self) {
        let blocks_used = self.counters().blocks_used;
        for i in 0..blocks_used {
            let block = self.block(i);
            // SAFETY: used block headers are initialised.
            unsafe {
                let cell_size = (*block).cell_size;
                if cell_size == 0 {
                    continue;
                }
                let cells = num_cells(cell_size);
                assert!((*block).wilderness <= cells, "wilderness out of range");
                let mut free_cells = 0;
                for idx in 0..cells {
                    let bits = (*block).bitmap[idx];
                    if idx >= (*block).wilderness {
                        assert_eq!(bits, 0, "bitmap set beyond the wilderness");
                    } else {
                        assert!(bits & GC_BITS_VALID != 0, "cell below wilderness not valid");
                        if bits == GC_BITS_VALID {
                            free_cells += 1;
                        }
                    }
                }
                // Every free cell must be reachable from the free list.
                let mut seen = 0;
                let mut link = (*block).free_list;
                while link != 0 {
                    let idx = link - 1;
                    assert!(idx < (*block).wilderness, "free list points past wilderness");
                    assert_eq!(
                        (*block).bitmap[idx],
                        GC_BITS_VALID,
                        "free-list cell has wrong bits"
                    );
                    seen += 1;
                    assert!(seen <= cells, "free list cycle");
                    link = *self.cell_addr(block, idx);
                }
                assert_eq!(seen, free_cells, "free cells not all on the free list");
            }
        }
    }
}

/// Marking state passed to tracers during a collection.
pub struct MarkState<'h> {
    heap: &'h Heap,
    num_marked: usize,
    num_roots_marked: usize,
}

impl MarkState<'_> {
    /// Mark the object `p` points at, if `p` (after tag masking) lands in a
    /// live heap cell, along with everything reachable from it.
    pub fn mark_root(&mut self, p: *const u8) {
        let candidate = remove_tag(p as usize);
        if let Some((block, idx)) = self.heap.find_live_cell(candidate) {
            // SAFETY: find_live_cell validated the block and index.
            let marked = unsafe { (*block).bitmap[idx] & GC_BITS_MARKED != 0 };
            if !marked {
                self.num_marked += self.heap.mark(block, idx);
                self.num_roots_marked += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::capability::GcMode;
    use std::cell::RefCell;

    /// A tracer holding explicit root slots, standing in for a mutator.
    struct TestRoots {
        roots: RefCell<Vec<*mut u8>>,
    }

    impl TestRoots {
        fn new() -> Self {
            Self {
                roots: RefCell::new(Vec::new()),
            }
        }
    }

    impl Tracer for TestRoots {
        fn do_trace(&self, state: &mut MarkState<'_>) {
            for &p in self.roots.borrow().iter() {
                state.mark_root(p);
            }
        }
    }

    fn heap() -> Heap {
        Heap::new(HeapOptions::default()).expect("mmap failed")
    }

    struct AbortCap<'h> {
        heap: &'h Heap,
    }

    impl GcCapability for AbortCap<'_> {
        fn heap(&self) -> &Heap {
            self.heap
        }
        fn mode(&self) -> GcMode {
            GcMode::CannotGc
        }
        fn parent(&self) -> Option<&dyn GcCapability> {
            None
        }
        fn oom(&self, size: usize) {
            panic!("test allocation of {size} bytes failed");
        }
    }

    #[test]
    fn test_alloc_and_usage() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        assert!(h.is_empty());
        let p = h.alloc(4, &cap);
        assert!(!p.is_null());
        assert!(h.is_heap_address(p));
        assert!(h.is_valid_object(p));
        assert_eq!(h.usage(), 4 * WORD_SIZE);
        assert!(!h.is_empty());
        h.check_consistency();
    }

    #[test]
    fn test_small_requests_round_up() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        let p = h.alloc(1, &cap);
        assert_eq!(h.usage(), GC_MIN_CELL_SIZE * WORD_SIZE);
        assert!(h.is_valid_object(p));
    }

    #[test]
    fn test_interior_pointer_snaps_to_cell() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        let p = h.alloc(4, &cap);
        // A pointer into the middle of the cell is still the same object.
        let interior = unsafe { p.add(2 * WORD_SIZE + 1) };
        assert!(h.is_valid_object(interior));
    }

    #[test]
    fn test_tagged_roots_are_untagged() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        let p = h.alloc(4, &cap);
        let tagged = (p as usize | 0x3) as *mut u8;

        let roots = TestRoots::new();
        roots.roots.borrow_mut().push(tagged);
        h.collect(&roots);
        // The tagged root kept the cell alive.
        assert!(h.is_valid_object(p));
        assert_eq!(h.usage(), 4 * WORD_SIZE);
    }

    #[test]
    fn test_collect_reclaims_unreachable() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        let keep = h.alloc(4, &cap);
        let drop_me = h.alloc(4, &cap);
        assert_ne!(keep, drop_me);

        let roots = TestRoots::new();
        roots.roots.borrow_mut().push(keep);
        let before = h.collections();
        h.collect(&roots);
        assert_eq!(h.collections(), before + 1);
        assert!(h.is_valid_object(keep));
        assert!(!h.is_valid_object(drop_me));
        assert_eq!(h.usage(), 4 * WORD_SIZE);
        h.check_consistency();
    }

    #[test]
    fn test_free_cells_are_reused() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        let first = h.alloc(4, &cap);
        let roots = TestRoots::new();
        h.collect(&roots);
        let second = h.alloc(4, &cap);
        assert_eq!(first, second);
    }

    #[test]
    fn test_reachability_is_transitive() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        let inner = h.alloc(4, &cap);
        let outer = h.alloc(4, &cap);
        // outer[0] = inner
        unsafe { *(outer as *mut usize) = inner as usize };

        let roots = TestRoots::new();
        roots.roots.borrow_mut().push(outer);
        h.collect(&roots);
        assert!(h.is_valid_object(outer));
        assert!(h.is_valid_object(inner));
    }

    #[test]
    fn test_usage_does_not_grow_across_collections() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        let mut keep = Vec::new();
        for i in 0..32 {
            let p = h.alloc(4, &cap);
            if i % 2 == 0 {
                keep.push(p);
            }
        }
        let roots = TestRoots::new();
        *roots.roots.borrow_mut() = keep.clone();
        h.collect(&roots);
        let usage = h.usage();
        assert_eq!(usage, keep.len() * 4 * WORD_SIZE);
        // Allocate into the freed cells; usage returns to the same level
        // after another collection.
        for _ in 0..16 {
            h.alloc(4, &cap);
        }
        h.collect(&roots);
        assert_eq!(h.usage(), usage);
        h.check_consistency();
    }

    #[test]
    fn test_distinct_sizes_use_distinct_blocks() {
        let h = heap();
        let cap = AbortCap { heap: &h };
        let small = h.alloc(4, &cap);
        let large = h.alloc(32, &cap);
        let small_block = (small as usize) / GC_BLOCK_SIZE;
        let large_block = (large as usize) / GC_BLOCK_SIZE;
        assert_ne!(small_block, large_block);
        assert_eq!(h.usage(), (4 + 32) * WORD_SIZE);
    }
}
