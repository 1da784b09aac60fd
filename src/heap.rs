use core::ptr;

use log::debug;

use crate::options::{HeapMode, HeapOptions};
use crate::os::Area;
use crate::segment::SegmentSet;
use crate::stats::HeapStats;
use crate::types::{
    align_up, CompressedPointer, FreeRegion, HeapError, ALIGNMENT, ALIGNMENT_LOG, END_OF_LIST,
    SYSTEM_ALLOCATOR_ALIGN_BYTES, SYSTEM_ALLOCATOR_METADATA_SIZE,
};

/* -----------------------------------------------------------
  Free-list engine

  Free regions form a singly-linked list ordered by encoded
  offset, threaded through the regions themselves: the first
  aligned word of a free region holds its size and the offset
  of the next region. A sentinel of size zero lives in the
  context and carries the head link, so insertion and removal
  never special-case an empty list.

  Offsets are the one currency of the list. They are absolute
  byte offsets into the backing store's address space, decoded
  through the single-base codec (contiguous area) or the
  multi-base codec (segment table).
----------------------------------------------------------- */

enum Backing {
    Area(Area),
    Segments(SegmentSet),
    System,
}

/// The allocator context minus the reclamation driver: free list, backing
/// store, accounting and statistics.
///
/// This is the surface the reclamation callback runs against. It can free
/// blocks and observe state, but it cannot allocate; allocation belongs to
/// the driver in [`Heap`](crate::Heap).
pub struct HeapCore {
    backing: Backing,
    /// List sentinel. `size` stays zero; only the next link is real.
    first: FreeRegion,
    /// Offset of a plausible predecessor for the next free insertion, or
    /// `END_OF_LIST` for the sentinel. A hint only; every use re-validates
    /// by walking forward.
    skip: u32,
    blocks_size: usize,
    allocated_blocks_count: usize,
    heap_limit: usize,
    /// Footprint a dynamic allocator would hold for the live blocks. Only
    /// maintained by the system and emulated-dynamic modes.
    allocated_heap_size: usize,
    system_metadata_size: usize,
    stats: HeapStats,
    opts: HeapOptions,
}

impl HeapCore {
    pub(crate) fn new(opts: HeapOptions) -> Result<HeapCore, HeapError> {
        opts.validate()?;
        let backing = match opts.mode {
            HeapMode::Static | HeapMode::DynamicEmul { .. } => {
                Backing::Area(Area::reserve(opts.heap_size).ok_or(HeapError::ReserveFailed)?)
            }
            HeapMode::Segmented {
                segment_size,
                max_segments,
            } => Backing::Segments(SegmentSet::bootstrap(segment_size, max_segments)?),
            HeapMode::System => Backing::System,
        };
        let mut core = HeapCore {
            backing,
            first: FreeRegion {
                size: 0,
                next_offset: END_OF_LIST,
            },
            skip: END_OF_LIST,
            blocks_size: 0,
            allocated_blocks_count: 0,
            heap_limit: opts.limit_step,
            allocated_heap_size: 0,
            system_metadata_size: 0,
            stats: HeapStats::default(),
            opts,
        };
        let initial_span = match &core.backing {
            Backing::Area(area) => Some(area.size() as u32),
            Backing::Segments(set) => Some(set.segment_size()),
            Backing::System => None,
        };
        if let Some(span) = initial_span {
            core.insert_free_span(0, span);
        }
        core.stats.size = core.capacity();
        debug!(
            "heap up: mode {:?}, capacity {} bytes, pointer width {}, limit step {}",
            core.opts.mode,
            core.capacity(),
            core.opts.pointer_width,
            core.opts.limit_step
        );
        Ok(core)
    }

    // ---- codec ----

    #[inline]
    fn decode(&self, offset: u32) -> *mut u8 {
        debug_assert!(offset != END_OF_LIST);
        match &self.backing {
            Backing::Area(area) => unsafe { area.base().add(offset as usize) },
            Backing::Segments(set) => set.decode(offset),
            Backing::System => unreachable!("system mode has no encoded offsets"),
        }
    }

    #[inline]
    fn encode(&self, p: *const u8) -> u32 {
        match &self.backing {
            Backing::Area(area) => (p as usize - area.base() as usize) as u32,
            Backing::Segments(set) => set.encode(p),
            Backing::System => unreachable!("system mode has no encoded offsets"),
        }
    }

    #[inline]
    fn region(&self, offset: u32) -> *mut FreeRegion {
        self.decode(offset) as *mut FreeRegion
    }

    /// Next link of the region at `offset`, with `END_OF_LIST` naming the
    /// sentinel.
    #[inline]
    fn next_of(&self, offset: u32) -> u32 {
        if offset == END_OF_LIST {
            self.first.next_offset
        } else {
            unsafe { (*self.region(offset)).next_offset }
        }
    }

    #[inline]
    fn set_next(&mut self, offset: u32, value: u32) {
        if offset == END_OF_LIST {
            self.first.next_offset = value;
        } else {
            unsafe { (*self.region(offset)).next_offset = value };
        }
    }

    // ---- allocation ----

    /// Carve a block out of the free pool. Null when no region fits; the
    /// caller escalates. Raises the soft limit to stay above the consumed
    /// size either way.
    pub(crate) fn alloc_internal(&mut self, size: usize, is_small: bool) -> *mut u8 {
        let p = if matches!(self.backing, Backing::System) {
            self.alloc_system(size)
        } else {
            let required = align_up(size, ALIGNMENT);
            if required == ALIGNMENT && self.first.next_offset != END_OF_LIST {
                self.alloc_fast(is_small)
            } else {
                self.alloc_slow(required as u32, is_small)
            }
        };
        while self.blocks_size >= self.heap_limit {
            self.heap_limit += self.opts.limit_step;
        }
        if !p.is_null() {
            self.stats.on_alloc(size);
            #[cfg(debug_assertions)]
            self.verify();
        }
        p
    }

    // Single-granule requests dominate the engine workload; the first
    // region is always big enough for one, so no scan is needed.
    fn alloc_fast(&mut self, is_small: bool) -> *mut u8 {
        let block_offset = self.first.next_offset;
        let data = self.region(block_offset);

        self.blocks_size += ALIGNMENT;
        self.allocated_blocks_count += 1;
        self.account_emul_alloc(ALIGNMENT, is_small);
        if let Backing::Segments(set) = &mut self.backing {
            set.add_occupied_span(block_offset, ALIGNMENT as u32);
        }
        self.stats.alloc_iter();

        unsafe {
            if (*data).size == ALIGNMENT as u32 {
                self.first.next_offset = (*data).next_offset;
            } else {
                let remaining_offset = block_offset + ALIGNMENT as u32;
                let remaining = self.region(remaining_offset);
                (*remaining).size = (*data).size - ALIGNMENT as u32;
                (*remaining).next_offset = (*data).next_offset;
                self.first.next_offset = remaining_offset;
            }
        }
        // The consumed region may have been the skip target.
        if self.skip == block_offset {
            self.skip = self.first.next_offset;
        }
        data as *mut u8
    }

    // First fit over the address-ordered list. The block comes from the low
    // end of the region; any remainder stays linked in place of the
    // original.
    fn alloc_slow(&mut self, required: u32, is_small: bool) -> *mut u8 {
        let mut prev_offset = END_OF_LIST;
        let mut current_offset = self.first.next_offset;
        while current_offset != END_OF_LIST {
            self.stats.alloc_iter();
            let current = self.region(current_offset);
            let (current_size, next_offset) = unsafe { ((*current).size, (*current).next_offset) };

            if current_size >= required {
                self.blocks_size += required as usize;
                self.allocated_blocks_count += 1;
                self.account_emul_alloc(required as usize, is_small);
                if let Backing::Segments(set) = &mut self.backing {
                    set.add_occupied_span(current_offset, required);
                }

                if current_size > required {
                    unsafe {
                        let remaining =
                            (current as *mut u8).add(required as usize) as *mut FreeRegion;
                        (*remaining).size = current_size - required;
                        (*remaining).next_offset = next_offset;
                    }
                    self.set_next(prev_offset, current_offset + required);
                } else {
                    // Exact fit: unlink.
                    self.set_next(prev_offset, next_offset);
                }
                self.skip = prev_offset;
                return current as *mut u8;
            }

            prev_offset = current_offset;
            current_offset = next_offset;
        }
        ptr::null_mut()
    }

    // ---- free ----

    /// Return a block to the free pool and lower the soft limit while a
    /// full step of slack exists. The reclamation callback is allowed to
    /// call this.
    ///
    /// # Safety
    /// `ptr` must come from this heap's allocation entry points and `size`
    /// must equal the size passed at allocation. The block must not be
    /// freed twice.
    pub unsafe fn free_block(&mut self, ptr: *mut u8, size: usize) {
        self.free_block_internal(ptr, size, false);
    }

    /// [`free_block`](Self::free_block) for blocks taken with the
    /// small-object hint.
    ///
    /// # Safety
    /// As for `free_block`.
    pub unsafe fn free_block_small(&mut self, ptr: *mut u8, size: usize) {
        self.free_block_internal(ptr, size, true);
    }

    pub(crate) unsafe fn free_block_internal(&mut self, ptr: *mut u8, size: usize, is_small: bool) {
        if matches!(self.backing, Backing::System) {
            return self.free_system(ptr, size);
        }
        debug_assert!(self.is_heap_pointer(ptr));
        debug_assert!(size > 0);
        debug_assert!(self.heap_limit >= self.blocks_size);
        self.stats.free_iter();

        let block_offset = self.encode(ptr);
        let aligned = align_up(size, ALIGNMENT) as u32;

        // Start from the skip cursor when it is a plausible predecessor,
        // otherwise from the sentinel.
        let mut prev_offset = if self.skip != END_OF_LIST && block_offset > self.skip {
            self.stats.skip();
            self.skip
        } else {
            self.stats.nonskip();
            END_OF_LIST
        };
        while self.next_of(prev_offset) < block_offset {
            prev_offset = self.next_of(prev_offset);
            self.stats.free_iter();
        }
        let next_offset = self.next_of(prev_offset);

        // Fold into the predecessor when the two are adjacent. Adjacency
        // must hold in offset space and must not cross a segment-group
        // boundary; separate OS reservations never merge.
        let region_offset;
        let region: *mut FreeRegion;
        let merged_prev = prev_offset != END_OF_LIST && {
            let prev_size = (*self.region(prev_offset)).size;
            prev_offset + prev_size == block_offset && self.mergeable_boundary(block_offset)
        };
        if merged_prev {
            region = self.region(prev_offset);
            debug_assert!((region as *mut u8).add((*region).size as usize) == ptr);
            (*region).size += aligned;
            region_offset = prev_offset;
        } else {
            region = ptr as *mut FreeRegion;
            (*region).size = aligned;
            self.set_next(prev_offset, block_offset);
            region_offset = block_offset;
        }

        // Absorb the successor under the same adjacency rules.
        let region_size = (*region).size;
        if next_offset != END_OF_LIST
            && region_offset + region_size == next_offset
            && self.mergeable_boundary(next_offset)
        {
            let next = self.region(next_offset);
            debug_assert!((region as *mut u8).add(region_size as usize) == next as *mut u8);
            (*region).size += (*next).size;
            (*region).next_offset = (*next).next_offset;
        } else {
            (*region).next_offset = next_offset;
        }

        self.skip = prev_offset;

        if let Backing::Segments(set) = &mut self.backing {
            set.sub_occupied_span(block_offset, aligned);
        }
        self.blocks_size -= aligned as usize;
        self.allocated_blocks_count -= 1;
        self.account_emul_free(aligned as usize, is_small);

        while self.blocks_size + self.opts.limit_step <= self.heap_limit
            && self.heap_limit > self.opts.limit_step
        {
            self.heap_limit -= self.opts.limit_step;
        }

        self.stats.on_free(size);
        #[cfg(debug_assertions)]
        self.verify();
    }

    #[inline]
    fn mergeable_boundary(&self, offset: u32) -> bool {
        match &self.backing {
            Backing::Segments(set) => set.mergeable_boundary(offset),
            _ => true,
        }
    }

    // ---- system-allocator passthrough ----

    fn alloc_system(&mut self, size: usize) -> *mut u8 {
        let p = unsafe { libc::malloc(size) } as *mut u8;
        if p.is_null() {
            return p;
        }
        let held = align_up(
            size + SYSTEM_ALLOCATOR_METADATA_SIZE,
            SYSTEM_ALLOCATOR_ALIGN_BYTES,
        );
        self.blocks_size += size;
        self.allocated_heap_size += held;
        self.system_metadata_size += SYSTEM_ALLOCATOR_METADATA_SIZE;
        self.allocated_blocks_count += 1;
        p
    }

    unsafe fn free_system(&mut self, ptr: *mut u8, size: usize) {
        libc::free(ptr as *mut _);
        let held = align_up(
            size + SYSTEM_ALLOCATOR_METADATA_SIZE,
            SYSTEM_ALLOCATOR_ALIGN_BYTES,
        );
        self.blocks_size -= size;
        self.allocated_heap_size -= held;
        self.system_metadata_size -= SYSTEM_ALLOCATOR_METADATA_SIZE;
        self.allocated_blocks_count -= 1;

        while self.blocks_size + self.opts.limit_step <= self.heap_limit
            && self.heap_limit > self.opts.limit_step
        {
            self.heap_limit -= self.opts.limit_step;
        }
        self.stats.on_free(size);
    }

    // ---- emulated-dynamic accounting ----

    fn account_emul_alloc(&mut self, aligned: usize, is_small: bool) {
        if let HeapMode::DynamicEmul { slab } = self.opts.mode {
            if !(slab && is_small) {
                self.allocated_heap_size += aligned;
                self.system_metadata_size += SYSTEM_ALLOCATOR_METADATA_SIZE;
            }
        }
    }

    fn account_emul_free(&mut self, aligned: usize, is_small: bool) {
        if let HeapMode::DynamicEmul { slab } = self.opts.mode {
            if !(slab && is_small) {
                self.allocated_heap_size -= aligned;
                self.system_metadata_size -= SYSTEM_ALLOCATOR_METADATA_SIZE;
            }
        }
    }

    /// The size the reclamation trigger compares against the limit: what
    /// would be consumed if a block of `aligned` bytes were taken now.
    pub(crate) fn gc_pressure_size(&self, aligned: usize, is_small: bool) -> usize {
        match self.opts.mode {
            HeapMode::Static | HeapMode::Segmented { .. } => self.blocks_size + aligned,
            HeapMode::System => self.allocated_heap_size + aligned,
            HeapMode::DynamicEmul { slab } => {
                if slab && is_small {
                    self.allocated_heap_size
                } else {
                    self.allocated_heap_size + aligned
                }
            }
        }
    }

    // ---- segment growth and release ----

    /// Grow the segmented store so a block of `aligned` bytes fits, and
    /// splice the new span into the free list. False in every other mode.
    pub(crate) fn try_grow(&mut self, aligned: usize) -> bool {
        let grown = match &mut self.backing {
            Backing::Segments(set) => set.allocate_group(aligned as u32),
            _ => None,
        };
        match grown {
            Some((start, span)) => {
                self.insert_free_span(start, span);
                true
            }
            None => false,
        }
    }

    // Link a fresh span as one free region at its offset position. No
    // coalescing: the span is a new reservation, adjacent to nothing.
    fn insert_free_span(&mut self, start: u32, span: u32) {
        let mut prev_offset = END_OF_LIST;
        while self.next_of(prev_offset) < start {
            prev_offset = self.next_of(prev_offset);
        }
        let next_offset = self.next_of(prev_offset);
        unsafe {
            let region = self.region(start);
            (*region).size = span;
            (*region).next_offset = next_offset;
        }
        self.set_next(prev_offset, start);
    }

    /// Release every fully-empty segment group except the initial one,
    /// unlinking each group's span from the free list first. Called from
    /// the driver's free path and from teardown, never mid-allocation.
    pub(crate) fn release_empty_groups(&mut self) {
        let heads = match &self.backing {
            Backing::Segments(set) => set.empty_group_heads(),
            _ => return,
        };
        for head in heads {
            let (start, span) = match &self.backing {
                Backing::Segments(set) => set.group_span(head),
                _ => unreachable!(),
            };
            self.unlink_span(start, span);
            if self.skip != END_OF_LIST && self.skip >= start && self.skip < start + span {
                self.skip = END_OF_LIST;
            }
            if let Backing::Segments(set) = &mut self.backing {
                set.release_group(head);
            }
        }
    }

    // An empty group is covered by exactly one free region: in-group frees
    // coalesce fully and merges never cross group boundaries.
    fn unlink_span(&mut self, start: u32, span: u32) {
        let mut prev_offset = END_OF_LIST;
        loop {
            let next = self.next_of(prev_offset);
            debug_assert!(next != END_OF_LIST, "released span missing from free list");
            if next == start {
                break;
            }
            prev_offset = next;
        }
        let region = self.region(start);
        unsafe {
            debug_assert_eq!((*region).size, span);
            self.set_next(prev_offset, (*region).next_offset);
        }
    }

    // ---- observers ----

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    #[inline]
    pub fn blocks_size(&self) -> usize {
        self.blocks_size
    }

    #[inline]
    pub fn allocated_blocks_count(&self) -> usize {
        self.allocated_blocks_count
    }

    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    /// Emulated dynamic-allocator footprint, maintained by the system and
    /// emulated-dynamic modes.
    #[inline]
    pub fn allocated_heap_size(&self) -> usize {
        self.allocated_heap_size
    }

    /// Emulated per-block allocator metadata, maintained by the system and
    /// emulated-dynamic modes.
    #[inline]
    pub fn system_metadata_size(&self) -> usize {
        self.system_metadata_size
    }

    pub fn options(&self) -> &HeapOptions {
        &self.opts
    }

    pub(crate) fn capacity(&self) -> usize {
        match &self.backing {
            Backing::Area(area) => area.size(),
            Backing::Segments(set) => set.capacity(),
            Backing::System => self.opts.heap_size,
        }
    }

    /// Whether `p` points into the backing store. Meant for debug
    /// assertions; the passthrough mode can only answer "non-null".
    pub fn is_heap_pointer(&self, p: *const u8) -> bool {
        match &self.backing {
            Backing::Area(area) => area.contains(p),
            Backing::Segments(set) => set.contains(p),
            Backing::System => !p.is_null(),
        }
    }

    /// Snapshot of the free list as `(offset, size)` pairs, for diagnostics
    /// and tests.
    pub fn free_regions(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut offset = self.first.next_offset;
        while offset != END_OF_LIST {
            let region = self.region(offset);
            let (size, next) = unsafe { ((*region).size, (*region).next_offset) };
            out.push((offset, size));
            offset = next;
        }
        out
    }

    /// Occupancy of one segment in the segmented mode.
    pub fn segment_occupied(&self, index: usize) -> Option<u32> {
        match &self.backing {
            Backing::Segments(set) => set.occupied(index),
            _ => None,
        }
    }

    pub fn live_segment_count(&self) -> usize {
        match &self.backing {
            Backing::Segments(set) => set.live_count(),
            _ => 0,
        }
    }

    // ---- compressed pointers (engine-facing codec) ----

    fn null_raw(&self) -> u32 {
        ((1u64 << self.opts.pointer_width) - 1) as u32
    }

    /// The null encoding for the configured pointer width.
    pub fn compressed_null(&self) -> CompressedPointer {
        CompressedPointer(self.null_raw())
    }

    /// Pack a heap address into a width-limited offset in alignment units.
    pub fn compress(&self, p: *const u8) -> CompressedPointer {
        debug_assert!(self.is_heap_pointer(p));
        let offset = self.encode(p as *mut u8);
        debug_assert_eq!(offset as usize % ALIGNMENT, 0);
        let units = offset >> ALIGNMENT_LOG;
        debug_assert!(units < self.null_raw());
        CompressedPointer(units)
    }

    /// Recover the address behind a compressed pointer.
    pub fn decompress(&self, cp: CompressedPointer) -> *mut u8 {
        debug_assert!(cp.0 < self.null_raw());
        self.decode(cp.0 << ALIGNMENT_LOG)
    }

    // ---- consistency checking ----

    /// Walk the whole context and assert its invariants: list sorted by
    /// offset, regions aligned and coalesced, accounting consistent with
    /// the free pool, skip cursor pointing at a listed region. Runs after
    /// every mutation in debug builds; tests call it directly.
    pub fn verify(&self) {
        if matches!(self.backing, Backing::System) {
            return;
        }
        let word = ALIGNMENT as u32;
        let mut free_total = 0usize;
        let mut skip_listed = self.skip == END_OF_LIST;
        let mut prev_end: Option<u32> = None;
        let mut prev_offset = END_OF_LIST;
        let mut offset = self.first.next_offset;
        while offset != END_OF_LIST {
            if prev_offset != END_OF_LIST {
                assert!(prev_offset < offset, "free list out of order");
            }
            let region = self.region(offset);
            let (size, next) = unsafe { ((*region).size, (*region).next_offset) };
            assert!(size >= word && size % word == 0, "malformed region size");
            if let Some(end) = prev_end {
                assert!(end <= offset, "overlapping free regions");
                assert!(
                    end != offset || !self.mergeable_boundary(offset),
                    "uncoalesced neighbors"
                );
            }
            if self.skip == offset {
                skip_listed = true;
            }
            free_total += size as usize;
            prev_end = Some(offset + size);
            prev_offset = offset;
            offset = next;
        }
        assert!(skip_listed, "skip cursor points at no listed region");

        match &self.backing {
            Backing::Area(area) => {
                assert_eq!(free_total + self.blocks_size, area.size());
            }
            Backing::Segments(set) => {
                let live = set.live_count() * set.segment_size() as usize;
                assert_eq!(free_total + self.blocks_size, live);
                let mut occupied = 0usize;
                for index in 0..set.capacity() / set.segment_size() as usize {
                    if let Some(bytes) = set.occupied(index) {
                        occupied += bytes as usize;
                    }
                }
                assert_eq!(occupied, self.blocks_size);
            }
            Backing::System => {}
        }
        assert!(self.heap_limit >= self.blocks_size);
    }
}

impl Drop for HeapCore {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(self.blocks_size, 0, "live blocks at heap teardown");
        }
        // Backing memory is returned by the Area / SegmentSet drops.
    }
}

#[cfg(test)]
mod tests {
    use crate::options::{HeapMode, HeapOptions};
    use crate::Heap;

    fn opts64() -> HeapOptions {
        HeapOptions {
            heap_size: 64,
            pointer_width: 16,
            limit_step: 16,
            mode: HeapMode::Static,
            gc_before_each_alloc: false,
            lazy_gc: false,
        }
    }

    #[test]
    fn fresh_heap_is_one_region() {
        let mut heap = Heap::new(opts64()).unwrap();
        assert_eq!(heap.core().free_regions(), vec![(0, 64)]);

        let p = heap.alloc(8);
        assert_eq!(heap.compress(p).raw(), 0);
        assert_eq!(heap.core().free_regions(), vec![(8, 56)]);
        assert_eq!(heap.core().blocks_size(), 8);

        unsafe { heap.free(p, 8) };
        assert_eq!(heap.core().free_regions(), vec![(0, 64)]);
        assert_eq!(heap.core().blocks_size(), 0);
    }

    #[test]
    fn split_then_triple_merge() {
        let mut heap = Heap::new(opts64()).unwrap();
        let a = heap.alloc(16);
        let b = heap.alloc(8);
        let c = heap.alloc(16);
        assert_eq!(heap.compress(a).raw(), 0);
        assert_eq!(heap.compress(b).raw(), 2);
        assert_eq!(heap.compress(c).raw(), 3);
        assert_eq!(heap.core().free_regions(), vec![(40, 24)]);

        unsafe { heap.free(b, 8) };
        assert_eq!(heap.core().free_regions(), vec![(16, 8), (40, 24)]);

        unsafe { heap.free(a, 16) };
        assert_eq!(heap.core().free_regions(), vec![(0, 24), (40, 24)]);

        // Adjacent to both neighbors: one region remains.
        unsafe { heap.free(c, 16) };
        assert_eq!(heap.core().free_regions(), vec![(0, 64)]);
        assert_eq!(heap.core().blocks_size(), 0);
    }

    #[test]
    fn exact_fit_empties_the_list() {
        let mut heap = Heap::new(opts64()).unwrap();
        let p = heap.alloc(64);
        assert!(!p.is_null());
        assert!(heap.core().free_regions().is_empty());
        assert_eq!(heap.core().blocks_size(), 64);
        unsafe { heap.free(p, 64) };
        assert_eq!(heap.core().free_regions(), vec![(0, 64)]);
    }

    #[test]
    fn near_fit_leaves_minimal_region() {
        let mut heap = Heap::new(opts64()).unwrap();
        let p = heap.alloc(56);
        assert_eq!(heap.core().free_regions(), vec![(56, 8)]);
        unsafe { heap.free(p, 56) };
    }

    #[test]
    fn single_word_requests_stay_on_the_fast_path() {
        let mut heap = Heap::new(opts64()).unwrap();
        let mut blocks = Vec::new();
        for i in 0..8u32 {
            let p = heap.alloc(8);
            assert_eq!(heap.compress(p).raw(), i);
            blocks.push(p);
        }
        // One iteration per request: no scan ever ran.
        assert_eq!(heap.stats().alloc_iter_count, heap.stats().alloc_count);
        assert_eq!(heap.stats().alloc_count, 8);
        assert!(heap.core().free_regions().is_empty());
        for p in blocks {
            unsafe { heap.free(p, 8) };
        }
        assert_eq!(heap.core().free_regions(), vec![(0, 64)]);
    }

    #[test]
    fn alloc_free_restores_prior_state() {
        let mut heap = Heap::new(opts64()).unwrap();
        let a = heap.alloc(16);
        let b = heap.alloc(8);
        let before_regions = heap.core().free_regions();
        let before_blocks = heap.core().blocks_size();

        let p = heap.alloc(24);
        unsafe { heap.free(p, 24) };

        assert_eq!(heap.core().free_regions(), before_regions);
        assert_eq!(heap.core().blocks_size(), before_blocks);
        unsafe {
            heap.free(b, 8);
            heap.free(a, 16);
        }
    }

    #[test]
    fn any_free_order_coalesces_fully() {
        let sizes = [8usize, 16, 8, 24, 8];
        let orders: [[usize; 5]; 3] = [[2, 0, 4, 1, 3], [4, 3, 2, 1, 0], [0, 1, 2, 3, 4]];
        for order in orders.iter() {
            let mut heap = Heap::new(opts64()).unwrap();
            let blocks: Vec<(*mut u8, usize)> =
                sizes.iter().map(|&n| (heap.alloc(n), n)).collect();
            for &i in order.iter() {
                let (p, n) = blocks[i];
                unsafe { heap.free(p, n) };
            }
            assert_eq!(heap.core().free_regions(), vec![(0, 64)]);
            assert_eq!(heap.core().blocks_size(), 0);
        }
    }

    #[test]
    fn unaligned_sizes_round_up() {
        let mut heap = Heap::new(opts64()).unwrap();
        let p = heap.alloc(13);
        assert_eq!(heap.core().blocks_size(), 16);
        assert_eq!(heap.stats().waste_bytes, 3);
        assert_eq!(heap.core().free_regions(), vec![(16, 48)]);
        unsafe { heap.free(p, 13) };
        assert_eq!(heap.stats().waste_bytes, 0);
        assert_eq!(heap.core().free_regions(), vec![(0, 64)]);
    }

    #[test]
    fn compressed_pointer_roundtrip() {
        let mut heap = Heap::new(opts64()).unwrap();
        assert_eq!(heap.compressed_null().raw(), 0xffff);
        let blocks: Vec<(*mut u8, usize)> = [16usize, 8, 24]
            .iter()
            .map(|&n| (heap.alloc(n), n))
            .collect();
        for &(p, _) in &blocks {
            let cp = heap.compress(p);
            assert_ne!(cp, heap.compressed_null());
            assert_eq!(heap.decompress(cp), p);
        }
        for (p, n) in blocks {
            unsafe { heap.free(p, n) };
        }
    }
}
