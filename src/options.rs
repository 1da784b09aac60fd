use crate::types::{HeapError, ALIGNMENT};

/// Which backing store and accounting discipline the heap runs with.
///
/// The four modes share the public API but diverge in their internal paths;
/// the GC-and-limit driver only ever sees the shared surface.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapMode {
    /// One contiguous region reserved at init, released at teardown.
    Static,
    /// A growable set of fixed-size segments addressed through a multi-base
    /// codec. Segments are acquired in groups on exhaustion and released
    /// eagerly when a group empties.
    Segmented {
        segment_size: usize,
        max_segments: usize,
    },
    /// Pass every request through to the system allocator. No free list;
    /// accounting mirrors what the host `malloc` holds.
    System,
    /// Static backing, but the reclamation trigger tracks the footprint a
    /// dynamic allocator would have. With `slab`, small-object requests are
    /// exempt from the per-block metadata emulation.
    DynamicEmul { slab: bool },
}

/// Heap configuration, consumed once at construction.
///
/// `ALIGNMENT` is fixed at build time; everything else is decided here.
#[derive(Clone, Debug)]
pub struct HeapOptions {
    /// Usable bytes of the contiguous area. Ignored by `Segmented`, whose
    /// capacity is `segment_size * max_segments`.
    pub heap_size: usize,
    /// Compressed pointer width in bits, 16 or 32. The whole capacity must
    /// be reachable: `(1 << width) * ALIGNMENT >= capacity`.
    pub pointer_width: u32,
    /// Step `L` for the soft limit. The limit always sits on a multiple of
    /// this and never drops below it.
    pub limit_step: usize,
    pub mode: HeapMode,
    /// Run a high-severity reclamation before every request. Debug knob.
    pub gc_before_each_alloc: bool,
    /// Defer preemptive reclamation until the full capacity is at stake
    /// instead of reacting to the soft limit.
    pub lazy_gc: bool,
}

impl Default for HeapOptions {
    fn default() -> Self {
        HeapOptions {
            heap_size: 512 * 1024,
            pointer_width: 16,
            limit_step: 16 * 1024,
            mode: HeapMode::Static,
            gc_before_each_alloc: false,
            lazy_gc: false,
        }
    }
}

impl HeapOptions {
    /// Total bytes the configured backing store can ever hold.
    pub fn capacity(&self) -> usize {
        match self.mode {
            HeapMode::Segmented {
                segment_size,
                max_segments,
            } => segment_size * max_segments,
            _ => self.heap_size,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), HeapError> {
        if self.pointer_width != 16 && self.pointer_width != 32 {
            return Err(HeapError::InvalidOptions("pointer_width must be 16 or 32"));
        }
        if self.limit_step == 0 || self.limit_step % ALIGNMENT != 0 {
            return Err(HeapError::InvalidOptions(
                "limit_step must be a nonzero multiple of ALIGNMENT",
            ));
        }
        match self.mode {
            HeapMode::Segmented {
                segment_size,
                max_segments,
            } => {
                if segment_size < 2 * ALIGNMENT || segment_size % ALIGNMENT != 0 {
                    return Err(HeapError::InvalidOptions(
                        "segment_size must be a multiple of ALIGNMENT, at least two granules",
                    ));
                }
                if max_segments == 0 {
                    return Err(HeapError::InvalidOptions("max_segments must be nonzero"));
                }
            }
            _ => {
                if self.heap_size == 0 || self.heap_size % ALIGNMENT != 0 {
                    return Err(HeapError::InvalidOptions(
                        "heap_size must be a nonzero multiple of ALIGNMENT",
                    ));
                }
            }
        }
        let capacity = self.capacity() as u64;
        // Reachability of the last granule in W-bit units, and of every byte
        // in the u32 internal offsets.
        if (1u64 << self.pointer_width) * (ALIGNMENT as u64) < capacity {
            return Err(HeapError::InvalidOptions(
                "pointer_width cannot address the configured capacity",
            ));
        }
        if capacity >= u32::MAX as u64 {
            return Err(HeapError::InvalidOptions("capacity exceeds offset range"));
        }
        Ok(())
    }
}
