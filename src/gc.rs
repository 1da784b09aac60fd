use core::ptr;
use core::ptr::NonNull;

use log::trace;

use crate::heap::HeapCore;
use crate::options::HeapOptions;
use crate::stats::HeapStats;
use crate::types::{align_up, CompressedPointer, HeapError, Severity, ALIGNMENT};

/// The engine side of the allocation protocol.
///
/// `reclaim` runs synchronously inside `alloc` when the soft limit is
/// crossed or the free pool cannot satisfy a request. It receives the
/// restricted [`HeapCore`] surface, which can free blocks but not allocate,
/// and the current escalation level. It must not retain pointers into the
/// free-list interior across the call.
///
/// `out_of_memory` is the fatal handler: reached from `alloc` when every
/// retry failed. It must not return; the default panics, engines that
/// cannot unwind should abort instead.
pub trait Reclaimer {
    fn reclaim(&mut self, heap: &mut HeapCore, severity: Severity);

    fn out_of_memory(&mut self) -> ! {
        panic!("vmheap: out of memory");
    }
}

/// A reclaimer that frees nothing, for embedders without a collector.
pub struct NoReclaim;

impl Reclaimer for NoReclaim {
    fn reclaim(&mut self, _heap: &mut HeapCore, _severity: Severity) {}
}

impl<F> Reclaimer for F
where
    F: FnMut(&mut HeapCore, Severity),
{
    fn reclaim(&mut self, heap: &mut HeapCore, severity: Severity) {
        self(heap, severity)
    }
}

/// The managed heap: the free-list engine wrapped in the reclamation and
/// soft-limit driver. One instance per engine context, single-threaded.
pub struct Heap<R: Reclaimer = NoReclaim> {
    core: HeapCore,
    reclaimer: R,
}

impl Heap<NoReclaim> {
    pub fn new(options: HeapOptions) -> Result<Self, HeapError> {
        Heap::with_reclaimer(options, NoReclaim)
    }
}

impl<R: Reclaimer> Heap<R> {
    pub fn with_reclaimer(options: HeapOptions, reclaimer: R) -> Result<Self, HeapError> {
        Ok(Heap {
            core: HeapCore::new(options)?,
            reclaimer,
        })
    }

    /// Allocate `size` bytes. Null for a zero request; invokes the fatal
    /// handler when the request cannot be satisfied after reclamation and
    /// growth.
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        self.gc_and_alloc(size, false, false)
    }

    /// Allocate `size` bytes, or `None` when the request cannot be
    /// satisfied.
    pub fn try_alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(self.gc_and_alloc(size, true, false))
    }

    /// [`alloc`](Self::alloc) with the small-object hint: in the
    /// emulated-dynamic mode with a slab, such blocks bypass the per-block
    /// metadata accounting.
    pub fn alloc_small(&mut self, size: usize) -> *mut u8 {
        self.gc_and_alloc(size, false, true)
    }

    /// Return a block. `size` must equal the size passed at allocation.
    ///
    /// # Safety
    /// `ptr` must have come from this heap and must not be freed twice.
    pub unsafe fn free(&mut self, ptr: *mut u8, size: usize) {
        self.core.free_block(ptr, size);
        self.core.release_empty_groups();
    }

    /// [`free`](Self::free) for blocks taken with the small-object hint.
    ///
    /// # Safety
    /// As for `free`.
    pub unsafe fn free_small(&mut self, ptr: *mut u8, size: usize) {
        self.core.free_block_small(ptr, size);
        self.core.release_empty_groups();
    }

    fn gc_and_alloc(&mut self, size: usize, ret_null_on_error: bool, is_small: bool) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }
        if self.core.options().gc_before_each_alloc {
            trace!("reclaim: forced high severity before allocation");
            self.reclaimer.reclaim(&mut self.core, Severity::High);
        }
        let aligned = align_up(size, ALIGNMENT);

        // Preemptive pass when the request would cross the soft limit (or,
        // lazily, the capacity). Whatever the callback does, the allocation
        // itself proceeds; the limit bump afterwards absorbs a crossing.
        let threshold = if self.core.options().lazy_gc {
            self.core.capacity()
        } else {
            self.core.heap_limit()
        };
        if self.core.gc_pressure_size(aligned, is_small) > threshold {
            trace!("reclaim: expected over-limit, low severity");
            self.reclaimer.reclaim(&mut self.core, Severity::Low);
        }

        let mut p = self.core.alloc_internal(size, is_small);
        if !p.is_null() {
            return p;
        }

        // Growing the segment set is cheaper than a deeper collection, so
        // try it before escalating.
        if self.core.try_grow(aligned) {
            return self.core.alloc_internal(size, is_small);
        }

        for &severity in &[Severity::Low, Severity::Medium, Severity::High] {
            trace!("reclaim: allocation failed, severity {:?}", severity);
            self.reclaimer.reclaim(&mut self.core, severity);
            p = self.core.alloc_internal(size, is_small);
            if !p.is_null() {
                return p;
            }
        }

        if self.core.try_grow(aligned) {
            return self.core.alloc_internal(size, is_small);
        }

        if ret_null_on_error {
            ptr::null_mut()
        } else {
            self.reclaimer.out_of_memory()
        }
    }

    // ---- pass-through observers ----

    pub fn stats(&self) -> &HeapStats {
        self.core.stats()
    }

    pub fn is_heap_pointer(&self, p: *const u8) -> bool {
        self.core.is_heap_pointer(p)
    }

    pub fn compress(&self, p: *const u8) -> CompressedPointer {
        self.core.compress(p)
    }

    pub fn decompress(&self, cp: CompressedPointer) -> *mut u8 {
        self.core.decompress(cp)
    }

    pub fn compressed_null(&self) -> CompressedPointer {
        self.core.compressed_null()
    }

    /// The underlying context, for state observers.
    pub fn core(&self) -> &HeapCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::HeapMode;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn tiny(heap_size: usize, limit_step: usize) -> HeapOptions {
        HeapOptions {
            heap_size,
            pointer_width: 16,
            limit_step,
            mode: HeapMode::Static,
            gc_before_each_alloc: false,
            lazy_gc: false,
        }
    }

    #[test]
    fn zero_request_is_null() {
        let mut heap = Heap::new(tiny(64, 16)).unwrap();
        assert!(heap.alloc(0).is_null());
        assert!(heap.try_alloc(0).is_none());
        assert_eq!(heap.stats().alloc_count, 0);
    }

    #[test]
    fn limit_rises_and_falls_in_steps() {
        let mut heap = Heap::new(tiny(64, 16)).unwrap();
        let a = heap.alloc(8);
        assert_eq!(heap.core().blocks_size(), 8);
        assert_eq!(heap.core().heap_limit(), 16);
        let b = heap.alloc(16);
        assert_eq!(heap.core().blocks_size(), 24);
        assert_eq!(heap.core().heap_limit(), 32);
        unsafe { heap.free(b, 16) };
        assert_eq!(heap.core().blocks_size(), 8);
        assert_eq!(heap.core().heap_limit(), 16);
        unsafe { heap.free(a, 8) };
        assert_eq!(heap.core().blocks_size(), 0);
        // The limit never drops below one step.
        assert_eq!(heap.core().heap_limit(), 16);
    }

    #[test]
    fn no_reclaim_while_under_limit() {
        let calls = Rc::new(RefCell::new(0usize));
        let seen = calls.clone();
        let mut heap = Heap::with_reclaimer(
            tiny(64, 64),
            move |_: &mut HeapCore, _: Severity| {
                *seen.borrow_mut() += 1;
            },
        )
        .unwrap();
        let mut blocks = Vec::new();
        for &size in &[16usize, 16, 16, 8] {
            blocks.push((heap.alloc(size), size));
        }
        assert_eq!(*calls.borrow(), 0);
        for (p, size) in blocks {
            unsafe { heap.free(p, size) };
        }
    }

    #[test]
    fn preemptive_reclaim_recovers_space() {
        let freed: Rc<RefCell<Vec<(usize, usize)>>> = Rc::new(RefCell::new(Vec::new()));
        let severities: Rc<RefCell<Vec<Severity>>> = Rc::new(RefCell::new(Vec::new()));
        let pool = freed.clone();
        let log = severities.clone();
        let mut heap = Heap::with_reclaimer(
            tiny(32, 16),
            move |core: &mut HeapCore, severity: Severity| {
                log.borrow_mut().push(severity);
                for (p, size) in pool.borrow_mut().drain(..) {
                    unsafe { core.free_block(p as *mut u8, size) };
                }
            },
        )
        .unwrap();

        let a = heap.alloc(8);
        let b = heap.alloc(8);
        freed.borrow_mut().push((a as usize, 8));
        freed.borrow_mut().push((b as usize, 8));

        // Crosses the limit; the preemptive low pass empties the heap and
        // the request fits without escalation.
        let big = heap.alloc(24);
        assert!(!big.is_null());
        assert_eq!(severities.borrow().as_slice(), &[Severity::Low]);
        assert_eq!(heap.core().blocks_size(), 24);
        unsafe { heap.free(big, 24) };
    }

    #[test]
    fn severity_ladder_on_exhaustion() {
        let severities: Rc<RefCell<Vec<Severity>>> = Rc::new(RefCell::new(Vec::new()));
        let log = severities.clone();
        let mut heap = Heap::with_reclaimer(
            tiny(32, 16),
            move |_: &mut HeapCore, severity: Severity| {
                log.borrow_mut().push(severity);
            },
        )
        .unwrap();
        assert!(heap.try_alloc(40).is_none());
        assert_eq!(
            severities.borrow().as_slice(),
            &[Severity::Low, Severity::Low, Severity::Medium, Severity::High]
        );
    }

    #[test]
    fn fatal_handler_reached_without_null_opt_in() {
        let result = std::panic::catch_unwind(|| {
            let mut heap = Heap::new(tiny(32, 16)).unwrap();
            heap.alloc(40);
        });
        assert!(result.is_err());
    }

    #[test]
    fn forced_reclaim_each_request() {
        let severities: Rc<RefCell<Vec<Severity>>> = Rc::new(RefCell::new(Vec::new()));
        let log = severities.clone();
        let mut opts = tiny(64, 16);
        opts.gc_before_each_alloc = true;
        let mut heap = Heap::with_reclaimer(
            opts,
            move |_: &mut HeapCore, severity: Severity| {
                log.borrow_mut().push(severity);
            },
        )
        .unwrap();
        let a = heap.alloc(8);
        let b = heap.alloc(8);
        assert_eq!(
            severities.borrow().as_slice(),
            &[Severity::High, Severity::High]
        );
        unsafe {
            heap.free(a, 8);
            heap.free(b, 8);
        }
    }

    #[test]
    fn lazy_gc_waits_for_capacity() {
        let calls = Rc::new(RefCell::new(0usize));
        let seen = calls.clone();
        let mut opts = tiny(64, 16);
        opts.lazy_gc = true;
        let mut heap = Heap::with_reclaimer(
            opts,
            move |_: &mut HeapCore, _: Severity| {
                *seen.borrow_mut() += 1;
            },
        )
        .unwrap();
        let mut blocks = Vec::new();
        // Fill the heap far past the soft limit; the lazy trigger compares
        // against capacity, so no callback runs.
        for _ in 0..8 {
            blocks.push(heap.alloc(8));
        }
        assert_eq!(*calls.borrow(), 0);
        // One more request has to cross capacity.
        assert!(heap.try_alloc(8).is_none());
        assert!(*calls.borrow() > 0);
        for p in blocks {
            unsafe { heap.free(p, 8) };
        }
    }
}
