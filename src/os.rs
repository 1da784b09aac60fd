use core::ptr::null_mut;

use log::warn;

use crate::types::ALIGNMENT;

// Primitive reservation from the OS. Committed read-write immediately; the
// heap touches its whole area during normal operation anyway.
#[cfg(not(windows))]
pub(crate) fn reserve(size: usize) -> *mut u8 {
    debug_assert!(size > 0);
    unsafe {
        let p = libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            warn!("mmap failed: {}, size {}", errno::errno(), size);
            return null_mut();
        }
        p as *mut u8
    }
}

#[cfg(not(windows))]
pub(crate) fn release(p: *mut u8, size: usize) {
    if p.is_null() || size == 0 {
        return;
    }
    unsafe {
        if libc::munmap(p as *mut _, size) == -1 {
            warn!(
                "munmap failed: {}, addr {:p}, size {}",
                errno::errno(),
                p,
                size
            );
        }
    }
}

#[cfg(windows)]
pub(crate) fn reserve(size: usize) -> *mut u8 {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

    debug_assert!(size > 0);
    let p = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
    if p.is_null() {
        warn!("VirtualAlloc failed: {}, size {}", errno::errno(), size);
    }
    p as *mut u8
}

#[cfg(windows)]
pub(crate) fn release(p: *mut u8, size: usize) {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;

    if p.is_null() || size == 0 {
        return;
    }
    let ok = unsafe { VirtualFree(p as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        warn!(
            "VirtualFree failed: {}, addr {:p}, size {}",
            errno::errno(),
            p,
            size
        );
    }
}

/// A contiguous reservation, the backing of the static and emulated-dynamic
/// modes. Released when dropped.
pub(crate) struct Area {
    base: *mut u8,
    size: usize,
}

impl Area {
    pub fn reserve(size: usize) -> Option<Area> {
        let base = reserve(size);
        if base.is_null() {
            return None;
        }
        // OS reservations are page aligned, far above the heap granule.
        debug_assert!(base as usize % ALIGNMENT == 0);
        Some(Area { base, size })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn contains(&self, p: *const u8) -> bool {
        let a = p as usize;
        a >= self.base as usize && a < self.base as usize + self.size
    }
}

impl Drop for Area {
    fn drop(&mut self) {
        release(self.base, self.size);
    }
}
