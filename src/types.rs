use core::fmt;

// ------------------------------------------------------
// Build-time layout parameters
// ------------------------------------------------------

/// Allocation granularity in bytes. Every block and free region starts and
/// ends on a multiple of this, and all sizes are rounded up to it.
pub const ALIGNMENT: usize = 8;
pub const ALIGNMENT_LOG: usize = 3;

/// Reserved offset value marking the end of the free list.
pub(crate) const END_OF_LIST: u32 = u32::MAX;

// What a host `malloc` spends per block, used by the emulated-dynamic and
// passthrough accounting. 8-byte headers rounded to 16-byte granules is the
// common glibc shape.
pub(crate) const SYSTEM_ALLOCATOR_METADATA_SIZE: usize = 8;
pub(crate) const SYSTEM_ALLOCATOR_ALIGN_BYTES: usize = 16;

/// Round `size` up to the next multiple of `align`.
#[inline]
pub(crate) fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) / align * align
}

// ------------------------------------------------------
// Free-region header
// ------------------------------------------------------

/// Header written in place at the first aligned word of every free region.
/// Allocation overwrites it with user data; free reconstructs it from the
/// caller-supplied size.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct FreeRegion {
    /// Total byte length of the region, header included. Multiple of
    /// `ALIGNMENT`, never zero except in the list sentinel.
    pub size: u32,
    /// Encoded offset of the next free region in address order, or
    /// `END_OF_LIST`.
    pub next_offset: u32,
}

// The header must fit exactly one alignment granule so that a minimal free
// region can carry it.
const _: () = assert!(core::mem::size_of::<FreeRegion>() == ALIGNMENT);

// ------------------------------------------------------
// Compressed pointers
// ------------------------------------------------------

/// A heap address packed into a `W`-bit offset in units of `ALIGNMENT`.
///
/// This is the only representation of a heap reference that engine data
/// structures should persist. It supports no arithmetic; the owning heap's
/// `compress`/`decompress` are the sole crossing points between this and a
/// native address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CompressedPointer(pub(crate) u32);

impl CompressedPointer {
    /// Raw `W`-bit value, for embedding in packed fields. The all-ones value
    /// of the configured width is the null encoding.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild from a value previously taken with [`raw`](Self::raw).
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        CompressedPointer(raw)
    }
}

// ------------------------------------------------------
// Reclamation severity
// ------------------------------------------------------

/// Escalation level passed to the reclamation callback. Higher levels ask
/// the engine to give back memory more aggressively.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Severity {
    Low,
    Medium,
    High,
}

// ------------------------------------------------------
// Construction errors
// ------------------------------------------------------

/// Failure to bring up a heap. Runtime out-of-memory is not represented
/// here; it surfaces as a null return or the fatal handler.
#[derive(Debug)]
pub enum HeapError {
    /// The option set is inconsistent; the message names the offending field.
    InvalidOptions(&'static str),
    /// The operating system refused the initial reservation.
    ReserveFailed,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeapError::InvalidOptions(what) => write!(f, "invalid heap options: {}", what),
            HeapError::ReserveFailed => write!(f, "could not reserve backing memory"),
        }
    }
}

impl std::error::Error for HeapError {}
