//! Managed heap for an embedded script-engine runtime.
//!
//! Every allocation the engine makes (objects, strings, bytecode, property
//! tables) is served out of one context-owned pool: an address-ordered
//! free-list allocator over a contiguous reservation or a growable set of
//! fixed-size segments. Live addresses compress into 16- or 32-bit offsets
//! so engine data structures can hold references cheaply, and a
//! caller-supplied reclamation callback (the engine's GC) runs at
//! escalating severity whenever a request cannot be satisfied.
//!
//! The allocator is single-threaded by design: one mutator, no locks, and
//! the reclamation callback runs synchronously inside `alloc`.
//!
//! ```
//! use vmheap::{Heap, HeapOptions};
//!
//! let mut heap = Heap::new(HeapOptions::default()).unwrap();
//! let p = heap.alloc(24);
//! let cp = heap.compress(p);
//! assert_eq!(heap.decompress(cp), p);
//! unsafe { heap.free(p, 24) };
//! ```

mod gc;
mod heap;
mod options;
mod os;
mod segment;
mod stats;
mod types;

pub use crate::gc::{Heap, NoReclaim, Reclaimer};
pub use crate::heap::HeapCore;
pub use crate::options::{HeapMode, HeapOptions};
pub use crate::stats::HeapStats;
pub use crate::types::{CompressedPointer, HeapError, Severity, ALIGNMENT};
