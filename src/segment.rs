use log::debug;

use crate::os;
use crate::types::{HeapError, ALIGNMENT};

/* -----------------------------------------------------------
  Segmented backing store

  The heap's address space is a sequence of fixed-size slabs
  addressed by (segment index, intra-segment offset). Slabs are
  reserved from the OS in groups of one or more contiguous
  indices; memory inside a group is contiguous, memory across
  groups is not. The encoded offset of a byte is
  `index * segment_size + intra`, so a free region may span
  segment boundaries only inside its own group.

  Segment 0 is reserved at init and lives until teardown. Every
  other group is released as soon as all of its segments report
  zero occupancy.
----------------------------------------------------------- */

#[derive(Clone, Copy)]
struct SegmentRecord {
    /// Slab base for this index.
    base: *mut u8,
    /// Bytes of live blocks whose offsets fall into this segment. A block
    /// spanning segments contributes only each segment's share.
    occupied_size: u32,
    /// Number of segments in the reservation starting here; zero on the
    /// trailing members of a group.
    group_len: u16,
}

pub(crate) struct SegmentSet {
    segment_size: u32,
    table: Vec<Option<SegmentRecord>>,
    live_count: usize,
}

impl SegmentSet {
    /// Reserve segment 0 and build the index table.
    pub fn bootstrap(segment_size: usize, max_segments: usize) -> Result<SegmentSet, HeapError> {
        let mut set = SegmentSet {
            segment_size: segment_size as u32,
            table: vec![None; max_segments],
            live_count: 0,
        };
        if set.allocate_group(set.segment_size).is_none() {
            return Err(HeapError::ReserveFailed);
        }
        Ok(set)
    }

    #[inline]
    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    #[inline]
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn capacity(&self) -> usize {
        self.segment_size as usize * self.table.len()
    }

    /// Occupancy of one segment, if it is live.
    pub fn occupied(&self, index: usize) -> Option<u32> {
        self.table.get(index).and_then(|s| s.as_ref()).map(|s| s.occupied_size)
    }

    // ---- multi-base codec ----

    #[inline]
    pub fn decode(&self, offset: u32) -> *mut u8 {
        let sidx = (offset / self.segment_size) as usize;
        let intra = offset % self.segment_size;
        match self.table[sidx] {
            Some(seg) => unsafe { seg.base.add(intra as usize) },
            None => unreachable!("decode of offset in an unmapped segment"),
        }
    }

    /// Reverse lookup by linear search over the segment base table.
    pub fn encode(&self, p: *const u8) -> u32 {
        let a = p as usize;
        for (idx, slot) in self.table.iter().enumerate() {
            if let Some(seg) = slot {
                let base = seg.base as usize;
                if a >= base && a < base + self.segment_size as usize {
                    return idx as u32 * self.segment_size + (a - base) as u32;
                }
            }
        }
        unreachable!("address not in any live segment")
    }

    pub fn contains(&self, p: *const u8) -> bool {
        let a = p as usize;
        self.table.iter().any(|slot| match slot {
            Some(seg) => {
                a >= seg.base as usize && a < seg.base as usize + self.segment_size as usize
            }
            None => false,
        })
    }

    /// Whether free regions on both sides of `offset` may coalesce. Group
    /// boundaries are separate OS reservations, so a region must never grow
    /// across one even if the two mappings happen to abut.
    pub fn mergeable_boundary(&self, offset: u32) -> bool {
        if offset % self.segment_size != 0 {
            return true;
        }
        let sidx = (offset / self.segment_size) as usize;
        match self.table[sidx] {
            Some(seg) => seg.group_len == 0,
            None => false,
        }
    }

    // ---- occupancy accounting ----

    pub fn add_occupied_span(&mut self, start: u32, size: u32) {
        self.adjust_span(start, size, true);
    }

    pub fn sub_occupied_span(&mut self, start: u32, size: u32) {
        self.adjust_span(start, size, false);
    }

    // Walk the block granule by granule fragment-wise: each loop step covers
    // the part of the block inside one segment.
    fn adjust_span(&mut self, start: u32, size: u32, add: bool) {
        let s = self.segment_size;
        let word = ALIGNMENT as u32;
        let block_end = start + size - word;
        let mut remaining = size;
        let mut fragment_start = start;
        while remaining > 0 {
            let sidx = (fragment_start / s) as usize;
            let segment_end = (sidx as u32 + 1) * s - word;
            let fragment_end = if block_end < segment_end {
                block_end
            } else {
                segment_end
            };
            let in_segment = fragment_end - fragment_start + word;
            match self.table[sidx].as_mut() {
                Some(seg) => {
                    if add {
                        seg.occupied_size += in_segment;
                        debug_assert!(seg.occupied_size <= s);
                    } else {
                        debug_assert!(seg.occupied_size >= in_segment);
                        seg.occupied_size -= in_segment;
                    }
                }
                None => unreachable!("occupancy update in an unmapped segment"),
            }
            remaining -= in_segment;
            fragment_start = fragment_end + word;
        }
    }

    // ---- growth and release ----

    /// Reserve enough contiguous segments for a block of `need` bytes, at
    /// the lowest run of free indices. Returns the new group's offset span.
    pub fn allocate_group(&mut self, need: u32) -> Option<(u32, u32)> {
        let s = self.segment_size;
        let count = ((need + s - 1) / s) as usize;

        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for i in 0..self.table.len() {
            if self.table[i].is_none() {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == count {
                    break;
                }
            } else {
                run_len = 0;
            }
        }
        if run_len < count {
            return None;
        }

        let bytes = count * s as usize;
        let base = os::reserve(bytes);
        if base.is_null() {
            return None;
        }
        for j in 0..count {
            self.table[run_start + j] = Some(SegmentRecord {
                base: unsafe { base.add(j * s as usize) },
                occupied_size: 0,
                group_len: if j == 0 { count as u16 } else { 0 },
            });
        }
        self.live_count += count;
        debug!(
            "segment group reserved: indices {}..{}, {} bytes",
            run_start,
            run_start + count,
            bytes
        );
        Some((run_start as u32 * s, bytes as u32))
    }

    /// Group heads (other than segment 0) whose segments are all empty.
    pub fn empty_group_heads(&self) -> Vec<usize> {
        let mut heads = Vec::new();
        for (idx, slot) in self.table.iter().enumerate() {
            let head = match slot {
                Some(seg) if seg.group_len > 0 => seg,
                _ => continue,
            };
            if idx == 0 {
                continue;
            }
            let len = head.group_len as usize;
            let all_empty = (idx..idx + len).all(|j| match self.table[j] {
                Some(seg) => seg.occupied_size == 0,
                None => false,
            });
            if all_empty {
                heads.push(idx);
            }
        }
        heads
    }

    /// Offset span of the group starting at `head`.
    pub fn group_span(&self, head: usize) -> (u32, u32) {
        match self.table[head] {
            Some(seg) if seg.group_len > 0 => (
                head as u32 * self.segment_size,
                seg.group_len as u32 * self.segment_size,
            ),
            _ => unreachable!("group_span of a non-head segment"),
        }
    }

    /// Return a whole group to the OS and clear its table slots.
    pub fn release_group(&mut self, head: usize) {
        let (base, len) = match self.table[head] {
            Some(seg) if seg.group_len > 0 => (seg.base, seg.group_len as usize),
            _ => unreachable!("release of a non-head segment"),
        };
        os::release(base, len * self.segment_size as usize);
        for j in head..head + len {
            self.table[j] = None;
        }
        self.live_count -= len;
        debug!("segment group released: indices {}..{}", head, head + len);
    }
}

impl Drop for SegmentSet {
    fn drop(&mut self) {
        let heads: Vec<usize> = self
            .table
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(seg) if seg.group_len > 0 => Some(idx),
                _ => None,
            })
            .collect();
        for head in heads {
            self.release_group(head);
        }
        debug_assert_eq!(self.live_count, 0);
    }
}
