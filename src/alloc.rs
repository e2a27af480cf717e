//! Object-identifier generation and block placement.
//!
//! Allocation drains the free set before extending the file. A request for
//! several blocks prefers a contiguous run of free offsets; when no run is
//! long enough the lowest free offsets are used instead, which keeps the
//! allocator making forward progress on fragmented files.

use crate::error::{Result, StoreError};
use crate::store::StoreCore;
use crate::BLOCK_SIZE;

impl StoreCore {
    /// Hand out the next unused OID.
    ///
    /// The counter wraps from the top of the positive range into the
    /// negative range; a wrap that lands on the reserved OID 0 triggers a
    /// scan for the first identifier not in the index.
    pub fn new_oid(&mut self) -> Result<i64> {
        self.ensure_writable()?;
        let mut oid = self.last_oid.wrapping_add(1);
        if oid == i64::MAX {
            oid = i64::MIN;
        }
        if oid == 0 {
            oid = self.first_unused_oid()?;
        }
        self.last_oid = oid;
        Ok(oid)
    }

    fn first_unused_oid(&self) -> Result<i64> {
        for oid in 0..i64::MAX {
            if !self.index.contains(oid) {
                return Ok(oid);
            }
        }
        for oid in i64::MIN..-1 {
            if !self.index.contains(oid) {
                return Ok(oid);
            }
        }
        Err(StoreError::CapacityExhausted)
    }

    /// Choose `count` block offsets for a new payload.
    pub(crate) fn find_new_pos(&mut self, count: usize) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if count == 1 {
            if let Some(first) = self.free.pop_first() {
                return Ok(vec![first]);
            }
        }
        if count > self.free.len() {
            return self.append_blocks(count);
        }
        if let Some(run) = self.take_contiguous_run(count) {
            return Ok(run);
        }

        // No run long enough; fall back to the lowest free offsets.
        let mut offsets = Vec::with_capacity(count);
        while offsets.len() < count {
            match self.free.pop_first() {
                Some(offset) => offsets.push(offset),
                None => break,
            }
        }
        Ok(offsets)
    }

    /// Blocks for extending an existing object in place: free offsets past
    /// `after` first, then end-of-file positions. The result keeps the
    /// order it was produced in; callers append it to the object's block
    /// list.
    pub(crate) fn find_new_pos_after(
        &mut self,
        count: usize,
        after: Option<u64>,
    ) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut offsets: Vec<u64> = match after {
            Some(bound) => self.free.iter_above(bound).take(count).collect(),
            None => self.free.iter_ascending().take(count).collect(),
        };
        for &offset in &offsets {
            self.free.remove(offset);
        }
        if offsets.len() < count {
            let tail = self.append_blocks(count - offsets.len())?;
            offsets.extend(tail);
        }
        Ok(offsets)
    }

    /// Search the free set for `count` offsets spaced exactly one block
    /// apart; removes and returns the run when found.
    fn take_contiguous_run(&mut self, count: usize) -> Option<Vec<u64>> {
        let step = BLOCK_SIZE as u64;
        let mut start = 0u64;
        let mut run = 0usize;
        let mut prev = None;
        for offset in self.free.iter_ascending() {
            match prev {
                Some(p) if offset == p + step => run += 1,
                _ => {
                    start = offset;
                    run = 1;
                }
            }
            prev = Some(offset);
            if run == count {
                break;
            }
        }
        if run < count {
            return None;
        }

        let offsets: Vec<u64> = (0..count as u64).map(|i| start + i * step).collect();
        for &offset in &offsets {
            self.free.remove(offset);
        }
        Some(offsets)
    }

    /// Positions past the current end of the file, one per block. Block 0
    /// is never handed out; it belongs to the index chain. Free offsets at
    /// or beyond the observed end are stale and dropped.
    fn append_blocks(&mut self, count: usize) -> Result<Vec<u64>> {
        let step = BLOCK_SIZE as u64;
        let len = self.file.len()?;
        let end = (((len + step - 1) / step) * step).max(step);
        let offsets = (0..count as u64).map(|i| end + i * step).collect();
        self.free.drop_at_or_after(len);
        Ok(offsets)
    }
}
