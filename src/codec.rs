//! On-file serialization of the object index.
//!
//! The index lives in a chain of [`BLOCK_SIZE`] blocks rooted at offset 0.
//! Scalars are written back to back; the trailing eight bytes of a chain
//! block hold an int64 continuation pointer, emitted only when the next
//! scalar would not fit ahead of the pointer slot. Continuation blocks come
//! from the free set first, from the end of the file otherwise, so the
//! chain can grow without a fixed ceiling.
//!
//! Serialized fields, all little-endian, in order:
//!
//! ```text
//! int32 object_count
//! per object (ascending OID, OID 0 excluded):
//!     int64 oid
//!     int32 count_bytes
//!     int32 block_count
//!     block_count x int64 block offsets
//! int32 free_count
//! free_count x int64 free offsets (ascending)
//! ```
//!
//! The blocks the chain occupies become the `blocks` list of the OID-0
//! index entry.

use crate::error::{Result, StoreError};
use crate::freespace::FreeSpace;
use crate::index::ObjectBlock;
use crate::io::BlockFile;
use crate::store::StoreCore;
use crate::{BLOCK_SIZE, INDEX_OID};

const POINTER_SIZE: u64 = 8;

struct ChainWriter<'a> {
    file: &'a mut BlockFile,
    free: &'a mut FreeSpace,
    pos: u64,
    chain: Vec<u64>,
}

impl<'a> ChainWriter<'a> {
    fn new(file: &'a mut BlockFile, free: &'a mut FreeSpace) -> Self {
        ChainWriter {
            file,
            free,
            pos: 0,
            chain: vec![0],
        }
    }

    fn write_i32(&mut self, value: i32) -> Result<()> {
        self.make_room(4)?;
        self.file.write_all_at(self.pos, &value.to_le_bytes())?;
        self.pos += 4;
        Ok(())
    }

    fn write_i64(&mut self, value: i64) -> Result<()> {
        self.make_room(8)?;
        self.file.write_all_at(self.pos, &value.to_le_bytes())?;
        self.pos += 8;
        Ok(())
    }

    /// Chain to a continuation block unless `field` more bytes fit ahead
    /// of the pointer slot.
    fn make_room(&mut self, field: u64) -> Result<()> {
        let step = BLOCK_SIZE as u64;
        let left = step - self.pos % step;
        if left >= field + POINTER_SIZE {
            return Ok(());
        }

        let next = match self.free.pop_first() {
            Some(offset) => offset,
            None => {
                let len = self.file.len()?;
                self.file.set_len(len + step)?;
                if self.pos == len {
                    self.pos + POINTER_SIZE
                } else {
                    len
                }
            }
        };
        self.file
            .write_all_at(self.pos, &(next as i64).to_le_bytes())?;
        self.chain.push(next);
        self.pos = next;
        Ok(())
    }
}

struct ChainReader<'a> {
    file: &'a mut BlockFile,
    free: &'a mut FreeSpace,
    file_len: u64,
    pos: u64,
    chain: Vec<u64>,
}

impl<'a> ChainReader<'a> {
    fn new(file: &'a mut BlockFile, free: &'a mut FreeSpace, file_len: u64) -> Self {
        ChainReader {
            file,
            free,
            file_len,
            pos: 0,
            chain: vec![0],
        }
    }

    fn read_i32(&mut self) -> Result<i32> {
        self.follow(4)?;
        let mut raw = [0u8; 4];
        self.file.read_exact_at(self.pos, &mut raw)?;
        self.pos += 4;
        Ok(i32::from_le_bytes(raw))
    }

    fn read_i64(&mut self) -> Result<i64> {
        self.follow(8)?;
        let mut raw = [0u8; 8];
        self.file.read_exact_at(self.pos, &mut raw)?;
        self.pos += 8;
        Ok(i64::from_le_bytes(raw))
    }

    /// Follow a continuation pointer when the next `field` bytes cannot
    /// precede the pointer slot. A pointer that is negative, beyond the
    /// file, or behind the previous chain block is repaired to the block
    /// after the previous one.
    fn follow(&mut self, field: u64) -> Result<()> {
        let step = BLOCK_SIZE as u64;
        let left = step - self.pos % step;
        if left >= field + POINTER_SIZE {
            return Ok(());
        }

        let mut raw = [0u8; 8];
        self.file.read_exact_at(self.pos, &mut raw)?;
        let pointer = i64::from_le_bytes(raw);
        let prev = self.chain.last().copied().unwrap_or(0);
        let next = if pointer < 0 || pointer as u64 > self.file_len || (pointer as u64) < prev {
            let repaired = prev + step;
            tracing::warn!(pointer, repaired, "repaired out-of-range index chain pointer");
            repaired
        } else {
            pointer as u64
        };
        self.chain.push(next);
        self.pos = next;
        Ok(())
    }
}

/// Load the index and the free set from the file.
///
/// A zero-length file gets a fresh one-block index entry and nothing else;
/// otherwise the chain rooted at offset 0 is decoded symmetrically to
/// [`save_oids`].
pub(crate) fn read_oids(core: &mut StoreCore) -> Result<()> {
    let step = BLOCK_SIZE as u64;
    let len = core.file.len()?;
    if len == 0 {
        let mut head = ObjectBlock::new(INDEX_OID, BLOCK_SIZE as u32);
        head.blocks.push(0);
        core.index.insert(head)?;
        return Ok(());
    }

    let file_len = ((len + step - 1) / step) * step;
    let StoreCore {
        file,
        free,
        index,
        last_oid,
        ..
    } = core;
    let mut reader = ChainReader::new(file, free, file_len);

    let object_count = reader.read_i32()?;
    if object_count < 0 {
        return Err(StoreError::Corruption(format!(
            "negative object count {object_count}"
        )));
    }

    for _ in 0..object_count {
        let oid = reader.read_i64()?;
        let count_bytes = reader.read_i32()?;
        let block_count = reader.read_i32()?;
        if count_bytes < 0 || block_count < 0 {
            return Err(StoreError::Corruption(format!(
                "object {oid} has count_bytes {count_bytes}, block_count {block_count}"
            )));
        }

        let mut entry = ObjectBlock::new(oid, count_bytes as u32);
        if entry.required_blocks() != block_count as usize {
            return Err(StoreError::Corruption(format!(
                "object {oid}: {count_bytes} bytes cannot span {block_count} blocks"
            )));
        }
        entry.blocks.reserve(block_count as usize);
        for _ in 0..block_count {
            let offset = reader.read_i64()?;
            if offset < 0 {
                return Err(StoreError::Corruption(format!(
                    "object {oid} references negative block offset {offset}"
                )));
            }
            // A block owned by an object can never also be free.
            reader.free.remove(offset as u64);
            entry.blocks.push(offset as u64);
        }

        index.insert(entry)?;
        if oid > *last_oid {
            *last_oid = oid;
        }
    }

    let free_count = reader.read_i32()?;
    if free_count < 0 {
        return Err(StoreError::Corruption(format!(
            "negative free count {free_count}"
        )));
    }
    for _ in 0..free_count {
        let offset = reader.read_i64()?;
        if offset < 0 {
            return Err(StoreError::Corruption(format!(
                "negative free offset {offset}"
            )));
        }
        reader.free.insert(offset as u64);
    }

    let ChainReader { free, chain, .. } = reader;
    // A continuation block claimed while the free section itself was being
    // written can appear in the serialized free list; the chain owns it.
    for &offset in &chain {
        if free.remove(offset) {
            tracing::warn!(offset, "dropped free offset aliasing an index chain block");
        }
    }

    let mut head = ObjectBlock::new(INDEX_OID, (chain.len() * BLOCK_SIZE) as u32);
    head.blocks = chain;
    index.insert(head)?;
    Ok(())
}

/// Compact the file and write the index back, starting at offset 0.
pub(crate) fn save_oids(core: &mut StoreCore) -> Result<()> {
    // The hook is taken out while it runs, so a nested save cannot
    // re-fire it.
    if let Some(mut hook) = core.save_hook.take() {
        let outcome = hook(core);
        core.save_hook = Some(hook);
        outcome?;
    }

    // The old chain is rebuilt from scratch; block 0 stays the head and
    // must not be handed out as a continuation block.
    if let Some(head) = core.index.remove(INDEX_OID) {
        core.free.insert_many(head.blocks.iter().copied());
    }
    if !core.free.remove(0) {
        tracing::warn!("index head offset missing from the free set during save");
    }

    let step = BLOCK_SIZE as u64;
    let last_data = core
        .index
        .iter_ascending()
        .flat_map(|entry| entry.blocks.iter().copied())
        .max()
        .unwrap_or(0);

    // Truncate behind the last live block; frees beyond it are stale.
    let new_len = ((last_data + step + step - 1) / step) * step;
    core.free.drop_at_or_after(new_len);
    core.file.set_len(new_len)?;

    // A free offset aliasing a live block loses: the block stays live.
    for entry in core.index.iter_ascending() {
        for &offset in &entry.blocks {
            if core.free.remove(offset) {
                tracing::warn!(offset, oid = entry.oid, "dropped free offset aliasing a live block");
            }
        }
    }

    let StoreCore {
        file, free, index, ..
    } = core;
    let mut writer = ChainWriter::new(file, free);

    let object_count = index.iter_ascending().filter(|e| e.oid != INDEX_OID).count();
    writer.write_i32(object_count as i32)?;
    for entry in index.iter_ascending() {
        if entry.oid == INDEX_OID {
            continue;
        }
        writer.write_i64(entry.oid)?;
        writer.write_i32(entry.count_bytes as i32)?;
        writer.write_i32(entry.blocks.len() as i32)?;
        for &offset in &entry.blocks {
            writer.write_i64(offset as i64)?;
        }
    }

    // Snapshot the free list before writing it: chaining may pop from the
    // live set mid-section, and the count must match the entries emitted.
    let free_snapshot: Vec<u64> = writer.free.iter_ascending().collect();
    writer.write_i32(free_snapshot.len() as i32)?;
    for &offset in &free_snapshot {
        writer.write_i64(offset as i64)?;
    }

    let chain = writer.chain;
    tracing::debug!(
        objects = object_count,
        chain_blocks = chain.len(),
        free_blocks = free_snapshot.len(),
        "index saved"
    );

    let mut head = ObjectBlock::new(INDEX_OID, (chain.len() * BLOCK_SIZE) as u32);
    head.blocks = chain;
    core.index.insert(head)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freespace::FreeSpace;
    use crate::index::ObjectIndex;
    use tempfile::TempDir;

    fn empty_core(dir: &TempDir, name: &str) -> StoreCore {
        StoreCore {
            file: BlockFile::open(dir.path().join(name), false).unwrap(),
            index: ObjectIndex::new(),
            free: FreeSpace::new(),
            last_oid: 0,
            read_only: false,
            save_hook: None,
        }
    }

    #[test]
    fn test_read_oids_on_fresh_file() {
        let dir = TempDir::new().unwrap();
        let mut core = empty_core(&dir, "fresh.cap");

        read_oids(&mut core).unwrap();

        let head = core.index.get(INDEX_OID).unwrap();
        assert_eq!(head.count_bytes, BLOCK_SIZE as u32);
        assert_eq!(head.blocks, vec![0]);
        assert!(core.free.is_empty());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut core = empty_core(&dir, "trip.cap");
        read_oids(&mut core).unwrap();

        core.write(5, &[0xAB; 300]).unwrap();
        core.write(9, &[0xCD; 10]).unwrap();
        core.write(7, &[0xEF; 600]).unwrap();
        core.delete(9).unwrap();
        let expected_free = core.free.iter_ascending().collect::<Vec<_>>();

        save_oids(&mut core).unwrap();
        let saved_len = core.file.len().unwrap();
        assert_eq!(saved_len % BLOCK_SIZE as u64, 0);

        let mut reopened = empty_core(&dir, "trip.cap");
        read_oids(&mut reopened).unwrap();

        assert_eq!(reopened.read(5).unwrap().unwrap(), vec![0xAB; 300]);
        assert_eq!(reopened.read(7).unwrap().unwrap(), vec![0xEF; 600]);
        assert!(reopened.read(9).unwrap().is_none());
        assert_eq!(reopened.last_oid, 7);
        assert_eq!(
            reopened.free.iter_ascending().collect::<Vec<_>>(),
            expected_free
        );
    }

    #[test]
    fn test_save_truncates_behind_last_live_block() {
        let dir = TempDir::new().unwrap();
        let mut core = empty_core(&dir, "trunc.cap");
        read_oids(&mut core).unwrap();

        core.write(1, &[1u8; 256]).unwrap();
        core.write(2, &[2u8; 1024]).unwrap();
        core.delete(2).unwrap();

        save_oids(&mut core).unwrap();

        // Only block 0 and object 1's single block survive.
        let last = core.index.get(1).unwrap().blocks[0];
        assert_eq!(core.file.len().unwrap(), last + BLOCK_SIZE as u64);
        assert!(core.free.iter_ascending().all(|o| o < last));
    }

    #[test]
    fn test_chain_grows_past_one_block() {
        let dir = TempDir::new().unwrap();
        let mut core = empty_core(&dir, "chain.cap");
        read_oids(&mut core).unwrap();

        // Enough entries that the serialized index cannot fit in block 0.
        for oid in 1..=40 {
            core.write(oid, &[oid as u8; 100]).unwrap();
        }
        save_oids(&mut core).unwrap();

        let head = core.index.get(INDEX_OID).unwrap();
        assert!(head.blocks.len() > 1);
        assert_eq!(head.blocks[0], 0);
        assert_eq!(
            head.count_bytes as usize,
            head.blocks.len() * BLOCK_SIZE
        );

        let mut reopened = empty_core(&dir, "chain.cap");
        read_oids(&mut reopened).unwrap();
        for oid in 1..=40 {
            assert_eq!(reopened.read(oid).unwrap().unwrap(), vec![oid as u8; 100]);
        }
        assert_eq!(
            reopened.index.get(INDEX_OID).unwrap().blocks,
            head.blocks
        );
    }

    #[test]
    fn test_writer_chains_through_free_block() {
        let dir = TempDir::new().unwrap();
        let mut core = empty_core(&dir, "writer.cap");
        core.file.set_len(512).unwrap();
        core.free.insert(256);

        let StoreCore { file, free, .. } = &mut core;
        let mut writer = ChainWriter::new(file, free);
        for v in 1..=32i64 {
            writer.write_i64(v).unwrap();
        }
        // 31 values fill block 0 up to the pointer slot; the 32nd goes to
        // the free block.
        assert_eq!(writer.chain, vec![0, 256]);
        assert!(core.free.is_empty());
    }

    #[test]
    fn test_reader_repairs_bad_pointer() {
        let dir = TempDir::new().unwrap();
        let mut core = empty_core(&dir, "repair.cap");
        core.file.set_len(512).unwrap();
        core.free.insert(256);

        {
            let StoreCore { file, free, .. } = &mut core;
            let mut writer = ChainWriter::new(file, free);
            for v in 1..=32i64 {
                writer.write_i64(v).unwrap();
            }
            assert_eq!(writer.chain, vec![0, 256]);
        }

        // Clobber the continuation pointer at the tail of block 0. The
        // legitimate target is 256, which is exactly what the repair
        // (previous chain offset + one block) reconstructs.
        core.file
            .write_all_at(248, &(-7i64).to_le_bytes())
            .unwrap();

        let file_len = core.file.len().unwrap();
        let StoreCore { file, free, .. } = &mut core;
        let mut reader = ChainReader::new(file, free, file_len);
        for v in 1..=32i64 {
            assert_eq!(reader.read_i64().unwrap(), v);
        }
        assert_eq!(reader.chain, vec![0, 256]);
    }

    #[test]
    fn test_corrupt_block_count_is_detected() {
        let dir = TempDir::new().unwrap();
        let mut core = empty_core(&dir, "bad.cap");
        core.file.set_len(256).unwrap();

        {
            let StoreCore { file, free, .. } = &mut core;
            let mut writer = ChainWriter::new(file, free);
            writer.write_i32(1).unwrap(); // one object
            writer.write_i64(5).unwrap(); // oid
            writer.write_i32(300).unwrap(); // count_bytes
            writer.write_i32(9).unwrap(); // block_count: impossible for 300 bytes
        }

        let mut reopened = empty_core(&dir, "bad.cap");
        let err = read_oids(&mut reopened).unwrap_err();
        assert!(matches!(err, StoreError::Corruption(_)));
    }
}
