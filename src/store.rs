//! The public store surface.
//!
//! [`ObjectStore`] owns the backing file for its lifetime and serializes
//! every operation through one lock, so reads never observe a mutation
//! mid-update. [`StoreCore`] is the locked state; the `save_changes` hook
//! and [`crate::stream::ObjectStream`] operate on it directly.

use crate::codec;
use crate::error::{Result, StoreError};
use crate::freespace::FreeSpace;
use crate::index::{ObjectBlock, ObjectIndex};
use crate::io::BlockFile;
use crate::stream::ObjectStream;
use crate::BLOCK_SIZE;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Single-subscriber callback fired once at the start of every index save,
/// before the OID-0 block is freed and rewritten. The handler may write,
/// delete and reserve objects; it cannot re-enter the save.
pub type SaveHook = Box<dyn FnMut(&mut StoreCore) -> Result<()> + Send>;

/// Mutable store state. All operations on it execute under the store lock.
pub struct StoreCore {
    pub(crate) file: BlockFile,
    pub(crate) index: ObjectIndex,
    pub(crate) free: FreeSpace,
    pub(crate) last_oid: i64,
    pub(crate) read_only: bool,
    pub(crate) save_hook: Option<SaveHook>,
}

impl StoreCore {
    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }

    pub fn contains(&self, oid: i64) -> bool {
        self.index.contains(oid)
    }

    /// Payload most recently written under `oid`, or `None` when absent.
    pub fn read(&mut self, oid: i64) -> Result<Option<Vec<u8>>> {
        let StoreCore { file, index, .. } = self;
        let entry = match index.get(oid) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let mut payload = vec![0u8; entry.count_bytes as usize];
        for (i, chunk) in payload.chunks_mut(BLOCK_SIZE).enumerate() {
            // Blocks grown but never written may still sit past the
            // physical end of the file; they read as zeros.
            file.read_at(entry.blocks[i], chunk)?;
        }
        Ok(Some(payload))
    }

    /// Store `bytes` under `oid`, releasing any payload previously held
    /// there.
    pub fn write(&mut self, oid: i64, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if bytes.len() > i32::MAX as usize {
            return Err(StoreError::PayloadTooLarge(bytes.len()));
        }

        let mut entry = ObjectBlock::new(oid, bytes.len() as u32);
        self.delete(oid)?;

        let count = (bytes.len() + BLOCK_SIZE - 1) / BLOCK_SIZE;
        entry.blocks = self.find_new_pos(count)?;
        for (i, chunk) in bytes.chunks(BLOCK_SIZE).enumerate() {
            self.file.write_all_at(entry.blocks[i], chunk)?;
        }

        self.index.insert(entry)?;
        self.raise_last_oid(oid);
        Ok(())
    }

    /// Remove `oid` and return its blocks to the free set.
    pub fn delete(&mut self, oid: i64) -> Result<Option<ObjectBlock>> {
        self.ensure_writable()?;
        let removed = self.index.remove(oid);
        if let Some(entry) = &removed {
            self.free.insert_many(entry.blocks.iter().copied());
        }
        Ok(removed)
    }

    /// Return arbitrary block offsets to the free set. Idempotent.
    pub fn delete_blocks(&mut self, offsets: &[u64]) -> Result<()> {
        self.ensure_writable()?;
        self.free.insert_many(offsets.iter().copied());
        Ok(())
    }

    /// Claim `oid` with an empty payload.
    pub fn reserve(&mut self, oid: i64) -> Result<()> {
        self.ensure_writable()?;
        self.index.insert(ObjectBlock::new(oid, 0))?;
        self.raise_last_oid(oid);
        Ok(())
    }

    pub(crate) fn raise_last_oid(&mut self, oid: i64) {
        if oid > self.last_oid {
            self.last_oid = oid;
        }
    }

    pub(crate) fn object(&self, oid: i64) -> Result<&ObjectBlock> {
        self.index.get(oid).ok_or(StoreError::NotFound(oid))
    }

    /// Adjust an object's block list to hold `n` bytes: shrinking frees the
    /// tail blocks, growing allocates past the current last block.
    pub(crate) fn resize_object(&mut self, oid: i64, n: u64) -> Result<()> {
        if n > i32::MAX as u64 {
            return Err(StoreError::PayloadTooLarge(n as usize));
        }

        let step = BLOCK_SIZE as u64;
        let desired = ((n + step - 1) / step) as usize;
        let current = self.object(oid)?.blocks.len();

        if desired < current {
            let freed = match self.index.get_mut(oid) {
                Some(entry) => entry.blocks.split_off(desired),
                None => Vec::new(),
            };
            self.free.insert_many(freed);
        } else if desired > current {
            let after = self.object(oid)?.blocks.last().copied();
            let fresh = self.find_new_pos_after(desired - current, after)?;
            if let Some(entry) = self.index.get_mut(oid) {
                entry.blocks.extend(fresh);
            }
        }

        if let Some(entry) = self.index.get_mut(oid) {
            entry.count_bytes = n as u32;
        }
        Ok(())
    }
}

/// Single-file object store mapping 64-bit identifiers to byte payloads.
pub struct ObjectStore {
    core: Arc<Mutex<StoreCore>>,
    path: PathBuf,
}

impl ObjectStore {
    /// Open the store at `path`. In read-write mode the file is created
    /// when absent; in read-only mode it must exist.
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        Self::with_save_hook(path, read_only, None)
    }

    /// Open with a `save_changes` hook, fired once at the start of every
    /// index save so a collaborator can persist its own root data.
    pub fn with_save_hook<P: AsRef<Path>>(
        path: P,
        read_only: bool,
        save_hook: Option<SaveHook>,
    ) -> Result<Self> {
        let file = BlockFile::open(&path, read_only)?;
        let mut core = StoreCore {
            file,
            index: ObjectIndex::new(),
            free: FreeSpace::new(),
            last_oid: 0,
            read_only,
            save_hook,
        };
        codec::read_oids(&mut core)?;

        tracing::info!(
            path = %path.as_ref().display(),
            read_only,
            objects = core.index.len(),
            free_blocks = core.free.len(),
            "opened object store"
        );

        Ok(ObjectStore {
            core: Arc::new(Mutex::new(core)),
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Whether the backing file holds no data at all.
    pub fn is_empty(&self) -> Result<bool> {
        self.core.lock().file.is_empty()
    }

    pub fn contains(&self, oid: i64) -> bool {
        self.core.lock().contains(oid)
    }

    /// Payload most recently written under `oid`, or `None` when absent.
    pub fn read(&self, oid: i64) -> Result<Option<Vec<u8>>> {
        self.core.lock().read(oid)
    }

    /// Store `bytes` under `oid`, overwriting any previous payload.
    pub fn write(&self, oid: i64, bytes: &[u8]) -> Result<()> {
        self.core.lock().write(oid, bytes)
    }

    /// Remove `oid`; its blocks become reusable. Deleting an absent OID is
    /// a no-op returning `None`.
    pub fn delete(&self, oid: i64) -> Result<Option<ObjectBlock>> {
        self.core.lock().delete(oid)
    }

    /// Return arbitrary block offsets to the free set.
    pub fn delete_blocks(&self, offsets: &[u64]) -> Result<()> {
        self.core.lock().delete_blocks(offsets)
    }

    /// Claim `oid` with an empty payload; fails if it is already present.
    pub fn reserve(&self, oid: i64) -> Result<()> {
        self.core.lock().reserve(oid)
    }

    /// Hand out the next unused OID.
    pub fn new_oid(&self) -> Result<i64> {
        self.core.lock().new_oid()
    }

    /// Open a seekable stream over `oid`. On a writable store a missing
    /// object is created empty; on a read-only store it is an error.
    pub fn stream(&self, oid: i64) -> Result<ObjectStream> {
        ObjectStream::open(Arc::clone(&self.core), oid)
    }

    /// Copy of the index entry for `oid`, if present.
    pub fn entry(&self, oid: i64) -> Option<ObjectBlock> {
        self.core.lock().index.get(oid).cloned()
    }

    /// Snapshot of the free set, ascending.
    pub fn free_offsets(&self) -> Vec<u64> {
        self.core.lock().free.iter_ascending().collect()
    }

    /// Highest OID handed out or observed so far.
    pub fn last_oid(&self) -> i64 {
        self.core.lock().last_oid
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let core = self.core.lock();
        Ok(StoreStats {
            objects: core.index.len(),
            free_blocks: core.free.len(),
            file_len: core.file.len()?,
        })
    }

    /// Flush buffered writes without saving the index.
    pub fn flush(&self) -> Result<()> {
        self.core.lock().file.flush()
    }

    /// Save the index, compact the file and release the store. The file is
    /// self-contained afterwards and reopens with no sidecar.
    pub fn close(self) -> Result<()> {
        let mut core = self.core.lock();
        if !core.read_only {
            codec::save_oids(&mut core)?;
            core.file.sync()?;
        }
        tracing::info!(path = %self.path.display(), "closed object store");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Store statistics.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Index entries, including the reserved OID-0 entry.
    pub objects: usize,
    pub free_blocks: usize,
    pub file_len: u64,
}
