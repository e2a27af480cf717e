//! Single-file, self-describing object store.
//!
//! Maps a 64-bit object identifier (OID) to an opaque byte payload of
//! arbitrary size. Payloads and the index that locates them live in the
//! same fixed-block file: on close the index is serialized into a chain of
//! blocks rooted at offset 0, so the file is self-contained and reopens
//! with no sidecar.
//!
//! ## File layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Block 0: head of the index chain (OID 0)     │
//! ├──────────────────────────────────────────────┤
//! │ 256-byte blocks, in any order:               │
//! │  - payload blocks of exactly one object      │
//! │  - continuation blocks of the index chain    │
//! │  - free blocks (listed in the free set)      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Objects are created, overwritten, read and deleted through
//! [`ObjectStore`]; [`ObjectStream`] presents a single object as a seekable
//! byte stream even though its payload is physically scattered across
//! non-contiguous blocks. Freed blocks are reused before the file grows,
//! and the file is compacted and truncated on close.
//!
//! The store is single-writer: every operation serializes through one
//! lock. There is no journal; crash consistency is out of scope.
//!
//! ## Example
//!
//! ```no_run
//! use capsule::ObjectStore;
//!
//! let store = ObjectStore::open("data.cap", false)?;
//! let oid = store.new_oid()?;
//! store.write(oid, b"hello")?;
//! assert_eq!(store.read(oid)?.as_deref(), Some(&b"hello"[..]));
//! store.close()?;
//! # Ok::<(), capsule::StoreError>(())
//! ```

pub mod error;
pub mod freespace;
pub mod index;
pub mod io;
pub mod store;
pub mod stream;

mod alloc;
mod codec;

pub use error::{Result, StoreError};
pub use freespace::FreeSpace;
pub use index::{ObjectBlock, ObjectIndex};
pub use io::BlockFile;
pub use store::{ObjectStore, SaveHook, StoreCore, StoreStats};
pub use stream::{ObjectStream, SeekOrigin};

/// Size of one file block in bytes.
pub const BLOCK_SIZE: usize = 256;

/// OID reserved for the on-file index chain.
pub const INDEX_OID: i64 = 0;

/// OID of the application root object.
pub const ROOT_OID: i64 = 1;
