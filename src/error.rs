use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object {0} not found")]
    NotFound(i64),

    #[error("object {0} already present in index")]
    DuplicateOid(i64),

    #[error("object identifier space exhausted")]
    CapacityExhausted,

    #[error("seek moved before the start of the stream")]
    UnexpectedEof,

    #[error("payload of {0} bytes exceeds the maximum object size")]
    PayloadTooLarge(usize),

    #[error("store was opened read-only")]
    ReadOnly,

    #[error("index corrupted: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
