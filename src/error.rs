use thiserror::Error;

/// Every fallible operation in this crate returns this error type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced across the `nandkv` public API.
///
/// Variants correspond one-to-one with the error-kind table in the design
/// doc: device I/O failures, the metadata "must format" signature mismatch,
/// the sticky read-only transition, and the ordinary `NotFound` miss.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("meta partition signature missing or invalid; run format()")]
    MustFormat,

    #[error("data partition exhausted: no free page available")]
    NoSpace,

    #[error("key not found")]
    NotFound,

    #[error("mark_vpage_invalid called on virtual page {vpage} which was not VALID")]
    AlreadyInvalid { vpage: u32 },

    #[error("create_mapping_multipage on vpage {vpage} not permitted: a later page is already mapped")]
    NotPermitted { vpage: u32 },

    #[error("record of {size} bytes exceeds store capacity of {capacity} bytes")]
    RecordTooLarge { size: u64, capacity: u64 },

    #[error("page read at pp {pp} failed: {source}")]
    IoRead {
        pp: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("page write at pp {pp} failed: {source}")]
    IoWrite {
        pp: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("erase of block {block} failed: {source}")]
    IoErase {
        block: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("scratch allocation for bitmap/mapper failed: {0}")]
    AllocFail(String),

    #[error("invalid partition geometry: {0}")]
    InvalidGeometry(String),

    #[error("partition is read-only")]
    ReadOnly,
}
