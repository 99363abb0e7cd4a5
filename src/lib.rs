//! `nandkv`: a log-structured key-value store over a pair of page-addressable,
//! block-erasable partitions (a META partition carrying the page-state
//! bitmap and virtual-to-physical mapper, and a DATA partition carrying the
//! actual records).
//!
//! Records are placed by a DJB2 hash of the key with linear probing over
//! virtual pages, framed as a head page plus zero or more continuation
//! pages, and reclaimed by a block-granularity garbage collector that
//! migrates live pages before erasing.
//!
//! See [`engine::Engine`] for the mount/format/set/get/delete surface.

pub mod bitmap;
pub mod cache;
pub mod device;
pub mod engine;
pub mod error;
pub mod gc;
pub mod mapper;
pub mod metadata;
pub mod page_manager;
pub mod record;

pub use device::{Completion, FilePartition, MemPartition, PartitionDevice, PartitionGeometry};
pub use engine::{Engine, EngineConfig};
pub use error::{Result, StoreError};
