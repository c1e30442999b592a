//! Transactional storage for keyshares, leaves and transfers

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{StorageError, StorageResult, Store, StoreTx};
