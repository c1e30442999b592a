//! Storage trait definitions
//!
//! Every read-modify-write in the operator happens inside a [`StoreTx`]. A
//! transaction sees a consistent snapshot, its writes become visible only on
//! [`StoreTx::commit`], and dropping it without committing rolls back.
//! Transactions are serialized, so selecting and marking keyshares inside one
//! transaction cannot race with another caller.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Network;
use crate::models::{
    CooperativeExit, DepositAddress, PreimageRequest, SigningKeyshare, Transfer, TransferLeaf,
    TreeNode,
};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Transactional store
///
/// Implementations:
/// - `MemoryStore` - in-process tables behind a single lock
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a transaction, waiting for any in-flight transaction to finish
    async fn begin(&self) -> StorageResult<Box<dyn StoreTx>>;
}

/// An open transaction
pub trait StoreTx: Send {
    fn get_keyshare(&self, id: &Uuid) -> StorageResult<Option<SigningKeyshare>>;

    fn insert_keyshare(&mut self, keyshare: SigningKeyshare) -> StorageResult<()>;

    fn update_keyshare(&mut self, keyshare: SigningKeyshare) -> StorageResult<()>;

    /// Available keyshares of one coordinator's pool, ordered by id
    fn available_keyshares(
        &self,
        coordinator_index: u32,
        limit: usize,
    ) -> StorageResult<Vec<SigningKeyshare>>;

    fn count_available_keyshares(&self, coordinator_index: u32) -> StorageResult<usize>;

    fn get_deposit_address(&self, keyshare_id: &Uuid) -> StorageResult<Option<DepositAddress>>;

    fn deposit_address_by_address(&self, address: &str) -> StorageResult<Option<DepositAddress>>;

    fn insert_deposit_address(&mut self, deposit: DepositAddress) -> StorageResult<()>;

    fn get_tree_node(&self, id: &Uuid) -> StorageResult<Option<TreeNode>>;

    /// The tree node signing with a keyshare, if any
    fn tree_node_by_keyshare(&self, keyshare_id: &Uuid) -> StorageResult<Option<TreeNode>>;

    fn insert_tree_node(&mut self, node: TreeNode) -> StorageResult<()>;

    fn update_tree_node(&mut self, node: TreeNode) -> StorageResult<()>;

    fn get_transfer(&self, id: &Uuid) -> StorageResult<Option<Transfer>>;

    fn insert_transfer(&mut self, transfer: Transfer) -> StorageResult<()>;

    fn update_transfer(&mut self, transfer: Transfer) -> StorageResult<()>;

    fn transfers_by_sender(&self, sender_identity_pubkey: &[u8]) -> StorageResult<Vec<Transfer>>;

    fn transfers_by_receiver(
        &self,
        receiver_identity_pubkey: &[u8],
    ) -> StorageResult<Vec<Transfer>>;

    /// Leaves of a transfer ordered by leaf id
    fn transfer_leaves(&self, transfer_id: &Uuid) -> StorageResult<Vec<TransferLeaf>>;

    fn insert_transfer_leaf(&mut self, leaf: TransferLeaf) -> StorageResult<()>;

    fn update_transfer_leaf(&mut self, leaf: TransferLeaf) -> StorageResult<()>;

    fn get_cooperative_exit(&self, transfer_id: &Uuid) -> StorageResult<Option<CooperativeExit>>;

    fn upsert_cooperative_exit(&mut self, exit: CooperativeExit) -> StorageResult<()>;

    /// Cooperative exits waiting on the given exit transaction
    fn cooperative_exits_by_txid(&self, exit_txid: &[u8; 32])
        -> StorageResult<Vec<CooperativeExit>>;

    fn get_preimage_request(&self, transfer_id: &Uuid) -> StorageResult<Option<PreimageRequest>>;

    fn upsert_preimage_request(&mut self, request: PreimageRequest) -> StorageResult<()>;

    fn block_height(&self, network: Network) -> StorageResult<Option<u64>>;

    fn set_block_height(&mut self, network: Network, height: u64) -> StorageResult<()>;

    /// Make all writes visible
    fn commit(self: Box<Self>) -> StorageResult<()>;
}
