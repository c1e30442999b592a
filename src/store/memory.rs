//! In-memory store
//!
//! Tables live behind one async mutex. A transaction holds the lock for its
//! whole lifetime and works on a copy of the tables; commit writes the copy
//! back, drop discards it.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::traits::{StorageError, StorageResult, Store, StoreTx};
use crate::config::Network;
use crate::models::{
    CooperativeExit, DepositAddress, KeyshareStatus, PreimageRequest, SigningKeyshare, Transfer,
    TransferLeaf, TreeNode,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    keyshares: BTreeMap<Uuid, SigningKeyshare>,
    deposit_addresses: BTreeMap<Uuid, DepositAddress>,
    tree_nodes: BTreeMap<Uuid, TreeNode>,
    transfers: BTreeMap<Uuid, Transfer>,
    transfer_leaves: BTreeMap<Uuid, TransferLeaf>,
    cooperative_exits: BTreeMap<Uuid, CooperativeExit>,
    preimage_requests: BTreeMap<Uuid, PreimageRequest>,
    block_heights: HashMap<Network, u64>,
}

/// In-memory [`Store`] for tests and single-process deployments
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> StorageResult<Box<dyn StoreTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

fn insert_new<V>(
    table: &mut BTreeMap<Uuid, V>,
    id: Uuid,
    value: V,
    kind: &str,
) -> StorageResult<()> {
    if table.contains_key(&id) {
        return Err(StorageError::Duplicate(format!("{} {}", kind, id)));
    }
    table.insert(id, value);
    Ok(())
}

fn replace<V>(table: &mut BTreeMap<Uuid, V>, id: Uuid, value: V, kind: &str) -> StorageResult<()> {
    if !table.contains_key(&id) {
        return Err(StorageError::NotFound(format!("{} {}", kind, id)));
    }
    table.insert(id, value);
    Ok(())
}

impl StoreTx for MemoryTx {
    fn get_keyshare(&self, id: &Uuid) -> StorageResult<Option<SigningKeyshare>> {
        Ok(self.working.keyshares.get(id).cloned())
    }

    fn insert_keyshare(&mut self, keyshare: SigningKeyshare) -> StorageResult<()> {
        insert_new(&mut self.working.keyshares, keyshare.id, keyshare, "keyshare")
    }

    fn update_keyshare(&mut self, keyshare: SigningKeyshare) -> StorageResult<()> {
        replace(&mut self.working.keyshares, keyshare.id, keyshare, "keyshare")
    }

    fn available_keyshares(
        &self,
        coordinator_index: u32,
        limit: usize,
    ) -> StorageResult<Vec<SigningKeyshare>> {
        Ok(self
            .working
            .keyshares
            .values()
            .filter(|k| {
                k.status == KeyshareStatus::Available && k.coordinator_index == coordinator_index
            })
            .take(limit)
            .cloned()
            .collect())
    }

    fn count_available_keyshares(&self, coordinator_index: u32) -> StorageResult<usize> {
        Ok(self
            .working
            .keyshares
            .values()
            .filter(|k| {
                k.status == KeyshareStatus::Available && k.coordinator_index == coordinator_index
            })
            .count())
    }

    fn get_deposit_address(&self, keyshare_id: &Uuid) -> StorageResult<Option<DepositAddress>> {
        Ok(self.working.deposit_addresses.get(keyshare_id).cloned())
    }

    fn deposit_address_by_address(&self, address: &str) -> StorageResult<Option<DepositAddress>> {
        Ok(self
            .working
            .deposit_addresses
            .values()
            .find(|d| d.address == address)
            .cloned())
    }

    fn insert_deposit_address(&mut self, deposit: DepositAddress) -> StorageResult<()> {
        insert_new(
            &mut self.working.deposit_addresses,
            deposit.keyshare_id,
            deposit,
            "deposit address",
        )
    }

    fn get_tree_node(&self, id: &Uuid) -> StorageResult<Option<TreeNode>> {
        Ok(self.working.tree_nodes.get(id).cloned())
    }

    fn tree_node_by_keyshare(&self, keyshare_id: &Uuid) -> StorageResult<Option<TreeNode>> {
        Ok(self
            .working
            .tree_nodes
            .values()
            .find(|n| n.signing_keyshare_id == *keyshare_id)
            .cloned())
    }

    fn insert_tree_node(&mut self, node: TreeNode) -> StorageResult<()> {
        insert_new(&mut self.working.tree_nodes, node.id, node, "tree node")
    }

    fn update_tree_node(&mut self, node: TreeNode) -> StorageResult<()> {
        replace(&mut self.working.tree_nodes, node.id, node, "tree node")
    }

    fn get_transfer(&self, id: &Uuid) -> StorageResult<Option<Transfer>> {
        Ok(self.working.transfers.get(id).cloned())
    }

    fn insert_transfer(&mut self, transfer: Transfer) -> StorageResult<()> {
        insert_new(&mut self.working.transfers, transfer.id, transfer, "transfer")
    }

    fn update_transfer(&mut self, transfer: Transfer) -> StorageResult<()> {
        replace(&mut self.working.transfers, transfer.id, transfer, "transfer")
    }

    fn transfers_by_sender(&self, sender_identity_pubkey: &[u8]) -> StorageResult<Vec<Transfer>> {
        Ok(self
            .working
            .transfers
            .values()
            .filter(|t| t.sender_identity_pubkey == sender_identity_pubkey)
            .cloned()
            .collect())
    }

    fn transfers_by_receiver(
        &self,
        receiver_identity_pubkey: &[u8],
    ) -> StorageResult<Vec<Transfer>> {
        Ok(self
            .working
            .transfers
            .values()
            .filter(|t| t.receiver_identity_pubkey == receiver_identity_pubkey)
            .cloned()
            .collect())
    }

    fn transfer_leaves(&self, transfer_id: &Uuid) -> StorageResult<Vec<TransferLeaf>> {
        let mut leaves: Vec<TransferLeaf> = self
            .working
            .transfer_leaves
            .values()
            .filter(|l| l.transfer_id == *transfer_id)
            .cloned()
            .collect();
        leaves.sort_by_key(|l| l.leaf_id);
        Ok(leaves)
    }

    fn insert_transfer_leaf(&mut self, leaf: TransferLeaf) -> StorageResult<()> {
        insert_new(&mut self.working.transfer_leaves, leaf.id, leaf, "transfer leaf")
    }

    fn update_transfer_leaf(&mut self, leaf: TransferLeaf) -> StorageResult<()> {
        replace(&mut self.working.transfer_leaves, leaf.id, leaf, "transfer leaf")
    }

    fn get_cooperative_exit(&self, transfer_id: &Uuid) -> StorageResult<Option<CooperativeExit>> {
        Ok(self.working.cooperative_exits.get(transfer_id).cloned())
    }

    fn upsert_cooperative_exit(&mut self, exit: CooperativeExit) -> StorageResult<()> {
        self.working.cooperative_exits.insert(exit.transfer_id, exit);
        Ok(())
    }

    fn cooperative_exits_by_txid(
        &self,
        exit_txid: &[u8; 32],
    ) -> StorageResult<Vec<CooperativeExit>> {
        Ok(self
            .working
            .cooperative_exits
            .values()
            .filter(|e| e.exit_txid == *exit_txid)
            .cloned()
            .collect())
    }

    fn get_preimage_request(&self, transfer_id: &Uuid) -> StorageResult<Option<PreimageRequest>> {
        Ok(self.working.preimage_requests.get(transfer_id).cloned())
    }

    fn upsert_preimage_request(&mut self, request: PreimageRequest) -> StorageResult<()> {
        self.working
            .preimage_requests
            .insert(request.transfer_id, request);
        Ok(())
    }

    fn block_height(&self, network: Network) -> StorageResult<Option<u64>> {
        Ok(self.working.block_heights.get(&network).copied())
    }

    fn set_block_height(&mut self, network: Network, height: u64) -> StorageResult<()> {
        self.working.block_heights.insert(network, height);
        Ok(())
    }

    fn commit(self: Box<Self>) -> StorageResult<()> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
