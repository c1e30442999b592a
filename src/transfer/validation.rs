//! Checks shared by the transfer handlers

use bitcoin::Transaction;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use super::TransferError;
use crate::config::Network;
use crate::error::OperatorError;
use crate::models::{
    PreimageRequestStatus, Transfer, TransferLeaf, TransferStatus, TransferType, TreeNode,
    TreeNodeStatus,
};
use crate::store::StoreTx;
use crate::tx;

/// Confirmations a cooperative exit needs before the sender tweak applies
pub const EXIT_CONFIRMATIONS: u64 = 6;

/// Bytes the sender signs for each leaf: `leaf_id || transfer_id || secret_cipher`
pub fn sender_signature_message(leaf_id: &Uuid, transfer_id: &Uuid, secret_cipher: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(32 + secret_cipher.len());
    message.extend_from_slice(leaf_id.as_bytes());
    message.extend_from_slice(transfer_id.as_bytes());
    message.extend_from_slice(secret_cipher);
    message
}

pub(crate) fn load_transfer(tx: &dyn StoreTx, id: &Uuid) -> Result<Transfer, OperatorError> {
    Ok(tx
        .get_transfer(id)?
        .ok_or(TransferError::TransferNotFound(*id))?)
}

pub(crate) fn load_leaf(tx: &dyn StoreTx, id: &Uuid) -> Result<TreeNode, OperatorError> {
    Ok(tx.get_tree_node(id)?.ok_or(TransferError::LeafNotFound(*id))?)
}

pub(crate) fn require_status(transfer: &Transfer, expected: TransferStatus) -> Result<(), TransferError> {
    if transfer.status != expected {
        return Err(TransferError::unexpected(transfer.id, transfer.status, expected));
    }
    Ok(())
}

pub(crate) fn require_sender(transfer: &Transfer, sender: &[u8]) -> Result<(), TransferError> {
    if transfer.sender_identity_pubkey != sender {
        return Err(TransferError::IdentityMismatch(transfer.id));
    }
    Ok(())
}

pub(crate) fn require_receiver(transfer: &Transfer, receiver: &[u8]) -> Result<(), TransferError> {
    if transfer.receiver_identity_pubkey != receiver {
        return Err(TransferError::IdentityMismatch(transfer.id));
    }
    Ok(())
}

pub(crate) fn require_not_expired(transfer: &Transfer, now: DateTime<Utc>) -> Result<(), TransferError> {
    if transfer.is_expired_at(now) {
        return Err(TransferError::Expired(transfer.id));
    }
    Ok(())
}

pub(crate) fn validate_expiry(
    expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), TransferError> {
    match expiry {
        Some(expiry) if expiry <= now => Err(TransferError::InvalidExpiry),
        _ => Ok(()),
    }
}

pub(crate) fn require_unique(leaf_ids: &[Uuid]) -> Result<(), TransferError> {
    let mut seen = HashSet::new();
    for id in leaf_ids {
        if !seen.insert(*id) {
            return Err(TransferError::DuplicateLeaf(*id));
        }
    }
    Ok(())
}

/// Pair the requested leaf ids with the transfer's stored leaves
///
/// The request must name every leaf of the transfer exactly once.
pub(crate) fn match_transfer_leaves(
    transfer_id: Uuid,
    stored: Vec<TransferLeaf>,
    requested: &[Uuid],
) -> Result<BTreeMap<Uuid, TransferLeaf>, TransferError> {
    require_unique(requested)?;
    if stored.len() != requested.len() {
        return Err(TransferError::LeafMismatch {
            transfer_id,
            reason: format!(
                "request has {} leaves, transfer has {}",
                requested.len(),
                stored.len()
            ),
        });
    }
    let by_leaf: BTreeMap<Uuid, TransferLeaf> =
        stored.into_iter().map(|l| (l.leaf_id, l)).collect();
    if let Some(unknown) = requested.iter().find(|id| !by_leaf.contains_key(id)) {
        return Err(TransferError::LeafMismatch {
            transfer_id,
            reason: format!("leaf {} is not part of the transfer", unknown),
        });
    }
    Ok(by_leaf)
}

/// A leaf can be sent when it is Available, or destination-locked to the
/// same receiver, and owned by the sender
pub(crate) fn check_leaf_transferable(
    leaf: &TreeNode,
    sender: &[u8],
    receiver: &[u8],
) -> Result<(), TransferError> {
    let available = match leaf.status {
        TreeNodeStatus::Available => true,
        TreeNodeStatus::DestinationLock => {
            leaf.destination_lock_identity_pubkey.as_deref() == Some(receiver)
        }
        _ => false,
    };
    if !available {
        return Err(TransferError::LeafNotAvailable(leaf.id));
    }
    if leaf.owner_identity_pubkey != sender {
        return Err(TransferError::NotLeafOwner(leaf.id));
    }
    Ok(())
}

/// Leaf must be locked by a transfer and still owned by `owner`
pub(crate) fn check_leaf_locked(leaf: &TreeNode, owner: &[u8]) -> Result<(), TransferError> {
    if leaf.status != TreeNodeStatus::TransferLocked {
        return Err(TransferError::LeafNotAvailable(leaf.id));
    }
    if leaf.owner_identity_pubkey != owner {
        return Err(TransferError::NotLeafOwner(leaf.id));
    }
    Ok(())
}

/// Which way a new refund's timelock must relate to the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimelockRule {
    /// Sender's refund to the receiver must be strictly earlier
    Decrease,
    /// Receiver's own refund may not be later
    NotIncrease,
}

/// Check a new refund against the leaf's current refund
pub(crate) fn validate_refund(
    leaf_id: Uuid,
    current: &Transaction,
    refund: &Transaction,
    receiver_identity: &[u8],
    expected_inputs: usize,
    rule: TimelockRule,
) -> Result<(), OperatorError> {
    if refund.output.len() != 1 {
        return Err(TransferError::refund(
            leaf_id,
            format!("expected 1 output, found {}", refund.output.len()),
        )
        .into());
    }
    let receiver_script = tx::p2tr_script(receiver_identity)?;
    if refund.output[0].script_pubkey != receiver_script {
        return Err(TransferError::refund(leaf_id, "output does not pay the receiver").into());
    }
    if refund.input.len() != expected_inputs {
        return Err(TransferError::refund(
            leaf_id,
            format!(
                "expected {} inputs, found {}",
                expected_inputs,
                refund.input.len()
            ),
        )
        .into());
    }

    let current_outpoint = current
        .input
        .first()
        .ok_or(tx::TxError::MissingInput(0))?
        .previous_output;
    if refund.input[0].previous_output != current_outpoint {
        return Err(TransferError::refund(
            leaf_id,
            "input 0 does not spend the leaf's current refund outpoint",
        )
        .into());
    }

    let old_timelock = tx::timelock(current)?;
    let new_timelock = tx::timelock(refund)?;
    let ok = match rule {
        TimelockRule::Decrease => new_timelock < old_timelock,
        TimelockRule::NotIncrease => new_timelock <= old_timelock,
    };
    if !ok {
        return Err(TransferError::refund(
            leaf_id,
            format!(
                "timelock {} not below current timelock {}",
                new_timelock, old_timelock
            ),
        )
        .into());
    }
    Ok(())
}

/// Refund inputs expected for a transfer type
pub(crate) fn refund_inputs(transfer_type: TransferType) -> usize {
    match transfer_type {
        TransferType::CooperativeExit => 2,
        _ => 1,
    }
}

/// The connector transaction of a cooperative exit
pub(crate) fn connector_tx(
    tx: &dyn StoreTx,
    transfer: &Transfer,
) -> Result<Option<Transaction>, OperatorError> {
    if transfer.transfer_type != TransferType::CooperativeExit {
        return Ok(None);
    }
    let exit = tx.get_cooperative_exit(&transfer.id)?.ok_or_else(|| {
        OperatorError::NotFound(format!("cooperative exit for transfer {}", transfer.id))
    })?;
    Ok(Some(tx::parse_tx(&exit.connector_tx)?))
}

/// Sighash of a refund spending the leaf output
pub(crate) fn refund_sighash(
    leaf: &TreeNode,
    refund: &Transaction,
    connector: Option<&Transaction>,
) -> Result<[u8; 32], OperatorError> {
    let node_tx = tx::parse_tx(&leaf.raw_tx)?;
    let prevouts = tx::refund_prevouts(refund, &node_tx, connector)?;
    Ok(tx::key_spend_sighash(refund, &prevouts)?)
}

/// Whether a cooperative exit has enough confirmations; no exit counts as confirmed
pub(crate) fn exit_confirmed(
    tx: &dyn StoreTx,
    transfer_id: &Uuid,
    network: Network,
) -> Result<bool, OperatorError> {
    let Some(exit) = tx.get_cooperative_exit(transfer_id)? else {
        return Ok(true);
    };
    let Some(confirmed_at) = exit.confirmation_height else {
        return Ok(false);
    };
    let height = tx.block_height(network)?.unwrap_or(0);
    Ok(confirmed_at + EXIT_CONFIRMATIONS - 1 <= height)
}

/// Whether the sender's tweak may be applied now rather than stored
pub(crate) fn sender_tweak_gate_open(
    tx: &dyn StoreTx,
    transfer: &Transfer,
    network: Network,
) -> Result<bool, OperatorError> {
    match transfer.transfer_type {
        TransferType::Transfer | TransferType::Swap | TransferType::CounterSwap => Ok(true),
        TransferType::CooperativeExit => {
            if tx.get_cooperative_exit(&transfer.id)?.is_none() {
                return Err(OperatorError::NotFound(format!(
                    "cooperative exit for transfer {}",
                    transfer.id
                )));
            }
            exit_confirmed(tx, &transfer.id, network)
        }
        TransferType::PreimageSwap => {
            let request = tx.get_preimage_request(&transfer.id)?.ok_or_else(|| {
                OperatorError::NotFound(format!("preimage request for transfer {}", transfer.id))
            })?;
            Ok(request.status == PreimageRequestStatus::PreimageShared)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use crate::models::{CooperativeExit, PreimageRequest};
    use crate::store::{MemoryStore, Store};
    use bitcoin::OutPoint;

    fn key(seed: u8) -> Vec<u8> {
        keys::public_key_from_private_key(&[seed; 32]).unwrap()
    }

    fn leaf_txs(timelock: u16) -> (Transaction, Transaction) {
        let node = tx::node_transaction(OutPoint::null(), 10_000, &key(1)).unwrap();
        let refund = tx::refund_transaction(node.compute_txid(), 10_000, &key(2), timelock).unwrap();
        (node, refund)
    }

    fn transfer(transfer_type: TransferType) -> Transfer {
        Transfer {
            id: Uuid::new_v4(),
            sender_identity_pubkey: key(2),
            receiver_identity_pubkey: key(3),
            total_value: 10_000,
            expiry_time: None,
            completion_time: None,
            transfer_type,
            status: TransferStatus::SenderInitiated,
        }
    }

    #[test]
    fn test_refund_rules() {
        let (node, current) = leaf_txs(2000);
        let receiver = key(3);
        let leaf_id = Uuid::new_v4();

        let good = tx::refund_transaction(node.compute_txid(), 10_000, &receiver, 1900).unwrap();
        validate_refund(leaf_id, &current, &good, &receiver, 1, TimelockRule::Decrease).unwrap();

        // same timelock is not a decrease
        let same = tx::refund_transaction(node.compute_txid(), 10_000, &receiver, 2000).unwrap();
        assert!(validate_refund(leaf_id, &current, &same, &receiver, 1, TimelockRule::Decrease).is_err());
        validate_refund(leaf_id, &current, &same, &receiver, 1, TimelockRule::NotIncrease).unwrap();

        let wrong_receiver =
            tx::refund_transaction(node.compute_txid(), 10_000, &key(9), 1900).unwrap();
        let err = validate_refund(leaf_id, &current, &wrong_receiver, &receiver, 1, TimelockRule::Decrease)
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_REFUND");

        let mut other_outpoint = good.clone();
        other_outpoint.input[0].previous_output.vout = 1;
        assert!(validate_refund(leaf_id, &current, &other_outpoint, &receiver, 1, TimelockRule::Decrease)
            .is_err());

        assert!(validate_refund(leaf_id, &current, &good, &receiver, 2, TimelockRule::Decrease).is_err());
    }

    #[test]
    fn test_leaf_transferable() {
        let (node, refund) = leaf_txs(2000);
        let mut leaf = TreeNode {
            id: Uuid::new_v4(),
            tree_id: Uuid::new_v4(),
            parent_id: None,
            value: 10_000,
            status: TreeNodeStatus::Available,
            verifying_pubkey: key(1),
            owner_identity_pubkey: key(2),
            owner_signing_pubkey: key(4),
            signing_keyshare_id: Uuid::new_v4(),
            raw_tx: tx::serialize_tx(&node),
            raw_refund_tx: tx::serialize_tx(&refund),
            destination_lock_identity_pubkey: None,
        };
        check_leaf_transferable(&leaf, &key(2), &key(3)).unwrap();
        assert!(matches!(
            check_leaf_transferable(&leaf, &key(5), &key(3)),
            Err(TransferError::NotLeafOwner(_))
        ));

        leaf.status = TreeNodeStatus::DestinationLock;
        leaf.destination_lock_identity_pubkey = Some(key(3));
        check_leaf_transferable(&leaf, &key(2), &key(3)).unwrap();
        assert!(matches!(
            check_leaf_transferable(&leaf, &key(2), &key(6)),
            Err(TransferError::LeafNotAvailable(_))
        ));

        leaf.status = TreeNodeStatus::TransferLocked;
        assert!(check_leaf_transferable(&leaf, &key(2), &key(3)).is_err());
        check_leaf_locked(&leaf, &key(2)).unwrap();
    }

    #[test]
    fn test_match_transfer_leaves() {
        let transfer_id = Uuid::new_v4();
        let leaf_ids = [Uuid::new_v4(), Uuid::new_v4()];
        let stored: Vec<TransferLeaf> = leaf_ids
            .iter()
            .map(|leaf_id| TransferLeaf {
                id: Uuid::new_v4(),
                transfer_id,
                leaf_id: *leaf_id,
                previous_refund_tx: Vec::new(),
                intermediate_refund_tx: Vec::new(),
                secret_cipher: None,
                signature: None,
                key_tweak: None,
                sender_key_tweak_proof: None,
                receiver_refund_tx: None,
            })
            .collect();

        let matched = match_transfer_leaves(transfer_id, stored.clone(), &leaf_ids).unwrap();
        assert_eq!(matched.len(), 2);
        assert!(matches!(
            match_transfer_leaves(transfer_id, stored.clone(), &leaf_ids[..1]),
            Err(TransferError::LeafMismatch { .. })
        ));
        assert!(matches!(
            match_transfer_leaves(transfer_id, stored.clone(), &[leaf_ids[0], leaf_ids[0]]),
            Err(TransferError::DuplicateLeaf(_))
        ));
        assert!(matches!(
            match_transfer_leaves(transfer_id, stored, &[leaf_ids[0], Uuid::new_v4()]),
            Err(TransferError::LeafMismatch { .. })
        ));
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        validate_expiry(None, now).unwrap();
        validate_expiry(Some(now + chrono::Duration::minutes(10)), now).unwrap();
        assert!(matches!(
            validate_expiry(Some(now - chrono::Duration::seconds(1)), now),
            Err(TransferError::InvalidExpiry)
        ));
    }

    #[tokio::test]
    async fn test_tweak_gate() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();

        let plain = transfer(TransferType::Transfer);
        assert!(sender_tweak_gate_open(tx.as_ref(), &plain, Network::Regtest).unwrap());

        let exit = transfer(TransferType::CooperativeExit);
        assert!(sender_tweak_gate_open(tx.as_ref(), &exit, Network::Regtest).is_err());
        tx.upsert_cooperative_exit(CooperativeExit {
            transfer_id: exit.id,
            exit_txid: [7; 32],
            connector_tx: Vec::new(),
            confirmation_height: None,
        })
        .unwrap();
        assert!(!sender_tweak_gate_open(tx.as_ref(), &exit, Network::Regtest).unwrap());

        tx.upsert_cooperative_exit(CooperativeExit {
            transfer_id: exit.id,
            exit_txid: [7; 32],
            connector_tx: Vec::new(),
            confirmation_height: Some(100),
        })
        .unwrap();
        tx.set_block_height(Network::Regtest, 104).unwrap();
        assert!(!sender_tweak_gate_open(tx.as_ref(), &exit, Network::Regtest).unwrap());
        tx.set_block_height(Network::Regtest, 105).unwrap();
        assert!(sender_tweak_gate_open(tx.as_ref(), &exit, Network::Regtest).unwrap());

        let swap = transfer(TransferType::PreimageSwap);
        tx.upsert_preimage_request(PreimageRequest {
            transfer_id: swap.id,
            status: PreimageRequestStatus::WaitingForPreimage,
        })
        .unwrap();
        assert!(!sender_tweak_gate_open(tx.as_ref(), &swap, Network::Regtest).unwrap());
        tx.upsert_preimage_request(PreimageRequest {
            transfer_id: swap.id,
            status: PreimageRequestStatus::PreimageShared,
        })
        .unwrap();
        assert!(sender_tweak_gate_open(tx.as_ref(), &swap, Network::Regtest).unwrap());
    }

    #[test]
    fn test_sender_signature_message_layout() {
        let leaf_id = Uuid::new_v4();
        let transfer_id = Uuid::new_v4();
        let message = sender_signature_message(&leaf_id, &transfer_id, &[0xab, 0xcd]);
        assert_eq!(message.len(), 34);
        assert_eq!(&message[..16], leaf_id.as_bytes());
        assert_eq!(&message[16..32], transfer_id.as_bytes());
        assert_eq!(&message[32..], &[0xab, 0xcd]);
    }
}
