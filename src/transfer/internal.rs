//! Per-operator transfer steps
//!
//! The coordinating operator replicates each step of a transfer to every
//! operator (itself included) through these handlers. Each one validates the
//! step against local state and commits it in a single store transaction.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::validation::{
    check_leaf_locked, check_leaf_transferable, connector_tx, exit_confirmed, load_leaf,
    load_transfer, match_transfer_leaves, refund_inputs, require_not_expired, require_receiver,
    require_sender, require_status, require_unique, sender_signature_message,
    sender_tweak_gate_open, validate_expiry, validate_refund, TimelockRule,
};
use super::TransferError;
use crate::error::OperatorError;
use crate::keys;
use crate::keyshare::{apply_keyshare_tweak, tweak_keyshare, validate_key_tweak, KeyshareError};
use crate::logging::log_transfer_event;
use crate::models::{
    CooperativeExit, KeyTweak, PreimageRequest, PreimageRequestStatus, SigningKeyshare, Transfer,
    TransferLeaf, TransferStatus, TransferType, TreeNode, TreeNodeStatus,
};
use crate::node::OperatorNode;
use crate::store::StoreTx;
use crate::tx;
use crate::types::{
    AckResponse, ApplySenderKeyTweakRequest, CompleteTransferRequest, CooperativeExitInfo,
    InitiateSettleReceiverKeyTweakRequest, InitiateTransferRequest, ReclaimTransferRequest,
    RecordReceiverRefundsRequest, SettleAction, SettleReceiverKeyTweakRequest, SignedLeafRefund,
    StartTransferRequest, TransferResponse, TransferView,
};

fn ack(node: &OperatorNode) -> AckResponse {
    AckResponse {
        identifier: node.identifier(),
    }
}

fn logged(transfer: &Transfer, event: &str) {
    log_transfer_event(event, &transfer.id.to_string(), transfer.status.as_str(), None);
}

/// A replayed creation must describe exactly the stored transfer
fn is_same_transfer(
    tx: &dyn StoreTx,
    existing: &Transfer,
    request: &StartTransferRequest,
    transfer_type: TransferType,
) -> Result<bool, OperatorError> {
    if existing.status != TransferStatus::SenderInitiated
        || existing.sender_identity_pubkey != *request.sender_identity_public_key
        || existing.receiver_identity_pubkey != *request.receiver_identity_public_key
        || existing.transfer_type != transfer_type
        || existing.expiry_time != request.expiry_time
    {
        return Ok(false);
    }
    let stored: BTreeMap<Uuid, Vec<u8>> = tx
        .transfer_leaves(&existing.id)?
        .into_iter()
        .map(|l| (l.leaf_id, l.intermediate_refund_tx))
        .collect();
    let requested: BTreeMap<Uuid, Vec<u8>> = request
        .leaves
        .iter()
        .map(|l| (l.leaf_id, l.raw_refund_tx.to_vec()))
        .collect();
    Ok(stored == requested)
}

/// Validate a new transfer and write it, locking its leaves
///
/// Returns the transfer and its leaves in request order. An identical replay
/// of an existing transfer returns the stored records unchanged.
pub(crate) fn create_transfer(
    tx: &mut dyn StoreTx,
    request: &StartTransferRequest,
    exit: Option<&CooperativeExitInfo>,
    now: DateTime<Utc>,
) -> Result<(Transfer, Vec<TreeNode>), OperatorError> {
    let transfer_type = match exit {
        Some(_) => TransferType::CooperativeExit,
        None if request.transfer_type == TransferType::CooperativeExit => {
            return Err(OperatorError::Validation(
                "cooperative exit requires the exit transaction".to_string(),
            ))
        }
        None => request.transfer_type,
    };
    if request.leaves.is_empty() {
        return Err(OperatorError::Validation("transfer has no leaves".to_string()));
    }
    let sender = request.sender_identity_public_key.to_vec();
    let receiver = request.receiver_identity_public_key.to_vec();
    keys::parse_public_key(&sender)?;
    keys::parse_public_key(&receiver)?;
    let leaf_ids: Vec<Uuid> = request.leaves.iter().map(|l| l.leaf_id).collect();
    require_unique(&leaf_ids)?;

    if let Some(existing) = tx.get_transfer(&request.transfer_id)? {
        if !is_same_transfer(tx, &existing, request, transfer_type)? {
            return Err(TransferError::AlreadyExists(existing.id).into());
        }
        let leaves = leaf_ids
            .iter()
            .map(|id| load_leaf(tx, id))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok((existing, leaves));
    }

    validate_expiry(request.expiry_time, now)?;
    let connector = exit
        .map(|e| tx::parse_tx(&e.connector_tx))
        .transpose()?;

    let mut total_value: u64 = 0;
    let mut leaves = Vec::with_capacity(request.leaves.len());
    for leaf_refund in &request.leaves {
        let leaf = load_leaf(tx, &leaf_refund.leaf_id)?;
        check_leaf_transferable(&leaf, &sender, &receiver)?;

        let current = tx::parse_tx(&leaf.raw_refund_tx)?;
        let refund = tx::parse_tx(&leaf_refund.raw_refund_tx)?;
        validate_refund(
            leaf.id,
            &current,
            &refund,
            &receiver,
            refund_inputs(transfer_type),
            TimelockRule::Decrease,
        )?;
        if let Some(connector) = &connector {
            let node_tx = tx::parse_tx(&leaf.raw_tx)?;
            tx::refund_prevouts(&refund, &node_tx, Some(connector))
                .map_err(|e| TransferError::refund(leaf.id, e.to_string()))?;
        }

        total_value = total_value
            .checked_add(leaf.value)
            .ok_or_else(|| OperatorError::Validation("total value overflows".to_string()))?;
        leaves.push(leaf);
    }

    let transfer = Transfer {
        id: request.transfer_id,
        sender_identity_pubkey: sender,
        receiver_identity_pubkey: receiver,
        total_value,
        expiry_time: request.expiry_time,
        completion_time: None,
        transfer_type,
        status: TransferStatus::SenderInitiated,
    };
    tx.insert_transfer(transfer.clone())?;

    for (leaf, leaf_refund) in leaves.iter_mut().zip(&request.leaves) {
        tx.insert_transfer_leaf(TransferLeaf {
            id: Uuid::new_v4(),
            transfer_id: transfer.id,
            leaf_id: leaf.id,
            previous_refund_tx: leaf.raw_refund_tx.clone(),
            intermediate_refund_tx: leaf_refund.raw_refund_tx.to_vec(),
            secret_cipher: None,
            signature: None,
            key_tweak: None,
            sender_key_tweak_proof: None,
            receiver_refund_tx: None,
        })?;
        leaf.status = TreeNodeStatus::TransferLocked;
        tx.update_tree_node(leaf.clone())?;
    }

    if let Some(exit) = exit {
        let exit_txid = <[u8; 32]>::try_from(&exit.exit_txid[..]).map_err(|_| {
            OperatorError::Validation(format!(
                "exit txid must be 32 bytes, got {}",
                exit.exit_txid.len()
            ))
        })?;
        tx.upsert_cooperative_exit(CooperativeExit {
            transfer_id: transfer.id,
            exit_txid,
            connector_tx: exit.connector_tx.to_vec(),
            confirmation_height: None,
        })?;
    }
    if transfer_type == TransferType::PreimageSwap {
        tx.upsert_preimage_request(PreimageRequest {
            transfer_id: transfer.id,
            status: PreimageRequestStatus::WaitingForPreimage,
        })?;
    }

    Ok((transfer, leaves))
}

/// Record a transfer created on the coordinating operator
pub async fn handle_initiate_transfer(
    node: &OperatorNode,
    request: &InitiateTransferRequest,
) -> Result<AckResponse, OperatorError> {
    let mut tx = node.store.begin().await?;
    let (transfer, _) = create_transfer(
        tx.as_mut(),
        &request.transfer,
        request.exit.as_ref(),
        Utc::now(),
    )?;
    tx.commit()?;
    logged(&transfer, "transfer_initiated");
    Ok(ack(node))
}

/// Tweak a leaf's keyshare for its new owner and update the leaf
fn apply_leaf_tweak(
    tx: &mut dyn StoreTx,
    mut leaf: TreeNode,
    tweak: &KeyTweak,
    new_owner: Option<&[u8]>,
    refund: Option<Vec<u8>>,
) -> Result<(), OperatorError> {
    let keyshare = apply_keyshare_tweak(tx, &leaf.signing_keyshare_id, tweak)?;
    leaf.owner_signing_pubkey = keys::subtract_public_keys(&leaf.verifying_pubkey, &keyshare.public_key)?;
    if let Some(owner) = new_owner {
        leaf.owner_identity_pubkey = owner.to_vec();
    }
    if let Some(refund) = refund {
        leaf.raw_refund_tx = refund;
    }
    tx.update_tree_node(leaf)?;
    Ok(())
}

fn load_keyshare(tx: &dyn StoreTx, id: &Uuid) -> Result<SigningKeyshare, OperatorError> {
    Ok(tx.get_keyshare(id)?.ok_or(KeyshareError::NotFound(*id))?)
}

/// Accept the sender's tweak for this operator
///
/// The tweak is applied at once unless the transfer type gates it, in which
/// case it is stored until [`apply_pending_sender_key_tweak`].
pub async fn handle_apply_sender_key_tweak(
    node: &OperatorNode,
    request: &ApplySenderKeyTweakRequest,
) -> Result<TransferResponse, OperatorError> {
    let share_index = node.config.this_operator()?.share_index();
    let mut tx = node.store.begin().await?;
    let mut transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
    require_sender(&transfer, &request.sender_identity_public_key)?;

    let leaf_ids: Vec<Uuid> = request.leaves.iter().map(|l| l.leaf_id).collect();
    let mut stored = match_transfer_leaves(
        transfer.id,
        tx.transfer_leaves(&transfer.id)?,
        &leaf_ids,
    )?;

    let proofs: BTreeMap<Uuid, Vec<Vec<u8>>> = request
        .leaves
        .iter()
        .map(|l| {
            (
                l.leaf_id,
                l.key_tweak.proofs.iter().map(|p| p.to_vec()).collect(),
            )
        })
        .collect();
    for (leaf_id, stored_leaf) in &stored {
        if let Some(previous) = &stored_leaf.sender_key_tweak_proof {
            if Some(previous) != proofs.get(leaf_id) {
                return Err(TransferError::TweakProofMismatch(*leaf_id).into());
            }
        }
    }
    if matches!(
        transfer.status,
        TransferStatus::SenderKeyTweakPending | TransferStatus::SenderKeyTweaked
    ) {
        // replay of a tweak this operator already accepted
        return Ok(TransferResponse {
            transfer: TransferView::from(&transfer),
        });
    }
    require_status(&transfer, TransferStatus::SenderInitiated)?;
    require_not_expired(&transfer, Utc::now())?;

    let apply_now = sender_tweak_gate_open(tx.as_ref(), &transfer, node.config.network)?;
    let connector = connector_tx(tx.as_ref(), &transfer)?;

    for leaf_tweak in &request.leaves {
        let leaf = load_leaf(tx.as_ref(), &leaf_tweak.leaf_id)?;
        check_leaf_locked(&leaf, &transfer.sender_identity_pubkey)?;

        let message =
            sender_signature_message(&leaf.id, &transfer.id, &leaf_tweak.secret_cipher);
        keys::verify_identity_signature(
            &transfer.sender_identity_pubkey,
            &message,
            &leaf_tweak.signature,
        )
        .map_err(|_| TransferError::InvalidSignature(leaf.id))?;

        let tweak = KeyTweak::from(leaf_tweak.key_tweak.clone());
        let keyshare = load_keyshare(tx.as_ref(), &leaf.signing_keyshare_id)?;
        validate_key_tweak(&keyshare, &tweak, share_index)?;

        let mut stored_leaf = stored
            .remove(&leaf.id)
            .ok_or(TransferError::LeafNotFound(leaf.id))?;
        let unsigned = tx::parse_tx(&stored_leaf.intermediate_refund_tx)?;
        let signed = tx::with_key_spend_signature(&unsigned, &leaf_tweak.refund_signature)?;
        if transfer.transfer_type != TransferType::PreimageSwap {
            let node_tx = tx::parse_tx(&leaf.raw_tx)?;
            tx::verify_key_spend(&signed, &node_tx, connector.as_ref()).map_err(|e| {
                TransferError::refund(leaf.id, format!("refund signature: {}", e))
            })?;
        }
        let signed = tx::serialize_tx(&signed);

        stored_leaf.intermediate_refund_tx = signed.clone();
        stored_leaf.secret_cipher = Some(leaf_tweak.secret_cipher.to_vec());
        stored_leaf.signature = Some(leaf_tweak.signature.to_vec());
        stored_leaf.sender_key_tweak_proof = Some(tweak.share.proofs.clone());
        if apply_now {
            apply_leaf_tweak(tx.as_mut(), leaf, &tweak, None, Some(signed))?;
            stored_leaf.key_tweak = None;
        } else {
            stored_leaf.key_tweak = Some(tweak);
        }
        tx.update_transfer_leaf(stored_leaf)?;
    }

    transfer.status = if apply_now {
        TransferStatus::SenderKeyTweaked
    } else {
        TransferStatus::SenderKeyTweakPending
    };
    tx.update_transfer(transfer.clone())?;
    tx.commit()?;

    logged(&transfer, "sender_key_tweak_accepted");
    Ok(TransferResponse {
        transfer: TransferView::from(&transfer),
    })
}

/// Apply stored sender tweaks once the transfer's gate has opened
pub async fn apply_pending_sender_key_tweak(
    node: &OperatorNode,
    transfer_id: &Uuid,
) -> Result<TransferView, OperatorError> {
    let mut tx = node.store.begin().await?;
    let mut transfer = load_transfer(tx.as_ref(), transfer_id)?;
    require_status(&transfer, TransferStatus::SenderKeyTweakPending)?;
    if !sender_tweak_gate_open(tx.as_ref(), &transfer, node.config.network)? {
        return Err(TransferError::TweakNotReady(transfer.id).into());
    }

    for mut stored_leaf in tx.transfer_leaves(&transfer.id)? {
        let Some(tweak) = stored_leaf.key_tweak.take() else {
            continue;
        };
        let leaf = load_leaf(tx.as_ref(), &stored_leaf.leaf_id)?;
        let refund = stored_leaf.intermediate_refund_tx.clone();
        apply_leaf_tweak(tx.as_mut(), leaf, &tweak, None, Some(refund))?;
        tx.update_transfer_leaf(stored_leaf)?;
    }

    transfer.status = TransferStatus::SenderKeyTweaked;
    tx.update_transfer(transfer.clone())?;
    tx.commit()?;

    logged(&transfer, "pending_sender_key_tweak_applied");
    Ok(TransferView::from(&transfer))
}

/// Validate the receiver's tweak and lock it in without applying it
pub async fn handle_initiate_settle_receiver_key_tweak(
    node: &OperatorNode,
    request: &InitiateSettleReceiverKeyTweakRequest,
) -> Result<AckResponse, OperatorError> {
    let share_index = node.config.this_operator()?.share_index();
    let mut tx = node.store.begin().await?;
    let mut transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
    require_receiver(&transfer, &request.receiver_identity_public_key)?;

    let leaf_ids: Vec<Uuid> = request.leaves.iter().map(|l| l.leaf_id).collect();
    let mut stored = match_transfer_leaves(
        transfer.id,
        tx.transfer_leaves(&transfer.id)?,
        &leaf_ids,
    )?;

    if transfer.status == TransferStatus::ReceiverKeyTweakLocked {
        let same = request.leaves.iter().all(|l| {
            let tweak = KeyTweak::from(l.key_tweak.clone());
            stored
                .get(&l.leaf_id)
                .is_some_and(|s| s.key_tweak.as_ref() == Some(&tweak))
        });
        if same {
            return Ok(ack(node));
        }
    }
    require_status(&transfer, TransferStatus::SenderKeyTweaked)?;
    require_not_expired(&transfer, Utc::now())?;
    if !exit_confirmed(tx.as_ref(), &transfer.id, node.config.network)? {
        return Err(TransferError::TweakNotReady(transfer.id).into());
    }

    for leaf_tweak in &request.leaves {
        let leaf = load_leaf(tx.as_ref(), &leaf_tweak.leaf_id)?;
        check_leaf_locked(&leaf, &transfer.sender_identity_pubkey)?;

        let tweak = KeyTweak::from(leaf_tweak.key_tweak.clone());
        let keyshare = load_keyshare(tx.as_ref(), &leaf.signing_keyshare_id)?;
        validate_key_tweak(&keyshare, &tweak, share_index)?;

        let pubkey_tweak = tweak
            .pubkey_tweak()
            .ok_or_else(|| KeyshareError::InvalidTweak("tweak has no proofs".to_string()))?;
        let tweaked = tweak_keyshare(
            &keyshare,
            &tweak.share.share.share,
            pubkey_tweak,
            &tweak.pubkey_shares_tweak,
        )?;
        let owner_signing = keys::subtract_public_keys(&leaf.verifying_pubkey, &tweaked.public_key)?;
        if owner_signing != *leaf_tweak.signing_public_key {
            return Err(TransferError::SigningKeyMismatch(leaf.id).into());
        }

        let mut stored_leaf = stored
            .remove(&leaf.id)
            .ok_or(TransferError::LeafNotFound(leaf.id))?;
        stored_leaf.key_tweak = Some(tweak);
        tx.update_transfer_leaf(stored_leaf)?;
    }

    transfer.status = TransferStatus::ReceiverKeyTweakLocked;
    tx.update_transfer(transfer.clone())?;
    tx.commit()?;

    logged(&transfer, "receiver_key_tweak_locked");
    Ok(ack(node))
}

/// Apply or drop the receiver tweak locked by the initiate step
pub async fn handle_settle_receiver_key_tweak(
    node: &OperatorNode,
    request: &SettleReceiverKeyTweakRequest,
) -> Result<AckResponse, OperatorError> {
    let mut tx = node.store.begin().await?;
    let mut transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;

    match request.action {
        SettleAction::Apply => {
            if transfer.status == TransferStatus::ReceiverKeyTweaked {
                return Ok(ack(node));
            }
            require_status(&transfer, TransferStatus::ReceiverKeyTweakLocked)?;
            for mut stored_leaf in tx.transfer_leaves(&transfer.id)? {
                let tweak = stored_leaf.key_tweak.take().ok_or_else(|| {
                    TransferError::MissingKeyTweak {
                        leaf_id: stored_leaf.leaf_id,
                        operator: node.identifier(),
                    }
                })?;
                let leaf = load_leaf(tx.as_ref(), &stored_leaf.leaf_id)?;
                let receiver = transfer.receiver_identity_pubkey.clone();
                apply_leaf_tweak(tx.as_mut(), leaf, &tweak, Some(&receiver), None)?;
                tx.update_transfer_leaf(stored_leaf)?;
            }
            transfer.status = TransferStatus::ReceiverKeyTweaked;
        }
        SettleAction::Revert => match transfer.status {
            TransferStatus::ReceiverKeyTweakLocked | TransferStatus::SenderKeyTweaked => {
                for mut stored_leaf in tx.transfer_leaves(&transfer.id)? {
                    if stored_leaf.key_tweak.take().is_some() {
                        tx.update_transfer_leaf(stored_leaf)?;
                    }
                }
                transfer.status = TransferStatus::SenderKeyTweaked;
            }
            _ => {
                return Err(TransferError::unexpected(
                    transfer.id,
                    transfer.status,
                    TransferStatus::ReceiverKeyTweakLocked,
                )
                .into())
            }
        },
    }

    tx.update_transfer(transfer.clone())?;
    tx.commit()?;
    let event = match request.action {
        SettleAction::Apply => "receiver_key_tweak_applied",
        SettleAction::Revert => "receiver_key_tweak_reverted",
    };
    logged(&transfer, event);
    Ok(ack(node))
}

/// Check the receiver's new refunds against the tweaked leaves
fn validate_receiver_refunds(
    tx: &dyn StoreTx,
    transfer: &Transfer,
    refunds: &[(Uuid, Vec<u8>)],
) -> Result<(), OperatorError> {
    for (leaf_id, raw_refund) in refunds {
        let leaf = load_leaf(tx, leaf_id)?;
        check_leaf_locked(&leaf, &transfer.receiver_identity_pubkey)?;
        let current = tx::parse_tx(&leaf.raw_refund_tx)?;
        let refund = tx::parse_tx(raw_refund)?;
        validate_refund(
            leaf.id,
            &current,
            &refund,
            &transfer.receiver_identity_pubkey,
            refund_inputs(transfer.transfer_type),
            TimelockRule::NotIncrease,
        )?;
    }
    Ok(())
}

pub(crate) fn check_receiver_refunds(
    tx: &dyn StoreTx,
    transfer: &Transfer,
    refunds: &[(Uuid, Vec<u8>)],
) -> Result<(), OperatorError> {
    let leaf_ids: Vec<Uuid> = refunds.iter().map(|(id, _)| *id).collect();
    match_transfer_leaves(transfer.id, tx.transfer_leaves(&transfer.id)?, &leaf_ids)?;
    validate_receiver_refunds(tx, transfer, refunds)
}

/// Store the receiver refunds the federation just signed
pub async fn handle_record_receiver_refunds(
    node: &OperatorNode,
    request: &RecordReceiverRefundsRequest,
) -> Result<AckResponse, OperatorError> {
    let mut tx = node.store.begin().await?;
    let mut transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
    require_receiver(&transfer, &request.receiver_identity_public_key)?;

    let refunds: Vec<(Uuid, Vec<u8>)> = request
        .leaves
        .iter()
        .map(|l| (l.leaf_id, l.raw_refund_tx.to_vec()))
        .collect();
    let leaf_ids: Vec<Uuid> = refunds.iter().map(|(id, _)| *id).collect();
    let mut stored = match_transfer_leaves(
        transfer.id,
        tx.transfer_leaves(&transfer.id)?,
        &leaf_ids,
    )?;

    if transfer.status == TransferStatus::ReceiverRefundSigned
        && refunds
            .iter()
            .all(|(id, raw)| stored.get(id).and_then(|s| s.receiver_refund_tx.as_ref()) == Some(raw))
    {
        return Ok(ack(node));
    }
    require_status(&transfer, TransferStatus::ReceiverKeyTweaked)?;
    validate_receiver_refunds(tx.as_ref(), &transfer, &refunds)?;

    for (leaf_id, raw_refund) in refunds {
        let mut stored_leaf = stored
            .remove(&leaf_id)
            .ok_or(TransferError::LeafNotFound(leaf_id))?;
        stored_leaf.receiver_refund_tx = Some(raw_refund);
        tx.update_transfer_leaf(stored_leaf)?;
    }
    transfer.status = TransferStatus::ReceiverRefundSigned;
    tx.update_transfer(transfer.clone())?;
    tx.commit()?;

    logged(&transfer, "receiver_refunds_signed");
    Ok(ack(node))
}

/// Check each signed refund is the recorded receiver refund with a valid
/// key-path signature; returns the serialized signed refunds by leaf
pub(crate) fn verify_signed_refunds(
    tx: &dyn StoreTx,
    transfer: &Transfer,
    leaves: &[SignedLeafRefund],
) -> Result<BTreeMap<Uuid, Vec<u8>>, OperatorError> {
    let leaf_ids: Vec<Uuid> = leaves.iter().map(|l| l.leaf_id).collect();
    let stored = match_transfer_leaves(transfer.id, tx.transfer_leaves(&transfer.id)?, &leaf_ids)?;
    let connector = connector_tx(tx, transfer)?;

    let mut verified = BTreeMap::new();
    for signed_leaf in leaves {
        let stored_leaf = stored
            .get(&signed_leaf.leaf_id)
            .ok_or(TransferError::LeafNotFound(signed_leaf.leaf_id))?;
        let recorded = stored_leaf
            .receiver_refund_tx
            .as_ref()
            .ok_or_else(|| TransferError::refund(signed_leaf.leaf_id, "no receiver refund recorded"))?;
        let recorded = tx::parse_tx(recorded)?;
        let signed = tx::parse_tx(&signed_leaf.signed_refund_tx)?;
        if signed.compute_txid() != recorded.compute_txid() {
            return Err(TransferError::refund(
                signed_leaf.leaf_id,
                "signed refund differs from the recorded refund",
            )
            .into());
        }

        let leaf = load_leaf(tx, &signed_leaf.leaf_id)?;
        let node_tx = tx::parse_tx(&leaf.raw_tx)?;
        tx::verify_key_spend(&signed, &node_tx, connector.as_ref()).map_err(|e| {
            TransferError::refund(signed_leaf.leaf_id, format!("refund signature: {}", e))
        })?;
        verified.insert(signed_leaf.leaf_id, tx::serialize_tx(&signed));
    }
    Ok(verified)
}

/// Release the leaves to their new owner and close the transfer
pub async fn handle_complete_transfer(
    node: &OperatorNode,
    request: &CompleteTransferRequest,
) -> Result<AckResponse, OperatorError> {
    let mut tx = node.store.begin().await?;
    let mut transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
    if transfer.status == TransferStatus::Completed {
        return Ok(ack(node));
    }
    require_status(&transfer, TransferStatus::ReceiverRefundSigned)?;

    let signed = verify_signed_refunds(tx.as_ref(), &transfer, &request.leaves)?;
    for (leaf_id, refund) in signed {
        let mut leaf = load_leaf(tx.as_ref(), &leaf_id)?;
        leaf.status = TreeNodeStatus::Available;
        leaf.raw_refund_tx = refund;
        leaf.destination_lock_identity_pubkey = None;
        tx.update_tree_node(leaf)?;
    }
    transfer.status = TransferStatus::Completed;
    transfer.completion_time = Some(Utc::now());
    tx.update_transfer(transfer.clone())?;
    tx.commit()?;

    logged(&transfer, "transfer_completed");
    Ok(ack(node))
}

/// Mark an expired transfer reclaimed and return its leaves to the sender
pub async fn handle_expire_transfer(
    node: &OperatorNode,
    request: &ReclaimTransferRequest,
) -> Result<AckResponse, OperatorError> {
    let mut tx = node.store.begin().await?;
    let mut transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
    require_sender(&transfer, &request.sender_identity_public_key)?;
    if transfer.status == TransferStatus::Expired {
        return Ok(ack(node));
    }
    if !transfer.status.is_reclaimable() {
        return Err(TransferError::unexpected(
            transfer.id,
            transfer.status,
            TransferStatus::SenderInitiated,
        )
        .into());
    }
    if !transfer.is_expired_at(Utc::now()) {
        return Err(TransferError::NotExpired(transfer.id).into());
    }

    for mut stored_leaf in tx.transfer_leaves(&transfer.id)? {
        let mut leaf = load_leaf(tx.as_ref(), &stored_leaf.leaf_id)?;
        leaf.status = TreeNodeStatus::Available;
        tx.update_tree_node(leaf)?;
        if stored_leaf.key_tweak.take().is_some() {
            tx.update_transfer_leaf(stored_leaf)?;
        }
    }
    transfer.status = TransferStatus::Expired;
    tx.update_transfer(transfer.clone())?;
    tx.commit()?;

    logged(&transfer, "transfer_expired");
    Ok(ack(node))
}

/// Record the chain tip seen by the chain watcher
pub async fn set_block_height(node: &OperatorNode, height: u64) -> Result<(), OperatorError> {
    let mut tx = node.store.begin().await?;
    tx.set_block_height(node.config.network, height)?;
    tx.commit()?;
    tracing::debug!(height, network = ?node.config.network, "Block height updated");
    Ok(())
}

/// Record the block an exit transaction confirmed in; returns the transfers
/// waiting on it
pub async fn record_exit_confirmation(
    node: &OperatorNode,
    exit_txid: &[u8; 32],
    height: u64,
) -> Result<Vec<Uuid>, OperatorError> {
    let mut tx = node.store.begin().await?;
    let mut transfer_ids = Vec::new();
    for mut exit in tx.cooperative_exits_by_txid(exit_txid)? {
        exit.confirmation_height = Some(height);
        transfer_ids.push(exit.transfer_id);
        tx.upsert_cooperative_exit(exit)?;
    }
    tx.commit()?;
    tracing::info!(
        exit_txid = %hex::encode(exit_txid),
        height,
        transfers = transfer_ids.len(),
        "Exit transaction confirmed"
    );
    Ok(transfer_ids)
}

/// Record that the preimage of a swap reached the payee
pub async fn mark_preimage_shared(node: &OperatorNode, transfer_id: &Uuid) -> Result<(), OperatorError> {
    let mut tx = node.store.begin().await?;
    let mut request = tx
        .get_preimage_request(transfer_id)?
        .ok_or_else(|| OperatorError::NotFound(format!("preimage request for {}", transfer_id)))?;
    request.status = PreimageRequestStatus::PreimageShared;
    tx.upsert_preimage_request(request)?;
    tx.commit()?;
    tracing::info!(transfer_id = %transfer_id, "Preimage shared");
    Ok(())
}
