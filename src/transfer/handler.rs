//! User-facing transfer operations
//!
//! The operator a user calls acts as coordinator for that request: it checks
//! the request against its own state, drives signing, and replicates each
//! step to the federation. Nothing here holds a store transaction across a
//! call to another operator.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use super::internal::{check_receiver_refunds, create_transfer, verify_signed_refunds};
use super::validation::{
    connector_tx, load_leaf, load_transfer, match_transfer_leaves, refund_sighash,
    require_not_expired, require_receiver, require_sender, require_status,
    sender_signature_message,
};
use super::TransferError;
use crate::config::SigningOperator;
use crate::error::OperatorError;
use crate::keys;
use crate::logging::log_transfer_event;
use crate::models::{Transfer, TransferStatus, TransferType, TreeNode};
use crate::node::OperatorNode;
use crate::operator::{execute_task_with_all_operators, OperatorSelection};
use crate::signing::{sign_frost, SigningJob};
use crate::store::{StorageError, StoreTx};
use crate::transport::TransportError;
use crate::tx;
use crate::types::{
    ApplySenderKeyTweakRequest, ClaimTransferSignRefundsRequest, ClaimTransferTweakKeysRequest,
    CompleteSendTransferRequest, CompleteTransferRequest, CooperativeExitInfo,
    FinalizeTransferRequest, InitiateSettleReceiverKeyTweakRequest, InitiateTransferRequest,
    LeafRefund, OperatorClaimLeafTweak, OperatorKeyTweak, OperatorSenderLeafTweak,
    QueryTransfersRequest, QueryTransfersResponse, ReclaimTransferRequest,
    RecordReceiverRefundsRequest, ReceiverRefund, SettleAction, SettleReceiverKeyTweakRequest,
    SigningResultView, StartCooperativeExitRequest, StartLeafSwapRequest, StartTransferRequest,
    StartTransferResponse, TransferResponse, TransferView,
};

/// Request addressed to `operator` in a per-operator fan-out
fn addressed<'a, T>(
    requests: &'a BTreeMap<String, T>,
    operator: &SigningOperator,
) -> Result<&'a T, TransportError> {
    requests.get(&operator.identifier).ok_or_else(|| {
        TransportError::Decode(format!("no request addressed to {}", operator.identifier))
    })
}

/// The tweak package a leaf carries for `operator`
fn operator_tweak<'a>(
    leaf_id: Uuid,
    tweaks: &'a BTreeMap<String, OperatorKeyTweak>,
    operator: &SigningOperator,
) -> Result<&'a OperatorKeyTweak, TransferError> {
    tweaks
        .get(&operator.identifier)
        .ok_or_else(|| TransferError::MissingKeyTweak {
            leaf_id,
            operator: operator.identifier.clone(),
        })
}

async fn transfer_view(node: &OperatorNode, transfer_id: &Uuid) -> Result<TransferView, OperatorError> {
    let tx = node.store.begin().await?;
    Ok(TransferView::from(&load_transfer(tx.as_ref(), transfer_id)?))
}

/// Signing jobs for new refunds of `leaves`, with the user's commitments
fn refund_jobs(
    leaves: &[TreeNode],
    refunds: &[LeafRefund],
    connector: Option<&bitcoin::Transaction>,
    adaptor_public_key: Option<&[u8]>,
) -> Result<Vec<SigningJob>, OperatorError> {
    leaves
        .iter()
        .zip(refunds)
        .map(|(leaf, refund)| {
            let refund_tx = tx::parse_tx(&refund.raw_refund_tx)?;
            let sighash = refund_sighash(leaf, &refund_tx, connector)?;
            Ok(SigningJob {
                job_id: leaf.id.to_string(),
                keyshare_id: leaf.signing_keyshare_id,
                message: sighash.to_vec(),
                verifying_key: leaf.verifying_pubkey.clone(),
                user_commitment: Some(refund.signing_commitment.to_vec()),
                adaptor_public_key: adaptor_public_key.map(<[u8]>::to_vec),
            })
        })
        .collect()
}

/// Create a transfer and sign the receiver's refunds
pub async fn start_send_transfer(
    node: &OperatorNode,
    request: &StartTransferRequest,
) -> Result<StartTransferResponse, OperatorError> {
    start_transfer(node, request, None, None).await
}

/// Create a cooperative exit: a transfer whose refunds also spend a connector
/// output of the exit transaction
pub async fn start_cooperative_exit(
    node: &OperatorNode,
    request: &StartCooperativeExitRequest,
) -> Result<StartTransferResponse, OperatorError> {
    start_transfer(node, &request.transfer, Some(&request.exit), None).await
}

/// Create one side of a leaf swap
///
/// The refunds are signed as adaptor signatures under the given adaptor
/// point, so they only become valid once the sender learns the adaptor secret
/// from the counterparty's side of the swap.
pub async fn start_leaf_swap(
    node: &OperatorNode,
    request: &StartLeafSwapRequest,
) -> Result<StartTransferResponse, OperatorError> {
    let transfer_type = request.transfer.transfer_type;
    if !matches!(transfer_type, TransferType::Swap | TransferType::CounterSwap) {
        return Err(OperatorError::Validation(format!(
            "a {transfer_type:?} transfer cannot carry an adaptor"
        )));
    }
    keys::parse_public_key(&request.adaptor_public_key)?;
    start_transfer(
        node,
        &request.transfer,
        None,
        Some(&request.adaptor_public_key),
    )
    .await
}

async fn start_transfer(
    node: &OperatorNode,
    request: &StartTransferRequest,
    exit: Option<&CooperativeExitInfo>,
    adaptor_public_key: Option<&[u8]>,
) -> Result<StartTransferResponse, OperatorError> {
    let (transfer, leaves, connector) = {
        let mut tx = node.store.begin().await?;
        let (transfer, leaves) = create_transfer(tx.as_mut(), request, exit, Utc::now())?;
        let connector = connector_tx(tx.as_ref(), &transfer)?;
        tx.commit()?;
        (transfer, leaves, connector)
    };
    log_transfer_event(
        "transfer_created",
        &transfer.id.to_string(),
        transfer.status.as_str(),
        None,
    );

    let jobs = refund_jobs(&leaves, &request.leaves, connector.as_ref(), adaptor_public_key)?;
    let results = sign_frost(node, jobs).await?;

    let replicated = Arc::new(InitiateTransferRequest {
        transfer: request.clone(),
        exit: exit.cloned(),
    });
    let transport = node.transport.clone();
    execute_task_with_all_operators(&node.config, OperatorSelection::ExcludeSelf, |op| {
        let transport = transport.clone();
        let request = replicated.clone();
        async move { transport.initiate_transfer(&op, &request).await }
    })
    .await?;

    tracing::info!(
        transfer_id = %transfer.id,
        leaves = leaves.len(),
        total_value = transfer.total_value,
        "Transfer started"
    );
    Ok(StartTransferResponse {
        transfer: TransferView::from(&transfer),
        signing_results: results.iter().map(SigningResultView::from).collect(),
    })
}

/// Hand the sender's key tweak to every operator
///
/// Each operator receives only its own tweak package.
pub async fn complete_send_transfer(
    node: &OperatorNode,
    request: &CompleteSendTransferRequest,
) -> Result<TransferResponse, OperatorError> {
    {
        let tx = node.store.begin().await?;
        let transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
        require_sender(&transfer, &request.sender_identity_public_key)?;
        let leaf_ids: Vec<Uuid> = request.leaves.iter().map(|l| l.leaf_id).collect();
        match_transfer_leaves(transfer.id, tx.transfer_leaves(&transfer.id)?, &leaf_ids)?;
        for leaf in &request.leaves {
            let message = sender_signature_message(&leaf.leaf_id, &transfer.id, &leaf.secret_cipher);
            keys::verify_identity_signature(
                &transfer.sender_identity_pubkey,
                &message,
                &leaf.signature,
            )
            .map_err(|_| TransferError::InvalidSignature(leaf.leaf_id))?;
        }
    }

    let mut requests = BTreeMap::new();
    for operator in &node.config.operators {
        let leaves = request
            .leaves
            .iter()
            .map(|leaf| {
                Ok(OperatorSenderLeafTweak {
                    leaf_id: leaf.leaf_id,
                    secret_cipher: leaf.secret_cipher.clone(),
                    signature: leaf.signature.clone(),
                    refund_signature: leaf.refund_signature.clone(),
                    key_tweak: operator_tweak(leaf.leaf_id, &leaf.key_tweaks, operator)?.clone(),
                })
            })
            .collect::<Result<Vec<_>, TransferError>>()?;
        requests.insert(
            operator.identifier.clone(),
            ApplySenderKeyTweakRequest {
                transfer_id: request.transfer_id,
                sender_identity_public_key: request.sender_identity_public_key.clone(),
                leaves,
            },
        );
    }

    let requests = Arc::new(requests);
    let transport = node.transport.clone();
    let mut responses =
        execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
            let transport = transport.clone();
            let requests = requests.clone();
            async move { transport.apply_sender_key_tweak(&op, addressed(&requests, &op)?).await }
        })
        .await?;

    let response = responses
        .remove(&node.identifier())
        .ok_or_else(|| OperatorError::Internal("no response from this operator".to_string()))?;
    tracing::info!(
        transfer_id = %request.transfer_id,
        status = response.transfer.status.as_str(),
        "Sender key tweak accepted by all operators"
    );
    Ok(response)
}

/// Settle the receiver's key tweak on every operator, or on none
///
/// All operators first validate and lock the tweak. Only when every one of
/// them accepted is the tweak applied; otherwise all of them drop it and the
/// transfer stays `SenderKeyTweaked`.
pub async fn claim_transfer_tweak_keys(
    node: &OperatorNode,
    request: &ClaimTransferTweakKeysRequest,
) -> Result<TransferResponse, OperatorError> {
    {
        let tx = node.store.begin().await?;
        let transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
        require_receiver(&transfer, &request.receiver_identity_public_key)?;
        require_status(&transfer, TransferStatus::SenderKeyTweaked)?;
        require_not_expired(&transfer, Utc::now())?;
        let leaf_ids: Vec<Uuid> = request.leaves.iter().map(|l| l.leaf_id).collect();
        match_transfer_leaves(transfer.id, tx.transfer_leaves(&transfer.id)?, &leaf_ids)?;
    }

    let mut requests = BTreeMap::new();
    for operator in &node.config.operators {
        let leaves = request
            .leaves
            .iter()
            .map(|leaf| {
                Ok(OperatorClaimLeafTweak {
                    leaf_id: leaf.leaf_id,
                    signing_public_key: leaf.signing_public_key.clone(),
                    key_tweak: operator_tweak(leaf.leaf_id, &leaf.key_tweaks, operator)?.clone(),
                })
            })
            .collect::<Result<Vec<_>, TransferError>>()?;
        requests.insert(
            operator.identifier.clone(),
            InitiateSettleReceiverKeyTweakRequest {
                transfer_id: request.transfer_id,
                receiver_identity_public_key: request.receiver_identity_public_key.clone(),
                leaves,
            },
        );
    }

    let requests = Arc::new(requests);
    let transport = node.transport.clone();
    let initiated = execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let requests = requests.clone();
        async move {
            transport
                .initiate_settle_receiver_key_tweak(&op, addressed(&requests, &op)?)
                .await
        }
    })
    .await;

    let action = if initiated.is_ok() {
        SettleAction::Apply
    } else {
        SettleAction::Revert
    };
    let settle = Arc::new(SettleReceiverKeyTweakRequest {
        transfer_id: request.transfer_id,
        action,
    });
    let settled = execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = settle.clone();
        async move { transport.settle_receiver_key_tweak(&op, &request).await }
    })
    .await;

    if let Err(rejected) = initiated {
        let reason = rejected.to_string();
        log_transfer_event(
            "receiver_key_tweak_rejected",
            &request.transfer_id.to_string(),
            TransferStatus::SenderKeyTweaked.as_str(),
            Some(("SETTLEMENT_REJECTED", reason.as_str())),
        );
        if let Err(err) = settled {
            tracing::error!(
                transfer_id = %request.transfer_id,
                error = %err,
                "Failed to revert receiver key tweak on every operator"
            );
        }
        if rejected.is_unavailability() {
            return Err(rejected.into());
        }
        return Err(TransferError::SettlementRejected {
            operators: rejected.failed_operators(),
        }
        .into());
    }
    settled.inspect_err(|err| {
        tracing::error!(
            transfer_id = %request.transfer_id,
            error = %err,
            "Receiver key tweak applied on only part of the federation"
        );
    })?;

    Ok(TransferResponse {
        transfer: transfer_view(node, &request.transfer_id).await?,
    })
}

/// Sign the receiver's new refunds and record them on every operator
pub async fn claim_transfer_sign_refunds(
    node: &OperatorNode,
    request: &ClaimTransferSignRefundsRequest,
) -> Result<StartTransferResponse, OperatorError> {
    let (leaves, connector) = {
        let tx = node.store.begin().await?;
        let transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
        require_receiver(&transfer, &request.receiver_identity_public_key)?;
        require_status(&transfer, TransferStatus::ReceiverKeyTweaked)?;
        let refunds: Vec<(Uuid, Vec<u8>)> = request
            .leaves
            .iter()
            .map(|l| (l.leaf_id, l.raw_refund_tx.to_vec()))
            .collect();
        check_receiver_refunds(tx.as_ref(), &transfer, &refunds)?;
        let leaves = request
            .leaves
            .iter()
            .map(|l| load_leaf(tx.as_ref(), &l.leaf_id))
            .collect::<Result<Vec<_>, _>>()?;
        (leaves, connector_tx(tx.as_ref(), &transfer)?)
    };

    let jobs = refund_jobs(&leaves, &request.leaves, connector.as_ref(), None)?;
    let results = sign_frost(node, jobs).await?;

    let record = Arc::new(RecordReceiverRefundsRequest {
        transfer_id: request.transfer_id,
        receiver_identity_public_key: request.receiver_identity_public_key.clone(),
        leaves: request
            .leaves
            .iter()
            .map(|l| ReceiverRefund {
                leaf_id: l.leaf_id,
                raw_refund_tx: l.raw_refund_tx.clone(),
            })
            .collect(),
    });
    let transport = node.transport.clone();
    execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = record.clone();
        async move { transport.record_receiver_refunds(&op, &request).await }
    })
    .await?;

    Ok(StartTransferResponse {
        transfer: transfer_view(node, &request.transfer_id).await?,
        signing_results: results.iter().map(SigningResultView::from).collect(),
    })
}

/// Check the receiver's signed refunds and complete the transfer everywhere
pub async fn finalize_transfer(
    node: &OperatorNode,
    request: &FinalizeTransferRequest,
) -> Result<TransferResponse, OperatorError> {
    {
        let tx = node.store.begin().await?;
        let transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
        require_receiver(&transfer, &request.receiver_identity_public_key)?;
        require_status(&transfer, TransferStatus::ReceiverRefundSigned)?;
        verify_signed_refunds(tx.as_ref(), &transfer, &request.leaves)?;
    }

    let complete = Arc::new(CompleteTransferRequest {
        transfer_id: request.transfer_id,
        leaves: request.leaves.clone(),
    });
    let transport = node.transport.clone();
    execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = complete.clone();
        async move { transport.complete_transfer(&op, &request).await }
    })
    .await?;

    Ok(TransferResponse {
        transfer: transfer_view(node, &request.transfer_id).await?,
    })
}

/// Transfers waiting for `receiver` to claim them
pub fn pending_transfers(
    tx: &dyn StoreTx,
    receiver: &[u8],
    now: DateTime<Utc>,
) -> Result<Vec<Transfer>, StorageError> {
    Ok(tx
        .transfers_by_receiver(receiver)?
        .into_iter()
        .filter(|t| t.status == TransferStatus::SenderKeyTweaked && !t.is_expired_at(now))
        .collect())
}

/// Transfers of `sender` that expired before anyone tweaked a key for them
pub fn expired_transfers(
    tx: &dyn StoreTx,
    sender: &[u8],
    now: DateTime<Utc>,
) -> Result<Vec<Transfer>, StorageError> {
    Ok(tx
        .transfers_by_sender(sender)?
        .into_iter()
        .filter(|t| t.status.is_reclaimable() && t.is_expired_at(now))
        .collect())
}

pub async fn query_pending_transfers(
    node: &OperatorNode,
    request: &QueryTransfersRequest,
) -> Result<QueryTransfersResponse, OperatorError> {
    let tx = node.store.begin().await?;
    let transfers = pending_transfers(tx.as_ref(), &request.identity_public_key, Utc::now())?;
    Ok(QueryTransfersResponse {
        transfers: transfers.iter().map(TransferView::from).collect(),
    })
}

pub async fn query_expired_transfers(
    node: &OperatorNode,
    request: &QueryTransfersRequest,
) -> Result<QueryTransfersResponse, OperatorError> {
    let tx = node.store.begin().await?;
    let transfers = expired_transfers(tx.as_ref(), &request.identity_public_key, Utc::now())?;
    Ok(QueryTransfersResponse {
        transfers: transfers.iter().map(TransferView::from).collect(),
    })
}

/// Give the leaves of an expired transfer back to its sender on every operator
pub async fn reclaim_expired_transfer(
    node: &OperatorNode,
    request: &ReclaimTransferRequest,
) -> Result<TransferResponse, OperatorError> {
    {
        let tx = node.store.begin().await?;
        let transfer = load_transfer(tx.as_ref(), &request.transfer_id)?;
        require_sender(&transfer, &request.sender_identity_public_key)?;
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
    }

    let expire = Arc::new(request.clone());
    let transport = node.transport.clone();
    execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = expire.clone();
        async move { transport.expire_transfer(&op, &request).await }
    })
    .await?;

    tracing::info!(transfer_id = %request.transfer_id, "Expired transfer reclaimed");
    Ok(TransferResponse {
        transfer: transfer_view(node, &request.transfer_id).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use chrono::Duration;

    fn transfer(sender: u8, receiver: u8, status: TransferStatus, expiry: Option<DateTime<Utc>>) -> Transfer {
        Transfer {
            id: Uuid::new_v4(),
            sender_identity_pubkey: vec![sender; 33],
            receiver_identity_pubkey: vec![receiver; 33],
            total_value: 1000,
            expiry_time: expiry,
            completion_time: None,
            transfer_type: TransferType::Transfer,
            status,
        }
    }

    #[tokio::test]
    async fn test_expired_sender_initiated_transfer_is_only_reported_to_sender() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let expired = transfer(2, 3, TransferStatus::SenderInitiated, Some(now - Duration::seconds(1)));
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_transfer(expired.clone()).unwrap();
            tx.commit().unwrap();
        }

        let tx = store.begin().await.unwrap();
        let for_sender = expired_transfers(tx.as_ref(), &[2; 33], now).unwrap();
        assert_eq!(for_sender, vec![expired]);
        assert!(pending_transfers(tx.as_ref(), &[3; 33], now).unwrap().is_empty());
        assert!(expired_transfers(tx.as_ref(), &[3; 33], now).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let later = Some(now + Duration::minutes(10));
        let earlier = Some(now - Duration::minutes(10));

        let claimable = transfer(2, 3, TransferStatus::SenderKeyTweaked, later);
        let never_expires = transfer(2, 3, TransferStatus::SenderKeyTweaked, None);
        let stale = transfer(2, 3, TransferStatus::SenderKeyTweaked, earlier);
        let pending_tweak = transfer(2, 3, TransferStatus::SenderKeyTweakPending, earlier);
        let completed = transfer(2, 3, TransferStatus::Completed, earlier);
        {
            let mut tx = store.begin().await.unwrap();
            for t in [&claimable, &never_expires, &stale, &pending_tweak, &completed] {
                tx.insert_transfer(t.clone()).unwrap();
            }
            tx.commit().unwrap();
        }

        let tx = store.begin().await.unwrap();
        let mut pending: Vec<Uuid> = pending_transfers(tx.as_ref(), &[3; 33], now)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        pending.sort();
        let mut expected = vec![claimable.id, never_expires.id];
        expected.sort();
        assert_eq!(pending, expected);

        let expired: Vec<Uuid> = expired_transfers(tx.as_ref(), &[2; 33], now)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(expired, vec![pending_tweak.id]);
    }
}
