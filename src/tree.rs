//! Deposit keys, tree addresses and leaf registration
//!
//! These are the consumers of the keyshare pool. A deposit takes one keyshare
//! out of this operator's pool and records who owns it; splitting a deposit
//! into a tree takes one keyshare per extra child and solves for the last
//! child's keyshare, so the children's keys add up to the parent's. A leaf is
//! then registered on every operator, at most once per keyshare, by the owner
//! recorded for that keyshare.

use std::sync::Arc;
use uuid::Uuid;

use crate::config::Network;
use crate::error::OperatorError;
use crate::keys;
use crate::keyshare::{calculate_and_store_last_key, mark_keyshares_in_use, KeyshareError};
use crate::models::{DepositAddress, KeyshareStatus, TreeNode, TreeNodeStatus};
use crate::node::OperatorNode;
use crate::operator::{execute_task_with_all_operators, OperatorSelection};
use crate::store::{StorageError, StoreTx};
use crate::tx;
use crate::types::{
    AckResponse, AddressNode, AddressRequestNode, CreateLeafRequest, DepositKeyRequest,
    DepositKeyResponse, InternalPrepareTreeAddressRequest, MarkKeyshareForDepositAddressRequest,
    MarkKeysharesUsedRequest, PrepareTreeAddressRequest, PrepareTreeAddressResponse,
    PreparedAddressNode, TreeNodeView,
};

/// P2TR address of `keyshare_public_key + user_public_key`
fn deposit_address(
    keyshare_public_key: &[u8],
    user_public_key: &[u8],
    network: Network,
) -> Result<(Vec<u8>, String), OperatorError> {
    let verifying_key = keys::add_public_keys(keyshare_public_key, user_public_key)?;
    let address = tx::p2tr_address(&verifying_key, network)?;
    Ok((verifying_key, address))
}

fn load_in_use_keyshare(
    tx: &dyn StoreTx,
    keyshare_id: &Uuid,
) -> Result<crate::models::SigningKeyshare, OperatorError> {
    let keyshare = tx
        .get_keyshare(keyshare_id)?
        .ok_or(KeyshareError::NotFound(*keyshare_id))?;
    if keyshare.status != KeyshareStatus::InUse {
        return Err(OperatorError::Validation(format!(
            "keyshare {} was not allocated for a deposit",
            keyshare_id
        )));
    }
    Ok(keyshare)
}

/// Record the owner of a keyshare; recording the same owner again is a no-op
fn record_deposit_address(tx: &mut dyn StoreTx, deposit: DepositAddress) -> Result<(), OperatorError> {
    match tx.get_deposit_address(&deposit.keyshare_id)? {
        Some(existing) if existing == deposit => Ok(()),
        Some(_) => Err(StorageError::Duplicate(format!(
            "deposit address for keyshare {}",
            deposit.keyshare_id
        ))
        .into()),
        None => Ok(tx.insert_deposit_address(deposit)?),
    }
}

/// Push this operator's allocations and their owners to the other operators
async fn replicate_allocation(
    node: &OperatorNode,
    keyshare_ids: Vec<Uuid>,
    deposits: Vec<MarkKeyshareForDepositAddressRequest>,
) -> Result<(), OperatorError> {
    let mark = Arc::new(MarkKeysharesUsedRequest { keyshare_ids });
    let transport = node.transport.clone();
    execute_task_with_all_operators(&node.config, OperatorSelection::ExcludeSelf, |op| {
        let transport = transport.clone();
        let request = mark.clone();
        async move { transport.mark_keyshares_used(&op, &request).await }
    })
    .await?;

    let deposits = Arc::new(deposits);
    execute_task_with_all_operators(&node.config, OperatorSelection::ExcludeSelf, |op| {
        let transport = transport.clone();
        let deposits = deposits.clone();
        async move {
            for deposit in deposits.iter() {
                transport.mark_keyshare_for_deposit_address(&op, deposit).await?;
            }
            Ok(())
        }
    })
    .await?;
    Ok(())
}

/// Allocate a keyshare for a new deposit and return its address
pub async fn generate_deposit_key(
    node: &OperatorNode,
    request: &DepositKeyRequest,
) -> Result<DepositKeyResponse, OperatorError> {
    keys::parse_public_key(&request.identity_public_key)?;
    keys::parse_public_key(&request.signing_public_key)?;

    let (keyshare, verifying_key, deposit_address) = {
        let mut tx = node.store.begin().await?;
        let keyshare = node
            .keyshares
            .allocate(tx.as_mut(), 1)?
            .pop()
            .ok_or_else(|| OperatorError::Internal("allocation returned no keyshare".to_string()))?;
        let (verifying_key, address) = deposit_address(
            &keyshare.public_key,
            &request.signing_public_key,
            node.config.network,
        )?;
        record_deposit_address(
            tx.as_mut(),
            DepositAddress {
                keyshare_id: keyshare.id,
                address: address.clone(),
                owner_identity_pubkey: request.identity_public_key.to_vec(),
                owner_signing_pubkey: request.signing_public_key.to_vec(),
            },
        )?;
        tx.commit()?;
        (keyshare, verifying_key, address)
    };

    replicate_allocation(
        node,
        vec![keyshare.id],
        vec![MarkKeyshareForDepositAddressRequest {
            keyshare_id: keyshare.id,
            address: deposit_address.clone(),
            owner_identity_public_key: request.identity_public_key.clone(),
            owner_signing_public_key: request.signing_public_key.clone(),
        }],
    )
    .await?;

    tracing::info!(
        keyshare_id = %keyshare.id,
        address = %deposit_address,
        "Generated deposit key"
    );

    Ok(DepositKeyResponse {
        keyshare_id: keyshare.id,
        verifying_key: verifying_key.into(),
        deposit_address,
    })
}

/// Replicated Available -> InUse transition of another operator's allocation
pub async fn handle_mark_keyshares_used(
    node: &OperatorNode,
    request: &MarkKeysharesUsedRequest,
) -> Result<AckResponse, OperatorError> {
    let mut tx = node.store.begin().await?;
    mark_keyshares_in_use(tx.as_mut(), &request.keyshare_ids)?;
    tx.commit()?;
    Ok(AckResponse {
        identifier: node.identifier(),
    })
}

/// Replicated owner of another operator's deposit allocation
pub async fn handle_mark_keyshare_for_deposit_address(
    node: &OperatorNode,
    request: &MarkKeyshareForDepositAddressRequest,
) -> Result<AckResponse, OperatorError> {
    keys::parse_public_key(&request.owner_identity_public_key)?;
    let mut tx = node.store.begin().await?;
    let keyshare = load_in_use_keyshare(tx.as_ref(), &request.keyshare_id)?;
    let (_, address) = deposit_address(
        &keyshare.public_key,
        &request.owner_signing_public_key,
        node.config.network,
    )?;
    if address != request.address {
        return Err(OperatorError::Validation(format!(
            "address {} does not belong to keyshare {}",
            request.address, request.keyshare_id
        )));
    }
    record_deposit_address(
        tx.as_mut(),
        DepositAddress {
            keyshare_id: request.keyshare_id,
            address,
            owner_identity_pubkey: request.owner_identity_public_key.to_vec(),
            owner_signing_pubkey: request.owner_signing_public_key.to_vec(),
        },
    )?;
    tx.commit()?;
    Ok(AckResponse {
        identifier: node.identifier(),
    })
}

/// Check a requested tree against the deposit it splits
///
/// Returns how many pool keyshares the tree needs: one for every child but
/// the last of each split.
fn check_tree(
    parent: &DepositAddress,
    identity_public_key: &[u8],
    node: &AddressRequestNode,
) -> Result<usize, OperatorError> {
    if parent.owner_identity_pubkey != identity_public_key {
        return Err(OperatorError::Validation(format!(
            "identity does not own deposit address {}",
            parent.address
        )));
    }
    if keys::parse_public_key(&parent.owner_signing_pubkey)?
        != keys::parse_public_key(&node.user_public_key)?
    {
        return Err(OperatorError::Validation(
            "root key does not match the deposit address".to_string(),
        ));
    }
    if node.children.is_empty() {
        return Err(OperatorError::Validation("tree has no children".to_string()));
    }
    split_count(node)
}

fn split_count(node: &AddressRequestNode) -> Result<usize, OperatorError> {
    let Some((_, rest)) = node.children.split_first() else {
        return Ok(0);
    };
    if rest.is_empty() {
        return Err(OperatorError::Validation(
            "a split needs at least two children".to_string(),
        ));
    }
    let child_keys: Vec<&[u8]> = node.children.iter().map(|c| &c.user_public_key[..]).collect();
    if keys::parse_public_key(&keys::sum_public_keys(&child_keys)?)? != keys::parse_public_key(&node.user_public_key)? {
        return Err(OperatorError::Validation(
            "child keys do not add up to their parent's key".to_string(),
        ));
    }

    let mut count = rest.len();
    for child in &node.children {
        count += split_count(child)?;
    }
    Ok(count)
}

/// Give every child but the last a pool keyshare and the last a fresh id
fn assign_keyshares(
    node: &AddressRequestNode,
    keyshare_id: Uuid,
    pool: &mut impl Iterator<Item = Uuid>,
) -> Result<PreparedAddressNode, OperatorError> {
    let mut children = Vec::with_capacity(node.children.len());
    if let Some((last, rest)) = node.children.split_last() {
        for child in rest {
            let id = pool.next().ok_or_else(|| {
                OperatorError::Internal("allocation returned too few keyshares".to_string())
            })?;
            children.push(assign_keyshares(child, id, pool)?);
        }
        children.push(assign_keyshares(last, Uuid::new_v4(), pool)?);
    }
    Ok(PreparedAddressNode {
        user_public_key: node.user_public_key.clone(),
        keyshare_id,
        children,
    })
}

/// Solve the last keyshare of every split and record each child's owner
fn store_tree_keyshares(
    tx: &mut dyn StoreTx,
    node: &PreparedAddressNode,
    identity_public_key: &[u8],
    network: Network,
) -> Result<(), OperatorError> {
    let Some((last, rest)) = node.children.split_last() else {
        return Ok(());
    };
    let partial_ids: Vec<Uuid> = rest.iter().map(|c| c.keyshare_id).collect();
    for id in &partial_ids {
        load_in_use_keyshare(tx, id)?;
    }
    // a replayed preparation finds the last keyshare already solved
    if tx.get_keyshare(&last.keyshare_id)?.is_none() {
        calculate_and_store_last_key(tx, &node.keyshare_id, &partial_ids, last.keyshare_id)?;
    }

    for child in &node.children {
        let keyshare = load_in_use_keyshare(tx, &child.keyshare_id)?;
        let (_, address) = deposit_address(&keyshare.public_key, &child.user_public_key, network)?;
        record_deposit_address(
            tx,
            DepositAddress {
                keyshare_id: child.keyshare_id,
                address,
                owner_identity_pubkey: identity_public_key.to_vec(),
                owner_signing_pubkey: child.user_public_key.to_vec(),
            },
        )?;
        store_tree_keyshares(tx, child, identity_public_key, network)?;
    }
    Ok(())
}

fn address_node(
    tx: &dyn StoreTx,
    node: &PreparedAddressNode,
    network: Network,
) -> Result<AddressNode, OperatorError> {
    let keyshare = load_in_use_keyshare(tx, &node.keyshare_id)?;
    let (verifying_key, address) =
        deposit_address(&keyshare.public_key, &node.user_public_key, network)?;
    Ok(AddressNode {
        keyshare_id: node.keyshare_id,
        address,
        verifying_key: verifying_key.into(),
        children: node
            .children
            .iter()
            .map(|child| address_node(tx, child, network))
            .collect::<Result<_, _>>()?,
    })
}

/// Addresses for a tree that splits the output of a deposit address
///
/// The coordinator allocates the pool keyshares, solves each split's last
/// keyshare and records every child's owner, then has the other operators do
/// the same with the ids it chose.
pub async fn prepare_tree_address(
    node: &OperatorNode,
    request: &PrepareTreeAddressRequest,
) -> Result<PrepareTreeAddressResponse, OperatorError> {
    keys::parse_public_key(&request.identity_public_key)?;
    let (prepared, allocated, address) = {
        let mut tx = node.store.begin().await?;
        let parent = tx
            .deposit_address_by_address(&request.parent_address)?
            .ok_or_else(|| {
                OperatorError::NotFound(format!("deposit address {}", request.parent_address))
            })?;
        let count = check_tree(&parent, &request.identity_public_key, &request.node)?;

        let allocated: Vec<Uuid> = node
            .keyshares
            .allocate(tx.as_mut(), count)?
            .iter()
            .map(|k| k.id)
            .collect();
        let prepared = assign_keyshares(
            &request.node,
            parent.keyshare_id,
            &mut allocated.iter().copied(),
        )?;
        store_tree_keyshares(
            tx.as_mut(),
            &prepared,
            &request.identity_public_key,
            node.config.network,
        )?;
        let address = address_node(tx.as_ref(), &prepared, node.config.network)?;
        tx.commit()?;
        (prepared, allocated, address)
    };

    let mark = Arc::new(MarkKeysharesUsedRequest {
        keyshare_ids: allocated,
    });
    let replicated = Arc::new(InternalPrepareTreeAddressRequest {
        identity_public_key: request.identity_public_key.clone(),
        node: prepared,
    });
    let transport = node.transport.clone();
    execute_task_with_all_operators(&node.config, OperatorSelection::ExcludeSelf, |op| {
        let transport = transport.clone();
        let mark = mark.clone();
        let request = replicated.clone();
        async move {
            transport.mark_keyshares_used(&op, &mark).await?;
            transport.prepare_tree_address(&op, &request).await
        }
    })
    .await?;

    tracing::info!(
        parent_address = %request.parent_address,
        root_keyshare = %address.keyshare_id,
        "Prepared tree addresses"
    );
    Ok(PrepareTreeAddressResponse { node: address })
}

/// Replicated tree address preparation with the coordinator's keyshare ids
pub async fn handle_prepare_tree_address(
    node: &OperatorNode,
    request: &InternalPrepareTreeAddressRequest,
) -> Result<AckResponse, OperatorError> {
    let mut tx = node.store.begin().await?;
    let parent = tx
        .get_deposit_address(&request.node.keyshare_id)?
        .ok_or_else(|| {
            OperatorError::NotFound(format!(
                "deposit address for keyshare {}",
                request.node.keyshare_id
            ))
        })?;
    check_tree(
        &parent,
        &request.identity_public_key,
        &AddressRequestNode::from(&request.node),
    )?;
    store_tree_keyshares(
        tx.as_mut(),
        &request.node,
        &request.identity_public_key,
        node.config.network,
    )?;
    tx.commit()?;
    Ok(AckResponse {
        identifier: node.identifier(),
    })
}

/// Build the leaf a request describes, checking it against local state
///
/// The keyshare must have been handed out to the leaf's owner and must not
/// back any other tree node.
fn validate_leaf(tx: &dyn StoreTx, request: &CreateLeafRequest) -> Result<TreeNode, OperatorError> {
    let keyshare = load_in_use_keyshare(tx, &request.keyshare_id)?;
    let deposit = tx
        .get_deposit_address(&request.keyshare_id)?
        .ok_or_else(|| {
            OperatorError::Validation(format!(
                "keyshare {} has no deposit address",
                request.keyshare_id
            ))
        })?;
    if deposit.owner_identity_pubkey[..] != request.owner_identity_public_key[..]
        || deposit.owner_signing_pubkey[..] != request.owner_signing_public_key[..]
    {
        return Err(OperatorError::Validation(format!(
            "leaf owner does not match the deposit address of keyshare {}",
            request.keyshare_id
        )));
    }
    if let Some(existing) = tx.tree_node_by_keyshare(&request.keyshare_id)? {
        if existing.id != request.leaf_id {
            return Err(KeyshareError::AlreadyInUse(request.keyshare_id).into());
        }
    }
    keys::parse_public_key(&request.owner_identity_public_key)?;
    let verifying_key =
        keys::add_public_keys(&keyshare.public_key, &request.owner_signing_public_key)?;

    let node_tx = tx::parse_tx(&request.raw_tx)?;
    let output = tx::output(&node_tx, 0)?;
    if output.script_pubkey != tx::p2tr_script(&verifying_key)? {
        return Err(OperatorError::Validation(
            "leaf output does not pay to the verifying key".to_string(),
        ));
    }

    let refund = tx::parse_tx(&request.raw_refund_tx)?;
    let input = refund.input.first().ok_or(tx::TxError::MissingInput(0))?;
    if input.previous_output.txid != node_tx.compute_txid() || input.previous_output.vout != 0 {
        return Err(OperatorError::Validation(
            "refund does not spend the leaf output".to_string(),
        ));
    }

    if let Some(parent_id) = request.parent_id {
        if tx.get_tree_node(&parent_id)?.is_none() {
            return Err(OperatorError::NotFound(format!("parent node {}", parent_id)));
        }
    }

    Ok(TreeNode {
        id: request.leaf_id,
        tree_id: request.tree_id,
        parent_id: request.parent_id,
        value: output.value.to_sat(),
        status: TreeNodeStatus::Available,
        verifying_pubkey: verifying_key,
        owner_identity_pubkey: request.owner_identity_public_key.to_vec(),
        owner_signing_pubkey: request.owner_signing_public_key.to_vec(),
        signing_keyshare_id: request.keyshare_id,
        raw_tx: request.raw_tx.to_vec(),
        raw_refund_tx: request.raw_refund_tx.to_vec(),
        destination_lock_identity_pubkey: None,
    })
}

/// Register a funded leaf on every operator
pub async fn create_leaf(
    node: &OperatorNode,
    request: &CreateLeafRequest,
) -> Result<TreeNodeView, OperatorError> {
    let leaf = {
        let tx = node.store.begin().await?;
        validate_leaf(tx.as_ref(), request)?
    };

    let replicated = Arc::new(request.clone());
    let transport = node.transport.clone();
    execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = replicated.clone();
        async move { transport.create_leaf(&op, &request).await }
    })
    .await?;

    tracing::info!(leaf_id = %leaf.id, value = leaf.value, "Leaf registered");
    Ok(TreeNodeView::from(&leaf))
}

/// Store a leaf on this operator; replays of the same leaf are accepted
pub async fn handle_create_leaf(
    node: &OperatorNode,
    request: &CreateLeafRequest,
) -> Result<AckResponse, OperatorError> {
    let mut tx = node.store.begin().await?;
    let leaf = validate_leaf(tx.as_ref(), request)?;
    match tx.get_tree_node(&leaf.id)? {
        Some(existing) if existing == leaf => {}
        Some(_) => return Err(StorageError::Duplicate(format!("tree node {}", leaf.id)).into()),
        None => {
            tx.insert_tree_node(leaf)?;
            tx.commit()?;
        }
    }
    Ok(AckResponse {
        identifier: node.identifier(),
    })
}

/// Look up a leaf
pub async fn get_leaf(node: &OperatorNode, leaf_id: &Uuid) -> Result<TreeNodeView, OperatorError> {
    let tx = node.store.begin().await?;
    let leaf = tx
        .get_tree_node(leaf_id)?
        .ok_or_else(|| OperatorError::NotFound(format!("leaf {}", leaf_id)))?;
    Ok(TreeNodeView::from(&leaf))
}
