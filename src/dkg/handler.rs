//! Per-operator DKG round handlers

use std::collections::BTreeMap;
use std::sync::Arc;

use super::signature::{sign_round1_packages, sign_round2_packages, verify_round2_signature};
use super::{part1, part2, part3, DkgError, MAX_KEYS_PER_REQUEST};
use crate::error::OperatorError;
use crate::node::OperatorNode;
use crate::operator::{execute_task_with_all_operators, OperatorSelection};
use crate::types::{
    HexBytes, InitiateDkgRequest, InitiateDkgResponse, Round1PackagesRequest,
    Round1PackagesResponse, Round1SignatureRequest, Round1SignatureResponse,
    Round2PackagesRequest, Round2PackagesResponse,
};

/// Start a DKG request and return this operator's round-1 packages
pub async fn initiate_dkg(
    node: &OperatorNode,
    request: &InitiateDkgRequest,
) -> Result<InitiateDkgResponse, OperatorError> {
    let operator_count = node.config.operator_count();
    if request.key_count == 0 || request.key_count > MAX_KEYS_PER_REQUEST {
        return Err(DkgError::InvalidRequest(format!(
            "key_count must be between 1 and {}, got {}",
            MAX_KEYS_PER_REQUEST, request.key_count
        ))
        .into());
    }
    if usize::from(request.max_signers) != operator_count
        || request.min_signers == 0
        || request.min_signers > request.max_signers
    {
        return Err(DkgError::InvalidRequest(format!(
            "min_signers {} / max_signers {} invalid for {} operators",
            request.min_signers, request.max_signers, operator_count
        ))
        .into());
    }

    tracing::info!(
        request_id = %request.request_id,
        key_count = request.key_count,
        min_signers = request.min_signers,
        max_signers = request.max_signers,
        "Initiating DKG"
    );
    node.dkg
        .initiate(
            request.request_id,
            request.min_signers,
            request.max_signers,
            request.key_count,
            request.coordinator_index,
        )
        .await?;

    let identifier = node.identifier();
    let generated = part1(
        &identifier,
        request.max_signers,
        request.min_signers,
        request.key_count,
    );
    let (packages, secrets) = match generated {
        Ok(generated) => generated,
        Err(err) => {
            node.dkg.remove(request.request_id).await;
            return Err(err.into());
        }
    };
    if let Err(err) = node
        .dkg
        .provide_round1_packages(request.request_id, packages.clone(), secrets)
        .await
    {
        node.dkg.remove(request.request_id).await;
        return Err(err.into());
    }

    Ok(InitiateDkgResponse {
        identifier,
        round1_packages: packages.into_iter().map(HexBytes).collect(),
    })
}

/// Accept the assembled round-1 package set and sign its hash
pub async fn round1_packages(
    node: &OperatorNode,
    request: &Round1PackagesRequest,
) -> Result<Round1PackagesResponse, OperatorError> {
    let maps: Vec<BTreeMap<String, Vec<u8>>> = request
        .round1_packages
        .iter()
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.to_vec())).collect())
        .collect();

    let identifier = node.identifier();
    node.dkg
        .receive_round1_packages(request.request_id, &identifier, maps.clone())
        .await?;
    let signature = sign_round1_packages(node.identity_key(), &maps).map_err(DkgError::from)?;

    tracing::info!(request_id = %request.request_id, "Signed round-1 packages");
    Ok(Round1PackagesResponse {
        identifier,
        signature: signature.into(),
    })
}

/// Verify every operator's round-1 signature, then run part 2 and deliver
/// the round-2 packages to each peer
pub async fn round1_signature(
    node: &OperatorNode,
    request: &Round1SignatureRequest,
) -> Result<Round1SignatureResponse, OperatorError> {
    let identifier = node.identifier();
    let request_id = request.request_id;
    let signatures: BTreeMap<String, Vec<u8>> = request
        .signatures
        .iter()
        .map(|(k, v)| (k.clone(), v.to_vec()))
        .collect();

    let inputs = match node
        .dkg
        .receive_round1_signatures(request_id, &signatures, &node.config.operators)
        .await?
    {
        Ok(inputs) => inputs,
        Err(validation_failures) => {
            return Ok(Round1SignatureResponse {
                identifier,
                validation_failures,
            })
        }
    };

    let outputs = match part2(&identifier, inputs.secrets, &inputs.round1_packages) {
        Ok(outputs) => outputs,
        Err(err) => {
            node.dkg.remove(request_id).await;
            return Err(err.into());
        }
    };
    let (secrets, packages): (Vec<_>, Vec<_>) = outputs.into_iter().unzip();
    node.dkg.provide_round2_secrets(request_id, secrets).await?;

    // per peer: one package per key, in key order
    let mut per_peer: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
    for key_packages in packages {
        for (peer, package) in key_packages {
            per_peer.entry(peer).or_default().push(package);
        }
    }
    let mut deliveries = BTreeMap::new();
    for (peer, packages) in per_peer {
        let signature = sign_round2_packages(node.identity_key(), &packages).map_err(DkgError::from)?;
        deliveries.insert(
            peer,
            Round2PackagesRequest {
                request_id,
                identifier: identifier.clone(),
                round2_packages: packages.into_iter().map(HexBytes).collect(),
                signature: signature.into(),
            },
        );
    }

    let deliveries = Arc::new(deliveries);
    let transport = node.transport.clone();
    execute_task_with_all_operators(&node.config, OperatorSelection::ExcludeSelf, |op| {
        let transport = transport.clone();
        let deliveries = deliveries.clone();
        async move {
            match deliveries.get(&op.identifier) {
                Some(delivery) => transport.round2_packages(&op, delivery).await,
                None => Err(crate::transport::TransportError::Decode(format!(
                    "no round-2 packages addressed to {}",
                    op.identifier
                ))),
            }
        }
    })
    .await?;
    tracing::info!(request_id = %request_id, "Delivered round-2 packages");

    proceed_to_round3(node, request_id).await?;
    Ok(Round1SignatureResponse {
        identifier,
        validation_failures: Vec::new(),
    })
}

/// Buffer a peer's signed round-2 packages
pub async fn round2_packages(
    node: &OperatorNode,
    request: &Round2PackagesRequest,
) -> Result<Round2PackagesResponse, OperatorError> {
    let identifier = node.identifier();
    if request.identifier == identifier {
        return Ok(Round2PackagesResponse {
            identifier,
            completed: false,
        });
    }

    let sender = node
        .config
        .operator_by_identifier(&request.identifier)
        .ok_or_else(|| DkgError::UnknownOperator(request.identifier.clone()))?;
    let packages: Vec<Vec<u8>> = request.round2_packages.iter().map(|p| p.to_vec()).collect();
    verify_round2_signature(sender, &packages, &request.signature)
        .map_err(|_| DkgError::InvalidSignature(request.identifier.clone()))?;

    node.dkg
        .receive_round2_packages(request.request_id, &request.identifier, packages)
        .await?;
    let completed = proceed_to_round3(node, request.request_id).await?;
    Ok(Round2PackagesResponse {
        identifier,
        completed,
    })
}

/// Run part 3 and store the keyshares if every peer's packages arrived
async fn proceed_to_round3(node: &OperatorNode, request_id: uuid::Uuid) -> Result<bool, OperatorError> {
    let Some(state) = node.dkg.take_if_ready(request_id).await else {
        return Ok(false);
    };

    let keyshares = part3(request_id, &node.identifier(), &state).inspect_err(|err| {
        tracing::error!(request_id = %request_id, error = %err, "DKG round 3 failed");
    })?;
    let count = keyshares.len();

    let mut tx = node.store.begin().await?;
    for keyshare in keyshares {
        tx.insert_keyshare(keyshare)?;
    }
    let available = tx.count_available_keyshares(state.coordinator_index)?;
    tx.commit()?;

    crate::logging::log_keyshare_event("keyshares_generated", count, available);
    tracing::info!(
        request_id = %request_id,
        count,
        coordinator_index = state.coordinator_index,
        "DKG completed"
    );
    Ok(true)
}
