//! DKG coordinator: runs a batch of key generations for this operator's pool

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::DkgError;
use crate::error::OperatorError;
use crate::logging::EventCategory;
use crate::node::OperatorNode;
use crate::operator::{execute_task_with_all_operators, spawn_detached, OperatorSelection};
use crate::types::{HexBytes, InitiateDkgRequest, Round1PackagesRequest, Round1SignatureRequest};

/// A DKG request whose round-1 signatures are being delivered
pub struct DkgRun {
    pub request_id: Uuid,
    pub key_count: usize,
    deliveries: Vec<JoinHandle<()>>,
}

impl DkgRun {
    /// Wait until every signature delivery has finished, successfully or not
    pub async fn wait(self) {
        for delivery in self.deliveries {
            // delivery failures are already logged
            let _ = delivery.await;
        }
    }
}

/// Generate `key_count` keys owned by this operator's pool
///
/// Returns once every operator has signed the round-1 package set. The
/// signature sets are then delivered to each operator in the background; a
/// failed delivery is logged and only wastes the keys of this request.
pub async fn generate_keys(node: &OperatorNode, key_count: usize) -> Result<DkgRun, OperatorError> {
    if key_count == 0 || key_count > super::MAX_KEYS_PER_REQUEST {
        return Err(DkgError::InvalidRequest(format!(
            "key_count must be between 1 and {}, got {}",
            super::MAX_KEYS_PER_REQUEST,
            key_count
        ))
        .into());
    }
    let request_id = Uuid::new_v4();
    let max_signers = u16::try_from(node.config.operator_count())
        .map_err(|_| DkgError::InvalidRequest("too many operators".to_string()))?;
    let initiate = Arc::new(InitiateDkgRequest {
        request_id,
        key_count,
        min_signers: node.config.threshold,
        max_signers,
        coordinator_index: node.config.index,
    });
    tracing::info!(request_id = %request_id, key_count, "Starting DKG");

    let transport = node.transport.clone();
    let responses = execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = initiate.clone();
        async move { transport.initiate_dkg(&op, &request).await }
    })
    .await?;

    let mut round1_packages: Vec<BTreeMap<String, HexBytes>> = vec![BTreeMap::new(); key_count];
    for (identifier, response) in responses {
        if response.round1_packages.len() != key_count {
            return Err(DkgError::PackageMismatch(format!(
                "operator {} returned {} round-1 packages for {} keys",
                identifier,
                response.round1_packages.len(),
                key_count
            ))
            .into());
        }
        for (map, package) in round1_packages.iter_mut().zip(response.round1_packages) {
            map.insert(identifier.clone(), package);
        }
    }

    let packages = Arc::new(Round1PackagesRequest {
        request_id,
        round1_packages,
    });
    let responses = execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = packages.clone();
        async move { transport.round1_packages(&op, &request).await }
    })
    .await?;
    let signatures: BTreeMap<String, HexBytes> = responses
        .into_iter()
        .map(|(identifier, response)| (identifier, response.signature))
        .collect();
    tracing::info!(request_id = %request_id, "Collected round-1 signatures");

    let request = Arc::new(Round1SignatureRequest {
        request_id,
        signatures,
    });
    let deliveries = node
        .config
        .operators
        .iter()
        .cloned()
        .map(|op| {
            let transport = transport.clone();
            let request = request.clone();
            spawn_detached(
                EventCategory::Dkg,
                "dkg_round1_signature",
                request_id.to_string(),
                async move {
                    let response = transport
                        .round1_signature(&op, &request)
                        .await
                        .map_err(OperatorError::from)?;
                    if !response.validation_failures.is_empty() {
                        return Err(OperatorError::from(DkgError::ValidationFailed(
                            response.validation_failures,
                        )));
                    }
                    Ok(())
                },
            )
        })
        .collect();

    Ok(DkgRun {
        request_id,
        key_count,
        deliveries,
    })
}
