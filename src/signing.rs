//! Distributed signing coordination
//!
//! The coordinator drives both FROST rounds across the whole federation. There
//! is no quorum fallback: every operator must commit and sign, since the
//! keyshares are generated with all operators as signers.

use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::OperatorError;
use crate::frost_signer::{self, SigningResult};
use crate::keyshare::KeyshareError;
use crate::logging::log_signing_event;
use crate::models::SigningKeyshare;
use crate::node::OperatorNode;
use crate::operator::{execute_task_with_all_operators, OperatorSelection};
use crate::store::StoreTx;
use crate::transport::TransportError;
use crate::types::{
    FrostRound1Request, FrostRound1Response, FrostRound2Request, FrostRound2Response,
    FrostSigningJob, HexBytes,
};

/// A signature the coordinator should produce
#[derive(Debug, Clone)]
pub struct SigningJob {
    pub job_id: String,
    pub keyshare_id: Uuid,
    /// 32-byte sighash
    pub message: Vec<u8>,
    /// Leaf verifying key; equals the keyshare public key when no user signs
    pub verifying_key: Vec<u8>,
    pub user_commitment: Option<Vec<u8>>,
    pub adaptor_public_key: Option<Vec<u8>>,
}

fn load_keyshares(tx: &dyn StoreTx, ids: &[Uuid]) -> Result<Vec<SigningKeyshare>, OperatorError> {
    ids.iter()
        .map(|id| {
            tx.get_keyshare(id)?
                .ok_or_else(|| OperatorError::from(KeyshareError::NotFound(*id)))
        })
        .collect()
}

/// Run both signing rounds for `jobs` on every operator
///
/// Returns one [`SigningResult`] per job, in job order, carrying the operator
/// shares and everything the user needs to add its own share and aggregate.
pub async fn sign_frost(
    node: &OperatorNode,
    jobs: Vec<SigningJob>,
) -> Result<Vec<SigningResult>, OperatorError> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let adaptor_jobs = jobs.iter().filter(|j| j.adaptor_public_key.is_some()).count();
    let job_count = jobs.len();
    let result = run_signing_rounds(node, jobs).await;
    match &result {
        Ok(results) => log_signing_event("signing_completed", results.len(), adaptor_jobs, None),
        Err(err) => log_signing_event(
            "signing_failed",
            job_count,
            adaptor_jobs,
            Some((err.error_code(), &err.to_string())),
        ),
    }
    result
}

async fn run_signing_rounds(
    node: &OperatorNode,
    jobs: Vec<SigningJob>,
) -> Result<Vec<SigningResult>, OperatorError> {
    let keyshare_ids: Vec<Uuid> = jobs.iter().map(|j| j.keyshare_id).collect();
    let keyshares = {
        let tx = node.store.begin().await?;
        load_keyshares(tx.as_ref(), &keyshare_ids)?
    };

    let transport = node.transport.clone();
    let round1 = Arc::new(FrostRound1Request {
        keyshare_ids: keyshare_ids.clone(),
    });
    let responses = execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = round1.clone();
        async move {
            let response = transport.frost_round1(&op, &request).await?;
            if response.commitments.len() != request.keyshare_ids.len() {
                return Err(TransportError::Decode(format!(
                    "operator {} returned {} commitments for {} keyshares",
                    op.identifier,
                    response.commitments.len(),
                    request.keyshare_ids.len()
                )));
            }
            Ok(response)
        }
    })
    .await?;

    // job index -> operator identifier -> commitment
    let mut commitments: Vec<BTreeMap<String, Vec<u8>>> = vec![BTreeMap::new(); jobs.len()];
    for (identifier, response) in responses {
        for (per_job, commitment) in commitments.iter_mut().zip(response.commitments) {
            per_job.insert(identifier.clone(), commitment.0);
        }
    }
    tracing::debug!(jobs = jobs.len(), "Collected round-1 commitments");

    let round2 = Arc::new(FrostRound2Request {
        jobs: jobs
            .iter()
            .zip(&commitments)
            .map(|(job, job_commitments)| FrostSigningJob {
                job_id: job.job_id.clone(),
                keyshare_id: job.keyshare_id,
                message: job.message.clone().into(),
                verifying_key: job.verifying_key.clone().into(),
                commitments: job_commitments
                    .iter()
                    .map(|(id, c)| (id.clone(), HexBytes(c.clone())))
                    .collect(),
                user_commitment: job.user_commitment.clone().map(HexBytes),
                adaptor_public_key: job.adaptor_public_key.clone().map(HexBytes),
            })
            .collect(),
    });
    let responses = execute_task_with_all_operators(&node.config, OperatorSelection::All, |op| {
        let transport = transport.clone();
        let request = round2.clone();
        async move {
            let response = transport.frost_round2(&op, &request).await?;
            if let Some(missing) = request
                .jobs
                .iter()
                .find(|job| !response.signature_shares.contains_key(&job.job_id))
            {
                return Err(TransportError::Decode(format!(
                    "operator {} returned no signature share for job {}",
                    op.identifier, missing.job_id
                )));
            }
            Ok(response)
        }
    })
    .await?;

    let mut results = Vec::with_capacity(jobs.len());
    for ((job, keyshare), job_commitments) in jobs.into_iter().zip(keyshares).zip(commitments) {
        let signature_shares = responses
            .iter()
            .filter_map(|(identifier, response)| {
                response
                    .signature_shares
                    .get(&job.job_id)
                    .map(|share| (identifier.clone(), share.0.clone()))
            })
            .collect();
        results.push(SigningResult {
            job_id: job.job_id,
            message: job.message,
            verifying_key: job.verifying_key,
            keyshare_public_key: keyshare.public_key,
            public_shares: keyshare.public_shares,
            min_signers: keyshare.min_signers,
            signing_commitments: job_commitments,
            user_commitment: job.user_commitment,
            adaptor_public_key: job.adaptor_public_key,
            signature_shares,
        });
    }

    Ok(results)
}

/// Round 1 on this operator: commit to fresh nonces for each keyshare
pub async fn handle_frost_round1(
    node: &OperatorNode,
    request: &FrostRound1Request,
) -> Result<FrostRound1Response, OperatorError> {
    let keyshares = {
        let tx = node.store.begin().await?;
        load_keyshares(tx.as_ref(), &request.keyshare_ids)?
    };
    let commitments = node.signer.commit(&keyshares).await?;
    Ok(FrostRound1Response {
        identifier: node.identifier(),
        commitments: commitments.into_iter().map(HexBytes).collect(),
    })
}

/// Round 2 on this operator: produce a signature share per job
pub async fn handle_frost_round2(
    node: &OperatorNode,
    request: &FrostRound2Request,
) -> Result<FrostRound2Response, OperatorError> {
    let keyshare_ids: Vec<Uuid> = request.jobs.iter().map(|j| j.keyshare_id).collect();
    let keyshares = {
        let tx = node.store.begin().await?;
        load_keyshares(tx.as_ref(), &keyshare_ids)?
    };

    let jobs: Vec<frost_signer::SigningJob> = request
        .jobs
        .iter()
        .zip(keyshares)
        .map(|(job, keyshare)| frost_signer::SigningJob {
            job_id: job.job_id.clone(),
            keyshare,
            message: job.message.to_vec(),
            verifying_key: job.verifying_key.to_vec(),
            commitments: job
                .commitments
                .iter()
                .map(|(id, c)| (id.clone(), c.to_vec()))
                .collect(),
            user_commitment: job.user_commitment.as_ref().map(|c| c.to_vec()),
            adaptor_public_key: job.adaptor_public_key.as_ref().map(|k| k.to_vec()),
        })
        .collect();

    let shares = node.signer.sign(&jobs).await?;
    Ok(FrostRound2Response {
        identifier: node.identifier(),
        signature_shares: shares
            .into_iter()
            .map(|(job_id, share)| (job_id, HexBytes(share)))
            .collect(),
    })
}
