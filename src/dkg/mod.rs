//! Distributed key generation for the keyshare pools
//!
//! A coordinator batches `key_count` independent FROST DKG runs under one
//! request id. Round-1 packages are cross-signed with operator identity keys
//! before anyone moves on to round 2, and round-2 packages travel directly
//! between operators, signed by their sender.

mod coordinator;
mod handler;
mod signature;
mod state;

pub use coordinator::{generate_keys, DkgRun};
pub use handler::{initiate_dkg, round1_packages, round1_signature, round2_packages};
pub use signature::{
    round1_packages_hash, round2_packages_hash, sign_round1_packages, sign_round2_packages,
    validate_round1_signatures, verify_round2_signature,
};
pub use state::{DkgState, DkgStateType, DkgStates};

use frost_secp256k1_tr as frost;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::frost_signer::{operator_frost_identifier, SigningError};
use crate::keys::KeyError;
use crate::models::{KeyshareStatus, SigningKeyshare};
use crate::store::StorageError;

/// DKG errors
#[derive(Debug, Error)]
pub enum DkgError {
    #[error("DKG state already exists for request {0}")]
    StateAlreadyExists(Uuid),
    #[error("DKG state not found for request {0}")]
    StateNotFound(Uuid),
    #[error("DKG request {request_id} is in state {actual}, expected {expected}")]
    UnexpectedState {
        request_id: Uuid,
        expected: DkgStateType,
        actual: DkgStateType,
    },
    #[error("invalid DKG request: {0}")]
    InvalidRequest(String),
    #[error("package mismatch: {0}")]
    PackageMismatch(String),
    #[error("unknown operator: {0}")]
    UnknownOperator(String),
    #[error("round-2 signature from {0} does not verify")]
    InvalidSignature(String),
    #[error("round-1 signature validation failed for {0:?}")]
    ValidationFailed(Vec<String>),
    #[error("FROST error: {0}")]
    FrostError(String),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

fn frost_error(e: frost::Error) -> DkgError {
    DkgError::FrostError(e.to_string())
}

/// Keys per request, bounded by the `u16` key index
pub const MAX_KEYS_PER_REQUEST: usize = u16::MAX as usize + 1;

/// Id of the `index`-th key generated by `request_id`
pub fn derive_key_index(request_id: Uuid, index: u16) -> Uuid {
    Uuid::from_u128(request_id.as_u128().wrapping_add(u128::from(index)))
}

fn parse_round1_packages(
    packages: &BTreeMap<String, Vec<u8>>,
    exclude: &str,
) -> Result<BTreeMap<frost::Identifier, frost::keys::dkg::round1::Package>, DkgError> {
    packages
        .iter()
        .filter(|(id, _)| id.as_str() != exclude)
        .map(|(id, bytes)| {
            let package =
                frost::keys::dkg::round1::Package::deserialize(bytes).map_err(frost_error)?;
            Ok((operator_frost_identifier(id)?, package))
        })
        .collect()
}

/// FROST part 1 for `key_count` keys
fn part1(
    identifier: &str,
    max_signers: u16,
    min_signers: u16,
    key_count: usize,
) -> Result<(Vec<Vec<u8>>, Vec<frost::keys::dkg::round1::SecretPackage>), DkgError> {
    let identifier = operator_frost_identifier(identifier)?;
    let mut rng = rand::thread_rng();
    let mut packages = Vec::with_capacity(key_count);
    let mut secrets = Vec::with_capacity(key_count);
    for _ in 0..key_count {
        let (secret, package) =
            frost::keys::dkg::part1(identifier, max_signers, min_signers, &mut rng)
                .map_err(frost_error)?;
        packages.push(package.serialize().map_err(frost_error)?);
        secrets.push(secret);
    }
    Ok((packages, secrets))
}

/// Round-2 output of one key: our secret plus a package per peer
type Part2Output = (
    frost::keys::dkg::round2::SecretPackage,
    BTreeMap<String, Vec<u8>>,
);

/// FROST part 2 per key, with packages addressed by operator identifier
fn part2(
    self_identifier: &str,
    secrets: Vec<frost::keys::dkg::round1::SecretPackage>,
    round1_packages: &[BTreeMap<String, Vec<u8>>],
) -> Result<Vec<Part2Output>, DkgError> {
    secrets
        .into_iter()
        .zip(round1_packages)
        .map(|(secret, packages)| {
            let others = parse_round1_packages(packages, self_identifier)?;
            let (round2_secret, round2_packages) =
                frost::keys::dkg::part2(secret, &others).map_err(frost_error)?;
            let by_operator = round2_packages
                .into_iter()
                .map(|(identifier, package)| {
                    Ok((
                        hex::encode(identifier.serialize()),
                        package.serialize().map_err(frost_error)?,
                    ))
                })
                .collect::<Result<BTreeMap<_, _>, DkgError>>()?;
            Ok((round2_secret, by_operator))
        })
        .collect()
}

/// FROST part 3: turn a finished request into Available keyshares
fn part3(
    request_id: Uuid,
    self_identifier: &str,
    state: &DkgState,
) -> Result<Vec<SigningKeyshare>, DkgError> {
    let mut keyshares = Vec::with_capacity(state.key_count);
    for (i, secret) in state.round2_secrets().iter().enumerate() {
        let round1 = parse_round1_packages(&state.received_round1_packages[i], self_identifier)?;
        let round2 = state.received_round2_packages[i]
            .iter()
            .map(|(id, bytes)| {
                let package =
                    frost::keys::dkg::round2::Package::deserialize(bytes).map_err(frost_error)?;
                Ok((operator_frost_identifier(id)?, package))
            })
            .collect::<Result<BTreeMap<_, _>, DkgError>>()?;

        let (key_package, public_key_package) =
            frost::keys::dkg::part3(secret, &round1, &round2).map_err(frost_error)?;

        let public_shares = public_key_package
            .verifying_shares()
            .iter()
            .map(|(identifier, share)| {
                Ok((
                    hex::encode(identifier.serialize()),
                    share.serialize().map_err(frost_error)?,
                ))
            })
            .collect::<Result<BTreeMap<_, _>, DkgError>>()?;

        let index = u16::try_from(i)
            .map_err(|_| DkgError::InvalidRequest(format!("key index {} out of range", i)))?;
        keyshares.push(SigningKeyshare {
            id: derive_key_index(request_id, index),
            status: KeyshareStatus::Available,
            secret_share: key_package.signing_share().serialize(),
            public_shares,
            public_key: public_key_package
                .verifying_key()
                .serialize()
                .map_err(frost_error)?,
            min_signers: state.min_signers,
            coordinator_index: state.coordinator_index,
        });
    }
    Ok(keyshares)
}
