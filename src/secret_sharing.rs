//! Feldman verifiable secret sharing over secp256k1
//!
//! A secret is split with a random polynomial `f` of degree `threshold - 1`
//! where `f(0)` is the secret. Share `i` is `f(i)` and the proofs are the
//! coefficient commitments `a_k * G`, so anyone holding a share can check it
//! against the dealer's polynomial without learning the secret.

use crate::keys::{self, KeyError};
use k256::elliptic_curve::Field;
use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretSharingError {
    #[error("invalid threshold {threshold} for {shares} shares")]
    InvalidThreshold { threshold: usize, shares: usize },
    #[error("share index must be non-zero")]
    ZeroIndex,
    #[error("expected {expected} proofs, got {actual}")]
    ProofCountMismatch { expected: usize, actual: usize },
    #[error("share {0} does not match its proofs")]
    InvalidShare(u64),
    #[error("need at least {threshold} shares, got {actual}")]
    NotEnoughShares { threshold: usize, actual: usize },
    #[error("duplicate share index {0}")]
    DuplicateIndex(u64),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// One evaluation of the sharing polynomial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretShare {
    pub threshold: usize,
    /// Evaluation point (one-based)
    pub index: u64,
    /// 32-byte scalar `f(index)`
    pub share: Vec<u8>,
}

/// A share together with the polynomial commitments it can be checked against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiableSecretShare {
    pub share: SecretShare,
    /// Compressed points `a_k * G`, `proofs[0]` commits to the secret
    pub proofs: Vec<Vec<u8>>,
}

fn evaluate_polynomial(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients
        .iter()
        .rev()
        .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient)
}

/// Split `secret` into `shares` shares, any `threshold` of which recover it
pub fn split_secret_with_proofs(
    secret: &[u8],
    threshold: usize,
    shares: usize,
) -> Result<Vec<VerifiableSecretShare>, SecretSharingError> {
    if threshold == 0 || threshold > shares {
        return Err(SecretSharingError::InvalidThreshold { threshold, shares });
    }

    let mut rng = rand::thread_rng();
    let mut coefficients = Vec::with_capacity(threshold);
    coefficients.push(keys::parse_private_key(secret)?);
    for _ in 1..threshold {
        coefficients.push(Scalar::random(&mut rng));
    }

    let proofs = coefficients
        .iter()
        .map(|c| keys::serialize_point(&(ProjectivePoint::GENERATOR * c)))
        .collect::<Result<Vec<_>, _>>()?;

    Ok((1..=shares as u64)
        .map(|index| {
            let value = evaluate_polynomial(&coefficients, &Scalar::from(index));
            VerifiableSecretShare {
                share: SecretShare {
                    threshold,
                    index,
                    share: keys::serialize_scalar(&value),
                },
                proofs: proofs.clone(),
            }
        })
        .collect())
}

/// Evaluate the committed polynomial at `x` in the exponent
pub fn evaluate_commitments(
    proofs: &[Vec<u8>],
    x: &Scalar,
) -> Result<ProjectivePoint, SecretSharingError> {
    let mut result = ProjectivePoint::IDENTITY;
    for proof in proofs.iter().rev() {
        result = result * x + keys::parse_public_key(proof)?;
    }
    Ok(result)
}

/// Check a share against its polynomial commitments
pub fn validate_share(share: &VerifiableSecretShare) -> Result<(), SecretSharingError> {
    if share.share.index == 0 {
        return Err(SecretSharingError::ZeroIndex);
    }
    if share.proofs.len() != share.share.threshold {
        return Err(SecretSharingError::ProofCountMismatch {
            expected: share.share.threshold,
            actual: share.proofs.len(),
        });
    }

    let value = keys::parse_private_key(&share.share.share)?;
    let expected = evaluate_commitments(&share.proofs, &Scalar::from(share.share.index))?;
    if ProjectivePoint::GENERATOR * value != expected {
        return Err(SecretSharingError::InvalidShare(share.share.index));
    }
    Ok(())
}

/// Lagrange coefficient at zero for `x_i` within the evaluation set `xs`
pub fn lagrange_coefficient(x_i: &Scalar, xs: &[Scalar]) -> Result<Scalar, SecretSharingError> {
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;
    for x_j in xs.iter().filter(|x| *x != x_i) {
        numerator *= x_j;
        denominator *= *x_j - x_i;
    }
    Option::<Scalar>::from(denominator.invert())
        .map(|inverse| numerator * inverse)
        .ok_or_else(|| SecretSharingError::InvalidIdentifier("duplicate evaluation point".into()))
}

/// Recover the secret from at least `threshold` shares
pub fn recover_secret(shares: &[SecretShare]) -> Result<Vec<u8>, SecretSharingError> {
    let threshold = shares.first().map(|s| s.threshold).unwrap_or(1);
    if shares.len() < threshold || shares.is_empty() {
        return Err(SecretSharingError::NotEnoughShares {
            threshold,
            actual: shares.len(),
        });
    }

    let mut seen = HashSet::new();
    for share in shares {
        if share.index == 0 {
            return Err(SecretSharingError::ZeroIndex);
        }
        if !seen.insert(share.index) {
            return Err(SecretSharingError::DuplicateIndex(share.index));
        }
    }

    let xs: Vec<Scalar> = shares.iter().map(|s| Scalar::from(s.index)).collect();
    let mut secret = Scalar::ZERO;
    for (share, x) in shares.iter().zip(&xs) {
        secret += keys::parse_private_key(&share.share)? * lagrange_coefficient(x, &xs)?;
    }
    Ok(keys::serialize_scalar(&secret))
}

/// Scalar value of a hex-encoded 32-byte operator identifier
pub fn identifier_scalar(identifier: &str) -> Result<Scalar, SecretSharingError> {
    let bytes = hex::decode(identifier)
        .map_err(|e| SecretSharingError::InvalidIdentifier(e.to_string()))?;
    let scalar = keys::parse_private_key(&bytes)
        .map_err(|e| SecretSharingError::InvalidIdentifier(e.to_string()))?;
    if scalar == Scalar::ZERO {
        return Err(SecretSharingError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(scalar)
}

/// Group public key of a sharing: the public shares interpolated at zero
pub fn combine_public_shares(
    public_shares: &BTreeMap<String, Vec<u8>>,
) -> Result<Vec<u8>, SecretSharingError> {
    let xs = public_shares
        .keys()
        .map(|id| identifier_scalar(id))
        .collect::<Result<Vec<_>, _>>()?;

    let mut combined = ProjectivePoint::IDENTITY;
    for (public_share, x) in public_shares.values().zip(&xs) {
        combined += keys::parse_public_key(public_share)? * lagrange_coefficient(x, &xs)?;
    }
    Ok(keys::serialize_point(&combined)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::operator_identifier;

    #[test]
    fn test_split_validate_recover() {
        let secret = keys::generate_private_key();
        let shares = split_secret_with_proofs(&secret, 3, 5).unwrap();
        assert_eq!(shares.len(), 5);
        for share in &shares {
            validate_share(share).unwrap();
            assert_eq!(share.proofs[0], keys::public_key_from_private_key(&secret).unwrap());
        }

        let subset: Vec<SecretShare> = shares.iter().skip(2).map(|s| s.share.clone()).collect();
        assert_eq!(recover_secret(&subset).unwrap(), secret);

        let too_few: Vec<SecretShare> = shares.iter().take(2).map(|s| s.share.clone()).collect();
        assert!(matches!(
            recover_secret(&too_few),
            Err(SecretSharingError::NotEnoughShares { .. })
        ));
    }

    #[test]
    fn test_tampered_share_rejected() {
        let secret = keys::generate_private_key();
        let mut shares = split_secret_with_proofs(&secret, 2, 3).unwrap();
        let share = &mut shares[1];
        share.share.share = keys::add_private_keys(&share.share.share, &[1u8; 32]).unwrap();
        assert!(matches!(
            validate_share(share),
            Err(SecretSharingError::InvalidShare(2))
        ));

        let mut wrong_index = shares[0].clone();
        wrong_index.share.index = 3;
        assert!(validate_share(&wrong_index).is_err());

        let mut truncated = shares[2].clone();
        truncated.proofs.pop();
        assert!(matches!(
            validate_share(&truncated),
            Err(SecretSharingError::ProofCountMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_threshold() {
        let secret = keys::generate_private_key();
        assert!(split_secret_with_proofs(&secret, 0, 3).is_err());
        assert!(split_secret_with_proofs(&secret, 4, 3).is_err());
    }

    #[test]
    fn test_combine_public_shares_recovers_group_key() {
        let secret = keys::generate_private_key();
        let shares = split_secret_with_proofs(&secret, 2, 3).unwrap();
        let public_shares: BTreeMap<String, Vec<u8>> = shares
            .iter()
            .map(|s| {
                (
                    operator_identifier((s.share.index - 1) as u32),
                    keys::public_key_from_private_key(&s.share.share).unwrap(),
                )
            })
            .collect();
        assert_eq!(
            combine_public_shares(&public_shares).unwrap(),
            keys::public_key_from_private_key(&secret).unwrap()
        );
    }

    #[test]
    fn test_evaluate_commitments_matches_shares() {
        let secret = keys::generate_private_key();
        let shares = split_secret_with_proofs(&secret, 3, 4).unwrap();
        for share in &shares {
            let point =
                evaluate_commitments(&share.proofs, &Scalar::from(share.share.index)).unwrap();
            assert_eq!(
                keys::serialize_point(&point).unwrap(),
                keys::public_key_from_private_key(&share.share.share).unwrap()
            );
        }
    }
}
