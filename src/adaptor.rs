//! Adaptor signatures over FROST shares
//!
//! The nonce point of an adaptor signature is shifted by an adaptor point
//! `T = t*G`. Every signer computes its share against the group commitment
//! `R + T`, so the aggregate `(x(R + T), z)` is not a valid BIP-340 signature
//! until `t` is folded into `z`. Whoever later sees both the adaptor signature
//! and the completed one learns `t`.
//!
//! Keys are tweaked exactly as for a plain Taproot key-spend signature.

use frost_core::Ciphersuite;
use frost_secp256k1_tr::keys::{EvenY, Tweak};
use frost_secp256k1_tr::{self as frost, Secp256K1Sha256TR};
use k256::elliptic_curve::point::AffineCoordinates;
use k256::{ProjectivePoint, Scalar};
use std::collections::BTreeMap;

use crate::frost_signer::{frost_error, SigningError};
use crate::keys;
use crate::tx;

fn is_odd(point: &ProjectivePoint) -> bool {
    point.to_affine().y_is_odd().into()
}

fn invalid(reason: impl Into<String>) -> SigningError {
    SigningError::InvalidAdaptor(reason.into())
}

/// Binding factors, group commitment and challenge of one adaptor signing
struct Session {
    binding_factors: frost_core::BindingFactorList<Secp256K1Sha256TR>,
    commitment: ProjectivePoint,
    shifted: ProjectivePoint,
    challenge: Scalar,
}

impl Session {
    fn new(
        package: &frost::SigningPackage,
        verifying_key: &frost::VerifyingKey,
        adaptor: &ProjectivePoint,
    ) -> Result<Self, SigningError> {
        let binding_factors = frost_core::compute_binding_factor_list(package, verifying_key, &[])
            .map_err(frost_error)?;
        let commitment = frost_core::compute_group_commitment(package, &binding_factors)
            .map_err(frost_error)?
            .to_element();
        let shifted = commitment + adaptor;
        if shifted == ProjectivePoint::IDENTITY {
            return Err(invalid("adaptor point cancels the group commitment"));
        }
        let challenge = Secp256K1Sha256TR::challenge(&shifted, verifying_key, package.message())
            .map_err(frost_error)?
            .to_scalar();
        Ok(Self {
            binding_factors,
            commitment,
            shifted,
            challenge,
        })
    }

    /// BIP-340 signs with the even-y nonce point
    fn negate_nonces(&self) -> bool {
        is_odd(&self.shifted)
    }

    fn binding_factor(&self, identifier: &frost::Identifier) -> Result<Scalar, SigningError> {
        let factor = self
            .binding_factors
            .get(identifier)
            .ok_or_else(|| SigningError::MissingCommitment(hex::encode(identifier.serialize())))?;
        Ok(keys::parse_private_key(&factor.serialize())?)
    }
}

/// Signature share against the group commitment shifted by `adaptor`
pub(crate) fn signature_share(
    package: &frost::SigningPackage,
    nonces: &frost::round1::SigningNonces,
    key_package: &frost::keys::KeyPackage,
    adaptor: &ProjectivePoint,
) -> Result<Vec<u8>, SigningError> {
    let key_package = key_package.clone().tweak::<&[u8]>(None).into_even_y(None);
    let identifier = key_package.identifier();
    if package.signing_commitments().len() < *key_package.min_signers() as usize {
        return Err(frost_error(frost::Error::IncorrectNumberOfCommitments));
    }
    if package.signing_commitment(identifier) != Some(*nonces.commitments()) {
        return Err(frost_error(frost::Error::IncorrectCommitment));
    }

    let session = Session::new(package, key_package.verifying_key(), adaptor)?;
    let lambda = frost_core::derive_interpolating_value(identifier, package).map_err(frost_error)?;
    let hiding = keys::parse_private_key(&nonces.hiding().serialize())?;
    let binding = keys::parse_private_key(&nonces.binding().serialize())?;
    let mut nonce = hiding + binding * session.binding_factor(identifier)?;
    if session.negate_nonces() {
        nonce = -nonce;
    }
    let secret = keys::parse_private_key(&key_package.signing_share().serialize())?;
    Ok(keys::serialize_scalar(
        &(nonce + lambda * secret * session.challenge),
    ))
}

/// Sum the shares into `x(R + T) || z` and check the result against the
/// tweaked group key
pub(crate) fn aggregate(
    package: &frost::SigningPackage,
    shares: &BTreeMap<frost::Identifier, Vec<u8>>,
    public_key_package: &frost::keys::PublicKeyPackage,
    adaptor: &ProjectivePoint,
) -> Result<Vec<u8>, SigningError> {
    if let Some(missing) = package
        .signing_commitments()
        .keys()
        .find(|id| !shares.contains_key(id))
    {
        return Err(SigningError::Aggregation(format!(
            "no signature share from {}",
            hex::encode(missing.serialize())
        )));
    }

    let public_key_package = public_key_package
        .clone()
        .tweak::<&[u8]>(None)
        .into_even_y(None);
    let session = Session::new(package, public_key_package.verifying_key(), adaptor)?;
    let mut z = Scalar::ZERO;
    for share in shares.values() {
        z += keys::parse_private_key(share)?;
    }

    let group_key = keys::parse_public_key(
        &public_key_package
            .verifying_key()
            .serialize()
            .map_err(frost_error)?,
    )?;
    let nonce_point = if session.negate_nonces() {
        -session.commitment
    } else {
        session.commitment
    };
    if ProjectivePoint::GENERATOR * z != nonce_point + group_key * session.challenge {
        return Err(SigningError::Aggregation(
            "adaptor signature does not verify".to_string(),
        ));
    }

    let mut signature = session.shifted.to_affine().x().to_vec();
    signature.extend_from_slice(&keys::serialize_scalar(&z));
    Ok(signature)
}

fn split_signature(signature: &[u8]) -> Result<(&[u8], Scalar), SigningError> {
    if signature.len() != 64 {
        return Err(invalid(format!(
            "signature must be 64 bytes, got {}",
            signature.len()
        )));
    }
    let (nonce, z) = signature.split_at(32);
    Ok((nonce, keys::parse_private_key(z)?))
}

/// Turn an adaptor signature into a BIP-340 signature under the Taproot
/// output key of `verifying_key`, using the adaptor secret
pub fn complete_adaptor_signature(
    adaptor_signature: &[u8],
    adaptor_secret: &[u8],
    verifying_key: &[u8],
    message: &[u8],
) -> Result<Vec<u8>, SigningError> {
    let (nonce, z) = split_signature(adaptor_signature)?;
    let t = keys::parse_private_key(adaptor_secret)?;
    let output_key =
        tx::taproot_output_key(verifying_key).map_err(|e| invalid(e.to_string()))?;

    // which sign applies depends on the parity of R + T
    for candidate in [z + t, z - t] {
        let mut signature = nonce.to_vec();
        signature.extend_from_slice(&keys::serialize_scalar(&candidate));
        if tx::verify_schnorr(&output_key, message, &signature).is_ok() {
            return Ok(signature);
        }
    }
    Err(invalid("adaptor secret does not complete the signature"))
}

/// Recover the adaptor secret from an adaptor signature and the signature
/// it was completed into
pub fn extract_adaptor_secret(
    adaptor_signature: &[u8],
    signature: &[u8],
    adaptor_public_key: &[u8],
) -> Result<Vec<u8>, SigningError> {
    let (adaptor_nonce, z) = split_signature(adaptor_signature)?;
    let (nonce, completed) = split_signature(signature)?;
    if adaptor_nonce != nonce {
        return Err(invalid("signatures use different nonces"));
    }
    let adaptor = keys::parse_public_key(adaptor_public_key)?;
    [completed - z, z - completed]
        .into_iter()
        .find(|t| ProjectivePoint::GENERATOR * t == adaptor)
        .map(|t| keys::serialize_scalar(&t))
        .ok_or_else(|| invalid("signature was not completed with this adaptor"))
}
