//! secp256k1 key arithmetic and identity signatures
//!
//! Private keys are 32-byte big-endian scalars, public keys 33-byte compressed
//! points. The point at infinity is never produced as a serialized key.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::{Field, PrimeField};
use k256::{FieldBytes, ProjectivePoint, PublicKey, Scalar};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid private key length: expected 32 bytes, got {0}")]
    InvalidPrivateKeyLength(usize),
    #[error("private key is not a valid scalar")]
    PrivateKeyOutOfRange,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("result is the point at infinity")]
    IdentityPoint,
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("signature verification failed")]
    VerificationFailed,
}

/// Parse a 32-byte big-endian scalar
pub fn parse_private_key(bytes: &[u8]) -> Result<Scalar, KeyError> {
    if bytes.len() != 32 {
        return Err(KeyError::InvalidPrivateKeyLength(bytes.len()));
    }
    let repr = FieldBytes::clone_from_slice(bytes);
    Option::<Scalar>::from(Scalar::from_repr(repr)).ok_or(KeyError::PrivateKeyOutOfRange)
}

/// Parse a SEC1 encoded public key
pub fn parse_public_key(bytes: &[u8]) -> Result<ProjectivePoint, KeyError> {
    PublicKey::from_sec1_bytes(bytes)
        .map(|pk| pk.to_projective())
        .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))
}

pub fn serialize_scalar(scalar: &Scalar) -> Vec<u8> {
    scalar.to_bytes().to_vec()
}

/// Compressed encoding of a point, rejecting the identity
pub fn serialize_point(point: &ProjectivePoint) -> Result<Vec<u8>, KeyError> {
    if *point == ProjectivePoint::IDENTITY {
        return Err(KeyError::IdentityPoint);
    }
    Ok(point.to_affine().to_encoded_point(true).as_bytes().to_vec())
}

/// Random non-zero private key
pub fn generate_private_key() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    loop {
        let scalar = Scalar::random(&mut rng);
        if scalar != Scalar::ZERO {
            return serialize_scalar(&scalar);
        }
    }
}

pub fn public_key_from_private_key(private_key: &[u8]) -> Result<Vec<u8>, KeyError> {
    let scalar = parse_private_key(private_key)?;
    serialize_point(&(ProjectivePoint::GENERATOR * scalar))
}

pub fn add_private_keys(a: &[u8], b: &[u8]) -> Result<Vec<u8>, KeyError> {
    Ok(serialize_scalar(&(parse_private_key(a)? + parse_private_key(b)?)))
}

/// `a - b` mod n
pub fn subtract_private_keys(a: &[u8], b: &[u8]) -> Result<Vec<u8>, KeyError> {
    Ok(serialize_scalar(&(parse_private_key(a)? - parse_private_key(b)?)))
}

pub fn negate_private_key(key: &[u8]) -> Result<Vec<u8>, KeyError> {
    Ok(serialize_scalar(&(-parse_private_key(key)?)))
}

pub fn add_public_keys(a: &[u8], b: &[u8]) -> Result<Vec<u8>, KeyError> {
    serialize_point(&(parse_public_key(a)? + parse_public_key(b)?))
}

/// `a - b` on the curve
pub fn subtract_public_keys(a: &[u8], b: &[u8]) -> Result<Vec<u8>, KeyError> {
    serialize_point(&(parse_public_key(a)? - parse_public_key(b)?))
}

pub fn sum_public_keys<K: AsRef<[u8]>>(keys: &[K]) -> Result<Vec<u8>, KeyError> {
    let mut sum = ProjectivePoint::IDENTITY;
    for key in keys {
        sum += parse_public_key(key.as_ref())?;
    }
    serialize_point(&sum)
}

/// ECDSA signature (DER) over SHA-256 of `message` with an identity key
pub fn sign_with_identity(private_key: &[u8], message: &[u8]) -> Result<Vec<u8>, KeyError> {
    if private_key.len() != 32 {
        return Err(KeyError::InvalidPrivateKeyLength(private_key.len()));
    }
    let signing_key =
        SigningKey::from_slice(private_key).map_err(|_| KeyError::PrivateKeyOutOfRange)?;
    let signature: Signature = signing_key.sign(message);
    Ok(signature.to_der().as_bytes().to_vec())
}

/// Verify an identity signature produced by [`sign_with_identity`]
pub fn verify_identity_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), KeyError> {
    let verifying_key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
    let signature =
        Signature::from_der(signature).map_err(|e| KeyError::InvalidSignature(e.to_string()))?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| KeyError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_private_keys_matches_public_addition() {
        for _ in 0..64 {
            let a = generate_private_key();
            let b = generate_private_key();
            let sum = add_private_keys(&a, &b).unwrap();
            let expected = add_public_keys(
                &public_key_from_private_key(&a).unwrap(),
                &public_key_from_private_key(&b).unwrap(),
            )
            .unwrap();
            assert_eq!(public_key_from_private_key(&sum).unwrap(), expected);
        }
    }

    #[test]
    fn test_subtract_and_negate() {
        let a = generate_private_key();
        let b = generate_private_key();
        let diff = subtract_private_keys(&a, &b).unwrap();
        assert_eq!(add_private_keys(&diff, &b).unwrap(), a);
        assert_eq!(
            add_private_keys(&a, &negate_private_key(&b).unwrap()).unwrap(),
            diff
        );

        let pa = public_key_from_private_key(&a).unwrap();
        let pb = public_key_from_private_key(&b).unwrap();
        assert_eq!(
            subtract_public_keys(&pa, &pb).unwrap(),
            public_key_from_private_key(&diff).unwrap()
        );
    }

    #[test]
    fn test_identity_point_rejected() {
        let a = generate_private_key();
        let pa = public_key_from_private_key(&a).unwrap();
        assert!(matches!(
            subtract_public_keys(&pa, &pa),
            Err(KeyError::IdentityPoint)
        ));
        assert!(matches!(
            public_key_from_private_key(&[0u8; 32]),
            Err(KeyError::IdentityPoint)
        ));
    }

    #[test]
    fn test_sum_public_keys() {
        let keys: Vec<Vec<u8>> = (0..4).map(|_| generate_private_key()).collect();
        let total = keys
            .iter()
            .skip(1)
            .fold(keys[0].clone(), |acc, k| add_private_keys(&acc, k).unwrap());
        let publics: Vec<Vec<u8>> = keys
            .iter()
            .map(|k| public_key_from_private_key(k).unwrap())
            .collect();
        assert_eq!(
            sum_public_keys(&publics).unwrap(),
            public_key_from_private_key(&total).unwrap()
        );
    }

    #[test]
    fn test_invalid_lengths() {
        assert!(matches!(
            parse_private_key(&[1u8; 31]),
            Err(KeyError::InvalidPrivateKeyLength(31))
        ));
        assert!(parse_public_key(&[5u8; 33]).is_err());
    }

    #[test]
    fn test_identity_signature() {
        let key = generate_private_key();
        let public = public_key_from_private_key(&key).unwrap();
        let signature = sign_with_identity(&key, b"payload").unwrap();
        verify_identity_signature(&public, b"payload", &signature).unwrap();
        assert!(matches!(
            verify_identity_signature(&public, b"other", &signature),
            Err(KeyError::VerificationFailed)
        ));
    }
}
