//! Hashes and identity signatures that bind DKG rounds together

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::config::SigningOperator;
use crate::keys::{self, KeyError};

/// Digest of the round-1 package set
///
/// Each map is hashed over its key-sorted `identifier || package` pairs, and
/// the per-map digests are hashed again in array order.
pub fn round1_packages_hash(maps: &[BTreeMap<String, Vec<u8>>]) -> Vec<u8> {
    let mut outer = Sha256::new();
    for map in maps {
        let mut inner = Sha256::new();
        // BTreeMap iterates in key order
        for (identifier, package) in map {
            inner.update(identifier.as_bytes());
            inner.update(package);
        }
        outer.update(inner.finalize());
    }
    outer.finalize().to_vec()
}

/// Digest of the round-2 packages one operator sends to one peer
pub fn round2_packages_hash(packages: &[Vec<u8>]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for package in packages {
        hasher.update(package);
    }
    hasher.finalize().to_vec()
}

pub fn sign_round1_packages(
    identity_key: &[u8],
    maps: &[BTreeMap<String, Vec<u8>>],
) -> Result<Vec<u8>, KeyError> {
    keys::sign_with_identity(identity_key, &round1_packages_hash(maps))
}

pub fn sign_round2_packages(identity_key: &[u8], packages: &[Vec<u8>]) -> Result<Vec<u8>, KeyError> {
    keys::sign_with_identity(identity_key, &round2_packages_hash(packages))
}

/// Identifiers of operators whose round-1 signature is missing or invalid
pub fn validate_round1_signatures(
    maps: &[BTreeMap<String, Vec<u8>>],
    signatures: &BTreeMap<String, Vec<u8>>,
    operators: &[SigningOperator],
) -> Vec<String> {
    let hash = round1_packages_hash(maps);
    operators
        .iter()
        .filter(|operator| {
            let Some(signature) = signatures.get(&operator.identifier) else {
                return true;
            };
            let Ok(public_key) = operator.identity_public_key_bytes() else {
                return true;
            };
            keys::verify_identity_signature(&public_key, &hash, signature).is_err()
        })
        .map(|operator| operator.identifier.clone())
        .collect()
}

pub fn verify_round2_signature(
    operator: &SigningOperator,
    packages: &[Vec<u8>],
    signature: &[u8],
) -> Result<(), KeyError> {
    let public_key = operator
        .identity_public_key_bytes()
        .map_err(|e| KeyError::InvalidPublicKey(e.to_string()))?;
    keys::verify_identity_signature(&public_key, &round2_packages_hash(packages), signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::tests::test_config;

    fn package_maps() -> Vec<BTreeMap<String, Vec<u8>>> {
        let mut first = BTreeMap::new();
        first.insert("b".to_string(), vec![2]);
        first.insert("a".to_string(), vec![1]);
        let mut second = BTreeMap::new();
        second.insert("a".to_string(), vec![3]);
        vec![first, second]
    }

    #[test]
    fn test_round1_hash_depends_on_array_order() {
        let maps = package_maps();
        let mut reversed = maps.clone();
        reversed.reverse();
        assert_eq!(round1_packages_hash(&maps), round1_packages_hash(&maps.clone()));
        assert_ne!(round1_packages_hash(&maps), round1_packages_hash(&reversed));
        assert_eq!(round1_packages_hash(&maps).len(), 32);
    }

    #[test]
    fn test_round1_signature_validation_reports_failures() {
        // operator i's identity key is [(i + 1); 32]
        let config = test_config(0, 3);
        let maps = package_maps();
        let mut signatures = BTreeMap::new();
        signatures.insert(
            config.operators[0].identifier.clone(),
            sign_round1_packages(&[1u8; 32], &maps).unwrap(),
        );
        // signed with the wrong key
        signatures.insert(
            config.operators[1].identifier.clone(),
            sign_round1_packages(&[9u8; 32], &maps).unwrap(),
        );

        let failures = validate_round1_signatures(&maps, &signatures, &config.operators);
        assert_eq!(
            failures,
            vec![
                config.operators[1].identifier.clone(),
                config.operators[2].identifier.clone()
            ]
        );

        signatures.insert(
            config.operators[1].identifier.clone(),
            sign_round1_packages(&[2u8; 32], &maps).unwrap(),
        );
        signatures.insert(
            config.operators[2].identifier.clone(),
            sign_round1_packages(&[3u8; 32], &maps).unwrap(),
        );
        assert!(validate_round1_signatures(&maps, &signatures, &config.operators).is_empty());
    }

    #[test]
    fn test_round2_signature() {
        let config = test_config(0, 2);
        let packages = vec![vec![1, 2], vec![3]];
        let signature = sign_round2_packages(&[2u8; 32], &packages).unwrap();
        verify_round2_signature(&config.operators[1], &packages, &signature).unwrap();
        assert!(verify_round2_signature(&config.operators[0], &packages, &signature).is_err());
    }
}
