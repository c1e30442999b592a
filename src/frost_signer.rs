//! FROST signing participant
//!
//! Each operator signs with its share of a keyshare. When a user takes part,
//! the signing group is the operators plus the user, and the verifying key is
//! the leaf key `keyshare.public_key + user_public_key`. The operators' shares
//! form a sharing of the keyshare secret alone, so before signing every share
//! is rescaled so that the Lagrange interpolation over operators and user sums
//! to `keyshare_secret + user_secret`:
//!
//! - operator `i`: `s_i * (x_u - x_i) / x_u`
//! - user: `s_u * prod_j (x_j - x_u) / x_j`
//!
//! Nonces are kept in memory keyed by their serialized commitment and are
//! deleted as soon as they are used, whether or not signing succeeds.
//!
//! Signatures are Taproot key-spend signatures: shares and aggregate are
//! computed under the BIP-341 tweak of the verifying key. A job carrying an
//! adaptor public key yields an adaptor signature instead (see [`crate::adaptor`]).

use frost_secp256k1_tr as frost;
use k256::{ProjectivePoint, Scalar};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::adaptor;
use crate::keys::{self, KeyError};
use crate::models::SigningKeyshare;

/// Signing errors
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid message length: expected 32 bytes, got {0}")]
    InvalidMessageLength(usize),
    #[error("missing commitment for operator {0}")]
    MissingCommitment(String),
    #[error("no nonce for commitment (unknown or already used)")]
    NonceNotFound,
    #[error("keyshare has no public share for operator {0}")]
    MissingPublicShare(String),
    #[error("verifying key does not match the keyshare")]
    VerifyingKeyMismatch,
    #[error("invalid adaptor: {0}")]
    InvalidAdaptor(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("signature aggregation failed: {0}")]
    Aggregation(String),
    #[error("FROST error: {0}")]
    FrostError(String),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

pub(crate) fn frost_error(e: frost::Error) -> SigningError {
    SigningError::FrostError(e.to_string())
}

/// Identifier the user signs under
pub fn user_identifier() -> Result<frost::Identifier, SigningError> {
    frost::Identifier::derive(b"user").map_err(frost_error)
}

/// Parse a hex operator identifier
pub fn operator_frost_identifier(identifier: &str) -> Result<frost::Identifier, SigningError> {
    let bytes =
        hex::decode(identifier).map_err(|e| SigningError::InvalidIdentifier(e.to_string()))?;
    frost::Identifier::deserialize(&bytes).map_err(frost_error)
}

fn scalar_of(identifier: &frost::Identifier) -> Result<Scalar, SigningError> {
    Ok(keys::parse_private_key(&identifier.serialize())?)
}

fn invert(value: &Scalar) -> Result<Scalar, SigningError> {
    Option::<Scalar>::from(value.invert())
        .ok_or_else(|| SigningError::InvalidIdentifier("zero denominator".to_string()))
}

fn signing_share(value: &Scalar) -> Result<frost::keys::SigningShare, SigningError> {
    frost::keys::SigningShare::deserialize(&keys::serialize_scalar(value)).map_err(frost_error)
}

fn verifying_share(point: &ProjectivePoint) -> Result<frost::keys::VerifyingShare, SigningError> {
    frost::keys::VerifyingShare::deserialize(&keys::serialize_point(point)?).map_err(frost_error)
}

fn verifying_key(bytes: &[u8]) -> Result<frost::VerifyingKey, SigningError> {
    frost::VerifyingKey::deserialize(bytes).map_err(frost_error)
}

/// Participants of one signing and the factor applied to each share
struct SigningSet {
    operators: BTreeMap<String, (frost::Identifier, Scalar)>,
    user: Option<(frost::Identifier, Scalar)>,
}

impl SigningSet {
    fn new<'a>(
        operator_ids: impl Iterator<Item = &'a String>,
        with_user: bool,
    ) -> Result<Self, SigningError> {
        let mut operators = BTreeMap::new();
        for id in operator_ids {
            let identifier = operator_frost_identifier(id)?;
            operators.insert(id.clone(), (identifier, Scalar::ONE));
        }
        if !with_user {
            return Ok(Self {
                operators,
                user: None,
            });
        }

        let user = user_identifier()?;
        let x_u = scalar_of(&user)?;
        let x_u_inv = invert(&x_u)?;
        let mut user_factor = Scalar::ONE;
        for (identifier, factor) in operators.values_mut() {
            let x_i = scalar_of(identifier)?;
            *factor = (x_u - x_i) * x_u_inv;
            user_factor *= (x_i - x_u) * invert(&x_i)?;
        }
        Ok(Self {
            operators,
            user: Some((user, user_factor)),
        })
    }

    fn operator(&self, id: &str) -> Result<&(frost::Identifier, Scalar), SigningError> {
        self.operators
            .get(id)
            .ok_or_else(|| SigningError::MissingCommitment(id.to_string()))
    }

    fn public_key_package(
        &self,
        public_shares: &BTreeMap<String, Vec<u8>>,
        keyshare_public_key: &[u8],
        leaf_verifying_key: &[u8],
    ) -> Result<frost::keys::PublicKeyPackage, SigningError> {
        let mut verifying_shares = BTreeMap::new();
        for (id, (identifier, factor)) in &self.operators {
            let share = public_shares
                .get(id)
                .ok_or_else(|| SigningError::MissingPublicShare(id.clone()))?;
            let point = keys::parse_public_key(share)? * factor;
            verifying_shares.insert(*identifier, verifying_share(&point)?);
        }
        if let Some((identifier, factor)) = &self.user {
            let user_public = keys::parse_public_key(leaf_verifying_key)?
                - keys::parse_public_key(keyshare_public_key)?;
            verifying_shares.insert(*identifier, verifying_share(&(user_public * factor))?);
        }
        Ok(frost::keys::PublicKeyPackage::new(
            verifying_shares,
            verifying_key(leaf_verifying_key)?,
        ))
    }
}

fn adaptor_point(public_key: Option<&[u8]>) -> Result<Option<ProjectivePoint>, SigningError> {
    public_key
        .map(|bytes| {
            keys::parse_public_key(bytes).map_err(|e| SigningError::InvalidAdaptor(e.to_string()))
        })
        .transpose()
}

fn signature_share(
    package: &frost::SigningPackage,
    nonces: &frost::round1::SigningNonces,
    key_package: &frost::keys::KeyPackage,
    adaptor: Option<&ProjectivePoint>,
) -> Result<Vec<u8>, SigningError> {
    match adaptor {
        Some(point) => adaptor::signature_share(package, nonces, key_package, point),
        None => Ok(frost::round2::sign_with_tweak(package, nonces, key_package, None)
            .map_err(frost_error)?
            .serialize()),
    }
}

fn signing_package(
    message: &[u8],
    commitments: &BTreeMap<String, Vec<u8>>,
    user_commitment: Option<&[u8]>,
) -> Result<frost::SigningPackage, SigningError> {
    if message.len() != 32 {
        return Err(SigningError::InvalidMessageLength(message.len()));
    }
    let mut signing_commitments = BTreeMap::new();
    for (id, bytes) in commitments {
        let commitment =
            frost::round1::SigningCommitments::deserialize(bytes).map_err(frost_error)?;
        signing_commitments.insert(operator_frost_identifier(id)?, commitment);
    }
    if let Some(bytes) = user_commitment {
        let commitment =
            frost::round1::SigningCommitments::deserialize(bytes).map_err(frost_error)?;
        signing_commitments.insert(user_identifier()?, commitment);
    }
    Ok(frost::SigningPackage::new(signing_commitments, message))
}

/// One signature this operator is asked to contribute to
#[derive(Debug, Clone)]
pub struct SigningJob {
    pub job_id: String,
    pub keyshare: SigningKeyshare,
    /// 32-byte sighash
    pub message: Vec<u8>,
    /// Key the aggregate signature verifies under (before the Taproot tweak)
    pub verifying_key: Vec<u8>,
    /// Operator identifier -> serialized commitment
    pub commitments: BTreeMap<String, Vec<u8>>,
    pub user_commitment: Option<Vec<u8>>,
    pub adaptor_public_key: Option<Vec<u8>>,
}

struct StoredNonce {
    nonces: frost::round1::SigningNonces,
    created_at: Instant,
}

/// Per-operator FROST participant
pub struct FrostSigner {
    identifier: String,
    nonces: Mutex<HashMap<Vec<u8>, StoredNonce>>,
}

impl FrostSigner {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            nonces: Mutex::new(HashMap::new()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Round 1: one fresh commitment per keyshare, in order
    pub async fn commit(
        &self,
        keyshares: &[SigningKeyshare],
    ) -> Result<Vec<Vec<u8>>, SigningError> {
        let mut generated = Vec::with_capacity(keyshares.len());
        for keyshare in keyshares {
            let share = signing_share(&keys::parse_private_key(&keyshare.secret_share)?)?;
            let (nonces, commitments) = frost::round1::commit(&share, &mut rand::thread_rng());
            let bytes = commitments.serialize().map_err(frost_error)?;
            generated.push((bytes, nonces));
        }

        let mut stored = self.nonces.lock().await;
        let now = Instant::now();
        let commitments = generated
            .into_iter()
            .map(|(bytes, nonces)| {
                stored.insert(
                    bytes.clone(),
                    StoredNonce {
                        nonces,
                        created_at: now,
                    },
                );
                bytes
            })
            .collect();

        tracing::debug!(
            operator = %self.identifier,
            count = keyshares.len(),
            "Generated signing commitments"
        );
        Ok(commitments)
    }

    /// Round 2: signature shares keyed by job id
    pub async fn sign(
        &self,
        jobs: &[SigningJob],
    ) -> Result<BTreeMap<String, Vec<u8>>, SigningError> {
        let mut shares = BTreeMap::new();
        for job in jobs {
            let own = job
                .commitments
                .get(&self.identifier)
                .ok_or_else(|| SigningError::MissingCommitment(self.identifier.clone()))?;
            let adaptor = adaptor_point(job.adaptor_public_key.as_deref())?;
            let nonces = self
                .nonces
                .lock()
                .await
                .remove(own)
                .ok_or(SigningError::NonceNotFound)?
                .nonces;
            shares.insert(
                job.job_id.clone(),
                self.sign_job(job, &nonces, adaptor.as_ref())?,
            );
        }

        tracing::debug!(
            operator = %self.identifier,
            count = jobs.len(),
            "Generated signature shares"
        );
        Ok(shares)
    }

    fn sign_job(
        &self,
        job: &SigningJob,
        nonces: &frost::round1::SigningNonces,
        adaptor: Option<&ProjectivePoint>,
    ) -> Result<Vec<u8>, SigningError> {
        if job.user_commitment.is_none() && job.verifying_key != job.keyshare.public_key {
            return Err(SigningError::VerifyingKeyMismatch);
        }

        let set = SigningSet::new(job.commitments.keys(), job.user_commitment.is_some())?;
        let (identifier, factor) = set.operator(&self.identifier)?;
        let public_share = job
            .keyshare
            .public_shares
            .get(&self.identifier)
            .ok_or_else(|| SigningError::MissingPublicShare(self.identifier.clone()))?;

        let secret = keys::parse_private_key(&job.keyshare.secret_share)? * factor;
        let public = keys::parse_public_key(public_share)? * factor;
        let key_package = frost::keys::KeyPackage::new(
            *identifier,
            signing_share(&secret)?,
            verifying_share(&public)?,
            verifying_key(&job.verifying_key)?,
            job.keyshare.min_signers,
        );

        let package = signing_package(
            &job.message,
            &job.commitments,
            job.user_commitment.as_deref(),
        )?;
        signature_share(&package, nonces, &key_package, adaptor)
    }

    /// Drop nonces older than `max_age`, returning how many were removed
    pub async fn cleanup_nonces(&self, max_age: Duration) -> usize {
        let mut nonces = self.nonces.lock().await;
        let before = nonces.len();
        nonces.retain(|_, stored| stored.created_at.elapsed() < max_age);
        before - nonces.len()
    }

    pub async fn pending_nonces(&self) -> usize {
        self.nonces.lock().await.len()
    }
}

/// Operator signature shares for one job plus everything needed to finish it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningResult {
    pub job_id: String,
    pub message: Vec<u8>,
    pub verifying_key: Vec<u8>,
    pub keyshare_public_key: Vec<u8>,
    pub public_shares: BTreeMap<String, Vec<u8>>,
    pub min_signers: u16,
    pub signing_commitments: BTreeMap<String, Vec<u8>>,
    pub user_commitment: Option<Vec<u8>>,
    pub adaptor_public_key: Option<Vec<u8>>,
    pub signature_shares: BTreeMap<String, Vec<u8>>,
}

impl SigningResult {
    fn signing_set(&self) -> Result<SigningSet, SigningError> {
        SigningSet::new(
            self.signing_commitments.keys(),
            self.user_commitment.is_some(),
        )
    }

    /// Produce the user's signature share
    pub fn sign_as_user(
        &self,
        user_secret: &[u8],
        nonces: &frost::round1::SigningNonces,
    ) -> Result<Vec<u8>, SigningError> {
        let set = self.signing_set()?;
        let (identifier, factor) = set
            .user
            .ok_or_else(|| SigningError::MissingCommitment("user".to_string()))?;

        let secret = keys::parse_private_key(user_secret)?;
        let key_package = frost::keys::KeyPackage::new(
            identifier,
            signing_share(&(secret * factor))?,
            verifying_share(&(ProjectivePoint::GENERATOR * secret * factor))?,
            verifying_key(&self.verifying_key)?,
            self.min_signers,
        );
        let package = signing_package(
            &self.message,
            &self.signing_commitments,
            self.user_commitment.as_deref(),
        )?;
        let adaptor = adaptor_point(self.adaptor_public_key.as_deref())?;
        signature_share(&package, nonces, &key_package, adaptor.as_ref())
    }

    /// Aggregate the operator shares (and the user's, if any) into a
    /// 64-byte BIP-340 signature under the Taproot key of `verifying_key`
    ///
    /// With an adaptor public key the result is the adaptor signature, which
    /// [`crate::adaptor::complete_adaptor_signature`] turns into a valid one.
    pub fn aggregate(&self, user_share: Option<&[u8]>) -> Result<Vec<u8>, SigningError> {
        let set = self.signing_set()?;
        let public_key_package = set.public_key_package(
            &self.public_shares,
            &self.keyshare_public_key,
            &self.verifying_key,
        )?;

        let mut shares = BTreeMap::new();
        for (id, bytes) in &self.signature_shares {
            let (identifier, _) = set.operator(id)?;
            shares.insert(*identifier, bytes.clone());
        }
        if let (Some((identifier, _)), Some(bytes)) = (&set.user, user_share) {
            shares.insert(*identifier, bytes.to_vec());
        }

        let package = signing_package(
            &self.message,
            &self.signing_commitments,
            self.user_commitment.as_deref(),
        )?;
        if let Some(adaptor) = adaptor_point(self.adaptor_public_key.as_deref())? {
            return adaptor::aggregate(&package, &shares, &public_key_package, &adaptor);
        }

        let shares = shares
            .into_iter()
            .map(|(identifier, bytes)| {
                frost::round2::SignatureShare::deserialize(&bytes)
                    .map(|share| (identifier, share))
                    .map_err(frost_error)
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        let signature = frost::aggregate_with_tweak(&package, &shares, &public_key_package, None)
            .map_err(|e| SigningError::Aggregation(e.to_string()))?;
        signature.serialize().map_err(frost_error)
    }
}

/// Fresh user nonces and their serialized commitment
pub fn user_commit(
    user_secret: &[u8],
) -> Result<(frost::round1::SigningNonces, Vec<u8>), SigningError> {
    let share = signing_share(&keys::parse_private_key(user_secret)?)?;
    let (nonces, commitments) = frost::round1::commit(&share, &mut rand::thread_rng());
    Ok((nonces, commitments.serialize().map_err(frost_error)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyshare::tests::dealt_keyshares;
    use crate::tx;
    use uuid::Uuid;

    async fn run_signing(
        keyshares: &[SigningKeyshare],
        signers: &[FrostSigner],
        message: [u8; 32],
        verifying_key: Vec<u8>,
        user_commitment: Option<Vec<u8>>,
        adaptor_public_key: Option<Vec<u8>>,
    ) -> SigningResult {
        let mut commitments = BTreeMap::new();
        for (signer, keyshare) in signers.iter().zip(keyshares) {
            let mut generated = signer.commit(std::slice::from_ref(keyshare)).await.unwrap();
            commitments.insert(signer.identifier().to_string(), generated.remove(0));
        }

        let mut signature_shares = BTreeMap::new();
        for (signer, keyshare) in signers.iter().zip(keyshares) {
            let job = SigningJob {
                job_id: "job".to_string(),
                keyshare: keyshare.clone(),
                message: message.to_vec(),
                verifying_key: verifying_key.clone(),
                commitments: commitments.clone(),
                user_commitment: user_commitment.clone(),
                adaptor_public_key: adaptor_public_key.clone(),
            };
            let mut shares = signer.sign(&[job]).await.unwrap();
            signature_shares.insert(
                signer.identifier().to_string(),
                shares.remove("job").unwrap(),
            );
        }

        SigningResult {
            job_id: "job".to_string(),
            message: message.to_vec(),
            verifying_key,
            keyshare_public_key: keyshares[0].public_key.clone(),
            public_shares: keyshares[0].public_shares.clone(),
            min_signers: keyshares[0].min_signers,
            signing_commitments: commitments,
            user_commitment,
            adaptor_public_key,
            signature_shares,
        }
    }

    fn signers(n: u32) -> Vec<FrostSigner> {
        (0..n)
            .map(|i| FrostSigner::new(crate::config::operator_identifier(i)))
            .collect()
    }

    #[tokio::test]
    async fn test_operator_only_signature_verifies() {
        let keyshares = dealt_keyshares(Uuid::new_v4(), 2, 3);
        let signers = signers(3);
        let message = [7u8; 32];

        let result = run_signing(
            &keyshares,
            &signers,
            message,
            keyshares[0].public_key.clone(),
            None,
            None,
        )
        .await;
        let signature = result.aggregate(None).unwrap();

        let output_key = tx::taproot_output_key(&keyshares[0].public_key).unwrap();
        tx::verify_schnorr(&output_key, &message, &signature).unwrap();
    }

    #[tokio::test]
    async fn test_signature_with_user_verifies_under_leaf_key() {
        let keyshares = dealt_keyshares(Uuid::new_v4(), 2, 3);
        let signers = signers(3);
        let message = [9u8; 32];

        let user_secret = keys::generate_private_key();
        let user_public = keys::public_key_from_private_key(&user_secret).unwrap();
        let leaf_key = keys::add_public_keys(&keyshares[0].public_key, &user_public).unwrap();
        let (user_nonces, user_commitment) = user_commit(&user_secret).unwrap();

        let result = run_signing(
            &keyshares,
            &signers,
            message,
            leaf_key.clone(),
            Some(user_commitment),
            None,
        )
        .await;
        let user_share = result.sign_as_user(&user_secret, &user_nonces).unwrap();
        let signature = result.aggregate(Some(&user_share)).unwrap();

        let output_key = tx::taproot_output_key(&leaf_key).unwrap();
        tx::verify_schnorr(&output_key, &message, &signature).unwrap();

        // without the user's share the signature cannot be completed
        assert!(result.aggregate(None).is_err());
    }

    #[tokio::test]
    async fn test_commit_runs_on_spawned_task() {
        let signer = std::sync::Arc::new(FrostSigner::new(crate::config::operator_identifier(0)));
        let keyshares: Vec<SigningKeyshare> = (0..2)
            .map(|_| dealt_keyshares(Uuid::new_v4(), 2, 3).remove(0))
            .collect();

        let task = {
            let signer = signer.clone();
            tokio::spawn(async move { signer.commit(&keyshares).await })
        };
        let commitments = task.await.unwrap().unwrap();
        assert_eq!(commitments.len(), 2);
        assert_eq!(signer.pending_nonces().await, 2);
    }

    #[tokio::test]
    async fn test_nonce_is_single_use() {
        let keyshares = dealt_keyshares(Uuid::new_v4(), 2, 3);
        let signers = signers(3);

        let mut commitments = BTreeMap::new();
        for (signer, keyshare) in signers.iter().zip(&keyshares) {
            let mut generated = signer.commit(std::slice::from_ref(keyshare)).await.unwrap();
            commitments.insert(signer.identifier().to_string(), generated.remove(0));
        }
        let job = SigningJob {
            job_id: "job".to_string(),
            keyshare: keyshares[0].clone(),
            message: vec![1; 32],
            verifying_key: keyshares[0].public_key.clone(),
            commitments,
            user_commitment: None,
            adaptor_public_key: None,
        };

        signers[0].sign(std::slice::from_ref(&job)).await.unwrap();
        assert!(matches!(
            signers[0].sign(&[job]).await,
            Err(SigningError::NonceNotFound)
        ));
        assert_eq!(signers[0].pending_nonces().await, 0);
    }

    #[tokio::test]
    async fn test_operator_adaptor_signature_completes_with_secret() {
        let keyshares = dealt_keyshares(Uuid::new_v4(), 2, 3);
        let signers = signers(3);
        let message = [4u8; 32];
        let adaptor_secret = keys::generate_private_key();
        let adaptor_public = keys::public_key_from_private_key(&adaptor_secret).unwrap();

        let result = run_signing(
            &keyshares,
            &signers,
            message,
            keyshares[0].public_key.clone(),
            None,
            Some(adaptor_public.clone()),
        )
        .await;
        let adaptor_signature = result.aggregate(None).unwrap();

        let output_key = tx::taproot_output_key(&keyshares[0].public_key).unwrap();
        assert!(tx::verify_schnorr(&output_key, &message, &adaptor_signature).is_err());

        let signature = adaptor::complete_adaptor_signature(
            &adaptor_signature,
            &adaptor_secret,
            &keyshares[0].public_key,
            &message,
        )
        .unwrap();
        tx::verify_schnorr(&output_key, &message, &signature).unwrap();
        assert_eq!(
            adaptor::extract_adaptor_secret(&adaptor_signature, &signature, &adaptor_public)
                .unwrap(),
            adaptor_secret
        );

        let wrong_secret = keys::generate_private_key();
        assert!(matches!(
            adaptor::complete_adaptor_signature(
                &adaptor_signature,
                &wrong_secret,
                &keyshares[0].public_key,
                &message,
            ),
            Err(SigningError::InvalidAdaptor(_))
        ));
    }

    #[tokio::test]
    async fn test_user_adaptor_signature_completes_under_leaf_key() {
        let keyshares = dealt_keyshares(Uuid::new_v4(), 2, 3);
        let signers = signers(3);
        let message = [6u8; 32];
        let adaptor_secret = keys::generate_private_key();
        let adaptor_public = keys::public_key_from_private_key(&adaptor_secret).unwrap();

        let user_secret = keys::generate_private_key();
        let user_public = keys::public_key_from_private_key(&user_secret).unwrap();
        let leaf_key = keys::add_public_keys(&keyshares[0].public_key, &user_public).unwrap();
        let (user_nonces, user_commitment) = user_commit(&user_secret).unwrap();

        let result = run_signing(
            &keyshares,
            &signers,
            message,
            leaf_key.clone(),
            Some(user_commitment),
            Some(adaptor_public),
        )
        .await;
        let user_share = result.sign_as_user(&user_secret, &user_nonces).unwrap();
        let adaptor_signature = result.aggregate(Some(&user_share)).unwrap();
        let signature = adaptor::complete_adaptor_signature(
            &adaptor_signature,
            &adaptor_secret,
            &leaf_key,
            &message,
        )
        .unwrap();

        let output_key = tx::taproot_output_key(&leaf_key).unwrap();
        tx::verify_schnorr(&output_key, &message, &signature).unwrap();
        assert!(matches!(
            result.aggregate(None),
            Err(SigningError::Aggregation(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_adaptor_keeps_nonce() {
        let keyshares = dealt_keyshares(Uuid::new_v4(), 2, 3);
        let signer = FrostSigner::new(crate::config::operator_identifier(0));

        let mut generated = signer.commit(&keyshares[..1]).await.unwrap();
        let own = BTreeMap::from([(signer.identifier().to_string(), generated.remove(0))]);

        let mut job = SigningJob {
            job_id: "adaptor".to_string(),
            keyshare: keyshares[0].clone(),
            message: vec![1; 32],
            verifying_key: keyshares[0].public_key.clone(),
            commitments: own,
            user_commitment: None,
            adaptor_public_key: Some(vec![5; 33]),
        };
        assert!(matches!(
            signer.sign(std::slice::from_ref(&job)).await,
            Err(SigningError::InvalidAdaptor(_))
        ));
        assert_eq!(signer.pending_nonces().await, 1);

        // the nonce is still there for a well-formed request
        job.adaptor_public_key = Some(keys::public_key_from_private_key(&[3u8; 32]).unwrap());
        assert!(!matches!(
            signer.sign(&[job]).await,
            Err(SigningError::NonceNotFound)
        ));
        assert_eq!(signer.pending_nonces().await, 0);
    }

    #[tokio::test]
    async fn test_verifying_key_mismatch_rejected() {
        let keyshares = dealt_keyshares(Uuid::new_v4(), 2, 3);
        let signer = FrostSigner::new(crate::config::operator_identifier(0));

        let mut first = signer.commit(&keyshares[..1]).await.unwrap();
        let mismatch = SigningJob {
            job_id: "mismatch".to_string(),
            keyshare: keyshares[0].clone(),
            message: vec![1; 32],
            verifying_key: keys::public_key_from_private_key(&[5u8; 32]).unwrap(),
            commitments: BTreeMap::from([(signer.identifier().to_string(), first.remove(0))]),
            user_commitment: None,
            adaptor_public_key: None,
        };
        assert!(matches!(
            signer.sign(&[mismatch]).await,
            Err(SigningError::VerifyingKeyMismatch)
        ));
    }

    #[tokio::test]
    async fn test_cleanup_nonces() {
        let keyshares = dealt_keyshares(Uuid::new_v4(), 2, 3);
        let signer = FrostSigner::new(crate::config::operator_identifier(0));
        signer.commit(&keyshares[..1]).await.unwrap();

        assert_eq!(signer.cleanup_nonces(Duration::from_secs(60)).await, 0);
        assert_eq!(signer.cleanup_nonces(Duration::ZERO).await, 1);
        assert_eq!(signer.pending_nonces().await, 0);
    }
}
