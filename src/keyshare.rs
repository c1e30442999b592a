//! Keyshare pool
//!
//! Each operator owns a pool of pre-generated threshold keys (those whose
//! `coordinator_index` is its own index). Allocation selects and marks keys in
//! the caller's transaction so two callers can never receive the same key.
//! When the pool runs low a replenishment request is posted to a background
//! worker; the request never blocks or fails the allocating call.

use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::DkgSettings;
use crate::keys::{self, KeyError};
use crate::models::{KeyTweak, KeyshareStatus, SigningKeyshare};
use crate::secret_sharing::{self, SecretSharingError};
use crate::store::{StorageError, StoreTx};

#[derive(Debug, Error)]
pub enum KeyshareError {
    #[error("insufficient keyshares: requested {requested}, available {available}")]
    InsufficientKeyshares { requested: usize, available: usize },
    #[error("keyshare already in use: {0}")]
    AlreadyInUse(Uuid),
    #[error("keyshare not found: {0}")]
    NotFound(Uuid),
    #[error("missing public share tweak for operator {0}")]
    MissingPublicShareTweak(String),
    #[error("keyshare {id} has no public share for operator {identifier}")]
    MissingPublicShare { id: Uuid, identifier: String },
    #[error("invalid key tweak: {0}")]
    InvalidTweak(String),
    #[error("keyshare verification failed: {0}")]
    VerificationFailed(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("secret sharing error: {0}")]
    SecretSharing(#[from] SecretSharingError),
}

/// This operator's view of its keyshare pool
pub struct KeysharePool {
    coordinator_index: u32,
    settings: DkgSettings,
    replenish: mpsc::Sender<()>,
}

impl KeysharePool {
    pub fn new(coordinator_index: u32, settings: DkgSettings, replenish: mpsc::Sender<()>) -> Self {
        Self {
            coordinator_index,
            settings,
            replenish,
        }
    }

    pub fn settings(&self) -> &DkgSettings {
        &self.settings
    }

    /// Post a replenishment request; requests made while one is pending coalesce
    pub fn request_replenish(&self) {
        match self.replenish.try_send(()) {
            Ok(()) => tracing::debug!("Requested keyshare replenishment"),
            Err(mpsc::error::TrySendError::Full(())) => {
                tracing::debug!("Keyshare replenishment already pending")
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::warn!("Keyshare replenishment worker is not running")
            }
        }
    }

    /// Available keys in this operator's pool
    pub fn available(&self, tx: &dyn StoreTx) -> Result<usize, KeyshareError> {
        Ok(tx.count_available_keyshares(self.coordinator_index)?)
    }

    /// Select `count` available keyshares without marking them
    ///
    /// Fails without side effects on the store when the pool is too small, and
    /// asks for replenishment.
    pub fn get_unused(
        &self,
        tx: &dyn StoreTx,
        count: usize,
    ) -> Result<Vec<SigningKeyshare>, KeyshareError> {
        let keyshares = tx.available_keyshares(self.coordinator_index, count)?;
        if keyshares.len() < count {
            self.request_replenish();
            return Err(KeyshareError::InsufficientKeyshares {
                requested: count,
                available: keyshares.len(),
            });
        }
        Ok(keyshares)
    }

    /// Mark keyshares as used, replenishing the pool if it fell below threshold
    pub fn mark_used(&self, tx: &mut dyn StoreTx, ids: &[Uuid]) -> Result<(), KeyshareError> {
        mark_keyshares_in_use(tx, ids)?;

        let remaining = self.available(tx)?;
        crate::logging::log_keyshare_event("keyshares_marked_used", ids.len(), remaining);
        if self.settings.needs_replenish(remaining) {
            self.request_replenish();
        }
        Ok(())
    }

    /// Select and mark `count` keyshares in one step
    pub fn allocate(
        &self,
        tx: &mut dyn StoreTx,
        count: usize,
    ) -> Result<Vec<SigningKeyshare>, KeyshareError> {
        let keyshares = self.get_unused(tx, count)?;
        let ids: Vec<Uuid> = keyshares.iter().map(|k| k.id).collect();
        self.mark_used(tx, &ids)?;
        Ok(keyshares
            .into_iter()
            .map(|k| SigningKeyshare {
                status: KeyshareStatus::InUse,
                ..k
            })
            .collect())
    }

    /// Whether the pool is below the replenishment threshold
    pub fn needs_replenish(&self, tx: &dyn StoreTx) -> Result<bool, KeyshareError> {
        Ok(self.settings.needs_replenish(self.available(tx)?))
    }
}

/// Transition keyshares Available -> InUse, all or nothing
pub fn mark_keyshares_in_use(tx: &mut dyn StoreTx, ids: &[Uuid]) -> Result<(), KeyshareError> {
    let mut seen = HashSet::new();
    let mut keyshares = Vec::with_capacity(ids.len());
    for id in ids {
        let keyshare = tx.get_keyshare(id)?.ok_or(KeyshareError::NotFound(*id))?;
        if keyshare.status != KeyshareStatus::Available || !seen.insert(*id) {
            return Err(KeyshareError::AlreadyInUse(*id));
        }
        keyshares.push(keyshare);
    }

    for mut keyshare in keyshares {
        keyshare.status = KeyshareStatus::InUse;
        tx.update_keyshare(keyshare)?;
    }
    Ok(())
}

/// Re-derive the group key from the public shares and compare
pub fn verify_keyshare(keyshare: &SigningKeyshare) -> Result<(), KeyshareError> {
    let combined = secret_sharing::combine_public_shares(&keyshare.public_shares)?;
    if combined != keyshare.public_key {
        return Err(KeyshareError::VerificationFailed(format!(
            "public shares of {} do not combine to its public key",
            keyshare.id
        )));
    }
    Ok(())
}

/// Add a tweak to a keyshare
///
/// `share_tweak` is this operator's share of the tweak, `pubkey_tweak` the
/// public key of the whole tweak and `pubkey_shares_tweak` the public share of
/// the tweak for every operator.
pub fn tweak_keyshare(
    keyshare: &SigningKeyshare,
    share_tweak: &[u8],
    pubkey_tweak: &[u8],
    pubkey_shares_tweak: &BTreeMap<String, Vec<u8>>,
) -> Result<SigningKeyshare, KeyshareError> {
    let mut tweaked = keyshare.clone();
    tweaked.secret_share = keys::add_private_keys(&keyshare.secret_share, share_tweak)?;
    tweaked.public_key = keys::add_public_keys(&keyshare.public_key, pubkey_tweak)?;
    for (identifier, public_share) in tweaked.public_shares.iter_mut() {
        let tweak = pubkey_shares_tweak
            .get(identifier)
            .ok_or_else(|| KeyshareError::MissingPublicShareTweak(identifier.clone()))?;
        *public_share = keys::add_public_keys(public_share, tweak)?;
    }

    verify_keyshare(&tweaked)?;
    Ok(tweaked)
}

/// Check a tweak package addressed to the operator with `share_index`
///
/// The share must verify against the proofs, and every operator's public share
/// of the tweak must be the committed polynomial evaluated at its identifier.
pub fn validate_key_tweak(
    keyshare: &SigningKeyshare,
    tweak: &KeyTweak,
    share_index: u64,
) -> Result<(), KeyshareError> {
    secret_sharing::validate_share(&tweak.share)?;

    if tweak.share.share.index != share_index {
        return Err(KeyshareError::InvalidTweak(format!(
            "share index {} does not belong to this operator ({})",
            tweak.share.share.index, share_index
        )));
    }
    if tweak.share.share.threshold != usize::from(keyshare.min_signers) {
        return Err(KeyshareError::InvalidTweak(format!(
            "threshold {} does not match keyshare threshold {}",
            tweak.share.share.threshold, keyshare.min_signers
        )));
    }

    for identifier in keyshare.public_shares.keys() {
        let public_tweak = tweak
            .pubkey_shares_tweak
            .get(identifier)
            .ok_or_else(|| KeyshareError::MissingPublicShareTweak(identifier.clone()))?;
        let x = secret_sharing::identifier_scalar(identifier)?;
        let expected = secret_sharing::evaluate_commitments(&tweak.share.proofs, &x)?;
        if keys::parse_public_key(public_tweak)? != expected {
            return Err(KeyshareError::InvalidTweak(format!(
                "public share tweak for operator {} does not match the proofs",
                identifier
            )));
        }
    }
    if tweak.pubkey_shares_tweak.len() != keyshare.public_shares.len() {
        return Err(KeyshareError::InvalidTweak(
            "public share tweaks name unknown operators".to_string(),
        ));
    }
    Ok(())
}

/// Apply a validated tweak package to a stored keyshare
pub fn apply_keyshare_tweak(
    tx: &mut dyn StoreTx,
    keyshare_id: &Uuid,
    tweak: &KeyTweak,
) -> Result<SigningKeyshare, KeyshareError> {
    let keyshare = tx
        .get_keyshare(keyshare_id)?
        .ok_or(KeyshareError::NotFound(*keyshare_id))?;
    let pubkey_tweak = tweak
        .pubkey_tweak()
        .ok_or_else(|| KeyshareError::InvalidTweak("tweak has no proofs".to_string()))?;
    let tweaked = tweak_keyshare(
        &keyshare,
        &tweak.share.share.share,
        pubkey_tweak,
        &tweak.pubkey_shares_tweak,
    )?;
    tx.update_keyshare(tweaked.clone())?;
    Ok(tweaked)
}

/// Solve for the keyshare that, added to `partial_ids`, yields `target_id`
///
/// The result is stored under `new_id` as InUse. The arithmetic is checked in
/// both directions before anything is written.
pub fn calculate_and_store_last_key(
    tx: &mut dyn StoreTx,
    target_id: &Uuid,
    partial_ids: &[Uuid],
    new_id: Uuid,
) -> Result<SigningKeyshare, KeyshareError> {
    let target = tx
        .get_keyshare(target_id)?
        .ok_or(KeyshareError::NotFound(*target_id))?;
    let partials = partial_ids
        .iter()
        .map(|id| tx.get_keyshare(id)?.ok_or(KeyshareError::NotFound(*id)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut secret_share = target.secret_share.clone();
    let mut public_key = target.public_key.clone();
    let mut public_shares = target.public_shares.clone();
    for partial in &partials {
        secret_share = keys::subtract_private_keys(&secret_share, &partial.secret_share)?;
        public_key = keys::subtract_public_keys(&public_key, &partial.public_key)?;
        for (identifier, share) in public_shares.iter_mut() {
            let partial_share = partial.public_shares.get(identifier).ok_or_else(|| {
                KeyshareError::MissingPublicShare {
                    id: partial.id,
                    identifier: identifier.clone(),
                }
            })?;
            *share = keys::subtract_public_keys(share, partial_share)?;
        }
    }

    let last = SigningKeyshare {
        id: new_id,
        status: KeyshareStatus::InUse,
        secret_share,
        public_shares,
        public_key,
        min_signers: target.min_signers,
        coordinator_index: 0,
    };

    // partials + last must add back up to the target
    let mut secret_check = last.secret_share.clone();
    let mut key_check = last.public_key.clone();
    for partial in &partials {
        secret_check = keys::add_private_keys(&secret_check, &partial.secret_share)?;
        key_check = keys::add_public_keys(&key_check, &partial.public_key)?;
    }
    if secret_check != target.secret_share || key_check != target.public_key {
        return Err(KeyshareError::VerificationFailed(format!(
            "last key {} does not sum to target {}",
            new_id, target_id
        )));
    }
    for (identifier, target_share) in &target.public_shares {
        let mut share_check = last
            .public_shares
            .get(identifier)
            .cloned()
            .ok_or_else(|| KeyshareError::MissingPublicShare {
                id: new_id,
                identifier: identifier.clone(),
            })?;
        for partial in &partials {
            if let Some(partial_share) = partial.public_shares.get(identifier) {
                share_check = keys::add_public_keys(&share_check, partial_share)?;
            }
        }
        if &share_check != target_share {
            return Err(KeyshareError::VerificationFailed(format!(
                "public share of operator {} does not sum to target",
                identifier
            )));
        }
    }
    verify_keyshare(&last)?;

    tx.insert_keyshare(last.clone())?;
    tracing::info!(
        keyshare_id = %new_id,
        target = %target_id,
        partials = partials.len(),
        "Stored last keyshare"
    );
    Ok(last)
}
