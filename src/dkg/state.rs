//! Per-request DKG state
//!
//! One entry per request id, behind a single async mutex. Transitions:
//! `Initial -> Round1 -> Round1Signature -> Round2`, after which the entry is
//! removed either because round 3 ran (`Completed`) or because something went
//! wrong (`Failed`).

use frost_secp256k1_tr as frost;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::signature::validate_round1_signatures;
use super::DkgError;
use crate::config::SigningOperator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DkgStateType {
    /// Request accepted, round-1 packages not generated yet
    Initial,
    /// Own round-1 packages generated
    Round1,
    /// Full round-1 package set received and signed
    Round1Signature,
    /// Round-1 signatures verified, round-2 packages generated
    Round2,
    Completed,
    Failed,
}

impl fmt::Display for DkgStateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DkgStateType::Initial => "initial",
            DkgStateType::Round1 => "round1",
            DkgStateType::Round1Signature => "round1_signature",
            DkgStateType::Round2 => "round2",
            DkgStateType::Completed => "completed",
            DkgStateType::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct DkgState {
    pub state_type: DkgStateType,
    pub min_signers: u16,
    pub max_signers: u16,
    pub key_count: usize,
    pub coordinator_index: u32,
    /// This operator's round-1 package per key
    pub round1_packages: Vec<Vec<u8>>,
    round1_secrets: Option<Vec<frost::keys::dkg::round1::SecretPackage>>,
    round2_secrets: Vec<frost::keys::dkg::round2::SecretPackage>,
    /// Per key: operator identifier -> round-1 package, including our own
    pub received_round1_packages: Vec<BTreeMap<String, Vec<u8>>>,
    /// Per key: sender identifier -> round-2 package addressed to us
    pub received_round2_packages: Vec<BTreeMap<String, Vec<u8>>>,
    created_at: Instant,
}

impl DkgState {
    fn expect(&self, request_id: Uuid, expected: DkgStateType) -> Result<(), DkgError> {
        if self.state_type != expected {
            return Err(DkgError::UnexpectedState {
                request_id,
                expected,
                actual: self.state_type,
            });
        }
        Ok(())
    }

    /// Round-2 secrets, consumed by round 3
    pub fn round2_secrets(&self) -> &[frost::keys::dkg::round2::SecretPackage] {
        &self.round2_secrets
    }

    fn round2_complete(&self) -> bool {
        let peers = usize::from(self.max_signers.saturating_sub(1));
        self.state_type == DkgStateType::Round2
            && self.received_round2_packages.len() == self.key_count
            && self
                .received_round2_packages
                .iter()
                .all(|packages| packages.len() == peers)
    }
}

/// Inputs to FROST part 2, handed out once signatures are verified
pub struct Round2Inputs {
    pub secrets: Vec<frost::keys::dkg::round1::SecretPackage>,
    pub round1_packages: Vec<BTreeMap<String, Vec<u8>>>,
}

/// All DKG requests this operator takes part in
#[derive(Default)]
pub struct DkgStates {
    states: Mutex<HashMap<Uuid, DkgState>>,
}

impl DkgStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn initiate(
        &self,
        request_id: Uuid,
        min_signers: u16,
        max_signers: u16,
        key_count: usize,
        coordinator_index: u32,
    ) -> Result<(), DkgError> {
        let mut states = self.states.lock().await;
        if states.contains_key(&request_id) {
            return Err(DkgError::StateAlreadyExists(request_id));
        }
        states.insert(
            request_id,
            DkgState {
                state_type: DkgStateType::Initial,
                min_signers,
                max_signers,
                key_count,
                coordinator_index,
                round1_packages: Vec::new(),
                round1_secrets: None,
                round2_secrets: Vec::new(),
                received_round1_packages: Vec::new(),
                received_round2_packages: Vec::new(),
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub async fn provide_round1_packages(
        &self,
        request_id: Uuid,
        packages: Vec<Vec<u8>>,
        secrets: Vec<frost::keys::dkg::round1::SecretPackage>,
    ) -> Result<(), DkgError> {
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(&request_id)
            .ok_or(DkgError::StateNotFound(request_id))?;
        state.expect(request_id, DkgStateType::Initial)?;

        state.round1_packages = packages;
        state.round1_secrets = Some(secrets);
        state.state_type = DkgStateType::Round1;
        Ok(())
    }

    /// Accept the full round-1 package set, which must contain our packages unchanged
    pub async fn receive_round1_packages(
        &self,
        request_id: Uuid,
        self_identifier: &str,
        packages: Vec<BTreeMap<String, Vec<u8>>>,
    ) -> Result<(), DkgError> {
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(&request_id)
            .ok_or(DkgError::StateNotFound(request_id))?;
        state.expect(request_id, DkgStateType::Round1)?;

        if packages.len() != state.round1_packages.len() {
            return Err(DkgError::PackageMismatch(format!(
                "expected {} keys, got {}",
                state.round1_packages.len(),
                packages.len()
            )));
        }
        for (i, (map, own)) in packages.iter().zip(&state.round1_packages).enumerate() {
            match map.get(self_identifier) {
                Some(received) if received == own => {}
                Some(_) => {
                    return Err(DkgError::PackageMismatch(format!(
                        "round-1 package {} differs from ours",
                        i
                    )))
                }
                None => {
                    return Err(DkgError::PackageMismatch(format!(
                        "round-1 package {} does not include ours",
                        i
                    )))
                }
            }
            if map.len() != usize::from(state.max_signers) {
                return Err(DkgError::PackageMismatch(format!(
                    "round-1 package {} has {} entries, expected {}",
                    i,
                    map.len(),
                    state.max_signers
                )));
            }
        }

        state.received_round1_packages = packages;
        state.state_type = DkgStateType::Round1Signature;
        Ok(())
    }

    /// Verify every operator's round-1 signature
    ///
    /// On failure the request is dropped and the failing identifiers are
    /// returned. On success the part-2 inputs are handed out exactly once.
    pub async fn receive_round1_signatures(
        &self,
        request_id: Uuid,
        signatures: &BTreeMap<String, Vec<u8>>,
        operators: &[SigningOperator],
    ) -> Result<Result<Round2Inputs, Vec<String>>, DkgError> {
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(&request_id)
            .ok_or(DkgError::StateNotFound(request_id))?;
        state.expect(request_id, DkgStateType::Round1Signature)?;

        let failures =
            validate_round1_signatures(&state.received_round1_packages, signatures, operators);
        if !failures.is_empty() {
            tracing::warn!(
                request_id = %request_id,
                failures = ?failures,
                "Round-1 signature validation failed, dropping DKG state"
            );
            states.remove(&request_id);
            return Ok(Err(failures));
        }

        let secrets = state.round1_secrets.take().ok_or(DkgError::UnexpectedState {
            request_id,
            expected: DkgStateType::Round1Signature,
            actual: DkgStateType::Round2,
        })?;
        Ok(Ok(Round2Inputs {
            secrets,
            round1_packages: state.received_round1_packages.clone(),
        }))
    }

    pub async fn provide_round2_secrets(
        &self,
        request_id: Uuid,
        secrets: Vec<frost::keys::dkg::round2::SecretPackage>,
    ) -> Result<(), DkgError> {
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(&request_id)
            .ok_or(DkgError::StateNotFound(request_id))?;
        state.expect(request_id, DkgStateType::Round1Signature)?;

        state.round2_secrets = secrets;
        state.state_type = DkgStateType::Round2;
        Ok(())
    }

    /// Buffer round-2 packages from one peer
    ///
    /// Peers may deliver before we finished our own part 2, so both
    /// `Round1Signature` and `Round2` accept packages.
    pub async fn receive_round2_packages(
        &self,
        request_id: Uuid,
        sender: &str,
        packages: Vec<Vec<u8>>,
    ) -> Result<(), DkgError> {
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(&request_id)
            .ok_or(DkgError::StateNotFound(request_id))?;
        if !matches!(
            state.state_type,
            DkgStateType::Round1Signature | DkgStateType::Round2
        ) {
            return Err(DkgError::UnexpectedState {
                request_id,
                expected: DkgStateType::Round2,
                actual: state.state_type,
            });
        }
        if packages.len() != state.key_count {
            return Err(DkgError::PackageMismatch(format!(
                "expected {} round-2 packages from {}, got {}",
                state.key_count,
                sender,
                packages.len()
            )));
        }

        if state.received_round2_packages.is_empty() {
            state.received_round2_packages = vec![BTreeMap::new(); state.key_count];
        }
        for (received, package) in state.received_round2_packages.iter_mut().zip(packages) {
            received.insert(sender.to_string(), package);
        }
        tracing::debug!(
            request_id = %request_id,
            sender = %sender,
            received = state.received_round2_packages[0].len(),
            "Received round-2 packages"
        );
        Ok(())
    }

    /// Remove and return the state once every peer's round-2 packages are in
    ///
    /// Both our own round-1-signature handler and each peer delivery check
    /// this; only the first caller to see a complete state gets it.
    pub async fn take_if_ready(&self, request_id: Uuid) -> Option<DkgState> {
        let mut states = self.states.lock().await;
        let ready = states
            .get(&request_id)
            .map(DkgState::round2_complete)
            .unwrap_or(false);
        if ready {
            states.remove(&request_id)
        } else {
            None
        }
    }

    pub async fn remove(&self, request_id: Uuid) {
        if self.states.lock().await.remove(&request_id).is_some() {
            tracing::info!(request_id = %request_id, "DKG state removed");
        }
    }

    pub async fn state_type(&self, request_id: Uuid) -> Option<DkgStateType> {
        self.states
            .lock()
            .await
            .get(&request_id)
            .map(|state| state.state_type)
    }

    /// Drop requests older than `older_than`, returning how many were removed
    pub async fn cleanup(&self, older_than: Duration) -> usize {
        let mut states = self.states.lock().await;
        let before = states.len();
        states.retain(|_, state| state.created_at.elapsed() < older_than);
        before - states.len()
    }

    pub async fn len(&self) -> usize {
        self.states.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initiate_twice_is_rejected() {
        let states = DkgStates::new();
        let id = Uuid::new_v4();
        states.initiate(id, 2, 3, 1, 0).await.unwrap();
        assert!(matches!(
            states.initiate(id, 2, 3, 1, 0).await,
            Err(DkgError::StateAlreadyExists(_))
        ));
        assert_eq!(states.state_type(id).await, Some(DkgStateType::Initial));
    }

    #[tokio::test]
    async fn test_round1_packages_must_include_ours() {
        let states = DkgStates::new();
        let id = Uuid::new_v4();
        states.initiate(id, 2, 2, 1, 0).await.unwrap();

        // out of order
        let early = states
            .receive_round1_packages(id, "a", vec![BTreeMap::new()])
            .await;
        assert!(matches!(early, Err(DkgError::UnexpectedState { .. })));

        states
            .provide_round1_packages(id, vec![vec![1, 2, 3]], Vec::new())
            .await
            .unwrap();

        let mut tampered = BTreeMap::new();
        tampered.insert("a".to_string(), vec![9, 9, 9]);
        tampered.insert("b".to_string(), vec![4]);
        assert!(matches!(
            states.receive_round1_packages(id, "a", vec![tampered]).await,
            Err(DkgError::PackageMismatch(_))
        ));

        let mut good = BTreeMap::new();
        good.insert("a".to_string(), vec![1, 2, 3]);
        good.insert("b".to_string(), vec![4]);
        states
            .receive_round1_packages(id, "a", vec![good])
            .await
            .unwrap();
        assert_eq!(
            states.state_type(id).await,
            Some(DkgStateType::Round1Signature)
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_states() {
        let states = DkgStates::new();
        states.initiate(Uuid::new_v4(), 2, 3, 1, 0).await.unwrap();
        states.initiate(Uuid::new_v4(), 2, 3, 1, 0).await.unwrap();
        assert_eq!(states.cleanup(Duration::from_secs(3600)).await, 0);
        assert_eq!(states.cleanup(Duration::ZERO).await, 2);
        assert_eq!(states.len().await, 0);
    }
}
