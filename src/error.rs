//! Root error type
//!
//! Every module keeps its own error enum; [`OperatorError`] wraps them for the
//! request handlers and sorts each failure into an [`ErrorCategory`].

use thiserror::Error;

use crate::config::ConfigError;
use crate::dkg::DkgError;
use crate::frost_signer::SigningError;
use crate::keys::KeyError;
use crate::keyshare::KeyshareError;
use crate::keystore::KeystoreError;
use crate::operator::FanoutError;
use crate::secret_sharing::SecretSharingError;
use crate::store::StorageError;
use crate::transfer::TransferError;
use crate::transport::TransportError;
use crate::tx::TxError;

/// How a failure should be handled by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or inconsistent input; nothing was changed
    Validation,
    /// Keyshares already taken or the pool is empty
    ResourceContention,
    /// A peer rejected a step the coordinator had validated
    FederationDisagreement,
    /// A peer could not be reached
    PeerUnavailable,
    /// Key arithmetic no longer adds up
    InternalConsistency,
    Internal,
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    SecretSharing(#[from] SecretSharingError),
    #[error(transparent)]
    Keyshare(#[from] KeyshareError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Dkg(#[from] DkgError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Fanout(#[from] FanoutError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

fn storage_category(err: &StorageError) -> ErrorCategory {
    match err {
        StorageError::NotFound(_) => ErrorCategory::Validation,
        StorageError::Duplicate(_) => ErrorCategory::ResourceContention,
        StorageError::InvalidData(_) => ErrorCategory::InternalConsistency,
        StorageError::Database(_) => ErrorCategory::Internal,
    }
}

fn storage_code(err: &StorageError) -> &'static str {
    match err {
        StorageError::NotFound(_) => "NOT_FOUND",
        StorageError::Duplicate(_) => "DUPLICATE",
        StorageError::InvalidData(_) | StorageError::Database(_) => "STORAGE_ERROR",
    }
}

impl OperatorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            OperatorError::Config(_) | OperatorError::Keystore(_) | OperatorError::Internal(_) => {
                ErrorCategory::Internal
            }
            OperatorError::Storage(e) => storage_category(e),
            OperatorError::Key(_)
            | OperatorError::SecretSharing(_)
            | OperatorError::Tx(_)
            | OperatorError::Validation(_)
            | OperatorError::NotFound(_) => ErrorCategory::Validation,
            OperatorError::Keyshare(e) => match e {
                KeyshareError::InsufficientKeyshares { .. } | KeyshareError::AlreadyInUse(_) => {
                    ErrorCategory::ResourceContention
                }
                KeyshareError::VerificationFailed(_) | KeyshareError::MissingPublicShare { .. } => {
                    ErrorCategory::InternalConsistency
                }
                KeyshareError::Storage(e) => storage_category(e),
                _ => ErrorCategory::Validation,
            },
            OperatorError::Signing(_) => ErrorCategory::Validation,
            OperatorError::Dkg(e) => match e {
                DkgError::ValidationFailed(_) => ErrorCategory::FederationDisagreement,
                DkgError::StateAlreadyExists(_) => ErrorCategory::ResourceContention,
                DkgError::Storage(e) => storage_category(e),
                _ => ErrorCategory::Validation,
            },
            OperatorError::Transfer(e) => e.category(),
            OperatorError::Transport(e) => match e {
                TransportError::Rejected { .. } => ErrorCategory::FederationDisagreement,
                _ => ErrorCategory::PeerUnavailable,
            },
            OperatorError::Fanout(e) => {
                if e.is_unavailability() {
                    ErrorCategory::PeerUnavailable
                } else {
                    ErrorCategory::FederationDisagreement
                }
            }
        }
    }

    /// Stable code for error bodies
    pub fn error_code(&self) -> &'static str {
        match self {
            OperatorError::Config(_) => "CONFIG_ERROR",
            OperatorError::Keystore(_) => "KEYSTORE_ERROR",
            OperatorError::Internal(_) => "INTERNAL_ERROR",
            OperatorError::Storage(e) => storage_code(e),
            OperatorError::Key(_) => "INVALID_KEY",
            OperatorError::SecretSharing(_) => "INVALID_SHARE",
            OperatorError::Tx(_) => "INVALID_TRANSACTION",
            OperatorError::Validation(_) => "INVALID_REQUEST",
            OperatorError::NotFound(_) => "NOT_FOUND",
            OperatorError::Keyshare(e) => match e {
                KeyshareError::InsufficientKeyshares { .. } => "INSUFFICIENT_KEYSHARES",
                KeyshareError::AlreadyInUse(_) => "KEYSHARE_IN_USE",
                KeyshareError::NotFound(_) => "NOT_FOUND",
                KeyshareError::MissingPublicShareTweak(_) | KeyshareError::InvalidTweak(_) => {
                    "INVALID_TWEAK"
                }
                KeyshareError::VerificationFailed(_) | KeyshareError::MissingPublicShare { .. } => {
                    "KEYSHARE_INCONSISTENT"
                }
                KeyshareError::Storage(e) => storage_code(e),
                KeyshareError::Key(_) => "INVALID_KEY",
                KeyshareError::SecretSharing(_) => "INVALID_SHARE",
            },
            OperatorError::Signing(e) => match e {
                SigningError::NonceNotFound => "NONCE_NOT_FOUND",
                SigningError::Aggregation(_) => "AGGREGATION_FAILED",
                SigningError::InvalidAdaptor(_) => "INVALID_ADAPTOR",
                SigningError::VerifyingKeyMismatch => "VERIFYING_KEY_MISMATCH",
                _ => "SIGNING_ERROR",
            },
            OperatorError::Dkg(e) => match e {
                DkgError::StateAlreadyExists(_) => "DKG_STATE_EXISTS",
                DkgError::StateNotFound(_) => "NOT_FOUND",
                DkgError::UnexpectedState { .. } => "DKG_UNEXPECTED_STATE",
                DkgError::ValidationFailed(_) => "DKG_VALIDATION_FAILED",
                DkgError::InvalidSignature(_) => "INVALID_SIGNATURE",
                DkgError::Storage(e) => storage_code(e),
                _ => "DKG_ERROR",
            },
            OperatorError::Transfer(e) => e.error_code(),
            OperatorError::Transport(TransportError::Rejected { .. }) => "PEER_REJECTED",
            OperatorError::Transport(_) => "PEER_UNAVAILABLE",
            OperatorError::Fanout(e) => {
                if e.is_unavailability() {
                    "PEER_UNAVAILABLE"
                } else {
                    "PEER_REJECTED"
                }
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::Transport(e) => e.is_retryable(),
            OperatorError::Fanout(e) => e.failures().values().all(TransportError::is_retryable),
            OperatorError::Keyshare(KeyshareError::InsufficientKeyshares { .. }) => true,
            OperatorError::Storage(StorageError::Database(_)) => true,
            _ => false,
        }
    }

    /// The code a peer reported, when this failure came back from one
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            OperatorError::Transport(e) => e.remote_code(),
            OperatorError::Fanout(e) => e.failures().values().find_map(|e| e.remote_code()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn test_categories() {
        let err = OperatorError::from(KeyshareError::InsufficientKeyshares {
            requested: 2,
            available: 1,
        });
        assert_eq!(err.category(), ErrorCategory::ResourceContention);
        assert_eq!(err.error_code(), "INSUFFICIENT_KEYSHARES");
        assert!(err.is_retryable());

        let err = OperatorError::from(KeyshareError::AlreadyInUse(Uuid::nil()));
        assert_eq!(err.category(), ErrorCategory::ResourceContention);
        assert!(!err.is_retryable());

        let err = OperatorError::from(KeyshareError::VerificationFailed("sum".to_string()));
        assert_eq!(err.category(), ErrorCategory::InternalConsistency);

        let err = OperatorError::from(TransferError::SettlementRejected {
            operators: vec!["a".to_string()],
        });
        assert_eq!(err.category(), ErrorCategory::FederationDisagreement);
        assert_eq!(err.error_code(), "SETTLEMENT_REJECTED");
    }

    #[test]
    fn test_fanout_categories() {
        let mut failures = BTreeMap::new();
        failures.insert(
            "a".to_string(),
            TransportError::Unreachable {
                operator: "a".to_string(),
                message: "connection refused".to_string(),
            },
        );
        let err = OperatorError::from(FanoutError::OperatorsFailed { failures });
        assert_eq!(err.category(), ErrorCategory::PeerUnavailable);
        assert!(err.is_retryable());

        let mut failures = BTreeMap::new();
        failures.insert(
            "b".to_string(),
            TransportError::Rejected {
                status: 400,
                code: "LEAF_NOT_AVAILABLE".to_string(),
                message: "leaf locked".to_string(),
            },
        );
        let err = OperatorError::from(FanoutError::OperatorsFailed { failures });
        assert_eq!(err.category(), ErrorCategory::FederationDisagreement);
        assert_eq!(err.remote_code(), Some("LEAF_NOT_AVAILABLE"));
    }
}
