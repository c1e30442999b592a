//! Leaf ownership transfers
//!
//! A transfer moves one or more leaves from a sender identity to a receiver
//! identity by tweaking the keyshare behind each leaf on every operator. The
//! operator a user talks to coordinates the federation through the internal
//! handlers; each operator validates and commits its own step atomically.

mod handler;
mod internal;
mod validation;

pub use handler::{
    claim_transfer_sign_refunds, claim_transfer_tweak_keys, complete_send_transfer,
    expired_transfers, finalize_transfer, pending_transfers, query_expired_transfers,
    query_pending_transfers, reclaim_expired_transfer, start_cooperative_exit, start_leaf_swap,
    start_send_transfer,
};
pub use internal::{
    apply_pending_sender_key_tweak, handle_apply_sender_key_tweak, handle_complete_transfer,
    handle_expire_transfer, handle_initiate_settle_receiver_key_tweak, handle_initiate_transfer,
    handle_record_receiver_refunds, handle_settle_receiver_key_tweak, mark_preimage_shared,
    record_exit_confirmation, set_block_height,
};
pub use validation::{sender_signature_message, EXIT_CONFIRMATIONS};

use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::models::TransferStatus;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer not found: {0}")]
    TransferNotFound(Uuid),
    #[error("leaf not found: {0}")]
    LeafNotFound(Uuid),
    #[error("transfer {transfer_id} is {status}, expected {expected}")]
    UnexpectedStatus {
        transfer_id: Uuid,
        status: &'static str,
        expected: &'static str,
    },
    #[error("leaf {0} is not available for transfer")]
    LeafNotAvailable(Uuid),
    #[error("leaf {0} is not owned by the sender")]
    NotLeafOwner(Uuid),
    #[error("identity public key does not match transfer {0}")]
    IdentityMismatch(Uuid),
    #[error("invalid refund for leaf {leaf_id}: {reason}")]
    InvalidRefund { leaf_id: Uuid, reason: String },
    #[error("transfer {0} has expired")]
    Expired(Uuid),
    #[error("transfer {0} has not expired")]
    NotExpired(Uuid),
    #[error("expiry time must be in the future")]
    InvalidExpiry,
    #[error("leaves do not match transfer {transfer_id}: {reason}")]
    LeafMismatch { transfer_id: Uuid, reason: String },
    #[error("leaf {0} appears more than once")]
    DuplicateLeaf(Uuid),
    #[error("sender signature for leaf {0} does not verify")]
    InvalidSignature(Uuid),
    #[error("leaf {leaf_id} has no key tweak for operator {operator}")]
    MissingKeyTweak { leaf_id: Uuid, operator: String },
    #[error("key tweak proof for leaf {0} differs from the stored one")]
    TweakProofMismatch(Uuid),
    #[error("signing public key for leaf {0} does not match the tweak")]
    SigningKeyMismatch(Uuid),
    #[error("sender key tweak for transfer {0} cannot be applied yet")]
    TweakNotReady(Uuid),
    #[error("receiver key tweak rejected by {operators:?}")]
    SettlementRejected { operators: Vec<String> },
    #[error("transfer already exists: {0}")]
    AlreadyExists(Uuid),
}

impl TransferError {
    pub(crate) fn unexpected(transfer_id: Uuid, status: TransferStatus, expected: TransferStatus) -> Self {
        TransferError::UnexpectedStatus {
            transfer_id,
            status: status.as_str(),
            expected: expected.as_str(),
        }
    }

    pub(crate) fn refund(leaf_id: Uuid, reason: impl Into<String>) -> Self {
        TransferError::InvalidRefund {
            leaf_id,
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::SettlementRejected { .. } => ErrorCategory::FederationDisagreement,
            TransferError::AlreadyExists(_) => ErrorCategory::ResourceContention,
            _ => ErrorCategory::Validation,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            TransferError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            TransferError::LeafNotFound(_) => "LEAF_NOT_FOUND",
            TransferError::UnexpectedStatus { .. } => "INVALID_TRANSFER_STATUS",
            TransferError::LeafNotAvailable(_) => "LEAF_NOT_AVAILABLE",
            TransferError::NotLeafOwner(_) => "NOT_LEAF_OWNER",
            TransferError::IdentityMismatch(_) => "IDENTITY_MISMATCH",
            TransferError::InvalidRefund { .. } => "INVALID_REFUND",
            TransferError::Expired(_) => "TRANSFER_EXPIRED",
            TransferError::NotExpired(_) => "TRANSFER_NOT_EXPIRED",
            TransferError::InvalidExpiry => "INVALID_EXPIRY",
            TransferError::LeafMismatch { .. } => "LEAF_MISMATCH",
            TransferError::DuplicateLeaf(_) => "DUPLICATE_LEAF",
            TransferError::InvalidSignature(_) => "INVALID_SIGNATURE",
            TransferError::MissingKeyTweak { .. } => "MISSING_KEY_TWEAK",
            TransferError::TweakProofMismatch(_) => "TWEAK_PROOF_MISMATCH",
            TransferError::SigningKeyMismatch(_) => "SIGNING_KEY_MISMATCH",
            TransferError::TweakNotReady(_) => "TWEAK_NOT_READY",
            TransferError::SettlementRejected { .. } => "SETTLEMENT_REJECTED",
            TransferError::AlreadyExists(_) => "TRANSFER_EXISTS",
        }
    }

    /// Whether the error means a record does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TransferError::TransferNotFound(_) | TransferError::LeafNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = TransferError::unexpected(
            Uuid::nil(),
            TransferStatus::SenderInitiated,
            TransferStatus::SenderKeyTweaked,
        );
        assert_eq!(err.error_code(), "INVALID_TRANSFER_STATUS");
        assert!(err.to_string().contains("sender_initiated"));
        assert_eq!(err.category(), ErrorCategory::Validation);

        let err = TransferError::SettlementRejected {
            operators: vec!["b".to_string()],
        };
        assert_eq!(err.category(), ErrorCategory::FederationDisagreement);
        assert!(TransferError::TransferNotFound(Uuid::nil()).is_not_found());
    }
}
