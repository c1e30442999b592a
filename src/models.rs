//! Persistent records held by each operator

use crate::secret_sharing::VerifiableSecretShare;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyshareStatus {
    Available,
    InUse,
}

/// This operator's share of one threshold key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKeyshare {
    pub id: Uuid,
    pub status: KeyshareStatus,
    /// This operator's secret scalar, never sent to peers
    pub secret_share: Vec<u8>,
    /// Operator identifier -> that operator's public share
    pub public_shares: BTreeMap<String, Vec<u8>>,
    /// Combined group public key
    pub public_key: Vec<u8>,
    pub min_signers: u16,
    /// Index of the operator whose pool this key belongs to
    pub coordinator_index: u32,
}

/// Owner of a keyshare handed out for a deposit
///
/// Only this owner may register a leaf on the keyshare, and only with the
/// signing key the address was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositAddress {
    pub keyshare_id: Uuid,
    pub address: String,
    pub owner_identity_pubkey: Vec<u8>,
    pub owner_signing_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeNodeStatus {
    Creating,
    Available,
    TransferLocked,
    SplitLocked,
    Splitted,
    Aggregated,
    OnChain,
    DestinationLock,
}

/// A leaf (or internal node) of a deposit tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: Uuid,
    pub tree_id: Uuid,
    pub parent_id: Option<Uuid>,
    /// Satoshis held by output 0 of `raw_tx`
    pub value: u64,
    pub status: TreeNodeStatus,
    /// `keyshare.public_key + owner_signing_pubkey`
    pub verifying_pubkey: Vec<u8>,
    pub owner_identity_pubkey: Vec<u8>,
    pub owner_signing_pubkey: Vec<u8>,
    pub signing_keyshare_id: Uuid,
    pub raw_tx: Vec<u8>,
    pub raw_refund_tx: Vec<u8>,
    #[serde(default)]
    pub destination_lock_identity_pubkey: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Transfer,
    Swap,
    CounterSwap,
    CooperativeExit,
    PreimageSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    SenderInitiated,
    SenderKeyTweakPending,
    SenderKeyTweaked,
    ReceiverKeyTweakLocked,
    ReceiverKeyTweaked,
    ReceiverRefundSigned,
    Completed,
    Expired,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::SenderInitiated => "sender_initiated",
            TransferStatus::SenderKeyTweakPending => "sender_key_tweak_pending",
            TransferStatus::SenderKeyTweaked => "sender_key_tweaked",
            TransferStatus::ReceiverKeyTweakLocked => "receiver_key_tweak_locked",
            TransferStatus::ReceiverKeyTweaked => "receiver_key_tweaked",
            TransferStatus::ReceiverRefundSigned => "receiver_refund_signed",
            TransferStatus::Completed => "completed",
            TransferStatus::Expired => "expired",
        }
    }

    /// Statuses a transfer may still be reclaimed from once expired
    pub fn is_reclaimable(&self) -> bool {
        matches!(
            self,
            TransferStatus::SenderInitiated | TransferStatus::SenderKeyTweakPending
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub id: Uuid,
    pub sender_identity_pubkey: Vec<u8>,
    pub receiver_identity_pubkey: Vec<u8>,
    pub total_value: u64,
    /// `None` for transfers that never expire
    pub expiry_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
}

impl Transfer {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_time.map(|expiry| expiry < now).unwrap_or(false)
    }
}

/// One operator's portion of a key tweak
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTweak {
    /// VSS share of the tweak for this operator, with the dealer's proofs
    pub share: VerifiableSecretShare,
    /// Operator identifier -> public share of the tweak
    pub pubkey_shares_tweak: BTreeMap<String, Vec<u8>>,
}

impl KeyTweak {
    /// Public key of the whole tweak
    pub fn pubkey_tweak(&self) -> Option<&[u8]> {
        self.share.proofs.first().map(|p| p.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeaf {
    pub id: Uuid,
    pub transfer_id: Uuid,
    pub leaf_id: Uuid,
    pub previous_refund_tx: Vec<u8>,
    /// Refund signed during transfer creation, with witness once the sender completes
    pub intermediate_refund_tx: Vec<u8>,
    pub secret_cipher: Option<Vec<u8>>,
    /// Sender's identity signature over the leaf, transfer and cipher
    pub signature: Option<Vec<u8>>,
    /// Tweak waiting to be applied
    pub key_tweak: Option<KeyTweak>,
    pub sender_key_tweak_proof: Option<Vec<Vec<u8>>>,
    /// Refund co-signed for the receiver
    pub receiver_refund_tx: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeExit {
    pub transfer_id: Uuid,
    pub exit_txid: [u8; 32],
    /// Prevouts source for refund input 1
    pub connector_tx: Vec<u8>,
    pub confirmation_height: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreimageRequestStatus {
    WaitingForPreimage,
    PreimageShared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreimageRequest {
    pub transfer_id: Uuid,
    pub status: PreimageRequestStatus,
}
