//! Request and response types for the operator HTTP API
//!
//! Byte fields travel as hex strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Deref;
use uuid::Uuid;

use crate::frost_signer::SigningResult;
use crate::models::{
    KeyTweak, Transfer, TransferStatus, TransferType, TreeNode, TreeNodeStatus,
};
use crate::secret_sharing::{SecretShare, VerifiableSecretShare};

/// Hex-encoded bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HexBytes(#[serde(with = "hex::serde")] pub Vec<u8>);

impl Deref for HexBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for HexBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for HexBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<HexBytes> for Vec<u8> {
    fn from(bytes: HexBytes) -> Self {
        bytes.0
    }
}

fn hex_map(map: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, HexBytes> {
    map.iter()
        .map(|(k, v)| (k.clone(), HexBytes(v.clone())))
        .collect()
}

fn byte_map(map: BTreeMap<String, HexBytes>) -> BTreeMap<String, Vec<u8>> {
    map.into_iter().map(|(k, v)| (k, v.0)).collect()
}

// ---------------------------------------------------------------------------
// Health

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorInfo {
    pub index: u32,
    pub identifier: String,
    pub identity_public_key: HexBytes,
    pub threshold: u16,
    pub operators: usize,
    /// Available keyshares in this operator's pool
    pub available_keyshares: usize,
    /// Signing nonces waiting for round 2
    pub pending_nonces: usize,
}

/// Acknowledgement from a peer for replicated writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub identifier: String,
}

// ---------------------------------------------------------------------------
// FROST signing

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrostRound1Request {
    pub keyshare_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrostRound1Response {
    pub identifier: String,
    /// One commitment per requested keyshare, in request order
    pub commitments: Vec<HexBytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrostSigningJob {
    pub job_id: String,
    pub keyshare_id: Uuid,
    /// 32-byte sighash
    pub message: HexBytes,
    pub verifying_key: HexBytes,
    /// Operator identifier -> commitment
    pub commitments: BTreeMap<String, HexBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_commitment: Option<HexBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptor_public_key: Option<HexBytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrostRound2Request {
    pub jobs: Vec<FrostSigningJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrostRound2Response {
    pub identifier: String,
    /// Job id -> signature share
    pub signature_shares: BTreeMap<String, HexBytes>,
}

/// Everything a user needs to finish a signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningResultView {
    pub job_id: String,
    pub message: HexBytes,
    pub verifying_key: HexBytes,
    pub keyshare_public_key: HexBytes,
    pub public_shares: BTreeMap<String, HexBytes>,
    pub min_signers: u16,
    pub signing_commitments: BTreeMap<String, HexBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_commitment: Option<HexBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptor_public_key: Option<HexBytes>,
    pub signature_shares: BTreeMap<String, HexBytes>,
}

impl From<&SigningResult> for SigningResultView {
    fn from(result: &SigningResult) -> Self {
        Self {
            job_id: result.job_id.clone(),
            message: result.message.clone().into(),
            verifying_key: result.verifying_key.clone().into(),
            keyshare_public_key: result.keyshare_public_key.clone().into(),
            public_shares: hex_map(&result.public_shares),
            min_signers: result.min_signers,
            signing_commitments: hex_map(&result.signing_commitments),
            user_commitment: result.user_commitment.clone().map(HexBytes),
            adaptor_public_key: result.adaptor_public_key.clone().map(HexBytes),
            signature_shares: hex_map(&result.signature_shares),
        }
    }
}

impl From<SigningResultView> for SigningResult {
    fn from(view: SigningResultView) -> Self {
        Self {
            job_id: view.job_id,
            message: view.message.0,
            verifying_key: view.verifying_key.0,
            keyshare_public_key: view.keyshare_public_key.0,
            public_shares: byte_map(view.public_shares),
            min_signers: view.min_signers,
            signing_commitments: byte_map(view.signing_commitments),
            user_commitment: view.user_commitment.map(|c| c.0),
            adaptor_public_key: view.adaptor_public_key.map(|k| k.0),
            signature_shares: byte_map(view.signature_shares),
        }
    }
}

// ---------------------------------------------------------------------------
// DKG

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateDkgRequest {
    pub request_id: Uuid,
    pub key_count: usize,
    pub min_signers: u16,
    pub max_signers: u16,
    /// Operator whose pool the generated keys belong to
    pub coordinator_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateDkgResponse {
    pub identifier: String,
    /// One round-1 package per key
    pub round1_packages: Vec<HexBytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round1PackagesRequest {
    pub request_id: Uuid,
    /// Per key: operator identifier -> round-1 package
    pub round1_packages: Vec<BTreeMap<String, HexBytes>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round1PackagesResponse {
    pub identifier: String,
    /// Identity signature over the hash of all round-1 packages
    pub signature: HexBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round1SignatureRequest {
    pub request_id: Uuid,
    /// Operator identifier -> signature over the round-1 hash
    pub signatures: BTreeMap<String, HexBytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round1SignatureResponse {
    pub identifier: String,
    /// Operators whose signature did not verify
    pub validation_failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round2PackagesRequest {
    pub request_id: Uuid,
    /// Sender of the packages
    pub identifier: String,
    /// One round-2 package per key, addressed to the receiver
    pub round2_packages: Vec<HexBytes>,
    /// Sender's identity signature over the packages
    pub signature: HexBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round2PackagesResponse {
    pub identifier: String,
    /// Whether the receiver finished key generation
    pub completed: bool,
}

// ---------------------------------------------------------------------------
// Keyshares and tree

/// Operator-local request to fill its own pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateKeysRequest {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateKeysResponse {
    pub request_id: Uuid,
    pub key_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkKeysharesUsedRequest {
    pub keyshare_ids: Vec<Uuid>,
}

/// Replicated owner of a deposit keyshare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkKeyshareForDepositAddressRequest {
    pub keyshare_id: Uuid,
    pub address: String,
    pub owner_identity_public_key: HexBytes,
    pub owner_signing_public_key: HexBytes,
}

/// One node of a tree the user wants addresses for
///
/// The signing keys of a node's children must add up to the node's own key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRequestNode {
    pub user_public_key: HexBytes,
    #[serde(default)]
    pub children: Vec<AddressRequestNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareTreeAddressRequest {
    pub identity_public_key: HexBytes,
    /// Deposit address whose output the tree spends
    pub parent_address: String,
    pub node: AddressRequestNode,
}

/// A requested node with the keyshare the coordinator assigned to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedAddressNode {
    pub user_public_key: HexBytes,
    pub keyshare_id: Uuid,
    #[serde(default)]
    pub children: Vec<PreparedAddressNode>,
}

impl From<&PreparedAddressNode> for AddressRequestNode {
    fn from(node: &PreparedAddressNode) -> Self {
        Self {
            user_public_key: node.user_public_key.clone(),
            children: node.children.iter().map(Self::from).collect(),
        }
    }
}

/// Replicated tree address preparation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalPrepareTreeAddressRequest {
    pub identity_public_key: HexBytes,
    pub node: PreparedAddressNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressNode {
    pub keyshare_id: Uuid,
    pub address: String,
    /// Keyshare public key plus the node's user key
    pub verifying_key: HexBytes,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AddressNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareTreeAddressResponse {
    pub node: AddressNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositKeyRequest {
    pub identity_public_key: HexBytes,
    pub signing_public_key: HexBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositKeyResponse {
    pub keyshare_id: Uuid,
    /// Keyshare public key plus the user's signing key
    pub verifying_key: HexBytes,
    pub deposit_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLeafRequest {
    pub leaf_id: Uuid,
    pub tree_id: Uuid,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    pub keyshare_id: Uuid,
    pub owner_identity_public_key: HexBytes,
    pub owner_signing_public_key: HexBytes,
    pub raw_tx: HexBytes,
    pub raw_refund_tx: HexBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNodeView {
    pub id: Uuid,
    pub tree_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub value: u64,
    pub status: TreeNodeStatus,
    pub verifying_public_key: HexBytes,
    pub owner_identity_public_key: HexBytes,
    pub owner_signing_public_key: HexBytes,
    pub raw_tx: HexBytes,
    pub raw_refund_tx: HexBytes,
}

impl From<&TreeNode> for TreeNodeView {
    fn from(node: &TreeNode) -> Self {
        Self {
            id: node.id,
            tree_id: node.tree_id,
            parent_id: node.parent_id,
            value: node.value,
            status: node.status,
            verifying_public_key: node.verifying_pubkey.clone().into(),
            owner_identity_public_key: node.owner_identity_pubkey.clone().into(),
            owner_signing_public_key: node.owner_signing_pubkey.clone().into(),
            raw_tx: node.raw_tx.clone().into(),
            raw_refund_tx: node.raw_refund_tx.clone().into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transfers

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferView {
    pub id: Uuid,
    pub sender_identity_public_key: HexBytes,
    pub receiver_identity_public_key: HexBytes,
    pub total_value: u64,
    pub expiry_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
}

impl From<&Transfer> for TransferView {
    fn from(transfer: &Transfer) -> Self {
        Self {
            id: transfer.id,
            sender_identity_public_key: transfer.sender_identity_pubkey.clone().into(),
            receiver_identity_public_key: transfer.receiver_identity_pubkey.clone().into(),
            total_value: transfer.total_value,
            expiry_time: transfer.expiry_time,
            completion_time: transfer.completion_time,
            transfer_type: transfer.transfer_type,
            status: transfer.status,
        }
    }
}

/// A leaf's new refund transaction and the user's commitment for signing it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRefund {
    pub leaf_id: Uuid,
    pub raw_refund_tx: HexBytes,
    pub signing_commitment: HexBytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTransferRequest {
    pub transfer_id: Uuid,
    pub sender_identity_public_key: HexBytes,
    pub receiver_identity_public_key: HexBytes,
    #[serde(default)]
    pub expiry_time: Option<DateTime<Utc>>,
    pub leaves: Vec<LeafRefund>,
    #[serde(default = "default_transfer_type")]
    pub transfer_type: TransferType,
}

fn default_transfer_type() -> TransferType {
    TransferType::Transfer
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooperativeExitInfo {
    /// Txid of the exit transaction, internal byte order
    pub exit_txid: HexBytes,
    /// Transaction providing the second refund input
    pub connector_tx: HexBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCooperativeExitRequest {
    pub transfer: StartTransferRequest,
    pub exit: CooperativeExitInfo,
}

/// Start of a leaf swap: refunds are signed as adaptor signatures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartLeafSwapRequest {
    pub transfer: StartTransferRequest,
    /// Compressed adaptor point `T = t*G`
    pub adaptor_public_key: HexBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartTransferResponse {
    pub transfer: TransferView,
    pub signing_results: Vec<SigningResultView>,
}

/// Replicated creation of a transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateTransferRequest {
    pub transfer: StartTransferRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<CooperativeExitInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub transfer: TransferView,
}

/// Wire form of one operator's tweak package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorKeyTweak {
    pub index: u64,
    pub threshold: usize,
    pub share: HexBytes,
    pub proofs: Vec<HexBytes>,
    pub pubkey_shares_tweak: BTreeMap<String, HexBytes>,
}

impl From<&KeyTweak> for OperatorKeyTweak {
    fn from(tweak: &KeyTweak) -> Self {
        Self {
            index: tweak.share.share.index,
            threshold: tweak.share.share.threshold,
            share: tweak.share.share.share.clone().into(),
            proofs: tweak.share.proofs.iter().cloned().map(HexBytes).collect(),
            pubkey_shares_tweak: hex_map(&tweak.pubkey_shares_tweak),
        }
    }
}

impl From<OperatorKeyTweak> for KeyTweak {
    fn from(tweak: OperatorKeyTweak) -> Self {
        Self {
            share: VerifiableSecretShare {
                share: SecretShare {
                    threshold: tweak.threshold,
                    index: tweak.index,
                    share: tweak.share.0,
                },
                proofs: tweak.proofs.into_iter().map(|p| p.0).collect(),
            },
            pubkey_shares_tweak: byte_map(tweak.pubkey_shares_tweak),
        }
    }
}

/// Sender's data for one leaf, with a tweak package per operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderLeafTweak {
    pub leaf_id: Uuid,
    pub secret_cipher: HexBytes,
    /// Identity signature over `leaf_id || transfer_id || secret_cipher`
    pub signature: HexBytes,
    /// Aggregated signature of the new refund
    pub refund_signature: HexBytes,
    /// Operator identifier -> tweak package
    pub key_tweaks: BTreeMap<String, OperatorKeyTweak>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteSendTransferRequest {
    pub transfer_id: Uuid,
    pub sender_identity_public_key: HexBytes,
    pub leaves: Vec<SenderLeafTweak>,
}

/// Sender's data for one leaf as seen by a single operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorSenderLeafTweak {
    pub leaf_id: Uuid,
    pub secret_cipher: HexBytes,
    pub signature: HexBytes,
    pub refund_signature: HexBytes,
    pub key_tweak: OperatorKeyTweak,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySenderKeyTweakRequest {
    pub transfer_id: Uuid,
    pub sender_identity_public_key: HexBytes,
    pub leaves: Vec<OperatorSenderLeafTweak>,
}

/// Receiver's data for one leaf, with a tweak package per operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimLeafTweak {
    pub leaf_id: Uuid,
    /// Receiver's new signing public key for the leaf
    pub signing_public_key: HexBytes,
    pub key_tweaks: BTreeMap<String, OperatorKeyTweak>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimTransferTweakKeysRequest {
    pub transfer_id: Uuid,
    pub receiver_identity_public_key: HexBytes,
    pub leaves: Vec<ClaimLeafTweak>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorClaimLeafTweak {
    pub leaf_id: Uuid,
    pub signing_public_key: HexBytes,
    pub key_tweak: OperatorKeyTweak,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateSettleReceiverKeyTweakRequest {
    pub transfer_id: Uuid,
    pub receiver_identity_public_key: HexBytes,
    pub leaves: Vec<OperatorClaimLeafTweak>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleAction {
    Apply,
    Revert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleReceiverKeyTweakRequest {
    pub transfer_id: Uuid,
    pub action: SettleAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimTransferSignRefundsRequest {
    pub transfer_id: Uuid,
    pub receiver_identity_public_key: HexBytes,
    pub leaves: Vec<LeafRefund>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverRefund {
    pub leaf_id: Uuid,
    pub raw_refund_tx: HexBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordReceiverRefundsRequest {
    pub transfer_id: Uuid,
    pub receiver_identity_public_key: HexBytes,
    pub leaves: Vec<ReceiverRefund>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedLeafRefund {
    pub leaf_id: Uuid,
    /// Refund transaction carrying the aggregated key-path signature
    pub signed_refund_tx: HexBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeTransferRequest {
    pub transfer_id: Uuid,
    pub receiver_identity_public_key: HexBytes,
    pub leaves: Vec<SignedLeafRefund>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTransferRequest {
    pub transfer_id: Uuid,
    pub leaves: Vec<SignedLeafRefund>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTransfersRequest {
    pub identity_public_key: HexBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryTransfersResponse {
    pub transfers: Vec<TransferView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimTransferRequest {
    pub transfer_id: Uuid,
    pub sender_identity_public_key: HexBytes,
}

// ---------------------------------------------------------------------------
// Errors

/// Generic error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_bytes_serialize_as_hex_string() {
        let request = MarkKeysharesUsedRequest {
            keyshare_ids: vec![Uuid::nil()],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["keyshare_ids"][0], Uuid::nil().to_string());

        let refund = ReceiverRefund {
            leaf_id: Uuid::nil(),
            raw_refund_tx: vec![0xde, 0xad].into(),
        };
        let json = serde_json::to_string(&refund).unwrap();
        assert!(json.contains("\"dead\""));
        let parsed: ReceiverRefund = serde_json::from_str(&json).unwrap();
        assert_eq!(&*parsed.raw_refund_tx, &[0xde, 0xad]);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        let result: Result<ReceiverRefund, _> = serde_json::from_str(&format!(
            r#"{{"leaf_id":"{}","raw_refund_tx":"zz"}}"#,
            Uuid::nil()
        ));
        assert!(result.is_err());
    }

    #[test]
    fn test_start_transfer_defaults() {
        let json = format!(
            r#"{{"transfer_id":"{}","sender_identity_public_key":"02","receiver_identity_public_key":"03","leaves":[]}}"#,
            Uuid::nil()
        );
        let request: StartTransferRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(request.transfer_type, TransferType::Transfer);
        assert!(request.expiry_time.is_none());
    }

    #[test]
    fn test_key_tweak_conversion_keeps_fields() {
        let tweak = KeyTweak {
            share: VerifiableSecretShare {
                share: SecretShare {
                    threshold: 2,
                    index: 3,
                    share: vec![7; 32],
                },
                proofs: vec![vec![2; 33], vec![3; 33]],
            },
            pubkey_shares_tweak: BTreeMap::from([("01".to_string(), vec![2; 33])]),
        };
        let wire = OperatorKeyTweak::from(&tweak);
        assert_eq!(wire.index, 3);
        assert_eq!(KeyTweak::from(wire), tweak);
    }

    #[test]
    fn test_error_response() {
        let err = ErrorResponse::new("TRANSFER_NOT_FOUND", "transfer not found")
            .with_details("transfer_id: 123");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("TRANSFER_NOT_FOUND"));
    }
}
