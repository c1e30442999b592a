//! Operator-to-operator transport
//!
//! [`OperatorTransport`] has one method per internal endpoint. The HTTP
//! implementation posts JSON to the peer's `/internal/...` routes and turns a
//! non-2xx answer back into the peer's typed error code.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::SigningOperator;
use crate::types::*;

/// Internal route paths, shared by the server and the HTTP transport
pub mod paths {
    pub const FROST_ROUND1: &str = "/internal/frost/round1";
    pub const FROST_ROUND2: &str = "/internal/frost/round2";
    pub const DKG_INITIATE: &str = "/internal/dkg/initiate";
    pub const DKG_ROUND1_PACKAGES: &str = "/internal/dkg/round1-packages";
    pub const DKG_ROUND1_SIGNATURE: &str = "/internal/dkg/round1-signature";
    pub const DKG_ROUND2_PACKAGES: &str = "/internal/dkg/round2-packages";
    pub const MARK_KEYSHARES_USED: &str = "/internal/keyshares/mark-used";
    pub const DEPOSIT_ADDRESS: &str = "/internal/deposit-addresses";
    pub const PREPARE_TREE_ADDRESS: &str = "/internal/tree-addresses";
    pub const CREATE_LEAF: &str = "/internal/leaves";
    pub const INITIATE_TRANSFER: &str = "/internal/transfers/initiate";
    pub const SENDER_KEY_TWEAK: &str = "/internal/transfers/sender-key-tweak";
    pub const INITIATE_SETTLE: &str = "/internal/transfers/initiate-settle";
    pub const SETTLE: &str = "/internal/transfers/settle";
    pub const RECEIVER_REFUNDS: &str = "/internal/transfers/receiver-refunds";
    pub const COMPLETE_TRANSFER: &str = "/internal/transfers/complete";
    pub const EXPIRE_TRANSFER: &str = "/internal/transfers/expire";
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operator {operator} unreachable: {message}")]
    Unreachable { operator: String, message: String },
    #[error("operator rejected request ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("client error: {0}")]
    Client(String),
}

impl TransportError {
    /// Whether the same call may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Unreachable { .. } => true,
            TransportError::Rejected { status, .. } => *status == 409 || *status >= 500,
            _ => false,
        }
    }

    /// Remote error code, if the peer answered with one
    pub fn remote_code(&self) -> Option<&str> {
        match self {
            TransportError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Internal RPCs between operators
#[async_trait]
pub trait OperatorTransport: Send + Sync {
    async fn frost_round1(
        &self,
        operator: &SigningOperator,
        request: &FrostRound1Request,
    ) -> Result<FrostRound1Response, TransportError>;

    async fn frost_round2(
        &self,
        operator: &SigningOperator,
        request: &FrostRound2Request,
    ) -> Result<FrostRound2Response, TransportError>;

    async fn initiate_dkg(
        &self,
        operator: &SigningOperator,
        request: &InitiateDkgRequest,
    ) -> Result<InitiateDkgResponse, TransportError>;

    async fn round1_packages(
        &self,
        operator: &SigningOperator,
        request: &Round1PackagesRequest,
    ) -> Result<Round1PackagesResponse, TransportError>;

    async fn round1_signature(
        &self,
        operator: &SigningOperator,
        request: &Round1SignatureRequest,
    ) -> Result<Round1SignatureResponse, TransportError>;

    async fn round2_packages(
        &self,
        operator: &SigningOperator,
        request: &Round2PackagesRequest,
    ) -> Result<Round2PackagesResponse, TransportError>;

    async fn mark_keyshares_used(
        &self,
        operator: &SigningOperator,
        request: &MarkKeysharesUsedRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn mark_keyshare_for_deposit_address(
        &self,
        operator: &SigningOperator,
        request: &MarkKeyshareForDepositAddressRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn prepare_tree_address(
        &self,
        operator: &SigningOperator,
        request: &InternalPrepareTreeAddressRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn create_leaf(
        &self,
        operator: &SigningOperator,
        request: &CreateLeafRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn initiate_transfer(
        &self,
        operator: &SigningOperator,
        request: &InitiateTransferRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn apply_sender_key_tweak(
        &self,
        operator: &SigningOperator,
        request: &ApplySenderKeyTweakRequest,
    ) -> Result<TransferResponse, TransportError>;

    async fn initiate_settle_receiver_key_tweak(
        &self,
        operator: &SigningOperator,
        request: &InitiateSettleReceiverKeyTweakRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn settle_receiver_key_tweak(
        &self,
        operator: &SigningOperator,
        request: &SettleReceiverKeyTweakRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn record_receiver_refunds(
        &self,
        operator: &SigningOperator,
        request: &RecordReceiverRefundsRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn complete_transfer(
        &self,
        operator: &SigningOperator,
        request: &CompleteTransferRequest,
    ) -> Result<AckResponse, TransportError>;

    async fn expire_transfer(
        &self,
        operator: &SigningOperator,
        request: &ReclaimTransferRequest,
    ) -> Result<AckResponse, TransportError>;
}

/// JSON over HTTP transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(
        &self,
        operator: &SigningOperator,
        path: &str,
        request: &Req,
    ) -> Result<Resp, TransportError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", operator.address, path);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| TransportError::Unreachable {
                operator: operator.identifier.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<ErrorResponse>().await.ok();
            let (code, message) = match body {
                Some(body) => (body.code, body.message),
                None => ("UNKNOWN".to_string(), status.to_string()),
            };
            tracing::debug!(
                operator = %operator.identifier,
                path,
                status = status.as_u16(),
                code = %code,
                "Operator rejected request"
            );
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                code,
                message,
            });
        }

        response
            .json()
            .await
            .map_err(|e| TransportError::Decode(format!("{} from {}: {}", path, url, e)))
    }
}

#[async_trait]
impl OperatorTransport for HttpTransport {
    async fn frost_round1(
        &self,
        operator: &SigningOperator,
        request: &FrostRound1Request,
    ) -> Result<FrostRound1Response, TransportError> {
        self.post(operator, paths::FROST_ROUND1, request).await
    }

    async fn frost_round2(
        &self,
        operator: &SigningOperator,
        request: &FrostRound2Request,
    ) -> Result<FrostRound2Response, TransportError> {
        self.post(operator, paths::FROST_ROUND2, request).await
    }

    async fn initiate_dkg(
        &self,
        operator: &SigningOperator,
        request: &InitiateDkgRequest,
    ) -> Result<InitiateDkgResponse, TransportError> {
        self.post(operator, paths::DKG_INITIATE, request).await
    }

    async fn round1_packages(
        &self,
        operator: &SigningOperator,
        request: &Round1PackagesRequest,
    ) -> Result<Round1PackagesResponse, TransportError> {
        self.post(operator, paths::DKG_ROUND1_PACKAGES, request).await
    }

    async fn round1_signature(
        &self,
        operator: &SigningOperator,
        request: &Round1SignatureRequest,
    ) -> Result<Round1SignatureResponse, TransportError> {
        self.post(operator, paths::DKG_ROUND1_SIGNATURE, request).await
    }

    async fn round2_packages(
        &self,
        operator: &SigningOperator,
        request: &Round2PackagesRequest,
    ) -> Result<Round2PackagesResponse, TransportError> {
        self.post(operator, paths::DKG_ROUND2_PACKAGES, request).await
    }

    async fn mark_keyshares_used(
        &self,
        operator: &SigningOperator,
        request: &MarkKeysharesUsedRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::MARK_KEYSHARES_USED, request).await
    }

    async fn mark_keyshare_for_deposit_address(
        &self,
        operator: &SigningOperator,
        request: &MarkKeyshareForDepositAddressRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::DEPOSIT_ADDRESS, request).await
    }

    async fn prepare_tree_address(
        &self,
        operator: &SigningOperator,
        request: &InternalPrepareTreeAddressRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::PREPARE_TREE_ADDRESS, request).await
    }

    async fn create_leaf(
        &self,
        operator: &SigningOperator,
        request: &CreateLeafRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::CREATE_LEAF, request).await
    }

    async fn initiate_transfer(
        &self,
        operator: &SigningOperator,
        request: &InitiateTransferRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::INITIATE_TRANSFER, request).await
    }

    async fn apply_sender_key_tweak(
        &self,
        operator: &SigningOperator,
        request: &ApplySenderKeyTweakRequest,
    ) -> Result<TransferResponse, TransportError> {
        self.post(operator, paths::SENDER_KEY_TWEAK, request).await
    }

    async fn initiate_settle_receiver_key_tweak(
        &self,
        operator: &SigningOperator,
        request: &InitiateSettleReceiverKeyTweakRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::INITIATE_SETTLE, request).await
    }

    async fn settle_receiver_key_tweak(
        &self,
        operator: &SigningOperator,
        request: &SettleReceiverKeyTweakRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::SETTLE, request).await
    }

    async fn record_receiver_refunds(
        &self,
        operator: &SigningOperator,
        request: &RecordReceiverRefundsRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::RECEIVER_REFUNDS, request).await
    }

    async fn complete_transfer(
        &self,
        operator: &SigningOperator,
        request: &CompleteTransferRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::COMPLETE_TRANSFER, request).await
    }

    async fn expire_transfer(
        &self,
        operator: &SigningOperator,
        request: &ReclaimTransferRequest,
    ) -> Result<AckResponse, TransportError> {
        self.post(operator, paths::EXPIRE_TRANSFER, request).await
    }
}
