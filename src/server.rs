//! Axum HTTP server for the signing operator
//!
//! `/v1/...` routes serve wallets; `/internal/...` routes are called by the
//! other operators through [`crate::transport::HttpTransport`].

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::dkg;
use crate::error::{ErrorCategory, OperatorError};
use crate::node::OperatorNode;
use crate::signing;
use crate::transfer;
use crate::transport::paths;
use crate::tree;
use crate::types::*;

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the router with all endpoints
pub fn create_router(node: Arc<OperatorNode>) -> Router {
    let origins: Vec<HeaderValue> = node
        .config
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        // Health & info
        .route("/health", get(health_handler))
        .route("/info", get(info_handler))
        .route("/admin/dkg", post(generate_keys_handler))
        // Deposits and leaves
        .route("/v1/deposit-key", post(deposit_key_handler))
        .route("/v1/tree-addresses", post(tree_address_handler))
        .route("/v1/leaves", post(create_leaf_handler))
        .route("/v1/leaves/{leaf_id}", get(get_leaf_handler))
        // Transfers
        .route("/v1/transfers/start", post(start_transfer_handler))
        .route("/v1/transfers/cooperative-exit", post(cooperative_exit_handler))
        .route("/v1/transfers/swap", post(leaf_swap_handler))
        .route("/v1/transfers/complete-send", post(complete_send_handler))
        .route("/v1/transfers/claim-tweak-keys", post(claim_tweak_keys_handler))
        .route("/v1/transfers/claim-sign-refunds", post(claim_sign_refunds_handler))
        .route("/v1/transfers/finalize", post(finalize_handler))
        .route("/v1/transfers/pending", post(pending_transfers_handler))
        .route("/v1/transfers/expired", post(expired_transfers_handler))
        .route("/v1/transfers/reclaim", post(reclaim_handler))
        // Signing
        .route(paths::FROST_ROUND1, post(frost_round1_handler))
        .route(paths::FROST_ROUND2, post(frost_round2_handler))
        // DKG
        .route(paths::DKG_INITIATE, post(dkg_initiate_handler))
        .route(paths::DKG_ROUND1_PACKAGES, post(dkg_round1_packages_handler))
        .route(paths::DKG_ROUND1_SIGNATURE, post(dkg_round1_signature_handler))
        .route(paths::DKG_ROUND2_PACKAGES, post(dkg_round2_packages_handler))
        // Replication
        .route(paths::MARK_KEYSHARES_USED, post(mark_keyshares_used_handler))
        .route(paths::DEPOSIT_ADDRESS, post(deposit_address_handler))
        .route(paths::PREPARE_TREE_ADDRESS, post(internal_tree_address_handler))
        .route(paths::CREATE_LEAF, post(internal_create_leaf_handler))
        .route(paths::INITIATE_TRANSFER, post(initiate_transfer_handler))
        .route(paths::SENDER_KEY_TWEAK, post(sender_key_tweak_handler))
        .route(paths::INITIATE_SETTLE, post(initiate_settle_handler))
        .route(paths::SETTLE, post(settle_handler))
        .route(paths::RECEIVER_REFUNDS, post(receiver_refunds_handler))
        .route(paths::COMPLETE_TRANSFER, post(complete_transfer_handler))
        .route(paths::EXPIRE_TRANSFER, post(expire_transfer_handler))
        .with_state(node)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint
async fn health_handler(State(node): State<Arc<OperatorNode>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        identifier: node.identifier(),
    })
}

/// Operator info endpoint
async fn info_handler(State(node): State<Arc<OperatorNode>>) -> ApiResult<OperatorInfo> {
    let available_keyshares = {
        let tx = node.store.begin().await.map_err(|e| api_error(e.into()))?;
        node.keyshares
            .available(tx.as_ref())
            .map_err(|e| api_error(e.into()))?
    };
    let identity_public_key = crate::keys::public_key_from_private_key(node.identity_key())
        .map_err(|e| api_error(e.into()))?;

    Ok(Json(OperatorInfo {
        index: node.config.index,
        identifier: node.identifier(),
        identity_public_key: identity_public_key.into(),
        threshold: node.config.threshold,
        operators: node.config.operator_count(),
        available_keyshares,
        pending_nonces: node.signer.pending_nonces().await,
    }))
}

/// Start a DKG request for this operator's pool
///
/// Returns once every operator signed the round-1 packages; the rest of the
/// run finishes in the background.
async fn generate_keys_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<GenerateKeysRequest>,
) -> ApiResult<GenerateKeysResponse> {
    if req.count == 0 {
        return Err(api_error(OperatorError::Validation(
            "count must be at least 1".to_string(),
        )));
    }
    let run = dkg::generate_keys(&node, req.count).await.map_err(api_error)?;
    let response = GenerateKeysResponse {
        request_id: run.request_id,
        key_count: run.key_count,
    };
    tokio::spawn(run.wait());
    Ok(Json(response))
}

async fn deposit_key_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<DepositKeyRequest>,
) -> ApiResult<DepositKeyResponse> {
    tree::generate_deposit_key(&node, &req).await.map(Json).map_err(api_error)
}

async fn tree_address_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<PrepareTreeAddressRequest>,
) -> ApiResult<PrepareTreeAddressResponse> {
    tree::prepare_tree_address(&node, &req).await.map(Json).map_err(api_error)
}

async fn create_leaf_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<CreateLeafRequest>,
) -> ApiResult<TreeNodeView> {
    tree::create_leaf(&node, &req).await.map(Json).map_err(api_error)
}

async fn get_leaf_handler(
    State(node): State<Arc<OperatorNode>>,
    Path(leaf_id): Path<Uuid>,
) -> ApiResult<TreeNodeView> {
    tree::get_leaf(&node, &leaf_id).await.map(Json).map_err(api_error)
}

async fn start_transfer_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<StartTransferRequest>,
) -> ApiResult<StartTransferResponse> {
    transfer::start_send_transfer(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn cooperative_exit_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<StartCooperativeExitRequest>,
) -> ApiResult<StartTransferResponse> {
    transfer::start_cooperative_exit(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn leaf_swap_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<StartLeafSwapRequest>,
) -> ApiResult<StartTransferResponse> {
    transfer::start_leaf_swap(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn complete_send_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<CompleteSendTransferRequest>,
) -> ApiResult<TransferResponse> {
    transfer::complete_send_transfer(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn claim_tweak_keys_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<ClaimTransferTweakKeysRequest>,
) -> ApiResult<TransferResponse> {
    transfer::claim_transfer_tweak_keys(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn claim_sign_refunds_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<ClaimTransferSignRefundsRequest>,
) -> ApiResult<StartTransferResponse> {
    transfer::claim_transfer_sign_refunds(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn finalize_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<FinalizeTransferRequest>,
) -> ApiResult<TransferResponse> {
    transfer::finalize_transfer(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn pending_transfers_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<QueryTransfersRequest>,
) -> ApiResult<QueryTransfersResponse> {
    transfer::query_pending_transfers(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn expired_transfers_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<QueryTransfersRequest>,
) -> ApiResult<QueryTransfersResponse> {
    transfer::query_expired_transfers(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn reclaim_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<ReclaimTransferRequest>,
) -> ApiResult<TransferResponse> {
    transfer::reclaim_expired_transfer(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn frost_round1_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<FrostRound1Request>,
) -> ApiResult<FrostRound1Response> {
    signing::handle_frost_round1(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn frost_round2_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<FrostRound2Request>,
) -> ApiResult<FrostRound2Response> {
    signing::handle_frost_round2(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn dkg_initiate_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<InitiateDkgRequest>,
) -> ApiResult<InitiateDkgResponse> {
    dkg::initiate_dkg(&node, &req).await.map(Json).map_err(api_error)
}

async fn dkg_round1_packages_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<Round1PackagesRequest>,
) -> ApiResult<Round1PackagesResponse> {
    dkg::round1_packages(&node, &req).await.map(Json).map_err(api_error)
}

async fn dkg_round1_signature_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<Round1SignatureRequest>,
) -> ApiResult<Round1SignatureResponse> {
    dkg::round1_signature(&node, &req).await.map(Json).map_err(api_error)
}

async fn dkg_round2_packages_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<Round2PackagesRequest>,
) -> ApiResult<Round2PackagesResponse> {
    dkg::round2_packages(&node, &req).await.map(Json).map_err(api_error)
}

async fn mark_keyshares_used_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<MarkKeysharesUsedRequest>,
) -> ApiResult<AckResponse> {
    tree::handle_mark_keyshares_used(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn deposit_address_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<MarkKeyshareForDepositAddressRequest>,
) -> ApiResult<AckResponse> {
    tree::handle_mark_keyshare_for_deposit_address(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn internal_tree_address_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<InternalPrepareTreeAddressRequest>,
) -> ApiResult<AckResponse> {
    tree::handle_prepare_tree_address(&node, &req).await.map(Json).map_err(api_error)
}

async fn internal_create_leaf_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<CreateLeafRequest>,
) -> ApiResult<AckResponse> {
    tree::handle_create_leaf(&node, &req).await.map(Json).map_err(api_error)
}

async fn initiate_transfer_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<InitiateTransferRequest>,
) -> ApiResult<AckResponse> {
    transfer::handle_initiate_transfer(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn sender_key_tweak_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<ApplySenderKeyTweakRequest>,
) -> ApiResult<TransferResponse> {
    transfer::handle_apply_sender_key_tweak(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn initiate_settle_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<InitiateSettleReceiverKeyTweakRequest>,
) -> ApiResult<AckResponse> {
    transfer::handle_initiate_settle_receiver_key_tweak(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn settle_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<SettleReceiverKeyTweakRequest>,
) -> ApiResult<AckResponse> {
    transfer::handle_settle_receiver_key_tweak(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn receiver_refunds_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<RecordReceiverRefundsRequest>,
) -> ApiResult<AckResponse> {
    transfer::handle_record_receiver_refunds(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn complete_transfer_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<CompleteTransferRequest>,
) -> ApiResult<AckResponse> {
    transfer::handle_complete_transfer(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn expire_transfer_handler(
    State(node): State<Arc<OperatorNode>>,
    Json(req): Json<ReclaimTransferRequest>,
) -> ApiResult<AckResponse> {
    transfer::handle_expire_transfer(&node, &req)
        .await
        .map(Json)
        .map_err(api_error)
}

fn status_code(err: &OperatorError) -> StatusCode {
    match err.category() {
        ErrorCategory::Validation => match err.error_code() {
            "NOT_FOUND" | "TRANSFER_NOT_FOUND" | "LEAF_NOT_FOUND" => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        },
        ErrorCategory::ResourceContention | ErrorCategory::FederationDisagreement => {
            StatusCode::CONFLICT
        }
        ErrorCategory::PeerUnavailable => StatusCode::BAD_GATEWAY,
        ErrorCategory::InternalConsistency | ErrorCategory::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn api_error(err: OperatorError) -> ApiError {
    let status = status_code(&err);
    let code = err.error_code();
    if status.is_server_error() {
        tracing::error!(code, error = %err, "Request failed");
    } else {
        tracing::warn!(code, error = %err, "Request rejected");
    }

    let mut body = ErrorResponse::new(code, err.to_string());
    if let Some(remote) = err.remote_code() {
        body = body.with_details(format!("peer code {}", remote));
    }
    (status, Json(body))
}
