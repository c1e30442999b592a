//! End-to-end tests against an in-process federation of three operators,
//! each served over HTTP on an ephemeral port.

use bitcoin::{OutPoint, Transaction};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use uuid::Uuid;

use frost_operator::config::operator_identifier;
use frost_operator::keys;
use frost_operator::models::{KeyTweak, TransferStatus, TreeNodeStatus};
use frost_operator::secret_sharing::split_secret_with_proofs;
use frost_operator::transfer::sender_signature_message;
use frost_operator::tx;
use frost_operator::types::*;
use frost_operator::{
    create_router, user_commit, FederationConfig, HttpTransport, MemoryStore, OperatorNode,
    SigningResult, Store, StoreTx,
};

const OPERATORS: u32 = 3;
const THRESHOLD: usize = 2;
const LEAF_VALUE: u64 = 100_000;

struct Federation {
    nodes: Vec<Arc<OperatorNode>>,
    addresses: Vec<String>,
    client: reqwest::Client,
}

fn identity_secret(index: u32) -> Vec<u8> {
    vec![(index + 1) as u8; 32]
}

impl Federation {
    async fn start() -> Self {
        let mut listeners = Vec::new();
        let mut addresses = Vec::new();
        for _ in 0..OPERATORS {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addresses.push(format!("http://{}", listener.local_addr().unwrap()));
            listeners.push(listener);
        }

        let mut nodes = Vec::new();
        for (index, listener) in listeners.into_iter().enumerate() {
            let config = federation_config(index as u32, &addresses);
            let node = OperatorNode::new(
                Arc::new(config),
                identity_secret(index as u32),
                Arc::new(MemoryStore::new()),
                Arc::new(HttpTransport::new(Duration::from_secs(10)).unwrap()),
            )
            .unwrap();
            let app = create_router(node.clone());
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            nodes.push(node);
        }

        Self {
            nodes,
            addresses,
            client: reqwest::Client::new(),
        }
    }

    async fn post<Req, Resp>(
        &self,
        operator: usize,
        path: &str,
        request: &Req,
    ) -> Result<Resp, (u16, ErrorResponse)>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{}", self.addresses[operator], path))
            .json(request)
            .send()
            .await
            .unwrap();
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await.unwrap())
        } else {
            Err((status.as_u16(), response.json().await.unwrap()))
        }
    }

    async fn leaf(&self, operator: usize, leaf_id: Uuid) -> TreeNodeView {
        self.client
            .get(format!("{}/v1/leaves/{}", self.addresses[operator], leaf_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Run DKG for operator 0's pool and wait until every operator stored the keys
    async fn generate_keys(&self, count: usize) {
        let response: GenerateKeysResponse = self
            .post(0, "/admin/dkg", &GenerateKeysRequest { count })
            .await
            .unwrap();
        assert_eq!(response.key_count, count);

        for _ in 0..200 {
            let mut ready = true;
            for node in &self.nodes {
                let tx = node.store.begin().await.unwrap();
                if tx.count_available_keyshares(0).unwrap() < count {
                    ready = false;
                }
            }
            if ready {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("DKG did not complete on every operator");
    }

    async fn transfer_statuses(&self, transfer_id: Uuid) -> Vec<TransferStatus> {
        let mut statuses = Vec::new();
        for node in &self.nodes {
            let tx = node.store.begin().await.unwrap();
            statuses.push(tx.get_transfer(&transfer_id).unwrap().unwrap().status);
        }
        statuses
    }
}

fn federation_config(index: u32, addresses: &[String]) -> FederationConfig {
    let mut toml = format!(
        "index = {index}\nthreshold = {THRESHOLD}\nbind_address = \"127.0.0.1:0\"\n\n[dkg]\nkey_threshold = 0\nkey_count = 1\n"
    );
    for (i, address) in addresses.iter().enumerate() {
        let public_key = keys::public_key_from_private_key(&identity_secret(i as u32)).unwrap();
        toml.push_str(&format!(
            "\n[[operators]]\nindex = {i}\naddress = \"{address}\"\nidentity_public_key = \"{}\"\n",
            hex::encode(public_key)
        ));
    }
    FederationConfig::from_toml_str(&toml).unwrap()
}

/// One tweak package per operator from a fresh VSS split of `tweak`
fn tweak_packages(tweak: &[u8]) -> BTreeMap<String, OperatorKeyTweak> {
    let shares = split_secret_with_proofs(tweak, THRESHOLD, OPERATORS as usize).unwrap();
    let pubkey_shares_tweak: BTreeMap<String, Vec<u8>> = shares
        .iter()
        .map(|s| {
            (
                operator_identifier((s.share.index - 1) as u32),
                keys::public_key_from_private_key(&s.share.share).unwrap(),
            )
        })
        .collect();
    shares
        .into_iter()
        .map(|share| {
            let identifier = operator_identifier((share.share.index - 1) as u32);
            let tweak = KeyTweak {
                share,
                pubkey_shares_tweak: pubkey_shares_tweak.clone(),
            };
            (identifier, OperatorKeyTweak::from(&tweak))
        })
        .collect()
}

/// Finish a signature the federation started, as the key's user
fn finish_signature(
    view: &SigningResultView,
    user_secret: &[u8],
    nonces: &frost_secp256k1_tr::round1::SigningNonces,
) -> Vec<u8> {
    let result = SigningResult::from(view.clone());
    let share = result.sign_as_user(user_secret, nonces).unwrap();
    result.aggregate(Some(&share)).unwrap()
}

struct Wallet {
    identity: Vec<u8>,
    identity_public_key: Vec<u8>,
}

impl Wallet {
    fn new(seed: u8) -> Self {
        let identity = vec![seed; 32];
        let identity_public_key = keys::public_key_from_private_key(&identity).unwrap();
        Self {
            identity,
            identity_public_key,
        }
    }
}

struct Leaf {
    id: Uuid,
    node_tx: Transaction,
    signing_secret: Vec<u8>,
}

/// Deposit into a fresh leaf owned by `owner`
async fn deposit(federation: &Federation, owner: &Wallet) -> Leaf {
    let signing_secret = keys::generate_private_key();
    let signing_public_key = keys::public_key_from_private_key(&signing_secret).unwrap();

    let deposit: DepositKeyResponse = federation
        .post(
            0,
            "/v1/deposit-key",
            &DepositKeyRequest {
                identity_public_key: owner.identity_public_key.clone().into(),
                signing_public_key: signing_public_key.clone().into(),
            },
        )
        .await
        .unwrap();

    let node_tx = tx::node_transaction(OutPoint::null(), LEAF_VALUE, &deposit.verifying_key).unwrap();
    let refund = tx::refund_transaction(
        node_tx.compute_txid(),
        LEAF_VALUE - 1_000,
        &owner.identity_public_key,
        2000,
    )
    .unwrap();

    let id = Uuid::new_v4();
    let leaf: TreeNodeView = federation
        .post(
            0,
            "/v1/leaves",
            &CreateLeafRequest {
                leaf_id: id,
                tree_id: Uuid::new_v4(),
                parent_id: None,
                keyshare_id: deposit.keyshare_id,
                owner_identity_public_key: owner.identity_public_key.clone().into(),
                owner_signing_public_key: signing_public_key.into(),
                raw_tx: tx::serialize_tx(&node_tx).into(),
                raw_refund_tx: tx::serialize_tx(&refund).into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(leaf.status, TreeNodeStatus::Available);

    Leaf {
        id,
        node_tx,
        signing_secret,
    }
}

/// Start a transfer of `leaf` and return the signed intermediate refund signature
async fn start_transfer(
    federation: &Federation,
    transfer_id: Uuid,
    sender: &Wallet,
    receiver: &Wallet,
    leaf: &Leaf,
    expiry: chrono::Duration,
) -> Result<Vec<u8>, (u16, ErrorResponse)> {
    let refund = tx::refund_transaction(
        leaf.node_tx.compute_txid(),
        LEAF_VALUE - 1_000,
        &receiver.identity_public_key,
        1900,
    )
    .unwrap();
    let (nonces, commitment) = user_commit(&leaf.signing_secret).unwrap();

    let started: StartTransferResponse = federation
        .post(
            0,
            "/v1/transfers/start",
            &StartTransferRequest {
                transfer_id,
                sender_identity_public_key: sender.identity_public_key.clone().into(),
                receiver_identity_public_key: receiver.identity_public_key.clone().into(),
                expiry_time: Some(Utc::now() + expiry),
                leaves: vec![LeafRefund {
                    leaf_id: leaf.id,
                    raw_refund_tx: tx::serialize_tx(&refund).into(),
                    signing_commitment: commitment.into(),
                }],
                transfer_type: frost_operator::models::TransferType::Transfer,
            },
        )
        .await?;
    assert_eq!(started.transfer.status, TransferStatus::SenderInitiated);
    assert_eq!(started.signing_results.len(), 1);

    let signature = finish_signature(&started.signing_results[0], &leaf.signing_secret, &nonces);
    let signed = tx::with_key_spend_signature(&refund, &signature).unwrap();
    tx::verify_key_spend(&signed, &leaf.node_tx, None).unwrap();
    Ok(signature)
}

/// Send `leaf` to `receiver`; returns the receiver's temporary signing secret
async fn send(
    federation: &Federation,
    transfer_id: Uuid,
    sender: &Wallet,
    receiver: &Wallet,
    leaf: &Leaf,
) -> Vec<u8> {
    let refund_signature = start_transfer(
        federation,
        transfer_id,
        sender,
        receiver,
        leaf,
        chrono::Duration::minutes(10),
    )
    .await
    .unwrap();

    let temporary_secret = keys::generate_private_key();
    let tweak = keys::subtract_private_keys(&leaf.signing_secret, &temporary_secret).unwrap();
    let cipher = temporary_secret.clone();
    let signature = keys::sign_with_identity(
        &sender.identity,
        &sender_signature_message(&leaf.id, &transfer_id, &cipher),
    )
    .unwrap();

    let response: TransferResponse = federation
        .post(
            0,
            "/v1/transfers/complete-send",
            &CompleteSendTransferRequest {
                transfer_id,
                sender_identity_public_key: sender.identity_public_key.clone().into(),
                leaves: vec![SenderLeafTweak {
                    leaf_id: leaf.id,
                    secret_cipher: cipher.into(),
                    signature: signature.into(),
                    refund_signature: refund_signature.into(),
                    key_tweaks: tweak_packages(&tweak),
                }],
            },
        )
        .await
        .unwrap();
    assert_eq!(response.transfer.status, TransferStatus::SenderKeyTweaked);
    temporary_secret
}

fn claim_request(
    transfer_id: Uuid,
    receiver: &Wallet,
    leaf_id: Uuid,
    temporary_secret: &[u8],
    new_secret: &[u8],
) -> ClaimTransferTweakKeysRequest {
    let tweak = keys::subtract_private_keys(temporary_secret, new_secret).unwrap();
    ClaimTransferTweakKeysRequest {
        transfer_id,
        receiver_identity_public_key: receiver.identity_public_key.clone().into(),
        leaves: vec![ClaimLeafTweak {
            leaf_id,
            signing_public_key: keys::public_key_from_private_key(new_secret)
                .unwrap()
                .into(),
            key_tweaks: tweak_packages(&tweak),
        }],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dkg_fills_pool_on_every_operator() {
    let federation = Federation::start().await;
    federation.generate_keys(3).await;

    let mut public_keys = Vec::new();
    for node in &federation.nodes {
        let tx = node.store.begin().await.unwrap();
        let keyshares = tx.available_keyshares(0, 10).unwrap();
        assert_eq!(keyshares.len(), 3);
        for keyshare in &keyshares {
            assert_eq!(keyshare.min_signers as usize, THRESHOLD);
            assert_eq!(keyshare.public_shares.len(), OPERATORS as usize);
            frost_operator::keyshare::verify_keyshare(keyshare).unwrap();
        }
        public_keys.push(
            keyshares
                .iter()
                .map(|k| (k.id, k.public_key.clone()))
                .collect::<Vec<_>>(),
        );
    }
    assert!(public_keys.windows(2).all(|w| w[0] == w[1]));

    let info: OperatorInfo = federation
        .client
        .get(format!("{}/info", federation.addresses[0]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info.available_keyshares, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_moves_leaf_to_receiver() {
    let federation = Federation::start().await;
    federation.generate_keys(1).await;

    let sender = Wallet::new(0x11);
    let receiver = Wallet::new(0x22);
    let leaf = deposit(&federation, &sender).await;
    let transfer_id = Uuid::new_v4();
    let temporary_secret = send(&federation, transfer_id, &sender, &receiver, &leaf).await;

    let pending: QueryTransfersResponse = federation
        .post(
            1,
            "/v1/transfers/pending",
            &QueryTransfersRequest {
                identity_public_key: receiver.identity_public_key.clone().into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(pending.transfers.len(), 1);
    assert_eq!(pending.transfers[0].id, transfer_id);
    assert_eq!(pending.transfers[0].total_value, LEAF_VALUE);

    // the receiver may use any operator as coordinator
    let new_secret = keys::generate_private_key();
    let claimed: TransferResponse = federation
        .post(
            1,
            "/v1/transfers/claim-tweak-keys",
            &claim_request(transfer_id, &receiver, leaf.id, &temporary_secret, &new_secret),
        )
        .await
        .unwrap();
    assert_eq!(claimed.transfer.status, TransferStatus::ReceiverKeyTweaked);
    let new_public_key = keys::public_key_from_private_key(&new_secret).unwrap();
    for operator in 0..OPERATORS as usize {
        let view = federation.leaf(operator, leaf.id).await;
        assert_eq!(view.owner_identity_public_key.0, receiver.identity_public_key);
        assert_eq!(view.owner_signing_public_key.0, new_public_key);
        assert_eq!(view.status, TreeNodeStatus::TransferLocked);
    }

    let refund = tx::refund_transaction(
        leaf.node_tx.compute_txid(),
        LEAF_VALUE - 1_000,
        &receiver.identity_public_key,
        1800,
    )
    .unwrap();
    let (nonces, commitment) = user_commit(&new_secret).unwrap();
    let signed: StartTransferResponse = federation
        .post(
            2,
            "/v1/transfers/claim-sign-refunds",
            &ClaimTransferSignRefundsRequest {
                transfer_id,
                receiver_identity_public_key: receiver.identity_public_key.clone().into(),
                leaves: vec![LeafRefund {
                    leaf_id: leaf.id,
                    raw_refund_tx: tx::serialize_tx(&refund).into(),
                    signing_commitment: commitment.into(),
                }],
            },
        )
        .await
        .unwrap();
    assert_eq!(signed.transfer.status, TransferStatus::ReceiverRefundSigned);

    let signature = finish_signature(&signed.signing_results[0], &new_secret, &nonces);
    let signed_refund = tx::with_key_spend_signature(&refund, &signature).unwrap();
    let finalized: TransferResponse = federation
        .post(
            2,
            "/v1/transfers/finalize",
            &FinalizeTransferRequest {
                transfer_id,
                receiver_identity_public_key: receiver.identity_public_key.clone().into(),
                leaves: vec![SignedLeafRefund {
                    leaf_id: leaf.id,
                    signed_refund_tx: tx::serialize_tx(&signed_refund).into(),
                }],
            },
        )
        .await
        .unwrap();
    assert_eq!(finalized.transfer.status, TransferStatus::Completed);
    assert!(finalized.transfer.completion_time.is_some());

    for operator in 0..OPERATORS as usize {
        let view = federation.leaf(operator, leaf.id).await;
        assert_eq!(view.status, TreeNodeStatus::Available);
        assert_eq!(view.raw_refund_tx.0, tx::serialize_tx(&signed_refund));
    }
    assert_eq!(
        federation.transfer_statuses(transfer_id).await,
        vec![TransferStatus::Completed; OPERATORS as usize]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_receiver_tweak_is_reverted_everywhere() {
    let federation = Federation::start().await;
    federation.generate_keys(1).await;

    let sender = Wallet::new(0x11);
    let receiver = Wallet::new(0x22);
    let leaf = deposit(&federation, &sender).await;
    let transfer_id = Uuid::new_v4();
    let temporary_secret = send(&federation, transfer_id, &sender, &receiver, &leaf).await;

    let keyshares_before = {
        let mut keys = Vec::new();
        for node in &federation.nodes {
            let tx = node.store.begin().await.unwrap();
            let leaf_node = tx.get_tree_node(&leaf.id).unwrap().unwrap();
            keys.push(tx.get_keyshare(&leaf_node.signing_keyshare_id).unwrap().unwrap());
        }
        keys
    };

    // the last operator receives a share that does not match the proofs
    let new_secret = keys::generate_private_key();
    let mut request = claim_request(transfer_id, &receiver, leaf.id, &temporary_secret, &new_secret);
    let tweaks = &mut request.leaves[0].key_tweaks;
    let forged = tweaks[&operator_identifier(0)].share.clone();
    tweaks
        .get_mut(&operator_identifier(2))
        .unwrap()
        .share = forged;

    let (status, error) = federation
        .post::<_, TransferResponse>(0, "/v1/transfers/claim-tweak-keys", &request)
        .await
        .unwrap_err();
    assert_eq!(status, 409);
    assert_eq!(error.code, "SETTLEMENT_REJECTED");
    assert!(error.message.contains(&operator_identifier(2)));

    assert_eq!(
        federation.transfer_statuses(transfer_id).await,
        vec![TransferStatus::SenderKeyTweaked; OPERATORS as usize]
    );
    for (node, before) in federation.nodes.iter().zip(&keyshares_before) {
        let tx = node.store.begin().await.unwrap();
        assert_eq!(&tx.get_keyshare(&before.id).unwrap().unwrap(), before);
        assert!(tx
            .transfer_leaves(&transfer_id)
            .unwrap()
            .iter()
            .all(|l| l.key_tweak.is_none()));
        let leaf_node = tx.get_tree_node(&leaf.id).unwrap().unwrap();
        assert_eq!(leaf_node.owner_identity_pubkey, sender.identity_public_key);
    }

    // a correct claim still goes through afterwards
    let claimed: TransferResponse = federation
        .post(
            0,
            "/v1/transfers/claim-tweak-keys",
            &claim_request(transfer_id, &receiver, leaf.id, &temporary_secret, &new_secret),
        )
        .await
        .unwrap();
    assert_eq!(claimed.transfer.status, TransferStatus::ReceiverKeyTweaked);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expired_transfer_is_reclaimed() {
    let federation = Federation::start().await;
    federation.generate_keys(1).await;

    let sender = Wallet::new(0x11);
    let receiver = Wallet::new(0x22);
    let leaf = deposit(&federation, &sender).await;
    let transfer_id = Uuid::new_v4();
    start_transfer(
        &federation,
        transfer_id,
        &sender,
        &receiver,
        &leaf,
        chrono::Duration::seconds(2),
    )
    .await
    .unwrap();

    let reclaim = ReclaimTransferRequest {
        transfer_id,
        sender_identity_public_key: sender.identity_public_key.clone().into(),
    };
    let (status, error) = federation
        .post::<_, TransferResponse>(0, "/v1/transfers/reclaim", &reclaim)
        .await
        .unwrap_err();
    assert_eq!(status, 400);
    assert_eq!(error.code, "TRANSFER_NOT_EXPIRED");

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let expired: QueryTransfersResponse = federation
        .post(
            1,
            "/v1/transfers/expired",
            &QueryTransfersRequest {
                identity_public_key: sender.identity_public_key.clone().into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(expired.transfers.len(), 1);
    assert_eq!(expired.transfers[0].id, transfer_id);

    let pending: QueryTransfersResponse = federation
        .post(
            1,
            "/v1/transfers/pending",
            &QueryTransfersRequest {
                identity_public_key: receiver.identity_public_key.clone().into(),
            },
        )
        .await
        .unwrap();
    assert!(pending.transfers.is_empty());

    let reclaimed: TransferResponse = federation
        .post(2, "/v1/transfers/reclaim", &reclaim)
        .await
        .unwrap();
    assert_eq!(reclaimed.transfer.status, TransferStatus::Expired);
    for operator in 0..OPERATORS as usize {
        let view = federation.leaf(operator, leaf.id).await;
        assert_eq!(view.status, TreeNodeStatus::Available);
        assert_eq!(view.owner_identity_public_key.0, sender.identity_public_key);
    }

    // the leaf can be sent again
    let retry = Uuid::new_v4();
    start_transfer(
        &federation,
        retry,
        &sender,
        &receiver,
        &leaf,
        chrono::Duration::minutes(10),
    )
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deposits_never_share_a_keyshare() {
    let federation = Arc::new(Federation::start().await);
    federation.generate_keys(3).await;

    let owner = keys::public_key_from_private_key(&[0x11; 32]).unwrap();
    let mut handles = Vec::new();
    for _ in 0..4 {
        let federation = federation.clone();
        let owner = owner.clone();
        handles.push(tokio::spawn(async move {
            let signing = keys::public_key_from_private_key(&keys::generate_private_key()).unwrap();
            federation
                .post::<_, DepositKeyResponse>(
                    0,
                    "/v1/deposit-key",
                    &DepositKeyRequest {
                        identity_public_key: owner.into(),
                        signing_public_key: signing.into(),
                    },
                )
                .await
        }));
    }

    let mut allocated = Vec::new();
    let mut rejected = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(response) => allocated.push(response.keyshare_id),
            Err((status, error)) => rejected.push((status, error.code)),
        }
    }
    allocated.sort();
    allocated.dedup();
    assert_eq!(allocated.len(), 3);
    assert_eq!(rejected, vec![(409, "INSUFFICIENT_KEYSHARES".to_string())]);

    for node in &federation.nodes {
        let tx = node.store.begin().await.unwrap();
        assert_eq!(tx.count_available_keyshares(0).unwrap(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_swap_refund_needs_adaptor_secret() {
    let federation = Federation::start().await;
    federation.generate_keys(1).await;

    let sender = Wallet::new(0x21);
    let receiver = Wallet::new(0x22);
    let leaf = deposit(&federation, &sender).await;

    let adaptor_secret = keys::generate_private_key();
    let adaptor_public_key = keys::public_key_from_private_key(&adaptor_secret).unwrap();
    let refund = tx::refund_transaction(
        leaf.node_tx.compute_txid(),
        LEAF_VALUE - 1_000,
        &receiver.identity_public_key,
        1900,
    )
    .unwrap();
    let (nonces, commitment) = user_commit(&leaf.signing_secret).unwrap();

    let started: StartTransferResponse = federation
        .post(
            0,
            "/v1/transfers/swap",
            &StartLeafSwapRequest {
                transfer: StartTransferRequest {
                    transfer_id: Uuid::new_v4(),
                    sender_identity_public_key: sender.identity_public_key.clone().into(),
                    receiver_identity_public_key: receiver.identity_public_key.clone().into(),
                    expiry_time: Some(Utc::now() + chrono::Duration::minutes(10)),
                    leaves: vec![LeafRefund {
                        leaf_id: leaf.id,
                        raw_refund_tx: tx::serialize_tx(&refund).into(),
                        signing_commitment: commitment.into(),
                    }],
                    transfer_type: frost_operator::models::TransferType::Swap,
                },
                adaptor_public_key: adaptor_public_key.clone().into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(started.transfer.status, TransferStatus::SenderInitiated);
    let view = &started.signing_results[0];
    assert_eq!(
        view.adaptor_public_key.as_ref().map(|k| k.to_vec()),
        Some(adaptor_public_key.clone())
    );

    let adaptor_signature = finish_signature(view, &leaf.signing_secret, &nonces);
    let unsigned = tx::with_key_spend_signature(&refund, &adaptor_signature).unwrap();
    assert!(tx::verify_key_spend(&unsigned, &leaf.node_tx, None).is_err());

    let signature = frost_operator::adaptor::complete_adaptor_signature(
        &adaptor_signature,
        &adaptor_secret,
        &view.verifying_key,
        &view.message,
    )
    .unwrap();
    let signed = tx::with_key_spend_signature(&refund, &signature).unwrap();
    tx::verify_key_spend(&signed, &leaf.node_tx, None).unwrap();

    // the counterparty learns the secret from the published refund
    assert_eq!(
        frost_operator::adaptor::extract_adaptor_secret(
            &adaptor_signature,
            &signature,
            &adaptor_public_key
        )
        .unwrap(),
        adaptor_secret
    );
}
