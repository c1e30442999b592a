//! Operator node state
//!
//! [`OperatorNode`] is built once at startup and handed to every handler. It
//! owns the store, the peer transport, the FROST signer with its nonces, the
//! DKG states and the keyshare pool, and runs the background workers that keep
//! the pool filled and drop stale round state.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::FederationConfig;
use crate::dkg::{self, DkgStates};
use crate::error::OperatorError;
use crate::frost_signer::FrostSigner;
use crate::keys;
use crate::keyshare::KeysharePool;
use crate::logging::{log_detached_failure, EventCategory};
use crate::store::Store;
use crate::transport::OperatorTransport;

/// How long a signing nonce may wait for round 2
const NONCE_MAX_AGE: Duration = Duration::from_secs(600);

pub struct OperatorNode {
    pub config: Arc<FederationConfig>,
    identity_key: Vec<u8>,
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn OperatorTransport>,
    pub signer: FrostSigner,
    pub dkg: DkgStates,
    pub keyshares: KeysharePool,
}

impl OperatorNode {
    /// Build the node and start its replenishment worker
    ///
    /// The identity key must belong to this operator's configured entry.
    pub fn new(
        config: Arc<FederationConfig>,
        identity_key: Vec<u8>,
        store: Arc<dyn Store>,
        transport: Arc<dyn OperatorTransport>,
    ) -> Result<Arc<Self>, OperatorError> {
        let this_operator = config.this_operator()?;
        let expected = this_operator.identity_public_key_bytes()?;
        if keys::public_key_from_private_key(&identity_key)? != expected {
            return Err(crate::config::ConfigError::IdentityMismatch(config.index).into());
        }

        let (replenish_tx, replenish_rx) = mpsc::channel(1);
        let node = Arc::new(Self {
            identity_key,
            store,
            transport,
            signer: FrostSigner::new(config.identifier()),
            dkg: DkgStates::new(),
            keyshares: KeysharePool::new(config.index, config.dkg.clone(), replenish_tx),
            config,
        });
        tokio::spawn(replenish_worker(Arc::downgrade(&node), replenish_rx));

        tracing::info!(
            index = node.config.index,
            identifier = %node.identifier(),
            operators = node.config.operator_count(),
            threshold = node.config.threshold,
            "Operator node ready"
        );
        Ok(node)
    }

    /// Identifier of this operator
    pub fn identifier(&self) -> String {
        self.config.identifier()
    }

    pub fn identity_key(&self) -> &[u8] {
        &self.identity_key
    }

    /// Periodically drop unfinished DKG requests and unused signing nonces
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let node = Arc::downgrade(self);
        let dkg_timeout = Duration::from_secs(self.config.dkg.round_timeout_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(node) = node.upgrade() else {
                    break;
                };
                let states = node.dkg.cleanup(dkg_timeout).await;
                let nonces = node.signer.cleanup_nonces(NONCE_MAX_AGE).await;
                if states > 0 || nonces > 0 {
                    tracing::info!(dkg_states = states, nonces, "Dropped stale round state");
                }
            }
        })
    }
}

/// Run DKG for this operator's pool on every replenishment request
///
/// Requests arrive through a channel of capacity one, so triggers posted while
/// a run is in progress collapse into a single follow-up check.
async fn replenish_worker(node: Weak<OperatorNode>, mut requests: mpsc::Receiver<()>) {
    while requests.recv().await.is_some() {
        let Some(node) = node.upgrade() else {
            break;
        };
        if let Err(err) = replenish(&node).await {
            log_detached_failure(
                EventCategory::Keyshare,
                "replenish_keyshares",
                &node.identifier(),
                &err.to_string(),
            );
        }
    }
    tracing::debug!("Keyshare replenishment worker stopped");
}

async fn replenish(node: &OperatorNode) -> Result<(), OperatorError> {
    let remaining = {
        let tx = node.store.begin().await?;
        node.keyshares.available(tx.as_ref())?
    };
    let settings = node.keyshares.settings();
    if !settings.needs_replenish(remaining) {
        return Ok(());
    }

    tracing::info!(remaining, key_count = settings.key_count, "Replenishing keyshare pool");
    let run = dkg::generate_keys(node, settings.key_count).await?;
    run.wait().await;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::operator::tests::test_config;
    use crate::store::MemoryStore;
    use crate::transport::HttpTransport;

    /// A node whose peers are never contacted
    pub(crate) fn test_node(index: u32, n: u32) -> Arc<OperatorNode> {
        let config = Arc::new(test_config(index, n));
        let transport = Arc::new(HttpTransport::new(Duration::from_millis(200)).unwrap());
        OperatorNode::new(
            config,
            vec![(index + 1) as u8; 32],
            Arc::new(MemoryStore::new()),
            transport,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_checks_identity_key() {
        let config = Arc::new(test_config(0, 3));
        let transport = Arc::new(HttpTransport::new(Duration::from_millis(200)).unwrap());
        let result = OperatorNode::new(
            config,
            vec![9u8; 32],
            Arc::new(MemoryStore::new()),
            transport,
        );
        assert!(matches!(
            result,
            Err(OperatorError::Config(crate::config::ConfigError::IdentityMismatch(0)))
        ));
    }

    #[tokio::test]
    async fn test_node_identity() {
        let node = test_node(1, 3);
        assert_eq!(node.identifier(), crate::config::operator_identifier(1));
        assert_eq!(node.signer.identifier(), node.identifier());
        assert_eq!(node.identity_key(), &[2u8; 32][..]);
    }
}
