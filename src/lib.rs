//! Signing operator for a FROST-secured statechain federation
//!
//! Every operator holds one share of the threshold key behind each leaf. A
//! leaf changes hands by tweaking those shares on every operator, so the old
//! owner's key stops being able to complete a signature while the new owner's
//! key starts to.
//!
//! # Architecture
//!
//! - n operators, t-of-n FROST signing (secp256k1, taproot)
//! - Keyshare pools filled by batched DKG, cross-signed with identity keys
//! - The operator a user contacts coordinates the others over HTTP
//!
//! # Usage
//!
//! ## Create an identity key
//! ```bash
//! frost-operator generate-identity --output config/identity.key.enc
//! ```
//!
//! ## Start an operator
//! ```bash
//! frost-operator run --config config/operator0.toml
//! ```

pub mod adaptor;
pub mod config;
pub mod dkg;
pub mod error;
pub mod frost_signer;
pub mod keys;
pub mod keyshare;
pub mod keystore;
pub mod logging;
pub mod models;
pub mod node;
pub mod operator;
pub mod secret_sharing;
pub mod server;
pub mod signing;
pub mod store;
pub mod transfer;
pub mod transport;
pub mod tree;
pub mod tx;
pub mod types;

pub use config::{FederationConfig, Network, SigningOperator};
pub use error::{ErrorCategory, OperatorError};
pub use frost_signer::{user_commit, FrostSigner, SigningError, SigningResult};
pub use keystore::{IdentityKeystore, KeystoreError};
pub use node::OperatorNode;
pub use operator::{execute_task_with_all_operators, FanoutError, OperatorSelection};
pub use server::create_router;
pub use store::{MemoryStore, Store, StoreTx};
pub use transport::{HttpTransport, OperatorTransport, TransportError};
