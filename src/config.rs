//! Federation configuration
//!
//! Each operator loads a TOML file describing itself and its peers. A few values
//! can be overridden from the environment so the same file can be shared:
//!
//! - `FROST_OPERATOR_INDEX` - this operator's index in the federation
//! - `FROST_OPERATOR_BIND_ADDRESS` - address the HTTP server listens on
//! - `FROST_OPERATOR_IDENTITY_KEY_PATH` - path to the encrypted identity key
//! - `FROST_OPERATOR_LOG_LEVEL` - logging level (trace, debug, info, warn, error)
//!
//! ```toml
//! index = 0
//! threshold = 2
//! network = "regtest"
//!
//! [dkg]
//! key_threshold = 100000
//! key_count = 1000
//!
//! [[operators]]
//! index = 0
//! address = "http://127.0.0.1:9001"
//! identity_public_key = "02..."
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("operator index {0} is not configured")]
    UnknownOperator(u32),

    #[error("duplicate operator index {0}")]
    DuplicateOperator(u32),

    #[error("threshold {threshold} is invalid for {operators} operators")]
    InvalidThreshold { threshold: u16, operators: usize },

    #[error("identity key does not match the configured public key of operator {0}")]
    IdentityMismatch(u32),
}

/// Bitcoin network the federation operates on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    #[default]
    Regtest,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(ConfigError::InvalidValue(
                "network".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

/// A member of the federation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningOperator {
    /// Zero-based index
    pub index: u32,
    /// Hex-encoded 32-byte identifier, derived from the index when omitted
    #[serde(default)]
    pub identifier: String,
    /// Base URL of the operator's HTTP endpoint
    pub address: String,
    /// Compressed secp256k1 identity public key (hex)
    pub identity_public_key: String,
}

impl SigningOperator {
    /// Decode the identity public key
    pub fn identity_public_key_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        hex::decode(&self.identity_public_key).map_err(|e| {
            ConfigError::InvalidValue(
                format!("operators[{}].identity_public_key", self.index),
                e.to_string(),
            )
        })
    }

    /// Share index used for verifiable secret sharing (one-based)
    pub fn share_index(&self) -> u64 {
        u64::from(self.index) + 1
    }
}

/// Keyshare pool and DKG settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DkgSettings {
    /// Replenish once fewer than this many keyshares remain available
    pub key_threshold: usize,
    /// Keys generated per DKG run
    pub key_count: usize,
    /// Optional lower bound overriding `key_threshold` (0 disables)
    pub limit_override: usize,
    /// How long an unfinished DKG request is kept before cleanup
    pub round_timeout_secs: u64,
}

impl Default for DkgSettings {
    fn default() -> Self {
        Self {
            key_threshold: 100_000,
            key_count: 1_000,
            limit_override: 0,
            round_timeout_secs: 300,
        }
    }
}

impl DkgSettings {
    /// Whether a pool with `remaining` available keys should be replenished
    pub fn needs_replenish(&self, remaining: usize) -> bool {
        remaining < self.key_threshold
            && (self.limit_override == 0 || remaining < self.limit_override)
    }
}

/// Static federation configuration shared by every component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Index of this operator
    pub index: u32,
    /// Address the HTTP server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Signing threshold (t of n)
    pub threshold: u16,
    #[serde(default)]
    pub network: Network,
    /// Path to the encrypted identity key
    #[serde(default = "default_identity_key_path")]
    pub identity_key_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit JSON logs
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub dkg: DkgSettings,
    /// Browser origins allowed to call the user-facing API
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    pub operators: Vec<SigningOperator>,
}

fn default_bind_address() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_identity_key_path() -> String {
    "config/identity.key.enc".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Identifier of the operator at `index`: the 32-byte big-endian encoding of `index + 1`
pub fn operator_identifier(index: u32) -> String {
    format!("{:064x}", u64::from(index) + 1)
}

impl FederationConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: FederationConfig = toml::from_str(&contents)?;
        config.apply_env_overrides()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string without consulting the environment
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: FederationConfig = toml::from_str(contents)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Apply `FROST_OPERATOR_*` overrides
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(index) = env::var("FROST_OPERATOR_INDEX") {
            self.index = index.parse().map_err(|_| {
                ConfigError::InvalidValue("FROST_OPERATOR_INDEX".to_string(), index.clone())
            })?;
        }
        if let Ok(bind) = env::var("FROST_OPERATOR_BIND_ADDRESS") {
            self.bind_address = bind;
        }
        if let Ok(path) = env::var("FROST_OPERATOR_IDENTITY_KEY_PATH") {
            self.identity_key_path = path;
        }
        if let Ok(level) = env::var("FROST_OPERATOR_LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    fn normalize(&mut self) {
        for operator in &mut self.operators {
            if operator.identifier.is_empty() {
                operator.identifier = operator_identifier(operator.index);
            }
            operator.address = operator.address.trim_end_matches('/').to_string();
        }
        self.operators.sort_by_key(|o| o.index);
    }

    /// Check the federation description is internally consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threshold == 0 || usize::from(self.threshold) > self.operators.len() {
            return Err(ConfigError::InvalidThreshold {
                threshold: self.threshold,
                operators: self.operators.len(),
            });
        }

        let mut seen = HashSet::new();
        for operator in &self.operators {
            if !seen.insert(operator.index) {
                return Err(ConfigError::DuplicateOperator(operator.index));
            }
            if operator.identifier != operator_identifier(operator.index) {
                return Err(ConfigError::InvalidValue(
                    format!("operators[{}].identifier", operator.index),
                    operator.identifier.clone(),
                ));
            }
            let key = operator.identity_public_key_bytes()?;
            crate::keys::parse_public_key(&key).map_err(|e| {
                ConfigError::InvalidValue(
                    format!("operators[{}].identity_public_key", operator.index),
                    e.to_string(),
                )
            })?;
        }

        if !seen.contains(&self.index) {
            return Err(ConfigError::UnknownOperator(self.index));
        }

        Ok(())
    }

    /// Identifier of this operator
    pub fn identifier(&self) -> String {
        operator_identifier(self.index)
    }

    /// Number of operators in the federation
    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    pub fn operator_by_identifier(&self, identifier: &str) -> Option<&SigningOperator> {
        self.operators.iter().find(|o| o.identifier == identifier)
    }

    /// This operator's own entry
    pub fn this_operator(&self) -> Result<&SigningOperator, ConfigError> {
        self.operators
            .iter()
            .find(|o| o.index == self.index)
            .ok_or(ConfigError::UnknownOperator(self.index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml(threshold: u16) -> String {
        let keys: Vec<String> = (1u8..=3)
            .map(|i| {
                let secret = [i; 32];
                hex::encode(crate::keys::public_key_from_private_key(&secret).unwrap())
            })
            .collect();
        format!(
            r#"
index = 1
threshold = {threshold}

[dkg]
key_threshold = 10
key_count = 5

[[operators]]
index = 0
address = "http://127.0.0.1:9001/"
identity_public_key = "{}"

[[operators]]
index = 1
address = "http://127.0.0.1:9002"
identity_public_key = "{}"

[[operators]]
index = 2
address = "http://127.0.0.1:9003"
identity_public_key = "{}"
"#,
            keys[0], keys[1], keys[2]
        )
    }

    #[test]
    fn test_parse_config() {
        let config = FederationConfig::from_toml_str(&sample_toml(2)).unwrap();
        assert_eq!(config.operator_count(), 3);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.dkg.key_count, 5);
        assert_eq!(config.dkg.limit_override, 0);
        assert_eq!(config.operators[0].address, "http://127.0.0.1:9001");
        assert_eq!(config.identifier(), operator_identifier(1));
        assert_eq!(config.this_operator().unwrap().share_index(), 2);
    }

    #[test]
    fn test_invalid_threshold() {
        let result = FederationConfig::from_toml_str(&sample_toml(4));
        assert!(matches!(result, Err(ConfigError::InvalidThreshold { .. })));
        let result = FederationConfig::from_toml_str(&sample_toml(0));
        assert!(matches!(result, Err(ConfigError::InvalidThreshold { .. })));
    }

    #[test]
    fn test_operator_identifier_encoding() {
        assert_eq!(operator_identifier(0).len(), 64);
        assert!(operator_identifier(0).ends_with("01"));
        assert!(operator_identifier(254).ends_with("ff"));
    }

    #[test]
    fn test_needs_replenish() {
        let settings = DkgSettings {
            key_threshold: 10,
            key_count: 5,
            limit_override: 0,
            round_timeout_secs: 30,
        };
        assert!(settings.needs_replenish(9));
        assert!(!settings.needs_replenish(10));

        let settings = DkgSettings {
            limit_override: 4,
            ..settings
        };
        assert!(!settings.needs_replenish(9));
        assert!(settings.needs_replenish(3));
    }

    #[test]
    fn test_network_parsing() {
        assert_eq!(Network::from_str("mainnet").unwrap(), Network::Mainnet);
        assert_eq!(Network::from_str("REGTEST").unwrap(), Network::Regtest);
        assert!(Network::from_str("litecoin").is_err());
    }
}
