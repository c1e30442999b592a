//! Bitcoin transaction glue
//!
//! Leaves are P2TR key-path outputs: the internal key is the leaf verifying
//! key and the output key carries the BIP-86 tweak, matching what FROST
//! produces with `frost-secp256k1-tr`.

use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::secp256k1::{schnorr, Message, PublicKey, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::{
    absolute, transaction, Address, Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness, XOnlyPublicKey,
};
use thiserror::Error;

use crate::config::Network;

/// Transaction errors
#[derive(Debug, Error)]
pub enum TxError {
    #[error("failed to decode transaction: {0}")]
    Decode(String),
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("transaction has no output {0}")]
    MissingOutput(usize),
    #[error("transaction has no input {0}")]
    MissingInput(usize),
    #[error("output is not pay-to-taproot")]
    NotTaproot,
    #[error("sighash error: {0}")]
    Sighash(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

pub fn parse_tx(bytes: &[u8]) -> Result<Transaction, TxError> {
    encode::deserialize(bytes).map_err(|e| TxError::Decode(e.to_string()))
}

pub fn serialize_tx(tx: &Transaction) -> Vec<u8> {
    encode::serialize(tx)
}

/// X-only internal key of a compressed public key
pub fn internal_key(public_key: &[u8]) -> Result<XOnlyPublicKey, TxError> {
    let key = PublicKey::from_slice(public_key).map_err(|e| TxError::InvalidKey(e.to_string()))?;
    Ok(key.x_only_public_key().0)
}

/// Key-path-only P2TR script for `public_key`
pub fn p2tr_script(public_key: &[u8]) -> Result<ScriptBuf, TxError> {
    let secp = Secp256k1::verification_only();
    Ok(ScriptBuf::new_p2tr(&secp, internal_key(public_key)?, None))
}

pub fn p2tr_address(public_key: &[u8], network: Network) -> Result<String, TxError> {
    let secp = Secp256k1::verification_only();
    let address = Address::p2tr(
        &secp,
        internal_key(public_key)?,
        None,
        network.bitcoin_network(),
    );
    Ok(address.to_string())
}

/// Tweaked output key signatures verify under
pub fn taproot_output_key(public_key: &[u8]) -> Result<XOnlyPublicKey, TxError> {
    let secp = Secp256k1::verification_only();
    let (tweaked, _parity) = internal_key(public_key)?.tap_tweak(&secp, None);
    Ok(tweaked.to_inner())
}

/// Output key committed to by a P2TR script
pub fn script_output_key(script: &Script) -> Result<XOnlyPublicKey, TxError> {
    if !script.is_p2tr() {
        return Err(TxError::NotTaproot);
    }
    XOnlyPublicKey::from_slice(&script.as_bytes()[2..34])
        .map_err(|e| TxError::InvalidKey(e.to_string()))
}

/// Relative timelock of input 0
pub fn timelock(tx: &Transaction) -> Result<u32, TxError> {
    let input = tx.input.first().ok_or(TxError::MissingInput(0))?;
    Ok(input.sequence.0 & 0xFFFF)
}

pub fn output(tx: &Transaction, vout: usize) -> Result<&TxOut, TxError> {
    tx.output.get(vout).ok_or(TxError::MissingOutput(vout))
}

/// Previous outputs spent by a refund: the leaf output, plus the connector
/// output for cooperative exits
pub fn refund_prevouts(
    refund: &Transaction,
    node_tx: &Transaction,
    connector_tx: Option<&Transaction>,
) -> Result<Vec<TxOut>, TxError> {
    let mut prevouts = vec![output(node_tx, 0)?.clone()];
    if let Some(connector) = connector_tx {
        let input = refund.input.get(1).ok_or(TxError::MissingInput(1))?;
        if input.previous_output.txid != connector.compute_txid() {
            return Err(TxError::Decode(
                "refund input 1 does not spend the connector transaction".to_string(),
            ));
        }
        prevouts.push(output(connector, input.previous_output.vout as usize)?.clone());
    }
    Ok(prevouts)
}

/// BIP-341 key-spend sighash of input 0
pub fn key_spend_sighash(tx: &Transaction, prevouts: &[TxOut]) -> Result<[u8; 32], TxError> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(0, &Prevouts::All(prevouts), TapSighashType::Default)
        .map_err(|e| TxError::Sighash(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

pub fn verify_schnorr(
    output_key: &XOnlyPublicKey,
    sighash: &[u8],
    signature: &[u8],
) -> Result<(), TxError> {
    let secp = Secp256k1::verification_only();
    let signature = schnorr::Signature::from_slice(signature)
        .map_err(|e| TxError::InvalidSignature(e.to_string()))?;
    let message =
        Message::from_digest_slice(sighash).map_err(|e| TxError::Sighash(e.to_string()))?;
    secp.verify_schnorr(&signature, &message, output_key)
        .map_err(|e| TxError::InvalidSignature(e.to_string()))
}

/// Copy of `tx` with a key-path signature as the witness of input 0
pub fn with_key_spend_signature(tx: &Transaction, signature: &[u8]) -> Result<Transaction, TxError> {
    let mut signed = tx.clone();
    let input = signed.input.first_mut().ok_or(TxError::MissingInput(0))?;
    input.witness = Witness::from_slice(&[signature]);
    Ok(signed)
}

/// Key-path signature of input 0, if the transaction is signed
pub fn key_spend_signature(tx: &Transaction) -> Option<&[u8]> {
    tx.input.first().and_then(|input| input.witness.nth(0))
}

/// Check that input 0 of `tx` is validly signed for output 0 of `node_tx`
pub fn verify_key_spend(
    tx: &Transaction,
    node_tx: &Transaction,
    connector_tx: Option<&Transaction>,
) -> Result<(), TxError> {
    let signature = key_spend_signature(tx)
        .ok_or_else(|| TxError::InvalidSignature("missing witness".to_string()))?;
    let prevouts = refund_prevouts(tx, node_tx, connector_tx)?;
    let sighash = key_spend_sighash(tx, &prevouts)?;
    let output_key = script_output_key(&output(node_tx, 0)?.script_pubkey)?;
    verify_schnorr(&output_key, &sighash, signature)
}

/// Transaction spending `funding` into a single P2TR output
pub fn node_transaction(funding: OutPoint, value: u64, public_key: &[u8]) -> Result<Transaction, TxError> {
    Ok(Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: funding,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: p2tr_script(public_key)?,
        }],
    })
}

/// Refund spending output 0 of `node_txid` to `receiver` after `timelock` blocks
pub fn refund_transaction(
    node_txid: Txid,
    value: u64,
    receiver: &[u8],
    timelock: u16,
) -> Result<Transaction, TxError> {
    Ok(Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(node_txid, 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::from_height(timelock),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: p2tr_script(receiver)?,
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use bitcoin::secp256k1::{Keypair, SecretKey};

    #[test]
    fn test_timelock_and_prevouts() {
        let key = keys::public_key_from_private_key(&[4u8; 32]).unwrap();
        let node = node_transaction(OutPoint::null(), 10_000, &key).unwrap();
        let refund = refund_transaction(node.compute_txid(), 9_000, &key, 2000).unwrap();

        assert_eq!(timelock(&refund).unwrap(), 2000);
        let prevouts = refund_prevouts(&refund, &node, None).unwrap();
        assert_eq!(prevouts, vec![node.output[0].clone()]);

        let decoded = parse_tx(&serialize_tx(&refund)).unwrap();
        assert_eq!(decoded.compute_txid(), refund.compute_txid());
        assert!(parse_tx(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn test_key_spend_signature_verifies() {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[6u8; 32]).unwrap();
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let public = keypair.public_key().serialize().to_vec();

        let node = node_transaction(OutPoint::null(), 10_000, &public).unwrap();
        let refund = refund_transaction(node.compute_txid(), 9_000, &public, 100).unwrap();
        let prevouts = refund_prevouts(&refund, &node, None).unwrap();
        let sighash = key_spend_sighash(&refund, &prevouts).unwrap();

        let tweaked = keypair.tap_tweak(&secp, None).to_inner();
        let message = Message::from_digest(sighash);
        let signature = secp.sign_schnorr(&message, &tweaked);

        let signed = with_key_spend_signature(&refund, &signature.serialize()).unwrap();
        verify_key_spend(&signed, &node, None).unwrap();
        assert_eq!(
            script_output_key(&node.output[0].script_pubkey).unwrap(),
            taproot_output_key(&public).unwrap()
        );

        // signature over a different refund does not carry over
        let other = refund_transaction(node.compute_txid(), 8_000, &public, 100).unwrap();
        let forged = with_key_spend_signature(&other, &signature.serialize()).unwrap();
        assert!(verify_key_spend(&forged, &node, None).is_err());
    }

    #[test]
    fn test_address_is_p2tr() {
        let key = keys::public_key_from_private_key(&[8u8; 32]).unwrap();
        let address = p2tr_address(&key, Network::Regtest).unwrap();
        assert!(address.starts_with("bcrt1p"));
    }
}
