//! Request authentication and record attestation
//!
//! Terminals tag each request with HMAC-SHA256 under the source account's
//! authentication key. The server attests committed records with the HSM
//! `transaction_signing` key so downstream settlement can check origin.

use crate::error::{Result, TransactionError};
use crate::types::TransactionRequest;
use hmac::{Hmac, Mac};
use hsm::KeyManager;
use ledger_core::TransactionRecord;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HSM key that attests transaction records
pub const RECORD_SIGNING_KEY: &str = "transaction_signing";

const RECORD_LAYOUT_VERSION: u8 = 1;

/// Hex tag over the request's canonical bytes
pub fn sign_request(auth_key: &[u8], request: &TransactionRequest) -> Result<String> {
    let mut mac = new_mac(auth_key)?;
    mac.update(&request.canonical_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of the request's tag
pub fn verify_request(auth_key: &[u8], request: &TransactionRequest) -> Result<bool> {
    let Ok(tag) = hex::decode(&request.signature) else {
        return Ok(false);
    };
    let mut mac = new_mac(auth_key)?;
    mac.update(&request.canonical_bytes());
    Ok(mac.verify_slice(&tag).is_ok())
}

fn new_mac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| TransactionError::Validation(format!("bad authentication key: {}", e)))
}

/// Server signature over a record's immutable fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// Key that produced the signature (follows rotation)
    pub key_id: String,
    /// Hex Ed25519 signature
    pub signature: String,
}

/// Bytes covered by an attestation; status and timestamps are excluded
pub fn record_bytes(record: &TransactionRecord) -> Vec<u8> {
    let mut data = Vec::with_capacity(64 + record.id.len());
    data.push(RECORD_LAYOUT_VERSION);
    for field in [
        record.id.as_str(),
        record.source_account.as_str(),
        record.destination_account.as_str(),
        record.currency.as_str(),
        record.transaction_type.as_str(),
        record.destination_bank.as_deref().unwrap_or(""),
    ] {
        // length-prefixed so adjacent fields cannot be re-split
        data.extend_from_slice(&(field.len() as u32).to_be_bytes());
        data.extend_from_slice(field.as_bytes());
    }
    data.extend_from_slice(&record.amount.to_be_bytes());
    data.extend_from_slice(&record.fee.to_be_bytes());
    data.extend_from_slice(&record.total.to_be_bytes());
    data.extend_from_slice(&record.counter.unwrap_or(0).to_be_bytes());
    data
}

/// Sign a record with the current successor of `transaction_signing`
pub fn sign_record(keys: &dyn KeyManager, record: &TransactionRecord) -> Result<Attestation> {
    let key_id = keys.active_key_id(RECORD_SIGNING_KEY)?;
    let signature = keys.sign(&key_id, &record_bytes(record))?;
    Ok(Attestation {
        key_id,
        signature: hex::encode(signature),
    })
}

/// Check an attestation; works after the signing key has been rotated out
pub fn verify_record(keys: &dyn KeyManager, record: &TransactionRecord, attestation: &Attestation) -> Result<bool> {
    let Ok(signature) = hex::decode(&attestation.signature) else {
        return Ok(false);
    };
    Ok(keys.verify(&attestation.key_id, &record_bytes(record), &signature)?)
}
