//! Shared test helpers for `lbclient-core` unit tests.
//!
//! Builders for addresses, transactions and raw response payloads so tests
//! across modules share one source of dummy wire data.

use bitcoin::hashes::Hash;
use bitcoin::{
    absolute, transaction, Address, Amount, Network, OutPoint, PubkeyHash, ScriptBuf, ScriptHash,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

// ==============================================================================
// Identifiers
// ==============================================================================

/// Create a deterministic `Txid` from a single distinguishing byte.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

pub fn p2pkh_address(fill: u8, network: Network) -> Address {
    Address::p2pkh(PubkeyHash::from_byte_array([fill; 20]), network)
}

pub fn p2sh_address(fill: u8, network: Network) -> Address {
    Address::p2sh_from_hash(ScriptHash::from_byte_array([fill; 20]), network)
}

// ==============================================================================
// Transactions
// ==============================================================================

/// A one-input, one-output transaction paying `sats`.
pub fn sample_tx(sats: u64) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(txid_from_byte(0xee), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(sats),
            script_pubkey: p2pkh_address(3, Network::Bitcoin).script_pubkey(),
        }],
    }
}

// ==============================================================================
// Wire Payloads
// ==============================================================================

/// Prefix `body` with a zero (success) status.
pub fn ok_payload(body: &[u8]) -> Vec<u8> {
    let mut payload = 0u32.to_le_bytes().to_vec();
    payload.extend_from_slice(body);
    payload
}

/// One 49-byte `address.fetch_history2` row.
pub fn history_row_bytes(is_spend: bool, tx_byte: u8, index: u32, height: u32, value: u64) -> Vec<u8> {
    let mut row = Vec::with_capacity(49);
    row.push(u8::from(is_spend));
    row.extend_from_slice(&txid_from_byte(tx_byte).to_byte_array());
    row.extend_from_slice(&index.to_le_bytes());
    row.extend_from_slice(&height.to_le_bytes());
    row.extend_from_slice(&value.to_le_bytes());
    row
}

/// An `address.update` push body with block hash `[0xbb; 32]`.
pub fn address_update_payload(
    version: u8,
    hash160: [u8; 20],
    height: u32,
    tx: &Transaction,
) -> Vec<u8> {
    let mut payload = vec![version];
    payload.extend_from_slice(&hash160);
    payload.extend_from_slice(&height.to_le_bytes());
    payload.extend_from_slice(&[0xbb; 32]);
    payload.extend_from_slice(&bitcoin::consensus::serialize(tx));
    payload
}
