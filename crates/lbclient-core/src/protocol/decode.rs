//! Per-command response decoders.
//!
//! Decoders are plain functions registered by command name in a
//! [`DecoderRegistry`]; supporting a new command means registering one more
//! function. Every response payload except `address.update` pushes starts with
//! a 4-byte status which is checked before the body is looked at, so a failed
//! request surfaces as [`ClientError::Server`] even when the body is empty.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, BlockHash, Network, Transaction, Txid};

use crate::error::{ClientError, DecodeError};
use crate::error_code::parse_status;
use crate::types::{AddressUpdate, BlockHeight, HistoryRow};

use super::{
    address_from_hash160, ByteReader, ADDRESS_UPDATE, BROADCAST_TRANSACTION, FETCH_HISTORY2,
    FETCH_LAST_HEIGHT, FETCH_TRANSACTION, FETCH_UNCONFIRMED_TRANSACTION, VALIDATE_TRANSACTION,
};

/// Size of one `address.fetch_history2` row.
const HISTORY_ROW_LEN: usize = 49;

/// A decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    History(Vec<HistoryRow>),
    Height(BlockHeight),
    Transaction(Transaction),
    Broadcast,
    Validation(bool),
    Update(AddressUpdate),
}

/// Decodes the payload of one command. The network is needed to rebuild
/// addresses carried by pushes.
pub type Decoder = fn(&[u8], Network) -> Result<Response, ClientError>;

/// Decoder table keyed by command name.
#[derive(Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl DecoderRegistry {
    /// A registry with no decoders at all.
    pub fn empty() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register `decoder` for `command`, returning the decoder it replaced.
    pub fn register(&mut self, command: &'static str, decoder: Decoder) -> Option<Decoder> {
        self.decoders.insert(command, decoder)
    }

    pub fn contains(&self, command: &str) -> bool {
        self.decoders.contains_key(command)
    }

    pub fn decode(
        &self,
        command: &str,
        payload: &[u8],
        network: Network,
    ) -> Result<Response, ClientError> {
        let decoder = self
            .decoders
            .get(command)
            .ok_or_else(|| DecodeError::UnknownCommand(command.to_owned()))?;
        decoder(payload, network)
    }
}

/// The standard libbitcoin command set.
impl Default for DecoderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(FETCH_HISTORY2, decode_history);
        registry.register(FETCH_LAST_HEIGHT, decode_last_height);
        registry.register(FETCH_TRANSACTION, decode_transaction);
        registry.register(FETCH_UNCONFIRMED_TRANSACTION, decode_unconfirmed_transaction);
        registry.register(BROADCAST_TRANSACTION, decode_broadcast);
        registry.register(VALIDATE_TRANSACTION, decode_validation);
        registry.register(ADDRESS_UPDATE, decode_address_update);
        registry
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.decoders.keys()).finish()
    }
}

// ==============================================================================
// Decoders
// ==============================================================================

/// Read and check the leading status code.
fn read_status(reader: &mut ByteReader<'_>) -> Result<(), ClientError> {
    parse_status(reader.array::<4>()?)?;
    Ok(())
}

fn decode_history(payload: &[u8], _network: Network) -> Result<Response, ClientError> {
    let mut reader = ByteReader::new(FETCH_HISTORY2, payload);
    read_status(&mut reader)?;

    let trailing = reader.remaining() % HISTORY_ROW_LEN;
    if trailing != 0 {
        return Err(DecodeError::TrailingBytes {
            command: FETCH_HISTORY2,
            trailing,
        }
        .into());
    }

    let mut rows = Vec::with_capacity(reader.remaining() / HISTORY_ROW_LEN);
    while reader.remaining() > 0 {
        rows.push(HistoryRow {
            is_spend: reader.u8()? != 0,
            tx_hash: Txid::from_byte_array(reader.array::<32>()?),
            index: reader.u32_le()?,
            height: BlockHeight(reader.u32_le()?),
            value: Amount::from_sat(reader.u64_le()?),
        });
    }
    Ok(Response::History(rows))
}

fn decode_last_height(payload: &[u8], _network: Network) -> Result<Response, ClientError> {
    let mut reader = ByteReader::new(FETCH_LAST_HEIGHT, payload);
    read_status(&mut reader)?;
    let height = reader.u32_le()?;
    reader.finish()?;
    Ok(Response::Height(BlockHeight(height)))
}

fn decode_transaction(payload: &[u8], _network: Network) -> Result<Response, ClientError> {
    decode_raw_transaction(FETCH_TRANSACTION, payload)
}

fn decode_unconfirmed_transaction(
    payload: &[u8],
    _network: Network,
) -> Result<Response, ClientError> {
    decode_raw_transaction(FETCH_UNCONFIRMED_TRANSACTION, payload)
}

fn decode_raw_transaction(command: &'static str, payload: &[u8]) -> Result<Response, ClientError> {
    let mut reader = ByteReader::new(command, payload);
    read_status(&mut reader)?;
    let tx: Transaction = bitcoin::consensus::deserialize(reader.rest()).map_err(DecodeError::from)?;
    Ok(Response::Transaction(tx))
}

fn decode_broadcast(payload: &[u8], _network: Network) -> Result<Response, ClientError> {
    let mut reader = ByteReader::new(BROADCAST_TRANSACTION, payload);
    read_status(&mut reader)?;
    Ok(Response::Broadcast)
}

fn decode_validation(payload: &[u8], _network: Network) -> Result<Response, ClientError> {
    let mut reader = ByteReader::new(VALIDATE_TRANSACTION, payload);
    read_status(&mut reader)?;
    Ok(Response::Validation(reader.u8()? != 0))
}

/// `address.update` pushes carry no status:
/// `version(1) hash160(20) height(4 LE) block_hash(32) raw_tx(..)`.
fn decode_address_update(payload: &[u8], network: Network) -> Result<Response, ClientError> {
    let mut reader = ByteReader::new(ADDRESS_UPDATE, payload);
    let version = reader.u8()?;
    let hash160 = reader.array::<20>()?;
    let height = reader.u32_le()?;
    let block_hash = BlockHash::from_byte_array(reader.array::<32>()?);
    let tx: Transaction = bitcoin::consensus::deserialize(reader.rest()).map_err(DecodeError::from)?;

    Ok(Response::Update(AddressUpdate {
        address: address_from_hash160(version, hash160, network)?,
        height: BlockHeight(height),
        block_hash,
        tx,
    }))
}
