//! libbitcoin query protocol: command names, request framing, inbound
//! message assembly and the address payload encodings.
//!
//! Every message on the query channel is three frames:
//! `[command (ASCII), request id (u32 LE), payload]`.

pub mod decode;
mod reader;

use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, PubkeyHash, ScriptHash};

use crate::error::DecodeError;
use crate::transport::Frame;

pub(crate) use reader::ByteReader;

pub const FETCH_HISTORY2: &str = "address.fetch_history2";
pub const FETCH_LAST_HEIGHT: &str = "blockchain.fetch_last_height";
pub const FETCH_TRANSACTION: &str = "blockchain.fetch_transaction";
pub const FETCH_UNCONFIRMED_TRANSACTION: &str = "transaction_pool.fetch_transaction";
pub const BROADCAST_TRANSACTION: &str = "protocol.broadcast_transaction";
pub const VALIDATE_TRANSACTION: &str = "transaction_pool.validate";
pub const SUBSCRIBE_ADDRESS: &str = "address.subscribe";
pub const RENEW_ADDRESS: &str = "address.renew";
/// Server push carrying activity for a subscribed address.
pub const ADDRESS_UPDATE: &str = "address.update";

/// Length in bits of the hash160 prefix sent with subscribe/renew.
const SUBSCRIBE_PREFIX_BITS: u8 = 160;

// ==============================================================================
// Framing
// ==============================================================================

pub(crate) fn encode_request(command: &str, id: u32, payload: &[u8]) -> Vec<Vec<u8>> {
    vec![
        command.as_bytes().to_vec(),
        id.to_le_bytes().to_vec(),
        payload.to_vec(),
    ]
}

/// A complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub command: String,
    pub id: u32,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    fn from_parts(mut parts: Vec<Vec<u8>>, frame_count: usize) -> Result<Self, DecodeError> {
        if frame_count != 3 {
            return Err(DecodeError::MalformedMessage(format!(
                "expected 3 frames, got {frame_count}"
            )));
        }
        let payload = parts.pop().unwrap_or_default();
        let id = parts.pop().unwrap_or_default();
        let command = parts.pop().unwrap_or_default();

        let id: [u8; 4] = id.try_into().map_err(|id: Vec<u8>| {
            DecodeError::MalformedMessage(format!("request id is {} bytes, expected 4", id.len()))
        })?;
        let command = String::from_utf8(command)
            .map_err(|_| DecodeError::MalformedMessage("command is not valid UTF-8".to_owned()))?;

        Ok(Self {
            command,
            id: u32::from_le_bytes(id),
            payload,
        })
    }
}

/// Reassembles `{data, more}` frames into [`InboundMessage`]s.
///
/// At most three frames are buffered per message; extra frames are counted
/// and discarded so a misbehaving peer cannot grow the buffer.
#[derive(Debug, Default)]
pub(crate) struct FrameAssembler {
    parts: Vec<Vec<u8>>,
    frame_count: usize,
}

impl FrameAssembler {
    /// Feed one frame. Returns the assembled message once the final frame of
    /// a multipart message arrives.
    pub fn push(&mut self, frame: Frame) -> Option<Result<InboundMessage, DecodeError>> {
        self.frame_count += 1;
        if self.parts.len() < 3 {
            self.parts.push(frame.data);
        }
        if frame.more {
            return None;
        }
        let parts = std::mem::take(&mut self.parts);
        let frame_count = std::mem::take(&mut self.frame_count);
        Some(InboundMessage::from_parts(parts, frame_count))
    }
}

// ==============================================================================
// Address Payloads
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressKind {
    PubkeyHash,
    ScriptHash,
}

/// Split a P2PKH or P2SH address into its kind and 20-byte hash160.
pub(crate) fn address_hash160(address: &Address) -> Result<(AddressKind, [u8; 20]), DecodeError> {
    let script = address.script_pubkey();
    let bytes = script.as_bytes();
    let (kind, hash) = if script.is_p2pkh() {
        // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        (AddressKind::PubkeyHash, &bytes[3..23])
    } else if script.is_p2sh() {
        // OP_HASH160 <20> OP_EQUAL
        (AddressKind::ScriptHash, &bytes[2..22])
    } else {
        return Err(DecodeError::UnsupportedAddress(address.to_string()));
    };

    let mut hash160 = [0u8; 20];
    hash160.copy_from_slice(hash);
    Ok((kind, hash160))
}

/// Legacy base58 version byte for an address kind on `network`.
pub(crate) fn version_byte(kind: AddressKind, network: Network) -> u8 {
    let mainnet = network == Network::Bitcoin;
    match (kind, mainnet) {
        (AddressKind::PubkeyHash, true) => 0,
        (AddressKind::PubkeyHash, false) => 111,
        (AddressKind::ScriptHash, true) => 5,
        (AddressKind::ScriptHash, false) => 196,
    }
}

/// Rebuild an address from the version byte and hash carried by a push.
pub(crate) fn address_from_hash160(
    version: u8,
    hash160: [u8; 20],
    network: Network,
) -> Result<Address, DecodeError> {
    match version {
        0 | 111 => Ok(Address::p2pkh(
            PubkeyHash::from_byte_array(hash160),
            network,
        )),
        5 | 196 => Ok(Address::p2sh_from_hash(
            ScriptHash::from_byte_array(hash160),
            network,
        )),
        other => Err(DecodeError::AddressVersion(other)),
    }
}

/// Payload shared by `address.subscribe` and `address.renew`.
pub(crate) fn subscription_payload(address: &Address) -> Result<Vec<u8>, DecodeError> {
    let (_, hash160) = address_hash160(address)?;
    let mut payload = Vec::with_capacity(22);
    payload.push(0);
    payload.push(SUBSCRIBE_PREFIX_BITS);
    payload.extend_from_slice(&hash160);
    Ok(payload)
}

pub(crate) fn fetch_history2_payload(
    address: &Address,
    network: Network,
    from_height: u32,
) -> Result<Vec<u8>, DecodeError> {
    let (kind, hash160) = address_hash160(address)?;
    let mut payload = Vec::with_capacity(25);
    payload.push(version_byte(kind, network));
    payload.extend_from_slice(&hash160);
    payload.extend_from_slice(&from_height.to_le_bytes());
    Ok(payload)
}
