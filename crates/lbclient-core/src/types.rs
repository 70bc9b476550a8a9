//! Domain types shared across the client.
//!
//! Contains the server descriptor (`ServerEndpoint`), the decoded response
//! values handed to callers (`HistoryRow`, `AddressUpdate`), and the
//! `BlockHeight` newtype.

use std::fmt;
use std::str::FromStr;

use bitcoin::{Address, Amount, BlockHash, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::error::EndpointError;

/// Default port of the libbitcoin query service.
pub const DEFAULT_QUERY_PORT: u16 = 9091;

/// Default port of the libbitcoin heartbeat publisher.
pub const DEFAULT_HEARTBEAT_PORT: u16 = 9092;

// ==============================================================================
// Block Height
// ==============================================================================

/// A Bitcoin block height, wrapped for type safety.
///
/// `#[serde(transparent)]` keeps the JSON representation a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockHeight(pub u32);

impl From<u32> for BlockHeight {
    fn from(h: u32) -> Self {
        Self(h)
    }
}

impl From<BlockHeight> for u32 {
    fn from(h: BlockHeight) -> Self {
        h.0
    }
}

impl std::ops::Deref for BlockHeight {
    type Target = u32;
    fn deref(&self) -> &u32 {
        &self.0
    }
}

impl fmt::Display for BlockHeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ==============================================================================
// Server Endpoint
// ==============================================================================

/// One candidate libbitcoin server.
///
/// Endpoints are immutable once the client is built; the order of the pool
/// defines the rotation order. `public_key` is the server's Z85-encoded
/// CURVE key; when present the query channel is encrypted and pinned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    pub host: String,
    #[serde(default = "default_query_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat_port")]
    pub heartbeat_port: u16,
    #[serde(default)]
    pub public_key: Option<String>,
}

fn default_query_port() -> u16 {
    DEFAULT_QUERY_PORT
}

fn default_heartbeat_port() -> u16 {
    DEFAULT_HEARTBEAT_PORT
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            heartbeat_port: DEFAULT_HEARTBEAT_PORT,
            public_key: None,
        }
    }

    pub fn with_heartbeat_port(mut self, port: u16) -> Self {
        self.heartbeat_port = port;
        self
    }

    pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    pub fn query_url(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub fn heartbeat_url(&self) -> String {
        format!("tcp://{}:{}", self.host, self.heartbeat_port)
    }

    /// The configured peer key, treating an empty string as absent.
    pub fn peer_key(&self) -> Option<&str> {
        self.public_key.as_deref().filter(|key| !key.is_empty())
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.query_url())
    }
}

/// Parses `tcp://host:port`, `host:port`, or either form followed by
/// `,<z85 server key>`. The heartbeat port is always the default one.
impl FromStr for ServerEndpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, key) = match s.split_once(',') {
            Some((address, key)) => (address, Some(key.trim())),
            None => (s, None),
        };

        let address = match address.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some(_) => return Err(EndpointError::UnsupportedScheme(s.to_owned())),
            None => address,
        };

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPort(s.to_owned()))?;
        if host.is_empty() {
            return Err(EndpointError::EmptyHost(s.to_owned()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|source| EndpointError::InvalidPort {
                endpoint: s.to_owned(),
                source,
            })?;

        let mut endpoint = ServerEndpoint::new(host, port);
        if let Some(key) = key.filter(|key| !key.is_empty()) {
            endpoint = endpoint.with_public_key(key);
        }
        Ok(endpoint)
    }
}

// ==============================================================================
// Decoded Responses
// ==============================================================================

/// One row of an `address.fetch_history2` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRow {
    /// `true` when the row is a spend of one of the address's outputs.
    pub is_spend: bool,
    pub tx_hash: Txid,
    pub index: u32,
    pub height: BlockHeight,
    pub value: Amount,
}

/// Push notification for a subscribed address.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressUpdate {
    pub address: Address,
    pub height: BlockHeight,
    pub block_hash: BlockHash,
    pub tx: Transaction,
}
