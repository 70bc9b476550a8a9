//! Asynchronous client for libbitcoin-server's query protocol.
//!
//! Talks to a pool of interchangeable servers over ZeroMQ, fails over on
//! request or heartbeat timeouts, and keeps address subscriptions alive across
//! rotations. Start with [`Client::connect`].

pub mod client;
pub mod config;
mod correlator;
pub mod error;
pub mod error_code;
mod failover;
mod heartbeat;
pub mod protocol;
pub mod subscription;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_util;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, DecodeError, EndpointError};
pub use error_code::ServerError;
pub use subscription::UpdateCallback;
pub use transport::TransportError;
pub use types::{AddressUpdate, BlockHeight, HistoryRow, ServerEndpoint};
