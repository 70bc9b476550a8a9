use crate::error_code::ServerError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error("`{command}` got no response after {attempts} attempts")]
    RetriesExhausted { command: &'static str, attempts: u32 },

    #[error("unexpected response shape for `{command}`")]
    UnexpectedResponse { command: &'static str },

    #[error("server pool is empty")]
    EmptyServerPool,

    #[error("client is shut down")]
    Shutdown,
}

/// Failures while decoding wire payloads or addresses.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("`{command}` payload truncated: needed {needed} more bytes, {available} left")]
    Truncated {
        command: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("`{command}` payload has {trailing} unexpected trailing bytes")]
    TrailingBytes {
        command: &'static str,
        trailing: usize,
    },

    #[error("invalid transaction: {0}")]
    Transaction(#[from] bitcoin::consensus::encode::Error),

    #[error("unsupported address version byte {0}")]
    AddressVersion(u8),

    #[error("address {0} is not P2PKH or P2SH")]
    UnsupportedAddress(String),

    #[error("no decoder registered for command `{0}`")]
    UnknownCommand(String),

    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint `{0}` is missing a port")]
    MissingPort(String),

    #[error("endpoint `{0}` has an empty host")]
    EmptyHost(String),

    #[error("endpoint `{endpoint}` has an invalid port: {source}")]
    InvalidPort {
        endpoint: String,
        source: std::num::ParseIntError,
    },

    #[error("unsupported endpoint scheme in `{0}`; expected tcp://")]
    UnsupportedScheme(String),
}
