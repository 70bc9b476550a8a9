//! libbitcoin-server status codes.
//!
//! Every response payload starts with a little-endian `u32` status. Zero
//! means success; codes 1 through 41 map onto the server's error enumeration
//! and anything else is preserved as [`ServerError::Unknown`].

use std::fmt;

macro_rules! server_errors {
    ($($code:literal => $variant:ident: $message:literal,)+) => {
        /// Error reported by a libbitcoin server through a response status code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ServerError {
            $($variant,)+
            /// A status code outside the known table.
            Unknown(u32),
        }

        impl ServerError {
            /// Map a non-zero wire status code to its error value.
            pub fn from_code(code: u32) -> Self {
                match code {
                    $($code => Self::$variant,)+
                    other => Self::Unknown(other),
                }
            }

            /// The numeric wire code for this error.
            pub fn code(&self) -> u32 {
                match self {
                    $(Self::$variant => $code,)+
                    Self::Unknown(code) => *code,
                }
            }

            /// Fixed human-readable description used by the server.
            pub fn message(&self) -> &'static str {
                match self {
                    $(Self::$variant => $message,)+
                    Self::Unknown(_) => "unknown error",
                }
            }
        }
    };
}

server_errors! {
    1 => ServiceStopped: "service stopped",
    2 => OperationFailed: "operation failed",
    3 => NotFound: "not found",
    4 => Duplicate: "duplicate",
    5 => UnspentOutput: "unspent output",
    6 => UnsupportedPaymentType: "unsupported payment type",
    7 => ResolveFailed: "resolve failed",
    8 => NetworkUnreachable: "network unreachable",
    9 => AddressInUse: "address in use",
    10 => ListenFailed: "listen failed",
    11 => AcceptFailed: "accept failed",
    12 => BadStream: "bad stream",
    13 => ChannelTimeout: "channel timeout",
    14 => BlockchainReorganized: "blockchain reorganized",
    15 => PoolFilled: "pool filled",
    16 => CoinbaseTransaction: "coinbase transaction",
    17 => IsNotStandard: "is not standard",
    18 => DoubleSpend: "double spend",
    19 => InputNotFound: "input not found",
    20 => EmptyTransaction: "empty transaction",
    21 => OutputValueOverflow: "output value overflow",
    22 => InvalidCoinbaseScriptSize: "invalid coinbase script size",
    23 => PreviousOutputNull: "previous output null",
    24 => PreviousBlockInvalid: "previous block invalid",
    25 => SizeLimits: "size limits",
    26 => ProofOfWork: "proof of work",
    27 => FuturisticTimestamp: "futuristic timestamp",
    28 => FirstNotCoinbase: "first not coinbase",
    29 => ExtraCoinbases: "extra coinbases",
    30 => TooManySigs: "too many sigs",
    31 => MerkleMismatch: "merkle mismatch",
    32 => IncorrectProofOfWork: "incorrect proof of work",
    33 => TimestampTooEarly: "timestamp too early",
    34 => NonFinalTransaction: "non final transaction",
    35 => CheckpointsFailed: "checkpoints failed",
    36 => OldVersionBlock: "old version block",
    37 => CoinbaseHeightMismatch: "coinbase height mismatch",
    38 => DuplicateOrSpent: "duplicate or spent",
    39 => ValidateInputsFailed: "validate inputs failed",
    40 => FeesOutOfRange: "fees out of range",
    41 => CoinbaseTooLarge: "coinbase too large",
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown error (code {code})"),
            known => f.write_str(known.message()),
        }
    }
}

impl std::error::Error for ServerError {}

/// Interpret a 4-byte little-endian status field. Zero is success.
pub fn parse_status(status: [u8; 4]) -> Result<(), ServerError> {
    match u32::from_le_bytes(status) {
        0 => Ok(()),
        code => Err(ServerError::from_code(code)),
    }
}
