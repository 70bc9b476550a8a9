use std::path::PathBuf;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Txid};
use clap::{Parser, Subcommand};
use lbclient_core::ServerEndpoint;

/// Query and watch a pool of libbitcoin servers.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// Server endpoint, `tcp://host:port[,<z85 server key>]` (repeatable).
    /// Servers are tried in the given order on failover.
    #[arg(long = "server", env = "LBCLIENT_SERVERS", value_delimiter = ' ')]
    pub servers: Vec<ServerEndpoint>,

    /// JSON file with an array of `{host, port, heartbeat_port, public_key}`
    /// objects, appended to `--server` entries.
    #[arg(long, env = "LBCLIENT_SERVERS_FILE")]
    pub servers_file: Option<PathBuf>,

    /// Chain the servers follow: main, test, signet or regtest.
    #[arg(long, default_value = "main", env = "LBCLIENT_NETWORK")]
    pub network: String,

    /// Seconds a request waits for its response before failing over.
    #[arg(long, default_value = "10")]
    pub request_timeout_secs: u64,

    /// Send attempts per request before giving up.
    #[arg(long, default_value = "5")]
    pub max_attempts: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the height of the server's best block.
    Height,

    /// Print the history of an address as JSON.
    History {
        address: Address<NetworkUnchecked>,

        /// Only return rows at or above this height.
        #[arg(long, default_value = "0")]
        from_height: u32,
    },

    /// Print a transaction as consensus-encoded hex.
    Tx {
        txid: Txid,

        /// Look the transaction up in the memory pool instead of the chain.
        #[arg(long)]
        unconfirmed: bool,
    },

    /// Broadcast a hex-encoded transaction.
    Broadcast { hex: String },

    /// Ask the server whether a hex-encoded transaction would be accepted.
    Validate { hex: String },

    /// Subscribe to addresses and print updates until interrupted.
    Watch {
        #[arg(required = true)]
        addresses: Vec<Address<NetworkUnchecked>>,
    },
}
