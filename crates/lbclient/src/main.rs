mod cli;

use std::path::Path;
use std::time::Duration;

use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::{Address, Network, Transaction};
use clap::Parser;
use eyre::{eyre, WrapErr};

use lbclient_core::{AddressUpdate, BlockHeight, Client, ClientConfig, ServerEndpoint};

use cli::Command;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();

    let network = map_chain_to_network(&args.network)?;

    let mut servers = args.servers;
    if let Some(path) = &args.servers_file {
        let from_file = load_servers_file(path).await?;
        tracing::info!(path = %path.display(), count = from_file.len(), "loaded servers file");
        servers.extend(from_file);
    }
    if servers.is_empty() {
        return Err(eyre!(
            "no servers configured; pass --server, set LBCLIENT_SERVERS or use --servers-file"
        ));
    }

    let config = ClientConfig::default()
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .with_max_attempts(args.max_attempts);
    let client = Client::connect_with_config(servers, network, config)
        .context("connect to libbitcoin server pool")?;
    tracing::info!(server = %client.active_server().await, %network, "client ready");

    match args.command {
        Command::Height => {
            let height = client
                .fetch_last_height()
                .await
                .context("fetch last height")?;
            println!("{height}");
        }
        Command::History {
            address,
            from_height,
        } => {
            let address = require_network(address, network)?;
            let rows = client
                .fetch_history2(&address, BlockHeight(from_height))
                .await
                .with_context(|| format!("fetch history of {address}"))?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Tx { txid, unconfirmed } => {
            let tx = if unconfirmed {
                client.fetch_unconfirmed_transaction(&txid).await
            } else {
                client.fetch_transaction(&txid).await
            }
            .with_context(|| format!("fetch transaction {txid}"))?;
            println!("{}", serialize_hex(&tx));
        }
        Command::Broadcast { hex } => {
            let tx = parse_transaction(&hex)?;
            client.broadcast(&tx).await.context("broadcast transaction")?;
            println!("{}", tx.compute_txid());
        }
        Command::Validate { hex } => {
            let tx = parse_transaction(&hex)?;
            let valid = client.validate(&tx).await.context("validate transaction")?;
            println!("{valid}");
        }
        Command::Watch { addresses } => watch(&client, addresses, network).await?,
    }

    Ok(())
}

/// Subscribe to every address and print one JSON line per update until
/// Ctrl-C.
async fn watch(
    client: &Client,
    addresses: Vec<Address<NetworkUnchecked>>,
    network: Network,
) -> eyre::Result<()> {
    let (tx, mut updates) = tokio::sync::mpsc::unbounded_channel::<AddressUpdate>();
    for address in addresses {
        let address = require_network(address, network)?;
        let tx = tx.clone();
        client
            .subscribe_address(&address, move |update| {
                let _ = tx.send(update);
            })
            .await
            .with_context(|| format!("subscribe to {address}"))?;
    }
    tracing::info!(
        addresses = client.subscription_count().await,
        "watching; press Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listen for Ctrl-C")?;
                tracing::info!("interrupted; stopping watch");
                return Ok(());
            }
            Some(update) = updates.recv() => {
                let line = serde_json::json!({
                    "address": update.address.to_string(),
                    "height": update.height,
                    "block_hash": update.block_hash,
                    "txid": update.tx.compute_txid(),
                });
                println!("{line}");
            }
        }
    }
}

async fn load_servers_file(path: &Path) -> eyre::Result<Vec<ServerEndpoint>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read servers file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse servers file {}", path.display()))
}

fn parse_transaction(hex: &str) -> eyre::Result<Transaction> {
    deserialize_hex(hex.trim()).map_err(|err| eyre!("invalid transaction hex: {err}"))
}

fn require_network(address: Address<NetworkUnchecked>, network: Network) -> eyre::Result<Address> {
    address
        .require_network(network)
        .map_err(|err| eyre!("address does not belong to {network}: {err}"))
}

fn map_chain_to_network(chain: &str) -> eyre::Result<Network> {
    match chain {
        "main" | "bitcoin" => Ok(Network::Bitcoin),
        "test" | "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        _ => Err(eyre!(
            "unrecognized network `{chain}`; expected main, test, signet or regtest"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_chain_names() {
        assert_eq!(map_chain_to_network("main").unwrap(), Network::Bitcoin);
        assert_eq!(map_chain_to_network("testnet").unwrap(), Network::Testnet);
        assert_eq!(map_chain_to_network("regtest").unwrap(), Network::Regtest);
        assert!(map_chain_to_network("litecoin").is_err());
    }

    #[test]
    fn address_network_is_checked() {
        let mainnet: Address<NetworkUnchecked> =
            "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".parse().unwrap();
        assert!(require_network(mainnet.clone(), Network::Bitcoin).is_ok());
        assert!(require_network(mainnet, Network::Testnet).is_err());
    }

    #[test]
    fn rejects_bad_transaction_hex() {
        assert!(parse_transaction("zz").is_err());
        assert!(parse_transaction("0100").is_err());
    }
}
