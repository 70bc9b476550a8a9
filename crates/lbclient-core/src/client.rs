//! The public client: server pool, failover and the query API.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Address, Network, Transaction, Txid};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::correlator::{Correlator, Failover};
use crate::error::ClientError;
use crate::failover::ServerPool;
use crate::heartbeat::HeartbeatMonitor;
use crate::protocol::decode::{DecoderRegistry, Response};
use crate::protocol::{
    fetch_history2_payload, FrameAssembler, InboundMessage, ADDRESS_UPDATE,
    BROADCAST_TRANSACTION, FETCH_HISTORY2, FETCH_LAST_HEIGHT, FETCH_TRANSACTION,
    FETCH_UNCONFIRMED_TRANSACTION, VALIDATE_TRANSACTION,
};
use crate::subscription::{SubscriptionRegistry, UpdateCallback};
use crate::transport::{Frame, SocketFactory, SocketKind, ZmqSocketFactory};
use crate::types::{AddressUpdate, BlockHeight, HistoryRow, ServerEndpoint};

/// Asynchronous client for a pool of interchangeable libbitcoin servers.
///
/// Exactly one server is active at a time. Requests that time out rotate the
/// pool and are resent; a silent heartbeat channel rotates it too. Address
/// subscriptions survive rotations by being replayed against the new server.
///
/// Construction spawns the background tasks (frame dispatch, heartbeat
/// monitor, renewal sweep) and must happen inside a Tokio runtime. Dropping
/// the client aborts them.
pub struct Client {
    inner: Arc<ClientInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("network", &self.inner.network)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to `servers` over ZeroMQ with the default configuration.
    pub fn connect(servers: Vec<ServerEndpoint>, network: Network) -> Result<Self, ClientError> {
        Self::connect_with_config(servers, network, ClientConfig::default())
    }

    pub fn connect_with_config(
        servers: Vec<ServerEndpoint>,
        network: Network,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        Self::with_factory(&ZmqSocketFactory::new(), servers, network, config)
    }

    /// Build a client whose sockets come from `factory`.
    pub fn with_factory(
        factory: &dyn SocketFactory,
        servers: Vec<ServerEndpoint>,
        network: Network,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let start = if config.randomize_start {
            rand::random::<usize>()
        } else {
            0
        };
        let pool = ServerPool::new(servers, start, config.min_rotation_interval)?;
        let active = pool.active().clone();

        let (frames_tx, frames_rx) = mpsc::channel(config.inbound_capacity);
        let socket = factory.connect(
            SocketKind::Dealer,
            &active.query_url(),
            active.peer_key(),
            frames_tx,
        )?;
        info!(
            server = %active,
            encrypted = active.peer_key().is_some(),
            pool_size = pool.len(),
            "connected to query service"
        );

        let heartbeat = HeartbeatMonitor::connect(
            factory,
            active.heartbeat_url(),
            config.heartbeat_timeout,
            config.inbound_capacity,
        )?;

        let inner = Arc::new(ClientInner {
            correlator: Correlator::new(
                socket,
                DecoderRegistry::default(),
                network,
                config.clone(),
            ),
            subscriptions: SubscriptionRegistry::new(config.subscription_ttl),
            pool: Mutex::new(pool),
            network,
        });

        let dispatch = tokio::spawn(run_dispatch(inner.clone(), frames_rx));
        let monitor = {
            let inner = inner.clone();
            tokio::spawn(async move { heartbeat.run(inner.as_ref()).await })
        };
        let renewal = {
            let inner = inner.clone();
            let period = config.renew_interval;
            tokio::spawn(async move {
                inner
                    .subscriptions
                    .run_renewal(&inner.correlator, period)
                    .await
            })
        };

        Ok(Self {
            inner,
            tasks: vec![dispatch, monitor, renewal],
        })
    }

    pub fn network(&self) -> Network {
        self.inner.network
    }

    /// The server currently receiving queries.
    pub async fn active_server(&self) -> ServerEndpoint {
        self.inner.pool.lock().await.active().clone()
    }

    /// Move to the next server of the pool, subject to the rotation rate
    /// limit. Subscriptions are replayed against the new server.
    pub async fn rotate_server(&self) {
        self.inner.rotate_server().await;
    }

    // ==========================================================================
    // Queries
    // ==========================================================================

    /// Confirmed and unconfirmed history of `address` starting at
    /// `from_height`.
    pub async fn fetch_history2(
        &self,
        address: &Address,
        from_height: BlockHeight,
    ) -> Result<Vec<HistoryRow>, ClientError> {
        let payload = fetch_history2_payload(address, self.inner.network, from_height.0)?;
        match self.request(FETCH_HISTORY2, &payload).await? {
            Response::History(rows) => Ok(rows),
            _ => Err(ClientError::UnexpectedResponse {
                command: FETCH_HISTORY2,
            }),
        }
    }

    pub async fn fetch_last_height(&self) -> Result<BlockHeight, ClientError> {
        match self.request(FETCH_LAST_HEIGHT, &[]).await? {
            Response::Height(height) => Ok(height),
            _ => Err(ClientError::UnexpectedResponse {
                command: FETCH_LAST_HEIGHT,
            }),
        }
    }

    /// A confirmed transaction by id.
    pub async fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction, ClientError> {
        self.fetch_tx(FETCH_TRANSACTION, txid).await
    }

    /// A transaction from the server's memory pool by id.
    pub async fn fetch_unconfirmed_transaction(
        &self,
        txid: &Txid,
    ) -> Result<Transaction, ClientError> {
        self.fetch_tx(FETCH_UNCONFIRMED_TRANSACTION, txid).await
    }

    async fn fetch_tx(&self, command: &'static str, txid: &Txid) -> Result<Transaction, ClientError> {
        match self.request(command, &txid.to_byte_array()).await? {
            Response::Transaction(tx) => Ok(tx),
            _ => Err(ClientError::UnexpectedResponse { command }),
        }
    }

    /// Submit `tx` to the network. A rejection comes back as
    /// [`ClientError::Server`].
    pub async fn broadcast(&self, tx: &Transaction) -> Result<(), ClientError> {
        let payload = bitcoin::consensus::serialize(tx);
        match self.request(BROADCAST_TRANSACTION, &payload).await? {
            Response::Broadcast => Ok(()),
            _ => Err(ClientError::UnexpectedResponse {
                command: BROADCAST_TRANSACTION,
            }),
        }
    }

    /// Ask the server whether `tx` would be accepted into its memory pool.
    pub async fn validate(&self, tx: &Transaction) -> Result<bool, ClientError> {
        let payload = bitcoin::consensus::serialize(tx);
        match self.request(VALIDATE_TRANSACTION, &payload).await? {
            Response::Validation(valid) => Ok(valid),
            _ => Err(ClientError::UnexpectedResponse {
                command: VALIDATE_TRANSACTION,
            }),
        }
    }

    async fn request(&self, command: &'static str, payload: &[u8]) -> Result<Response, ClientError> {
        self.inner
            .correlator
            .send_command(command, payload, self.inner.as_ref())
            .await
    }

    // ==========================================================================
    // Subscriptions
    // ==========================================================================

    /// Subscribe to activity on `address`. `callback` runs on the client's
    /// dispatch task for every update and replaces any earlier callback for
    /// the same address.
    pub async fn subscribe_address(
        &self,
        address: &Address,
        callback: impl Fn(AddressUpdate) + Send + Sync + 'static,
    ) -> Result<(), ClientError> {
        let callback: UpdateCallback = Arc::new(callback);
        self.inner
            .subscriptions
            .subscribe(&self.inner.correlator, address, callback)
            .await
    }

    /// Number of addresses currently subscribed.
    pub async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len().await
    }

    /// Stop delivering updates for `address`. Returns whether a subscription
    /// existed.
    pub async fn unsubscribe_address(&self, address: &Address) -> bool {
        self.inner.subscriptions.unsubscribe(address).await
    }

    /// Renew the subscription for `address` ahead of the periodic sweep.
    pub async fn renew_subscription(
        &self,
        address: &Address,
        callback: impl Fn(AddressUpdate) + Send + Sync + 'static,
    ) -> Result<(), ClientError> {
        let callback: UpdateCallback = Arc::new(callback);
        self.inner
            .subscriptions
            .renew(&self.inner.correlator, address, callback)
            .await
    }
}

// ==============================================================================
// Shared State
// ==============================================================================

struct ClientInner {
    correlator: Correlator,
    subscriptions: SubscriptionRegistry,
    pool: Mutex<ServerPool>,
    network: Network,
}

impl ClientInner {
    async fn dispatch(&self, message: InboundMessage) {
        if message.command != ADDRESS_UPDATE {
            self.correlator.pending().resolve(message).await;
            return;
        }
        match self
            .correlator
            .decoders()
            .decode(ADDRESS_UPDATE, &message.payload, self.network)
        {
            Ok(Response::Update(update)) => {
                trace!(address = %update.address, height = %update.height, "address update");
                self.subscriptions.dispatch(update).await;
            }
            Ok(_) => warn!("address update decoded to a different response"),
            Err(err) => warn!(error = %err, "dropping undecodable address update"),
        }
    }
}

#[async_trait]
impl Failover for ClientInner {
    async fn rotate_server(&self) {
        let (from, to) = {
            let mut pool = self.pool.lock().await;
            let Some(rotation) = pool.advance(Instant::now()) else {
                debug!(server = %pool.active(), "rotation suppressed; last one was too recent");
                return;
            };
            (pool.get(rotation.from).clone(), pool.get(rotation.to).clone())
        };

        // No lock is held from here on; the rotation gate keeps a second
        // rotation from overlapping this one.

        if let Err(err) = self
            .correlator
            .socket()
            .change_endpoint(&from.query_url(), &to.query_url(), to.peer_key())
            .await
        {
            warn!(server = %to, error = %err, "failed to switch query endpoint");
        }
        let replayed = self.subscriptions.resubscribe_all(&self.correlator).await;
        info!(from = %from, to = %to, replayed, "rotated to next server");
    }

    async fn active_heartbeat_url(&self) -> String {
        self.pool.lock().await.active().heartbeat_url()
    }
}

/// Reassemble frames from the query socket and route each message to its
/// waiter or to the subscription callbacks.
async fn run_dispatch(inner: Arc<ClientInner>, mut frames: mpsc::Receiver<Frame>) {
    let mut assembler = FrameAssembler::default();
    while let Some(frame) = frames.recv().await {
        trace!(len = frame.data.len(), more = frame.more, "frame received");
        match assembler.push(frame) {
            None => {}
            Some(Ok(message)) => inner.dispatch(message).await,
            Some(Err(err)) => warn!(error = %err, "dropping malformed message"),
        }
    }
    debug!("query channel closed; dispatch loop stopping");
    inner.correlator.pending().close().await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bitcoin::Amount;

    use super::*;
    use crate::error_code::ServerError;
    use crate::protocol::{SUBSCRIBE_ADDRESS, RENEW_ADDRESS};
    use crate::test_util::*;
    use crate::transport::mock::MockNetwork;

    const SERVER_A: &str = "tcp://server-a:9091";
    const SERVER_B: &str = "tcp://server-b:9091";

    fn servers() -> Vec<ServerEndpoint> {
        vec![
            ServerEndpoint::new("server-a", 9091),
            ServerEndpoint::new("server-b", 9091),
        ]
    }

    fn config() -> ClientConfig {
        ClientConfig::default().with_randomized_start(false)
    }

    fn client(network: &MockNetwork, config: ClientConfig) -> Client {
        Client::with_factory(network, servers(), Network::Bitcoin, config).unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = Client::with_factory(&MockNetwork::new(), Vec::new(), Network::Bitcoin, config())
            .unwrap_err();
        assert!(matches!(err, ClientError::EmptyServerPool));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_over_to_next_server() {
        let network = MockNetwork::new().with_responder(|url, command, _| {
            (url == SERVER_B && command == FETCH_LAST_HEIGHT)
                .then(|| ok_payload(&12_345u32.to_le_bytes()))
        });
        let client = client(&network, config());
        assert_eq!(client.active_server().await.query_url(), SERVER_A);

        assert_eq!(client.fetch_last_height().await.unwrap(), BlockHeight(12_345));

        let sent = network.dealer().sent_commands(FETCH_LAST_HEIGHT);
        let urls: Vec<_> = sent.iter().map(|message| message.url.as_str()).collect();
        assert_eq!(urls, vec![SERVER_A, SERVER_B]);
        assert_ne!(sent[0].id, sent[1].id);
        assert_eq!(client.active_server().await.query_url(), SERVER_B);
        assert_eq!(
            network.dealer().endpoint_changes(),
            vec![(SERVER_A.to_owned(), SERVER_B.to_owned())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_requests_exhaust_retries() {
        let network = MockNetwork::new();
        let client = client(&network, config().with_max_attempts(2));

        let err = client.fetch_last_height().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::RetriesExhausted {
                command: FETCH_LAST_HEIGHT,
                attempts: 2
            }
        ));
        assert_eq!(network.dealer().sent_commands(FETCH_LAST_HEIGHT).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_surfaces_double_spend() {
        let network = MockNetwork::new().with_responder(|_, command, _| {
            (command == BROADCAST_TRANSACTION).then(|| 18u32.to_le_bytes().to_vec())
        });
        let client = client(&network, config());

        let tx = sample_tx(50_000);
        let err = client.broadcast(&tx).await.unwrap_err();
        assert!(matches!(err, ClientError::Server(ServerError::DoubleSpend)));

        let sent = network.dealer().sent_commands(BROADCAST_TRANSACTION);
        assert_eq!(sent[0].payload, bitcoin::consensus::serialize(&tx));
    }

    #[tokio::test(start_paused = true)]
    async fn validate_returns_server_verdict() {
        let network = MockNetwork::new().with_responder(|_, command, _| {
            (command == VALIDATE_TRANSACTION).then(|| ok_payload(&[1]))
        });
        let client = client(&network, config());
        assert!(client.validate(&sample_tx(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn history_request_carries_version_and_height() {
        let network = MockNetwork::new().with_responder(|_, command, _| {
            (command == FETCH_HISTORY2)
                .then(|| ok_payload(&history_row_bytes(false, 5, 1, 800_000, 25_000)))
        });
        let client = client(&network, config());
        let address = p2sh_address(9, Network::Bitcoin);

        let rows = client
            .fetch_history2(&address, BlockHeight(799_000))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tx_hash, txid_from_byte(5));
        assert_eq!(rows[0].value, Amount::from_sat(25_000));

        let sent = network.dealer().sent_commands(FETCH_HISTORY2);
        assert_eq!(sent[0].payload[0], 5);
        assert_eq!(sent[0].payload[21..], 799_000u32.to_le_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn transaction_is_requested_by_internal_byte_order() {
        let tx = sample_tx(7_000);
        let raw = bitcoin::consensus::serialize(&tx);
        let network = MockNetwork::new().with_responder(move |_, command, _| {
            (command == FETCH_UNCONFIRMED_TRANSACTION).then(|| ok_payload(&raw))
        });
        let client = client(&network, config());
        let txid = txid_from_byte(0x42);

        assert_eq!(client.fetch_unconfirmed_transaction(&txid).await.unwrap(), tx);
        let sent = network.dealer().sent_commands(FETCH_UNCONFIRMED_TRANSACTION);
        assert_eq!(sent[0].payload, txid.to_byte_array());
    }

    #[tokio::test(start_paused = true)]
    async fn pushes_reach_subscription_callback() {
        let network = MockNetwork::new();
        let client = client(&network, config());
        let address = p2pkh_address(7, Network::Bitcoin);
        let (tx, mut updates) = mpsc::unbounded_channel();
        client
            .subscribe_address(&address, move |update| {
                let _ = tx.send(update);
            })
            .await
            .unwrap();

        let pushed = sample_tx(42);
        network
            .dealer()
            .push(ADDRESS_UPDATE, 0, address_update_payload(0, [7; 20], 812_345, &pushed))
            .await;
        // Updates for addresses nobody subscribed to are dropped.
        network
            .dealer()
            .push(ADDRESS_UPDATE, 0, address_update_payload(0, [8; 20], 812_345, &pushed))
            .await;

        let update = updates.recv().await.unwrap();
        assert_eq!(update.address, address);
        assert_eq!(update.height, BlockHeight(812_345));
        assert_eq!(update.tx, pushed);
        assert!(updates.try_recv().is_err());

        assert!(client.unsubscribe_address(&address).await);
        assert!(!client.unsubscribe_address(&address).await);
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_replays_subscriptions_on_new_server() {
        let network = MockNetwork::new();
        let client = client(&network, config());
        let first = p2pkh_address(1, Network::Bitcoin);
        let second = p2sh_address(2, Network::Bitcoin);
        client.subscribe_address(&first, |_| {}).await.unwrap();
        client.renew_subscription(&second, |_| {}).await.unwrap();

        client.rotate_server().await;
        // A second rotation inside the rate-limit window is ignored.
        client.rotate_server().await;

        let dealer = network.dealer();
        assert_eq!(dealer.endpoint_changes().len(), 1);
        assert_eq!(dealer.sent_commands(RENEW_ADDRESS).len(), 1);
        let replayed: Vec<_> = dealer
            .sent_commands(SUBSCRIBE_ADDRESS)
            .into_iter()
            .filter(|message| message.url == SERVER_B)
            .collect();
        assert_eq!(replayed.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_follows_rotation() {
        let network = MockNetwork::new();
        let client = client(&network, config());
        client.rotate_server().await;

        // The monitor only moves once its own liveness timer fires.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(network.subscriber().url(), "tcp://server-b:9092");
        drop(client);
    }
}
