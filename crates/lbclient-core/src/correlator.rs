//! Request/response correlation over an unordered transport.
//!
//! Requests are matched to responses purely by their 32-bit id. The
//! [`Correlator`] owns the outstanding-request table, the decoder table and
//! the retry loop: a request that sees no response within the request timeout
//! triggers a server rotation (through [`Failover`]) and is resent, up to the
//! configured attempt budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::Network;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::protocol::decode::{DecoderRegistry, Response};
use crate::protocol::{encode_request, InboundMessage};
use crate::transport::{FrameSocket, TransportError};

/// The failover half of the client, as seen by request and heartbeat logic.
#[async_trait]
pub(crate) trait Failover: Send + Sync {
    /// Switch to the next server unless a rotation happened too recently.
    async fn rotate_server(&self);

    /// Heartbeat endpoint of the currently active server.
    async fn active_heartbeat_url(&self) -> String;
}

// ==============================================================================
// Outstanding Requests
// ==============================================================================

struct Outstanding {
    command: &'static str,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Table of requests awaiting a response, keyed by request id.
pub(crate) struct PendingRequests {
    next_id: AtomicU32,
    table: Mutex<HashMap<u32, Outstanding>>,
    /// Set once no further responses can arrive.
    closed: AtomicBool,
}

impl PendingRequests {
    /// Ids start at a random point of the 32-bit space and then count up,
    /// wrapping; an id still outstanding after a wrap is skipped.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(rand::random()),
            table: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate an id that is not outstanding and register a waiter for it.
    /// Fails with [`ClientError::Shutdown`] once the table is closed.
    pub async fn register(
        &self,
        command: &'static str,
    ) -> Result<(u32, oneshot::Receiver<Vec<u8>>), ClientError> {
        let mut table = self.table.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Shutdown);
        }
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !table.contains_key(&id) {
                break id;
            }
            trace!(request_id = id, "request id still outstanding; skipping");
        };
        let (reply, rx) = oneshot::channel();
        table.insert(id, Outstanding { command, reply });
        Ok((id, rx))
    }

    /// Allocate an id for a message that expects no response.
    pub fn allocate_unregistered(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Hand `message` to its waiter. Returns `false` when nothing waits for
    /// this id (late response after a retry, or an unknown id).
    pub async fn resolve(&self, message: InboundMessage) -> bool {
        let mut table = self.table.lock().await;
        match table.get(&message.id) {
            Some(outstanding) if outstanding.command == message.command => {}
            Some(outstanding) => {
                warn!(
                    request_id = message.id,
                    expected = outstanding.command,
                    got = %message.command,
                    "response command does not match request; dropping"
                );
                return false;
            }
            None => {
                debug!(
                    request_id = message.id,
                    command = %message.command,
                    "no outstanding request for response; dropping"
                );
                return false;
            }
        }
        let Some(outstanding) = table.remove(&message.id) else {
            return false;
        };
        drop(table);
        outstanding.reply.send(message.payload).is_ok()
    }

    pub async fn forget(&self, id: u32) {
        self.table.lock().await.remove(&id);
    }

    /// Fail every waiter and refuse new registrations. Called when the
    /// receive side is gone for good.
    pub async fn close(&self) {
        let mut table = self.table.lock().await;
        self.closed.store(true, Ordering::Release);
        if !table.is_empty() {
            debug!(outstanding = table.len(), "closing request table");
        }
        table.clear();
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }
}

// ==============================================================================
// Correlator
// ==============================================================================

pub(crate) struct Correlator {
    socket: Arc<dyn FrameSocket>,
    pending: PendingRequests,
    decoders: DecoderRegistry,
    network: Network,
    config: ClientConfig,
}

impl Correlator {
    pub fn new(
        socket: Arc<dyn FrameSocket>,
        decoders: DecoderRegistry,
        network: Network,
        config: ClientConfig,
    ) -> Self {
        Self {
            socket,
            pending: PendingRequests::new(),
            decoders,
            network,
            config,
        }
    }

    pub fn socket(&self) -> &Arc<dyn FrameSocket> {
        &self.socket
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    /// Send `command` and wait for its decoded response.
    ///
    /// Each attempt races the send and the response against the request
    /// timeout. On timeout the request is dropped from the table, `failover`
    /// rotates the server, and after a backoff the same payload is resent
    /// under a fresh id. Once `max_attempts` sends went unanswered the
    /// request fails with [`ClientError::RetriesExhausted`].
    pub async fn send_command(
        &self,
        command: &'static str,
        payload: &[u8],
        failover: &dyn Failover,
    ) -> Result<Response, ClientError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let (id, reply) = self.pending.register(command).await?;
            debug!(command, request_id = id, attempt, "sending command");

            let exchange = async {
                self.socket
                    .send_message(encode_request(command, id, payload))
                    .await?;
                let data = reply.await.map_err(|_| ClientError::Shutdown)?;
                Ok::<_, ClientError>(data)
            };

            match tokio::time::timeout(self.config.request_timeout, exchange).await {
                Ok(Ok(data)) => {
                    debug!(command, request_id = id, len = data.len(), "response matched");
                    return self.decoders.decode(command, &data, self.network);
                }
                Ok(Err(err)) => {
                    self.pending.forget(id).await;
                    return Err(err);
                }
                Err(_) => {
                    self.pending.forget(id).await;
                    warn!(
                        command,
                        request_id = id,
                        attempt,
                        timeout = ?self.config.request_timeout,
                        "request timed out"
                    );
                    failover.rotate_server().await;
                    if attempt >= self.config.max_attempts {
                        return Err(ClientError::RetriesExhausted {
                            command,
                            attempts: attempt,
                        });
                    }
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                }
            }
        }
    }

    /// Send `command` without registering for a response.
    pub async fn send_oneway(
        &self,
        command: &'static str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let id = self.pending.allocate_unregistered();
        trace!(command, request_id = id, "sending one-way command");
        self.socket
            .send_message(encode_request(command, id, payload))
            .await
    }
}
