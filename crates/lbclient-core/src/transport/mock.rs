use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Frame, FrameSocket, SocketFactory, SocketKind, TransportError};

/// Scripted server behavior: given the endpoint a request was sent to, the
/// command and its payload, return the response payload (or `None` to stay
/// silent).
pub(crate) type Responder = Arc<dyn Fn(&str, &str, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// A request observed by a mock socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentMessage {
    pub url: String,
    pub command: String,
    pub id: u32,
    pub payload: Vec<u8>,
}

/// An in-memory "network" of mock sockets. Every socket opened through it is
/// kept so tests can inspect traffic and inject frames.
#[derive(Clone, Default)]
pub(crate) struct MockNetwork {
    sockets: Arc<Mutex<Vec<Arc<MockSocket>>>>,
    responder: Option<Responder>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&str, &str, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    pub fn sockets(&self, kind: SocketKind) -> Vec<Arc<MockSocket>> {
        self.sockets
            .lock()
            .unwrap()
            .iter()
            .filter(|socket| socket.kind == kind)
            .cloned()
            .collect()
    }

    /// The first dealer socket opened on this network.
    pub fn dealer(&self) -> Arc<MockSocket> {
        self.sockets(SocketKind::Dealer)
            .into_iter()
            .next()
            .expect("a dealer socket must have been opened")
    }

    /// The first subscriber socket opened on this network.
    pub fn subscriber(&self) -> Arc<MockSocket> {
        self.sockets(SocketKind::Subscriber)
            .into_iter()
            .next()
            .expect("a subscriber socket must have been opened")
    }
}

impl SocketFactory for MockNetwork {
    fn connect(
        &self,
        kind: SocketKind,
        url: &str,
        _peer_key: Option<&str>,
        inbound: mpsc::Sender<Frame>,
    ) -> Result<Arc<dyn FrameSocket>, TransportError> {
        let socket = Arc::new(MockSocket {
            kind,
            url: Mutex::new(url.to_owned()),
            inbound,
            sent: Mutex::new(Vec::new()),
            endpoint_changes: Mutex::new(Vec::new()),
            responder: self.responder.clone(),
        });
        self.sockets.lock().unwrap().push(socket.clone());
        Ok(socket)
    }
}

pub(crate) struct MockSocket {
    kind: SocketKind,
    url: Mutex<String>,
    inbound: mpsc::Sender<Frame>,
    sent: Mutex<Vec<SentMessage>>,
    endpoint_changes: Mutex<Vec<(String, String)>>,
    responder: Option<Responder>,
}

impl MockSocket {
    pub fn url(&self) -> String {
        self.url.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_commands(&self, command: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|message| message.command == command)
            .collect()
    }

    pub fn endpoint_changes(&self) -> Vec<(String, String)> {
        self.endpoint_changes.lock().unwrap().clone()
    }

    /// Deliver a 3-frame message as if the server had sent it.
    pub async fn push(&self, command: &str, id: u32, payload: Vec<u8>) {
        for frame in response_frames(command, id, payload) {
            self.inbound
                .send(frame)
                .await
                .expect("inbound channel must be open");
        }
    }

    /// Deliver a single-frame heartbeat.
    pub async fn heartbeat(&self) {
        self.inbound
            .send(Frame {
                data: vec![0],
                more: false,
            })
            .await
            .expect("inbound channel must be open");
    }
}

#[async_trait]
impl FrameSocket for MockSocket {
    async fn send_message(&self, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        let [command, id, payload]: [Vec<u8>; 3] = frames
            .try_into()
            .expect("requests are always three frames");
        let message = SentMessage {
            url: self.url(),
            command: String::from_utf8(command).expect("command names are ASCII"),
            id: u32::from_le_bytes(id.try_into().expect("request id is four bytes")),
            payload,
        };
        self.sent.lock().unwrap().push(message.clone());

        let reply = self
            .responder
            .as_ref()
            .and_then(|respond| respond(&message.url, &message.command, &message.payload));
        if let Some(reply) = reply {
            for frame in response_frames(&message.command, message.id, reply) {
                self.inbound
                    .try_send(frame)
                    .expect("inbound channel must have room");
            }
        }
        Ok(())
    }

    async fn change_endpoint(
        &self,
        old_url: &str,
        new_url: &str,
        _new_peer_key: Option<&str>,
    ) -> Result<(), TransportError> {
        self.endpoint_changes
            .lock()
            .unwrap()
            .push((old_url.to_owned(), new_url.to_owned()));
        *self.url.lock().unwrap() = new_url.to_owned();
        Ok(())
    }
}

fn response_frames(command: &str, id: u32, payload: Vec<u8>) -> Vec<Frame> {
    vec![
        Frame {
            data: command.as_bytes().to_vec(),
            more: true,
        },
        Frame {
            data: id.to_le_bytes().to_vec(),
            more: true,
        },
        Frame {
            data: payload,
            more: false,
        },
    ]
}
