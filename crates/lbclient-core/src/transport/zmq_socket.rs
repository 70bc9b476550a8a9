use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::{Frame, FrameSocket, SocketFactory, SocketKind, TransportError};

/// How long the I/O thread blocks in `zmq_poll` before checking for commands.
const POLL_INTERVAL_MS: i64 = 20;

/// Pause between delivery attempts while the inbound channel is full.
const BACKPRESSURE_RETRY: Duration = Duration::from_millis(2);

/// Work handed from async callers to a socket's I/O thread.
enum Command {
    Send {
        frames: Vec<Vec<u8>>,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
    ChangeEndpoint {
        old_url: String,
        new_url: String,
        peer_key: Option<String>,
        done: oneshot::Sender<Result<(), TransportError>>,
    },
}

// ==============================================================================
// ZmqSocketFactory
// ==============================================================================

/// Opens [`ZmqSocket`]s on a shared ZeroMQ context.
#[derive(Clone)]
pub struct ZmqSocketFactory {
    context: zmq::Context,
}

impl ZmqSocketFactory {
    pub fn new() -> Self {
        Self {
            context: zmq::Context::new(),
        }
    }
}

impl Default for ZmqSocketFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketFactory for ZmqSocketFactory {
    fn connect(
        &self,
        kind: SocketKind,
        url: &str,
        peer_key: Option<&str>,
        inbound: mpsc::Sender<Frame>,
    ) -> Result<Arc<dyn FrameSocket>, TransportError> {
        let socket = ZmqSocket::connect(&self.context, kind, url, peer_key, inbound)?;
        Ok(Arc::new(socket))
    }
}

// ==============================================================================
// ZmqSocket
// ==============================================================================

/// A ZeroMQ socket driven by a dedicated I/O thread.
///
/// `zmq::Socket` is not `Sync`, so the socket lives on its own thread which
/// polls for inbound frames and executes queued commands in order. Each
/// socket generates an ephemeral CURVE keypair at construction; it is only
/// used when a server key is pinned. Dropping the handle stops the thread.
pub struct ZmqSocket {
    kind: SocketKind,
    commands: mpsc::UnboundedSender<Command>,
    public_key: Option<String>,
}

impl ZmqSocket {
    pub fn connect(
        context: &zmq::Context,
        kind: SocketKind,
        url: &str,
        peer_key: Option<&str>,
        inbound: mpsc::Sender<Frame>,
    ) -> Result<Self, TransportError> {
        let socket = context.socket(match kind {
            SocketKind::Dealer => zmq::DEALER,
            SocketKind::Subscriber => zmq::SUB,
        })?;
        socket.set_linger(0)?;
        if kind == SocketKind::Subscriber {
            socket.set_subscribe(b"")?;
        }

        let keys = match zmq::CurveKeyPair::new() {
            Ok(keys) => Some(keys),
            Err(err) => {
                debug!(error = %err, "CURVE keypair generation unavailable");
                None
            }
        };
        let public_key = keys
            .as_ref()
            .and_then(|keys| zmq::z85_encode(&keys.public_key).ok());

        let peer_key = peer_key.filter(|key| !key.is_empty());
        if let Some(peer_key) = peer_key {
            apply_curve(&socket, keys.as_ref(), &decode_server_key(peer_key)?)?;
        }
        socket.connect(url)?;

        let (commands, receiver) = mpsc::unbounded_channel();
        thread::Builder::new()
            .name(format!("zmq-{kind}"))
            .spawn(move || run_io_loop(socket, keys, receiver, inbound))?;

        info!(%url, %kind, encrypted = peer_key.is_some(), "socket connected");
        Ok(Self {
            kind,
            commands,
            public_key,
        })
    }

    /// Z85 encoding of this socket's ephemeral CURVE public key, if the
    /// linked libzmq supports CURVE.
    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    async fn submit(
        &self,
        command: Command,
        done: oneshot::Receiver<Result<(), TransportError>>,
    ) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::Closed)?;
        done.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl FrameSocket for ZmqSocket {
    async fn send_message(&self, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
        let (done, rx) = oneshot::channel();
        self.submit(Command::Send { frames, done }, rx).await
    }

    async fn change_endpoint(
        &self,
        old_url: &str,
        new_url: &str,
        new_peer_key: Option<&str>,
    ) -> Result<(), TransportError> {
        let (done, rx) = oneshot::channel();
        let command = Command::ChangeEndpoint {
            old_url: old_url.to_owned(),
            new_url: new_url.to_owned(),
            peer_key: new_peer_key.map(str::to_owned),
            done,
        };
        self.submit(command, rx).await
    }
}

// ==============================================================================
// I/O Thread
// ==============================================================================

fn run_io_loop(
    socket: zmq::Socket,
    keys: Option<zmq::CurveKeyPair>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::Sender<Frame>,
) {
    // A frame the reader had no room for. While it is held nothing more is
    // read off the socket, but queued commands keep being executed.
    let mut stalled: Option<Frame> = None;
    loop {
        loop {
            match commands.try_recv() {
                Ok(command) => execute(&socket, keys.as_ref(), command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("socket handle dropped; stopping I/O thread");
                    return;
                }
            }
        }

        if let Some(frame) = stalled.take() {
            match forward(&inbound, frame) {
                Forward::Sent => {}
                Forward::Full(frame) => {
                    stalled = Some(frame);
                    thread::sleep(BACKPRESSURE_RETRY);
                    continue;
                }
                Forward::Closed => return,
            }
        }

        match socket.poll(zmq::POLLIN, POLL_INTERVAL_MS) {
            Ok(0) => {}
            Ok(_) => match pump_frames(&socket, &inbound) {
                Pump::Drained => {}
                Pump::Stalled(frame) => stalled = Some(frame),
                Pump::Stopped => return,
            },
            Err(err) => {
                debug!(error = %err, "socket poll failed; stopping I/O thread");
                return;
            }
        }
    }
}

enum Pump {
    /// Nothing more is readable right now.
    Drained,
    /// The reader is behind; this frame still has to be delivered.
    Stalled(Frame),
    /// A receive failed or nobody reads the channel anymore.
    Stopped,
}

enum Forward {
    Sent,
    Full(Frame),
    Closed,
}

fn forward(inbound: &mpsc::Sender<Frame>, frame: Frame) -> Forward {
    match inbound.try_send(frame) {
        Ok(()) => Forward::Sent,
        Err(TrySendError::Full(frame)) => {
            trace!("inbound channel full; holding frame");
            Forward::Full(frame)
        }
        Err(TrySendError::Closed(_)) => {
            debug!("inbound channel closed; stopping receive pump");
            Forward::Closed
        }
    }
}

/// Forward frames until nothing is readable or the reader falls behind.
fn pump_frames(socket: &zmq::Socket, inbound: &mpsc::Sender<Frame>) -> Pump {
    loop {
        let data = match socket.recv_bytes(zmq::DONTWAIT) {
            Ok(data) => data,
            Err(zmq::Error::EAGAIN) => return Pump::Drained,
            Err(err) => {
                debug!(error = %err, "receive failed; stopping receive pump");
                return Pump::Stopped;
            }
        };
        let more = match socket.get_rcvmore() {
            Ok(more) => more,
            Err(err) => {
                debug!(error = %err, "receive failed; stopping receive pump");
                return Pump::Stopped;
            }
        };
        trace!(len = data.len(), more, "frame received");
        match forward(inbound, Frame { data, more }) {
            Forward::Sent => {}
            Forward::Full(frame) => return Pump::Stalled(frame),
            Forward::Closed => return Pump::Stopped,
        }
    }
}

fn execute(socket: &zmq::Socket, keys: Option<&zmq::CurveKeyPair>, command: Command) {
    match command {
        Command::Send { frames, done } => {
            let _ = done.send(send_frames(socket, frames));
        }
        Command::ChangeEndpoint {
            old_url,
            new_url,
            peer_key,
            done,
        } => {
            let result = switch_endpoint(socket, keys, &old_url, &new_url, peer_key.as_deref());
            let _ = done.send(result);
        }
    }
}

fn send_frames(socket: &zmq::Socket, frames: Vec<Vec<u8>>) -> Result<(), TransportError> {
    let last = frames.len().saturating_sub(1);
    for (i, frame) in frames.into_iter().enumerate() {
        let flags = if i < last {
            zmq::DONTWAIT | zmq::SNDMORE
        } else {
            zmq::DONTWAIT
        };
        socket.send(frame, flags)?;
    }
    Ok(())
}

fn switch_endpoint(
    socket: &zmq::Socket,
    keys: Option<&zmq::CurveKeyPair>,
    old_url: &str,
    new_url: &str,
    peer_key: Option<&str>,
) -> Result<(), TransportError> {
    // A bad key leaves the socket on its current peer.
    let server_key = peer_key
        .filter(|key| !key.is_empty())
        .map(decode_server_key)
        .transpose()?;
    // The old peer may already be gone; that must not block the switch.
    if let Err(err) = socket.disconnect(old_url) {
        warn!(url = %old_url, error = %err, "disconnect failed");
    }
    if let Some(server_key) = &server_key {
        apply_curve(socket, keys, server_key)?;
    }
    socket.connect(new_url)?;
    debug!(from = %old_url, to = %new_url, "socket endpoint changed");
    Ok(())
}

fn apply_curve(
    socket: &zmq::Socket,
    keys: Option<&zmq::CurveKeyPair>,
    server_key: &[u8],
) -> Result<(), TransportError> {
    let keys = keys.ok_or_else(|| {
        TransportError::CurveUnavailable("libzmq could not generate a keypair".to_owned())
    })?;
    socket.set_curve_serverkey(server_key)?;
    socket.set_curve_publickey(&keys.public_key)?;
    socket.set_curve_secretkey(&keys.secret_key)?;
    Ok(())
}

/// Decode a Z85 server key; CURVE keys are exactly 32 bytes.
fn decode_server_key(peer_key: &str) -> Result<Vec<u8>, TransportError> {
    let server_key =
        zmq::z85_decode(peer_key).map_err(|_| TransportError::InvalidKey(peer_key.to_owned()))?;
    if server_key.len() != 32 {
        return Err(TransportError::InvalidKey(peer_key.to_owned()));
    }
    Ok(server_key)
}
