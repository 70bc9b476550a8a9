//! Frame-level transport abstraction.
//!
//! Defines the [`FrameSocket`] trait the client talks through, the
//! [`SocketFactory`] that opens sockets, and a ZeroMQ implementation
//! ([`ZmqSocketFactory`]) plus a test mock (`mock::MockNetwork`).

#[cfg(test)]
pub(crate) mod mock;
mod zmq_socket;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use zmq_socket::{ZmqSocket, ZmqSocketFactory};

/// One raw frame read off a socket. `more` is set on every frame of a
/// multipart message except the last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Request/response channel to the query service.
    Dealer,
    /// Topic-less subscription, used for heartbeats.
    Subscriber,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dealer => write!(f, "dealer"),
            Self::Subscriber => write!(f, "subscriber"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("zmq: {0}")]
    Zmq(#[from] zmq::Error),

    #[error("invalid CURVE public key `{0}`")]
    InvalidKey(String),

    #[error("CURVE encryption requested but unavailable: {0}")]
    CurveUnavailable(String),

    #[error("socket I/O thread has stopped")]
    Closed,

    #[error("failed to spawn socket I/O thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A connected socket that keeps its identity across endpoint changes.
///
/// Inbound frames are not read through this trait: they are pushed onto the
/// channel handed to [`SocketFactory::connect`].
#[async_trait]
pub trait FrameSocket: Send + Sync {
    /// Write one multipart message. Frames of a single call are never
    /// interleaved with frames of another call.
    async fn send_message(&self, frames: Vec<Vec<u8>>) -> Result<(), TransportError>;

    /// Disconnect from `old_url` and connect to `new_url` in place.
    ///
    /// `new_peer_key` replaces the pinned server key; `None` leaves the
    /// current key untouched.
    async fn change_endpoint(
        &self,
        old_url: &str,
        new_url: &str,
        new_peer_key: Option<&str>,
    ) -> Result<(), TransportError>;
}

/// Opens connected sockets whose receive pump feeds `inbound`.
pub trait SocketFactory: Send + Sync {
    fn connect(
        &self,
        kind: SocketKind,
        url: &str,
        peer_key: Option<&str>,
        inbound: mpsc::Sender<Frame>,
    ) -> Result<Arc<dyn FrameSocket>, TransportError>;
}
