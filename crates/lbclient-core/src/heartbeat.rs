//! Liveness tracking of the active server through its heartbeat publisher.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::correlator::Failover;
use crate::transport::{Frame, FrameSocket, SocketFactory, SocketKind, TransportError};

/// Liveness timer of the endpoint currently being listened to.
#[derive(Debug, Clone, Copy)]
struct HeartbeatState {
    last_reset_at: Instant,
}

impl HeartbeatState {
    fn start() -> Self {
        Self {
            last_reset_at: Instant::now(),
        }
    }

    fn reset(&mut self) {
        self.last_reset_at = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        self.last_reset_at.elapsed()
    }
}

/// Topic-less subscriber on the active server's heartbeat port.
///
/// Any frame counts as a heartbeat. When nothing arrives for `liveness`, the
/// monitor asks the client to rotate and then follows the new active server.
pub(crate) struct HeartbeatMonitor {
    socket: Arc<dyn FrameSocket>,
    frames: mpsc::Receiver<Frame>,
    url: String,
    liveness: Duration,
}

impl HeartbeatMonitor {
    pub fn connect(
        factory: &dyn SocketFactory,
        url: String,
        liveness: Duration,
        capacity: usize,
    ) -> Result<Self, TransportError> {
        let (tx, frames) = mpsc::channel(capacity);
        // Heartbeats are public; the subscriber is never pinned to a key.
        let socket = factory.connect(SocketKind::Subscriber, &url, None, tx)?;
        info!(server = %url, "listening for heartbeats");
        Ok(Self {
            socket,
            frames,
            url,
            liveness,
        })
    }

    /// Watch heartbeats until the receive pump goes away.
    pub async fn run(mut self, failover: &dyn Failover) {
        let mut state = HeartbeatState::start();
        loop {
            match tokio::time::timeout(self.liveness, self.frames.recv()).await {
                Ok(Some(frame)) => {
                    trace!(server = %self.url, len = frame.data.len(), "heartbeat");
                    state.reset();
                }
                Ok(None) => {
                    debug!(server = %self.url, "heartbeat channel closed; monitor stopping");
                    return;
                }
                Err(_) => {
                    warn!(
                        server = %self.url,
                        silent_for = ?state.silent_for(),
                        "heartbeat lost"
                    );
                    failover.rotate_server().await;
                    self.follow(failover.active_heartbeat_url().await).await;
                    state = HeartbeatState::start();
                }
            }
        }
    }

    async fn follow(&mut self, next: String) {
        if next == self.url {
            return;
        }
        match self.socket.change_endpoint(&self.url, &next, None).await {
            Ok(()) => {
                info!(from = %self.url, to = %next, "heartbeat listener moved");
                self.url = next;
            }
            Err(err) => {
                warn!(server = %next, error = %err, "failed to move heartbeat listener");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::transport::mock::MockNetwork;

    /// Two servers, rotating on every request.
    #[derive(Default)]
    struct AlternatingFailover {
        rotations: AtomicUsize,
    }

    #[async_trait]
    impl Failover for AlternatingFailover {
        async fn rotate_server(&self) {
            self.rotations.fetch_add(1, Ordering::SeqCst);
        }

        async fn active_heartbeat_url(&self) -> String {
            match self.rotations.load(Ordering::SeqCst) % 2 {
                0 => "tcp://server-a:9092".to_owned(),
                _ => "tcp://server-b:9092".to_owned(),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silence_rotates_and_follows_new_server() {
        let network = MockNetwork::new();
        let monitor = HeartbeatMonitor::connect(
            &network,
            "tcp://server-a:9092".to_owned(),
            Duration::from_secs(10),
            16,
        )
        .unwrap();
        let failover = Arc::new(AlternatingFailover::default());
        let task = {
            let failover = failover.clone();
            tokio::spawn(async move { monitor.run(failover.as_ref()).await })
        };

        let subscriber = network.subscriber();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            subscriber.heartbeat().await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(failover.rotations.load(Ordering::SeqCst), 0);

        // Last heartbeat at t=15; the liveness timer fires at t=25.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(failover.rotations.load(Ordering::SeqCst), 1);
        assert_eq!(
            subscriber.endpoint_changes(),
            vec![(
                "tcp://server-a:9092".to_owned(),
                "tcp://server-b:9092".to_owned()
            )]
        );
        assert_eq!(subscriber.url(), "tcp://server-b:9092");

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn each_silent_window_requests_a_rotation() {
        let network = MockNetwork::new();
        let monitor = HeartbeatMonitor::connect(
            &network,
            "tcp://server-a:9092".to_owned(),
            Duration::from_secs(10),
            16,
        )
        .unwrap();
        let failover = Arc::new(AlternatingFailover::default());
        let task = {
            let failover = failover.clone();
            tokio::spawn(async move { monitor.run(failover.as_ref()).await })
        };

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(failover.rotations.load(Ordering::SeqCst), 3);
        assert_eq!(network.subscriber().endpoint_changes().len(), 3);

        task.abort();
    }
}
