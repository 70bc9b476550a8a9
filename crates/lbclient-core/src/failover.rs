//! The server pool and its rotation policy.

use std::time::Duration;

use tokio::time::Instant;

use crate::error::ClientError;
use crate::types::ServerEndpoint;

/// A completed rotation, from one pool index to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rotation {
    pub from: usize,
    pub to: usize,
}

/// Ordered list of interchangeable servers with one active entry.
///
/// Rotation walks the list cyclically and is rate limited: once a rotation
/// happens, further requests within `min_interval` are ignored. A request
/// timeout and a heartbeat timeout firing together for the same dead server
/// therefore move the client one step, not two.
#[derive(Debug)]
pub(crate) struct ServerPool {
    servers: Vec<ServerEndpoint>,
    active: usize,
    last_rotation: Option<Instant>,
    min_interval: Duration,
}

impl ServerPool {
    pub fn new(
        servers: Vec<ServerEndpoint>,
        start: usize,
        min_interval: Duration,
    ) -> Result<Self, ClientError> {
        if servers.is_empty() {
            return Err(ClientError::EmptyServerPool);
        }
        let active = start % servers.len();
        Ok(Self {
            servers,
            active,
            last_rotation: None,
            min_interval,
        })
    }

    pub fn active(&self) -> &ServerEndpoint {
        &self.servers[self.active]
    }

    #[cfg(test)]
    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn get(&self, index: usize) -> &ServerEndpoint {
        &self.servers[index % self.servers.len()]
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Advance to the next server unless the last rotation was less than
    /// `min_interval` before `now`.
    ///
    /// A single-server pool still records the rotation (`from == to`) so the
    /// caller reconnects to the same endpoint.
    pub fn advance(&mut self, now: Instant) -> Option<Rotation> {
        if let Some(last) = self.last_rotation {
            if now.saturating_duration_since(last) < self.min_interval {
                return None;
            }
        }
        let from = self.active;
        self.active = (self.active + 1) % self.servers.len();
        self.last_rotation = Some(now);
        Some(Rotation {
            from,
            to: self.active,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u16, start: usize) -> ServerPool {
        let servers = (0..n)
            .map(|i| ServerEndpoint::new(format!("server-{i}"), 9091))
            .collect();
        ServerPool::new(servers, start, Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = ServerPool::new(Vec::new(), 0, Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, ClientError::EmptyServerPool));
    }

    #[test]
    fn start_index_wraps_into_range() {
        let pool = pool(3, 7);
        assert_eq!(pool.active_index(), 1);
        assert_eq!(pool.active().host, "server-1");
    }

    #[test]
    fn rotation_is_cyclic() {
        let mut pool = pool(3, 0);
        let mut now = Instant::now();
        let mut visited = vec![pool.active_index()];
        for _ in 0..3 {
            now += Duration::from_secs(31);
            let rotation = pool.advance(now).unwrap();
            assert_eq!(rotation.from, *visited.last().unwrap());
            visited.push(rotation.to);
        }
        assert_eq!(visited, vec![0, 1, 2, 0]);
    }

    #[test]
    fn rotations_within_window_are_suppressed() {
        let mut pool = pool(3, 0);
        let start = Instant::now();

        assert_eq!(pool.advance(start), Some(Rotation { from: 0, to: 1 }));
        assert_eq!(pool.advance(start + Duration::from_secs(1)), None);
        assert_eq!(pool.advance(start + Duration::from_secs(29)), None);
        assert_eq!(pool.active_index(), 1);

        // The window is measured from the last successful rotation.
        assert_eq!(
            pool.advance(start + Duration::from_secs(30)),
            Some(Rotation { from: 1, to: 2 })
        );
    }

    #[test]
    fn single_server_pool_reconnects_in_place() {
        let mut pool = pool(1, 0);
        assert_eq!(
            pool.advance(Instant::now()),
            Some(Rotation { from: 0, to: 0 })
        );
        assert_eq!(pool.len(), 1);
    }
}
