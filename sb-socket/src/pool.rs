use std::collections::{HashMap, VecDeque};

use tokio::net::TcpStream;

/// Idle-connection pool keyed by origin (`host:port`), grounded on the
/// teacher's `ConnPool` (`ando-proxy/src/proxy.rs`): a bounded
/// `VecDeque` per key, oldest connections reused first, excess drops.
pub struct SocketPool {
    pools: HashMap<String, VecDeque<TcpStream>>,
    max_idle_per_host: usize,
}

impl SocketPool {
    pub fn new(max_idle_per_host: usize) -> Self {
        Self {
            pools: HashMap::new(),
            max_idle_per_host,
        }
    }

    /// Take an idle connection for `origin`, if one is available.
    pub fn take(&mut self, origin: &str) -> Option<TcpStream> {
        self.pools.get_mut(origin).and_then(|q| q.pop_front())
    }

    /// Return a connection to the pool for reuse. Dropped (closed) if the
    /// per-host queue is already at capacity.
    pub fn put(&mut self, origin: &str, stream: TcpStream) {
        let queue = self.pools.entry(origin.to_string()).or_default();
        if queue.len() < self.max_idle_per_host {
            queue.push_back(stream);
        }
    }

    pub fn idle_count(&self, origin: &str) -> usize {
        self.pools.get(origin).map(|q| q.len()).unwrap_or(0)
    }
}

/// Borrows a connection from a [`SocketPool`] and returns it automatically
/// on drop, unless the caller marks it tainted (e.g. after a protocol
/// error) — the lease/pool wrapper named in spec §4.2.
pub struct FilteredSocketLease {
    origin: String,
    stream: Option<TcpStream>,
    tainted: bool,
}

impl FilteredSocketLease {
    pub fn new(origin: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            origin: origin.into(),
            stream: Some(stream),
            tainted: false,
        }
    }

    pub fn get_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("lease used after release")
    }

    /// Mark the connection as unfit for reuse (e.g. it errored, or the
    /// peer sent `Connection: close`); it will be dropped instead of
    /// returned to the pool.
    pub fn taint(&mut self) {
        self.tainted = true;
    }

    /// Return the connection to `pool` unless tainted.
    pub fn release(mut self, pool: &mut SocketPool) {
        if let Some(stream) = self.stream.take() {
            if !self.tainted {
                pool.put(&self.origin, stream);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let (server, client) = tokio::join!(listener.accept(), client);
        (server.unwrap().0, client.unwrap())
    }

    #[tokio::test]
    async fn test_pool_reuses_returned_connection() {
        let mut pool = SocketPool::new(2);
        assert!(pool.take("a:1").is_none());
        let (_server, client) = loopback_pair().await;
        let lease = FilteredSocketLease::new("a:1", client);
        lease.release(&mut pool);
        assert_eq!(pool.idle_count("a:1"), 1);
        assert!(pool.take("a:1").is_some());
        assert_eq!(pool.idle_count("a:1"), 0);
    }

    #[tokio::test]
    async fn test_tainted_lease_is_not_returned() {
        let mut pool = SocketPool::new(2);
        let (_server, client) = loopback_pair().await;
        let mut lease = FilteredSocketLease::new("a:1", client);
        lease.taint();
        lease.release(&mut pool);
        assert_eq!(pool.idle_count("a:1"), 0);
    }

    #[tokio::test]
    async fn test_pool_drops_beyond_capacity() {
        let mut pool = SocketPool::new(1);
        let (_s1, c1) = loopback_pair().await;
        let (_s2, c2) = loopback_pair().await;
        FilteredSocketLease::new("a:1", c1).release(&mut pool);
        FilteredSocketLease::new("a:1", c2).release(&mut pool);
        assert_eq!(pool.idle_count("a:1"), 1);
    }
}
