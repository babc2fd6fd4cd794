//! Client-side connection pool.
//!
//! The pool keeps a bounded LIFO free list of idle sockets per address.
//! Connections older than the TTL are closed at checkout or release instead
//! of being reused, and a connection released together with an error is
//! always closed, never pooled.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::message::TransportMessage;
use crate::transport::{DialOptions, Socket, Transport};

/// Default number of idle connections kept per address.
pub const DEFAULT_POOL_SIZE: usize = 1;

/// Default maximum age of a pooled connection.
pub const DEFAULT_POOL_TTL: Duration = Duration::from_secs(60);

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections retained per address.
    pub size: usize,
    /// Connections older than this are closed instead of reused.
    pub ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            ttl: DEFAULT_POOL_TTL,
        }
    }
}

/// Statistics about the connection pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle connections across all addresses.
    pub total_idle: usize,
    /// Addresses that currently have at least one idle connection.
    pub addresses: usize,
    /// Connections dialled since the pool was created.
    pub dialled: u64,
}

/// A connection checked out of the pool.
pub struct PoolConn {
    id: u64,
    created: Instant,
    socket: Box<dyn Socket>,
}

impl PoolConn {
    /// Pool-unique connection id, stable across checkouts of the same socket.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the connection was dialled.
    pub fn created(&self) -> Instant {
        self.created
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.created.elapsed() > ttl
    }
}

#[async_trait]
impl Socket for PoolConn {
    async fn send(&mut self, msg: &TransportMessage) -> Result<()> {
        self.socket.send(msg).await
    }

    async fn recv(&mut self) -> Result<TransportMessage> {
        self.socket.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.socket.close().await
    }

    fn local(&self) -> &str {
        self.socket.local()
    }

    fn remote(&self) -> &str {
        self.socket.remote()
    }
}

struct PoolState {
    config: PoolConfig,
    idle: HashMap<String, Vec<PoolConn>>,
}

/// A per-address pool of reusable sockets.
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Creates a new connection pool with the given configuration.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState {
                config,
                idle: HashMap::new(),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> PoolConfig {
        self.state.lock().config.clone()
    }

    /// Replaces size and TTL. Idle connections above the new size are closed
    /// lazily, the next time they would be handed out or released.
    pub fn set_config(&self, config: PoolConfig) {
        self.state.lock().config = config;
    }

    /// Returns an idle connection for `addr`, or dials a new one.
    ///
    /// Expired idle connections met on the way are closed. The lock is never
    /// held across the dial.
    pub async fn get_conn(
        &self,
        addr: &str,
        transport: &dyn Transport,
        opts: DialOptions,
    ) -> Result<PoolConn> {
        let mut stale = Vec::new();
        let found = {
            let mut state = self.state.lock();
            let ttl = state.config.ttl;
            let mut found = None;
            if let Some(free) = state.idle.get_mut(addr) {
                while let Some(conn) = free.pop() {
                    if conn.expired(ttl) {
                        stale.push(conn);
                        continue;
                    }
                    found = Some(conn);
                    break;
                }
                if free.is_empty() {
                    state.idle.remove(addr);
                }
            }
            found
        };

        for mut conn in stale {
            debug!(addr = addr, conn = conn.id, "closing expired pooled connection");
            let _ = conn.socket.close().await;
        }

        if let Some(conn) = found {
            debug!(addr = addr, conn = conn.id, "reusing pooled connection");
            return Ok(conn);
        }

        let socket = transport.dial(addr, opts).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(addr = addr, conn = id, "dialled new connection");
        Ok(PoolConn {
            id,
            created: Instant::now(),
            socket,
        })
    }

    /// Returns a connection after use.
    ///
    /// The connection is closed when `err` is set, when it has outlived the
    /// TTL, or when the free list for `addr` is already full.
    pub async fn release(
        &self,
        addr: &str,
        mut conn: PoolConn,
        err: Option<&(dyn StdError + Send + Sync)>,
    ) {
        if let Some(err) = err {
            debug!(addr = addr, conn = conn.id, error = %err, "closing connection released with error");
            let _ = conn.socket.close().await;
            return;
        }

        let overflow = {
            let mut state = self.state.lock();
            let PoolState { config, idle } = &mut *state;
            if conn.expired(config.ttl) {
                Some(conn)
            } else {
                let free = idle.entry(addr.to_string()).or_default();
                if free.len() >= config.size {
                    Some(conn)
                } else {
                    free.push(conn);
                    None
                }
            }
        };

        if let Some(mut conn) = overflow {
            debug!(addr = addr, conn = conn.id, "pool full or connection expired, closing");
            let _ = conn.socket.close().await;
        }
    }

    /// Number of idle connections for `addr`.
    pub fn idle_count(&self, addr: &str) -> usize {
        self.state.lock().idle.get(addr).map_or(0, Vec::len)
    }

    /// Gets pool-wide statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total_idle: state.idle.values().map(Vec::len).sum(),
            addresses: state.idle.values().filter(|v| !v.is_empty()).count(),
            dialled: self.next_id.load(Ordering::Relaxed),
        }
    }

    /// Closes every idle connection.
    pub async fn close_all(&self) {
        let drained: Vec<PoolConn> = {
            let mut state = self.state.lock();
            state.idle.drain().flat_map(|(_, v)| v).collect()
        };
        for mut conn in drained {
            let _ = conn.socket.close().await;
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::memory::MemoryTransport;
    use crate::transport::Listener;

    async fn serve(transport: &MemoryTransport) -> (String, tokio::sync::mpsc::UnboundedReceiver<Box<dyn Socket>>) {
        let mut listener = transport.listen("pool:0").await.unwrap();
        let addr = listener.addr().to_string();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(sock) = listener.accept().await {
                if tx.send(sock).is_err() {
                    break;
                }
            }
        });
        (addr, rx)
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.size, 1);
        assert_eq!(config.ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_pool_new_empty() {
        let pool = ConnectionPool::default();
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[tokio::test]
    async fn test_reuse_after_clean_release() {
        let transport = MemoryTransport::new();
        let (addr, _accepted) = serve(&transport).await;
        let pool = ConnectionPool::new(PoolConfig::default());

        let conn = pool.get_conn(&addr, &transport, DialOptions::default()).await.unwrap();
        let first = conn.id();
        pool.release(&addr, conn, None).await;
        assert_eq!(pool.idle_count(&addr), 1);

        let again = pool.get_conn(&addr, &transport, DialOptions::default()).await.unwrap();
        assert_eq!(again.id(), first);
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn test_capacity_bounds_idle_list() {
        let transport = MemoryTransport::new();
        let (addr, mut accepted) = serve(&transport).await;
        let pool = ConnectionPool::new(PoolConfig {
            size: 2,
            ttl: Duration::from_secs(60),
        });

        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(pool.get_conn(&addr, &transport, DialOptions::default()).await.unwrap());
        }
        let mut server_side = Vec::new();
        for _ in 0..3 {
            server_side.push(accepted.recv().await.unwrap());
        }

        for conn in conns {
            pool.release(&addr, conn, None).await;
        }
        assert_eq!(pool.idle_count(&addr), 2);
        assert_eq!(pool.stats().dialled, 3);

        // The overflowing connection (released last) was closed.
        let mut third = server_side.pop().unwrap();
        assert!(matches!(third.recv().await, Err(TransportError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_release_with_error_never_reused() {
        let transport = MemoryTransport::new();
        let (addr, _accepted) = serve(&transport).await;
        let pool = ConnectionPool::new(PoolConfig::default());

        let conn = pool.get_conn(&addr, &transport, DialOptions::default()).await.unwrap();
        let broken = conn.id();
        let err = TransportError::ConnectionClosed;
        pool.release(&addr, conn, Some(&err)).await;
        assert_eq!(pool.idle_count(&addr), 0);

        let fresh = pool.get_conn(&addr, &transport, DialOptions::default()).await.unwrap();
        assert_ne!(fresh.id(), broken);
    }

    #[tokio::test]
    async fn test_expired_connection_not_reused() {
        let transport = MemoryTransport::new();
        let (addr, _accepted) = serve(&transport).await;
        let pool = ConnectionPool::new(PoolConfig {
            size: 1,
            ttl: Duration::from_millis(30),
        });

        let conn = pool.get_conn(&addr, &transport, DialOptions::default()).await.unwrap();
        let old = conn.id();
        pool.release(&addr, conn, None).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let fresh = pool.get_conn(&addr, &transport, DialOptions::default()).await.unwrap();
        assert_ne!(fresh.id(), old);
        assert_eq!(pool.idle_count(&addr), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_propagates() {
        let transport = MemoryTransport::new();
        let pool = ConnectionPool::default();
        let err = pool
            .get_conn("nowhere:1", &transport, DialOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    }

    #[tokio::test]
    async fn test_close_all_drains() {
        let transport = MemoryTransport::new();
        let (addr, _accepted) = serve(&transport).await;
        let pool = ConnectionPool::default();
        let conn = pool.get_conn(&addr, &transport, DialOptions::default()).await.unwrap();
        pool.release(&addr, conn, None).await;
        pool.close_all().await;
        assert_eq!(pool.stats().total_idle, 0);
    }
}
