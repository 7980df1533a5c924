//! # Connection Pool
//!
//! Purpose: Reuse store connections across one-shot operations to reduce
//! handshake latency and allocation churn.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a free list of idle connections.
//! 2. **Never Wait**: A miss creates a new connection instead of blocking for
//!    capacity. The connection count is unbounded under sustained load; this
//!    bounds latency, not memory.
//! 3. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 4. **Retry on Reuse**: A connection that failed to connect is still
//!    returned to the pool; the next `acquire` tries to connect it once more.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::ClientConfig;
use crate::connection::Connection;

struct PoolInner {
    config: ClientConfig,
    idle: Mutex<Vec<Connection>>,
    created: AtomicUsize,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool for the provided endpoint.
    pub fn new(config: ClientConfig) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                idle: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Takes an idle connection or creates a new one.
    ///
    /// The returned connection may have no live session when the store is
    /// unreachable; check `Connection::is_connected` before relying on it.
    pub fn acquire(&self) -> Connection {
        let idle = self.inner.idle.lock().pop();
        match idle {
            Some(mut conn) => {
                if !conn.is_connected() {
                    if let Err(err) = conn.reconnect() {
                        debug!(error = %err, "pooled connection still unreachable");
                    }
                }
                conn
            }
            None => {
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                let (conn, _) = Connection::open(self.inner.config.clone());
                conn
            }
        }
    }

    /// Returns a connection to the idle list, connected or not.
    pub fn release(&self, conn: Connection) {
        self.inner.idle.lock().push(conn);
    }

    /// Number of idle connections.
    pub fn idle_len(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of connections this pool has ever created.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// Sends QUIT on every idle connection and drops them.
    ///
    /// Returns how many connections were closed.
    pub fn close_idle(&self) -> usize {
        let drained = std::mem::take(&mut *self.inner.idle.lock());
        let count = drained.len();
        for mut conn in drained {
            conn.quit();
        }
        count
    }
}
