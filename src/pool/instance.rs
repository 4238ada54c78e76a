use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{BackendConnection, BackendError, MySqlConnection};
use crate::config::{BackendConfig, PoolConfig};

/// Idle connection pool for one backend instance and database
///
/// Connections are borrowed for a statement (or a transaction) and come
/// back through [`BackendConnection::release`].
pub struct ConnectionPool {
    me: Weak<ConnectionPool>,
    config: PoolConfig,
    backend: BackendConfig,
    database: String,
    from_slave: bool,
    idle: Mutex<VecDeque<Arc<MySqlConnection>>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        backend: BackendConfig,
        database: impl Into<String>,
        from_slave: bool,
        config: PoolConfig,
    ) -> Arc<Self> {
        let database = database.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            backend,
            database,
            from_slave,
            idle: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Get a connection from the pool
    ///
    /// Returns an idle connection if available, otherwise creates a new one.
    pub async fn get(&self) -> Result<Arc<MySqlConnection>, BackendError> {
        while let Some(conn) = self.pop_idle() {
            if conn.is_closed() {
                continue;
            }
            if conn.is_expired(self.config.max_age()) {
                debug!(conn_id = conn.id(), "Connection expired, discarding");
                conn.close_without_rsp("max age exceeded");
                continue;
            }
            if conn.is_idle_too_long(self.config.max_idle_time()) {
                debug!(conn_id = conn.id(), "Connection idle too long, discarding");
                conn.close_without_rsp("idle timeout");
                continue;
            }

            conn.touch();
            debug!(conn_id = conn.id(), addr = %self.addr(), "Reusing idle connection");
            return Ok(conn);
        }

        debug!(addr = %self.addr(), database = %self.database, "Creating new connection");
        MySqlConnection::connect(&self.backend, &self.database, self.from_slave, self.me.clone()).await
    }

    fn pop_idle(&self) -> Option<Arc<MySqlConnection>> {
        self.idle.lock().pop_front()
    }

    /// Return a connection to the pool
    ///
    /// If the pool is full or closed, the connection is closed instead.
    pub(crate) fn put(&self, conn: Arc<MySqlConnection>) {
        if conn.is_closed() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            conn.close_without_rsp("pool closed");
            return;
        }
        if conn.is_expired(self.config.max_age()) {
            debug!(conn_id = conn.id(), "Connection expired, discarding");
            conn.close_without_rsp("max age exceeded");
            return;
        }

        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle {
            drop(idle);
            debug!(conn_id = conn.id(), "Pool full, discarding connection");
            conn.close_without_rsp("pool full");
            return;
        }
        idle.push_back(conn);
        debug!(idle_count = idle.len(), addr = %self.addr(), "Returned connection to pool");
    }

    /// Get current number of idle connections
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn is_slave(&self) -> bool {
        self.from_slave
    }

    /// Close all idle connections and refuse returns
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        for conn in drained {
            conn.close_without_rsp("pool closed");
        }
        debug!(addr = %self.addr(), "Closed all idle connections");
    }

    /// Get backend address (host:port) for this pool
    pub fn addr(&self) -> String {
        self.backend.addr()
    }
}
