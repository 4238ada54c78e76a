use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::ConnectionPool;
use crate::backend::{BackendError, MySqlConnection};
use crate::config::{PoolConfig, ShardingNodeConfig};
use crate::route::{RouteNode, SqlType};

/// A sharding node: one database on a master, with optional read replicas
pub struct ShardingNode {
    name: String,
    database: String,
    master: Arc<ConnectionPool>,
    slaves: Vec<Arc<ConnectionPool>>,
    counter: AtomicUsize,
}

impl ShardingNode {
    pub fn new(config: &ShardingNodeConfig, pool_config: &PoolConfig) -> Self {
        let master = ConnectionPool::new(
            config.master.clone(),
            config.database.clone(),
            false,
            pool_config.clone(),
        );
        let slaves = config
            .slaves
            .iter()
            .map(|slave| {
                ConnectionPool::new(slave.clone(), config.database.clone(), true, pool_config.clone())
            })
            .collect();

        Self {
            name: config.name.clone(),
            database: config.database.clone(),
            master,
            slaves,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Choose the pool serving `node`.
    ///
    /// Anything inside a transaction goes to the master. Otherwise an explicit
    /// slave hint, or a plain read without a hint, goes to a replica picked
    /// round-robin.
    pub fn select_pool(&self, node: &RouteNode, tx_started: bool, autocommit: bool) -> &Arc<ConnectionPool> {
        if tx_started || !autocommit || self.slaves.is_empty() {
            return &self.master;
        }
        let wants_slave = match node.run_on_slave() {
            Some(hint) => hint,
            None => node.sql_type == SqlType::Select,
        };
        if !wants_slave {
            return &self.master;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.slaves.len();
        &self.slaves[idx]
    }

    pub async fn get_connection(
        &self,
        node: &RouteNode,
        tx_started: bool,
        autocommit: bool,
    ) -> Result<Arc<MySqlConnection>, BackendError> {
        let pool = self.select_pool(node, tx_started, autocommit);
        debug!(
            node = %self.name,
            addr = %pool.addr(),
            slave = pool.is_slave(),
            "Acquiring backend connection"
        );
        pool.get().await
    }

    pub fn idle_count(&self) -> usize {
        self.master.idle_count() + self.slaves.iter().map(|p| p.idle_count()).sum::<usize>()
    }

    pub fn close_all(&self) {
        self.master.close_all();
        for slave in &self.slaves {
            slave.close_all();
        }
    }
}
