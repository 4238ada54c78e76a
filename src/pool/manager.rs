use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::ShardingNode;
use crate::backend::{BackendError, ConnectionProvider, ResponseHandler};
use crate::config::Config;
use crate::metrics::metrics;
use crate::route::RouteNode;

/// All sharding nodes of the proxy, keyed by name
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, Arc<ShardingNode>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let registry = Self::new();
        for node in &config.nodes {
            registry.add_node(ShardingNode::new(node, &config.pool));
        }
        registry
    }

    pub fn add_node(&self, node: ShardingNode) {
        debug!(node = %node.name(), database = %node.database(), "Added sharding node");
        self.nodes.insert(node.name().to_string(), Arc::new(node));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ShardingNode>> {
        self.nodes.get(name).map(|n| n.value().clone())
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            nodes: self.nodes.len(),
            total_idle_connections: self.nodes.iter().map(|n| n.idle_count()).sum(),
        }
    }

    pub fn close_all(&self) {
        for node in self.nodes.iter() {
            node.close_all();
        }
    }
}

impl ConnectionProvider for NodeRegistry {
    fn get_connection(
        &self,
        node: Arc<RouteNode>,
        tx_started: bool,
        autocommit: bool,
        handler: Arc<dyn ResponseHandler>,
    ) {
        let Some(sharding_node) = self.get(&node.name) else {
            warn!(node = %node.name, "Route to unknown sharding node");
            let err = BackendError::UnknownNode(node.name.clone());
            tokio::spawn(async move { handler.connection_error(err, &node) });
            return;
        };

        tokio::spawn(async move {
            match sharding_node.get_connection(&node, tx_started, autocommit).await {
                Ok(conn) => {
                    metrics().record_backend_connection("acquired");
                    handler.connection_acquired(conn);
                }
                Err(e) => {
                    warn!(node = %node.name, error = %e, "Failed to acquire backend connection");
                    handler.connection_error(e, &node);
                }
            }
        });
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub nodes: usize,
    pub total_idle_connections: usize,
}
