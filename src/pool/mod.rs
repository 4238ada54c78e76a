mod instance;
mod manager;
mod node;

pub use instance::ConnectionPool;
pub use manager::{NodeRegistry, PoolStats};
pub use node::ShardingNode;
