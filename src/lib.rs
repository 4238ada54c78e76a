//! Single-node response handling for a MySQL sharding proxy

pub mod backend;
pub mod config;
pub mod flow;
pub mod frontend;
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod route;
pub mod session;
pub mod stat;

#[cfg(test)]
pub(crate) mod testing;
