//! Completed-query statistics

mod collector;

pub use collector::{SqlStatCollector, StatDispatcher, UserStat};

use std::time::{SystemTime, UNIX_EPOCH};

use crate::route::SqlType;

/// One finished statement, as reported by a response handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub user: String,
    pub sql_type: SqlType,
    pub sql: String,
    /// Rows returned to the client
    pub rows: u64,
    /// Statement length in bytes
    pub net_in_bytes: u64,
    /// Bytes received from the backend
    pub net_out_bytes: u64,
    /// Epoch milliseconds
    pub start_time: u64,
    pub end_time: u64,
    pub result_size: u64,
}

impl QueryResult {
    pub fn duration_ms(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

/// Sink for [`QueryResult`]s. Must not block the caller.
pub trait QueryResultDispatcher: Send + Sync {
    fn dispatch(&self, result: QueryResult);
}

/// Current wall clock in epoch milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
