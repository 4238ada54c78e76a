use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{QueryResult, QueryResultDispatcher};
use crate::metrics::metrics;

/// Aggregated statement counters for one user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserStat {
    pub queries: u64,
    pub rows: u64,
    pub net_in_bytes: u64,
    pub net_out_bytes: u64,
    pub total_time_ms: u64,
    pub max_time_ms: u64,
}

impl UserStat {
    fn add(&mut self, result: &QueryResult) {
        let elapsed = result.duration_ms();
        self.queries += 1;
        self.rows += result.rows;
        self.net_in_bytes += result.net_in_bytes;
        self.net_out_bytes += result.net_out_bytes;
        self.total_time_ms += elapsed;
        self.max_time_ms = self.max_time_ms.max(elapsed);
    }
}

/// Per-user aggregation of completed statements
#[derive(Debug, Default)]
pub struct SqlStatCollector {
    users: DashMap<String, UserStat>,
}

impl SqlStatCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &QueryResult) {
        trace!(user = %result.user, sql = %result.sql, "Recording statement");
        self.users
            .entry(result.user.clone())
            .or_default()
            .add(result);

        metrics().record_query(
            result.sql_type.as_str(),
            &result.user,
            result.duration_ms() as f64 / 1000.0,
            result.rows,
            result.result_size,
        );
    }

    pub fn user_stat(&self, user: &str) -> Option<UserStat> {
        self.users.get(user).map(|s| s.value().clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

/// Queues results onto a background task that feeds a [`SqlStatCollector`]
pub struct StatDispatcher {
    tx: mpsc::UnboundedSender<QueryResult>,
    collector: Arc<SqlStatCollector>,
}

impl StatDispatcher {
    /// Start the collector task
    pub fn spawn() -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueryResult>();
        let collector = Arc::new(SqlStatCollector::new());

        let sink = collector.clone();
        tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                sink.record(&result);
            }
            debug!("Statistics collector stopped");
        });

        Arc::new(Self { tx, collector })
    }

    pub fn collector(&self) -> &Arc<SqlStatCollector> {
        &self.collector
    }
}

impl QueryResultDispatcher for StatDispatcher {
    fn dispatch(&self, result: QueryResult) {
        if self.tx.send(result).is_err() {
            debug!("Statistics collector gone, dropping query result");
        }
    }
}
