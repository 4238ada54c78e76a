mod load_data;
mod state;
mod txn_log;

pub use load_data::{LoadDataContext, DEFAULT_CHUNK_SIZE};
pub use state::ClientState;
pub use txn_log::TxnLog;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::backend::{BackendConnection, ConnectionProvider};
use crate::flow::FlowControlConfig;
use crate::frontend::FrontendConnection;
use crate::handler::{HandlerError, SingleNodeHandler};
use crate::protocol::{status, OkPacket, Packet};
use crate::route::{RouteNode, RouteResultset, SqlType};
use crate::stat::{now_millis, QueryResultDispatcher};

/// Statements kept in the transaction log
const TXN_LOG_LIMIT: usize = 1024;

/// Shared proxy services a session hands to its handlers
#[derive(Clone)]
pub struct ProxyContext {
    pub provider: Arc<dyn ConnectionProvider>,
    pub flow_control: FlowControlConfig,
    /// `None` when statistics are disabled
    pub statistics: Option<Arc<dyn QueryResultDispatcher>>,
}

#[derive(Debug, Default)]
struct MultiStatement {
    active: bool,
    pending: VecDeque<String>,
}

#[derive(Debug)]
struct Timing {
    query_start: Instant,
    query_start_ms: u64,
    backend_end: Option<Instant>,
    response: Option<(Duration, bool)>,
}

/// One client connection's execution state.
///
/// Holds the route node to backend connection bindings of the current
/// request. A binding is released by whoever removes it from the map, so a
/// connection goes back to its pool at most once.
pub struct Session {
    /// Unique session ID
    pub id: u32,
    source: Arc<dyn FrontendConnection>,
    context: ProxyContext,
    state: Mutex<ClientState>,
    targets: DashMap<Arc<RouteNode>, Arc<dyn BackendConnection>>,
    /// Sequence id of the last packet written to the client
    packet_id: AtomicU8,
    closed: AtomicBool,
    /// Binary protocol result rows
    prepared: AtomicBool,
    row_count: AtomicU64,
    multi: Mutex<MultiStatement>,
    continuation: mpsc::UnboundedSender<String>,
    continuation_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    load_data: Mutex<Option<LoadDataContext>>,
    txn_log: Mutex<TxnLog>,
    timing: Mutex<Timing>,
}

impl Session {
    pub fn new(
        id: u32,
        source: Arc<dyn FrontendConnection>,
        context: ProxyContext,
        state: ClientState,
    ) -> Arc<Self> {
        let (continuation, continuation_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            source,
            context,
            state: Mutex::new(state),
            targets: DashMap::new(),
            packet_id: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            row_count: AtomicU64::new(0),
            multi: Mutex::new(MultiStatement::default()),
            continuation,
            continuation_rx: Mutex::new(Some(continuation_rx)),
            load_data: Mutex::new(None),
            txn_log: Mutex::new(TxnLog::with_limit(TXN_LOG_LIMIT)),
            timing: Mutex::new(Timing {
                query_start: Instant::now(),
                query_start_ms: now_millis(),
                backend_end: None,
                response: None,
            }),
        })
    }

    /// Run a statement routed to a single node
    pub fn execute(self: &Arc<Self>, rrs: RouteResultset) -> Result<Arc<SingleNodeHandler>, HandlerError> {
        self.start_query();
        let handler = SingleNodeHandler::new(Arc::new(rrs), self.clone())?;
        handler.execute();
        Ok(handler)
    }

    pub fn source(&self) -> &Arc<dyn FrontendConnection> {
        &self.source
    }

    pub fn context(&self) -> &ProxyContext {
        &self.context
    }

    pub fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock()
    }

    /// Close from the client side; bound backend connections are dropped
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session_id = self.id, reason = %reason, "Session closed");
        self.clear_resources(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn packet_id(&self) -> u8 {
        self.packet_id.load(Ordering::Acquire)
    }

    pub fn set_packet_id(&self, packet_id: u8) {
        self.packet_id.store(packet_id, Ordering::Release);
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    pub fn set_prepared(&self, prepared: bool) {
        self.prepared.store(prepared, Ordering::Release);
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Acquire)
    }

    pub fn set_row_count(&self, rows: u64) {
        self.row_count.store(rows, Ordering::Release);
    }

    pub fn set_last_insert_id(&self, id: u64) {
        self.state.lock().last_insert_id = id;
    }

    pub fn set_tx_interrupt(&self, message: &str) {
        let mut state = self.state.lock();
        if state.tx_started || !state.autocommit {
            state.tx_interrupt = Some(message.to_string());
        }
    }

    pub fn put_txn_log(&self, statement: &str) {
        self.txn_log.lock().push(statement);
    }

    pub fn txn_log(&self) -> MutexGuard<'_, TxnLog> {
        self.txn_log.lock()
    }

    // Connection bindings

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn target(&self, node: &RouteNode) -> Option<Arc<dyn BackendConnection>> {
        self.targets.get(node).map(|c| c.value().clone())
    }

    pub fn bind_connection(&self, node: Arc<RouteNode>, conn: Arc<dyn BackendConnection>) {
        debug!(session_id = self.id, node = %node.name, conn_id = conn.id(), "Bound backend connection");
        conn.set_attachment(Some(node.clone()));
        self.targets.insert(node, conn);
    }

    /// Drop a binding without touching the connection
    pub fn remove_target(&self, node: &RouteNode) -> Option<Arc<dyn BackendConnection>> {
        self.targets.remove(node).map(|(_, conn)| conn)
    }

    /// Whether the bound `conn` may serve `node`. A connection that cannot
    /// is unbound (and released when still open).
    pub fn try_exists_con(&self, conn: Option<&Arc<dyn BackendConnection>>, node: &RouteNode) -> bool {
        let Some(conn) = conn else {
            return false;
        };
        if conn.is_closed() {
            if let Some(stale) = conn.attachment() {
                self.remove_target(&stale);
            }
            return false;
        }
        if !conn.is_from_slave() {
            return true;
        }

        let autocommit = self.state.lock().autocommit;
        let slave_ok = node.sql_type == SqlType::Select && autocommit && node.run_on_slave() != Some(false);
        if slave_ok {
            return true;
        }
        debug!(session_id = self.id, node = %node.name, conn_id = conn.id(), "Slave connection not reusable, releasing");
        if let Some(bound) = conn.attachment() {
            self.release_connection(&bound);
        }
        false
    }

    /// Release `conn` unless the client transaction still needs it
    pub fn release_connection_if_safe(&self, conn: &Arc<dyn BackendConnection>) {
        let Some(node) = conn.attachment() else {
            return;
        };
        let safe = {
            let state = self.state.lock();
            (state.autocommit || conn.is_from_slave()) && !state.tx_started
        };
        if safe {
            self.release_connection(&node);
        }
    }

    /// Unbind `node` and return its connection to the pool
    pub fn release_connection(&self, node: &RouteNode) {
        let Some(conn) = self.remove_target(node) else {
            return;
        };
        if conn.is_closed() {
            return;
        }
        debug!(session_id = self.id, node = %node.name, conn_id = conn.id(), "Releasing backend connection");
        conn.release();
    }

    /// Drop every binding. With `need_rollback` connections are closed,
    /// otherwise returned to their pools.
    pub fn clear_resources(&self, need_rollback: bool) {
        let nodes: Vec<Arc<RouteNode>> = self.targets.iter().map(|e| e.key().clone()).collect();
        for node in nodes {
            let Some(conn) = self.remove_target(&node) else {
                continue;
            };
            if conn.is_closed() {
                continue;
            }
            if need_rollback {
                conn.close_without_rsp("session closed");
            } else {
                conn.release();
            }
        }
        self.reset_multi_statement_status();
        self.clear_load_data();
    }

    // Client writes

    /// Append `packet`, split when oversized. The session counter becomes
    /// the sequence id of the last frame.
    pub fn write_row_to_buffer(&self, packet: &Packet, buffer: BytesMut) -> BytesMut {
        let mut encoded = BytesMut::with_capacity(packet.wire_len());
        let last = packet.encode_split(&mut encoded);
        self.set_packet_id(last);
        self.source.write_to_buffer(&encoded, buffer)
    }

    /// Append an oversized payload whose frames follow `packet_id`
    pub fn write_big_packet_to_buffer(&self, payload: Bytes, buffer: BytesMut, packet_id: u8) -> BytesMut {
        self.write_row_to_buffer(&Packet::new(packet_id.wrapping_add(1), payload), buffer)
    }

    /// Write a single packet straight to the client
    pub fn write_packet(&self, packet: &Packet) {
        let buffer = self.source.write_to_buffer(&packet.to_bytes(), self.source.allocate());
        self.source.write(buffer);
    }

    // Multi statements

    /// Statements of the same client request still to run after the current one
    pub fn set_pending_statements(&self, statements: impl IntoIterator<Item = String>) {
        let mut multi = self.multi.lock();
        multi.pending = statements.into_iter().collect();
        multi.active = !multi.pending.is_empty();
    }

    pub fn is_multi_statement(&self) -> bool {
        self.multi.lock().active
    }

    /// Mark an OK that has more results behind it
    pub fn multi_statement_ok(&self, ok: &mut OkPacket, packet_id: u8) {
        if self.is_multi_statement() {
            ok.status_flags |= status::SERVER_MORE_RESULTS_EXISTS;
            self.set_packet_id(packet_id);
        }
    }

    /// Mark a trailing EOF that has more results behind it
    pub fn multi_statement_eof(&self, eof: &mut Packet, packet_id: u8) {
        if self.is_multi_statement() {
            if eof.payload.len() >= 5 {
                let mut payload = BytesMut::from(&eof.payload[..]);
                payload[3] |= status::SERVER_MORE_RESULTS_EXISTS as u8;
                eof.payload = payload.freeze();
            }
            self.set_packet_id(packet_id);
        }
    }

    /// Hand the next pending statement to the session driver when
    /// `more` was set for the statement that just completed
    pub fn multi_statement_next_sql(&self, more: bool) {
        if !more {
            return;
        }
        let next = {
            let mut multi = self.multi.lock();
            let next = multi.pending.pop_front();
            multi.active = !multi.pending.is_empty();
            next
        };
        if let Some(sql) = next {
            debug!(session_id = self.id, sql = %sql, "Continuing multi statement");
            if self.continuation.send(sql).is_err() {
                debug!(session_id = self.id, "No driver for multi statement continuation");
            }
        }
    }

    pub fn reset_multi_statement_status(&self) {
        let mut multi = self.multi.lock();
        multi.active = false;
        multi.pending.clear();
    }

    /// Receiver for statements continuing a multi statement request.
    /// Only the first call gets it.
    pub fn take_continuations(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.continuation_rx.lock().take()
    }

    // Load data

    pub fn set_load_data(&self, ctx: LoadDataContext) {
        *self.load_data.lock() = Some(ctx);
    }

    pub fn load_data_last_packet_id(&self) -> u8 {
        self.load_data
            .lock()
            .as_ref()
            .map(|ctx| ctx.last_packet_id)
            .unwrap_or_else(|| self.packet_id())
    }

    pub fn clear_load_data(&self) {
        self.load_data.lock().take();
    }

    /// Serve a backend's LOAD DATA LOCAL file request
    pub fn request_file_data(&self, request: &Packet, conn: &Arc<dyn BackendConnection>) {
        let ctx = self.load_data.lock().clone();
        match ctx {
            Some(ctx) => ctx.stream_to(request, conn),
            None => {
                debug!(session_id = self.id, conn_id = conn.id(), "No load data buffered, sending empty file");
                load_data::reject_file_request(request, conn);
            }
        }
    }

    // Timing

    fn start_query(&self) {
        let mut timing = self.timing.lock();
        timing.query_start = Instant::now();
        timing.query_start_ms = now_millis();
        timing.backend_end = None;
        timing.response = None;
    }

    /// Epoch milliseconds the current statement started at
    pub fn query_start_time(&self) -> u64 {
        self.timing.lock().query_start_ms
    }

    pub fn set_backend_response_end_time(&self, conn: &Arc<dyn BackendConnection>) {
        let mut timing = self.timing.lock();
        let now = Instant::now();
        timing.backend_end = Some(now);
        tracing::trace!(
            session_id = self.id,
            conn_id = conn.id(),
            backend_ms = now.duration_since(timing.query_start).as_millis() as u64,
            "Backend response complete"
        );
    }

    pub fn set_response_time(&self, success: bool) {
        let mut timing = self.timing.lock();
        let elapsed = timing.query_start.elapsed();
        timing.response = Some((elapsed, success));
        debug!(session_id = self.id, elapsed_ms = elapsed.as_millis() as u64, success, "Response complete");
    }

    /// Duration and outcome of the last completed response
    pub fn last_response(&self) -> Option<(Duration, bool)> {
        self.timing.lock().response
    }
}
