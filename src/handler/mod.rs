//! Response handling for statements routed to a single node

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnection, BackendError, LoadDataResponseHandler, ResponseHandler};
use crate::metrics::metrics;
use crate::protocol::{
    column_type, error_code, status, BinaryRowDataPacket, ErrPacket, FieldPacket, OkPacket, Packet,
    RowDataPacket, MAX_PACKET_SIZE,
};
use crate::route::{RouteNode, RouteResultset};
use crate::session::Session;
use crate::stat::{now_millis, QueryResult};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("route result set has no node")]
    NoRouteNode,
}

/// State written to the client, guarded by the handler lock
#[derive(Debug, Default)]
struct HandlerState {
    /// Sequence id of the last packet assigned
    packet_id: u8,
    /// Result set bytes not yet handed to the client writer
    buffer: Option<BytesMut>,
    field_packets: Vec<FieldPacket>,
}

impl HandlerState {
    fn next_packet_id(&mut self) -> u8 {
        self.packet_id = self.packet_id.wrapping_add(1);
        self.packet_id
    }
}

/// Drives one statement on one backend node and turns the backend's
/// response into the client's response.
///
/// Exactly one terminal packet (final EOF, OK or ERR) reaches the client:
/// whichever path first wins `write_to_client` writes, all later ones
/// only clean up backend state.
pub struct SingleNodeHandler {
    me: Weak<SingleNodeHandler>,
    node: Arc<RouteNode>,
    rrs: Arc<RouteResultset>,
    session: Arc<Session>,
    inner: Mutex<HandlerState>,
    write_to_client: AtomicBool,
    conn_closed: AtomicBool,
    net_out_bytes: AtomicU64,
    result_size: AtomicU64,
    select_rows: AtomicU64,
}

impl SingleNodeHandler {
    pub fn new(rrs: Arc<RouteResultset>, session: Arc<Session>) -> Result<Arc<Self>, HandlerError> {
        let node = rrs.nodes.first().cloned().ok_or(HandlerError::NoRouteNode)?;
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node,
            rrs,
            session,
            inner: Mutex::new(HandlerState::default()),
            write_to_client: AtomicBool::new(false),
            conn_closed: AtomicBool::new(false),
            net_out_bytes: AtomicU64::new(0),
            result_size: AtomicU64::new(0),
            select_rows: AtomicU64::new(0),
        }))
    }

    pub fn node(&self) -> &Arc<RouteNode> {
        &self.node
    }

    /// Whether a terminal packet was written
    pub fn is_complete(&self) -> bool {
        self.write_to_client.load(Ordering::Acquire)
    }

    /// Run on a connection already bound to the session, or request one
    pub fn execute(&self) {
        self.conn_closed.store(false, Ordering::Release);
        let seed = if self.rrs.load_data {
            self.session.load_data_last_packet_id()
        } else {
            self.session.packet_id()
        };
        self.inner.lock().packet_id = seed;
        self.node.set_run_on_slave(self.rrs.run_on_slave);

        if self.session.target_count() > 0 {
            let mut target = self.node.clone();
            let mut conn = self.session.target(&self.node);
            if conn.is_none() && self.rrs.global_table {
                // Read of a global table: any bound backup node holds the same data
                for name in self.rrs.global_backup_nodes.iter().flatten() {
                    let backup = Arc::new(RouteNode::new(
                        name.as_str(),
                        self.rrs.sql_type,
                        self.rrs.statement.as_str(),
                    ));
                    if let Some(found) = self.session.target(&backup) {
                        conn = Some(found);
                        target = backup;
                        break;
                    }
                }
            }
            if self.session.try_exists_con(conn.as_ref(), &target) {
                if let Some(conn) = conn {
                    debug!(session_id = self.session.id, node = %target.name, conn_id = conn.id(), "Reusing bound connection");
                    self.execute_on(conn);
                    return;
                }
            }
        }

        let Some(me) = self.me.upgrade() else {
            return;
        };
        let (tx_started, autocommit) = {
            let state = self.session.state();
            (state.tx_started, state.autocommit)
        };
        self.session
            .context()
            .provider
            .get_connection(self.node.clone(), tx_started, autocommit, me);
    }

    fn execute_on(&self, conn: Arc<dyn BackendConnection>) {
        if self.session.is_closed() {
            debug!(session_id = self.session.id, conn_id = conn.id(), "Session closed before execution");
            self.session.clear_resources(true);
            self.recycle_buffer();
            return;
        }
        if let Some(me) = self.me.upgrade() {
            conn.set_response_handler(Some(me));
        }
        let autocommit = self.session.state().effective_autocommit();
        if !autocommit && self.node.is_modify_sql() {
            self.session.put_txn_log(&self.node.statement);
        }
        conn.execute(&self.node, autocommit);
    }

    /// Rows forwarded to the client so far
    pub fn row_count(&self) -> u64 {
        self.select_rows.load(Ordering::Relaxed)
    }

    /// Give a pending buffer back to the client writer unwritten
    pub fn recycle_buffer(&self) {
        let mut inner = self.inner.lock();
        if let Some(buffer) = inner.buffer.take() {
            self.session.source().recycle(buffer);
        }
    }

    fn count_out(&self, bytes: usize) {
        self.net_out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.result_size.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Failure path shared by acquisition errors, backend errors and closes.
    /// The ERR takes its sequence id only once it has won the terminal write.
    fn back_connection_err(
        &self,
        err: ErrPacket,
        conn: Option<&Arc<dyn BackendConnection>>,
        sync_finished: bool,
    ) {
        let message = format!("errNo:{} {}", err.error_code, err.error_message);
        let capabilities = {
            let state = self.session.state();
            info!(
                session_id = self.session.id,
                conn = ?conn,
                user = %state.username,
                host = %state.host,
                port = state.port,
                error = %message,
                "Execute sql error"
            );
            state.capability_flags
        };

        if let Some(conn) = conn {
            if conn.is_closed() {
                if let Some(node) = conn.attachment() {
                    self.session.remove_target(&node);
                }
            } else if sync_finished {
                self.session.release_connection_if_safe(conn);
            } else {
                conn.close_without_rsp("unfinished sync");
                if let Some(node) = conn.attachment() {
                    self.session.remove_target(&node);
                }
            }
        }

        self.session.set_tx_interrupt(&message);

        let mut inner = self.inner.lock();
        if self
            .write_to_client
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self.rrs.load_data {
            self.session.clear_load_data();
        }
        let packet_id = inner.next_packet_id();
        let source = self.session.source();
        let bytes = err.encode(packet_id, capabilities).to_bytes();
        // Fields already buffered: the client gets them followed by the ERR
        let buffer = inner.buffer.take().unwrap_or_else(|| source.allocate());
        let buffer = source.write_to_buffer(&bytes, buffer);
        self.session.set_response_time(false);
        source.write(buffer);
    }

    /// Intermediate result set of a CALL: flushed without ending the response
    fn flush_call_result(&self, eof: Packet) {
        let mut inner = self.inner.lock();
        let source = self.session.source();
        if self.write_to_client.load(Ordering::Acquire) {
            if let Some(buffer) = inner.buffer.take() {
                source.recycle(buffer);
            }
            return;
        }
        self.count_out(eof.wire_len());
        let seq = inner.next_packet_id();
        let buffer = inner.buffer.take().unwrap_or_else(|| source.allocate());
        let buffer = source.write_to_buffer(&Packet::new(seq, eof.payload).to_bytes(), buffer);
        source.write(buffer);
    }

    fn do_sql_stat(&self) {
        let Some(dispatcher) = self.session.context().statistics.as_ref() else {
            return;
        };
        let user = self.session.state().username.clone();
        debug!(session_id = self.session.id, sql = %self.rrs.statement, "Recording statement statistics");
        dispatcher.dispatch(QueryResult {
            user,
            sql_type: self.rrs.sql_type,
            sql: self.rrs.statement.clone(),
            rows: self.select_rows.load(Ordering::Relaxed),
            net_in_bytes: self.rrs.statement.len() as u64,
            net_out_bytes: self.net_out_bytes.load(Ordering::Relaxed),
            start_time: self.session.query_start_time(),
            end_time: now_millis(),
            result_size: self.result_size.load(Ordering::Relaxed),
        });
    }
}

impl ResponseHandler for SingleNodeHandler {
    fn connection_acquired(&self, conn: Arc<dyn BackendConnection>) {
        self.session.bind_connection(self.node.clone(), conn.clone());
        self.execute_on(conn);
    }

    fn connection_error(&self, err: BackendError, node: &RouteNode) {
        let message = format!("can't connect to shardingNode[{}], due to {}", node.name, err);
        warn!(session_id = self.session.id, node = %node.name, error = %err, "{}", message);
        metrics().record_query_error("connect");
        self.back_connection_err(
            ErrPacket::new(error_code::ER_DB_INSTANCE_ABORTING_CONNECTION, "HY000", &message),
            None,
            false,
        );
    }

    fn error_response(&self, err: Packet, conn: &Arc<dyn BackendConnection>) {
        self.net_out_bytes.fetch_add(err.wire_len() as u64, Ordering::Relaxed);
        let parsed = ErrPacket::parse(&err.payload).unwrap_or_else(|| {
            ErrPacket::new(error_code::ER_HANDLE_DATA, "HY000", "malformed error packet from backend")
        });
        metrics().record_query_error("backend");
        self.back_connection_err(parsed, Some(conn), conn.sync_and_execute());
        self.session.reset_multi_statement_status();
    }

    fn ok_response(&self, ok: Packet, conn: &Arc<dyn BackendConnection>) {
        self.net_out_bytes.fetch_add(ok.wire_len() as u64, Ordering::Relaxed);
        // Answers to session sync commands are not the statement's result
        if !conn.sync_and_execute() {
            return;
        }
        self.result_size.fetch_add(ok.wire_len() as u64, Ordering::Relaxed);

        let mut packet = match OkPacket::parse(&ok.payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(session_id = self.session.id, conn_id = conn.id(), error = %e, "Malformed OK packet");
                conn.close(&format!("malformed OK packet: {e}"));
                return;
            }
        };

        self.session.set_row_count(packet.affected_rows);
        packet.message = None;
        let (autocommit, capabilities) = {
            let state = self.session.state();
            (state.autocommit, state.capability_flags)
        };
        packet.status_flags = if autocommit {
            status::SERVER_STATUS_AUTOCOMMIT
        } else {
            status::SERVER_STATUS_IN_TRANS
        };
        self.session.set_last_insert_id(packet.last_insert_id);
        self.session.set_backend_response_end_time(conn);
        self.session.release_connection_if_safe(conn);

        let more = {
            let mut inner = self.inner.lock();
            // A procedure's trailing OK always ends its response
            let won = self
                .write_to_client
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if !won && !self.rrs.call_statement {
                return;
            }
            let packet_id = if self.rrs.load_data {
                let id = self.session.load_data_last_packet_id().wrapping_add(1);
                self.session.clear_load_data();
                inner.packet_id = id;
                id
            } else {
                inner.next_packet_id()
            };
            self.session.multi_statement_ok(&mut packet, packet_id);
            let source = self.session.source();
            let bytes = packet.encode(packet_id, capabilities).to_bytes();
            let buffer = inner.buffer.take().unwrap_or_else(|| source.allocate());
            source.write(source.write_to_buffer(&bytes, buffer));
            self.session.is_multi_statement()
        };

        self.session.set_response_time(true);
        self.do_sql_stat();
        self.session.multi_statement_next_sql(more);
    }

    fn field_eof_response(
        &self,
        header: Packet,
        fields: Vec<Packet>,
        eof: Packet,
        _conn: &Arc<dyn BackendConnection>,
    ) {
        let source = self.session.source();
        let mut inner = self.inner.lock();
        if self.write_to_client.load(Ordering::Acquire) {
            return;
        }
        let size = header.wire_len() + fields.iter().map(Packet::wire_len).sum::<usize>() + eof.wire_len();
        self.count_out(size);

        let mut buffer = inner.buffer.take().unwrap_or_else(|| source.allocate());
        let seq = inner.next_packet_id();
        buffer = source.write_to_buffer(&Packet::new(seq, header.payload).to_bytes(), buffer);

        inner.field_packets.clear();
        for field in fields {
            let seq = inner.next_packet_id();
            match FieldPacket::parse(&field.payload) {
                Ok(mut field_packet) => {
                    if let Some(schema) = &self.rrs.schema {
                        field_packet.set_db(schema);
                    }
                    if let Some(alias) = &self.rrs.table_alias {
                        field_packet.set_table(alias);
                    }
                    if let Some(table) = &self.rrs.table {
                        field_packet.set_org_table(table);
                    }
                    buffer = source.write_to_buffer(&field_packet.encode(seq).to_bytes(), buffer);
                    inner.field_packets.push(field_packet);
                }
                Err(e) => {
                    warn!(session_id = self.session.id, error = %e, "Unreadable column definition, forwarding as is");
                    buffer = source.write_to_buffer(&Packet::new(seq, field.payload).to_bytes(), buffer);
                    inner.field_packets.push(FieldPacket::new("", column_type::VAR_STRING));
                }
            }
        }

        let seq = inner.next_packet_id();
        buffer = source.write_to_buffer(&Packet::new(seq, eof.payload).to_bytes(), buffer);
        inner.buffer = Some(buffer);
    }

    fn row_response(&self, row: Packet, conn: &Arc<dyn BackendConnection>) -> bool {
        let malformed = {
            let mut inner = self.inner.lock();
            if self.write_to_client.load(Ordering::Acquire) {
                return false;
            }
            let row_len = row.wire_len();
            let source = self.session.source();
            if self.session.context().flow_control.should_pause(source.write_queue_len()) {
                source.start_flow_control(conn.clone());
            }

            let buffer = inner.buffer.take().unwrap_or_else(|| source.allocate());
            let mut malformed = None;
            let buffer = if self.session.is_prepared() {
                match RowDataPacket::parse(&row.payload, inner.field_packets.len()) {
                    Ok(text) => {
                        let seq = inner.next_packet_id();
                        let binary = BinaryRowDataPacket::from_text(&inner.field_packets, &text);
                        let buffer = self.session.write_row_to_buffer(&binary.encode(seq), buffer);
                        inner.packet_id = self.session.packet_id();
                        buffer
                    }
                    Err(e) => {
                        malformed = Some(e);
                        buffer
                    }
                }
            } else if row.payload.len() >= MAX_PACKET_SIZE {
                let buffer = self
                    .session
                    .write_big_packet_to_buffer(row.payload, buffer, inner.packet_id);
                inner.packet_id = self.session.packet_id();
                buffer
            } else {
                let seq = inner.next_packet_id();
                source.write_to_buffer(&Packet::new(seq, row.payload).to_bytes(), buffer)
            };
            inner.buffer = Some(buffer);
            if malformed.is_none() {
                self.count_out(row_len);
                self.select_rows.fetch_add(1, Ordering::Relaxed);
            }
            malformed
        };

        if let Some(e) = malformed {
            warn!(session_id = self.session.id, conn_id = conn.id(), error = %e, "Malformed row");
            conn.close(&format!("malformed row: {e}"));
        }
        false
    }

    fn row_eof_response(&self, eof: Packet, conn: &Arc<dyn BackendConnection>) {
        if self.rrs.call_statement {
            // The procedure's trailing OK ends the response
            self.flush_call_result(eof);
            return;
        }

        self.session.release_connection_if_safe(conn);

        let more = {
            let mut inner = self.inner.lock();
            if self
                .write_to_client
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            self.count_out(eof.wire_len());
            let packet_id = inner.next_packet_id();
            let mut eof = Packet::new(packet_id, eof.payload);
            self.session.multi_statement_eof(&mut eof, packet_id);
            let source = self.session.source();
            let buffer = inner.buffer.take().unwrap_or_else(|| source.allocate());
            source.write(source.write_to_buffer(&eof.to_bytes(), buffer));
            self.session.is_multi_statement()
        };

        self.session.set_response_time(true);
        self.do_sql_stat();
        self.session.multi_statement_next_sql(more);
    }

    fn connection_close(&self, conn: &Arc<dyn BackendConnection>, reason: &str) {
        if self.conn_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(session_id = self.session.id, conn = ?conn, reason = %reason, "Backend connection closed");
        let message = format!(
            "Connection {{dbInstance[{}:{}],Schema[{}],threadID[{}]}} was closed ,reason is [{}]",
            conn.host(),
            conn.port(),
            conn.schema(),
            conn.thread_id(),
            reason
        );
        metrics().record_query_error("closed");
        self.back_connection_err(
            ErrPacket::new(error_code::ER_ERROR_ON_CLOSE, "HY000", &message),
            Some(conn),
            true,
        );
    }

    fn as_load_data(&self) -> Option<&dyn LoadDataResponseHandler> {
        Some(self)
    }
}

impl LoadDataResponseHandler for SingleNodeHandler {
    fn request_data_response(&self, request: Packet, conn: &Arc<dyn BackendConnection>) {
        self.session.request_file_data(&request, conn);
    }
}

impl fmt::Display for SingleNodeHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SingleNodeHandler [node={}, packetId={}]",
            self.node,
            self.inner.lock().packet_id
        )
    }
}
