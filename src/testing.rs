//! In-process doubles for the backend, the client writer, statistics and
//! connection acquisition

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use crate::backend::{
    dispatch, BackendConnection, BackendError, ConnectionProvider, ResponseEvent, ResponseHandler,
};
use crate::flow::FlowControlConfig;
use crate::frontend::FrontendConnection;
use crate::protocol::{lenenc, FieldPacket, OkPacket, Packet};
use crate::route::RouteNode;
use crate::session::{ClientState, ProxyContext, Session};
use crate::stat::{QueryResult, QueryResultDispatcher};

type ReleaseHook = Box<dyn FnOnce(&Arc<dyn BackendConnection>) + Send>;

/// Backend connection that records what the handler asks of it
pub struct MockBackend {
    id: u64,
    me: Weak<MockBackend>,
    from_slave: bool,
    sync_commands: AtomicI32,
    pending_sync: AtomicI32,
    closed: AtomicBool,
    read_enabled: AtomicBool,
    released: AtomicUsize,
    close_reason: Mutex<Option<String>>,
    executed: Mutex<Vec<(String, bool)>>,
    written: Mutex<Vec<Packet>>,
    attachment: Mutex<Option<Arc<RouteNode>>>,
    handler: Mutex<Option<Arc<dyn ResponseHandler>>>,
    release_hook: Mutex<Option<ReleaseHook>>,
}

impl MockBackend {
    pub fn new(id: u64) -> Arc<Self> {
        Self::build(id, false)
    }

    pub fn slave(id: u64) -> Arc<Self> {
        Self::build(id, true)
    }

    fn build(id: u64, from_slave: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            me: me.clone(),
            from_slave,
            sync_commands: AtomicI32::new(0),
            pending_sync: AtomicI32::new(0),
            closed: AtomicBool::new(false),
            read_enabled: AtomicBool::new(true),
            released: AtomicUsize::new(0),
            close_reason: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            attachment: Mutex::new(None),
            handler: Mutex::new(None),
            release_hook: Mutex::new(None),
        })
    }

    /// Run `hook` the next time the connection is released, as another
    /// thread's callback landing at that moment would
    pub fn on_release(&self, hook: impl FnOnce(&Arc<dyn BackendConnection>) + Send + 'static) {
        *self.release_hook.lock() = Some(Box::new(hook));
    }

    /// Answer `count` session sync commands ahead of every statement
    pub fn with_sync_commands(self: Arc<Self>, count: i32) -> Arc<Self> {
        self.sync_commands.store(count, Ordering::Release);
        self
    }

    fn as_dyn(&self) -> Arc<dyn BackendConnection> {
        let me = self.me.upgrade().expect("mock backend dropped");
        me
    }

    /// Deliver a response event to the installed handler
    pub fn respond(&self, event: ResponseEvent) -> bool {
        let handler = self.handler.lock().clone().expect("no response handler installed");
        dispatch(handler.as_ref(), event, &self.as_dyn())
    }

    pub fn ok(&self, affected_rows: u64, last_insert_id: u64) {
        self.respond(ResponseEvent::Ok(ok_packet(1, affected_rows, last_insert_id)));
    }

    pub fn error(&self, code: u16, message: &str) {
        self.respond(ResponseEvent::Error(err_packet(1, code, message)));
    }

    /// Send a result set header, column definitions and EOF
    pub fn fields(&self, names: &[&str]) {
        let mut seq = 1u8;
        let header = Packet::new(seq, vec![names.len() as u8]);
        let fields = names
            .iter()
            .map(|name| {
                seq += 1;
                FieldPacket::new(name, crate::protocol::column_type::VAR_STRING).encode(seq)
            })
            .collect();
        seq += 1;
        self.respond(ResponseEvent::FieldEof {
            header,
            fields,
            eof: eof_packet(seq, 0x0002),
        });
    }

    pub fn row(&self, values: &[Option<&str>]) -> bool {
        self.respond(ResponseEvent::Row(text_row(0, values)))
    }

    pub fn row_eof(&self, status_flags: u16) {
        self.respond(ResponseEvent::RowEof(eof_packet(0, status_flags)));
    }

    pub fn handler(&self) -> Option<Arc<dyn ResponseHandler>> {
        self.handler.lock().clone()
    }

    pub fn executed(&self) -> Vec<(String, bool)> {
        self.executed.lock().clone()
    }

    pub fn written_packets(&self) -> Vec<Packet> {
        self.written.lock().clone()
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    pub fn read_enabled(&self) -> bool {
        self.read_enabled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend").field("id", &self.id).finish()
    }
}

impl BackendConnection for MockBackend {
    fn id(&self) -> u64 {
        self.id
    }

    fn host(&self) -> &str {
        "127.0.0.1"
    }

    fn port(&self) -> u16 {
        3306
    }

    fn schema(&self) -> &str {
        "db0"
    }

    fn thread_id(&self) -> u32 {
        self.id as u32
    }

    fn is_from_slave(&self) -> bool {
        self.from_slave
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn sync_and_execute(&self) -> bool {
        let prev = self
            .pending_sync
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some((n - 1).max(0)))
            .unwrap_or(0);
        prev <= 1
    }

    fn attachment(&self) -> Option<Arc<RouteNode>> {
        self.attachment.lock().clone()
    }

    fn set_attachment(&self, node: Option<Arc<RouteNode>>) {
        *self.attachment.lock() = node;
    }

    fn set_response_handler(&self, handler: Option<Arc<dyn ResponseHandler>>) {
        *self.handler.lock() = handler;
    }

    fn execute(&self, node: &RouteNode, autocommit: bool) {
        let sync = self.sync_commands.load(Ordering::Acquire);
        self.pending_sync.store(sync + 1, Ordering::Release);
        self.executed.lock().push((node.statement.clone(), autocommit));
    }

    fn write_packet(&self, packet: Packet) {
        self.written.lock().push(packet);
    }

    fn disable_read(&self) {
        self.read_enabled.store(false, Ordering::Release);
    }

    fn enable_read(&self) {
        self.read_enabled.store(true, Ordering::Release);
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some(reason.to_string());
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            handler.connection_close(&self.as_dyn(), reason);
        }
    }

    fn close_without_rsp(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.close_reason.lock() = Some(reason.to_string());
        self.handler.lock().take();
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::AcqRel);
        self.set_response_handler(None);
        self.set_attachment(None);
        let hook = self.release_hook.lock().take();
        if let Some(hook) = hook {
            hook(&self.as_dyn());
        }
    }
}

/// Client writer that keeps every flushed buffer
pub struct CaptureFrontend {
    buffer_size: usize,
    queue_len: AtomicUsize,
    writes: Mutex<Vec<Bytes>>,
    recycled: AtomicUsize,
    paused: Mutex<Vec<u64>>,
}

impl CaptureFrontend {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            queue_len: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            recycled: AtomicUsize::new(0),
            paused: Mutex::new(Vec::new()),
        })
    }

    /// Pretend this many buffers wait in the write queue
    pub fn set_queue_len(&self, len: usize) {
        self.queue_len.store(len, Ordering::Release);
    }

    pub fn writes(&self) -> Vec<Bytes> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn recycled(&self) -> usize {
        self.recycled.load(Ordering::Acquire)
    }

    pub fn paused(&self) -> Vec<u64> {
        self.paused.lock().clone()
    }

    /// Every physical packet written so far, in order
    pub fn packets(&self) -> Vec<Packet> {
        let mut all = BytesMut::new();
        for write in self.writes.lock().iter() {
            all.extend_from_slice(write);
        }
        let mut packets = Vec::new();
        while let Some(packet) = Packet::decode(&mut all) {
            packets.push(packet);
        }
        packets
    }

    pub fn sequence_ids(&self) -> Vec<u8> {
        self.packets().iter().map(|p| p.sequence_id).collect()
    }
}

impl FrontendConnection for CaptureFrontend {
    fn allocate(&self) -> BytesMut {
        BytesMut::with_capacity(self.buffer_size)
    }

    fn write_to_buffer(&self, data: &[u8], mut buffer: BytesMut) -> BytesMut {
        if !buffer.is_empty() && buffer.len() + data.len() > self.buffer_size {
            self.write(buffer);
            buffer = self.allocate();
        }
        buffer.extend_from_slice(data);
        buffer
    }

    fn write(&self, buffer: BytesMut) {
        if !buffer.is_empty() {
            self.writes.lock().push(buffer.freeze());
        }
    }

    fn recycle(&self, _buffer: BytesMut) {
        self.recycled.fetch_add(1, Ordering::AcqRel);
    }

    fn write_queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Acquire)
    }

    fn start_flow_control(&self, conn: Arc<dyn BackendConnection>) {
        conn.disable_read();
        self.paused.lock().push(conn.id());
    }
}

/// Statistics sink keeping every result
#[derive(Default)]
pub struct RecordingDispatcher {
    results: Mutex<Vec<QueryResult>>,
}

impl RecordingDispatcher {
    pub fn results(&self) -> Vec<QueryResult> {
        self.results.lock().clone()
    }
}

impl QueryResultDispatcher for RecordingDispatcher {
    fn dispatch(&self, result: QueryResult) {
        self.results.lock().push(result);
    }
}

/// Connection provider answering synchronously from a script
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Arc<MockBackend>, BackendError>>>,
    requests: Mutex<Vec<(String, bool, bool)>>,
    count: AtomicU64,
}

impl ScriptedProvider {
    pub fn push(&self, outcome: Result<Arc<MockBackend>, BackendError>) {
        self.script.lock().push_back(outcome);
    }

    /// (node, tx_started, autocommit) per request
    pub fn requests(&self) -> Vec<(String, bool, bool)> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl ConnectionProvider for ScriptedProvider {
    fn get_connection(
        &self,
        node: Arc<RouteNode>,
        tx_started: bool,
        autocommit: bool,
        handler: Arc<dyn ResponseHandler>,
    ) {
        self.count.fetch_add(1, Ordering::AcqRel);
        self.requests
            .lock()
            .push((node.name.clone(), tx_started, autocommit));
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Connect("no scripted connection".into())));
        match outcome {
            Ok(conn) => handler.connection_acquired(conn),
            Err(e) => handler.connection_error(e, &node),
        }
    }
}

/// Session wired to in-process doubles
pub struct Harness {
    pub session: Arc<Session>,
    pub client: Arc<CaptureFrontend>,
    pub provider: Arc<ScriptedProvider>,
    pub stats: Arc<RecordingDispatcher>,
}

pub fn harness() -> Harness {
    harness_with(FlowControlConfig::disabled(), 16 * 1024)
}

pub fn harness_with(flow_control: FlowControlConfig, buffer_size: usize) -> Harness {
    let client = CaptureFrontend::new(buffer_size);
    let provider = Arc::new(ScriptedProvider::default());
    let stats = Arc::new(RecordingDispatcher::default());
    let context = ProxyContext {
        provider: provider.clone(),
        flow_control,
        statistics: Some(stats.clone()),
    };
    let session = Session::new(1, client.clone(), context, ClientState::new("app", "10.0.0.9", 51000));
    Harness {
        session,
        client,
        provider,
        stats,
    }
}

pub fn test_session() -> (Arc<Session>, Arc<CaptureFrontend>, Arc<ScriptedProvider>) {
    let h = harness();
    (h.session, h.client, h.provider)
}

// Packet builders

pub fn ok_packet(seq: u8, affected_rows: u64, last_insert_id: u64) -> Packet {
    let ok = OkPacket {
        affected_rows,
        last_insert_id,
        status_flags: 0x0002,
        warnings: 0,
        message: Some(Bytes::from_static(b"Records: 1")),
    };
    ok.encode(seq, crate::protocol::capabilities::DEFAULT_CAPABILITIES)
}

pub fn err_packet(seq: u8, code: u16, message: &str) -> Packet {
    crate::protocol::ErrPacket::new(code, "42000", message)
        .encode(seq, crate::protocol::capabilities::DEFAULT_CAPABILITIES)
}

pub fn eof_packet(seq: u8, status_flags: u16) -> Packet {
    crate::protocol::EofPacket {
        warnings: 0,
        status_flags,
    }
    .encode(seq)
}

pub fn text_row(seq: u8, values: &[Option<&str>]) -> Packet {
    let mut buf = BytesMut::new();
    for value in values {
        match value {
            Some(v) => lenenc::put_lenenc_bytes(&mut buf, v.as_bytes()),
            None => buf.put_u8(lenenc::NULL_MARKER),
        }
    }
    Packet::new(seq, buf.freeze())
}
