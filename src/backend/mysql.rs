use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::{dispatch, BackendConnection, BackendError, ResponseEvent, ResponseHandler, ResponseReader};
use crate::config::BackendConfig;
use crate::metrics::metrics;
use crate::pool::ConnectionPool;
use crate::protocol::{
    is_err_packet, is_ok_packet, status, Command, ErrPacket, HandshakeResponse, InitialHandshake,
    OkPacket, Packet, PacketCodec,
};
use crate::route::RouteNode;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

enum Outbound {
    Packet(Packet),
    Quit,
}

/// A MySQL backend connection driven by two tasks.
///
/// The writer task drains an unbounded channel into the socket; the reader
/// task turns backend packets into [`ResponseEvent`]s and hands them to the
/// installed handler. Reads can be paused for flow control.
pub struct MySqlConnection {
    id: u64,
    me: Weak<MySqlConnection>,
    host: String,
    port: u16,
    schema: String,
    thread_id: u32,
    from_slave: bool,
    created_at: Instant,
    last_used_at: Mutex<Instant>,
    closed: AtomicBool,
    /// Commands still owed a response in the current execution
    pending_sync: AtomicI32,
    /// Autocommit mode the backend session is in
    autocommit: Mutex<bool>,
    attachment: Mutex<Option<Arc<RouteNode>>>,
    handler: Mutex<Option<Arc<dyn ResponseHandler>>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    read_enabled: watch::Sender<bool>,
    pool: Weak<ConnectionPool>,
}

impl MySqlConnection {
    /// Connect and authenticate against a backend instance
    pub async fn connect(
        backend: &BackendConfig,
        database: &str,
        from_slave: bool,
        pool: Weak<ConnectionPool>,
    ) -> Result<Arc<Self>, BackendError> {
        let addr = backend.addr();
        debug!(addr = %addr, database = %database, "Connecting to backend");

        let stream = TcpStream::connect(&addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "Failed to connect to backend");
            BackendError::Connect(e.to_string())
        })?;
        stream.set_nodelay(true)?;

        let mut framed = Framed::new(stream, PacketCodec::default());

        let greeting = next_packet(&mut framed).await?;
        if is_err_packet(&greeting.payload) {
            return Err(BackendError::Connect(err_message(&greeting)));
        }
        let handshake = InitialHandshake::parse(&greeting.payload)?;
        debug!(
            server_version = %handshake.server_version,
            thread_id = handshake.connection_id,
            "Received backend handshake"
        );

        let response =
            HandshakeResponse::for_backend(&handshake, &backend.user, &backend.password, Some(database));
        framed
            .send(response.encode(greeting.sequence_id.wrapping_add(1)))
            .await?;

        let reply = next_packet(&mut framed).await?;
        if is_err_packet(&reply.payload) {
            let message = err_message(&reply);
            error!(addr = %addr, error = %message, "Backend authentication failed");
            return Err(BackendError::Auth(message));
        }
        if !is_ok_packet(&reply.payload) {
            return Err(BackendError::Protocol(format!(
                "unsupported authentication reply 0x{:02X}",
                reply.marker().unwrap_or(0)
            )));
        }
        let status_flags = OkPacket::parse(&reply.payload)
            .map(|ok| ok.status_flags)
            .unwrap_or(handshake.status_flags);

        debug!(addr = %addr, "Backend authentication successful");
        metrics().record_backend_connection("created");

        Ok(Self::start(
            framed,
            backend,
            database,
            handshake.connection_id,
            from_slave,
            status_flags & status::SERVER_STATUS_AUTOCOMMIT != 0,
            pool,
        ))
    }

    /// Spawn the reader and writer tasks over an authenticated transport
    pub(crate) fn start<T>(
        framed: Framed<T, PacketCodec>,
        backend: &BackendConfig,
        database: &str,
        thread_id: u32,
        from_slave: bool,
        autocommit: bool,
        pool: Weak<ConnectionPool>,
    ) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (sink, stream) = framed.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (read_enabled, read_gate) = watch::channel(true);
        let now = Instant::now();

        let conn = Arc::new_cyclic(|me| Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            me: me.clone(),
            host: backend.host.clone(),
            port: backend.port,
            schema: database.to_string(),
            thread_id,
            from_slave,
            created_at: now,
            last_used_at: Mutex::new(now),
            closed: AtomicBool::new(false),
            pending_sync: AtomicI32::new(0),
            autocommit: Mutex::new(autocommit),
            attachment: Mutex::new(None),
            handler: Mutex::new(None),
            outbound,
            read_enabled,
            pool,
        });

        tokio::spawn(write_loop(sink, outbound_rx, Arc::downgrade(&conn)));
        tokio::spawn(read_loop(stream, read_gate, Arc::downgrade(&conn)));
        conn
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }

    pub fn is_idle_too_long(&self, max_idle: Duration) -> bool {
        self.last_used_at.lock().elapsed() > max_idle
    }

    /// Mark as borrowed from the pool
    pub(crate) fn touch(&self) {
        *self.last_used_at.lock() = Instant::now();
    }

    fn send(&self, out: Outbound) {
        if self.outbound.send(out).is_err() {
            self.close("backend writer stopped");
        }
    }

    fn as_dyn(&self) -> Option<Arc<dyn BackendConnection>> {
        self.me.upgrade().map(|me| me as Arc<dyn BackendConnection>)
    }

    fn handle_event(&self, event: ResponseEvent) {
        let handler = self.handler.lock().clone();
        let (Some(handler), Some(conn)) = (handler, self.as_dyn()) else {
            debug!(conn_id = self.id, "Dropping backend response without handler");
            return;
        };
        if dispatch(handler.as_ref(), event, &conn) {
            self.close_without_rsp("row stream abandoned by handler");
        }
    }

    fn shutdown(&self) {
        let _ = self.outbound.send(Outbound::Quit);
        // A paused reader must observe the close
        self.read_enabled.send_replace(true);
        metrics().record_backend_connection("closed");
    }
}

impl BackendConnection for MySqlConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    fn thread_id(&self) -> u32 {
        self.thread_id
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
        let mut sync = Vec::new();
        {
            let mut current = self.autocommit.lock();
            if *current != autocommit {
                sync.push(format!("SET autocommit={}", u8::from(autocommit)));
                *current = autocommit;
            }
        }
        self.pending_sync.store(sync.len() as i32 + 1, Ordering::Release);
        self.touch();

        debug!(
            conn_id = self.id,
            node = %node.name,
            sync_commands = sync.len(),
            "Executing statement on backend"
        );
        for cmd in sync {
            self.send(Outbound::Packet(Command::Query.packet(cmd.as_bytes())));
        }
        self.send(Outbound::Packet(Command::Query.packet(node.statement.as_bytes())));
    }

    fn write_packet(&self, packet: Packet) {
        self.send(Outbound::Packet(packet));
    }

    fn disable_read(&self) {
        self.read_enabled.send_replace(false);
    }

    fn enable_read(&self) {
        self.read_enabled.send_replace(true);
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(conn_id = self.id, addr = %format!("{}:{}", self.host, self.port), reason = %reason, "Closing backend connection");
        self.shutdown();

        let handler = self.handler.lock().take();
        if let (Some(handler), Some(conn)) = (handler, self.as_dyn()) {
            handler.connection_close(&conn, reason);
        }
    }

    fn close_without_rsp(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(conn_id = self.id, reason = %reason, "Closing backend connection without response");
        self.shutdown();
        self.handler.lock().take();
    }

    fn release(&self) {
        if self.is_closed() {
            return;
        }
        self.set_response_handler(None);
        self.set_attachment(None);
        self.touch();

        match (self.pool.upgrade(), self.me.upgrade()) {
            (Some(pool), Some(me)) => {
                metrics().record_backend_connection("released");
                pool.put(me);
            }
            _ => self.close_without_rsp("pool no longer exists"),
        }
    }
}

impl fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("schema", &self.schema)
            .field("thread_id", &self.thread_id)
            .field("from_slave", &self.from_slave)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn next_packet<T>(framed: &mut Framed<T, PacketCodec>) -> Result<Packet, BackendError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .next()
        .await
        .ok_or(BackendError::Disconnected)?
        .map_err(BackendError::from)
}

fn err_message(packet: &Packet) -> String {
    ErrPacket::parse(&packet.payload)
        .map(|e| e.error_message)
        .unwrap_or_else(|| "unreadable error packet".to_string())
}

async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    conn: Weak<MySqlConnection>,
) where
    S: Sink<Packet, Error = io::Error> + Unpin,
{
    while let Some(out) = outbound.recv().await {
        let (packet, quit) = match out {
            Outbound::Packet(packet) => (packet, false),
            Outbound::Quit => (Command::Quit.packet(&[]), true),
        };
        if let Err(e) = sink.send(packet).await {
            if let Some(conn) = conn.upgrade() {
                warn!(conn_id = conn.id, error = %e, "Backend write failed");
                conn.close(&format!("write failed: {e}"));
            }
            break;
        }
        if quit {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<S>(
    mut stream: S,
    mut read_gate: watch::Receiver<bool>,
    conn: Weak<MySqlConnection>,
) where
    S: Stream<Item = Result<Packet, io::Error>> + Unpin,
{
    let mut reader = ResponseReader::new();
    let reason = loop {
        if read_gate.wait_for(|enabled| *enabled).await.is_err() {
            return;
        }
        let packet = match stream.next().await {
            Some(Ok(packet)) => packet,
            Some(Err(e)) => break format!("read failed: {e}"),
            None => break "stream closed by backend".to_string(),
        };

        let Some(conn) = conn.upgrade() else {
            return;
        };
        if conn.is_closed() {
            return;
        }
        match reader.feed(packet) {
            Ok(Some(event)) => conn.handle_event(event),
            Ok(None) => {}
            Err(e) => {
                warn!(conn_id = conn.id, error = %e, "Unexpected backend packet");
                conn.close(&format!("protocol error: {e}"));
                return;
            }
        }
    };

    if let Some(conn) = conn.upgrade() {
        conn.close(&reason);
    }
}
