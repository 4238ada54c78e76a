//! Backend connections and the callbacks they drive

mod mysql;
mod reader;

pub use mysql::MySqlConnection;
pub use reader::{ResponseEvent, ResponseReader};

use std::fmt;
use std::sync::Arc;

use crate::protocol::{Packet, ProtocolError};
use crate::route::RouteNode;

/// Backend connection errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Connect(String),

    #[error("{0}")]
    Io(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection disconnected")]
    Disconnected,

    #[error("Unknown sharding node {0}")]
    UnknownNode(String),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

impl From<ProtocolError> for BackendError {
    fn from(e: ProtocolError) -> Self {
        BackendError::Protocol(e.to_string())
    }
}

/// A stateful channel to one backend node, owned by one handler at a time.
///
/// All methods return immediately. Command results arrive later through the
/// installed [`ResponseHandler`].
pub trait BackendConnection: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;
    fn host(&self) -> &str;
    fn port(&self) -> u16;
    fn schema(&self) -> &str;
    /// Server side connection id
    fn thread_id(&self) -> u32;
    fn is_from_slave(&self) -> bool;
    fn is_closed(&self) -> bool;

    /// Account for one completed command. Returns true once the sync
    /// commands sent ahead of the statement and the statement itself have
    /// all answered.
    fn sync_and_execute(&self) -> bool;

    /// The route node this connection currently serves
    fn attachment(&self) -> Option<Arc<RouteNode>>;
    fn set_attachment(&self, node: Option<Arc<RouteNode>>);

    fn set_response_handler(&self, handler: Option<Arc<dyn ResponseHandler>>);

    /// Send `node`'s statement, preceded by whatever session sync the
    /// requested autocommit mode needs
    fn execute(&self, node: &RouteNode, autocommit: bool);

    /// Write a raw packet, used while streaming LOAD DATA file content
    fn write_packet(&self, packet: Packet);

    /// Stop reading responses until [`enable_read`](Self::enable_read)
    fn disable_read(&self);
    fn enable_read(&self);

    /// Close and report `connection_close` to the installed handler
    fn close(&self, reason: &str);
    /// Close without notifying the handler
    fn close_without_rsp(&self, reason: &str);

    /// Return to the pool the connection came from
    fn release(&self);
}

/// Callbacks driven by a backend connection and by connection acquisition
pub trait ResponseHandler: Send + Sync {
    fn connection_acquired(&self, conn: Arc<dyn BackendConnection>);

    fn connection_error(&self, err: BackendError, node: &RouteNode);

    fn error_response(&self, err: Packet, conn: &Arc<dyn BackendConnection>);

    fn ok_response(&self, ok: Packet, conn: &Arc<dyn BackendConnection>);

    fn field_eof_response(
        &self,
        header: Packet,
        fields: Vec<Packet>,
        eof: Packet,
        conn: &Arc<dyn BackendConnection>,
    );

    /// Returns true to stop reading further rows
    fn row_response(&self, row: Packet, conn: &Arc<dyn BackendConnection>) -> bool;

    fn row_eof_response(&self, eof: Packet, conn: &Arc<dyn BackendConnection>);

    fn connection_close(&self, conn: &Arc<dyn BackendConnection>, reason: &str);

    /// Handlers able to serve LOAD DATA LOCAL file requests
    fn as_load_data(&self) -> Option<&dyn LoadDataResponseHandler> {
        None
    }
}

/// Receives the backend's request for local file content
pub trait LoadDataResponseHandler {
    fn request_data_response(&self, request: Packet, conn: &Arc<dyn BackendConnection>);
}

/// Asynchronous connection acquisition.
///
/// Completes on `handler` with exactly one of
/// [`ResponseHandler::connection_acquired`] or
/// [`ResponseHandler::connection_error`].
pub trait ConnectionProvider: Send + Sync {
    fn get_connection(
        &self,
        node: Arc<RouteNode>,
        tx_started: bool,
        autocommit: bool,
        handler: Arc<dyn ResponseHandler>,
    );
}

/// Dispatch one reader event to `handler`
pub fn dispatch(
    handler: &dyn ResponseHandler,
    event: ResponseEvent,
    conn: &Arc<dyn BackendConnection>,
) -> bool {
    match event {
        ResponseEvent::Ok(packet) => handler.ok_response(packet, conn),
        ResponseEvent::Error(packet) => handler.error_response(packet, conn),
        ResponseEvent::FieldEof {
            header,
            fields,
            eof,
        } => handler.field_eof_response(header, fields, eof, conn),
        ResponseEvent::Row(packet) => return handler.row_response(packet, conn),
        ResponseEvent::RowEof(packet) => handler.row_eof_response(packet, conn),
        ResponseEvent::LocalInfile(packet) => match handler.as_load_data() {
            Some(load) => load.request_data_response(packet, conn),
            // Empty packet tells the server there is no file
            None => conn.write_packet(Packet::new(packet.sequence_id.wrapping_add(1), Vec::new())),
        },
    }
    false
}
