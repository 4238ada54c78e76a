//! Client-facing write side

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::BackendConnection;
use crate::flow::FlowControlConfig;
use crate::metrics::metrics;

/// Sink for packets headed to the client.
///
/// Packets are appended to a caller-held buffer; [`write`](Self::write)
/// hands a buffer over to the sink's write queue.
pub trait FrontendConnection: Send + Sync {
    /// A fresh, empty write buffer
    fn allocate(&self) -> BytesMut;

    /// Append encoded packet bytes to `buffer`. A buffer that cannot take
    /// `data` any more is queued for writing and a new one continues.
    fn write_to_buffer(&self, data: &[u8], buffer: BytesMut) -> BytesMut;

    /// Queue `buffer` for writing
    fn write(&self, buffer: BytesMut);

    /// Give back a buffer that will not be written
    fn recycle(&self, buffer: BytesMut);

    /// Buffers queued but not yet written
    fn write_queue_len(&self) -> usize;

    /// Pause `conn`'s reads until the write queue drains
    fn start_flow_control(&self, conn: Arc<dyn BackendConnection>);
}

/// [`FrontendConnection`] over any async writer, drained by its own task
pub struct ClientWriter {
    buffer_size: usize,
    flow: FlowControlConfig,
    queue_len: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    paused: Arc<Mutex<Vec<Arc<dyn BackendConnection>>>>,
    tx: mpsc::UnboundedSender<BytesMut>,
}

impl ClientWriter {
    /// Start the writer task
    pub fn spawn<W>(writer: W, buffer_size: usize, flow: FlowControlConfig) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            buffer_size,
            flow,
            queue_len: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(Mutex::new(Vec::new())),
            tx,
        });

        tokio::spawn(drain_queue(
            writer,
            rx,
            client.queue_len.clone(),
            client.closed.clone(),
            client.paused.clone(),
            flow,
        ));
        client
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connections currently paused by flow control
    pub fn paused_count(&self) -> usize {
        self.paused.lock().len()
    }
}

impl FrontendConnection for ClientWriter {
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
        if buffer.is_empty() {
            return;
        }
        if self.is_closed() {
            debug!(bytes = buffer.len(), "Client gone, dropping write");
            return;
        }
        self.queue_len.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(buffer).is_err() {
            self.queue_len.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn recycle(&self, buffer: BytesMut) {
        drop(buffer);
    }

    fn write_queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Acquire)
    }

    fn start_flow_control(&self, conn: Arc<dyn BackendConnection>) {
        let mut paused = self.paused.lock();
        if paused.iter().any(|c| c.id() == conn.id()) {
            return;
        }
        // Checked under the lock: a drain that already ran would never resume it
        let queue = self.write_queue_len();
        if self.flow.should_resume(queue) {
            debug!(conn_id = conn.id(), queue, "Write queue already drained, not pausing");
            return;
        }
        debug!(conn_id = conn.id(), queue = self.write_queue_len(), "Pausing backend reads");
        metrics().record_flow_control_pause();
        conn.disable_read();
        paused.push(conn);
    }
}

async fn drain_queue<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<BytesMut>,
    queue_len: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    paused: Arc<Mutex<Vec<Arc<dyn BackendConnection>>>>,
    flow: FlowControlConfig,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(buffer) = rx.recv().await {
        let result = writer.write_all(&buffer).await;
        let remaining = queue_len.fetch_sub(1, Ordering::AcqRel) - 1;

        if let Err(e) = result {
            warn!(error = %e, "Client write failed");
            closed.store(true, Ordering::Release);
            break;
        }
        if remaining == 0 {
            if let Err(e) = writer.flush().await {
                warn!(error = %e, "Client flush failed");
                closed.store(true, Ordering::Release);
                break;
            }
        }
        if flow.should_resume(remaining) {
            resume_all(&paused);
        }
    }

    // Readers must not stay paused behind a dead client
    resume_all(&paused);
    let _ = writer.shutdown().await;
}

fn resume_all(paused: &Mutex<Vec<Arc<dyn BackendConnection>>>) {
    let resumed: Vec<_> = paused.lock().drain(..).collect();
    for conn in resumed {
        debug!(conn_id = conn.id(), "Resuming backend reads");
        conn.enable_read();
    }
}
