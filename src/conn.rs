//! Per-connection state and the worker task.
//!
//! Each connection owns a [`ConnBuffer`] (parse-side state, guarded by the
//! parse mutex), a pending command queue, a [`ReplyWriter`], and a one-slot
//! wake channel. The worker task sleeps on the channel, drains the queue
//! through the user handler, and flushes the accumulated reply bytes as a
//! single async write per batch.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::error;

use crate::engine::NetConn;
use crate::hub::Action;
use crate::pool::{BytePool, ByteQueue, IntPool, Pool};
use crate::resp::{Command, ReplyWriter, Value};

/// Handler invoked on the worker task for every parsed command.
pub type CommandHandler = dyn Fn(&Conn, Command) -> Action + Send + Sync;

static CONN_BUFFERS: Pool<ConnBuffer> = Pool::new();
static REPLY_WRITERS: Pool<ReplyWriter> = Pool::new();
static OUT_BUFFERS: ByteQueue = ByteQueue::new();

/// Parse-side state of one connection. The arenas are single-owner; every
/// field is guarded by the connection's parse mutex.
pub(crate) struct ConnBuffer {
    /// Trailing bytes of a partial command carried between traffic events.
    pub accumulator: BytesMut,
    pub byte_pool: BytePool,
    pub int_pool: IntPool,
    /// Frozen scratch for the latest parsed batch; the worker hands it
    /// back to the byte pool once the batch has been drained.
    pub parse_buf: Option<Bytes>,
    pub last_access: Instant,
}

impl ConnBuffer {
    pub fn new() -> ConnBuffer {
        ConnBuffer {
            accumulator: BytesMut::new(),
            byte_pool: BytePool::new(),
            int_pool: IntPool::new(),
            parse_buf: None,
            last_access: Instant::now(),
        }
    }

    /// Clears all parse state for safe reuse by another connection.
    pub fn reset(&mut self) {
        self.accumulator.clear();
        self.byte_pool.reset();
        self.int_pool.reset();
        self.parse_buf = None;
    }

    /// Replaces every buffer with a fresh baseline instance. Used by the
    /// reclamation ticker on idle connections.
    pub fn reallocate(&mut self) {
        self.accumulator = BytesMut::new();
        self.byte_pool = BytePool::new();
        self.int_pool = IntPool::new();
        self.parse_buf = None;
    }
}

pub(crate) enum PendingEntry {
    Cmd(Command),
    /// Parse failure surfaced through the worker, so the error reply can
    /// never overtake an earlier batch still on the write path.
    ProtocolError(String),
}

/// Handler-facing connection handle. Cheap to clone.
///
/// Reply writes accumulate in the connection's [`ReplyWriter`] and are
/// transmitted by the worker after the current batch of commands has been
/// drained.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    net: NetConn,
    /// The parse mutex ("mu"): held by traffic handling, by the worker
    /// across a batch, by reclamation, and during teardown.
    buffer: Mutex<ConnBuffer>,
    pending: Mutex<VecDeque<PendingEntry>>,
    writer: Mutex<ReplyWriter>,
    /// One-slot wake channel; dropping the sender stops the worker.
    wake: Mutex<Option<mpsc::Sender<()>>>,
    closed: Mutex<bool>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Conn {
    pub(crate) fn new(net: NetConn) -> (Conn, mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let mut buffer = CONN_BUFFERS.get(ConnBuffer::new);
        buffer.last_access = Instant::now();

        let conn = Conn {
            inner: Arc::new(ConnInner {
                net,
                buffer: Mutex::new(buffer),
                pending: Mutex::new(VecDeque::new()),
                writer: Mutex::new(REPLY_WRITERS.get(ReplyWriter::new)),
                wake: Mutex::new(Some(wake_tx)),
                closed: Mutex::new(false),
                context: Mutex::new(None),
            }),
        };
        (conn, wake_rx)
    }

    /// Remote address of the client.
    pub fn remote_addr(&self) -> String {
        self.inner.net.remote_addr().to_string()
    }

    pub fn write_string(&self, s: &str) {
        self.inner.writer.lock().unwrap().write_string(s);
    }

    pub fn write_error(&self, msg: &str) {
        self.inner.writer.lock().unwrap().write_error(msg);
    }

    pub fn write_bulk(&self, bulk: &[u8]) {
        self.inner.writer.lock().unwrap().write_bulk(bulk);
    }

    pub fn write_bulk_string(&self, bulk: &str) {
        self.inner.writer.lock().unwrap().write_bulk_string(bulk);
    }

    pub fn write_int(&self, n: i64) {
        self.inner.writer.lock().unwrap().write_int(n);
    }

    pub fn write_u64(&self, n: u64) {
        self.inner.writer.lock().unwrap().write_u64(n);
    }

    /// Writes an array header; follow up with `count` sub-replies:
    ///
    /// ```ignore
    /// conn.write_array(2);
    /// conn.write_bulk_string("item 1");
    /// conn.write_bulk_string("item 2");
    /// ```
    pub fn write_array(&self, count: usize) {
        self.inner.writer.lock().unwrap().write_array(count);
    }

    pub fn write_null(&self) {
        self.inner.writer.lock().unwrap().write_null();
    }

    pub fn write_raw(&self, data: &[u8]) {
        self.inner.writer.lock().unwrap().write_raw(data);
    }

    pub fn write_any(&self, value: &Value) {
        self.inner.writer.lock().unwrap().write_any(value);
    }

    /// Returns all commands currently pipelined behind the one being
    /// handled, removing them from the pipeline.
    pub fn read_pipeline(&self) -> Vec<Command> {
        let mut pending = self.inner.pending.lock().unwrap();
        let mut commands = Vec::new();
        while let Some(PendingEntry::Cmd(_)) = pending.front() {
            if let Some(PendingEntry::Cmd(cmd)) = pending.pop_front() {
                commands.push(cmd);
            }
        }
        commands
    }

    /// Returns all commands currently pipelined without removing them.
    pub fn peek_pipeline(&self) -> Vec<Command> {
        self.inner
            .pending
            .lock()
            .unwrap()
            .iter()
            .map_while(|entry| match entry {
                PendingEntry::Cmd(cmd) => Some(cmd.clone()),
                PendingEntry::ProtocolError(_) => None,
            })
            .collect()
    }

    /// Stores an opaque per-connection value; its lifetime matches the
    /// connection.
    pub fn set_context<T: Any + Send + Sync>(&self, ctx: T) {
        *self.inner.context.lock().unwrap() = Some(Arc::new(ctx));
    }

    /// Returns the value stored with [`set_context`](Conn::set_context),
    /// if any of type `T`.
    pub fn context<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let ctx = self.inner.context.lock().unwrap().clone()?;
        ctx.downcast().ok()
    }

    pub(crate) fn buffer(&self) -> &Mutex<ConnBuffer> {
        &self.inner.buffer
    }

    pub(crate) fn pending(&self) -> &Mutex<VecDeque<PendingEntry>> {
        &self.inner.pending
    }

    pub(crate) fn closed_flag(&self) -> &Mutex<bool> {
        &self.inner.closed
    }

    /// Signals the worker that commands are available. A wake arriving
    /// while one is already pending coalesces with it: the worker fully
    /// drains the queue on every cycle.
    pub(crate) fn wake(&self) {
        if let Some(tx) = self.inner.wake.lock().unwrap().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Tears the connection down once: stops the worker, returns the
    /// pooled parts, and closes the socket. Safe to call from any path.
    pub(crate) fn close(&self) {
        let mut closed = self.inner.closed.lock().unwrap();
        if *closed {
            return;
        }
        *closed = true;

        // dropping the sender closes the wake channel, stopping the worker
        self.inner.wake.lock().unwrap().take();

        {
            let mut buffer = self.inner.buffer.lock().unwrap();
            let mut retired = ConnBuffer::new();
            std::mem::swap(&mut *buffer, &mut retired);
            retired.reset();
            CONN_BUFFERS.put(retired);
        }
        self.inner.pending.lock().unwrap().clear();
        {
            let mut writer = self.inner.writer.lock().unwrap();
            let mut retired = ReplyWriter::hollow();
            std::mem::swap(&mut *writer, &mut retired);
            retired.flush();
            REPLY_WRITERS.put(retired);
        }

        self.inner.net.close();
    }
}

/// Per-connection worker task.
///
/// Sleeps on the wake channel; each wake drains the pending queue under the
/// parse mutex, invokes the handler per command, snapshots the reply bytes
/// into a pooled output buffer, and submits them as one async write.
/// Channel closure shuts the worker down.
pub(crate) async fn process(conn: Conn, mut wake_rx: mpsc::Receiver<()>, handler: Arc<CommandHandler>) {
    while wake_rx.recv().await.is_some() {
        let mut action = Action::None;
        {
            let mut cb = conn.inner.buffer.lock().unwrap();

            loop {
                let entry = conn.inner.pending.lock().unwrap().pop_front();
                let Some(entry) = entry else { break };

                action = match entry {
                    PendingEntry::Cmd(cmd) => {
                        match catch_unwind(AssertUnwindSafe(|| (*handler)(&conn, cmd))) {
                            Ok(action) => action,
                            Err(_) => {
                                error!(
                                    "handler panicked; closing connection {}",
                                    conn.inner.net.id()
                                );
                                Action::Close
                            }
                        }
                    }
                    PendingEntry::ProtocolError(msg) => {
                        conn.inner
                            .writer
                            .lock()
                            .unwrap()
                            .write_error(&format!("ERR {msg}"));
                        Action::None
                    }
                };
                if action == Action::Close {
                    break;
                }
            }

            {
                let mut writer = conn.inner.writer.lock().unwrap();
                if !writer.buffer().is_empty() {
                    let mut out = OUT_BUFFERS.pop();
                    out.extend_from_slice(writer.buffer());
                    conn.inner.net.async_write(out, |buf| OUT_BUFFERS.push(buf));
                }
                writer.flush();
            }

            if let Some(parse_buf) = cb.parse_buf.take() {
                cb.byte_pool.put(parse_buf);
            }
            cb.byte_pool.reset();
            if action != Action::Close {
                cb.last_access = Instant::now();
            }
        }

        if action == Action::Close {
            conn.close();
        }
    }
}
