//! Tokio TCP engine underneath the framework.
//!
//! The engine owns the sockets: accept loops feed new connections to a read
//! task and a flush task, and every I/O event is surfaced to the consumer
//! through the [`EventHandler`] callbacks. The flush task owns the write
//! half of each socket, so writes submitted for one connection go out in
//! submission order.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tracing::{debug, error, info};

const DEFAULT_READ_BUFFER_CAP: usize = 64 * 1024;

/// Strategy for distributing new connections across event loops. With
/// `reuse_port` the kernel balances accepted connections itself; the field
/// is part of the configuration surface for compatibility.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
    SourceAddrHash,
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct Options {
    /// Run one accept loop per logical CPU instead of a single one.
    pub multicore: bool,
    /// Pin each event loop to an OS thread. Accepted for compatibility;
    /// the tokio runtime schedules its own workers.
    pub lock_os_thread: bool,
    /// Largest number of bytes read from a client per readable event,
    /// rounded up to the next power of two. Zero means 64 KiB.
    pub read_buffer_cap: usize,
    pub load_balancing: LoadBalancing,
    /// Exact number of accept loops; overrides `multicore` when non-zero.
    pub num_event_loop: usize,
    /// Set SO_REUSEPORT and give each accept loop its own listener.
    pub reuse_port: bool,
    /// Enable the periodic `on_tick` callback.
    pub ticker: bool,
    /// SO_KEEPALIVE period; zero disables.
    pub tcp_keepalive: Duration,
    /// Disable Nagle's algorithm on accepted sockets.
    pub tcp_no_delay: bool,
    /// SO_RCVBUF in bytes; zero keeps the OS default.
    pub socket_recv_buffer: usize,
    /// SO_SNDBUF in bytes; zero keeps the OS default.
    pub socket_send_buffer: usize,
    /// Edge-triggered I/O. Accepted for compatibility; readiness is
    /// handled by the runtime.
    pub edge_triggered_io: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            multicore: false,
            lock_os_thread: false,
            read_buffer_cap: 0,
            load_balancing: LoadBalancing::RoundRobin,
            num_event_loop: 0,
            reuse_port: false,
            ticker: false,
            tcp_keepalive: Duration::ZERO,
            tcp_no_delay: true,
            socket_recv_buffer: 0,
            socket_send_buffer: 0,
            edge_triggered_io: false,
        }
    }
}

/// Event callbacks consumed by the engine.
///
/// Callbacks run on the engine's read tasks and must not block on user
/// code: they lock briefly, enqueue work, and return.
pub trait EventHandler: Send + Sync + 'static {
    /// Invoked once the listeners are bound, before the first accept.
    fn on_boot(&self) {}
    /// A connection was accepted.
    fn on_open(&self, conn: &NetConn);
    /// Buffered inbound bytes are available via [`NetConn::next`].
    fn on_traffic(&self, conn: &NetConn);
    /// The connection ended. `err` carries the transport error, or `None`
    /// for an orderly close.
    fn on_close(&self, conn: &NetConn, err: Option<io::Error>);
    /// Returns the delay until the next tick. Only called when
    /// [`Options::ticker`] is set.
    fn on_tick(&self) -> Duration {
        Duration::from_secs(1)
    }
    /// The last accept loop exited.
    fn on_shutdown(&self) {}
}

enum Outbound {
    Write(BytesMut, Option<Box<dyn FnOnce(BytesMut) + Send>>),
    Shutdown,
}

/// Engine-side connection handle.
///
/// Cheap to clone. Inbound bytes are buffered by the read task and drained
/// with [`next`](NetConn::next); outbound writes are queued FIFO onto the
/// connection's flush task.
#[derive(Clone)]
pub struct NetConn {
    inner: Arc<NetConnInner>,
}

struct NetConnInner {
    id: u64,
    remote_addr: SocketAddr,
    inbound: Mutex<BytesMut>,
    outbound: UnboundedSender<Outbound>,
    shutdown: Notify,
    closed: AtomicBool,
}

impl NetConn {
    /// Process-unique connection id; the hub keys its registry on this.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Takes up to `n` buffered inbound bytes; `-1` drains everything.
    pub fn next(&self, n: isize) -> BytesMut {
        let mut inbound = self.inner.inbound.lock().unwrap();
        if n < 0 || n as usize >= inbound.len() {
            inbound.split()
        } else {
            inbound.split_to(n as usize)
        }
    }

    /// Queues `data` on the connection's FIFO write path and returns the
    /// number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> usize {
        let _ = self
            .inner
            .outbound
            .send(Outbound::Write(BytesMut::from(data), None));
        data.len()
    }

    /// Queues `buf` for transmission. `complete` runs with the buffer once
    /// the write has finished, or immediately if the connection is gone, so
    /// pooled buffers always find their way home.
    pub fn async_write<F>(&self, buf: BytesMut, complete: F)
    where
        F: FnOnce(BytesMut) + Send + 'static,
    {
        let item = Outbound::Write(buf, Some(Box::new(complete)));
        if let Err(err) = self.inner.outbound.send(item) {
            if let Outbound::Write(buf, Some(complete)) = err.0 {
                complete(buf);
            }
        }
    }

    /// Closes the connection: queued writes are flushed first, then the
    /// socket is shut down and the read task winds up. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.outbound.send(Outbound::Shutdown);
        self.inner.shutdown.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn feed(&self, chunk: BytesMut) {
        self.inner.inbound.lock().unwrap().unsplit(chunk);
    }
}

/// Binds `addr` and serves until the process exits: spawns the accept
/// loops, the ticker when enabled, and one read task plus one flush task
/// per connection.
pub async fn serve<H: EventHandler>(
    handler: Arc<H>,
    addr: &str,
    options: Options,
) -> io::Result<()> {
    let addr = parse_addr(addr)?;
    let loops = event_loop_count(&options);

    let mut listeners: Vec<Arc<TcpListener>> = Vec::with_capacity(loops);
    if options.reuse_port {
        for _ in 0..loops {
            listeners.push(Arc::new(bind_listener(addr, &options)?));
        }
    } else {
        let shared = Arc::new(bind_listener(addr, &options)?);
        listeners.extend((0..loops).map(|_| shared.clone()));
    }

    info!("listening on {} with {} event loop(s)", addr, loops);
    handler.on_boot();

    if options.ticker {
        let handler = handler.clone();
        tokio::spawn(async move {
            loop {
                let delay = handler.on_tick();
                tokio::time::sleep(delay).await;
            }
        });
    }

    let mut accept_tasks = Vec::with_capacity(loops);
    for listener in listeners {
        let handler = handler.clone();
        let options = options.clone();
        accept_tasks.push(tokio::spawn(accept_loop(listener, handler, options)));
    }
    for task in accept_tasks {
        let _ = task.await;
    }

    handler.on_shutdown();
    Ok(())
}

fn parse_addr(addr: &str) -> io::Result<SocketAddr> {
    let addr = addr.strip_prefix("tcp://").unwrap_or(addr);
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))
}

fn event_loop_count(options: &Options) -> usize {
    if options.num_event_loop > 0 {
        options.num_event_loop
    } else if options.multicore {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        1
    }
}

fn bind_listener(addr: SocketAddr, options: &Options) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if options.reuse_port {
        socket.set_reuse_port(true)?;
    }
    if options.socket_recv_buffer > 0 {
        socket.set_recv_buffer_size(options.socket_recv_buffer)?;
    }
    if options.socket_send_buffer > 0 {
        socket.set_send_buffer_size(options.socket_send_buffer)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop<H: EventHandler>(
    listener: Arc<TcpListener>,
    handler: Arc<H>,
    options: Options,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted connection from {}", peer);
                if let Err(err) = configure_stream(&stream, &options) {
                    debug!("socket option setup failed for {}: {}", peer, err);
                }
                spawn_connection(stream, peer, handler.clone(), &options);
            }
            Err(err) => {
                error!("accept error: {}", err);
            }
        }
    }
}

fn configure_stream(stream: &TcpStream, options: &Options) -> io::Result<()> {
    stream.set_nodelay(options.tcp_no_delay)?;
    let socket = SockRef::from(stream);
    if !options.tcp_keepalive.is_zero() {
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(options.tcp_keepalive))?;
    }
    if options.socket_recv_buffer > 0 {
        socket.set_recv_buffer_size(options.socket_recv_buffer)?;
    }
    if options.socket_send_buffer > 0 {
        socket.set_send_buffer_size(options.socket_send_buffer)?;
    }
    Ok(())
}

fn spawn_connection<H: EventHandler>(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<H>,
    options: &Options,
) {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let conn = NetConn {
        inner: Arc::new(NetConnInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr: peer,
            inbound: Mutex::new(BytesMut::new()),
            outbound: out_tx,
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
        }),
    };
    let read_cap = if options.read_buffer_cap == 0 {
        DEFAULT_READ_BUFFER_CAP
    } else {
        options.read_buffer_cap.next_power_of_two()
    };

    tokio::spawn(flush_loop(write_half, out_rx));
    tokio::spawn(read_loop(read_half, conn, handler, read_cap));
}

async fn read_loop<H: EventHandler>(
    mut read_half: OwnedReadHalf,
    conn: NetConn,
    handler: Arc<H>,
    read_cap: usize,
) {
    handler.on_open(&conn);

    let mut buf = BytesMut::with_capacity(read_cap);
    let err = loop {
        buf.reserve(read_cap);
        tokio::select! {
            res = read_half.read_buf(&mut buf) => match res {
                Ok(0) => break None,
                Ok(_) => {
                    conn.feed(buf.split());
                    handler.on_traffic(&conn);
                }
                Err(err) => break Some(err),
            },
            _ = conn.inner.shutdown.notified() => break None,
        }
    };

    debug!("connection {} from {} closed", conn.id(), conn.remote_addr());
    conn.close();
    handler.on_close(&conn, err);
}

async fn flush_loop(mut write_half: OwnedWriteHalf, mut rx: UnboundedReceiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Write(buf, complete) => {
                let res = write_half.write_all(&buf).await;
                if let Some(complete) = complete {
                    complete(buf);
                }
                if res.is_err() {
                    break;
                }
            }
            Outbound::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_accepts_tcp_prefix() {
        let plain = parse_addr("127.0.0.1:6380").unwrap();
        let prefixed = parse_addr("tcp://127.0.0.1:6380").unwrap();
        assert_eq!(plain, prefixed);
    }

    #[test]
    fn loop_count_follows_options() {
        let mut options = Options::default();
        assert_eq!(event_loop_count(&options), 1);

        options.num_event_loop = 3;
        assert_eq!(event_loop_count(&options), 3);

        options.num_event_loop = 0;
        options.multicore = true;
        assert!(event_loop_count(&options) >= 1);
    }
}
