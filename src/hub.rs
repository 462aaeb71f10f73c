//! Connection registry and lifecycle.
//!
//! The hub is the glue between the engine's event callbacks and the
//! per-connection machinery: it owns the registry of live connections,
//! parses inbound traffic into each connection's pending queue, and runs
//! the reclamation ticker that shrinks idle connections back to baseline.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::oneshot;
use tracing::debug;

use crate::conn::{self, CommandHandler, Conn, PendingEntry};
use crate::engine::{self, EventHandler, NetConn, Options};
use crate::pool::byte_pool::SLAB_SIZE;
use crate::resp::{self, Command};

/// What the framework should do after a handler returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Keep serving the connection.
    None,
    /// Flush pending replies, then close the connection.
    Close,
}

pub type OpenHandler = dyn Fn(&Conn) -> Action + Send + Sync;
pub type CloseHandler = dyn Fn(&Conn, Option<&io::Error>) -> Action + Send + Sync;

const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// Registry of live connections plus the user callbacks.
///
/// Implements [`EventHandler`], so an `Arc<Hub>` is handed straight to the
/// engine; most users go through [`listen_and_serve`] instead.
pub struct Hub {
    on_opened: Box<OpenHandler>,
    on_closed: Box<CloseHandler>,
    on_command: Arc<CommandHandler>,
    conns: RwLock<HashMap<u64, Conn>>,
    tick_freq: Option<Duration>,
    reclaim_mem_after: Duration,
    boot_signal: Mutex<Option<oneshot::Sender<io::Result<()>>>>,
}

impl Hub {
    /// Builds a hub around the three user callbacks.
    ///
    /// `tick_freq` is the reclamation cadence (the engine ticker must be
    /// enabled via [`Options::ticker`] for it to fire); connections idle
    /// for at least `reclaim_mem_after` have their parse buffers replaced
    /// with baseline instances.
    pub fn new(
        on_opened: impl Fn(&Conn) -> Action + Send + Sync + 'static,
        on_closed: impl Fn(&Conn, Option<&io::Error>) -> Action + Send + Sync + 'static,
        on_command: impl Fn(&Conn, Command) -> Action + Send + Sync + 'static,
        tick_freq: Option<Duration>,
        reclaim_mem_after: Duration,
    ) -> Hub {
        Hub {
            on_opened: Box::new(on_opened),
            on_closed: Box::new(on_closed),
            on_command: Arc::new(on_command),
            conns: RwLock::new(HashMap::new()),
            tick_freq,
            reclaim_mem_after,
            boot_signal: Mutex::new(None),
        }
    }
}

impl EventHandler for Hub {
    fn on_boot(&self) {
        if let Some(signal) = self.boot_signal.lock().unwrap().take() {
            let _ = signal.send(Ok(()));
        }
    }

    fn on_open(&self, nc: &NetConn) {
        let mut conns = self.conns.write().unwrap();
        let (conn, wake_rx) = Conn::new(nc.clone());
        conns.insert(nc.id(), conn.clone());
        tokio::spawn(conn::process(conn.clone(), wake_rx, self.on_command.clone()));
        // return value accepted for signature compatibility
        let _ = (self.on_opened)(&conn);
    }

    fn on_close(&self, nc: &NetConn, err: Option<io::Error>) {
        let mut conns = self.conns.write().unwrap();
        let Some(conn) = conns.remove(&nc.id()) else {
            return;
        };
        let _ = (self.on_closed)(&conn, err.as_ref());
        conn.close();
    }

    fn on_traffic(&self, nc: &NetConn) {
        let conns = self.conns.read().unwrap();
        let Some(conn) = conns.get(&nc.id()) else {
            return;
        };

        let closed = conn.closed_flag().lock().unwrap();
        if *closed {
            return;
        }

        let mut cb = conn.buffer().lock().unwrap();

        let incoming = nc.next(-1);
        cb.accumulator.unsplit(incoming);

        // the parse scratch must be independent of the accumulator: the
        // argument slices stay alive until the worker drains them
        let target = cb.accumulator.len();
        let mut scratch = if target > SLAB_SIZE {
            BytesMut::with_capacity(target)
        } else {
            cb.byte_pool.get()
        };
        scratch.extend_from_slice(&cb.accumulator);
        let input = scratch.freeze();

        if let Some(prev) = cb.parse_buf.take() {
            cb.byte_pool.put(prev);
        }

        match resp::read_commands(&mut cb.int_pool, input.clone()) {
            Err(err) => {
                debug!("parse error on connection {}: {}", nc.id(), err);
                cb.accumulator.clear();
                cb.int_pool.reset();
                conn.pending()
                    .lock()
                    .unwrap()
                    .push_back(PendingEntry::ProtocolError(err.to_string()));
                drop(cb);
                conn.wake();
            }
            Ok((commands, remainder)) => {
                cb.parse_buf = Some(input);
                if !commands.is_empty() {
                    conn.pending()
                        .lock()
                        .unwrap()
                        .extend(commands.into_iter().map(PendingEntry::Cmd));
                }
                cb.accumulator.clear();
                cb.int_pool.reset();
                if remainder.is_empty() {
                    drop(cb);
                    conn.wake();
                } else {
                    // no complete command can exist until more bytes arrive
                    cb.accumulator.extend_from_slice(&remainder);
                }
            }
        }
    }

    fn on_tick(&self) -> Duration {
        let conns = self.conns.write().unwrap();
        for conn in conns.values() {
            // a held parse mutex means the connection is active; skip it
            let Ok(mut cb) = conn.buffer().try_lock() else {
                continue;
            };
            if cb.last_access.elapsed() < self.reclaim_mem_after {
                continue;
            }
            cb.reallocate();
        }
        self.tick_freq.unwrap_or(DEFAULT_TICK)
    }
}

/// Serves `addr` with this hub until the process exits.
///
/// Boot status is published on `signal`: `Ok(())` once the listeners are
/// bound, or the bind error. `addr` is `host:port`, with an optional
/// `tcp://` prefix.
pub async fn listen_and_serve(
    signal: oneshot::Sender<io::Result<()>>,
    addr: &str,
    options: Options,
    hub: Arc<Hub>,
) -> crate::Result<()> {
    *hub.boot_signal.lock().unwrap() = Some(signal);

    if let Err(err) = engine::serve(hub.clone(), addr, options).await {
        if let Some(signal) = hub.boot_signal.lock().unwrap().take() {
            let _ = signal.send(Err(io::Error::new(err.kind(), err.to_string())));
        }
        return Err(err.into());
    }
    Ok(())
}
