//! One accepted client connection.
//!
//! A started connection runs two tasks:
//!
//! ```text
//!   socket ──► reader task ──► Dispatcher ──► Router
//!                                               │ send_message
//!   socket ◄── writer task ◄── outbound channel ◄┘
//! ```
//!
//! The reader owns the read half and is the only place teardown starts
//! on its own (EOF, I/O or framing error). The writer owns the write half
//! and is the only task that writes to the socket; it exits when the
//! single-shot termination signal fires during [`Connection::stop`], even
//! in the middle of a frame the peer is not reading.

use crate::codec::Codec;
use crate::conn_manager::ManagedConnection;
use crate::error::{Error, Result};
use crate::message::{Message, Request};
use crate::server::Shared;
use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

/// Opaque value stored in a connection's property store.
pub type Property = Arc<dyn Any + Send + Sync>;

/// Outbound frames the writer has not picked up yet. A single slot makes
/// `send_message` wait for the writer.
const OUTBOUND_CAPACITY: usize = 1;

/// A client connection with its property store and send path.
pub struct Connection {
    id: u32,
    remote_addr: SocketAddr,
    codec: Codec,
    shared: Arc<Shared>,
    state: Mutex<ConnState>,
    properties: RwLock<HashMap<String, Property>>,
}

/// Everything `stop()` has to check and release atomically.
struct ConnState {
    closed: bool,
    msg_tx: Option<mpsc::Sender<Bytes>>,
    exit_tx: Option<oneshot::Sender<()>>,
    reader: Option<AbortHandle>,
    /// Socket halves and channel ends waiting for `start()`.
    idle: Option<Idle>,
}

struct Idle {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    msg_rx: mpsc::Receiver<Bytes>,
    exit_rx: oneshot::Receiver<()>,
}

impl Connection {
    pub(crate) fn new(
        id: u32,
        stream: TcpStream,
        remote_addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let (msg_tx, msg_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        Arc::new(Self {
            id,
            remote_addr,
            codec: Codec::new(shared.config.max_package_size),
            shared,
            state: Mutex::new(ConnState {
                closed: false,
                msg_tx: Some(msg_tx),
                exit_tx: Some(exit_tx),
                reader: None,
                idle: Some(Idle {
                    reader,
                    writer,
                    msg_rx,
                    exit_rx,
                }),
            }),
            properties: RwLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the reader and writer tasks, then run the on-start hook.
    pub fn start(self: &Arc<Self>) {
        let idle = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.idle.take()
        };
        let Some(idle) = idle else {
            warn!(conn_id = self.id, "Connection already started");
            return;
        };

        info!(conn_id = self.id, peer = %self.remote_addr, "Connection started");

        let reader = tokio::spawn(Arc::clone(self).read_loop(idle.reader));
        tokio::spawn(Arc::clone(self).write_loop(idle.writer, idle.msg_rx, idle.exit_rx));

        {
            let mut state = self.lock_state();
            if state.closed {
                // stop() already ran its hook; on-start must not follow it
                reader.abort();
                return;
            }
            state.reader = Some(reader.abort_handle());
        }

        self.shared.hooks.call_on_start(self);
    }

    /// Tear the connection down. Calls after the first are no-ops.
    pub fn stop(&self) {
        let (msg_tx, exit_tx, reader, idle) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.msg_tx.take(),
                state.exit_tx.take(),
                state.reader.take(),
                state.idle.take(),
            )
        };

        info!(conn_id = self.id, peer = %self.remote_addr, "Connection stopping");

        self.shared.hooks.call_on_stop(self);

        // Close the socket: the read half goes with the reader task (or the
        // idle halves if never started), the writer drops its half on exit.
        if let Some(reader) = reader {
            reader.abort();
        }
        drop(idle);
        if let Some(exit_tx) = exit_tx {
            let _ = exit_tx.send(());
        }

        self.shared.connections.remove(self);

        drop(msg_tx);
    }

    /// Encode a frame and wait until the writer task accepts it.
    pub async fn send_message(&self, msg_id: u32, data: impl Into<Bytes>) -> Result<()> {
        let tx = self.outbound()?;
        let frame = self.codec.encode(&Message::new(msg_id, data));
        tx.send(frame).await.map_err(|_| Error::ConnectionClosed)
    }

    /// Like [`send_message`](Self::send_message) but never waits; fails with
    /// [`Error::OutboundFull`] if the writer has not drained the last frame.
    pub fn try_send_message(&self, msg_id: u32, data: impl Into<Bytes>) -> Result<()> {
        let tx = self.outbound()?;
        let frame = self.codec.encode(&Message::new(msg_id, data));
        tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::OutboundFull,
            TrySendError::Closed(_) => Error::ConnectionClosed,
        })
    }

    /// Clone the outbound sender under the state lock so a concurrent
    /// `stop()` either happens entirely before or after the check.
    fn outbound(&self) -> Result<mpsc::Sender<Bytes>> {
        self.lock_state()
            .msg_tx
            .clone()
            .ok_or(Error::ConnectionClosed)
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Any + Send + Sync) {
        let mut properties = self
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        properties.insert(key.into(), Arc::new(value));
    }

    pub fn get_property(&self, key: &str) -> Result<Property> {
        let properties = self
            .properties
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        properties
            .get(key)
            .cloned()
            .ok_or_else(|| Error::PropertyNotFound(key.to_string()))
    }

    /// Typed read of a property.
    pub fn property<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>> {
        self.get_property(key)?
            .downcast::<T>()
            .map_err(|_| Error::PropertyTypeMismatch(key.to_string()))
    }

    pub fn remove_property(&self, key: &str) -> Option<Property> {
        let mut properties = self
            .properties
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        properties.remove(key)
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        debug!(conn_id = self.id, "Reader running");

        loop {
            match self.codec.read_message(&mut reader).await {
                Ok(msg) => {
                    trace!(
                        conn_id = self.id,
                        msg_id = msg.id(),
                        len = msg.data_len(),
                        "Frame received"
                    );
                    let request = Request::new(Arc::clone(&self), msg);
                    self.shared.dispatcher.submit(request).await;
                }
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!(conn_id = self.id, "Peer closed connection");
                    break;
                }
                Err(e) => {
                    warn!(conn_id = self.id, error = %e, "Read failed");
                    break;
                }
            }
        }

        self.stop();
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut msg_rx: mpsc::Receiver<Bytes>,
        mut exit_rx: oneshot::Receiver<()>,
    ) {
        debug!(conn_id = self.id, "Writer running");

        loop {
            tokio::select! {
                biased;
                _ = &mut exit_rx => break,
                frame = msg_rx.recv() => {
                    let Some(frame) = frame else { break };
                    // A peer that stops reading must not keep the writer
                    // past stop()
                    tokio::select! {
                        biased;
                        _ = &mut exit_rx => {
                            debug!(conn_id = self.id, len = frame.len(), "Write abandoned");
                            break;
                        }
                        result = writer.write_all(&frame) => {
                            if let Err(e) = result {
                                debug!(conn_id = self.id, error = %e, "Write failed");
                                break;
                            }
                        }
                    }
                }
            }
        }

        let _ = writer.shutdown().await;
        debug!(conn_id = self.id, "Writer exited");
    }
}

impl ManagedConnection for Connection {
    fn conn_id(&self) -> u32 {
        self.id
    }

    fn stop(&self) {
        Connection::stop(self);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}
