//! TCP server: listener, accept loop and connection lifecycle hooks.
//!
//! ```text
//! Created ──start()──► Listening ──stop()──► Stopped
//! ```
//!
//! Each accepted socket is checked against `max_connections`, assigned
//! the next connection id, registered with the [`ConnectionManager`] and
//! started on its own task.

use crate::config::Config;
use crate::conn_manager::ConnectionManager;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::router::Router;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Callback run when a connection starts or stops.
pub type ConnectionHook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Optional start/stop callbacks.
#[derive(Default)]
pub(crate) struct Hooks {
    on_start: RwLock<Option<ConnectionHook>>,
    on_stop: RwLock<Option<ConnectionHook>>,
}

impl Hooks {
    pub(crate) fn set_on_start(&self, hook: ConnectionHook) {
        *self.on_start.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub(crate) fn set_on_stop(&self, hook: ConnectionHook) {
        *self.on_stop.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub(crate) fn call_on_start(&self, conn: &Connection) {
        let hook = self
            .on_start
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            debug!(conn_id = conn.id(), "Calling on-start hook");
            hook(conn);
        }
    }

    pub(crate) fn call_on_stop(&self, conn: &Connection) {
        let hook = self
            .on_stop
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            debug!(conn_id = conn.id(), "Calling on-stop hook");
            hook(conn);
        }
    }
}

/// State every connection holds a reference to.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) connections: ConnectionManager,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) hooks: Hooks,
}

impl Shared {
    pub(crate) fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections: ConnectionManager::new(),
            dispatcher: Dispatcher::new(),
            hooks: Hooks::default(),
        })
    }
}

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Stopped,
}

/// Server instance
pub struct Server {
    shared: Arc<Shared>,
    state: Mutex<ServerState>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server {
            shared: Shared::new(config),
            state: Mutex::new(ServerState::Created),
            accept_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn state(&self) -> ServerState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live connections.
    pub fn connections(&self) -> &ConnectionManager {
        &self.shared.connections
    }

    /// Bind `router` to `msg_id`. A duplicate id is a fatal setup error.
    pub fn add_route(&self, msg_id: u32, router: impl Router) -> Result<()> {
        self.shared.dispatcher.add_route(msg_id, router)
    }

    /// Run `hook` right after each connection's tasks are spawned.
    pub fn on_connection_start<F>(&self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.shared.hooks.set_on_start(Arc::new(hook));
    }

    /// Run `hook` when a connection begins teardown.
    pub fn on_connection_stop<F>(&self, hook: F)
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.shared.hooks.set_on_stop(Arc::new(hook));
    }

    /// Bind the listener, start the worker pool (if configured) and spawn
    /// the accept loop. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.lock_state();
            if *state != ServerState::Created {
                return Err(Error::AlreadyStarted);
            }
            *state = ServerState::Listening;
        }

        match self.listen().await {
            Ok(local_addr) => Ok(local_addr),
            Err(e) => {
                *self.lock_state() = ServerState::Created;
                Err(e)
            }
        }
    }

    async fn listen(&self) -> Result<SocketAddr> {
        let config = &self.shared.config;
        let addr = config.listen_addr()?;
        info!(
            name = %config.name,
            address = %addr,
            max_connections = config.max_connections,
            max_package_size = config.max_package_size,
            worker_pool_size = config.worker_pool_size,
            "Starting server"
        );

        let listener = create_listener(addr)?;
        let local_addr = listener.local_addr()?;

        if config.worker_pool_size > 0 {
            self.shared
                .dispatcher
                .start_worker_pool(config.worker_pool_size, config.max_worker_task_len)?;
        }

        let handle = tokio::spawn(accept_loop(listener, Arc::clone(&self.shared)));
        *self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(address = %local_addr, "Server listening");
        Ok(local_addr)
    }

    /// Start, then block until Ctrl-C and stop.
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        self.stop();
        Ok(())
    }

    /// Stop accepting and tear down every live connection.
    pub fn stop(&self) {
        *self.lock_state() = ServerState::Stopped;

        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = accept_task {
            task.abort();
        }

        info!(name = %self.shared.config.name, "Stopping server");
        self.shared.connections.clear_all();
    }
}

/// Accept connections until the task is aborted.
async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let max_connections = shared.config.max_connections;
    let mut ids = ConnIds::default();

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        if shared.connections.len() >= max_connections {
            warn!(peer = %addr, max_connections, "Too many connections, closing");
            drop(stream);
            continue;
        }

        let Some(conn_id) = ids.next() else {
            error!(peer = %addr, "Connection ids exhausted, closing");
            drop(stream);
            continue;
        };
        debug!(conn_id, peer = %addr, "New connection");

        let conn = Connection::new(conn_id, stream, addr, Arc::clone(&shared));
        shared.connections.add(Arc::clone(&conn));

        // A slow on-start hook only delays this connection
        tokio::spawn(async move {
            conn.start();
        });
    }
}

/// Connection ids, handed out in accept order. Ids are never reused, so
/// the sequence ends after `u32::MAX`.
#[derive(Debug, Default)]
struct ConnIds {
    next: u32,
    exhausted: bool,
}

impl ConnIds {
    fn next(&mut self) -> Option<u32> {
        if self.exhausted {
            return None;
        }
        let id = self.next;
        match self.next.checked_add(1) {
            Some(next) => self.next = next,
            None => self.exhausted = true,
        }
        Some(id)
    }
}

/// Create a listening socket with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(TcpListener::from_std(socket.into())?)
}
