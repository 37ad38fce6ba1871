//! Message routing and the worker pool.
//!
//! Requests reach their router either directly (one spawned task per
//! message) or through a fixed pool of workers. In pool mode each
//! connection is pinned to `conn_id % pool_size`, so a connection's
//! messages are handled by one worker in the order they were read.

use crate::error::{Error, Result};
use crate::message::Request;
use crate::router::Router;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Routes requests to registered routers, optionally through a worker pool.
#[derive(Default)]
pub struct Dispatcher {
    routes: Arc<RouteTable>,
    pool: OnceLock<WorkerPool>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `router` to `msg_id`.
    ///
    /// Registering a second router for the same id fails with
    /// [`Error::DuplicateRoute`] and keeps the first one.
    pub fn add_route(&self, msg_id: u32, router: impl Router) -> Result<()> {
        self.routes.insert(msg_id, Arc::new(router))?;
        info!(msg_id, "Route registered");
        Ok(())
    }

    /// Run the router phases for `request` on the calling task.
    pub async fn dispatch(&self, request: &Request) {
        self.routes.dispatch(request).await;
    }

    /// Create `size` queues of `queue_len` requests each and spawn one
    /// worker per queue. May only succeed once.
    pub fn start_worker_pool(&self, size: u32, queue_len: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidWorkerPool("pool size must be nonzero"));
        }
        if queue_len == 0 {
            return Err(Error::InvalidWorkerPool("queue length must be nonzero"));
        }

        let (queues, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| mpsc::channel(queue_len)).unzip();

        self.pool
            .set(WorkerPool { queues })
            .map_err(|_| Error::WorkerPoolStarted)?;

        for (worker_id, receiver) in receivers.into_iter().enumerate() {
            tokio::spawn(run_worker(worker_id, Arc::clone(&self.routes), receiver));
        }

        info!(workers = size, queue_len, "Worker pool started");
        Ok(())
    }

    /// Number of workers, 0 when the pool is not running.
    pub fn worker_pool_size(&self) -> usize {
        self.pool.get().map_or(0, |pool| pool.queues.len())
    }

    /// Push `request` onto its connection's worker queue, waiting while
    /// the queue is full.
    pub async fn enqueue(&self, request: Request) -> Result<()> {
        let pool = self.pool.get().ok_or(Error::WorkerPoolNotStarted)?;
        let worker_id = pool.worker_index(request.connection().id());

        trace!(
            conn_id = request.connection().id(),
            msg_id = request.msg_id(),
            worker_id,
            "Queueing request"
        );

        pool.queues[worker_id]
            .send(request)
            .await
            .map_err(|_| Error::WorkerUnavailable(worker_id))
    }

    /// Hand a freshly read request to the worker pool if it is running,
    /// otherwise handle it on a new task.
    pub async fn submit(&self, request: Request) {
        if self.pool.get().is_some() {
            if let Err(e) = self.enqueue(request).await {
                warn!(error = %e, "Dropping request");
            }
        } else {
            let routes = Arc::clone(&self.routes);
            tokio::spawn(async move {
                routes.dispatch(&request).await;
            });
        }
    }
}

/// Message id to router map. Written during setup, read on every request.
#[derive(Default)]
struct RouteTable {
    routes: RwLock<HashMap<u32, Arc<dyn Router>>>,
}

impl RouteTable {
    fn insert(&self, msg_id: u32, router: Arc<dyn Router>) -> Result<()> {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.entry(msg_id) {
            Entry::Occupied(_) => Err(Error::DuplicateRoute(msg_id)),
            Entry::Vacant(slot) => {
                slot.insert(router);
                Ok(())
            }
        }
    }

    fn get(&self, msg_id: u32) -> Option<Arc<dyn Router>> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        routes.get(&msg_id).cloned()
    }

    async fn dispatch(&self, request: &Request) {
        let Some(router) = self.get(request.msg_id()) else {
            warn!(
                conn_id = request.connection().id(),
                msg_id = request.msg_id(),
                "No router registered for message"
            );
            return;
        };

        router.pre_handle(request).await;
        router.handle(request).await;
        router.post_handle(request).await;
    }
}

struct WorkerPool {
    queues: Vec<mpsc::Sender<Request>>,
}

impl WorkerPool {
    fn worker_index(&self, conn_id: u32) -> usize {
        conn_id as usize % self.queues.len()
    }
}

/// Process one queue until every sender is gone.
///
/// Each request runs on its own task and is awaited before the next one,
/// so a panicking router loses that request only and the queue keeps its
/// order.
async fn run_worker(worker_id: usize, routes: Arc<RouteTable>, mut queue: mpsc::Receiver<Request>) {
    debug!(worker_id, "Worker started");
    while let Some(request) = queue.recv().await {
        let conn_id = request.connection().id();
        let msg_id = request.msg_id();

        let routes = Arc::clone(&routes);
        let handled = tokio::spawn(async move {
            routes.dispatch(&request).await;
        })
        .await;

        if let Err(e) = handled {
            error!(worker_id, conn_id, msg_id, error = %e, "Router failed");
        }
    }
    debug!(worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::connection_pair;
    use crate::message::Message;
    use crate::server::Shared;
    use crate::Config;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<(u32, u32, &'static str)>>>;

    /// Records every phase as `(conn_id, msg_id, phase)`.
    struct Recorder {
        log: Log,
        tag: &'static str,
    }

    #[async_trait]
    impl Router for Recorder {
        async fn pre_handle(&self, request: &Request) {
            self.push(request, "pre");
        }

        async fn handle(&self, request: &Request) {
            self.push(request, self.tag);
        }

        async fn post_handle(&self, request: &Request) {
            self.push(request, "post");
        }
    }

    impl Recorder {
        fn push(&self, request: &Request, phase: &'static str) {
            self.log
                .lock()
                .unwrap()
                .push((request.connection().id(), request.msg_id(), phase));
        }
    }

    /// Implements only the required phase.
    struct HandleOnly(Log);

    #[async_trait]
    impl Router for HandleOnly {
        async fn handle(&self, request: &Request) {
            self.0
                .lock()
                .unwrap()
                .push((request.connection().id(), request.msg_id(), "handle"));
        }
    }

    async fn wait_for_len(log: &Log, len: usize) {
        for _ in 0..200 {
            if log.lock().unwrap().len() >= len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {len} log entries");
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let shared = Shared::new(Config::default());
        let (conn, _peer) = connection_pair(&shared, 4).await;

        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher
            .add_route(1, Recorder { log: log.clone(), tag: "handle" })
            .unwrap();

        dispatcher
            .dispatch(&Request::new(conn, Message::new(1, &b"x"[..])))
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![(4, 1, "pre"), (4, 1, "handle"), (4, 1, "post")]
        );
    }

    #[tokio::test]
    async fn test_default_phases_are_noops() {
        let shared = Shared::new(Config::default());
        let (conn, _peer) = connection_pair(&shared, 0).await;

        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_route(9, HandleOnly(log.clone())).unwrap();

        dispatcher
            .dispatch(&Request::new(conn, Message::new(9, &b""[..])))
            .await;

        assert_eq!(*log.lock().unwrap(), vec![(0, 9, "handle")]);
    }

    #[tokio::test]
    async fn test_duplicate_route_keeps_first() {
        let shared = Shared::new(Config::default());
        let (conn, _peer) = connection_pair(&shared, 1).await;

        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher
            .add_route(3, Recorder { log: log.clone(), tag: "first" })
            .unwrap();

        let err = dispatcher
            .add_route(3, Recorder { log: log.clone(), tag: "second" })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRoute(3)));
        assert!(err.is_fatal());

        dispatcher
            .dispatch(&Request::new(conn, Message::new(3, &b""[..])))
            .await;
        assert!(log.lock().unwrap().iter().any(|entry| entry.2 == "first"));
        assert!(!log.lock().unwrap().iter().any(|entry| entry.2 == "second"));
    }

    #[tokio::test]
    async fn test_unknown_message_is_dropped() {
        let shared = Shared::new(Config::default());
        let (conn, _peer) = connection_pair(&shared, 2).await;

        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_route(1, HandleOnly(log.clone())).unwrap();

        dispatcher
            .dispatch(&Request::new(Arc::clone(&conn), Message::new(42, &b""[..])))
            .await;

        assert!(log.lock().unwrap().is_empty());
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_invalid_pool_rejected() {
        let dispatcher = Dispatcher::new();
        assert!(matches!(
            dispatcher.start_worker_pool(0, 16),
            Err(Error::InvalidWorkerPool(_))
        ));
        assert!(matches!(
            dispatcher.start_worker_pool(4, 0),
            Err(Error::InvalidWorkerPool(_))
        ));
        assert_eq!(dispatcher.worker_pool_size(), 0);
    }

    #[tokio::test]
    async fn test_pool_starts_once() {
        let dispatcher = Dispatcher::new();
        dispatcher.start_worker_pool(2, 8).unwrap();
        assert_eq!(dispatcher.worker_pool_size(), 2);
        assert!(matches!(
            dispatcher.start_worker_pool(2, 8),
            Err(Error::WorkerPoolStarted)
        ));
    }

    #[tokio::test]
    async fn test_enqueue_without_pool() {
        let shared = Shared::new(Config::default());
        let (conn, _peer) = connection_pair(&shared, 0).await;

        let dispatcher = Dispatcher::new();
        let err = dispatcher
            .enqueue(Request::new(conn, Message::new(1, &b""[..])))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkerPoolNotStarted));
    }

    #[test]
    fn test_worker_index_partitioning() {
        let (queues, _receivers): (Vec<_>, Vec<_>) =
            (0..3).map(|_| mpsc::channel::<Request>(1)).unzip();
        let pool = WorkerPool { queues };

        assert_eq!(pool.worker_index(0), 0);
        assert_eq!(pool.worker_index(4), 1);
        assert_eq!(pool.worker_index(5), 2);
        assert_eq!(pool.worker_index(u32::MAX), (u32::MAX % 3) as usize);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_preserves_per_connection_order() {
        let shared = Shared::new(Config::default());
        let log = Log::default();

        let dispatcher = Dispatcher::new();
        for msg_id in 0..10 {
            dispatcher.add_route(msg_id, HandleOnly(log.clone())).unwrap();
        }
        dispatcher.start_worker_pool(2, 4).unwrap();

        let mut conns = Vec::new();
        let mut peers = Vec::new();
        for conn_id in 0..4 {
            let (conn, peer) = connection_pair(&shared, conn_id).await;
            conns.push(conn);
            peers.push(peer);
        }

        // Interleave connections; each sends ids 0..10 in order
        for msg_id in 0..10 {
            for conn in &conns {
                dispatcher
                    .submit(Request::new(Arc::clone(conn), Message::new(msg_id, &b""[..])))
                    .await;
            }
        }

        wait_for_len(&log, 40).await;

        let log = log.lock().unwrap();
        for conn_id in 0..4 {
            let seen: Vec<u32> = log
                .iter()
                .filter(|entry| entry.0 == conn_id)
                .map(|entry| entry.1)
                .collect();
            assert_eq!(seen, (0..10).collect::<Vec<_>>());
        }
    }

    struct Panics;

    #[async_trait]
    impl Router for Panics {
        async fn handle(&self, _request: &Request) {
            panic!("router bug");
        }
    }

    #[tokio::test]
    async fn test_worker_survives_router_panic() {
        let shared = Shared::new(Config::default());
        let (first, _peer_a) = connection_pair(&shared, 0).await;
        let (second, _peer_b) = connection_pair(&shared, 1).await;

        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_route(1, Panics).unwrap();
        dispatcher.add_route(2, HandleOnly(log.clone())).unwrap();
        dispatcher.start_worker_pool(1, 4).unwrap();

        dispatcher
            .enqueue(Request::new(first, Message::new(1, &b""[..])))
            .await
            .unwrap();

        // Both connections share worker 0, which must still be serving
        for _ in 0..3 {
            dispatcher
                .enqueue(Request::new(Arc::clone(&second), Message::new(2, &b""[..])))
                .await
                .unwrap();
        }

        wait_for_len(&log, 3).await;
        assert_eq!(*log.lock().unwrap(), vec![(1, 2, "handle"); 3]);
    }

    #[tokio::test]
    async fn test_direct_mode_spawns() {
        let shared = Shared::new(Config::default());
        let (conn, _peer) = connection_pair(&shared, 7).await;

        let log = Log::default();
        let dispatcher = Dispatcher::new();
        dispatcher.add_route(2, HandleOnly(log.clone())).unwrap();

        dispatcher
            .submit(Request::new(conn, Message::new(2, &b"hi"[..])))
            .await;

        wait_for_len(&log, 1).await;
        assert_eq!(*log.lock().unwrap(), vec![(7, 2, "handle")]);
    }
}
