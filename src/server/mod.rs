//! Server and Event Loop
//!
//! A [`Server`] owns a listening socket, one IO thread and a worker pool.
//!
//! ```text
//!                    ┌──────────────────────── IO thread ("{name}-io") ───────────────┐
//!                    │                                                                 │
//!   clients ────────>│  event loop: accept ──> Connection::new ──> channel driver     │
//!                    │              wake-up ──> run queued ServerTasks                 │
//!                    │                                                                 │
//!                    │  channel drivers (one per connection):                          │
//!                    │     readable ──> on_readable ──┐                               │
//!                    │     writable ──> on_writable   │ (drains the write queue)      │
//!                    └────────────────────────────────┼────────────────────────────────┘
//!                              ▲                      │ execute
//!                 ServerTask   │                      ▼
//!                 (interest,   │      ┌──────── worker pool ("{name}-worker") ─────────┐
//!                  close)      └──────│  process_read ──> matcher ──> handler.on_input  │
//!                                     │  on_connect / on_disconnect / on_idle_timeout   │
//!                                     └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading Rules
//!
//! - The IO thread only waits for readiness, accepts, writes without
//!   blocking and changes interest. It never runs handler code.
//! - Workers run handler code and the read path. They never change interest
//!   directly: they queue a [`ServerTask`] and wake the event loop. A task
//!   scheduled from the IO thread itself runs inline.
//! - Read interest is off while a read is being processed, so each
//!   connection has at most one read in flight and its input stays ordered.
//!
//! ## Shutdown
//!
//! [`Server::shutdown`] only sets a flag and wakes the loop. The IO thread
//! then closes every connection, stops accepting work on the pool, waits up
//! to [`ServerConfig::shutdown_timeout`] for running handler code and drops
//! its runtime. [`Server::join`] waits for all of that.

pub mod config;
mod event_loop;
mod selector;
pub mod stats;
mod workers;


pub use config::ServerConfig;
pub use stats::{ServerStats, StatsSnapshot};

pub(crate) use selector::{SelectionKey, OP_READ, OP_WRITE};

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::buffer::{BufferPool, PoolStats};
use crate::connection::{Connection, HandlerFactory};
use crate::snoop::Snooper;
use crate::util::lock;
use workers::WorkerPool;

/// Errors from starting or stopping a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or runtime setup failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The IO thread died from a panic
    #[error("IO thread panicked")]
    IoThreadPanicked,
}

/// Work that has to run on the IO thread.
pub(crate) enum ServerTask {
    EnableRead(Arc<Connection>),
    DisableRead(Arc<Connection>),
    EnableWrite(Arc<Connection>),
    Close(Arc<Connection>, &'static str),
}

impl ServerTask {
    fn name(&self) -> &'static str {
        match self {
            ServerTask::EnableRead(_) => "enable read",
            ServerTask::DisableRead(_) => "disable read",
            ServerTask::EnableWrite(_) => "enable write",
            ServerTask::Close(..) => "close",
        }
    }

    fn run(self) {
        match self {
            ServerTask::EnableRead(conn) => {
                if !conn.is_closed() {
                    conn.key().add(OP_READ);
                }
            }
            ServerTask::DisableRead(conn) => conn.key().remove(OP_READ),
            ServerTask::EnableWrite(conn) => {
                if !conn.is_closed() {
                    conn.key().add(OP_WRITE);
                }
            }
            ServerTask::Close(conn, reason) => conn.close_channel(reason),
        }
    }
}

/// State shared by the server handle, the IO thread and every connection.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) pool: BufferPool,
    pub(crate) factory: Box<dyn HandlerFactory>,
    pub(crate) snooper: Option<Arc<dyn Snooper>>,
    pub(crate) stats: ServerStats,
    /// Handle of the IO runtime, for timers and channel drivers
    pub(crate) io_handle: Handle,
    workers: Arc<WorkerPool>,
    tasks: Mutex<Vec<ServerTask>>,
    wakeup: Notify,
    shutdown: AtomicBool,
    io_thread: OnceLock<ThreadId>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
}

impl ServerShared {
    fn on_io_thread(&self) -> bool {
        self.io_thread.get() == Some(&thread::current().id())
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Runs `task` on the IO thread: inline when already there, otherwise
    /// queued for the next event loop iteration.
    pub(crate) fn schedule(&self, task: ServerTask) {
        if self.on_io_thread() {
            run_task(task);
            return;
        }
        lock(&self.tasks).push(task);
        self.wakeup.notify_one();
    }

    /// Runs `task` on the worker pool. Returns false once the pool no longer
    /// accepts work.
    pub(crate) fn execute<F>(&self, name: &'static str, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.workers.execute(name, task)
    }

    fn run_pending_tasks(&self) {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            run_task(task);
        }
    }

    /// Registers a freshly accepted socket. IO thread only.
    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let conn = match Connection::new(Arc::clone(self), stream, peer) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to set up connection");
                return;
            }
        };

        self.stats.connection_opened();
        lock(&self.connections).insert(conn.id(), Arc::clone(&conn));
        info!(conn = conn.id(), peer = %peer, "Connection accepted");

        tokio::spawn(event_loop::drive_channel(Arc::clone(&conn)));
        conn.start();
    }

    pub(crate) fn unregister(&self, id: u64) {
        lock(&self.connections).remove(&id);
    }

    fn close_all(&self, reason: &'static str) {
        let live: Vec<_> = lock(&self.connections).values().cloned().collect();
        for conn in live {
            conn.close_channel(reason);
        }
    }
}

fn run_task(task: ServerTask) {
    let name = task.name();
    if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
        error!(task = name, "IO task panicked");
    }
}

/// A running server.
///
/// # Example
///
/// ```no_run
/// use netframe::connection::{Connection, ConnectionHandler};
/// use netframe::server::{Server, ServerConfig};
///
/// struct Hello;
///
/// impl ConnectionHandler for Hello {
///     fn on_connect(&mut self, conn: &Connection) -> anyhow::Result<()> {
///         conn.write_line("hello")?;
///         conn.close();
///         Ok(())
///     }
///
///     fn on_input(&mut self, _: &Connection, _: &[u8], _: bool) -> anyhow::Result<()> {
///         Ok(())
///     }
/// }
///
/// let server = Server::start(ServerConfig::default(), |_: &Connection| {
///     Box::new(Hello) as Box<dyn ConnectionHandler>
/// })?;
/// println!("listening on {}", server.local_addr());
/// server.shutdown();
/// server.join()?;
/// # Ok::<(), netframe::server::ServerError>(())
/// ```
pub struct Server {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Binds the listener and starts the IO thread and worker pool.
    ///
    /// Bind errors are returned here rather than surfacing on the IO thread.
    pub fn start<F>(config: ServerConfig, factory: F) -> Result<Self, ServerError>
    where
        F: HandlerFactory + 'static,
    {
        Self::launch(config, Box::new(factory), None)
    }

    /// Like [`start`](Self::start), with a snooper observing all traffic.
    pub fn start_with_snooper<F>(
        config: ServerConfig,
        factory: F,
        snooper: Arc<dyn Snooper>,
    ) -> Result<Self, ServerError>
    where
        F: HandlerFactory + 'static,
    {
        Self::launch(config, Box::new(factory), Some(snooper))
    }

    fn launch(
        config: ServerConfig,
        factory: Box<dyn HandlerFactory>,
        snooper: Option<Arc<dyn Snooper>>,
    ) -> Result<Self, ServerError> {
        let listener = std::net::TcpListener::bind(config.bind_address())?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let io_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let workers = WorkerPool::new(&config.name, config.worker_threads)?;

        let shared = Arc::new(ServerShared {
            pool: BufferPool::new(config.read_buffer_size),
            factory,
            snooper,
            stats: ServerStats::new(),
            io_handle: io_runtime.handle().clone(),
            workers,
            tasks: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
            shutdown: AtomicBool::new(false),
            io_thread: OnceLock::new(),
            connections: Mutex::new(HashMap::new()),
            config,
        });

        let thread = thread::Builder::new()
            .name(format!("{}-io", shared.config.name))
            .spawn({
                let shared = Arc::clone(&shared);
                move || event_loop::run_io_thread(shared, listener, io_runtime)
            })?;

        info!(
            name = %shared.config.name,
            addr = %local_addr,
            workers = shared.config.worker_threads,
            buffer_size = shared.config.read_buffer_size,
            "Server started"
        );

        Ok(Self {
            shared,
            local_addr,
            thread: Some(thread),
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Asks the server to stop. Returns immediately; see [`join`](Self::join).
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            info!(name = %self.shared.config.name, "Shutdown requested");
        }
        self.shared.wakeup.notify_one();
    }

    /// Waits for the IO thread to finish its shutdown.
    pub fn join(mut self) -> Result<(), ServerError> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| ServerError::IoThreadPanicked),
            None => Ok(()),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown();
            let _ = thread.join();
        }
    }
}
