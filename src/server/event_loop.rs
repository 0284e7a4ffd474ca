//! The IO thread: accept loop, task draining and per-connection channel
//! drivers.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, trace};

use super::{ServerShared, OP_READ, OP_WRITE};
use crate::connection::Connection;

/// Pause after a failed accept, so a persistent error (e.g. out of file
/// descriptors) does not spin the IO thread.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Body of the IO thread.
pub(super) fn run_io_thread(shared: Arc<ServerShared>, listener: std::net::TcpListener, runtime: Runtime) {
    let _ = shared.io_thread.set(std::thread::current().id());

    runtime.block_on(async {
        match TcpListener::from_std(listener) {
            Ok(listener) => accept_loop(&shared, listener).await,
            Err(e) => error!(error = %e, "Failed to register listener"),
        }

        shared.close_all("server shutdown");
        shared.run_pending_tasks();
    });

    shared.workers.shutdown(shared.config.shutdown_timeout);
    // tasks queued by workers after the loop stopped
    shared.run_pending_tasks();
    drop(runtime);
    shared.pool.destroy();

    info!(name = %shared.config.name, "Server stopped");
}

async fn accept_loop(shared: &Arc<ServerShared>, listener: TcpListener) {
    debug!(name = %shared.config.name, "Event loop running");

    while !shared.is_shutting_down() {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => shared.accept(stream, peer),
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            _ = shared.wakeup.notified() => {}
        }

        shared.run_pending_tasks();
    }

    debug!(name = %shared.config.name, "Event loop stopping");
}

/// Waits for the readiness a connection's key asks for and dispatches it,
/// until the key is cancelled.
pub(super) async fn drive_channel(conn: Arc<Connection>) {
    let Some(stream) = conn.stream() else {
        return;
    };
    let key = conn.key();

    while !key.is_cancelled() {
        let interest = key.interest();

        tokio::select! {
            biased;

            _ = key.changed() => {}

            ready = stream.readable(), if interest & OP_READ != 0 => match ready {
                Ok(()) => conn.on_readable(),
                Err(e) => conn.on_channel_error(e),
            },

            ready = stream.writable(), if interest & OP_WRITE != 0 => match ready {
                Ok(()) => conn.on_writable(),
                Err(e) => conn.on_channel_error(e),
            },
        }
    }

    trace!(conn = conn.id(), "Channel driver finished");
}
