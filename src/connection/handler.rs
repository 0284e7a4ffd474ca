//! Connection Handler Plugin
//!
//! The engine knows nothing about the protocol it carries. Everything
//! protocol specific lives in a [`ConnectionHandler`], one per connection,
//! created by the embedder's [`HandlerFactory`] when the connection is
//! accepted.
//!
//! ## Callback Lifecycle
//!
//! ```text
//! 1. accept
//!        │
//!        ▼
//! 2. factory.new_handler(conn)        (worker thread)
//!        │
//!        ▼
//! 3. on_connect(conn)                 greet, pick the first matcher
//!        │
//!        ▼
//! 4. ┌──────────────────────────────┐
//!    │ on_input(conn, pdu, matched) │ once per framed PDU, in order
//!    │ on_idle_timeout(conn)        │ when an alarm fires
//!    └──────────────┬───────────────┘
//!                   │ close / EOF / error
//!                   ▼
//! 5. on_disconnect(conn)              exactly once
//! ```
//!
//! Callbacks for one connection never run concurrently: they are
//! serialized by the connection. They do run on worker threads, so a
//! handler may block (e.g. on a database) without stalling other
//! connections' IO.
//!
//! ## Errors
//!
//! A callback that returns an error, or panics, closes its connection. The
//! error is logged with the connection's id and peer; other connections are
//! unaffected.

use super::Connection;

/// Per-connection protocol logic.
///
/// # Example
///
/// ```
/// use netframe::connection::{Connection, ConnectionHandler};
/// use netframe::matcher::SequenceMatcher;
///
/// struct Echo;
///
/// impl ConnectionHandler for Echo {
///     fn on_connect(&mut self, conn: &Connection) -> anyhow::Result<()> {
///         conn.set_matcher(SequenceMatcher::crlf());
///         conn.write_line("+OK echo ready")?;
///         Ok(())
///     }
///
///     fn on_input(&mut self, conn: &Connection, pdu: &[u8], _matched: bool) -> anyhow::Result<()> {
///         let mut line = pdu.to_vec();
///         line.extend_from_slice(b"\r\n");
///         conn.write(line, true)?;
///         Ok(())
///     }
/// }
/// ```
pub trait ConnectionHandler: Send {
    /// The connection was accepted.
    fn on_connect(&mut self, conn: &Connection) -> anyhow::Result<()>;

    /// A PDU was framed.
    ///
    /// `matched` is true when the active matcher completed on it, in which
    /// case the terminator has already been trimmed. It is false when the
    /// read buffer filled up before the matcher completed (the bytes are the
    /// whole buffer) or when no matcher is installed.
    fn on_input(&mut self, conn: &Connection, pdu: &[u8], matched: bool) -> anyhow::Result<()>;

    /// The connection is gone. Writes are no longer possible.
    fn on_disconnect(&mut self, _conn: &Connection) {}

    /// The connection's alarm fired. By default the connection is closed.
    fn on_idle_timeout(&mut self, conn: &Connection) -> anyhow::Result<()> {
        conn.close();
        Ok(())
    }
}

/// Creates a handler for every accepted connection.
pub trait HandlerFactory: Send + Sync {
    fn new_handler(&self, conn: &Connection) -> Box<dyn ConnectionHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&Connection) -> Box<dyn ConnectionHandler> + Send + Sync,
{
    fn new_handler(&self, conn: &Connection) -> Box<dyn ConnectionHandler> {
        self(conn)
    }
}
