//! # netframe - An Embeddable TCP Server Engine
//!
//! netframe runs the plumbing of a line- or block-oriented network protocol
//! server (SMTP, LMTP, IMAP, POP3 and the like) and leaves the protocol
//! itself to a handler you plug in.
//!
//! ## Features
//!
//! - **One IO thread**: accepts, waits for readiness and writes without
//!   blocking; handler code never runs on it
//! - **Bounded worker pool**: handler callbacks run here and may block
//! - **Pluggable framing**: matchers cut PDUs out of the byte stream (lines,
//!   dot-terminated blocks, fixed-size literals) and can be switched per PDU
//! - **STARTTLS**: a TLS filter (rustls) can be installed mid-connection
//! - **Pooled read buffers**: fixed-size, zeroed on reuse
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                Server                                   │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │  Listener   │───>│ Connection  │───>│  Handler    │ (your protocol)  │
//! │  │ (IO thread) │    │             │    │ (worker)    │                  │
//! │  └─────────────┘    └──────┬──────┘    └─────────────┘                  │
//! │                            │                                            │
//! │         ┌──────────────────┼──────────────────┬───────────────┐         │
//! │         ▼                  ▼                  ▼               ▼         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  ┌───────────┐   │
//! │  │ BufferPool  │    │  Matcher    │    │   Filter    │  │  Write    │   │
//! │  │             │    │ CRLF, count │    │ (TLS)       │  │  Queue    │   │
//! │  └─────────────┘    └─────────────┘    └─────────────┘  └───────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use netframe::connection::{Connection, ConnectionHandler};
//! use netframe::matcher::SequenceMatcher;
//! use netframe::server::{Server, ServerConfig};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_connect(&mut self, conn: &Connection) -> anyhow::Result<()> {
//!         conn.set_matcher(SequenceMatcher::crlf());
//!         conn.write_line("+OK")?;
//!         Ok(())
//!     }
//!
//!     fn on_input(&mut self, conn: &Connection, pdu: &[u8], matched: bool) -> anyhow::Result<()> {
//!         if !matched {
//!             conn.write_line("-ERR line too long")?;
//!             return Ok(());
//!         }
//!         match pdu {
//!             b"QUIT" => conn.close(),
//!             line => conn.write_line(&String::from_utf8_lossy(line))?,
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let config = ServerConfig {
//!     port: 7025,
//!     ..Default::default()
//! };
//! let server = Server::start(config, |_: &Connection| {
//!     Box::new(Echo) as Box<dyn ConnectionHandler>
//! })?;
//!
//! // ... later
//! server.shutdown();
//! server.join()?;
//! # Ok::<(), netframe::server::ServerError>(())
//! ```
//!
//! ## Module Overview
//!
//! - [`buffer`]: pooled fixed-size read buffers
//! - [`matcher`]: PDU boundary detection
//! - [`filter`]: byte filters, TLS in particular
//! - [`connection`]: per-connection state and the handler traits
//! - [`server`]: listener, IO thread, worker pool, configuration
//! - [`snoop`]: traffic dumps for debugging
//! - [`util`]: helpers for handler implementations
//!
//! ## Design Highlights
//!
//! ### Ordered Input Without Per-Connection Threads
//!
//! Read interest is switched off before a read is handed to a worker and
//! switched back on when the worker is done. A connection therefore never
//! has two reads in flight, and its PDUs reach the handler in order, while
//! the worker pool stays shared by all connections.
//!
//! ### Single Writer For Interest
//!
//! Only the IO thread changes what a connection waits for. Workers ask for
//! changes by queuing a task for the IO thread.

pub mod buffer;
pub mod connection;
pub mod filter;
pub mod matcher;
pub mod server;
pub mod snoop;
pub mod util;

// Re-export commonly used types for convenience
pub use buffer::{BufferPool, PooledBuffer};
pub use connection::{Connection, ConnectionError, ConnectionHandler, HandlerFactory};
pub use filter::{Filter, TlsFilter};
pub use matcher::{AllMatcher, CountingMatcher, Matcher, SequenceMatcher};
pub use server::{Server, ServerConfig, ServerError};
pub use snoop::{Snooper, TracingSnooper};

/// The default port servers listen on
pub const DEFAULT_PORT: u16 = 7025;

/// The default host servers bind to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default read buffer size, which is also the longest PDU delivered whole
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Version of netframe
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
