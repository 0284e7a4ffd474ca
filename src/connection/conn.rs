//! The engine's per-connection state and its read, write and close paths.
//!
//! ## Locks
//!
//! ```text
//!   read ──> handler ──> filter ──> writes
//! ```
//!
//! A thread holding one of these only ever takes locks to its right. Handler
//! callbacks run with `read` (input) or nothing (connect, alarms, disconnect)
//! held besides `handler` itself, so handler code may call any public method.
//! The matcher slot and the alarm slot are leaf locks and are never held
//! across a call out. The IO thread never blocks on `read` or `handler`.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Span};

use super::framing::{Flow, Framer, MatcherSlot};
use super::handler::ConnectionHandler;
use super::write_queue::{Drain, WriteQueue};
use super::ConnectionError;
use crate::filter::{Filter, FilterError, FilterIo, FilterOutput};
use crate::matcher::{Matcher, CRLF};
use crate::server::{SelectionKey, ServerShared, ServerTask, OP_READ, OP_WRITE};
use crate::util::lock;

/// Source of connection ids.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Read-side state, touched by one worker at a time.
#[derive(Debug)]
struct ReadState {
    framer: Framer,
    /// Ciphertext staging for filtered reads
    wire: Vec<u8>,
}

#[derive(Default)]
struct AlarmSlot {
    task: Option<JoinHandle<()>>,
    generation: u64,
}

/// How a read pass ended.
enum ReadOutcome {
    Data,
    Spurious,
    Eof,
}

/// A client connection.
///
/// Handlers get a `&Connection` in every callback and use it to choose how
/// input is framed, to write, and to close. Every method is safe to call
/// from any thread.
pub struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    span: Span,
    this: Weak<Connection>,
    server: Arc<ServerShared>,
    key: SelectionKey,
    stream: Mutex<Option<Arc<TcpStream>>>,

    read: Mutex<ReadState>,
    matcher: Mutex<MatcherSlot>,
    filter: Mutex<Option<Box<dyn Filter>>>,
    /// Bumped whenever a filter is added or removed
    filter_generation: AtomicU64,
    writes: WriteQueue,
    handler: Mutex<Option<Box<dyn ConnectionHandler>>>,

    /// The channel is closed and the connection unregistered
    closed: AtomicBool,
    /// A close was requested; no more input is processed
    closing: AtomicBool,
    /// The filter waits for the write queue to drain
    handshake_paused: AtomicBool,

    alarm: Mutex<AlarmSlot>,
    properties: Mutex<HashMap<String, String>>,
}

impl Connection {
    pub(crate) fn new(
        server: Arc<ServerShared>,
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<Arc<Self>, ConnectionError> {
        let buffer = server.pool.acquire()?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        Ok(Arc::new_cyclic(|this| Self {
            id,
            remote_addr,
            span: info_span!("conn", id, peer = %remote_addr),
            this: this.clone(),
            server,
            key: SelectionKey::new(),
            stream: Mutex::new(Some(Arc::new(stream))),
            read: Mutex::new(ReadState {
                framer: Framer::new(buffer),
                wire: Vec::new(),
            }),
            matcher: Mutex::new(MatcherSlot::default()),
            filter: Mutex::new(None),
            filter_generation: AtomicU64::new(0),
            writes: WriteQueue::new(),
            handler: Mutex::new(None),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            handshake_paused: AtomicBool::new(false),
            alarm: Mutex::new(AlarmSlot::default()),
            properties: Mutex::new(HashMap::new()),
        }))
    }

    // ------------------------------------------------------------------
    // Handler API
    // ------------------------------------------------------------------

    /// Unique, monotonically increasing connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// True once [`close`](Self::close) or [`close_now`](Self::close_now)
    /// was called.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.is_closed()
    }

    /// Frames input with `matcher` from now on.
    ///
    /// Called from `on_input`, the new matcher already applies to the bytes
    /// that followed the PDU being handled.
    pub fn set_matcher<M: Matcher + 'static>(&self, matcher: M) {
        lock(&self.matcher).set(Box::new(matcher));
    }

    /// Removes the matcher; input is then delivered as it arrives, unmatched.
    pub fn clear_matcher(&self) {
        lock(&self.matcher).clear();
    }

    /// Installs a filter, e.g. TLS after a STARTTLS exchange.
    ///
    /// Queue the reply that announces the switch *before* installing the
    /// filter; it goes out in plaintext. Bytes the client sent after its
    /// request but before the switch are discarded.
    pub fn add_filter<F: Filter + 'static>(&self, filter: F) -> Result<(), ConnectionError> {
        let mut slot = lock(&self.filter);
        if slot.is_some() {
            return Err(ConnectionError::FilterInstalled);
        }
        debug!(parent: &self.span, filter = filter.name(), "Filter installed");
        *slot = Some(Box::new(filter));
        self.filter_generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Removes the filter, returning the connection to plaintext.
    pub fn remove_filter(&self) -> Option<Box<dyn Filter>> {
        let removed = lock(&self.filter).take();
        if let Some(filter) = &removed {
            debug!(parent: &self.span, filter = filter.name(), "Filter removed");
            self.filter_generation.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn has_filter(&self) -> bool {
        lock(&self.filter).is_some()
    }

    /// Queues bytes for the peer, through the filter if one is installed.
    ///
    /// Output is flushed when `flush` is set or when enough is queued.
    pub fn write(&self, data: impl Into<Bytes>, flush: bool) -> Result<(), ConnectionError> {
        if self.is_closing() {
            return Err(ConnectionError::Closed);
        }
        let data = data.into();

        let mut slot = lock(&self.filter);
        let wants_flush = match slot.as_mut() {
            Some(filter) => {
                let mut io = FilterIo::new(&self.writes);
                filter.write(&mut io, data)?;
                drop(slot);
                let output = io.finish();
                self.note_paused(&output);
                output.flush
            }
            None => {
                self.writes.push(data);
                drop(slot);
                false
            }
        };

        if flush || wants_flush || self.writes.pending_bytes() > self.server.config.write_flush_threshold {
            self.schedule(ServerTask::EnableWrite);
        }
        Ok(())
    }

    /// Writes one ASCII line followed by CRLF, and flushes.
    pub fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        if let Some((index, character)) = line.char_indices().find(|(_, c)| !c.is_ascii()) {
            return Err(ConnectionError::NonAscii { character, index });
        }
        let mut buf = BytesMut::with_capacity(line.len() + CRLF.len());
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(CRLF);
        self.write(buf.freeze(), true)
    }

    /// Closes the connection once queued output has been written.
    ///
    /// Input stops being processed right away. Calling this more than once
    /// has no further effect.
    pub fn close(&self) {
        if self.is_closed() || self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(parent: &self.span, "Close requested");
        self.schedule(ServerTask::DisableRead);

        let mut slot = lock(&self.filter);
        if let Some(filter) = slot.as_mut() {
            let mut io = FilterIo::new(&self.writes);
            if let Err(e) = filter.close(&mut io) {
                debug!(parent: &self.span, error = %e, "Filter close failed");
            }
        }
        drop(slot);

        if self.writes.mark_close_after_write() {
            self.schedule(ServerTask::EnableWrite);
        } else {
            self.close_now();
        }
    }

    /// Closes the connection without flushing queued output.
    pub fn close_now(&self) {
        self.close_with_reason("closed by handler");
    }

    /// Calls `on_idle_timeout` after `after`, replacing any pending alarm.
    ///
    /// With [`ServerConfig::idle_timeout`](crate::server::ServerConfig::idle_timeout)
    /// set, every read re-arms the idle alarm and so replaces this one.
    pub fn set_alarm(&self, after: Duration) {
        let Some(conn) = self.this.upgrade() else {
            return;
        };
        if self.is_closed() {
            return;
        }

        let mut slot = lock(&self.alarm);
        slot.generation += 1;
        let generation = slot.generation;
        let task = self.server.io_handle.spawn(async move {
            tokio::time::sleep(after).await;
            conn.alarm_fired(generation);
        });
        if let Some(previous) = slot.task.replace(task) {
            previous.abort();
        }
    }

    pub fn cancel_alarm(&self) {
        let mut slot = lock(&self.alarm);
        slot.generation += 1;
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }

    /// A connection property, falling back to the server-wide default.
    pub fn property(&self, key: &str) -> Option<String> {
        lock(&self.properties)
            .get(key)
            .or_else(|| self.server.config.properties.get(key))
            .cloned()
    }

    pub fn set_property(&self, key: impl Into<String>, value: impl Into<String>) {
        lock(&self.properties).insert(key.into(), value.into());
    }

    // ------------------------------------------------------------------
    // Engine internals
    // ------------------------------------------------------------------

    pub(crate) fn key(&self) -> &SelectionKey {
        &self.key
    }

    pub(crate) fn stream(&self) -> Option<Arc<TcpStream>> {
        lock(&self.stream).clone()
    }

    fn schedule(&self, task: fn(Arc<Connection>) -> ServerTask) {
        if let Some(conn) = self.this.upgrade() {
            self.server.schedule(task(conn));
        }
    }

    fn close_with_reason(&self, reason: &'static str) {
        if let Some(conn) = self.this.upgrade() {
            self.server.schedule(ServerTask::Close(conn, reason));
        }
    }

    /// Runs `task` with this connection on the worker pool.
    fn execute(&self, name: &'static str, task: fn(&Connection)) -> bool {
        match self.this.upgrade() {
            Some(conn) => self.server.execute(name, move || task(&conn)),
            None => false,
        }
    }

    /// Hands the connection to the worker pool for `on_connect`. IO thread.
    pub(crate) fn start(&self) {
        if !self.execute("connect", Connection::run_connect) {
            self.close_channel("worker pool closed");
        }
    }

    fn arm_idle_timer(&self) {
        if let Some(timeout) = self.server.config.idle_timeout {
            self.set_alarm(timeout);
        }
    }

    fn note_paused(&self, output: &FilterOutput) {
        if output.paused {
            self.handshake_paused.store(true, Ordering::SeqCst);
        }
    }

    /// Runs `f` on the read state, then gives the read buffer back to the
    /// pool if the connection closed meanwhile.
    fn with_read<R>(&self, f: impl FnOnce(&mut ReadState) -> R) -> R {
        let result = f(&mut lock(&self.read));
        if self.is_closed() {
            self.release_buffer(&mut lock(&self.read));
        }
        result
    }

    fn release_buffer(&self, state: &mut ReadState) {
        if let Some(buffer) = state.framer.take_buffer() {
            if let Err(e) = self.server.pool.release(buffer) {
                warn!(parent: &self.span, error = %e, "Failed to return read buffer");
            }
        }
        state.wire = Vec::new();
    }

    fn report(&self, error: &ConnectionError) {
        if error.is_disconnect() {
            debug!(parent: &self.span, error = %error, "Connection dropped");
        } else {
            warn!(parent: &self.span, error = %error, "Connection error");
        }
    }

    // --- worker side ---------------------------------------------------

    fn run_connect(&self) {
        let _span = self.span.enter();

        let mut slot = lock(&self.handler);
        if self.is_closed() {
            return;
        }

        let factory = &self.server.factory;
        let mut handler = match panic::catch_unwind(AssertUnwindSafe(|| factory.new_handler(self))) {
            Ok(handler) => handler,
            Err(_) => {
                drop(slot);
                self.report(&ConnectionError::HandlerPanicked);
                self.close_with_reason("handler factory panicked");
                return;
            }
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_connect(self)));
        *slot = Some(handler);
        drop(slot);

        match flatten(result) {
            Ok(()) => {
                if !self.is_closing() {
                    self.schedule(ServerTask::EnableRead);
                    self.arm_idle_timer();
                }
            }
            Err(e) => {
                self.report(&e);
                self.close_with_reason("connect failed");
            }
        }
    }

    fn process_read(&self) {
        let _span = self.span.enter();

        match self.with_read(|state| self.read_and_frame(state)) {
            Ok(ReadOutcome::Eof) => {
                debug!("Peer closed the connection");
                self.close_with_reason("end of stream");
            }
            Ok(ReadOutcome::Data | ReadOutcome::Spurious) => {
                if !self.is_closing() {
                    self.schedule(ServerTask::EnableRead);
                    self.arm_idle_timer();
                }
            }
            Err(e) => {
                self.report(&e);
                self.close_with_reason(if e.is_disconnect() {
                    "connection dropped"
                } else {
                    "read failed"
                });
            }
        }
    }

    fn read_and_frame(&self, state: &mut ReadState) -> Result<ReadOutcome, ConnectionError> {
        let Some(stream) = self.stream() else {
            return Ok(ReadOutcome::Spurious);
        };

        if !self.has_filter() {
            let Some(spare) = state.framer.spare_mut() else {
                return Ok(ReadOutcome::Spurious);
            };
            let n = match try_read(&stream, spare)? {
                Some(0) => return Ok(ReadOutcome::Eof),
                Some(n) => n,
                None => return Ok(ReadOutcome::Spurious),
            };
            state.framer.advance(n);
            self.server.stats.bytes_read(n);
            trace!(bytes = n, buffered = state.framer.buffered(), "Read");
            if let Some(snooper) = &self.server.snooper {
                snooper.on_read(self.id, state.framer.tail(n));
            }

            let generation = self.filter_generation.load(Ordering::SeqCst);
            self.carve(&mut state.framer, generation)?;
            return Ok(ReadOutcome::Data);
        }

        if state.wire.is_empty() {
            state.wire = vec![0; self.server.pool.buffer_size()];
        }
        let n = match try_read(&stream, &mut state.wire)? {
            Some(0) => return Ok(ReadOutcome::Eof),
            Some(n) => n,
            None => return Ok(ReadOutcome::Spurious),
        };
        self.server.stats.bytes_read(n);
        trace!(bytes = n, "Read (filtered)");
        if let Some(snooper) = &self.server.snooper {
            snooper.on_read(self.id, &state.wire[..n]);
        }

        let (result, output) = {
            let mut slot = lock(&self.filter);
            match slot.as_mut() {
                Some(filter) => {
                    let mut io = FilterIo::new(&self.writes);
                    let result = filter.read(&mut io, &state.wire[..n]);
                    (result, io.finish())
                }
                // Removed since the check above: the bytes are plaintext
                None => (
                    Ok(()),
                    FilterOutput {
                        plaintext: BytesMut::from(&state.wire[..n]),
                        ..Default::default()
                    },
                ),
            }
        };

        self.apply_filter_output(state, &output)?;
        match result {
            Ok(()) => Ok(ReadOutcome::Data),
            Err(FilterError::PeerClosed) => Ok(ReadOutcome::Eof),
            Err(e) => Err(e.into()),
        }
    }

    /// Acts on what a filter call produced: write interest, the paused flag,
    /// and plaintext for the framer.
    fn apply_filter_output(&self, state: &mut ReadState, output: &FilterOutput) -> Result<(), ConnectionError> {
        self.note_paused(output);
        if output.flush {
            self.schedule(ServerTask::EnableWrite);
        }

        let generation = self.filter_generation.load(Ordering::SeqCst);
        let mut plaintext = &output.plaintext[..];
        while !plaintext.is_empty() {
            let n = state.framer.fill(plaintext);
            if n == 0 {
                break;
            }
            plaintext = &plaintext[n..];
            let flow = self.carve(&mut state.framer, generation)?;
            if flow == Flow::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Delivers every PDU buffered in `framer`.
    fn carve(&self, framer: &mut Framer, filter_generation: u64) -> Result<Flow, ConnectionError> {
        let flow = framer.carve(&self.matcher, |pdu, matched| self.deliver(pdu, matched, filter_generation));
        if framer.take_overflow() {
            self.server.stats.overflowed();
        }
        flow
    }

    /// Hands one PDU to the handler.
    fn deliver(&self, pdu: &[u8], matched: bool, filter_generation: u64) -> Result<Flow, ConnectionError> {
        if let Some(snooper) = &self.server.snooper {
            snooper.on_input(self.id, pdu, matched);
        }
        self.server.stats.pdu_delivered();

        let mut slot = lock(&self.handler);
        let Some(handler) = slot.as_mut() else {
            return Ok(Flow::Stop);
        };
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_input(self, pdu, matched)));
        drop(slot);
        flatten(result)?;

        if self.is_closing() {
            return Ok(Flow::Stop);
        }
        if self.filter_generation.load(Ordering::SeqCst) != filter_generation {
            debug!("Filter changed, discarding buffered input");
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }

    /// Continues a filter that paused until the write queue drained.
    fn resume_filter(&self) {
        let _span = self.span.enter();

        let result = self.with_read(|state| -> Result<(), ConnectionError> {
            let (result, output) = {
                let mut slot = lock(&self.filter);
                let Some(filter) = slot.as_mut() else {
                    return Ok(());
                };
                let mut io = FilterIo::new(&self.writes);
                let result = filter.flush(&mut io);
                (result, io.finish())
            };
            self.apply_filter_output(state, &output)?;
            result.map_err(ConnectionError::from)
        });

        if let Err(e) = result {
            self.report(&e);
            self.close_with_reason("filter failed");
        }
    }

    fn fire_alarm(&self) {
        let _span = self.span.enter();

        let mut slot = lock(&self.handler);
        if self.is_closed() {
            return;
        }
        let Some(handler) = slot.as_mut() else {
            return;
        };
        debug!("Alarm fired");
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_idle_timeout(self)));
        drop(slot);

        if let Err(e) = flatten(result) {
            self.report(&e);
            self.close_with_reason("idle timeout handler failed");
        }
    }

    fn run_disconnect(&self) {
        let _span = self.span.enter();

        let handler = lock(&self.handler).take();
        if let Some(mut handler) = handler {
            if panic::catch_unwind(AssertUnwindSafe(|| handler.on_disconnect(self))).is_err() {
                self.report(&ConnectionError::HandlerPanicked);
            }
        }
    }

    // --- IO thread side ------------------------------------------------

    /// Read readiness: stop watching for it and process the read on a worker.
    pub(crate) fn on_readable(&self) {
        self.key.remove(OP_READ);
        if !self.execute("read", Connection::process_read) {
            self.close_channel("worker pool closed");
        }
    }

    /// Write readiness: drain as much of the write queue as the socket takes.
    pub(crate) fn on_writable(&self) {
        let Some(stream) = self.stream() else {
            return;
        };
        let snooper = self.server.snooper.as_deref();

        let drained = self.writes.drain(|chunk| {
            let n = stream.try_write(chunk)?;
            if let Some(snooper) = snooper {
                snooper.on_write(self.id, &chunk[..n]);
            }
            Ok(n)
        });

        match drained {
            Drain::Partial { written } => {
                self.server.stats.bytes_written(written);
                trace!(parent: &self.span, bytes = written, pending = self.writes.pending_bytes(), "Partial write");
            }
            Drain::Complete {
                written,
                close_after_write,
            } => {
                self.server.stats.bytes_written(written);
                trace!(parent: &self.span, bytes = written, "Write queue drained");
                self.key.remove(OP_WRITE);

                if close_after_write {
                    self.close_channel("closed after write");
                } else if self.handshake_paused.swap(false, Ordering::SeqCst)
                    && !self.execute("resume filter", Connection::resume_filter)
                {
                    self.close_channel("worker pool closed");
                }
            }
            Drain::Failed(e) => {
                self.report(&ConnectionError::Io(e));
                self.close_channel("write failed");
            }
        }
    }

    pub(crate) fn on_channel_error(&self, error: io::Error) {
        self.report(&ConnectionError::Io(error));
        self.close_channel("readiness error");
    }

    fn alarm_fired(&self, generation: u64) {
        {
            let mut slot = lock(&self.alarm);
            if slot.generation != generation {
                return;
            }
            slot.task = None;
        }
        if !self.is_closing() {
            self.execute("alarm", Connection::fire_alarm);
        }
    }

    /// Tears the connection down. IO thread; idempotent.
    pub(crate) fn close_channel(&self, reason: &'static str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            trace!(parent: &self.span, reason, "Already closed");
            return;
        }
        self.closing.store(true, Ordering::SeqCst);

        self.key.cancel();
        drop(lock(&self.stream).take());
        self.cancel_alarm();
        let discarded = self.writes.clear();

        // A worker in the middle of a read returns the buffer itself
        match self.read.try_lock() {
            Ok(mut state) => self.release_buffer(&mut state),
            Err(TryLockError::Poisoned(poisoned)) => self.release_buffer(&mut poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => {}
        }

        self.server.unregister(self.id);
        self.server.stats.connection_closed();
        info!(parent: &self.span, reason, discarded, "Connection closed");

        self.execute("disconnect", Connection::run_disconnect);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-blocking read: `None` when nothing was ready (spurious wake-up).
fn try_read(stream: &TcpStream, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match stream.try_read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            debug!("Spurious read wake-up");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Folds a caught panic into the callback's own result.
fn flatten(result: std::thread::Result<anyhow::Result<()>>) -> Result<(), ConnectionError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Handler(e)),
        Err(_) => Err(ConnectionError::HandlerPanicked),
    }
}
