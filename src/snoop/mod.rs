//! Traffic Snooping
//!
//! A [`Snooper`] sees every byte a server moves: raw reads, raw writes and
//! the PDUs handed to handlers. It exists for debugging protocol
//! implementations and is optional; without one the hooks cost nothing.
//!
//! [`TracingSnooper`] renders everything as hex dumps at `trace` level:
//!
//! ```text
//! TRACE conn{id=3 peer=127.0.0.1:50712}: read 6 bytes
//! 00000000  68 65 6c 6f 0d 0a                                 |helo..|
//! ```

use std::fmt::Write as _;
use tracing::trace;

/// Bytes per hex dump line.
const DUMP_WIDTH: usize = 16;

/// Observes traffic on every connection of a server.
///
/// Called from the IO thread (writes) and from worker threads (reads and
/// inputs), so implementations must be thread-safe and quick.
pub trait Snooper: Send + Sync {
    /// Raw bytes read from the socket, before any filter.
    fn on_read(&self, _conn: u64, _bytes: &[u8]) {}

    /// Raw bytes written to the socket, after any filter.
    fn on_write(&self, _conn: u64, _bytes: &[u8]) {}

    /// A PDU about to be handed to the handler.
    fn on_input(&self, _conn: u64, _pdu: &[u8], _matched: bool) {}
}

/// Logs all traffic as hex dumps at `trace` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSnooper;

impl Snooper for TracingSnooper {
    fn on_read(&self, conn: u64, bytes: &[u8]) {
        trace!(conn, "read {} bytes\n{}", bytes.len(), hex_dump(bytes));
    }

    fn on_write(&self, conn: u64, bytes: &[u8]) {
        trace!(conn, "wrote {} bytes\n{}", bytes.len(), hex_dump(bytes));
    }

    fn on_input(&self, conn: u64, pdu: &[u8], matched: bool) {
        trace!(conn, matched, "input {} bytes\n{}", pdu.len(), hex_dump(pdu));
    }
}

/// Formats bytes as offset, hex and printable ASCII columns.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(DUMP_WIDTH) * 78);

    for (line, chunk) in bytes.chunks(DUMP_WIDTH).enumerate() {
        let _ = write!(out, "{:08x} ", line * DUMP_WIDTH);
        for i in 0..DUMP_WIDTH {
            if i % 8 == 0 {
                out.push(' ');
            }
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{:02x} ", b);
                }
                None => out.push_str("   "),
            }
        }
        out.push('|');
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push_str("|\n");
    }

    out
}
