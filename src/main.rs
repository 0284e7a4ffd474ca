//! netframe demo server
//!
//! Runs a small line-oriented protocol on the engine so it can be poked at
//! with telnet or netcat.

use bytes::Bytes;
use netframe::connection::{Connection, ConnectionHandler};
use netframe::matcher::{CountingMatcher, Matcher, SequenceMatcher};
use netframe::server::{Server, ServerConfig};
use netframe::snoop::TracingSnooper;
use netframe::util::InputGatherer;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Longest command line accepted, gathered across partial reads
const MAX_LINE: usize = 1024;

/// Largest DATA block accepted
const MAX_BLOCK: usize = 1024 * 1024;

/// Command-line configuration
struct Config {
    server: ServerConfig,
    /// Dump all traffic at trace level
    snoop: bool,
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut server = ServerConfig {
            name: "demo".to_string(),
            ..Default::default()
        };
        let mut snoop = false;
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    server.host = value(&args, i, "--host");
                    i += 2;
                }
                "--port" | "-p" => {
                    server.port = parse(&args, i, "--port");
                    i += 2;
                }
                "--workers" | "-w" => {
                    server.worker_threads = parse(&args, i, "--workers");
                    i += 2;
                }
                "--buffer-size" => {
                    server.read_buffer_size = parse(&args, i, "--buffer-size");
                    i += 2;
                }
                "--idle-timeout" => {
                    let secs: u64 = parse(&args, i, "--idle-timeout");
                    server.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                    i += 2;
                }
                "--snoop" => {
                    snoop = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("netframe version {}", netframe::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self { server, snoop }
    }
}

fn value(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(v) => v.clone(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn parse<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
    value(args, i, flag).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}", flag);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
netframe demo - a line protocol served by the netframe engine

USAGE:
    netframe [OPTIONS]

OPTIONS:
    -h, --host <HOST>           Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>           Port to listen on (default: 7025)
    -w, --workers <N>           Worker threads (default: 2 x cores)
        --buffer-size <BYTES>   Read buffer size (default: 4096)
        --idle-timeout <SECS>   Close idle connections (default: never)
        --snoop                 Hex-dump all traffic (needs RUST_LOG=trace)
    -v, --version               Print version information
        --help                  Print this help message

COMMANDS:
    ECHO <text>     Replies with <text>
    SUM <n>         Reads <n> raw bytes and replies with their byte sum
    DATA            Reads a block ending in <CRLF>.<CRLF>, replies with its size
    QUIT            Closes the connection

EXAMPLE:
    $ nc -C 127.0.0.1 7025
    220 netframe demo ready
    ECHO hi
    250 hi
"#
    );
}

/// What the next PDU is.
enum Mode {
    Command,
    Sum,
    Data,
}

/// Reassembles a PDU from the unmatched pieces a full read buffer delivers.
///
/// A terminator can straddle the end of the read buffer: its first bytes
/// then arrive in an unmatched piece and the matched tail comes out empty. A
/// copy of the connection's matcher follows the pieces so those bytes can be
/// cut off again.
struct Assembler {
    gatherer: InputGatherer,
    terminator: Option<SequenceMatcher>,
}

impl Assembler {
    fn new(limit: usize, terminator: Option<SequenceMatcher>) -> Self {
        Self {
            gatherer: InputGatherer::new(limit.min(4096), limit),
            terminator,
        }
    }

    fn partial(&mut self, piece: &[u8]) {
        if let Some(terminator) = self.terminator.as_mut() {
            // never completes: the connection's matcher saw the same bytes
            let _ = terminator.match_bytes(piece);
        }
        self.gatherer.add(piece);
    }

    /// Finishes the PDU with its matched tail, or `None` if it outgrew the
    /// limit.
    fn complete(&mut self, tail: &[u8]) -> Option<Bytes> {
        if let Some(terminator) = self.terminator.as_mut() {
            if tail.is_empty() {
                self.gatherer.trim(terminator.progress());
            }
            terminator.clear();
        }
        self.gatherer.add(tail);
        if self.gatherer.overflowed() {
            self.gatherer.clear();
            return None;
        }
        Some(self.gatherer.take())
    }
}

/// Per-connection state of the demo protocol.
struct LineHandler {
    mode: Mode,
    input: Assembler,
}

impl LineHandler {
    fn new() -> Self {
        Self {
            mode: Mode::Command,
            input: Assembler::new(MAX_LINE, None),
        }
    }

    /// Frames the following input with `matcher`.
    fn frame(&mut self, conn: &Connection, mode: Mode, matcher: SequenceMatcher, limit: usize) {
        self.mode = mode;
        self.input = Assembler::new(limit, Some(matcher.clone()));
        conn.set_matcher(matcher);
    }

    fn command(&mut self, conn: &Connection, line: &str) -> anyhow::Result<()> {
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "ECHO" => conn.write_line(&format!("250 {}", arg))?,
            "SUM" => match arg.parse::<usize>() {
                Ok(n) if n > 0 && n <= MAX_BLOCK => {
                    conn.set_matcher(CountingMatcher::new(n));
                    self.mode = Mode::Sum;
                    self.input = Assembler::new(n, None);
                    conn.write_line(&format!("354 send {} bytes", n))?;
                }
                _ => conn.write_line("501 SUM needs a byte count from 1 to 1048576")?,
            },
            "DATA" => {
                self.frame(conn, Mode::Data, SequenceMatcher::dot_terminated(), MAX_BLOCK);
                conn.write_line("354 end with <CRLF>.<CRLF>")?;
            }
            "QUIT" => {
                conn.write_line("221 bye")?;
                conn.close();
            }
            "" => {}
            _ => conn.write_line("500 unknown command")?,
        }
        Ok(())
    }

    /// Back to command lines after a SUM or DATA payload.
    fn command_mode(&mut self, conn: &Connection) {
        self.frame(conn, Mode::Command, SequenceMatcher::crlf(), MAX_LINE);
    }
}

impl ConnectionHandler for LineHandler {
    fn on_connect(&mut self, conn: &Connection) -> anyhow::Result<()> {
        self.command_mode(conn);
        conn.write_line("220 netframe demo ready")?;
        Ok(())
    }

    fn on_input(&mut self, conn: &Connection, pdu: &[u8], matched: bool) -> anyhow::Result<()> {
        if !matched {
            self.input.partial(pdu);
            return Ok(());
        }

        let Some(input) = self.input.complete(pdu) else {
            match self.mode {
                Mode::Command => conn.write_line("500 line too long")?,
                _ => {
                    conn.write_line("552 too much data")?;
                    self.command_mode(conn);
                }
            }
            return Ok(());
        };

        match self.mode {
            Mode::Command => {
                let line = String::from_utf8_lossy(&input).into_owned();
                self.command(conn, &line)?;
            }
            Mode::Sum => {
                let sum: u64 = input.iter().map(|&b| u64::from(b)).sum();
                conn.write_line(&format!("250 {}", sum))?;
                self.command_mode(conn);
            }
            Mode::Data => {
                conn.write_line(&format!("250 {} bytes received", input.len()))?;
                self.command_mode(conn);
            }
        }
        Ok(())
    }

    fn on_idle_timeout(&mut self, conn: &Connection) -> anyhow::Result<()> {
        conn.write_line("421 idle timeout")?;
        conn.close();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging; RUST_LOG overrides the default level
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_names(true)
        .init();

    let factory = |_: &Connection| Box::new(LineHandler::new()) as Box<dyn ConnectionHandler>;
    let server = if config.snoop {
        Server::start_with_snooper(config.server, factory, Arc::new(TracingSnooper))?
    } else {
        Server::start(config.server, factory)?
    };

    info!(version = netframe::VERSION, addr = %server.local_addr(), "Ready to accept connections");

    // Wait for Ctrl+C
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C, shutting down");
    }
    info!("Shutdown signal received, stopping server...");

    server.shutdown();
    tokio::task::spawn_blocking(move || server.join()).await??;

    info!("Server shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_joins_pieces() {
        let mut input = Assembler::new(MAX_LINE, Some(SequenceMatcher::crlf()));
        input.partial(b"ECHO ");
        input.partial(b"hello ");
        assert_eq!(input.complete(b"world").as_deref(), Some(&b"ECHO hello world"[..]));
    }

    #[test]
    fn test_assembler_drops_split_crlf() {
        // A 4 byte read buffer turns "abc\r\n" into "abc\r" unmatched and an
        // empty matched tail
        let mut input = Assembler::new(MAX_LINE, Some(SequenceMatcher::crlf()));
        input.partial(b"abc\r");
        assert_eq!(input.complete(b"").as_deref(), Some(&b"abc"[..]));

        // The copy of the matcher starts over for the next line
        input.partial(b"defg");
        assert_eq!(input.complete(b"h").as_deref(), Some(&b"defgh"[..]));
    }

    #[test]
    fn test_assembler_drops_split_dot_terminator() {
        let mut input = Assembler::new(MAX_BLOCK, Some(SequenceMatcher::dot_terminated()));
        input.partial(b"line1\r\nline2\r\n.");
        assert_eq!(input.complete(b"").as_deref(), Some(&b"line1\r\nline2"[..]));
    }

    #[test]
    fn test_assembler_keeps_bytes_without_terminator() {
        let mut input = Assembler::new(MAX_BLOCK, None);
        input.partial(&[1, 2, 3]);
        assert_eq!(input.complete(b"").as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn test_assembler_overflow() {
        let mut input = Assembler::new(8, Some(SequenceMatcher::crlf()));
        input.partial(b"0123456789");
        assert_eq!(input.complete(b"AB"), None);
        assert_eq!(input.complete(b"ok").as_deref(), Some(&b"ok"[..]));
    }
}
