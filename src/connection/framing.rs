//! PDU Framing
//!
//! The framer owns a connection's pooled read buffer and carves PDUs out of
//! it with whatever matcher is active at the time.
//!
//! ```text
//!   0          pdu_start        scanned                 len        capacity
//!   ├──────────────┼───────────────┼─────────────────────┼─────────────┤
//!   │  delivered   │ current PDU,  │  not yet shown to   │   spare     │
//!   │  (compacted  │ matcher has   │  the matcher        │   room      │
//!   │   away)      │ seen these    │                     │             │
//! ```
//!
//! After a carve pass the delivered prefix is compacted away, so the next
//! read appends behind the unconsumed tail. When the buffer is full and the
//! current PDU still has no end, the whole buffer is delivered unmatched and
//! cleared; the matcher keeps its progress so a terminator straddling the
//! boundary is still found.

use std::sync::Mutex;

use crate::buffer::PooledBuffer;
use crate::matcher::Matcher;
use crate::util::lock;

/// The matcher a connection frames with, shared between the read path and
/// the handler API.
#[derive(Debug, Default)]
pub(crate) struct MatcherSlot {
    pub(crate) matcher: Option<Box<dyn Matcher>>,
    /// Bumped whenever the matcher is replaced or cleared
    pub(crate) generation: u64,
}

impl MatcherSlot {
    pub(crate) fn set(&mut self, matcher: Box<dyn Matcher>) {
        self.matcher = Some(matcher);
        self.generation += 1;
    }

    pub(crate) fn clear(&mut self) {
        self.matcher = None;
        self.generation += 1;
    }
}

/// What the consumer of a PDU wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// Discard everything still buffered (the connection closed, or its
    /// filter changed and the bytes are no longer meaningful)
    Stop,
}

enum Scan {
    Matched { end: usize, trim: usize },
    Pending,
    Unframed,
}

#[derive(Debug)]
pub(crate) struct Framer {
    buffer: Option<PooledBuffer>,
    pdu_start: usize,
    scanned: usize,
    /// Matcher generation the scan position belongs to
    generation: u64,
    /// A full buffer went out unmatched since the last `take_overflow`
    overflowed: bool,
}

impl Framer {
    pub(crate) fn new(buffer: PooledBuffer) -> Self {
        Self {
            buffer: Some(buffer),
            pdu_start: 0,
            scanned: 0,
            generation: 0,
            overflowed: false,
        }
    }

    /// Room for the next socket read, or `None` once the buffer went back to
    /// the pool.
    pub(crate) fn spare_mut(&mut self) -> Option<&mut [u8]> {
        self.buffer.as_mut().map(|b| b.spare_mut())
    }

    pub(crate) fn advance(&mut self, n: usize) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.advance(n);
        }
    }

    /// Appends as much of `src` as fits.
    pub(crate) fn fill(&mut self, src: &[u8]) -> usize {
        self.buffer.as_mut().map_or(0, |b| b.fill_from(src))
    }

    /// The last `n` bytes read.
    pub(crate) fn tail(&self, n: usize) -> &[u8] {
        match self.buffer.as_ref() {
            Some(b) => &b.filled()[b.len().saturating_sub(n)..],
            None => &[],
        }
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.len())
    }

    pub(crate) fn take_buffer(&mut self) -> Option<PooledBuffer> {
        self.pdu_start = 0;
        self.scanned = 0;
        self.buffer.take()
    }

    /// Whether a full buffer was delivered unmatched since the last call.
    pub(crate) fn take_overflow(&mut self) -> bool {
        std::mem::take(&mut self.overflowed)
    }

    fn discard(&mut self) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.clear();
        }
        self.pdu_start = 0;
        self.scanned = 0;
    }

    /// Delivers every PDU the buffer holds.
    ///
    /// `deliver` gets the PDU (terminator trimmed) and whether the matcher
    /// completed on it. Returns [`Flow::Stop`] when a delivery asked for the
    /// rest of the buffer to be dropped.
    pub(crate) fn carve<E, D>(&mut self, slot: &Mutex<MatcherSlot>, mut deliver: D) -> Result<Flow, E>
    where
        D: FnMut(&[u8], bool) -> Result<Flow, E>,
    {
        loop {
            let Some(buffer) = self.buffer.as_ref() else {
                return Ok(Flow::Stop);
            };
            if self.scanned >= buffer.len() {
                break;
            }

            let scan = {
                let mut slot = lock(slot);
                if slot.generation != self.generation {
                    // A new matcher starts at the beginning of the current PDU
                    self.generation = slot.generation;
                    self.scanned = self.pdu_start;
                }
                match slot.matcher.as_mut() {
                    Some(matcher) => match matcher.match_bytes(&buffer.filled()[self.scanned..]) {
                        Some(n) => Scan::Matched {
                            end: self.scanned + n,
                            trim: matcher.trailing_trim_len(),
                        },
                        None => Scan::Pending,
                    },
                    None => Scan::Unframed,
                }
            };

            match scan {
                Scan::Matched { end, trim } => {
                    let start = self.pdu_start;
                    let pdu = &buffer.filled()[start..end];
                    let body = &pdu[..pdu.len() - trim.min(pdu.len())];
                    self.pdu_start = end;
                    self.scanned = end;
                    let generation = self.generation;

                    if deliver(body, true)? == Flow::Stop {
                        self.discard();
                        return Ok(Flow::Stop);
                    }

                    // An empty match under an unchanged matcher would repeat
                    // forever; leave the rest for the next read
                    if end == start && lock(slot).generation == generation {
                        break;
                    }
                }
                Scan::Pending => {
                    self.scanned = buffer.len();
                    break;
                }
                Scan::Unframed => {
                    let flow = deliver(&buffer.filled()[self.pdu_start..], false)?;
                    self.discard();
                    return Ok(flow);
                }
            }
        }

        let Some(buffer) = self.buffer.as_mut() else {
            return Ok(Flow::Stop);
        };
        if self.pdu_start > 0 {
            buffer.compact(self.pdu_start);
            self.scanned -= self.pdu_start;
            self.pdu_start = 0;
        } else if buffer.is_full() {
            self.overflowed = true;
            let flow = deliver(buffer.filled(), false)?;
            self.discard();
            return Ok(flow);
        }
        Ok(Flow::Continue)
    }
}
