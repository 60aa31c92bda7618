//! Outbound sequence state and burst planning.
//!
//! [`Sender`] tracks the send-side sequence numbers and the flow-control
//! window last advertised by the peer.  It does **not** touch the socket;
//! [`crate::connection::Connection::send`] owns the actual send/ACK loop and
//! calls into this module to lay out bursts and to account for ACKs.
//!
//! # Sequence-number layout
//!
//! ```text
//!  send_base          next_seq
//!      │                  │
//!  ────┼──────────────────┼──────────────────▶ seq space
//!      │ <── in flight ──▶│ <── unsent ─────▶
//! ```
//!
//! - `next_seq` only moves forward: by the new payload bytes of each segment
//!   and by one for SYN and FIN.  Retransmissions reuse old numbers.
//! - `send_base` moves forward on every cumulative ACK that covers new data.

use crate::seq::{seq_le, seq_lt};

/// One segment's worth of a burst: a bounds-checked `(offset, len)` window
/// into the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the first byte within the buffer passed to `send`.
    pub offset: usize,
    /// Payload length, at most one MSS.
    pub len: usize,
    /// More bytes of the same write follow this chunk (FRAGMENT bit).
    pub more: bool,
}

impl Chunk {
    /// Offset one past the last byte.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// The payload bytes this chunk covers.
    pub fn slice<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.offset..self.end()]
    }
}

/// Split `amount` bytes starting at `offset` into whole-MSS chunks plus at
/// most one partial trailing chunk.
///
/// `total` is the length of the whole write; every chunk that ends before it
/// is flagged `more`.
pub fn plan_burst(offset: usize, amount: usize, total: usize, mss: usize) -> Vec<Chunk> {
    debug_assert!(mss > 0, "mss must be non-zero");
    debug_assert!(offset + amount <= total, "burst exceeds the write");

    let end = offset + amount;
    let mut chunks = Vec::with_capacity(amount.div_ceil(mss.max(1)));
    let mut start = offset;
    while start < end {
        let len = mss.min(end - start);
        chunks.push(Chunk {
            offset: start,
            len,
            more: start + len < total,
        });
        start += len;
    }
    chunks
}

/// What an inbound acknowledgement number means for the send window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Acknowledges new data; carries the number of newly covered bytes.
    Fresh(u32),
    /// Repeats the current cumulative acknowledgement.
    Duplicate,
    /// Older than `send_base` or beyond anything sent.
    Stale,
}

/// Send-side state for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    /// Sequence number of the **next new** byte to send (`local_seq`).
    pub next_seq: u32,

    /// Oldest unacknowledged sequence number (`peer_ack_expected`).
    pub send_base: u32,

    /// Receive window the peer advertised in its last segment.
    pub peer_window: u16,
}

impl Sender {
    /// Create a new [`Sender`] whose first segment (the SYN) carries `isn`.
    pub fn new(isn: u32) -> Self {
        Self {
            next_seq: isn,
            send_base: isn,
            peer_window: 0,
        }
    }

    /// Consume one sequence number for a SYN or FIN ghost byte.
    pub fn consume_ghost_byte(&mut self) {
        self.next_seq = self.next_seq.wrapping_add(1);
    }

    /// Record that `[seq, seq + len)` went out on the wire.
    ///
    /// Returns `true` when any of those bytes were new, `false` for a pure
    /// retransmission.
    pub fn record_sent(&mut self, seq: u32, len: usize) -> bool {
        let end = seq.wrapping_add(len as u32);
        if seq_lt(self.next_seq, end) {
            self.next_seq = end;
            true
        } else {
            false
        }
    }

    /// Classify an inbound acknowledgement number and slide the window on
    /// fresh ones.
    pub fn on_ack(&mut self, ack: u32) -> AckKind {
        if ack == self.send_base {
            return AckKind::Duplicate;
        }
        if seq_lt(self.send_base, ack) && seq_le(ack, self.next_seq) {
            let covered = ack.wrapping_sub(self.send_base);
            self.send_base = ack;
            return AckKind::Fresh(covered);
        }
        AckKind::Stale
    }

    /// Bytes sent but not yet acknowledged.
    pub fn in_flight(&self) -> u32 {
        self.next_seq.wrapping_sub(self.send_base)
    }

    /// Bytes that may be put on the wire in one burst.
    ///
    /// A zero peer window is probed with a single byte so that a window
    /// update can still be learned from the resulting ACK.
    pub fn usable_window(&self, cwnd: u32) -> usize {
        let peer = u32::from(self.peer_window).max(1);
        cwnd.min(peer).max(1) as usize
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
