//! Inbound sequence state, reassembly buffer and receive window.
//!
//! The [`Receiver`] is responsible for everything that happens *after* a raw
//! datagram is decoded into a [`crate::packet::Segment`] and *before* the
//! application reads contiguous bytes:
//! - Classifying a segment's sequence number against `RCV.NXT`.
//! - Appending in-order payload to the receive buffer.
//! - Computing the ACK number and advertised window for outbound ACKs.
//! - Handing buffered bytes to the application.
//!
//! Only in-order data is accepted.  Segments from the future are reported as
//! [`Arrival::OutOfOrder`] and not buffered; the caller answers them with a
//! duplicate ACK so the sender retransmits the gap.
//!
//! The [`Receiver`] does **not** send ACKs itself; it provides the values
//! that [`crate::connection::Connection`] uses when constructing them.

use std::collections::VecDeque;

use crate::connection::ConnError;
use crate::seq::{seq_distance, seq_gt, seq_le};

/// How an inbound data segment relates to `RCV.NXT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Starts at or before `RCV.NXT` and carries new bytes; the first `skip`
    /// payload bytes were already received.
    InOrder { skip: usize },
    /// Every byte was already received.
    Duplicate,
    /// Starts beyond `RCV.NXT`: a gap precedes it.
    OutOfOrder,
    /// New bytes that do not fit the free buffer space.
    Overflow,
}

/// Receive-side state for one connection.
#[derive(Debug)]
pub struct Receiver {
    /// Next expected sequence number (`RCV.NXT`, `peer_seq_expected`).
    pub rcv_nxt: u32,

    /// Received bytes not yet handed to the application.  `None` once the
    /// connection has released it.
    buffer: Option<VecDeque<u8>>,

    /// Capacity of `buffer`, i.e. the largest window we advertise.
    capacity: usize,

    /// The last in-order segment announced more data of the same write.
    reassembling: bool,
}

impl Receiver {
    /// Allocate a receive buffer of `capacity` bytes.
    ///
    /// Fails with [`ConnError::OutOfMemory`] when the allocation cannot be
    /// satisfied.
    pub fn new(capacity: usize) -> Result<Self, ConnError> {
        let mut buffer = VecDeque::new();
        buffer
            .try_reserve_exact(capacity)
            .map_err(|_| ConnError::OutOfMemory)?;
        Ok(Self {
            rcv_nxt: 0,
            buffer: Some(buffer),
            capacity,
            reassembling: false,
        })
    }

    /// Classify a data segment of `len` bytes starting at `seq`.
    pub fn classify(&self, seq: u32, len: usize) -> Arrival {
        let end = seq.wrapping_add(len as u32);
        if seq_gt(seq, self.rcv_nxt) {
            return Arrival::OutOfOrder;
        }
        if seq_le(end, self.rcv_nxt) {
            return Arrival::Duplicate;
        }
        let skip = seq_distance(seq, self.rcv_nxt);
        if len - skip > self.free_space() {
            return Arrival::Overflow;
        }
        Arrival::InOrder { skip }
    }

    /// Append in-order `bytes` and advance `RCV.NXT` past them.
    ///
    /// `more` is the segment's FRAGMENT bit.  The caller must have
    /// classified the segment as [`Arrival::InOrder`] and stripped the
    /// already-received prefix.
    pub fn accept(&mut self, bytes: &[u8], more: bool) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.extend(bytes.iter().copied());
            self.rcv_nxt = self.rcv_nxt.wrapping_add(bytes.len() as u32);
            self.reassembling = more;
        }
    }

    /// Advance `RCV.NXT` past a received FIN (which consumes one sequence
    /// number) without delivering any payload bytes.
    ///
    /// A FIN that does not start at `RCV.NXT` still ends the stream; the
    /// acknowledgement then names the sequence number after it.
    pub fn on_fin(&mut self, fin_seq: u32) {
        if fin_seq != self.rcv_nxt {
            log::debug!(
                "[rx] FIN at {} while expecting {}",
                fin_seq,
                self.rcv_nxt
            );
        }
        self.rcv_nxt = fin_seq.wrapping_add(1);
        self.reassembling = false;
    }

    /// Cumulative ACK number to place in the next outbound segment.
    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Advertised receive window: free space in the buffer.
    pub fn window_size(&self) -> u16 {
        u16::try_from(self.free_space()).unwrap_or(u16::MAX)
    }

    /// Bytes waiting for the application.
    pub fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, VecDeque::len)
    }

    /// `true` while a fragmented write is only partially received.
    pub fn is_reassembling(&self) -> bool {
        self.reassembling
    }

    /// `true` once [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.buffer.is_none()
    }

    /// Copy up to `buf.len()` buffered bytes into `buf`.  Returns the number
    /// of bytes actually copied.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(buffer) = self.buffer.as_mut() else {
            return 0;
        };
        let n = buf.len().min(buffer.len());
        for (dst, src) in buf[..n].iter_mut().zip(buffer.drain(..n)) {
            *dst = src;
        }
        n
    }

    /// Drop the receive buffer; the window advertises zero from now on.
    pub fn release(&mut self) {
        self.buffer = None;
        self.reassembling = false;
    }

    fn free_space(&self) -> usize {
        match &self.buffer {
            Some(buffer) => self.capacity.saturating_sub(buffer.len()),
            None => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
