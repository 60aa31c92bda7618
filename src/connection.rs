//! Per-connection state and the data path.
//!
//! A [`Connection`] owns the complete state for one peer-to-peer session:
//! - the lifecycle state (see [`crate::state`]),
//! - outbound sequence numbers ([`crate::sender`]) and inbound reassembly
//!   ([`crate::receiver`]),
//! - the congestion controller ([`crate::congestion`]),
//! - per-connection diagnostics ([`crate::stats`]),
//! - the segment socket and the peer address.
//!
//! Opening and closing live in [`crate::handshake`]; this module holds the
//! record itself, the error type and the two data-path calls, [`send`] and
//! [`recv`].
//!
//! # Send path
//!
//! ```text
//!  data ──▶ plan_burst(min(remaining, cwnd, peer window)) ──▶ chunks ──▶ wire
//!                 ▲                                                      │
//!                 │ fresh ACK: slide send_base, grow cwnd                │
//!                 │ 3rd dup ACK: fast retransmit oldest chunk            │
//!                 └──── timeout: shrink cwnd, go back to send_base ◀─────┘
//! ```
//!
//! [`send`]: Connection::send
//! [`recv`]: Connection::recv

use std::net::SocketAddr;

use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::config::Config;
use crate::congestion::{CongestionController, CongestionState};
use crate::packet::{Control, PacketError, Segment};
use crate::receiver::{Arrival, Receiver};
use crate::sender::{plan_burst, AckKind, Chunk, Sender};
use crate::seq::seq_distance;
use crate::socket::{Datagram, Socket, SocketError};
use crate::state::ConnectionState;
use crate::stats::Diagnostics;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by [`Connection`] operations.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The operation is not allowed in the current lifecycle state.
    #[error("operation not permitted in state {0}")]
    InvalidState(ConnectionState),

    /// The peer answered a handshake or shutdown step with the wrong control
    /// bits.
    #[error("connection aborted: unexpected control bits {0}")]
    ConnectionAborted(Control),

    /// A datagram with SYN and FIN (or unknown bits) arrived while a
    /// handshake or shutdown was waiting for the peer.
    #[error("invalid control bit combination {0:#06x}")]
    InvalidControlCombination(u16),

    /// Too many consecutive corrupted segments.
    #[error("too many corrupted segments")]
    ChecksumMismatch,

    /// The peer did not respond within the configured wait.
    #[error("timed out waiting for the peer")]
    Timeout,

    /// Retransmissions stopped making progress.
    #[error("gave up after {attempts} retransmission rounds without progress")]
    RetriesExhausted { attempts: u32 },

    /// The receive buffer could not be allocated.
    #[error("receive buffer allocation failed")]
    OutOfMemory,

    /// The peer sent RST.
    #[error("connection reset by peer")]
    PeerReset,

    /// The peer closed its side; no more data will arrive.
    #[error("end of stream")]
    Eof,

    /// The [`Config`] was rejected by [`Config::validate`].
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Socket(#[from] SocketError),
}

// ---------------------------------------------------------------------------
// Inbound events
// ---------------------------------------------------------------------------

/// What one wait on the socket produced.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// A decoded segment from the peer (or from anyone, before the peer is
    /// known).
    Segment(Segment, SocketAddr),
    /// A datagram whose payload checksum failed.
    Corrupt,
    /// A datagram with an invalid control-bit combination.
    BadControl(u16),
    /// The deadline passed.
    Elapsed,
}

/// How one burst of the send loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    /// Every byte of the burst was acknowledged.
    Complete,
    /// A fast retransmit was answered by an ACK that leaves the rest of the
    /// burst outstanding; resend from `send_base`.
    Partial,
    /// The ACK timer expired.
    TimedOut { progressed: bool },
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One reliable byte-stream connection over a datagram channel.
///
/// Created by [`Connection::open`] (or [`Connection::bind`]) in
/// [`ConnectionState::Invalid`]; a handshake (`connect` / `accept`) brings it
/// to [`ConnectionState::Established`].
#[derive(Debug)]
pub struct Connection<D: Datagram = UdpSocket> {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Outbound sequence numbers and the peer's window.
    pub sender: Sender,
    /// Inbound sequence number and receive buffer.
    pub receiver: Receiver,
    /// Slow start / congestion avoidance / fast recovery.
    pub congestion: CongestionController,
    /// Counters and lifecycle history.
    pub stats: Diagnostics,

    pub(crate) socket: Socket<D>,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) config: Config,
    /// The peer started the close; `recv` reports end of stream from now on.
    pub(crate) fin_received: bool,
}

impl Connection<UdpSocket> {
    /// Bind a UDP socket to `local_addr` and open a connection on it.
    pub async fn bind(local_addr: SocketAddr, config: Config) -> Result<Self, ConnError> {
        let socket = Socket::bind(local_addr).await?;
        Self::open(socket, config)
    }
}

impl<D: Datagram> Connection<D> {
    /// Allocate connection state on an already-bound socket.
    ///
    /// Picks a pseudo-random initial sequence number and allocates the
    /// receive buffer; fails with [`ConnError::OutOfMemory`] when that
    /// allocation cannot be satisfied.
    pub fn open(socket: Socket<D>, config: Config) -> Result<Self, ConnError> {
        config.validate()?;
        let isn: u32 = rand::rng().random();
        let receiver = Receiver::new(config.recv_buffer_len)?;

        log::debug!("[hs] open on {} isn={isn}", socket.local_addr);
        Ok(Self {
            state: ConnectionState::Invalid,
            sender: Sender::new(isn),
            receiver,
            congestion: CongestionController::new(&config),
            stats: Diagnostics {
                local_isn: isn,
                ..Diagnostics::default()
            },
            socket,
            peer: None,
            config,
            fin_received: false,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Next sequence number to send.
    pub fn local_seq(&self) -> u32 {
        self.sender.next_seq
    }

    /// Oldest unacknowledged sequence number.
    pub fn peer_ack_expected(&self) -> u32 {
        self.sender.send_base
    }

    /// Next sequence number expected from the peer (our ACK number).
    pub fn peer_seq_expected(&self) -> u32 {
        self.receiver.rcv_nxt
    }

    pub fn congestion_window(&self) -> u32 {
        self.congestion.cwnd()
    }

    pub fn slow_start_threshold(&self) -> u32 {
        self.congestion.ssthresh()
    }

    pub fn congestion_state(&self) -> CongestionState {
        self.congestion.state()
    }

    pub fn duplicate_ack_count(&self) -> u32 {
        self.congestion.duplicate_acks()
    }

    /// Receive window the peer advertised last.
    pub fn peer_advertised_window(&self) -> u16 {
        self.sender.peer_window
    }

    /// Receive window we currently advertise.
    pub fn local_window(&self) -> u16 {
        self.receiver.window_size()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The segment socket underneath.
    pub fn socket(&self) -> &Socket<D> {
        &self.socket
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Reliably deliver `data` to the peer.
    ///
    /// Returns once every byte has been acknowledged.  Loss is repaired by
    /// fast retransmit and by go-back on timeout; the call fails with
    /// [`ConnError::RetriesExhausted`] after `max_retries` consecutive loss
    /// rounds without progress, and the connection is then closed.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize, ConnError> {
        self.require(ConnectionState::Established)?;
        if data.is_empty() {
            return Ok(0);
        }

        let total = data.len();
        let mss = self.config.mss as usize;
        // Sequence number of data[0].
        let base_seq = self.sender.send_base;
        let mut failures = 0u32;

        loop {
            let acked = seq_distance(base_seq, self.sender.send_base);
            if acked >= total {
                break;
            }

            let window = self.sender.usable_window(self.congestion.cwnd());
            let amount = window.min(total - acked);
            let round_end = acked + amount;
            log::debug!(
                "[tx] burst offset={acked} len={amount} cwnd={} peer_win={} in_flight={}",
                self.congestion.cwnd(),
                self.sender.peer_window,
                self.sender.in_flight()
            );
            for chunk in plan_burst(acked, amount, total, mss) {
                self.send_chunk(data, base_seq, chunk).await?;
            }

            match self.await_round(data, base_seq, round_end).await? {
                Round::Complete | Round::Partial => failures = 0,
                Round::TimedOut { progressed: true } => failures = 0,
                Round::TimedOut { progressed: false } => {
                    failures += 1;
                    if failures > self.config.max_retries {
                        log::warn!(
                            "[tx] no progress after {failures} rounds with {} bytes in flight; giving up",
                            self.sender.in_flight()
                        );
                        self.close_abruptly();
                        return Err(ConnError::RetriesExhausted { attempts: failures });
                    }
                }
            }
        }

        Ok(total)
    }

    /// Receive data from the peer into `buf`.
    ///
    /// Bytes left over from an earlier call are returned first.  A
    /// fragmented write is reassembled until its last segment arrives or
    /// `buf` is full; the remainder is returned by the following calls.
    /// A control-only segment yields `Ok(0)`.  When the peer closes, the
    /// peer side of the shutdown runs and [`ConnError::Eof`] is returned.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, ConnError> {
        if self.fin_received && self.state != ConnectionState::Established {
            return Err(ConnError::Eof);
        }
        self.require(ConnectionState::Established)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let mut filled = self.receiver.read(buf);
        if filled == buf.len() || (filled > 0 && !self.receiver.is_reassembling()) {
            return Ok(filled);
        }

        let mut corrupt = 0u32;
        loop {
            let segment = match self.next_inbound(None).await? {
                Inbound::Segment(segment, _) => segment,
                Inbound::Corrupt => {
                    corrupt += 1;
                    if corrupt > self.config.max_corrupt_segments {
                        log::warn!("[rx] {corrupt} corrupted segments in a row");
                        return Err(ConnError::ChecksumMismatch);
                    }
                    continue;
                }
                Inbound::BadControl(_) | Inbound::Elapsed => continue,
            };
            corrupt = 0;

            let control = segment.header.control;
            if control.is_rst() {
                return Err(self.on_peer_reset());
            }
            if control.is_fin() {
                if let Err(e) = self.close_by_peer(segment.header.seq).await {
                    self.close_abruptly();
                    return Err(e);
                }
                return if filled > 0 { Ok(filled) } else { Err(ConnError::Eof) };
            }
            if control == Control::SYN_ACK {
                // Our final handshake ACK was lost.
                self.send_control(Control::ACK).await?;
                continue;
            }
            if segment.is_empty() {
                if filled == 0 && !self.receiver.is_reassembling() {
                    return Ok(0);
                }
                continue;
            }

            let seq = segment.header.seq;
            match self.receiver.classify(seq, segment.payload.len()) {
                Arrival::InOrder { skip } => {
                    let fresh = &segment.payload[skip..];
                    self.receiver.accept(fresh, control.is_fragment());
                    self.stats.bytes_received += fresh.len() as u64;
                    log::trace!("[rx] {} bytes buffered", self.receiver.buffered());
                    filled += self.receiver.read(&mut buf[filled..]);
                    self.send_control(Control::ACK).await?;

                    if !self.receiver.is_reassembling() || filled == buf.len() {
                        return Ok(filled);
                    }
                }
                Arrival::Duplicate => {
                    self.stats.duplicate_segments += 1;
                    self.send_control(Control::ACK).await?;
                }
                Arrival::OutOfOrder => {
                    self.stats.out_of_order_segments += 1;
                    log::debug!(
                        "[rx] out of order: seq={} expected={}; dup ACK",
                        seq.wrapping_sub(self.stats.peer_isn),
                        self.receiver.rcv_nxt.wrapping_sub(self.stats.peer_isn)
                    );
                    self.send_control(Control::ACK).await?;
                }
                Arrival::Overflow => {
                    self.stats.overflow_drops += 1;
                    log::warn!(
                        "[rx] {} bytes do not fit window {}; dropped",
                        segment.payload.len(),
                        self.receiver.window_size()
                    );
                }
            }
        }
    }

    /// Abort the connection: send RST and close immediately.
    pub async fn reset(&mut self) -> Result<(), ConnError> {
        if self.peer.is_none() {
            return Err(ConnError::InvalidState(self.state));
        }
        self.send_control(Control::RST).await?;
        log::warn!("[hs] reset sent");
        self.close_abruptly();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Send-path internals
    // -----------------------------------------------------------------------

    async fn send_chunk(&mut self, data: &[u8], base_seq: u32, chunk: Chunk) -> Result<(), ConnError> {
        let seq = base_seq.wrapping_add(chunk.offset as u32);
        let control = if chunk.more { Control::FRAGMENT } else { Control::NONE };
        let segment = self.build_segment(seq, control, chunk.slice(data).to_vec());
        self.transmit(&segment).await?;
        self.stats.data_segments_sent += 1;

        let before = self.sender.next_seq;
        if self.sender.record_sent(seq, chunk.len) {
            self.stats.bytes_sent += u64::from(self.sender.next_seq.wrapping_sub(before));
        } else {
            self.stats.retransmissions += 1;
        }
        Ok(())
    }

    /// Read acknowledgements until the bytes up to `round_end` are covered,
    /// the ACK timer expires, or a fast retransmit is partially answered.
    async fn await_round(&mut self, data: &[u8], base_seq: u32, round_end: usize) -> Result<Round, ConnError> {
        let total = data.len();
        let mss = self.config.mss as usize;
        let start = self.sender.send_base;
        let mut deadline = Instant::now() + self.config.ack_timeout;
        let mut fast_retransmitted = false;

        loop {
            let segment = match self.next_inbound(Some(deadline)).await? {
                Inbound::Segment(segment, _) => segment,
                Inbound::Elapsed => {
                    self.stats.timeouts += 1;
                    self.congestion.on_timeout();
                    log::debug!(
                        "[tx] ack timeout; back to offset {}",
                        seq_distance(base_seq, self.sender.send_base)
                    );
                    return Ok(Round::TimedOut {
                        progressed: self.sender.send_base != start,
                    });
                }
                Inbound::Corrupt | Inbound::BadControl(_) => continue,
            };

            let header = segment.header;
            if header.control.is_rst() {
                return Err(self.on_peer_reset());
            }
            if header.control == Control::SYN_ACK {
                self.send_control(Control::ACK).await?;
                continue;
            }
            if !header.control.is_ack() {
                log::trace!("[tx] ignoring {} while awaiting ACKs", header.control);
                continue;
            }

            match self.sender.on_ack(header.ack) {
                AckKind::Fresh(_) => {
                    self.stats.acks_received += 1;
                    self.sender.peer_window = header.window;
                    self.congestion.on_new_ack();
                    deadline = Instant::now() + self.config.ack_timeout;

                    if seq_distance(base_seq, self.sender.send_base) >= round_end {
                        return Ok(Round::Complete);
                    }
                    if fast_retransmitted {
                        return Ok(Round::Partial);
                    }
                }
                AckKind::Duplicate => {
                    self.stats.duplicate_acks += 1;
                    self.sender.peer_window = header.window;
                    if self.congestion.on_duplicate_ack() {
                        let offset = seq_distance(base_seq, self.sender.send_base);
                        let len = mss.min(round_end - offset);
                        let chunk = Chunk {
                            offset,
                            len,
                            more: offset + len < total,
                        };
                        log::debug!("[tx] fast retransmit offset={offset} len={len}");
                        self.stats.fast_retransmits += 1;
                        self.send_chunk(data, base_seq, chunk).await?;
                        fast_retransmitted = true;
                    }
                }
                AckKind::Stale => {
                    log::trace!("[tx] stale ack {}", header.ack);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared plumbing (also used by the handshake module)
    // -----------------------------------------------------------------------

    /// Build an outbound segment carrying our current ACK number and window.
    pub(crate) fn build_segment(&self, seq: u32, control: Control, payload: Vec<u8>) -> Segment {
        Segment::new(
            seq,
            self.receiver.ack_number(),
            control,
            self.receiver.window_size(),
            payload,
        )
    }

    /// Send `segment` to the peer.
    pub(crate) async fn transmit(&mut self, segment: &Segment) -> Result<(), ConnError> {
        let peer = self.peer.ok_or(ConnError::InvalidState(self.state))?;
        self.socket.send_to(segment, peer).await?;
        self.stats.segments_sent += 1;
        log::debug!("[tx] → {}", self.stats.describe(&segment.header, true));
        Ok(())
    }

    /// Send a payload-free segment at `local_seq`.
    pub(crate) async fn send_control(&mut self, control: Control) -> Result<(), ConnError> {
        let segment = self.build_segment(self.sender.next_seq, control, Vec::new());
        self.transmit(&segment).await
    }

    /// Wait for the next datagram from the peer, up to `deadline`.
    ///
    /// Datagrams from other addresses and malformed ones are skipped;
    /// checksum failures are counted and reported so the caller can bound
    /// them.
    pub(crate) async fn next_inbound(&mut self, deadline: Option<Instant>) -> Result<Inbound, ConnError> {
        loop {
            let received = match deadline {
                Some(at) => match timeout_at(at, self.socket.recv_from()).await {
                    Ok(received) => received,
                    Err(_) => return Ok(Inbound::Elapsed),
                },
                None => self.socket.recv_from().await,
            };

            match received {
                Ok((segment, from)) => {
                    if self.peer.is_some_and(|peer| peer != from) {
                        log::trace!("[rx] ignoring datagram from {from}");
                        continue;
                    }
                    self.stats.segments_received += 1;
                    log::debug!("[rx] ← {}", self.stats.describe(&segment.header, false));
                    return Ok(Inbound::Segment(segment, from));
                }
                Err(SocketError::Packet(PacketError::ChecksumMismatch { expected, actual })) => {
                    self.stats.checksum_failures += 1;
                    log::warn!("[rx] checksum mismatch ({expected:#010x} != {actual:#010x}); dropped");
                    return Ok(Inbound::Corrupt);
                }
                Err(SocketError::Packet(PacketError::InvalidControlCombination(bits))) => {
                    log::warn!("[rx] invalid control bits {bits:#06x}");
                    return Ok(Inbound::BadControl(bits));
                }
                Err(SocketError::Packet(e)) => {
                    log::debug!("[rx] undecodable datagram: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Record a lifecycle transition.
    pub(crate) fn set_state(&mut self, next: ConnectionState) {
        log::debug!("[hs] {} -> {}", self.state, next);
        self.state = next;
        self.stats.transitions.push(next);
    }

    pub(crate) fn require(&self, state: ConnectionState) -> Result<(), ConnError> {
        if self.state == state {
            Ok(())
        } else {
            Err(ConnError::InvalidState(self.state))
        }
    }

    /// Close without a FIN exchange and release the receive buffer.
    pub(crate) fn close_abruptly(&mut self) {
        if self.state != ConnectionState::Closed {
            self.set_state(ConnectionState::Closed);
        }
        self.receiver.release();
    }

    /// The peer sent RST.
    pub(crate) fn on_peer_reset(&mut self) -> ConnError {
        log::warn!("[rx] reset by peer");
        self.close_abruptly();
        ConnError::PeerReset
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
