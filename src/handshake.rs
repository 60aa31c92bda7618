//! Connection establishment and teardown.
//!
//! # Three-way handshake
//!
//! ```text
//!  Client                                Server
//!    │                                     │  accept(): LISTEN
//!    │──── SYN  seq=ISN_c ────────────────▶│
//!    │  SYN_SENT                           │  SYN_RECEIVED
//!    │◀─── SYN+ACK seq=ISN_s ack=ISN_c+1 ──│
//!    │──── ACK  ack=ISN_s+1 ──────────────▶│
//!    │  ESTABLISHED                        │  ESTABLISHED
//! ```
//!
//! # Half-close
//!
//! ```text
//!  Closer (Shutdown::Local)              Peer (recv() sees FIN)
//!    │──── FIN+ACK ───────────────────────▶│  CLOSING_BY_PEER
//!    │◀─── ACK ────────────────────────────│
//!    │  CLOSING_BY_LOCAL                   │
//!    │◀─── FIN+ACK ────────────────────────│
//!    │──── ACK ───────────────────────────▶│  CLOSED
//!    │  CLOSED (lingers for time_wait)     │
//! ```
//!
//! SYN and FIN each consume one sequence number.  Every wait retransmits
//! on `ack_timeout` and gives up after `max_retries` silent rounds.

use std::net::SocketAddr;

use rand::Rng;
use tokio::time::Instant;

use crate::congestion::CongestionController;
use crate::connection::{ConnError, Connection, Inbound};
use crate::packet::{Control, Segment};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::socket::Datagram;
use crate::state::{ConnectionState, Shutdown};

impl<D: Datagram> Connection<D> {
    // -----------------------------------------------------------------------
    // Open
    // -----------------------------------------------------------------------

    /// Active open: perform the three-way handshake with `peer`.
    ///
    /// On any failure the connection is left in [`ConnectionState::Invalid`]
    /// and may be opened again.
    pub async fn connect(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        self.prepare_open()?;
        let result = self.active_open(peer).await;
        if result.is_err() {
            self.set_state(ConnectionState::Invalid);
        }
        result
    }

    /// Passive open: wait for a SYN and complete the handshake.
    ///
    /// Returns the address of the peer that connected.
    pub async fn accept(&mut self) -> Result<SocketAddr, ConnError> {
        self.prepare_open()?;
        let result = self.passive_open().await;
        if result.is_err() {
            self.peer = None;
            self.set_state(ConnectionState::Invalid);
        }
        result
    }

    /// Check the state allows a new handshake and reset per-session state
    /// when reopening a closed connection.
    fn prepare_open(&mut self) -> Result<(), ConnError> {
        if !self.state.can_open() {
            return Err(ConnError::InvalidState(self.state));
        }
        if self.state == ConnectionState::Closed || self.receiver.is_released() {
            let isn: u32 = rand::rng().random();
            self.receiver = Receiver::new(self.config.recv_buffer_len)?;
            self.sender = Sender::new(isn);
            self.stats.local_isn = isn;
            self.fin_received = false;
        }
        Ok(())
    }

    async fn active_open(&mut self, peer: SocketAddr) -> Result<(), ConnError> {
        self.peer = Some(peer);
        self.set_state(ConnectionState::SynSent);

        let isn = self.sender.next_seq;
        let syn = self.build_segment(isn, Control::SYN, Vec::new());
        let mut attempts = 0u32;
        self.transmit(&syn).await?;

        let reply = loop {
            let deadline = Instant::now() + self.config.ack_timeout;
            match self.await_control(deadline).await? {
                Some(reply) => break reply,
                None => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        log::warn!("[hs] no SYN+ACK from {peer} after {attempts} attempts");
                        return Err(ConnError::RetriesExhausted { attempts });
                    }
                    self.stats.retransmissions += 1;
                    self.transmit(&syn).await?;
                }
            }
        };

        let header = reply.header;
        if header.control != Control::SYN_ACK || header.ack != isn.wrapping_add(1) {
            log::warn!("[hs] expected SYN+ACK for {}, got {}", isn.wrapping_add(1), header);
            return Err(ConnError::ConnectionAborted(header.control));
        }

        self.sender.consume_ghost_byte();
        self.sender.send_base = self.sender.next_seq;
        self.sender.peer_window = header.window;
        self.receiver.rcv_nxt = header.seq.wrapping_add(1);
        self.stats.peer_isn = header.seq;

        self.send_control(Control::ACK).await?;
        self.establish();
        Ok(())
    }

    async fn passive_open(&mut self) -> Result<SocketAddr, ConnError> {
        self.peer = None;
        self.set_state(ConnectionState::Listen);

        let (syn, from) = loop {
            match self.next_inbound(None).await? {
                Inbound::Segment(segment, from) => break (segment, from),
                Inbound::BadControl(bits) => return Err(ConnError::InvalidControlCombination(bits)),
                Inbound::Corrupt | Inbound::Elapsed => continue,
            }
        };
        if syn.header.control != Control::SYN {
            log::warn!("[hs] expected SYN from {from}, got {}", syn.header);
            return Err(ConnError::ConnectionAborted(syn.header.control));
        }

        self.peer = Some(from);
        self.receiver.rcv_nxt = syn.header.seq.wrapping_add(1);
        self.sender.peer_window = syn.header.window;
        self.stats.peer_isn = syn.header.seq;
        self.set_state(ConnectionState::SynReceived);

        let isn = self.sender.next_seq;
        let syn_ack = self.build_segment(isn, Control::SYN_ACK, Vec::new());
        let mut attempts = 0u32;
        self.transmit(&syn_ack).await?;
        let mut deadline = Instant::now() + self.config.ack_timeout;

        loop {
            let Some(segment) = self.await_control(deadline).await? else {
                attempts += 1;
                if attempts > self.config.max_retries {
                    log::warn!("[hs] handshake ACK from {from} never arrived");
                    return Err(ConnError::RetriesExhausted { attempts });
                }
                self.stats.retransmissions += 1;
                self.transmit(&syn_ack).await?;
                deadline = Instant::now() + self.config.ack_timeout;
                continue;
            };

            let header = segment.header;
            if header.control == Control::SYN && header.seq == self.stats.peer_isn {
                // Our SYN+ACK was lost.
                self.stats.retransmissions += 1;
                self.transmit(&syn_ack).await?;
                continue;
            }

            let plain = !(header.control.is_syn() || header.control.is_fin() || header.control.is_rst());
            // A data segment acknowledging our SYN means the handshake ACK
            // was lost and the client has started sending.
            let acknowledges = header.control.is_ack() || !segment.is_empty();
            if !plain || !acknowledges || header.ack != isn.wrapping_add(1) {
                log::warn!("[hs] expected ACK for {}, got {}", isn.wrapping_add(1), header);
                return Err(ConnError::ConnectionAborted(header.control));
            }

            self.sender.consume_ghost_byte();
            self.sender.send_base = self.sender.next_seq;
            self.sender.peer_window = header.window;
            self.establish();
            return Ok(from);
        }
    }

    fn establish(&mut self) {
        self.congestion = CongestionController::new(&self.config);
        self.set_state(ConnectionState::Established);
        log::info!(
            "[hs] established {} <-> {} ({})",
            self.socket.local_addr,
            self.peer.map_or_else(|| "?".to_string(), |p| p.to_string()),
            self.congestion
        );
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    /// Half-close the connection.
    ///
    /// [`Shutdown::Local`] sends our FIN, waits for it to be acknowledged and
    /// then for the peer's FIN.  [`Shutdown::Peer`] waits for the peer's FIN
    /// and answers it with our own.  On failure the connection is closed
    /// without further exchange.
    pub async fn shutdown(&mut self, how: Shutdown) -> Result<(), ConnError> {
        self.require(ConnectionState::Established)?;
        let result = match how {
            Shutdown::Local => self.close_by_local().await,
            Shutdown::Peer => self.await_peer_close().await,
        };
        if result.is_err() {
            self.close_abruptly();
        }
        result
    }

    async fn close_by_local(&mut self) -> Result<(), ConnError> {
        let fin_seq = self.sender.next_seq;
        let fin = self.build_segment(fin_seq, Control::FIN_ACK, Vec::new());
        self.sender.consume_ghost_byte();
        self.transmit(&fin).await?;

        let mut peer_finished = false;
        let mut attempts = 0u32;
        let mut deadline = Instant::now() + self.config.ack_timeout;

        // Wait for the ACK of our FIN.
        loop {
            let Some(segment) = self.await_control(deadline).await? else {
                attempts += 1;
                if attempts > self.config.max_retries {
                    return Err(ConnError::RetriesExhausted { attempts });
                }
                self.stats.retransmissions += 1;
                self.transmit(&fin).await?;
                deadline = Instant::now() + self.config.ack_timeout;
                continue;
            };

            let header = segment.header;
            if header.control.is_rst() {
                return Err(self.on_peer_reset());
            }
            if !segment.is_empty() {
                // Late retransmission of data we already hold.
                self.send_control(Control::ACK).await?;
                continue;
            }
            if !header.control.is_ack() && !header.control.is_fin() {
                log::warn!("[hs] expected ACK of FIN, got {header}");
                return Err(ConnError::ConnectionAborted(header.control));
            }
            if header.control.is_fin() {
                self.acknowledge_fin(header.seq).await?;
                peer_finished = true;
            }
            if header.control.is_ack() && header.ack == fin_seq.wrapping_add(1) {
                self.sender.send_base = header.ack;
                break;
            }
        }
        self.set_state(ConnectionState::ClosingByLocal);

        if !peer_finished {
            let fin_deadline = Instant::now() + self.config.fin_wait_timeout;
            loop {
                let Some(segment) = self.await_control(fin_deadline).await? else {
                    log::warn!("[hs] peer FIN never arrived");
                    return Err(ConnError::Timeout);
                };
                let header = segment.header;
                if header.control.is_rst() {
                    return Err(self.on_peer_reset());
                }
                if header.control.is_fin() {
                    self.acknowledge_fin(header.seq).await?;
                    break;
                }
            }
        }

        self.set_state(ConnectionState::Closed);
        self.receiver.release();
        log::info!("[hs] closed (local)");
        self.linger().await
    }

    async fn await_peer_close(&mut self) -> Result<(), ConnError> {
        let deadline = Instant::now() + self.config.fin_wait_timeout;
        loop {
            let Some(segment) = self.await_control(deadline).await? else {
                return Err(ConnError::Timeout);
            };
            let header = segment.header;
            if header.control.is_rst() {
                return Err(self.on_peer_reset());
            }
            if header.control.is_fin() {
                return self.close_by_peer(header.seq).await;
            }
            log::debug!("[hs] discarding {header} while awaiting FIN");
        }
    }

    /// Answer the peer's FIN at `fin_seq`: acknowledge it, send our own FIN
    /// and wait for that to be acknowledged.
    pub(crate) async fn close_by_peer(&mut self, fin_seq: u32) -> Result<(), ConnError> {
        self.set_state(ConnectionState::ClosingByPeer);
        self.fin_received = true;
        self.acknowledge_fin(fin_seq).await?;

        let our_fin_seq = self.sender.next_seq;
        let fin = self.build_segment(our_fin_seq, Control::FIN_ACK, Vec::new());
        self.sender.consume_ghost_byte();
        self.transmit(&fin).await?;

        let mut attempts = 0u32;
        let mut deadline = Instant::now() + self.config.ack_timeout;
        loop {
            let Some(segment) = self.await_control(deadline).await? else {
                attempts += 1;
                if attempts > self.config.max_retries {
                    return Err(ConnError::RetriesExhausted { attempts });
                }
                self.stats.retransmissions += 1;
                self.transmit(&fin).await?;
                deadline = Instant::now() + self.config.ack_timeout;
                continue;
            };

            let header = segment.header;
            if header.control.is_rst() {
                return Err(self.on_peer_reset());
            }
            if header.control.is_ack() && header.ack == our_fin_seq.wrapping_add(1) {
                self.sender.send_base = header.ack;
                break;
            }
            if header.control.is_fin() {
                // Our ACK of the peer's FIN was lost.
                self.send_control(Control::ACK).await?;
            }
        }

        self.set_state(ConnectionState::Closed);
        self.receiver.release();
        log::info!("[hs] closed (peer)");
        Ok(())
    }

    async fn acknowledge_fin(&mut self, fin_seq: u32) -> Result<(), ConnError> {
        self.receiver.on_fin(fin_seq);
        self.send_control(Control::ACK).await
    }

    /// Stay around for `time_wait`, re-acknowledging a retransmitted FIN in
    /// case our last ACK was lost.
    async fn linger(&mut self) -> Result<(), ConnError> {
        let deadline = Instant::now() + self.config.time_wait;
        while let Some(segment) = self.await_control(deadline).await? {
            if segment.header.control.is_fin() {
                log::debug!("[hs] repeated FIN during time-wait; re-ACK");
                self.send_control(Control::ACK).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Next segment from the peer before `deadline`, or `None` once it
    /// passes.  Corrupted datagrams are skipped; invalid control bits abort.
    async fn await_control(&mut self, deadline: Instant) -> Result<Option<Segment>, ConnError> {
        loop {
            match self.next_inbound(Some(deadline)).await? {
                Inbound::Segment(segment, _) => return Ok(Some(segment)),
                Inbound::Elapsed => return Ok(None),
                Inbound::Corrupt => continue,
                Inbound::BadControl(bits) => return Err(ConnError::InvalidControlCombination(bits)),
            }
        }
    }
}
