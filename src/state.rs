//! Connection finite-state machine (FSM) types.
//!
//! This module defines every state a [`crate::connection::Connection`] can
//! occupy.  Transitions are driven by [`crate::handshake`] (open and close)
//! and by the data path when a FIN or RST arrives; the lifecycle is:
//!
//! ```text
//!  INVALID ──accept──▶ LISTEN ──SYN──▶ SYN_RECEIVED ──ACK──▶ ESTABLISHED
//!     │                                                        ▲    │
//!     └──connect──▶ SYN_SENT ──SYN-ACK / send ACK──────────────┘    │
//!                                                                   │
//!           ┌──── local FIN+ACK, ACK rcvd ── CLOSING_BY_LOCAL ◀─────┤
//!           │                                                       │
//!           │      peer FIN rcvd ─────────── CLOSING_BY_PEER  ◀─────┘
//!           ▼                                       │
//!        CLOSED ◀───────────────────────────────────┘
//! ```
//!
//! Handshake mismatches fall back to `Invalid`; a received RST goes straight
//! to `Closed`.

use std::fmt;

/// All possible states of the connection FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Freshly opened or aborted handshake; a new handshake may begin.
    #[default]
    Invalid,
    /// Passive open: waiting for a SYN.
    Listen,
    /// Active open: SYN sent, waiting for SYN-ACK.
    SynSent,
    /// SYN received; SYN-ACK sent; waiting for ACK.
    SynReceived,
    /// Three-way handshake complete; data transfer in progress.
    Established,
    /// Local FIN acknowledged; waiting for the peer's FIN.
    ClosingByLocal,
    /// Peer's FIN received; our own FIN is being exchanged.
    ClosingByPeer,
    /// Connection finished; the receive buffer has been released.
    Closed,
}

impl ConnectionState {
    /// States from which `connect` / `accept` may start a handshake.
    pub fn can_open(self) -> bool {
        matches!(self, Self::Invalid | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "INVALID",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::ClosingByLocal => "CLOSING_BY_LOCAL",
            Self::ClosingByPeer => "CLOSING_BY_PEER",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// Which side of a half-close [`crate::connection::Connection::shutdown`]
/// performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// We are done sending: send FIN first, then wait for the peer's FIN.
    Local,
    /// Respond to the peer's FIN, then send our own.
    Peer,
}
