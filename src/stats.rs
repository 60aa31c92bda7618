//! Per-connection diagnostics.
//!
//! Counters and the lifecycle history live in the connection that produced
//! them, never in process-wide state.  The initial sequence numbers double
//! as bases for printing sequence numbers relative to the start of the
//! connection, which keeps log lines readable.

use std::fmt;

use crate::packet::Header;
use crate::state::ConnectionState;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Our initial sequence number.
    pub local_isn: u32,
    /// The peer's initial sequence number, once known.
    pub peer_isn: u32,

    /// Every segment handed to the socket.
    pub segments_sent: u64,
    /// Every segment decoded from the socket.
    pub segments_received: u64,
    /// Data segments sent by `send`, retransmissions included.
    pub data_segments_sent: u64,
    /// New payload bytes sent.
    pub bytes_sent: u64,
    /// In-order payload bytes received.
    pub bytes_received: u64,

    /// ACK segments consumed while waiting for acknowledgements.
    pub acks_received: u64,
    pub duplicate_acks: u64,
    pub timeouts: u64,
    pub retransmissions: u64,
    pub fast_retransmits: u64,

    pub duplicate_segments: u64,
    pub out_of_order_segments: u64,
    pub overflow_drops: u64,
    pub checksum_failures: u64,

    /// Every state the connection entered, in order.
    pub transitions: Vec<ConnectionState>,
}

impl Diagnostics {
    /// Render `header` with sequence numbers relative to the ISNs.
    ///
    /// `outbound` selects which ISN applies to `seq` and which to `ack`.
    pub fn describe<'a>(&self, header: &'a Header, outbound: bool) -> Relative<'a> {
        let (seq_base, ack_base) = if outbound {
            (self.local_isn, self.peer_isn)
        } else {
            (self.peer_isn, self.local_isn)
        };
        Relative {
            header,
            seq_base,
            ack_base,
        }
    }
}

/// Display adapter produced by [`Diagnostics::describe`].
pub struct Relative<'a> {
    header: &'a Header,
    seq_base: u32,
    ack_base: u32,
}

impl fmt::Display for Relative<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.header;
        write!(
            f,
            "[{}] seq={} ack={} win={} len={}",
            h.control,
            h.seq.wrapping_sub(self.seq_base),
            h.ack.wrapping_sub(self.ack_base),
            h.window,
            h.data_len
        )
    }
}
