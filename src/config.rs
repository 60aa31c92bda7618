//! Protocol constants, gathered in one adjustable struct.
//!
//! A [`Config`] is handed to [`crate::connection::Connection::open`] and kept
//! for the lifetime of the connection.  `Default` gives the stock values;
//! tests and the CLI override individual fields.

use std::time::Duration;

use crate::connection::ConnError;

/// Default Maximum Segment Size (payload bytes per segment).
pub const DEFAULT_MSS: u32 = 1400;

/// Default receive-buffer capacity, which is also the advertised window.
pub const DEFAULT_RECV_BUFFER_LEN: usize = 8192;

/// Adjustable protocol parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Maximum payload bytes carried by one segment.
    pub mss: u32,
    /// Capacity of the receive buffer (the largest window we can advertise).
    pub recv_buffer_len: usize,
    /// Congestion window right after the handshake, in bytes.
    pub init_cwnd: u32,
    /// Slow-start threshold right after the handshake, in bytes.
    pub init_ssthresh: u32,
    /// How long to wait for an acknowledgement before declaring loss.
    pub ack_timeout: Duration,
    /// Consecutive loss rounds tolerated before giving up.
    pub max_retries: u32,
    /// Consecutive corrupted segments tolerated by `recv`.
    pub max_corrupt_segments: u32,
    /// How long the closing side waits for the peer's own FIN.
    pub fin_wait_timeout: Duration,
    /// Linger after the final ACK, re-acknowledging retransmitted FINs.
    pub time_wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            recv_buffer_len: DEFAULT_RECV_BUFFER_LEN,
            init_cwnd: 3 * DEFAULT_MSS,
            init_ssthresh: DEFAULT_RECV_BUFFER_LEN as u32,
            ack_timeout: Duration::from_millis(200),
            max_retries: 8,
            max_corrupt_segments: 16,
            fin_wait_timeout: Duration::from_secs(5),
            time_wait: Duration::from_millis(200),
        }
    }
}

impl Config {
    /// Default configuration with a different MSS; the initial congestion
    /// window follows it (3 segments).
    pub fn with_mss(mss: u32) -> Self {
        Self {
            mss,
            init_cwnd: 3 * mss,
            ..Self::default()
        }
    }

    /// Reject combinations the protocol cannot honour.
    pub fn validate(&self) -> Result<(), ConnError> {
        if self.mss == 0 {
            return Err(ConnError::Config("mss must be non-zero".into()));
        }
        if self.recv_buffer_len > usize::from(u16::MAX) {
            return Err(ConnError::Config(format!(
                "recv_buffer_len {} does not fit the 16-bit window field",
                self.recv_buffer_len
            )));
        }
        if self.recv_buffer_len < self.mss as usize {
            return Err(ConnError::Config(format!(
                "recv_buffer_len {} is smaller than one segment ({})",
                self.recv_buffer_len, self.mss
            )));
        }
        if self.init_cwnd == 0 || self.init_ssthresh == 0 {
            return Err(ConnError::Config(
                "initial cwnd and ssthresh must be non-zero".into(),
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(ConnError::Config("ack_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
