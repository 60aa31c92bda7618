//! Congestion control: slow start, congestion avoidance, fast recovery.
//!
//! [`CongestionController`] owns `cwnd`, `ssthresh` and the duplicate-ACK
//! counter.  It performs no I/O; the transmit path in
//! [`crate::connection::Connection::send`] feeds it one event per
//! acknowledgement or timeout and asks it how much may be in flight.
//!
//! ```text
//!               new ACK, cwnd reaches ssthresh
//!  ┌───────────┐ ─────────────────────────────▶ ┌──────────────────────┐
//!  │ SLOW_START│                                 │ CONGESTION_AVOIDANCE │
//!  └───────────┘ ◀──────────── timeout ───────── └──────────────────────┘
//!        ▲  │                                       ▲            │
//!        │  │ 3rd dup ACK                 new ACK   │            │ 3rd dup ACK
//!        │  ▼                                       │            ▼
//!        │ ┌───────────────┐ ───────────────────────┘            │
//!        └─│ FAST_RECOVERY │ ◀───────────────────────────────────┘
//!  timeout └───────────────┘
//! ```

use std::fmt;

use crate::config::Config;

/// Duplicate ACKs that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// Congestion-control phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    /// Exponential growth: `cwnd` doubles per fresh ACK.
    SlowStart,
    /// Additive increase: `cwnd` grows by one MSS per fresh ACK.
    CongestionAvoidance,
    /// Entered on the third duplicate ACK; left on the next fresh ACK.
    FastRecovery,
}

impl fmt::Display for CongestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SlowStart => "SLOW_START",
            Self::CongestionAvoidance => "CONGESTION_AVOIDANCE",
            Self::FastRecovery => "FAST_RECOVERY",
        };
        f.write_str(name)
    }
}

/// Window state for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CongestionController {
    state: CongestionState,
    cwnd: u32,
    ssthresh: u32,
    dup_acks: u32,
    mss: u32,
}

impl CongestionController {
    /// Start in slow start with the configured initial window and threshold.
    pub fn new(config: &Config) -> Self {
        Self {
            state: CongestionState::SlowStart,
            cwnd: config.init_cwnd.max(1),
            ssthresh: config.init_ssthresh,
            dup_acks: 0,
            mss: config.mss,
        }
    }

    pub fn state(&self) -> CongestionState {
        self.state
    }

    /// Congestion window in bytes.
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Slow-start threshold in bytes.
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// Consecutive duplicate ACKs in the current streak.
    pub fn duplicate_acks(&self) -> u32 {
        self.dup_acks
    }

    /// An ACK acknowledged new data.
    pub fn on_new_ack(&mut self) {
        self.dup_acks = 0;
        match self.state {
            CongestionState::SlowStart => {
                self.cwnd = self.cwnd.saturating_mul(2).min(self.ssthresh).max(self.cwnd);
                if self.cwnd >= self.ssthresh {
                    self.state = CongestionState::CongestionAvoidance;
                }
            }
            CongestionState::CongestionAvoidance => {
                self.cwnd = self.cwnd.saturating_add(self.mss);
            }
            CongestionState::FastRecovery => {
                // Deflate the window inflated by the duplicate ACKs.
                self.cwnd = self.ssthresh;
                self.state = CongestionState::CongestionAvoidance;
            }
        }
        log::trace!("[cc] new ack: {self}");
    }

    /// An ACK repeated the current cumulative acknowledgement.
    ///
    /// Returns `true` exactly once per streak, on the third duplicate: the
    /// caller must retransmit the oldest unacknowledged segment.
    pub fn on_duplicate_ack(&mut self) -> bool {
        self.dup_acks += 1;

        if self.dup_acks == DUP_ACK_THRESHOLD {
            self.ssthresh = self.halved_window();
            self.cwnd = self.ssthresh.saturating_add(self.mss);
            self.state = CongestionState::FastRecovery;
            log::debug!("[cc] triple duplicate ack: {self}");
            return true;
        }

        if self.dup_acks > DUP_ACK_THRESHOLD && self.state == CongestionState::FastRecovery {
            self.cwnd = self.cwnd.saturating_add(self.mss);
        }
        false
    }

    /// No acknowledgement arrived within the ACK timeout.
    pub fn on_timeout(&mut self) {
        self.ssthresh = self.halved_window();
        self.cwnd = self.mss.min(self.ssthresh);
        self.dup_acks = 0;
        self.state = CongestionState::SlowStart;
        log::debug!("[cc] timeout: {self}");
    }

    /// Half the current window, kept positive.
    fn halved_window(&self) -> u32 {
        (self.cwnd / 2).max(1)
    }
}

impl fmt::Display for CongestionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state={} cwnd={} ssthresh={} dupacks={}",
            self.state, self.cwnd, self.ssthresh, self.dup_acks
        )
    }
}
