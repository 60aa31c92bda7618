//! Fault-injecting datagram channel for deterministic testing.
//!
//! Real networks drop, corrupt and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! [`Simulator`] wraps another [`Datagram`] channel and intercepts outbound
//! datagrams, applying a configurable fault model:
//!
//! | Fault          | Description                                        |
//! |----------------|----------------------------------------------------|
//! | Scripted drop  | Drop the n-th outbound datagram (0-based).         |
//! | Scripted flip  | Corrupt the n-th outbound datagram's payload.      |
//! | Packet loss    | Drop a datagram with probability `loss_rate`.      |
//! | Corruption     | Flip one payload bit with probability `corrupt_rate`. |
//! | Duplication    | Deliver a datagram twice with `duplicate_rate`.    |
//!
//! Random faults come from a seeded RNG so failures are reproducible.  The
//! first `spare_first` datagrams are never touched, which keeps handshakes
//! out of the fault model when a test only cares about data transfer.

use std::collections::BTreeSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::HEADER_LEN;
use crate::socket::Datagram;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given datagram is silently dropped.
    pub loss_rate: f64,
    /// Probability that a datagram with payload has one bit flipped.
    pub corrupt_rate: f64,
    /// Probability that a datagram is sent twice.
    pub duplicate_rate: f64,
    /// Indices of outbound datagrams to drop unconditionally.
    pub drop_sends: BTreeSet<u64>,
    /// Indices of outbound datagrams whose first payload byte is damaged.
    pub corrupt_sends: BTreeSet<u64>,
    /// Outbound datagrams exempt from random faults.
    pub spare_first: u64,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // Transparent pass-through.
        Self {
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            duplicate_rate: 0.0,
            drop_sends: BTreeSet::new(),
            corrupt_sends: BTreeSet::new(),
            spare_first: 0,
            seed: 0x5eed,
        }
    }
}

impl SimulatorConfig {
    /// Drop exactly the listed outbound datagrams and nothing else.
    pub fn dropping(indices: impl IntoIterator<Item = u64>) -> Self {
        Self {
            drop_sends: indices.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Corrupt exactly the listed outbound datagrams and nothing else.
    pub fn corrupting(indices: impl IntoIterator<Item = u64>) -> Self {
        Self {
            corrupt_sends: indices.into_iter().collect(),
            ..Self::default()
        }
    }
}

/// Counters of the faults actually injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub sent: u64,
    pub dropped: u64,
    pub corrupted: u64,
    pub duplicated: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Deliver,
    Drop,
    Corrupt { bit: usize },
    Duplicate,
}

/// A fault-injecting wrapper around another datagram channel.
#[derive(Debug)]
pub struct Simulator<D> {
    inner: D,
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    next_index: AtomicU64,
    stats: Mutex<SimulatorStats>,
}

impl<D: Datagram> Simulator<D> {
    pub fn new(inner: D, config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            inner,
            config,
            rng: Mutex::new(rng),
            next_index: AtomicU64::new(0),
            stats: Mutex::new(SimulatorStats::default()),
        }
    }

    /// Faults injected so far.
    pub fn stats(&self) -> SimulatorStats {
        *self.stats.lock()
    }

    /// Decide what happens to outbound datagram number `index`.
    fn decide(&self, index: u64, len: usize) -> Fault {
        if self.config.drop_sends.contains(&index) {
            return Fault::Drop;
        }
        if self.config.corrupt_sends.contains(&index) && len > HEADER_LEN {
            return Fault::Corrupt { bit: HEADER_LEN * 8 };
        }
        if index < self.config.spare_first {
            return Fault::Deliver;
        }

        let mut rng = self.rng.lock();
        if rng.random_bool(self.config.loss_rate) {
            return Fault::Drop;
        }
        // Control-only segments carry no checksum, so only payload bits are
        // worth flipping.
        if len > HEADER_LEN && rng.random_bool(self.config.corrupt_rate) {
            let bit = rng.random_range(HEADER_LEN * 8..len * 8);
            return Fault::Corrupt { bit };
        }
        if rng.random_bool(self.config.duplicate_rate) {
            return Fault::Duplicate;
        }
        Fault::Deliver
    }
}

impl<D: Datagram> Datagram for Simulator<D> {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let fault = self.decide(index, buf.len());
        {
            let mut stats = self.stats.lock();
            stats.sent += 1;
            match fault {
                Fault::Drop => stats.dropped += 1,
                Fault::Corrupt { .. } => stats.corrupted += 1,
                Fault::Duplicate => stats.duplicated += 1,
                Fault::Deliver => {}
            }
        }

        match fault {
            Fault::Deliver => self.inner.send_to(buf, dest).await,
            Fault::Drop => {
                log::debug!("[sim] drop datagram #{index} ({} bytes)", buf.len());
                Ok(buf.len())
            }
            Fault::Corrupt { bit } => {
                log::debug!("[sim] corrupt datagram #{index} at bit {bit}");
                let mut damaged = buf.to_vec();
                damaged[bit / 8] ^= 1 << (bit % 8);
                self.inner.send_to(&damaged, dest).await
            }
            Fault::Duplicate => {
                log::debug!("[sim] duplicate datagram #{index}");
                self.inner.send_to(buf, dest).await?;
                self.inner.send_to(buf, dest).await
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
