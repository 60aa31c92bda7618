//! Async datagram channel and the segment-oriented socket built on it.
//!
//! [`Datagram`] is the unreliable, unordered channel the protocol runs on:
//! send a byte buffer to an address, receive one from anywhere.  It is
//! implemented for `tokio::net::UdpSocket` and, for fault injection, by
//! [`crate::simulator::Simulator`].
//!
//! [`Socket`] wraps any [`Datagram`] and speaks
//! [`crate::packet::Segment`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O and the codec call.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::UdpSocket;

use crate::packet::{PacketError, Segment};

/// Maximum UDP payload size (theoretical limit; in practice kept much smaller).
const MAX_DATAGRAM: usize = 65_535;

// ---------------------------------------------------------------------------
// Datagram channel
// ---------------------------------------------------------------------------

/// An unreliable datagram channel.
///
/// The returned futures are `Send` so a connection over any channel can be
/// driven from a spawned task.
pub trait Datagram: Send + Sync {
    /// Send `buf` as one datagram to `dest`.
    fn send_to(&self, buf: &[u8], dest: SocketAddr)
    -> impl Future<Output = io::Result<usize>> + Send;

    /// Receive one datagram into `buf`; returns its length and origin.
    fn recv_from(&self, buf: &mut [u8])
    -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;

    /// Address the channel is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Datagram for UdpSocket {
    async fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, dest).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] io::Error),
    /// The received datagram could not be decoded as a valid segment.
    #[error("segment decode error: {0}")]
    Packet(#[from] PacketError),
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, segment-oriented socket over a [`Datagram`] channel.
///
/// All methods are `&self`, mirroring the channel underneath.
#[derive(Debug)]
pub struct Socket<D = UdpSocket> {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: D,
}

impl Socket<UdpSocket> {
    /// Bind a new UDP socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        Self::new(inner)
    }
}

impl<D: Datagram> Socket<D> {
    /// Wrap an already-bound channel.
    pub fn new(inner: D) -> Result<Self, SocketError> {
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    /// The channel underneath.
    pub fn get_ref(&self) -> &D {
        &self.inner
    }

    /// Encode `segment` and send it as a single datagram to `dest`.
    pub async fn send_to(&self, segment: &Segment, dest: SocketAddr) -> Result<(), SocketError> {
        let bytes = segment.encode();
        self.inner.send_to(&bytes, dest).await?;
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Segment`].
    ///
    /// Returns `(segment, sender_address)`.  Datagrams that fail to decode
    /// are returned as `Err`; the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Segment, SocketAddr), SocketError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (n, addr) = self.inner.recv_from(&mut buf).await?;
        let segment = Segment::decode(&buf[..n])?;
        Ok((segment, addr))
    }
}
