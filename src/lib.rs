//! `microtcp`: a TCP-like reliable, congestion-controlled byte stream over UDP.
//!
//! # Architecture
//!
//! ```text
//!  application: connect / accept / send / recv / shutdown
//!       │
//!  ┌────▼──────────────────────────────────────────┐
//!  │                 Connection                    │
//!  │  state · Sender · Receiver · Congestion ·     │
//!  │  Diagnostics         (handshake.rs: open/close)│
//!  └────┬──────────────────────────────────────────┘
//!       │ Segment (header + payload)
//!  ┌────▼──────┐
//!  │  Socket   │  encode / decode over any Datagram channel
//!  └────┬──────┘
//!       │ raw datagrams
//!  ┌────▼─────────────────────────┐
//!  │ UdpSocket  or  Simulator<_>  │
//!  └──────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]      wire format, control bits, CRC-32C payload checksum
//! - [`seq`]         wrap-around sequence-number comparisons
//! - [`config`]      adjustable protocol constants
//! - [`state`]       lifecycle states
//! - [`sender`]      outbound sequence state and burst planning
//! - [`receiver`]    inbound sequence state, reassembly buffer, window
//! - [`congestion`]  slow start, congestion avoidance, fast recovery
//! - [`connection`]  the connection record and the data path
//! - [`handshake`]   three-way handshake and half-close
//! - [`stats`]       per-connection diagnostics
//! - [`socket`]      datagram channel trait and the segment socket
//! - [`simulator`]   fault-injecting channel for tests
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), microtcp::ConnError> {
//! use microtcp::{Config, Connection, Shutdown};
//!
//! let mut conn = Connection::bind("127.0.0.1:0".parse().unwrap(), Config::default()).await?;
//! conn.connect("127.0.0.1:9000".parse().unwrap()).await?;
//! conn.send(b"hello").await?;
//! conn.shutdown(Shutdown::Local).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod congestion;
pub mod connection;
pub mod handshake;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod seq;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stats;

pub use config::Config;
pub use congestion::CongestionState;
pub use connection::{ConnError, Connection};
pub use packet::{Control, Header, PacketError, Segment};
pub use simulator::{Simulator, SimulatorConfig};
pub use socket::{Datagram, Socket, SocketError};
pub use state::{ConnectionState, Shutdown};
pub use stats::Diagnostics;
