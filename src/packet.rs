//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Segment`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, control bits, payload).
//! - Serialising a [`Segment`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Header`] / [`Segment`],
//!   returning errors for malformed, truncated or corrupted input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |            Control            |             Window            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Data Length                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Checksum (CRC-32C)                       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 20 bytes.
//! seq(4) + ack(4) + control(2) + window(2) + data_len(4) + checksum(4)
//!
//! The checksum covers the payload only and is `0` for empty segments.

use std::fmt;

use thiserror::Error;

/// Bit values of the `control` header field.
pub mod flags {
    /// Finish: sender has no more data to send.
    pub const FIN: u16 = 0x0001;
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u16 = 0x0002;
    /// Reset the connection.
    pub const RST: u16 = 0x0004;
    /// Acknowledgement field is valid.
    pub const ACK: u16 = 0x0010;
    /// More payload of the same application write follows this segment.
    pub const FRAGMENT: u16 = 0x8000;

    /// Every bit the protocol knows about.
    pub const ALL: u16 = FIN | SYN | RST | ACK | FRAGMENT;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 20;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_CONTROL: usize = 8;
const OFF_WINDOW: usize = 10;
const OFF_DATA_LEN: usize = 12;
const OFF_CHECKSUM: usize = 16;

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// A validated set of control bits.
///
/// The only way to build a `Control` from raw bits is [`Control::new`], which
/// rejects SYN together with FIN as well as bits outside [`flags::ALL`].  The
/// associated constants cover every combination the protocol emits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Control(u16);

impl Control {
    /// No control bits: a plain data segment.
    pub const NONE: Control = Control(0);
    pub const SYN: Control = Control(flags::SYN);
    pub const SYN_ACK: Control = Control(flags::SYN | flags::ACK);
    pub const ACK: Control = Control(flags::ACK);
    pub const FIN_ACK: Control = Control(flags::FIN | flags::ACK);
    pub const RST: Control = Control(flags::RST);
    /// Data segment with more of the same write to follow.
    pub const FRAGMENT: Control = Control(flags::FRAGMENT);

    /// Validate a raw bit pattern.
    pub fn new(bits: u16) -> Result<Self, PacketError> {
        let syn_fin = flags::SYN | flags::FIN;
        if bits & syn_fin == syn_fin || bits & !flags::ALL != 0 {
            return Err(PacketError::InvalidControlCombination(bits));
        }
        Ok(Self(bits))
    }

    /// Raw bit pattern as written on the wire.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// `true` when every bit of `flag` is set.
    pub fn has(self, flag: u16) -> bool {
        flag != 0 && self.0 & flag == flag
    }

    pub fn is_syn(self) -> bool {
        self.has(flags::SYN)
    }

    pub fn is_ack(self) -> bool {
        self.has(flags::ACK)
    }

    pub fn is_fin(self) -> bool {
        self.has(flags::FIN)
    }

    pub fn is_rst(self) -> bool {
        self.has(flags::RST)
    }

    pub fn is_fragment(self) -> bool {
        self.has(flags::FRAGMENT)
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Control({self})")
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u16, &str); 5] = [
            (flags::SYN, "SYN"),
            (flags::FIN, "FIN"),
            (flags::RST, "RST"),
            (flags::ACK, "ACK"),
            (flags::FRAGMENT, "FRAG"),
        ];

        if self.0 == 0 {
            return f.write_str("-");
        }
        let mut first = true;
        for (bit, name) in NAMES {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Header / Segment
// ---------------------------------------------------------------------------

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Segment::encode`] converts to big-endian
/// on the wire and [`Header::decode`] converts back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sequence number of the first payload byte (or of the SYN/FIN marker).
    pub seq: u32,
    /// Acknowledgement number (next expected sequence number from the peer).
    pub ack: u32,
    /// Validated control bits.
    pub control: Control,
    /// Free space in the sender's receive buffer, in bytes.
    pub window: u16,
    /// Length of the payload in bytes.
    pub data_len: u32,
    /// CRC-32C over the payload, `0` when `data_len == 0`.
    pub checksum: u32,
}

impl Header {
    /// Parse the fixed header at the front of `buf`.
    ///
    /// Only the header is inspected; payload length and checksum are checked
    /// by [`Segment::decode`].
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }

        Ok(Header {
            seq: read_u32(buf, OFF_SEQ),
            ack: read_u32(buf, OFF_ACK),
            control: Control::new(read_u16(buf, OFF_CONTROL))?,
            window: read_u16(buf, OFF_WINDOW),
            data_len: read_u32(buf, OFF_DATA_LEN),
            checksum: read_u32(buf, OFF_CHECKSUM),
        })
    }

    /// Write this header into the first [`HEADER_LEN`] bytes of `buf`.
    fn encode_into(&self, buf: &mut [u8]) {
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.ack.to_be_bytes());
        buf[OFF_CONTROL..OFF_CONTROL + 2].copy_from_slice(&self.control.bits().to_be_bytes());
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.window.to_be_bytes());
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 4].copy_from_slice(&self.data_len.to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&self.checksum.to_be_bytes());
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] seq={} ack={} win={} len={}",
            self.control, self.seq, self.ack, self.window, self.data_len
        )
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Build a segment, filling in `data_len` and the payload checksum.
    pub fn new(seq: u32, ack: u32, control: Control, window: u16, payload: Vec<u8>) -> Self {
        Self {
            header: Header {
                seq,
                ack,
                control,
                window,
                data_len: payload.len() as u32,
                checksum: checksum(&payload),
            },
            payload,
        }
    }

    /// Serialise this segment into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];
        self.header.encode_into(&mut buf);
        buf[HEADER_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse a [`Segment`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`],
    /// - the control bits are invalid (e.g. SYN together with FIN),
    /// - the `data_len` field disagrees with `buf.len()`, or
    /// - the payload checksum does not verify.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(buf)?;

        if buf.len() - HEADER_LEN != header.data_len as usize {
            return Err(PacketError::LengthMismatch);
        }

        let payload = &buf[HEADER_LEN..];
        if !payload.is_empty() {
            let actual = checksum(payload);
            if actual != header.checksum {
                return Err(PacketError::ChecksumMismatch {
                    expected: header.checksum,
                    actual,
                });
            }
        }

        Ok(Segment {
            header,
            payload: payload.to_vec(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    /// `data_len` field does not match the actual remaining bytes.
    #[error("data_len field does not match remaining bytes")]
    LengthMismatch,
    /// SYN together with FIN, or unknown control bits.
    #[error("invalid control bit combination {0:#06x}")]
    InvalidControlCombination(u16),
    /// Payload checksum did not match the header.
    #[error("checksum mismatch: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

/// CRC-32C over `payload`; empty payloads are not checksummed.
pub fn checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    crc32c::crc32c(payload)
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
