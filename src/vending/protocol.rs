//! Vending link protocol definitions.
//!
//! Every frame exchanged over the write/notify characteristic pair carries a
//! two byte header followed by at most `packet_size` payload bytes:
//!
//! ```text
//! +--------+--------+---------------------------+
//! | flags  |  seq   | payload (<= packet_size)  |
//! +--------+--------+---------------------------+
//! ```
//!
//! A message ends with the packet flagged [`FLAG_FINAL`]. Keepalive frames use
//! [`FLAG_PING`] / [`FLAG_PONG`] and carry no payload.

use smallvec::SmallVec;
use thiserror::Error;
use uuid::Uuid;

/// Raw bytes of one frame as written to or read from the link.
pub type RawFrame = SmallVec<[u8; 32]>;

/// Header length in bytes (flags + seq).
pub const FRAME_HEADER_LEN: usize = 2;

/// First packet of a message.
pub const FLAG_FIRST: u8 = 0x01;
/// Last packet of a message.
pub const FLAG_FINAL: u8 = 0x02;
/// Keepalive probe; the receiver must answer with [`FLAG_PONG`].
pub const FLAG_PING: u8 = 0x10;
/// Keepalive answer.
pub const FLAG_PONG: u8 = 0x20;

const DATA_MASK: u8 = FLAG_FIRST | FLAG_FINAL;
const KNOWN_MASK: u8 = DATA_MASK | FLAG_PING | FLAG_PONG;

/// Vending service advertised by the controller.
pub const VENDING_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Characteristic the central writes frames to.
pub const VENDING_WRITE_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Characteristic the controller notifies frames on.
pub const VENDING_NOTIFY_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Standard Device Information service.
pub const DEVICE_INFO_SERVICE_UUID: Uuid = sig_uuid(0x180A);

/// Expands a 16-bit Bluetooth SIG assigned number into a full UUID.
pub const fn sig_uuid(short: u16) -> Uuid {
   Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Error type for frame decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
   #[error("Frame too short: expected at least {FRAME_HEADER_LEN} bytes, got {actual}")]
   TooShort { actual: usize },

   #[error("Unknown frame flags: 0x{flags:02x}")]
   UnknownFlags { flags: u8 },

   #[error("Control frame carries data flags: 0x{flags:02x}")]
   MixedFlags { flags: u8 },

   #[error("Payload of {actual} bytes exceeds packet size {limit}")]
   Oversized { actual: usize, limit: usize },

   #[error("Packet does not belong to any message in progress")]
   Unattributed,

   #[error("Message restarted before completion, dropped {dropped} bytes")]
   Restarted { dropped: usize },

   #[error("Sequence gap: expected {expected}, got {actual}")]
   SequenceGap { expected: u8, actual: u8 },
}

/// Classification of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FrameKind {
   /// Message payload; `first`/`last` mark the message boundaries.
   Data { first: bool, last: bool },
   Ping,
   Pong,
}

impl FrameKind {
   pub const fn is_control(self) -> bool {
      matches!(self, Self::Ping | Self::Pong)
   }

   const fn flags(self) -> u8 {
      match self {
         Self::Data { first, last } => {
            let mut flags = 0;
            if first {
               flags |= FLAG_FIRST;
            }
            if last {
               flags |= FLAG_FINAL;
            }
            flags
         },
         Self::Ping => FLAG_PING,
         Self::Pong => FLAG_PONG,
      }
   }
}

/// A decoded frame borrowing its payload from the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
   pub kind: FrameKind,
   pub seq: u8,
   pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
   pub const fn ping() -> Frame<'static> {
      Frame {
         kind: FrameKind::Ping,
         seq: 0,
         payload: &[],
      }
   }

   pub const fn pong() -> Frame<'static> {
      Frame {
         kind: FrameKind::Pong,
         seq: 0,
         payload: &[],
      }
   }

   /// Parses a raw frame. Payload length is checked by the packetizer, which
   /// knows the session packet size.
   pub fn parse(data: &'a [u8]) -> Result<Self, FrameError> {
      let [flags, seq, payload @ ..] = data else {
         return Err(FrameError::TooShort { actual: data.len() });
      };
      let (flags, seq) = (*flags, *seq);

      if flags & !KNOWN_MASK != 0 {
         return Err(FrameError::UnknownFlags { flags });
      }

      let kind = match (flags & FLAG_PING != 0, flags & FLAG_PONG != 0) {
         (false, false) => FrameKind::Data {
            first: flags & FLAG_FIRST != 0,
            last: flags & FLAG_FINAL != 0,
         },
         (true, false) if flags & DATA_MASK == 0 => FrameKind::Ping,
         (false, true) if flags & DATA_MASK == 0 => FrameKind::Pong,
         _ => return Err(FrameError::MixedFlags { flags }),
      };

      Ok(Self { kind, seq, payload })
   }

   pub fn encode(&self) -> RawFrame {
      [self.kind.flags(), self.seq]
         .into_iter()
         .chain(self.payload.iter().copied())
         .collect()
   }
}
