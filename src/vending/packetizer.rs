//! Message fragmentation and reassembly.
//!
//! Pure framing logic with no knowledge of the transport or of timing. A
//! message of `n` bytes becomes `ceil(n / packet_size)` frames (one frame for
//! an empty message); the frame flagged final completes the message on the
//! receiving side.

use std::num::NonZeroUsize;

use log::{debug, warn};

use crate::vending::{
   device::Message,
   protocol::{Frame, FrameError, FrameKind, RawFrame},
};

/// Splits `message` into encoded frames of at most `packet_size` payload bytes.
///
/// Deterministic: the same message and packet size always yield the same
/// sequence.
pub fn fragment(message: &[u8], packet_size: NonZeroUsize) -> Vec<RawFrame> {
   if message.is_empty() {
      let frame = Frame {
         kind: FrameKind::Data {
            first: true,
            last: true,
         },
         seq: 0,
         payload: &[],
      };
      return vec![frame.encode()];
   }

   let total = message.len().div_ceil(packet_size.get());
   message
      .chunks(packet_size.get())
      .enumerate()
      .map(|(i, chunk)| {
         Frame {
            kind: FrameKind::Data {
               first: i == 0,
               last: i + 1 == total,
            },
            seq: i as u8,
            payload: chunk,
         }
         .encode()
      })
      .collect()
}

/// Outcome of feeding one raw frame into the [`Packetizer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fed {
   /// More packets are needed before the message completes.
   Pending,
   /// A message completed.
   Message(Message),
   /// A keepalive frame; never part of a message.
   Control(FrameKind),
}

/// Reassembly state for one inbound stream.
#[derive(Debug)]
pub struct Packetizer {
   packet_size: NonZeroUsize,
   buffer: Vec<u8>,
   in_progress: bool,
   expected_seq: u8,
}

impl Packetizer {
   pub fn new(packet_size: NonZeroUsize) -> Self {
      Self {
         packet_size,
         buffer: Vec::new(),
         in_progress: false,
         expected_seq: 0,
      }
   }

   pub fn packet_size(&self) -> NonZeroUsize {
      self.packet_size
   }

   /// Whether a message is partially reassembled.
   pub fn in_progress(&self) -> bool {
      self.in_progress
   }

   /// Bytes buffered for the message in progress.
   pub fn buffered(&self) -> usize {
      self.buffer.len()
   }

   /// Drops any partial message.
   pub fn reset(&mut self) {
      self.buffer.clear();
      self.in_progress = false;
      self.expected_seq = 0;
   }

   /// Splits an outbound message using the session packet size.
   pub fn fragment(&self, message: &[u8]) -> Vec<RawFrame> {
      fragment(message, self.packet_size)
   }

   /// Appends one raw frame to the reassembly buffer.
   ///
   /// An error means the frame was discarded; the packetizer stays usable.
   pub fn feed(&mut self, raw: &[u8]) -> Result<Fed, FrameError> {
      let frame = Frame::parse(raw)?;
      let FrameKind::Data { first, last } = frame.kind else {
         return Ok(Fed::Control(frame.kind));
      };

      if frame.payload.len() > self.packet_size.get() {
         return Err(FrameError::Oversized {
            actual: frame.payload.len(),
            limit: self.packet_size.get(),
         });
      }

      if first && frame.seq != 0 {
         self.reset();
         return Err(FrameError::SequenceGap {
            expected: 0,
            actual: frame.seq,
         });
      }

      let mut restarted = None;
      if first {
         if self.in_progress {
            let dropped = self.buffer.len();
            warn!("Message restarted with {dropped} bytes pending, discarding partial message");
            restarted = Some(dropped);
         }
         self.reset();
         self.in_progress = true;
      } else if !self.in_progress {
         return Err(FrameError::Unattributed);
      } else if frame.seq != self.expected_seq {
         let expected = self.expected_seq;
         self.reset();
         return Err(FrameError::SequenceGap {
            expected,
            actual: frame.seq,
         });
      }

      self.buffer.extend_from_slice(frame.payload);
      self.expected_seq = frame.seq.wrapping_add(1);

      let fed = if last {
         let message = Message::new(std::mem::take(&mut self.buffer));
         self.reset();
         debug!("Reassembled message of {} bytes", message.len());
         Fed::Message(message)
      } else {
         Fed::Pending
      };

      // A restart is reported unless the new frame already completed a message.
      match restarted {
         Some(dropped) if matches!(fed, Fed::Pending) => Err(FrameError::Restarted { dropped }),
         _ => Ok(fed),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::vending::protocol::{FLAG_FINAL, FLAG_FIRST, FLAG_PING};

   fn size(n: usize) -> NonZeroUsize {
      NonZeroUsize::new(n).unwrap()
   }

   fn reassemble(packetizer: &mut Packetizer, frames: &[RawFrame]) -> Vec<Message> {
      frames
         .iter()
         .filter_map(|f| match packetizer.feed(f).unwrap() {
            Fed::Message(m) => Some(m),
            _ => None,
         })
         .collect()
   }

   #[test]
   fn test_fragment_45_bytes_into_20_byte_packets() {
      let message: Vec<u8> = (0..45).collect();
      let frames = fragment(&message, size(20));

      assert_eq!(frames.len(), 3);
      let payload_lens: Vec<_> = frames.iter().map(|f| f.len() - 2).collect();
      assert_eq!(payload_lens, [20, 20, 5]);
      assert_eq!(frames[0][0], FLAG_FIRST);
      assert_eq!(frames[1][0], 0);
      assert_eq!(frames[2][0], FLAG_FINAL);

      let mut packetizer = Packetizer::new(size(20));
      assert_eq!(packetizer.feed(&frames[0]), Ok(Fed::Pending));
      assert_eq!(packetizer.feed(&frames[1]), Ok(Fed::Pending));
      assert_eq!(packetizer.buffered(), 40);
      assert_eq!(packetizer.feed(&frames[2]), Ok(Fed::Message(Message::new(message))));
      assert!(!packetizer.in_progress());
   }

   #[test]
   fn test_fragment_count_matches_ceiling() {
      for (len, packet, expected) in [(1, 20, 1), (20, 20, 1), (21, 20, 2), (40, 20, 2), (7, 1, 7)] {
         let message = vec![0x5A; len];
         let frames = fragment(&message, size(packet));
         assert_eq!(frames.len(), expected, "len={len} packet={packet}");
         let last = frames.last().unwrap();
         let expected_last = if len % packet == 0 { packet } else { len % packet };
         assert_eq!(last.len() - 2, expected_last);
      }
   }

   #[test]
   fn test_fragment_is_deterministic() {
      let message = b"SELECT 14 PRICE 250".to_vec();
      assert_eq!(fragment(&message, size(6)), fragment(&message, size(6)));
   }

   #[test]
   fn test_round_trip_various_sizes() {
      let message: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
      for packet in [1, 2, 3, 19, 20, 64, 999, 1000, 4096] {
         let mut packetizer = Packetizer::new(size(packet));
         let frames = packetizer.fragment(&message);
         let messages = reassemble(&mut packetizer, &frames);
         assert_eq!(messages, vec![Message::new(message.clone())], "packet={packet}");
      }
   }

   #[test]
   fn test_empty_message_yields_single_final_packet() {
      let frames = fragment(&[], size(20));
      assert_eq!(frames.len(), 1);
      assert_eq!(frames[0].as_slice(), &[FLAG_FIRST | FLAG_FINAL, 0]);

      let mut packetizer = Packetizer::new(size(20));
      assert_eq!(packetizer.feed(&frames[0]), Ok(Fed::Message(Message::default())));
   }

   #[test]
   fn test_unattributed_packet_is_discarded() {
      let mut packetizer = Packetizer::new(size(4));
      assert_eq!(packetizer.feed(&[FLAG_FINAL, 1, 1, 2]), Err(FrameError::Unattributed));
      assert_eq!(packetizer.feed(&[0, 3, 1, 2]), Err(FrameError::Unattributed));

      // Still usable afterwards.
      assert_eq!(
         packetizer.feed(&[FLAG_FIRST | FLAG_FINAL, 0, 9]),
         Ok(Fed::Message(Message::new(vec![9])))
      );
   }

   #[test]
   fn test_restart_discards_partial_message() {
      let mut packetizer = Packetizer::new(size(4));
      assert_eq!(packetizer.feed(&[FLAG_FIRST, 0, 1, 2, 3, 4]), Ok(Fed::Pending));
      assert_eq!(
         packetizer.feed(&[FLAG_FIRST, 0, 5, 6, 7, 8]),
         Err(FrameError::Restarted { dropped: 4 })
      );
      assert_eq!(
         packetizer.feed(&[FLAG_FINAL, 1, 9]),
         Ok(Fed::Message(Message::new(vec![5, 6, 7, 8, 9])))
      );
   }

   #[test]
   fn test_first_frame_must_start_at_zero() {
      let mut packetizer = Packetizer::new(size(4));
      assert_eq!(packetizer.feed(&[FLAG_FIRST, 0, 1, 2]), Ok(Fed::Pending));
      assert_eq!(
         packetizer.feed(&[FLAG_FIRST, 5, 3, 4]),
         Err(FrameError::SequenceGap {
            expected: 0,
            actual: 5
         })
      );
      assert_eq!(packetizer.buffered(), 0);
      assert_eq!(packetizer.feed(&[FLAG_FINAL, 6, 7]), Err(FrameError::Unattributed));
      assert_eq!(
         packetizer.feed(&[FLAG_FIRST | FLAG_FINAL, 0, 9]),
         Ok(Fed::Message(Message::new(vec![9])))
      );
   }

   #[test]
   fn test_sequence_gap_resets() {
      let mut packetizer = Packetizer::new(size(2));
      packetizer.feed(&[FLAG_FIRST, 0, 1, 2]).unwrap();
      assert_eq!(
         packetizer.feed(&[0, 2, 3, 4]),
         Err(FrameError::SequenceGap {
            expected: 1,
            actual: 2
         })
      );
      assert!(!packetizer.in_progress());
      assert_eq!(packetizer.feed(&[FLAG_FINAL, 3, 5]), Err(FrameError::Unattributed));
   }

   #[test]
   fn test_oversized_payload_rejected() {
      let mut packetizer = Packetizer::new(size(2));
      assert_eq!(
         packetizer.feed(&[FLAG_FIRST | FLAG_FINAL, 0, 1, 2, 3]),
         Err(FrameError::Oversized {
            actual: 3,
            limit: 2
         })
      );
   }

   #[test]
   fn test_ping_never_enters_buffer() {
      let mut packetizer = Packetizer::new(size(4));
      packetizer.feed(&[FLAG_FIRST, 0, 1, 2, 3, 4]).unwrap();
      assert_eq!(packetizer.feed(&[FLAG_PING, 0]), Ok(Fed::Control(FrameKind::Ping)));
      assert_eq!(packetizer.buffered(), 4);
      assert_eq!(
         packetizer.feed(&[FLAG_FINAL, 1, 5]),
         Ok(Fed::Message(Message::new(vec![1, 2, 3, 4, 5])))
      );
   }

   #[test]
   fn test_sequence_wraps_for_long_messages() {
      let message = vec![0xC3; 300];
      let mut packetizer = Packetizer::new(size(1));
      let frames = packetizer.fragment(&message);
      assert_eq!(frames.len(), 300);
      assert_eq!(frames[256][1], 0);
      assert_eq!(reassemble(&mut packetizer, &frames), vec![Message::new(message)]);
   }
}
