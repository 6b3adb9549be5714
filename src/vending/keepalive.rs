//! Link liveness tracking.
//!
//! The monitor is driven by the connection manager: it is told about every
//! inbound frame and about each keepalive timer tick, and answers with the
//! action the manager must take. It owns no timer and performs no I/O.

use std::{
   num::NonZeroU32,
   time::{Duration, Instant},
};

use log::{debug, warn};

use crate::vending::protocol::{Frame, FrameKind};

/// Action requested by the monitor after a timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveAction {
   /// Traffic was seen during the last interval.
   Idle,
   /// The link was silent; probe the peer.
   SendPing,
   /// Too many silent intervals; treat the link as dropped.
   Stale,
}

#[derive(Debug)]
pub struct KeepaliveMonitor {
   interval: Duration,
   miss_threshold: NonZeroU32,
   missed: u32,
   traffic_seen: bool,
   stale: bool,
   last_ping_sent: Option<Instant>,
   last_ping_received: Option<Instant>,
}

impl KeepaliveMonitor {
   pub fn new(interval: Duration, miss_threshold: NonZeroU32) -> Self {
      Self {
         interval,
         miss_threshold,
         missed: 0,
         traffic_seen: false,
         stale: false,
         last_ping_sent: None,
         last_ping_received: None,
      }
   }

   pub fn interval(&self) -> Duration {
      self.interval
   }

   /// Consecutive silent intervals so far.
   pub fn missed(&self) -> u32 {
      self.missed
   }

   pub fn is_stale(&self) -> bool {
      self.stale
   }

   pub fn last_ping_sent(&self) -> Option<Instant> {
      self.last_ping_sent
   }

   pub fn last_ping_received(&self) -> Option<Instant> {
      self.last_ping_received
   }

   /// Records inbound traffic of any kind.
   pub fn on_traffic(&mut self) {
      self.traffic_seen = true;
      self.missed = 0;
   }

   /// Handles an inbound keepalive frame, returning the reply to send.
   pub fn on_frame(&mut self, kind: FrameKind, now: Instant) -> Option<Frame<'static>> {
      self.on_traffic();
      match kind {
         FrameKind::Ping => {
            debug!("Ping in, replying");
            self.last_ping_received = Some(now);
            Some(Frame::pong())
         },
         FrameKind::Pong => {
            if let Some(sent) = self.last_ping_sent {
               debug!("Pong in after {:?}", now.saturating_duration_since(sent));
            }
            self.last_ping_received = Some(now);
            None
         },
         FrameKind::Data { .. } => None,
      }
   }

   /// Builds an outbound probe and records when it was sent.
   pub fn probe(&mut self, now: Instant) -> Frame<'static> {
      self.last_ping_sent = Some(now);
      Frame::ping()
   }

   /// Advances the monitor by one keepalive interval.
   ///
   /// Reports [`KeepaliveAction::Stale`] at most once.
   pub fn on_tick(&mut self) -> KeepaliveAction {
      if self.stale {
         return KeepaliveAction::Idle;
      }
      if std::mem::take(&mut self.traffic_seen) {
         self.missed = 0;
         return KeepaliveAction::Idle;
      }

      self.missed += 1;
      if self.missed >= self.miss_threshold.get() {
         warn!(
            "No traffic for {} intervals of {:?}, link is stale",
            self.missed, self.interval
         );
         self.stale = true;
         KeepaliveAction::Stale
      } else {
         KeepaliveAction::SendPing
      }
   }
}
