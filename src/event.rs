//! Event handling for connection lifecycle and discovery updates.
//!
//! Applications register an [`EventBus`] with the connection manager and a
//! [`ScanEventBus`] with the scanner. Session events are routed through a
//! [`SessionGate`] so that nothing is delivered for a session once it was
//! closed or torn down.

use std::{cell::Cell, fmt, sync::Arc};

use log::debug;
use parking_lot::ReentrantMutex;
use tokio::sync::mpsc;

use crate::{
   error::ErrorKind,
   vending::device::{DeviceHandle, Message},
};

/// Identifies one connection session; never reused by a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "session#{}", self.0)
   }
}

/// Events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
   /// The session is active and accepts `send`.
   Connected,
   /// The active session ended. `reason` is `None` for a requested disconnect.
   Disconnected { reason: Option<ErrorKind> },
   /// The link never became ready; no `Connected` was emitted.
   ConnectFailed(ErrorKind),
   /// A complete inbound message.
   Data(Message),
   /// A packet was discarded; the session continues.
   ProtocolAnomaly { consecutive: u32 },
}

/// Events emitted by the discovery scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
   /// The radio is powered and the scan started.
   Ready,
   /// The radio is unavailable; terminal for the current scan.
   PoweredOff,
   /// The scan timed out with the accumulated candidates.
   ScanDone(Vec<DeviceHandle>),
   /// The radio failed mid-scan; terminal for the current scan.
   Failed(ErrorKind),
}

/// Trait for implementing session event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, session: SessionId, event: SessionEvent);
}

/// Trait for implementing discovery event emission.
pub trait ScanEventBus: Send + Sync {
   fn emit(&self, event: ScanEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Type alias for a thread-safe scan event sender.
pub type ScanEventSender = Arc<dyn ScanEventBus>;

/// Forwards events into an unbounded tokio channel.
#[derive(Debug)]
pub struct ChannelBus<T> {
   tx: mpsc::UnboundedSender<T>,
}

impl<T> ChannelBus<T> {
   pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<T>) {
      let (tx, rx) = mpsc::unbounded_channel();
      (Arc::new(Self { tx }), rx)
   }
}

impl EventBus for ChannelBus<(SessionId, SessionEvent)> {
   fn emit(&self, session: SessionId, event: SessionEvent) {
      let _ = self.tx.send((session, event));
   }
}

impl ScanEventBus for ChannelBus<ScanEvent> {
   fn emit(&self, event: ScanEvent) {
      let _ = self.tx.send(event);
   }
}

#[derive(Debug, Clone, Copy)]
struct LiveSession {
   id: SessionId,
   announced: bool,
}

/// Serializes event delivery against session teardown.
///
/// All emission happens under the gate lock, so once [`SessionGate::close`]
/// or [`SessionGate::tear_down`] returns no further event of that session can
/// be delivered, and the final `Disconnected` is delivered at most once. The
/// lock is reentrant: a listener may tear the session down from inside
/// [`EventBus::emit`].
pub struct SessionGate {
   bus: EventSender,
   live: ReentrantMutex<Cell<Option<LiveSession>>>,
}

impl SessionGate {
   pub fn new(bus: EventSender) -> Self {
      Self {
         bus,
         live: ReentrantMutex::new(Cell::new(None)),
      }
   }

   /// Starts routing events for `id`, replacing any previous session.
   pub fn open(&self, id: SessionId) {
      self.live.lock().set(Some(LiveSession {
         id,
         announced: false,
      }));
   }

   pub fn is_open(&self, id: SessionId) -> bool {
      self.live.lock().get().is_some_and(|live| live.id == id)
   }

   /// Delivers `event` if `id` is still the live session.
   pub fn emit(&self, id: SessionId, event: SessionEvent) -> bool {
      let live = self.live.lock();
      match live.get() {
         Some(mut session) if session.id == id => {
            if matches!(event, SessionEvent::Connected) {
               session.announced = true;
               live.set(Some(session));
            }
            self.bus.emit(id, event);
            true
         },
         _ => {
            debug!("{id}: suppressed {event:?}");
            false
         },
      }
   }

   /// Ends session `id`, emitting its final event.
   ///
   /// An announced session gets `Disconnected`; one that never connected
   /// gets `ConnectFailed` when a reason is known.
   pub fn close(&self, id: SessionId, reason: Option<ErrorKind>) -> bool {
      let live = self.live.lock();
      let Some(session) = live.get().filter(|s| s.id == id) else {
         return false;
      };
      live.set(None);
      if session.announced {
         self.bus.emit(id, SessionEvent::Disconnected { reason });
      } else if let Some(kind) = reason {
         self.bus.emit(id, SessionEvent::ConnectFailed(kind));
      }
      true
   }

   /// Ends whatever session is live. Idempotent.
   pub fn tear_down(&self) -> Option<SessionId> {
      let live = self.live.lock();
      let session = live.take()?;
      if session.announced {
         self.bus.emit(session.id, SessionEvent::Disconnected { reason: None });
      }
      Some(session.id)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn gate() -> (SessionGate, mpsc::UnboundedReceiver<(SessionId, SessionEvent)>) {
      let (bus, rx) = ChannelBus::new();
      (SessionGate::new(bus), rx)
   }

   fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
      let mut out = Vec::new();
      while let Ok(item) = rx.try_recv() {
         out.push(item);
      }
      out
   }

   #[test]
   fn test_tear_down_is_idempotent() {
      let (gate, mut rx) = gate();
      let id = SessionId(1);
      gate.open(id);
      assert!(gate.emit(id, SessionEvent::Connected));
      assert_eq!(gate.tear_down(), Some(id));
      assert_eq!(gate.tear_down(), None);
      assert!(!gate.close(id, Some(ErrorKind::LinkDropped)));

      assert_eq!(
         drain(&mut rx),
         vec![
            (id, SessionEvent::Connected),
            (id, SessionEvent::Disconnected { reason: None }),
         ]
      );
   }

   #[test]
   fn test_events_suppressed_after_close() {
      let (gate, mut rx) = gate();
      let id = SessionId(7);
      gate.open(id);
      gate.emit(id, SessionEvent::Connected);
      assert!(gate.close(id, Some(ErrorKind::LinkTimeout)));
      assert!(!gate.emit(id, SessionEvent::Data(Message::from("late"))));

      let events = drain(&mut rx);
      assert_eq!(events.len(), 2);
      assert_eq!(
         events[1].1,
         SessionEvent::Disconnected {
            reason: Some(ErrorKind::LinkTimeout)
         }
      );
   }

   #[test]
   fn test_unannounced_session_reports_connect_failure() {
      let (gate, mut rx) = gate();
      let id = SessionId(2);
      gate.open(id);
      assert!(gate.close(id, Some(ErrorKind::LinkTimeout)));
      assert_eq!(
         drain(&mut rx),
         vec![(id, SessionEvent::ConnectFailed(ErrorKind::LinkTimeout))]
      );

      gate.open(SessionId(3));
      gate.tear_down();
      assert!(drain(&mut rx).is_empty());
   }

   #[test]
   fn test_stale_session_id_is_ignored() {
      let (gate, mut rx) = gate();
      gate.open(SessionId(1));
      gate.open(SessionId(2));
      assert!(!gate.emit(SessionId(1), SessionEvent::Connected));
      assert!(!gate.close(SessionId(1), None));
      assert!(gate.is_open(SessionId(2)));
      assert!(drain(&mut rx).is_empty());
   }

   struct TearDownOnData {
      gate: std::sync::OnceLock<std::sync::Weak<SessionGate>>,
      tx: mpsc::UnboundedSender<SessionEvent>,
   }

   impl EventBus for TearDownOnData {
      fn emit(&self, _session: SessionId, event: SessionEvent) {
         let data = matches!(event, SessionEvent::Data(_));
         let _ = self.tx.send(event);
         if data && let Some(gate) = self.gate.get().and_then(std::sync::Weak::upgrade) {
            gate.tear_down();
         }
      }
   }

   #[test]
   fn test_listener_may_tear_down_from_callback() {
      let (tx, mut rx) = mpsc::unbounded_channel();
      let bus = Arc::new(TearDownOnData {
         gate: std::sync::OnceLock::new(),
         tx,
      });
      let gate = Arc::new(SessionGate::new(bus.clone()));
      let _ = bus.gate.set(Arc::downgrade(&gate));

      let id = SessionId(4);
      gate.open(id);
      gate.emit(id, SessionEvent::Connected);
      assert!(gate.emit(id, SessionEvent::Data(Message::from("bye"))));
      assert!(!gate.is_open(id));
      assert!(!gate.emit(id, SessionEvent::Data(Message::from("late"))));

      assert_eq!(
         drain(&mut rx),
         vec![
            SessionEvent::Connected,
            SessionEvent::Data(Message::from("bye")),
            SessionEvent::Disconnected { reason: None },
         ]
      );
   }
}
