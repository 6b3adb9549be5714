//! Physical link abstraction.
//!
//! A [`Link`] moves raw frames over the write/notify characteristic pair of
//! one peripheral. It reports readiness, failures and inbound bytes through
//! the channel handed to [`Link::connect`]; the connection manager creates a
//! fresh channel for every session, so events of an abandoned link can never
//! reach a newer session.

use std::future::Future;

use smallvec::SmallVec;
use tokio::sync::mpsc;

use crate::{
   error::{ErrorKind, Result},
   vending::device::DeviceHandle,
};

/// Inbound bytes of one notification.
pub type LinkBytes = SmallVec<[u8; 32]>;

/// Why a link failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
   /// The radio is off or missing.
   RadioUnavailable,
   /// The peer disconnected or the transport broke.
   Dropped(String),
   /// Service or characteristic discovery did not find the vending service.
   ServiceMissing,
}

impl LinkFailure {
   pub fn kind(&self) -> ErrorKind {
      match self {
         Self::RadioUnavailable => ErrorKind::RadioUnavailable,
         Self::Dropped(_) | Self::ServiceMissing => ErrorKind::LinkDropped,
      }
   }
}

/// Events produced by a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
   /// Services and characteristics are resolved; frames can flow.
   Ready,
   Failed(LinkFailure),
   Data(LinkBytes),
}

/// Transport capability consumed by the connection manager.
///
/// Implementations must tolerate `disconnect` in any state, including before
/// `connect` completed.
pub trait Link: Send + 'static {
   /// Starts connecting to `device`. Returns once the attempt is under way;
   /// completion is reported as [`LinkEvent::Ready`] or [`LinkEvent::Failed`].
   fn connect(
      &mut self,
      device: &DeviceHandle,
      events: mpsc::Sender<LinkEvent>,
   ) -> impl Future<Output = Result<()>> + Send;

   /// Releases the link. Idempotent.
   fn disconnect(&mut self) -> impl Future<Output = ()> + Send;

   /// Writes one frame to the write characteristic.
   fn write_raw(&mut self, bytes: &[u8]) -> impl Future<Output = Result<()>> + Send;
}
