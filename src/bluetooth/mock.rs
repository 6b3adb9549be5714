//! In-memory link and radio.
//!
//! [`MockLink`] and [`MockRadio`] stand in for a real controller. The peer
//! side is driven through their handles: signal readiness or failure, deliver
//! frames, inspect what was written. Optional behaviours (auto-ready,
//! answering pings, echoing messages) make the link usable as a simulated
//! vending machine.

use std::{
   collections::{HashMap, HashSet},
   num::NonZeroUsize,
   sync::Arc,
   time::Duration,
};

use log::debug;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{sync::mpsc, time};
use uuid::Uuid;

use crate::{
   bluetooth::{
      link::{Link, LinkBytes, LinkEvent, LinkFailure},
      radio::{Advertisement, InfoSession, Radio, RadioState},
   },
   error::{Result, VendError},
   vending::{
      device::{DeviceHandle, DeviceInfoField},
      packetizer::{Fed, Packetizer, fragment},
      protocol::{Frame, FrameKind},
   },
};

#[derive(Default)]
struct LinkState {
   events: Option<mpsc::Sender<LinkEvent>>,
   connected_to: Option<SmolStr>,
   written: Vec<Vec<u8>>,
   connects: u32,
   disconnects: u32,
   auto_ready: bool,
   auto_pong: bool,
   fail_writes: bool,
   write_delay: Duration,
   echo: Option<Packetizer>,
}

/// In-memory [`Link`].
pub struct MockLink {
   state: Arc<Mutex<LinkState>>,
}

/// Peer-side control of a [`MockLink`].
#[derive(Clone)]
pub struct MockLinkHandle {
   state: Arc<Mutex<LinkState>>,
}

impl MockLink {
   pub fn new() -> (Self, MockLinkHandle) {
      let state = Arc::new(Mutex::new(LinkState::default()));
      (
         Self {
            state: state.clone(),
         },
         MockLinkHandle { state },
      )
   }

   /// A link that behaves like a cooperative vending machine: it becomes
   /// ready immediately, answers pings and echoes every message back.
   pub fn simulated(packet_size: NonZeroUsize) -> (Self, MockLinkHandle) {
      let (link, handle) = Self::new();
      handle.set_auto_ready(true);
      handle.set_auto_pong(true);
      handle.set_echo(Some(packet_size));
      (link, handle)
   }
}

impl Link for MockLink {
   async fn connect(&mut self, device: &DeviceHandle, events: mpsc::Sender<LinkEvent>) -> Result<()> {
      let mut guard = self.state.lock();
      let state = &mut *guard;
      state.connects += 1;
      state.connected_to = Some(device.id().clone());
      if state.auto_ready {
         let _ = events.try_send(LinkEvent::Ready);
      }
      if let Some(echo) = state.echo.as_mut() {
         echo.reset();
      }
      state.events = Some(events);
      debug!("mock: connect to {device}");
      Ok(())
   }

   async fn disconnect(&mut self) {
      let mut state = self.state.lock();
      if state.events.take().is_some() {
         state.disconnects += 1;
         state.connected_to = None;
      }
   }

   async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
      let delay = self.state.lock().write_delay;
      if !delay.is_zero() {
         time::sleep(delay).await;
      }
      let mut guard = self.state.lock();
      let state = &mut *guard;
      if state.events.is_none() {
         return Err(VendError::NotConnected);
      }
      if state.fail_writes {
         return Err(VendError::LinkDropped("mock write failure".into()));
      }
      state.written.push(bytes.to_vec());

      let mut replies: Vec<LinkBytes> = Vec::new();
      if let Some(echo) = state.echo.as_mut() {
         match echo.feed(bytes) {
            Ok(Fed::Message(message)) => {
               replies.extend(fragment(message.as_bytes(), echo.packet_size()));
            },
            Ok(Fed::Control(FrameKind::Ping)) if state.auto_pong => {
               replies.push(Frame::pong().encode());
            },
            _ => {},
         }
      } else if state.auto_pong && matches!(Frame::parse(bytes), Ok(f) if f.kind == FrameKind::Ping) {
         replies.push(Frame::pong().encode());
      }

      if let Some(events) = &state.events {
         for reply in replies {
            let _ = events.try_send(LinkEvent::Data(reply));
         }
      }
      Ok(())
   }
}

impl MockLinkHandle {
   fn events(&self) -> Option<mpsc::Sender<LinkEvent>> {
      self.state.lock().events.clone()
   }

   async fn push(&self, event: LinkEvent) -> bool {
      match self.events() {
         Some(tx) => tx.send(event).await.is_ok(),
         None => false,
      }
   }

   pub fn set_auto_ready(&self, enabled: bool) {
      self.state.lock().auto_ready = enabled;
   }

   pub fn set_auto_pong(&self, enabled: bool) {
      self.state.lock().auto_pong = enabled;
   }

   pub fn set_fail_writes(&self, enabled: bool) {
      self.state.lock().fail_writes = enabled;
   }

   /// Stalls every write for `delay` before it is accepted.
   pub fn set_write_delay(&self, delay: Duration) {
      self.state.lock().write_delay = delay;
   }

   /// Echo every complete message back, fragmented with `packet_size`.
   pub fn set_echo(&self, packet_size: Option<NonZeroUsize>) {
      self.state.lock().echo = packet_size.map(Packetizer::new);
   }

   /// Signals that services were resolved.
   pub async fn ready(&self) -> bool {
      self.push(LinkEvent::Ready).await
   }

   pub async fn fail(&self, failure: LinkFailure) -> bool {
      self.push(LinkEvent::Failed(failure)).await
   }

   /// Delivers one raw frame as a notification.
   pub async fn deliver(&self, bytes: &[u8]) -> bool {
      self.push(LinkEvent::Data(LinkBytes::from_slice(bytes))).await
   }

   /// Fragments `message` and delivers every frame.
   pub async fn deliver_message(&self, message: &[u8], packet_size: NonZeroUsize) -> bool {
      for frame in fragment(message, packet_size) {
         if !self.deliver(&frame).await {
            return false;
         }
      }
      true
   }

   pub async fn ping(&self) -> bool {
      self.deliver(&Frame::ping().encode()).await
   }

   pub fn written(&self) -> Vec<Vec<u8>> {
      self.state.lock().written.clone()
   }

   pub fn take_written(&self) -> Vec<Vec<u8>> {
      std::mem::take(&mut self.state.lock().written)
   }

   /// Written frames that are not keepalive frames.
   pub fn written_data(&self) -> Vec<Vec<u8>> {
      self
         .written()
         .into_iter()
         .filter(|w| matches!(Frame::parse(w), Ok(f) if !f.kind.is_control()))
         .collect()
   }

   pub fn written_count(&self, kind: FrameKind) -> usize {
      self
         .written()
         .iter()
         .filter(|w| matches!(Frame::parse(w), Ok(f) if f.kind == kind))
         .count()
   }

   pub fn connects(&self) -> u32 {
      self.state.lock().connects
   }

   pub fn disconnects(&self) -> u32 {
      self.state.lock().disconnects
   }

   pub fn connected_to(&self) -> Option<SmolStr> {
      self.state.lock().connected_to.clone()
   }

   pub fn is_connected(&self) -> bool {
      self.state.lock().events.is_some()
   }
}

#[derive(Default)]
struct RadioInner {
   powered: bool,
   scripted: Vec<(Duration, Advertisement)>,
   discovery: Option<mpsc::Sender<Advertisement>>,
   info: HashMap<SmolStr, HashMap<DeviceInfoField, String>>,
   unreachable: HashSet<SmolStr>,
   info_opens: u32,
   info_closes: u32,
   read_delay: Duration,
   discovery_error: Option<String>,
}

/// In-memory [`Radio`].
#[derive(Clone)]
pub struct MockRadio {
   state: Arc<Mutex<RadioInner>>,
}

/// Control of a [`MockRadio`].
#[derive(Clone)]
pub struct MockRadioHandle {
   state: Arc<Mutex<RadioInner>>,
}

impl MockRadio {
   /// A powered radio with nothing around.
   pub fn new() -> (Self, MockRadioHandle) {
      let state = Arc::new(Mutex::new(RadioInner {
         powered: true,
         ..Default::default()
      }));
      (
         Self {
            state: state.clone(),
         },
         MockRadioHandle { state },
      )
   }
}

impl MockRadioHandle {
   pub fn set_powered(&self, powered: bool) {
      self.state.lock().powered = powered;
   }

   /// Schedules an advertisement `after` the start of every discovery.
   pub fn script(&self, after: Duration, advert: Advertisement) {
      self.state.lock().scripted.push((after, advert));
   }

   /// Injects an advertisement into the running discovery.
   pub async fn advertise(&self, advert: Advertisement) -> bool {
      let tx = self.state.lock().discovery.clone();
      match tx {
         Some(tx) => tx.send(advert).await.is_ok(),
         None => false,
      }
   }

   pub fn set_info(&self, id: &str, field: DeviceInfoField, value: &str) {
      self
         .state
         .lock()
         .info
         .entry(id.into())
         .or_default()
         .insert(field, value.to_string());
   }

   /// Delays every Device Information read.
   pub fn set_read_delay(&self, delay: Duration) {
      self.state.lock().read_delay = delay;
   }

   /// Makes discovery fail with a dropped link.
   pub fn set_discovery_error(&self, error: Option<&str>) {
      self.state.lock().discovery_error = error.map(str::to_string);
   }

   /// Makes the metadata connection to `id` fail.
   pub fn set_unreachable(&self, id: &str) {
      self.state.lock().unreachable.insert(id.into());
   }

   pub fn is_discovering(&self) -> bool {
      self
         .state
         .lock()
         .discovery
         .as_ref()
         .is_some_and(|tx| !tx.is_closed())
   }

   pub fn info_opens(&self) -> u32 {
      self.state.lock().info_opens
   }

   pub fn info_closes(&self) -> u32 {
      self.state.lock().info_closes
   }
}

impl Radio for MockRadio {
   type Info = MockInfoSession;

   async fn state(&self) -> Result<RadioState> {
      Ok(if self.state.lock().powered {
         RadioState::PoweredOn
      } else {
         RadioState::PoweredOff
      })
   }

   async fn discover(&self, _service: Uuid) -> Result<mpsc::Receiver<Advertisement>> {
      let (tx, rx) = mpsc::channel(64);
      let scripted = {
         let mut state = self.state.lock();
         if !state.powered {
            return Err(VendError::RadioUnavailable);
         }
         if let Some(error) = &state.discovery_error {
            return Err(VendError::LinkDropped(error.clone()));
         }
         state.discovery = Some(tx.clone());
         let mut scripted = state.scripted.clone();
         scripted.sort_by_key(|(after, _)| *after);
         scripted
      };

      tokio::spawn(async move {
         let start = time::Instant::now();
         for (after, advert) in scripted {
            time::sleep_until(start + after).await;
            if tx.send(advert).await.is_err() {
               return;
            }
         }
         tx.closed().await;
      });
      Ok(rx)
   }

   async fn open_info(&self, id: &SmolStr) -> Result<MockInfoSession> {
      let mut state = self.state.lock();
      if state.unreachable.contains(id) {
         return Err(VendError::LinkDropped(format!("{id} unreachable")));
      }
      state.info_opens += 1;
      Ok(MockInfoSession {
         fields: state.info.get(id).cloned().unwrap_or_default(),
         delay: state.read_delay,
         state: self.state.clone(),
      })
   }
}

/// Metadata session of a [`MockRadio`]. Counted as closed when dropped.
pub struct MockInfoSession {
   fields: HashMap<DeviceInfoField, String>,
   delay: Duration,
   state: Arc<Mutex<RadioInner>>,
}

impl Drop for MockInfoSession {
   fn drop(&mut self) {
      self.state.lock().info_closes += 1;
   }
}

impl InfoSession for MockInfoSession {
   async fn read(&mut self, field: DeviceInfoField) -> Result<String> {
      if !self.delay.is_zero() {
         time::sleep(self.delay).await;
      }
      self
         .fields
         .get(&field)
         .cloned()
         .ok_or(VendError::CharacteristicNotFound(field.uuid()))
   }

   async fn close(self) {
      debug!("mock: metadata session closed");
   }
}
