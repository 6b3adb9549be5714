//! Connection manager for one vending peripheral.
//!
//! The manager is an actor task: application calls, link events and the two
//! session timers (connect timeout and keepalive) are processed one at a time
//! in arrival order. The handle half, [`ConnectionManager`], only forwards
//! commands, except for [`ConnectionManager::tear_down`] which closes the
//! event gate synchronously before the actor gets to release the link.

use std::{
   future,
   num::{NonZeroU32, NonZeroUsize},
   pin::Pin,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot, watch},
   time::{self, Interval, MissedTickBehavior, Sleep},
};

use crate::{
   bluetooth::link::{Link, LinkEvent, LinkFailure},
   config::{Config, SendPolicy},
   error::{ErrorKind, Result, VendError},
   event::{EventSender, SessionEvent, SessionGate, SessionId},
   vending::{
      device::{DeviceHandle, Message},
      keepalive::{KeepaliveAction, KeepaliveMonitor},
      packetizer::{Fed, Packetizer},
   },
};

/// Channel buffer size for application commands
const CHANNEL_BUFFER_SIZE: usize = 64;
/// Channel buffer size for link events
const LINK_BUFFER_SIZE: usize = 256;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ConnectionState {
   Idle,
   Connecting,
   LinkEstablished,
   SessionActive,
   Disconnecting,
}

#[derive(Debug)]
enum ManagerCommand {
   Connect(DeviceHandle, oneshot::Sender<Result<SessionId>>),
   Send(Message, oneshot::Sender<Result<()>>),
   Disconnect(oneshot::Sender<Result<()>>),
   KeepAlive(oneshot::Sender<Result<()>>),
   GetState(oneshot::Sender<ConnectionState>),
   GetSession(oneshot::Sender<Option<SessionId>>),
}

/// Session parameters fixed when the manager is created.
#[derive(Debug, Clone, Copy)]
struct SessionParams {
   packet_size: NonZeroUsize,
   connect_timeout: Duration,
   keepalive_interval: Duration,
   miss_threshold: NonZeroU32,
   anomaly_threshold: u32,
}

impl SessionParams {
   fn from_config(config: &Config) -> Result<Self> {
      config.validate()?;
      Ok(Self {
         packet_size: config.packet_size()?,
         connect_timeout: config.connect_timeout(),
         keepalive_interval: config.keepalive_interval(),
         miss_threshold: config.keepalive_miss_threshold()?,
         anomaly_threshold: config.anomaly_threshold,
      })
   }
}

/// Clears the in-flight flag of a rejected-policy send.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
   fn drop(&mut self) {
      self.0.store(false, Ordering::Release);
   }
}

/// Handle to the connection manager actor.
///
/// Dropping the handle tears the session down and stops the actor.
pub struct ConnectionManager {
   inbox: mpsc::Sender<ManagerCommand>,
   gate: Arc<SessionGate>,
   teardown: watch::Sender<u64>,
   send_policy: SendPolicy,
   busy: AtomicBool,
}

impl ConnectionManager {
   /// Spawns the manager actor driving `link`.
   ///
   /// Fails with [`VendError::InvalidConfiguration`] if `config` cannot start
   /// a session.
   pub fn new<L: Link>(link: L, config: &Config, events: EventSender) -> Result<Self> {
      let params = SessionParams::from_config(config)?;
      let gate = Arc::new(SessionGate::new(events));
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (teardown_tx, teardown_rx) = watch::channel(0);

      tokio::spawn(ManagerActor::new(link, params, gate.clone(), command_rx, teardown_rx).run());
      Ok(Self {
         inbox: command_tx,
         gate,
         teardown: teardown_tx,
         send_policy: config.send_policy,
         busy: AtomicBool::new(false),
      })
   }

   async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| VendError::ManagerShutdown)?;
      rx.await.map_err(|_| VendError::ManagerShutdown)
   }

   /// Starts connecting to `device` and returns the id of the new session.
   ///
   /// The outcome is reported as [`SessionEvent::Connected`] or
   /// [`SessionEvent::ConnectFailed`].
   pub async fn connect(&self, device: DeviceHandle) -> Result<SessionId> {
      self.request(|tx| ManagerCommand::Connect(device, tx)).await?
   }

   /// Fragments `message` and writes all of its packets.
   ///
   /// Returns once the last packet was handed to the link. Concurrent calls
   /// are queued or rejected with [`VendError::SessionBusy`] according to the
   /// configured [`SendPolicy`].
   pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
      let message = message.into();
      let _guard = match self.send_policy {
         SendPolicy::Queue => None,
         SendPolicy::Reject => {
            if self.busy.swap(true, Ordering::AcqRel) {
               return Err(VendError::SessionBusy);
            }
            Some(BusyGuard(&self.busy))
         },
      };
      self.request(|tx| ManagerCommand::Send(message, tx)).await?
   }

   /// Ends the current session. Idle managers accept this as a no-op.
   pub async fn disconnect(&self) -> Result<()> {
      self.request(ManagerCommand::Disconnect).await?
   }

   /// Sends a ping right away instead of waiting for the keepalive timer.
   pub async fn keep_alive(&self) -> Result<()> {
      self.request(ManagerCommand::KeepAlive).await?
   }

   pub async fn state(&self) -> ConnectionState {
      self
         .request(ManagerCommand::GetState)
         .await
         .unwrap_or(ConnectionState::Idle)
   }

   pub async fn session(&self) -> Option<SessionId> {
      self.request(ManagerCommand::GetSession).await.ok().flatten()
   }

   /// Abandons the current session from any state.
   ///
   /// An announced session gets its final `Disconnected` before this
   /// returns; nothing is delivered for it afterwards. Idempotent.
   pub fn tear_down(&self) {
      if let Some(id) = self.gate.tear_down() {
         info!("{id}: torn down");
      }
      self.teardown.send_modify(|generation| *generation += 1);
   }
}

impl Drop for ConnectionManager {
   fn drop(&mut self) {
      self.gate.tear_down();
   }
}

/// Live state of one connection attempt or session.
struct Session {
   id: SessionId,
   device: DeviceHandle,
   packetizer: Packetizer,
   keepalive: KeepaliveMonitor,
   anomalies: u32,
}

struct ManagerActor<L: Link> {
   link: L,
   params: SessionParams,
   gate: Arc<SessionGate>,
   command_rx: mpsc::Receiver<ManagerCommand>,
   teardown_rx: watch::Receiver<u64>,

   // State
   state: ConnectionState,
   next_session: u64,
   session: Option<Session>,
   link_rx: Option<mpsc::Receiver<LinkEvent>>,
   connect_deadline: Option<Pin<Box<Sleep>>>,
   keepalive_timer: Option<Interval>,
}

async fn recv_link(rx: &mut Option<mpsc::Receiver<LinkEvent>>) -> Option<LinkEvent> {
   match rx {
      Some(rx) => rx.recv().await,
      None => future::pending().await,
   }
}

async fn expire(deadline: &mut Option<Pin<Box<Sleep>>>) {
   match deadline {
      Some(deadline) => deadline.as_mut().await,
      None => future::pending().await,
   }
}

async fn tick(timer: &mut Option<Interval>) {
   match timer {
      Some(timer) => {
         timer.tick().await;
      },
      None => future::pending().await,
   }
}

impl<L: Link> ManagerActor<L> {
   fn new(
      link: L,
      params: SessionParams,
      gate: Arc<SessionGate>,
      command_rx: mpsc::Receiver<ManagerCommand>,
      teardown_rx: watch::Receiver<u64>,
   ) -> Self {
      Self {
         link,
         params,
         gate,
         command_rx,
         teardown_rx,
         state: ConnectionState::Idle,
         next_session: 1,
         session: None,
         link_rx: None,
         connect_deadline: None,
         keepalive_timer: None,
      }
   }

   async fn run(mut self) {
      debug!("Connection manager starting up");

      loop {
         select! {
            biased;
            changed = self.teardown_rx.changed() => {
               if changed.is_err() {
                  break;
               }
               self.release().await;
            }
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  break;
               };
               self.handle_command(cmd).await;
            }
            event = recv_link(&mut self.link_rx) => {
               self.handle_link_event(event).await;
            }
            () = expire(&mut self.connect_deadline) => {
               if let Some(session) = &self.session {
                  warn!("{}: link not ready within {:?}", session.id, self.params.connect_timeout);
               }
               self.close_session(Some(ErrorKind::LinkTimeout)).await;
            }
            () = tick(&mut self.keepalive_timer) => {
               self.handle_keepalive_tick().await;
            }
         }
      }

      info!("Connection manager shutting down");
      self.gate.tear_down();
      self.release().await;
   }

   fn transition(&mut self, next: ConnectionState) {
      if self.state == next {
         return;
      }
      match &self.session {
         Some(session) => debug!("{}: {} -> {next}", session.id, self.state),
         None => debug!("{} -> {next}", self.state),
      }
      self.state = next;
      if next != ConnectionState::Connecting {
         self.connect_deadline = None;
      }
      if next != ConnectionState::SessionActive {
         self.keepalive_timer = None;
      }
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Connect(device, reply) => {
            let result = self.connect(device).await;
            let _ = reply.send(result);
         },
         ManagerCommand::Send(message, reply) => {
            let result = self.send(&message).await;
            let _ = reply.send(result);
         },
         ManagerCommand::Disconnect(reply) => {
            if self.state != ConnectionState::Idle {
               self.close_session(None).await;
            }
            let _ = reply.send(Ok(()));
         },
         ManagerCommand::KeepAlive(reply) => {
            let result = self.probe().await;
            let _ = reply.send(result);
         },
         ManagerCommand::GetState(reply) => {
            let _ = reply.send(self.state);
         },
         ManagerCommand::GetSession(reply) => {
            let _ = reply.send(self.session.as_ref().map(|s| s.id));
         },
      }
   }

   async fn connect(&mut self, device: DeviceHandle) -> Result<SessionId> {
      if self.state != ConnectionState::Idle {
         return Err(VendError::AlreadyConnecting);
      }

      let id = SessionId(self.next_session);
      self.next_session += 1;
      let attempts = device.attempts().increment();
      info!("{id}: connecting to {device} (attempt {attempts})");

      self.gate.open(id);
      let (tx, rx) = mpsc::channel(LINK_BUFFER_SIZE);
      self.link_rx = Some(rx);
      self.session = Some(Session {
         id,
         device: device.clone(),
         packetizer: Packetizer::new(self.params.packet_size),
         keepalive: KeepaliveMonitor::new(self.params.keepalive_interval, self.params.miss_threshold),
         anomalies: 0,
      });
      self.transition(ConnectionState::Connecting);
      self.connect_deadline = Some(Box::pin(time::sleep(self.params.connect_timeout)));

      if let Err(e) = self.link.connect(&device, tx).await {
         warn!("{id}: link connect failed: {e}");
         self.close_session(Some(e.kind())).await;
         return Err(e);
      }
      Ok(id)
   }

   async fn handle_link_event(&mut self, event: Option<LinkEvent>) {
      match event {
         Some(LinkEvent::Ready) => self.establish(),
         Some(LinkEvent::Data(bytes)) => self.handle_inbound(&bytes).await,
         Some(LinkEvent::Failed(failure)) => {
            let reason = failure.kind();
            match &failure {
               LinkFailure::Dropped(why) => warn!("Link dropped: {why}"),
               failure => warn!("Link failed: {failure:?}"),
            }
            self.close_session(Some(reason)).await;
         },
         None => {
            warn!("Link event stream closed");
            self.close_session(Some(ErrorKind::LinkDropped)).await;
         },
      }
   }

   fn establish(&mut self) {
      if self.state != ConnectionState::Connecting {
         debug!("Ignoring link ready in state {}", self.state);
         return;
      }
      self.transition(ConnectionState::LinkEstablished);

      let Some(session) = self.session.as_mut() else {
         return;
      };
      session.packetizer.reset();
      session.keepalive = KeepaliveMonitor::new(self.params.keepalive_interval, self.params.miss_threshold);
      session.anomalies = 0;
      session.device.attempts().reset();
      let id = session.id;
      info!("{id}: session active with {}", session.device);

      let interval = self.params.keepalive_interval;
      let mut timer = time::interval_at(time::Instant::now() + interval, interval);
      timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

      self.transition(ConnectionState::SessionActive);
      self.keepalive_timer = Some(timer);
      self.gate.emit(id, SessionEvent::Connected);
   }

   async fn handle_inbound(&mut self, bytes: &[u8]) {
      if self.state != ConnectionState::SessionActive {
         debug!("Dropping {} inbound bytes in state {}", bytes.len(), self.state);
         return;
      }
      let Some(session) = self.session.as_mut() else {
         return;
      };
      let id = session.id;

      let reply = match session.packetizer.feed(bytes) {
         Ok(Fed::Pending) => {
            session.keepalive.on_traffic();
            None
         },
         Ok(Fed::Message(message)) => {
            session.keepalive.on_traffic();
            session.anomalies = 0;
            debug!("{id}: message of {} bytes", message.len());
            self.gate.emit(id, SessionEvent::Data(message));
            None
         },
         Ok(Fed::Control(kind)) => session.keepalive.on_frame(kind, Instant::now()),
         Err(e) => {
            session.keepalive.on_traffic();
            session.anomalies += 1;
            let consecutive = session.anomalies;
            warn!("{id}: protocol anomaly #{consecutive}: {e} ({})", hex::encode(bytes));
            self.gate.emit(id, SessionEvent::ProtocolAnomaly { consecutive });
            if consecutive > self.params.anomaly_threshold {
               error!("{id}: too many consecutive anomalies, dropping session");
               self.close_session(Some(ErrorKind::ProtocolAnomaly)).await;
            }
            None
         },
      };

      if let Some(reply) = reply
         && let Err(e) = self.link.write_raw(&reply.encode()).await
      {
         warn!("{id}: failed to answer ping: {e}");
         self.close_session(Some(e.kind())).await;
      }
   }

   async fn handle_keepalive_tick(&mut self) {
      let Some(session) = self.session.as_mut() else {
         return;
      };
      match session.keepalive.on_tick() {
         KeepaliveAction::Idle => {},
         KeepaliveAction::SendPing => {
            debug!("{}: link idle, pinging (missed {})", session.id, session.keepalive.missed());
            if let Err(e) = self.probe().await {
               warn!("Keepalive ping failed: {e}");
            }
         },
         KeepaliveAction::Stale => {
            self.close_session(Some(ErrorKind::LinkTimeout)).await;
         },
      }
   }

   /// Writes a ping frame now.
   async fn probe(&mut self) -> Result<()> {
      if self.state != ConnectionState::SessionActive {
         return Err(VendError::NotConnected);
      }
      let Some(session) = self.session.as_mut() else {
         return Err(VendError::NotConnected);
      };
      let ping = session.keepalive.probe(Instant::now()).encode();
      if let Err(e) = self.link.write_raw(&ping).await {
         self.close_session(Some(e.kind())).await;
         return Err(e);
      }
      Ok(())
   }

   async fn send(&mut self, message: &Message) -> Result<()> {
      if self.state != ConnectionState::SessionActive {
         return Err(VendError::NotConnected);
      }
      let Some(session) = self.session.as_ref() else {
         return Err(VendError::NotConnected);
      };
      let id = session.id;
      let frames = session.packetizer.fragment(message.as_bytes());
      debug!("{id}: sending {} bytes in {} packet(s)", message.len(), frames.len());

      for frame in &frames {
         select! {
            biased;
            _ = self.teardown_rx.changed() => {
               debug!("{id}: send interrupted by teardown");
               self.release().await;
               return Err(VendError::NotConnected);
            }
            written = self.link.write_raw(frame) => {
               if let Err(e) = written {
                  error!("{id}: write failed: {e}");
                  self.close_session(Some(e.kind())).await;
                  return Err(e);
               }
            }
         }
      }
      Ok(())
   }

   /// Leaves any non-idle state through `Disconnecting`, releasing the link
   /// and emitting the final event of the session.
   async fn close_session(&mut self, reason: Option<ErrorKind>) {
      if self.state == ConnectionState::Idle {
         return;
      }
      self.transition(ConnectionState::Disconnecting);
      self.link_rx = None;
      self.link.disconnect().await;

      let session = self.session.take();
      self.transition(ConnectionState::Idle);
      if let Some(session) = session {
         match reason {
            Some(kind) => info!("{}: closed ({kind})", session.id),
            None => info!("{}: disconnected", session.id),
         }
         self.gate.close(session.id, reason);
      }
   }

   /// Drops everything without emitting events.
   async fn release(&mut self) {
      self.link_rx = None;
      self.session = None;
      self.transition(ConnectionState::Idle);
      self.link.disconnect().await;
   }
}
