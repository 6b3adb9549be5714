//! GATT link implementation over BlueZ.
//!
//! Frames are written to the vending write characteristic and received as
//! notifications on the notify characteristic. Writes go through a command
//! channel served by a single writer so that frames leave in order.

use std::{pin::pin, time::Duration};

use bluer::{
   Adapter, Address, Device, DeviceEvent, DeviceProperty, Session,
   gatt::remote::{Characteristic, Service},
};
use futures::StreamExt;
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};
use uuid::Uuid;

use crate::{
   bluetooth::link::{Link, LinkBytes, LinkEvent, LinkFailure},
   config::Config,
   error::{Result, VendError},
   vending::device::DeviceHandle,
};

/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Polling period while BlueZ resolves services
const RESOLVE_POLL: Duration = Duration::from_millis(100);
/// Give up waiting for service resolution after this long
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

enum Command {
   Send {
      data: LinkBytes,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Sender half of a GATT connection.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct GattSender {
   tx: mpsc::Sender<Command>,
}

impl GattSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(VendError::NotConnected);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: LinkBytes::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| VendError::NotConnected)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| VendError::LinkTimeout)?
         .map_err(|_| VendError::NotConnected)?
   }
}

/// Characteristic layout of the vending service.
#[derive(Debug, Clone, Copy)]
struct GattLayout {
   service: Uuid,
   write: Uuid,
   notify: Uuid,
}

/// Internal state for an active GATT connection.
struct GattConnection {
   device: Device,
   sender: GattSender,
   jset: JoinSet<()>,
}

impl Drop for GattConnection {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// [`Link`] backed by a BlueZ adapter.
pub struct GattLink {
   adapter: Adapter,
   layout: GattLayout,
   conn: Option<GattConnection>,
}

impl GattLink {
   /// Opens the named adapter, or the default one.
   pub async fn new(session: &Session, adapter: Option<&str>, config: &Config) -> Result<Self> {
      let adapter = match adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      Ok(Self {
         adapter,
         layout: GattLayout {
            service: config.service_uuid,
            write: config.write_uuid,
            notify: config.notify_uuid,
         },
         conn: None,
      })
   }
}

impl Link for GattLink {
   async fn connect(&mut self, device: &DeviceHandle, events: mpsc::Sender<LinkEvent>) -> Result<()> {
      self.disconnect().await;

      if !self.adapter.is_powered().await? {
         return Err(VendError::RadioUnavailable);
      }

      let address: Address = device
         .id()
         .parse()
         .map_err(|_| VendError::InvalidDeviceId(device.id().to_string()))?;
      let bt_device = self.adapter.device(address)?;
      let name = device.id().clone();
      debug!("Connecting GATT link to {name}");

      let (cmd_tx, cmd_rx) = mpsc::channel(128);
      let mut jset = JoinSet::new();
      jset.spawn(link_thread(
         name,
         bt_device.clone(),
         self.layout,
         cmd_rx,
         events,
      ));

      self.conn = Some(GattConnection {
         device: bt_device,
         sender: GattSender { tx: cmd_tx },
         jset,
      });
      Ok(())
   }

   async fn disconnect(&mut self) {
      let Some(conn) = self.conn.take() else {
         return;
      };
      let device = conn.device.clone();
      drop(conn);
      if let Err(e) = device.disconnect().await {
         debug!("Disconnect of {} failed: {e}", device.address());
      }
      info!("GATT link to {} released", device.address());
   }

   async fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
      let conn = self.conn.as_ref().ok_or(VendError::NotConnected)?;
      conn.sender.send(bytes).await
   }
}

/// Waits for BlueZ to resolve the services of a connected device.
pub(crate) async fn resolved_services(device: &Device) -> Result<Vec<Service>> {
   let wait = async {
      loop {
         if device.is_services_resolved().await? {
            return device.services().await.map_err(VendError::from);
         }
         time::sleep(RESOLVE_POLL).await;
      }
   };
   time::timeout(RESOLVE_TIMEOUT, wait)
      .await
      .map_err(|_| VendError::LinkTimeout)?
}

/// Finds a service by UUID and returns its characteristics.
pub(crate) async fn service_characteristics(
   services: Vec<Service>,
   uuid: Uuid,
) -> Result<Option<Vec<Characteristic>>> {
   for service in services {
      if service.uuid().await? == uuid {
         return Ok(Some(service.characteristics().await?));
      }
   }
   Ok(None)
}

async fn find_characteristic(chars: &[Characteristic], uuid: Uuid) -> Result<Characteristic> {
   for c in chars {
      if c.uuid().await? == uuid {
         return Ok(c.clone());
      }
   }
   Err(VendError::CharacteristicNotFound(uuid))
}

async fn establish(device: &Device, layout: GattLayout) -> Result<(Characteristic, Characteristic)> {
   if !device.is_connected().await? {
      device.connect().await?;
   }
   let services = resolved_services(device).await?;
   let chars = service_characteristics(services, layout.service)
      .await?
      .ok_or(VendError::CharacteristicNotFound(layout.service))?;
   let write = find_characteristic(&chars, layout.write).await?;
   let notify = find_characteristic(&chars, layout.notify).await?;
   Ok((write, notify))
}

async fn link_thread(
   name: SmolStr,
   device: Device,
   layout: GattLayout,
   cmd_rx: mpsc::Receiver<Command>,
   events: mpsc::Sender<LinkEvent>,
) {
   let (write, notify) = match establish(&device, layout).await {
      Ok(chars) => chars,
      Err(e) => {
         warn!("{name}: GATT setup failed: {e}");
         let failure = match e {
            VendError::CharacteristicNotFound(_) => LinkFailure::ServiceMissing,
            e => LinkFailure::Dropped(e.to_string()),
         };
         let _ = events.send(LinkEvent::Failed(failure)).await;
         return;
      },
   };

   let notifications = match notify.notify().await {
      Ok(stream) => stream,
      Err(e) => {
         warn!("{name}: subscribing to notifications failed: {e}");
         let _ = events.send(LinkEvent::Failed(LinkFailure::Dropped(e.to_string()))).await;
         return;
      },
   };
   let device_events = match device.events().await {
      Ok(stream) => stream,
      Err(e) => {
         let _ = events.send(LinkEvent::Failed(LinkFailure::Dropped(e.to_string()))).await;
         return;
      },
   };

   info!("{name}: GATT link ready");
   if events.send(LinkEvent::Ready).await.is_err() {
      return;
   }

   let reason = select! {
      reason = recv_thread(&name, notifications, &events) => reason,
      reason = watch_thread(device_events) => reason,
      () = send_thread(&name, cmd_rx, &write) => "writer closed".to_string(),
   };
   warn!("{name}: link lost: {reason}");
   let _ = events.send(LinkEvent::Failed(LinkFailure::Dropped(reason))).await;
}

async fn recv_thread(
   name: &str,
   notifications: impl futures::Stream<Item = Vec<u8>>,
   events: &mpsc::Sender<LinkEvent>,
) -> String {
   let mut notifications = pin!(notifications);
   while let Some(value) = notifications.next().await {
      debug!("← {name}: {}", hex::encode(&value));
      if events.send(LinkEvent::Data(LinkBytes::from_vec(value))).await.is_err() {
         return "session closed".to_string();
      }
   }
   "notification stream ended".to_string()
}

async fn watch_thread(device_events: impl futures::Stream<Item = DeviceEvent>) -> String {
   let mut device_events = pin!(device_events);
   while let Some(event) = device_events.next().await {
      if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
         return "peer disconnected".to_string();
      }
   }
   "device removed".to_string()
}

async fn send_thread(name: &str, mut rx: mpsc::Receiver<Command>, write: &Characteristic) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {name}: {}", hex::encode(&data));
            if let Err(e) = write.write(&data).await {
               warn!("{name}: failed to write frame: {e}");
               let _ = then.send(Err(VendError::Bluetooth(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
}
