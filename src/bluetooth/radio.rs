//! Advertisement and metadata access for discovery.
//!
//! The scanner only needs three things from the radio: whether it is
//! powered, a stream of advertisements for one service, and a short scoped
//! connection for reading Device Information characteristics.

use std::{collections::HashSet, future::Future, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, Session,
   gatt::remote::Characteristic,
};
use futures::StreamExt;
use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{select, sync::mpsc, task::JoinSet, time};
use uuid::Uuid;

use crate::{
   bluetooth::gatt::{resolved_services, service_characteristics},
   error::{Result, VendError},
   vending::{device::DeviceInfoField, protocol::DEVICE_INFO_SERVICE_UUID},
};

/// Timeout for the metadata connection
const INFO_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for a single characteristic read
const INFO_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// One observed advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
   pub id: SmolStr,
   pub name: Option<SmolStr>,
   pub rssi: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RadioState {
   PoweredOn,
   PoweredOff,
}

/// A scoped connection used only to read Device Information.
pub trait InfoSession: Send {
   fn read(&mut self, field: DeviceInfoField) -> impl Future<Output = Result<String>> + Send;

   fn close(self) -> impl Future<Output = ()> + Send;
}

/// Radio capability consumed by the scanner.
pub trait Radio: Send + Sync + 'static {
   type Info: InfoSession;

   fn state(&self) -> impl Future<Output = Result<RadioState>> + Send;

   /// Starts discovery for `service`. Discovery stops when the receiver is
   /// dropped.
   fn discover(
      &self,
      service: Uuid,
   ) -> impl Future<Output = Result<mpsc::Receiver<Advertisement>>> + Send;

   fn open_info(&self, id: &SmolStr) -> impl Future<Output = Result<Self::Info>> + Send;
}

/// [`Radio`] backed by a BlueZ adapter.
#[derive(Clone)]
pub struct BluezRadio {
   adapter: Adapter,
}

impl BluezRadio {
   pub async fn new(session: &Session, adapter: Option<&str>) -> Result<Self> {
      let adapter = match adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using adapter {}", adapter.name());
      Ok(Self { adapter })
   }

   fn device(&self, id: &SmolStr) -> Result<Device> {
      let address: Address = id
         .parse()
         .map_err(|_| VendError::InvalidDeviceId(id.to_string()))?;
      Ok(self.adapter.device(address)?)
   }
}

async fn advertisement(device: &Device) -> Advertisement {
   Advertisement {
      id: device.address().to_string().into(),
      name: device.name().await.ok().flatten().map(SmolStr::from),
      rssi: device.rssi().await.ok().flatten().unwrap_or(i16::MIN),
   }
}

impl Radio for BluezRadio {
   type Info = BluezInfoSession;

   async fn state(&self) -> Result<RadioState> {
      Ok(if self.adapter.is_powered().await? {
         RadioState::PoweredOn
      } else {
         RadioState::PoweredOff
      })
   }

   async fn discover(&self, service: Uuid) -> Result<mpsc::Receiver<Advertisement>> {
      self
         .adapter
         .set_discovery_filter(DiscoveryFilter {
            uuids: HashSet::from([service]),
            transport: DiscoveryTransport::Le,
            ..Default::default()
         })
         .await?;
      let mut events = Box::pin(self.adapter.discover_devices().await?);
      let adapter = self.adapter.clone();
      let (tx, rx) = mpsc::channel(64);

      tokio::spawn(async move {
         let mut watchers = JoinSet::new();
         loop {
            select! {
               () = tx.closed() => break,
               event = events.next() => {
                  let Some(event) = event else { break };
                  match event {
                     AdapterEvent::DeviceAdded(addr) => {
                        let Ok(device) = adapter.device(addr) else { continue };
                        if tx.send(advertisement(&device).await).await.is_err() {
                           break;
                        }
                        watchers.spawn(watch_rssi(device, tx.clone()));
                     },
                     AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) => {
                        warn!("Adapter powered off during discovery");
                        break;
                     },
                     _ => {},
                  }
               }
            }
         }
         watchers.abort_all();
         debug!("Discovery stopped");
      });
      Ok(rx)
   }

   async fn open_info(&self, id: &SmolStr) -> Result<BluezInfoSession> {
      let device = self.device(id)?;
      let open = async {
         device.connect().await?;
         let services = resolved_services(&device).await?;
         service_characteristics(services, DEVICE_INFO_SERVICE_UUID).await
      };
      let chars = match time::timeout(INFO_CONNECT_TIMEOUT, open).await {
         Ok(Ok(chars)) => chars.unwrap_or_default(),
         Ok(Err(e)) => {
            let _ = device.disconnect().await;
            return Err(e);
         },
         Err(_) => {
            let _ = device.disconnect().await;
            return Err(VendError::LinkTimeout);
         },
      };
      Ok(BluezInfoSession {
         device: Some(device),
         chars,
      })
   }
}

async fn watch_rssi(device: Device, tx: mpsc::Sender<Advertisement>) {
   let Ok(events) = device.events().await else {
      return;
   };
   let mut events = std::pin::pin!(events);
   while let Some(event) = events.next().await {
      if let DeviceEvent::PropertyChanged(DeviceProperty::Rssi(_)) = event
         && tx.send(advertisement(&device).await).await.is_err()
      {
         return;
      }
   }
}

/// Device Information connection over BlueZ.
///
/// Dropped without [`InfoSession::close`], the disconnect runs in the
/// background.
pub struct BluezInfoSession {
   device: Option<Device>,
   chars: Vec<Characteristic>,
}

async fn release_info(device: Device) {
   if let Err(e) = device.disconnect().await {
      debug!("Metadata disconnect from {} failed: {e}", device.address());
   }
}

impl Drop for BluezInfoSession {
   fn drop(&mut self) {
      let Some(device) = self.device.take() else {
         return;
      };
      match tokio::runtime::Handle::try_current() {
         Ok(runtime) => {
            runtime.spawn(release_info(device));
         },
         Err(_) => warn!("Metadata connection to {} left open", device.address()),
      }
   }
}

impl InfoSession for BluezInfoSession {
   async fn read(&mut self, field: DeviceInfoField) -> Result<String> {
      let uuid = field.uuid();
      for c in &self.chars {
         if c.uuid().await? == uuid {
            let value = time::timeout(INFO_READ_TIMEOUT, c.read())
               .await
               .map_err(|_| VendError::LinkTimeout)??;
            return Ok(String::from_utf8_lossy(&value)
               .trim_end_matches('\0')
               .trim()
               .to_string());
         }
      }
      Err(VendError::CharacteristicNotFound(uuid))
   }

   async fn close(mut self) {
      if let Some(device) = self.device.take() {
         release_info(device).await;
      }
   }
}
