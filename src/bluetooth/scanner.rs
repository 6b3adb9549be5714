//! Discovery of vending peripherals.
//!
//! A scan listens for advertisements of the vending service until its timeout
//! elapses, keeping one [`DeviceHandle`] per identifier. Device Information
//! enrichment is a separate step ([`enrich`]) run over the candidates when
//! requested; its metadata connections are opened and closed inside the scan
//! and never reach the connection manager.

use std::{pin::pin, sync::Arc, time::Duration};

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   select,
   task::{AbortHandle, JoinHandle},
   time,
};
use uuid::Uuid;

use crate::{
   bluetooth::radio::{Advertisement, InfoSession, Radio, RadioState},
   config::Config,
   error::{Result, VendError},
   event::{ScanEvent, ScanEventSender},
   vending::{
      device::{DeviceHandle, DeviceInfo, DeviceInfoField},
      recognition::{CandidateFilter, rank_candidates},
   },
};

#[derive(Debug, Default)]
struct GateState {
   live: Option<u64>,
   next: u64,
}

/// Routes scan events of the current scan only.
struct ScanGate {
   events: ScanEventSender,
   state: Mutex<GateState>,
}

impl ScanGate {
   fn open(&self) -> u64 {
      let mut state = self.state.lock();
      state.next += 1;
      state.live = Some(state.next);
      state.next
   }

   fn emit(&self, generation: u64, event: ScanEvent) -> bool {
      let state = self.state.lock();
      if state.live == Some(generation) {
         self.events.emit(event);
         true
      } else {
         debug!("scan {generation}: suppressed {event:?}");
         false
      }
   }

   /// Emits the terminal event of a scan and closes it.
   fn finish(&self, generation: u64, event: ScanEvent) -> bool {
      let mut state = self.state.lock();
      if state.live.take_if(|g| *g == generation).is_none() {
         return false;
      }
      self.events.emit(event);
      true
   }

   fn tear_down(&self) -> bool {
      self.state.lock().live.take().is_some()
   }
}

/// Discovery scanner over a [`Radio`].
pub struct Scanner<R: Radio> {
   radio: Arc<R>,
   service: Uuid,
   filter: CandidateFilter,
   gate: Arc<ScanGate>,
   task: Mutex<Option<AbortHandle>>,
   candidates: Arc<Mutex<Vec<DeviceHandle>>>,
}

impl<R: Radio> Scanner<R> {
   pub fn new(radio: R, config: &Config, events: ScanEventSender) -> Self {
      Self {
         radio: Arc::new(radio),
         service: config.service_uuid,
         filter: config.filter.clone(),
         gate: Arc::new(ScanGate {
            events,
            state: Mutex::new(GateState::default()),
         }),
         task: Mutex::new(None),
         candidates: Arc::new(Mutex::new(Vec::new())),
      }
   }

   pub fn radio(&self) -> &R {
      &self.radio
   }

   /// Starts a scan in the background. The outcome is reported through the
   /// scan events; a scan already running is torn down first.
   pub fn start_scan(&self, timeout: Duration, with_device_info: bool) {
      drop(self.spawn_scan(timeout, with_device_info));
   }

   /// Runs a scan to completion and returns its candidates.
   ///
   /// Fails with [`VendError::RadioUnavailable`] when the radio is off, and
   /// with [`VendError::TaskAborted`] when the scan is torn down. Any other
   /// radio error is returned as is and reported as [`ScanEvent::Failed`].
   pub async fn scan(&self, timeout: Duration, with_device_info: bool) -> Result<Vec<DeviceHandle>> {
      self.spawn_scan(timeout, with_device_info).await?
   }

   /// Cancels the running scan. No scan event is delivered after this
   /// returns. Idempotent.
   pub fn tear_down(&self) {
      let live = self.gate.tear_down();
      if let Some(task) = self.task.lock().take() {
         task.abort();
      }
      if live {
         info!("Scan torn down");
      }
   }

   /// Candidates of the last completed scan.
   pub fn candidates(&self) -> Vec<DeviceHandle> {
      self.candidates.lock().clone()
   }

   /// Strongest candidate of the last completed scan that passes the filter.
   pub fn best_candidate(&self) -> Option<DeviceHandle> {
      rank_candidates(&self.candidates.lock(), &self.filter)
         .into_iter()
         .next()
   }

   fn spawn_scan(
      &self,
      timeout: Duration,
      with_device_info: bool,
   ) -> JoinHandle<Result<Vec<DeviceHandle>>> {
      self.tear_down();
      if self.filter.needs_device_info() && !with_device_info {
         warn!("Candidate filter uses device info but the scan does not read it");
      }

      let generation = self.gate.open();
      let handle = tokio::spawn(run_scan(
         self.radio.clone(),
         self.service,
         timeout,
         with_device_info,
         self.gate.clone(),
         generation,
         self.candidates.clone(),
      ));
      *self.task.lock() = Some(handle.abort_handle());
      handle
   }
}

impl<R: Radio> Drop for Scanner<R> {
   fn drop(&mut self) {
      self.tear_down();
   }
}

async fn run_scan<R: Radio>(
   radio: Arc<R>,
   service: Uuid,
   timeout: Duration,
   with_device_info: bool,
   gate: Arc<ScanGate>,
   generation: u64,
   last: Arc<Mutex<Vec<DeviceHandle>>>,
) -> Result<Vec<DeviceHandle>> {
   let result = collect_candidates(radio.as_ref(), service, timeout, with_device_info, || {
      gate.emit(generation, ScanEvent::Ready);
   })
   .await;

   match &result {
      Ok(found) => {
         info!("Scan done, {} candidate(s)", found.len());
         if gate.finish(generation, ScanEvent::ScanDone(found.clone())) {
            *last.lock() = found.clone();
         }
      },
      Err(VendError::RadioUnavailable) => {
         warn!("Radio unavailable, scan aborted");
         gate.finish(generation, ScanEvent::PoweredOff);
      },
      Err(e) => {
         warn!("Scan failed: {e}");
         gate.finish(generation, ScanEvent::Failed(e.kind()));
      },
   }
   result
}

async fn collect_candidates<R: Radio>(
   radio: &R,
   service: Uuid,
   timeout: Duration,
   with_device_info: bool,
   on_ready: impl FnOnce(),
) -> Result<Vec<DeviceHandle>> {
   if radio.state().await? == RadioState::PoweredOff {
      return Err(VendError::RadioUnavailable);
   }
   let mut adverts = radio.discover(service).await?;
   on_ready();
   info!("Scanning for {timeout:?}");

   let mut found = Vec::new();
   let mut deadline = pin!(time::sleep(timeout));
   loop {
      select! {
         () = &mut deadline => break,
         advert = adverts.recv() => match advert {
            Some(advert) => merge(&mut found, advert),
            None => {
               if radio.state().await? == RadioState::PoweredOff {
                  return Err(VendError::RadioUnavailable);
               }
               debug!("Discovery ended early, waiting out the scan");
               deadline.as_mut().await;
               break;
            },
         },
      }
   }
   drop(adverts);

   if with_device_info {
      for device in &mut found {
         enrich(radio, device).await;
      }
   }
   Ok(found)
}

fn merge(found: &mut Vec<DeviceHandle>, advert: Advertisement) {
   match found.iter_mut().find(|d| *d.id() == advert.id) {
      Some(device) => device.observe(advert.name, advert.rssi),
      None => {
         let name = advert.name.unwrap_or_else(|| advert.id.clone());
         let device = DeviceHandle::new(advert.id, name, advert.rssi);
         debug!("Discovered {device}");
         found.push(device);
      },
   }
}

/// Reads the Device Information characteristics of `device` over a scoped
/// metadata connection. Fields that cannot be read stay unset; a device that
/// cannot be reached keeps no info at all. The connection is released even if
/// this future is dropped mid-read.
pub async fn enrich<R: Radio>(radio: &R, device: &mut DeviceHandle) {
   let mut session = match radio.open_info(device.id()).await {
      Ok(session) => session,
      Err(e) => {
         warn!("{device}: metadata connection failed: {e}");
         return;
      },
   };

   let mut info = DeviceInfo::default();
   for field in DeviceInfoField::ALL {
      match session.read(field).await {
         Ok(value) => info.set(field, value),
         Err(e) => debug!("{device}: {field} unavailable: {e}"),
      }
   }
   session.close().await;
   device.set_info(info);
}

#[cfg(test)]
mod tests {
   use super::*;
   use smol_str::SmolStr;

   fn advert(id: &str, name: Option<&str>, rssi: i16) -> Advertisement {
      Advertisement {
         id: SmolStr::new(id),
         name: name.map(SmolStr::new),
         rssi,
      }
   }

   #[test]
   fn test_merge_updates_in_place() {
      let mut found = Vec::new();
      merge(&mut found, advert("AA:01", Some("VM-1"), -80));
      merge(&mut found, advert("AA:02", None, -60));
      merge(&mut found, advert("AA:01", None, -55));

      assert_eq!(found.len(), 2);
      assert_eq!(found[0].rssi(), -55);
      assert_eq!(found[0].name(), "VM-1");
      assert_eq!(found[1].name(), "AA:02");
   }
}
