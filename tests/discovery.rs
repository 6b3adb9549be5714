use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, time};
use vendlink::{
   Config, ErrorKind, ScanEvent, Scanner, VendError,
   bluetooth::{
      mock::{MockRadio, MockRadioHandle},
      radio::Advertisement,
   },
   event::ChannelBus,
   vending::{device::DeviceInfoField, recognition::CandidateFilter},
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn advert(id: &str, name: &str, rssi: i16) -> Advertisement {
   Advertisement {
      id: id.into(),
      name: Some(name.into()),
      rssi,
   }
}

fn scanner_with(
   config: &Config,
) -> (
   Scanner<MockRadio>,
   MockRadioHandle,
   mpsc::UnboundedReceiver<ScanEvent>,
) {
   let (radio, handle) = MockRadio::new();
   let (bus, rx) = ChannelBus::<ScanEvent>::new();
   (Scanner::new(radio, config, bus), handle, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ScanEvent>) -> Vec<ScanEvent> {
   let mut out = Vec::new();
   while let Ok(event) = rx.try_recv() {
      out.push(event);
   }
   out
}

#[tokio::test(start_paused = true)]
async fn test_repeated_advertisement_updates_candidate() {
   let (scanner, radio, mut rx) = scanner_with(&Config::default());
   radio.script(Duration::from_millis(100), advert("AA:01", "VM-1", -80));
   radio.script(Duration::from_millis(900), advert("AA:01", "VM-1", -61));

   let start = time::Instant::now();
   let candidates = scanner.scan(TIMEOUT, false).await.unwrap();
   assert!(start.elapsed() >= TIMEOUT);

   assert_eq!(candidates.len(), 1);
   assert_eq!(candidates[0].rssi(), -61);
   assert!(candidates[0].info().is_none());

   let events = drain(&mut rx);
   assert!(matches!(events[0], ScanEvent::Ready));
   assert!(matches!(&events[1], ScanEvent::ScanDone(found) if found.len() == 1));
   assert_eq!(events.len(), 2);
   assert!(!radio.is_discovering());
}

#[tokio::test(start_paused = true)]
async fn test_powered_off_is_distinct_from_empty_scan() {
   let (scanner, radio, mut rx) = scanner_with(&Config::default());

   let candidates = scanner.scan(TIMEOUT, false).await.unwrap();
   assert!(candidates.is_empty());
   assert!(matches!(drain(&mut rx).last(), Some(ScanEvent::ScanDone(found)) if found.is_empty()));

   radio.set_powered(false);
   assert!(matches!(
      scanner.scan(TIMEOUT, false).await,
      Err(VendError::RadioUnavailable)
   ));
   let events = drain(&mut rx);
   assert_eq!(events.len(), 1);
   assert!(matches!(events[0], ScanEvent::PoweredOff));
}

#[tokio::test(start_paused = true)]
async fn test_device_info_enrichment_tolerates_failures() {
   let (scanner, radio, _rx) = scanner_with(&Config::default());
   radio.script(Duration::from_millis(10), advert("AA:01", "VM-1", -70));
   radio.script(Duration::from_millis(20), advert("AA:02", "VM-2", -60));
   radio.set_info("AA:01", DeviceInfoField::Manufacturer, "Acme");
   radio.set_info("AA:01", DeviceInfoField::Model, "VX-200");
   radio.set_unreachable("AA:02");

   let candidates = scanner.scan(TIMEOUT, true).await.unwrap();
   assert_eq!(candidates.len(), 2);

   let info = candidates[0].info().unwrap();
   assert_eq!(info.manufacturer.as_deref(), Some("Acme"));
   assert_eq!(info.model.as_deref(), Some("VX-200"));
   assert_eq!(info.serial, None);

   assert!(candidates[1].info().is_none());
   assert_eq!(radio.info_opens(), 1);
   assert_eq!(radio.info_closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_best_candidate_applies_filter() {
   let config = Config {
      filter: CandidateFilter {
         model: Some("vx-200".into()),
         ..Default::default()
      },
      ..Default::default()
   };
   let (scanner, radio, _rx) = scanner_with(&config);
   radio.script(Duration::from_millis(10), advert("AA:01", "VM-1", -80));
   radio.script(Duration::from_millis(10), advert("AA:02", "VM-2", -40));
   radio.set_info("AA:01", DeviceInfoField::Model, "VX-200");
   radio.set_info("AA:02", DeviceInfoField::Model, "VX-100");

   assert!(scanner.best_candidate().is_none());
   scanner.scan(TIMEOUT, true).await.unwrap();
   assert_eq!(scanner.best_candidate().unwrap().id(), "AA:01");
}

#[tokio::test(start_paused = true)]
async fn test_tear_down_suppresses_events() {
   let (scanner, radio, mut rx) = scanner_with(&Config::default());
   radio.script(Duration::from_millis(100), advert("AA:01", "VM-1", -50));

   scanner.start_scan(TIMEOUT, false);
   time::sleep(Duration::from_secs(1)).await;
   assert!(radio.is_discovering());

   scanner.tear_down();
   scanner.tear_down();
   time::sleep(Duration::from_millis(1)).await;
   assert!(!radio.is_discovering());

   time::sleep(TIMEOUT * 2).await;
   let events = drain(&mut rx);
   assert_eq!(events.len(), 1);
   assert!(matches!(events[0], ScanEvent::Ready));
   assert!(scanner.candidates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_scan_fails_when_torn_down() {
   let (scanner, _radio, mut rx) = scanner_with(&Config::default());
   let scanner = Arc::new(scanner);

   let running = tokio::spawn({
      let scanner = scanner.clone();
      async move { scanner.scan(TIMEOUT, false).await }
   });
   time::sleep(Duration::from_secs(1)).await;
   scanner.tear_down();

   assert!(matches!(
      running.await.unwrap(),
      Err(VendError::TaskAborted(_))
   ));
   time::sleep(TIMEOUT).await;
   assert!(drain(&mut rx).iter().all(|e| matches!(e, ScanEvent::Ready)));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_error_reports_failure() {
   let (scanner, radio, mut rx) = scanner_with(&Config::default());
   radio.set_discovery_error(Some("adapter vanished"));

   assert!(matches!(
      scanner.scan(TIMEOUT, false).await,
      Err(VendError::LinkDropped(_))
   ));
   let events = drain(&mut rx);
   assert_eq!(events.len(), 1);
   assert!(matches!(events[0], ScanEvent::Failed(ErrorKind::LinkDropped)));

   // The failed scan is closed; a later one runs normally.
   scanner.tear_down();
   radio.set_discovery_error(None);
   radio.script(Duration::from_millis(10), advert("AA:01", "VM-1", -50));
   assert_eq!(scanner.scan(TIMEOUT, false).await.unwrap().len(), 1);
   assert!(matches!(drain(&mut rx).last(), Some(ScanEvent::ScanDone(_))));
}

#[tokio::test(start_paused = true)]
async fn test_tear_down_mid_enrichment_closes_metadata_connection() {
   let (scanner, radio, mut rx) = scanner_with(&Config::default());
   radio.script(Duration::from_millis(10), advert("AA:01", "VM-1", -50));
   radio.set_info("AA:01", DeviceInfoField::Model, "VX-200");
   radio.set_read_delay(Duration::from_secs(1));

   scanner.start_scan(Duration::from_millis(100), true);
   time::sleep(Duration::from_millis(500)).await;
   assert_eq!(radio.info_opens(), 1);
   assert_eq!(radio.info_closes(), 0);

   scanner.tear_down();
   time::sleep(Duration::from_millis(1)).await;
   assert_eq!(radio.info_closes(), 1);

   time::sleep(TIMEOUT).await;
   assert!(drain(&mut rx).iter().all(|e| matches!(e, ScanEvent::Ready)));
   assert!(scanner.candidates().is_empty());
}
