//! vendlink daemon.
//!
//! Scans for a vending machine, connects to the strongest match and keeps the
//! session alive, reconnecting with a bounded number of retries. Lines read
//! from stdin are sent as messages; `/ping` and `/state` are local commands.
//! `--simulate` runs against an in-memory machine instead of BlueZ.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use rand::Rng;
use tokio::{
   io::{self, AsyncBufReadExt, BufReader},
   select, signal,
   sync::Notify,
   time,
};

use vendlink::{
   Config, ConnectionManager, DeviceHandle, Link, Radio, Result, Scanner, ScanEvent, SessionEvent,
   SessionId,
   bluetooth::{
      gatt::GattLink,
      mock::{MockLink, MockRadio},
      radio::{Advertisement, BluezRadio},
   },
   event::{EventBus, ScanEventBus},
   vending::device::DeviceInfoField,
};

/// Maximum delay between reconnect attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting vendlink...");

   let config = Config::load()?;
   info!(
      "Loaded configuration: packet size {}, keepalive {:?} x {}",
      config.packet_size,
      config.keepalive_interval(),
      config.keepalive_miss_threshold
   );

   if std::env::args().any(|arg| arg == "--simulate") {
      info!("Running against a simulated vending machine");
      let (radio, peer) = MockRadio::new();
      let id = "SIM:00:00:00:00:01";
      peer.script(
         Duration::from_millis(200),
         Advertisement {
            id: id.into(),
            name: Some("Simulated vending machine".into()),
            rssi: -42,
         },
      );
      peer.set_info(id, DeviceInfoField::Manufacturer, "vendlink");
      peer.set_info(id, DeviceInfoField::Model, "SIM-1");
      peer.set_info(id, DeviceInfoField::Serial, "SIM-0001");
      let (link, _machine) = MockLink::simulated(config.packet_size()?);
      return run(radio, link, &config).await;
   }

   let session = bluer::Session::new().await?;
   let radio = BluezRadio::new(&session, None).await?;
   let link = GattLink::new(&session, None, &config).await?;
   run(radio, link, &config).await
}

async fn run<R: Radio, L: Link>(radio: R, link: L, config: &Config) -> Result<()> {
   let scan_events = EventProcessor::<ScanEvent>::new();
   scan_events.clone().spawn_logger();
   let scanner = Scanner::new(radio, config, scan_events);

   let with_device_info = config.with_device_info || config.filter.needs_device_info();
   let candidates = scanner.scan(config.scan_timeout(), with_device_info).await?;
   for candidate in &candidates {
      info!("Candidate: {}", candidate.to_json());
   }
   let Some(device) = scanner.best_candidate() else {
      warn!("No vending machine found");
      return Ok(());
   };

   let events = EventProcessor::<(SessionId, SessionEvent)>::new();
   let manager = ConnectionManager::new(link, config, events.clone())?;
   manager.connect(device.clone()).await?;

   let mut lines = BufReader::new(io::stdin()).lines();
   let mut stdin_open = true;
   loop {
      select! {
         _ = signal::ctrl_c() => {
            info!("Shutting down vendlink...");
            break;
         }
         line = lines.next_line(), if stdin_open => match line {
            Ok(Some(line)) => handle_line(&manager, line.trim()).await,
            _ => stdin_open = false,
         },
         event = events.recv() => {
            let Some((id, event)) = event else {
               break;
            };
            if !handle_event(&manager, &device, config, id, event).await {
               break;
            }
         }
      }
   }

   manager.tear_down();
   scanner.tear_down();
   Ok(())
}

async fn handle_line(manager: &ConnectionManager, line: &str) {
   let result = match line {
      "" => return,
      "/ping" => manager.keep_alive().await,
      "/state" => {
         info!("State: {} ({:?})", manager.state().await, manager.session().await);
         return;
      },
      text => manager.send(text).await,
   };
   if let Err(e) = result {
      warn!("Command failed: {e}");
   }
}

/// Returns false once the daemon should stop.
async fn handle_event(
   manager: &ConnectionManager,
   device: &DeviceHandle,
   config: &Config,
   id: SessionId,
   event: SessionEvent,
) -> bool {
   let kind = match event {
      SessionEvent::Connected => {
         info!("{id}: connected to {device}");
         return true;
      },
      SessionEvent::Data(message) => {
         match message.as_str() {
            Some(text) => info!("{id}: received {text:?}"),
            None => info!("{id}: received {}", hex::encode(message.as_bytes())),
         }
         return true;
      },
      SessionEvent::ProtocolAnomaly { consecutive } => {
         warn!("{id}: protocol anomaly ({consecutive} in a row)");
         return true;
      },
      SessionEvent::Disconnected { reason: None } => {
         info!("{id}: disconnected");
         return false;
      },
      SessionEvent::Disconnected { reason: Some(kind) } | SessionEvent::ConnectFailed(kind) => kind,
   };

   let attempts = device.connection_attempts();
   if attempts >= config.max_retries.max(1) {
      error!("{id}: {kind}, giving up after {attempts} attempt(s)");
      return false;
   }

   let delay = calc_retry_delay(attempts);
   warn!("{id}: {kind}, reconnecting in {delay:?}");
   select! {
      _ = signal::ctrl_c() => return false,
      () = time::sleep(delay) => {},
   }
   if let Err(e) = manager.connect(device.clone()).await {
      error!("Reconnect failed: {e}");
      return false;
   }
   true
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_millis(500);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..500);
   delay + Duration::from_millis(jitter)
}

struct EventProcessor<T> {
   queue: SegQueue<T>,
   notifier: Notify,
}

impl<T: Send + 'static> EventProcessor<T> {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   fn push(&self, event: T) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }

   async fn recv(self: &Arc<Self>) -> Option<T> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }
}

impl EventProcessor<ScanEvent> {
   fn spawn_logger(self: Arc<Self>) {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            match event {
               ScanEvent::Ready => info!("Radio ready, scanning"),
               ScanEvent::PoweredOff => error!("Bluetooth radio is powered off"),
               ScanEvent::Failed(kind) => error!("Scan failed: {kind}"),
               ScanEvent::ScanDone(candidates) => {
                  info!("Scan finished with {} candidate(s)", candidates.len());
               },
            }
         }
      });
   }
}

impl EventBus for EventProcessor<(SessionId, SessionEvent)> {
   fn emit(&self, session: SessionId, event: SessionEvent) {
      self.push((session, event));
   }
}

impl ScanEventBus for EventProcessor<ScanEvent> {
   fn emit(&self, event: ScanEvent) {
      self.push(event);
   }
}
