//! The scanner façade: discovery lifecycle, deduplicating device registry,
//! and detection-callback fan-out.
//!
//! The backend decodes OS events into [`RawAdvertisement`]s and pushes them
//! into a channel; a dispatcher task owned by the scanner drains it, applies
//! the service-UUID filter (the OS-level filter leaks events when other
//! applications scan concurrently, so everything is re-checked here),
//! updates the seen-devices registry, and fans the observation out to every
//! registered callback and stream subscriber.

use crate::api::{
    AdvertisementData, AsyncDetectionCallback, BleDevice, DetectionCallback, ScanMode,
    ScannerOptions,
};
use crate::backend::{RawAdvertisement, ScannerBackend, ScannerEventReceiver, ScannerEventSender};
use crate::{Error, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use log::trace;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

pub(crate) type ScannerBackendFactory = Box<
    dyn Fn(ScannerOptions, ScannerEventSender) -> BoxFuture<'static, Result<Box<dyn ScannerBackend>>>
        + Send
        + Sync,
>;

/// Handle returned by callback registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackToken(u64);

enum RegisteredCallback {
    Sync(DetectionCallback),
    Async(AsyncDetectionCallback),
}

struct Shared {
    filter: Vec<uuid::Uuid>,
    seen_devices: DashMap<String, (BleDevice, AdvertisementData)>,
    callbacks: Mutex<BTreeMap<u64, Arc<RegisteredCallback>>>,
    next_token: AtomicU64,
    events_channel: broadcast::Sender<(BleDevice, AdvertisementData)>,
}

struct RunningScan {
    backend: Box<dyn ScannerBackend>,
    dispatcher: JoinHandle<()>,
}

/// Discovers nearby BLE peripherals.
///
/// A scanner is cheap to construct; OS resources are acquired by
/// [`start`](Scanner::start) and released by [`stop`](Scanner::stop). The
/// registry of devices seen since the last `start` is available from
/// [`seen_devices`](Scanner::seen_devices), and live observations from
/// detection callbacks or the [`advertisement_data`](Scanner::advertisement_data)
/// stream.
pub struct Scanner {
    options: ScannerOptions,
    factory: ScannerBackendFactory,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<RunningScan>>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("options", &self.options)
            .finish()
    }
}

impl Scanner {
    /// Creates a scanner for the current platform.
    ///
    /// Fails with [`Error::NoPassiveScan`] when passive mode is requested
    /// without any or-patterns; a platform with no passive support at all
    /// (macOS) rejects passive mode when scanning starts.
    pub fn new(options: ScannerOptions) -> Result<Self> {
        Self::with_factory(options, Box::new(crate::platform::scanner_backend))
    }

    pub(crate) fn with_factory(options: ScannerOptions, factory: ScannerBackendFactory) -> Result<Self> {
        // BlueZ matches passive scans against or-patterns in the controller;
        // WinRT listens unconditionally and needs none.
        #[cfg(not(target_os = "windows"))]
        if options.mode == ScanMode::Passive && options.or_patterns.is_empty() {
            return Err(Error::NoPassiveScan(
                "passive scanning requires at least one or-pattern".into(),
            ));
        }
        let (events_channel, _) = broadcast::channel(64);
        Ok(Scanner {
            shared: Arc::new(Shared {
                filter: options.service_uuids.clone(),
                seen_devices: DashMap::new(),
                callbacks: Mutex::new(BTreeMap::new()),
                next_token: AtomicU64::new(0),
                events_channel,
            }),
            options,
            factory,
            running: tokio::sync::Mutex::new(None),
        })
    }

    /// Begins discovery. Fails with [`Error::InvalidState`] if this scanner
    /// is already started.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::InvalidState("scanner already started".into()));
        }

        self.shared.seen_devices.clear();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let backend = (self.factory)(self.options.clone(), tx).await?;

        let shared = self.shared.clone();
        let dispatcher = tokio::spawn(dispatch(shared, rx));

        if let Err(err) = backend.start().await {
            dispatcher.abort();
            return Err(err);
        }
        *running = Some(RunningScan {
            backend,
            dispatcher,
        });
        Ok(())
    }

    /// Ends discovery. A no-op when the scanner is not started.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(run) = running.take() {
            run.backend.stop().await?;
            drop(run.backend);
            run.dispatcher.abort();
        }
        Ok(())
    }

    /// Registers a detection callback, called on the scanner's dispatcher
    /// for every reported observation, in registration order. The callback
    /// must not block.
    pub fn register_detection_callback(&self, callback: DetectionCallback) -> CallbackToken {
        self.insert_callback(RegisteredCallback::Sync(callback))
    }

    /// Registers an async detection callback. The scanner spawns the
    /// returned future and lets it run to completion.
    pub fn register_async_detection_callback(
        &self,
        callback: AsyncDetectionCallback,
    ) -> CallbackToken {
        self.insert_callback(RegisteredCallback::Async(callback))
    }

    fn insert_callback(&self, callback: RegisteredCallback) -> CallbackToken {
        let token = self.shared.next_token.fetch_add(1, Ordering::Relaxed);
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .insert(token, Arc::new(callback));
        CallbackToken(token)
    }

    /// Removes a previously registered callback. Returns whether the token
    /// was still registered.
    pub fn unregister_detection_callback(&self, token: CallbackToken) -> bool {
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .remove(&token.0)
            .is_some()
    }

    /// A stream of `(device, advertisement)` observations made after this
    /// call. Dropping the stream unsubscribes it; the stream can be
    /// recreated at any time.
    pub fn advertisement_data(
        &self,
    ) -> Pin<Box<dyn Stream<Item = (BleDevice, AdvertisementData)> + Send>> {
        let receiver = self.shared.events_channel.subscribe();
        Box::pin(BroadcastStream::new(receiver).filter_map(|item| async move { item.ok() }))
    }

    /// Snapshot of every device observed since the last `start`, with its
    /// most recent advertisement.
    pub fn seen_devices(&self) -> Vec<(BleDevice, AdvertisementData)> {
        self.shared
            .seen_devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Scans for `timeout` with default options and returns the snapshot of
    /// devices seen.
    pub async fn discover(timeout: Duration) -> Result<Vec<(BleDevice, AdvertisementData)>> {
        Self::discover_with_options(ScannerOptions::default(), timeout).await
    }

    /// Scans for `timeout` and returns the snapshot of devices seen.
    pub async fn discover_with_options(
        options: ScannerOptions,
        timeout: Duration,
    ) -> Result<Vec<(BleDevice, AdvertisementData)>> {
        let scanner = Scanner::new(options)?;
        scanner.start().await?;
        tokio::time::sleep(timeout).await;
        scanner.stop().await?;
        Ok(scanner.seen_devices())
    }

    /// Scans until an observation satisfies `predicate`, returning the
    /// matching device, or `None` once `timeout` elapses.
    pub async fn find_device_by_filter(
        predicate: impl Fn(&BleDevice, &AdvertisementData) -> bool + Send,
        timeout: Duration,
    ) -> Result<Option<BleDevice>> {
        Self::find_device_by_filter_with_options(ScannerOptions::default(), predicate, timeout)
            .await
    }

    pub async fn find_device_by_filter_with_options(
        options: ScannerOptions,
        predicate: impl Fn(&BleDevice, &AdvertisementData) -> bool + Send,
        timeout: Duration,
    ) -> Result<Option<BleDevice>> {
        let scanner = Scanner::new(options)?;
        scanner.find_with(predicate, timeout).await
    }

    /// Convenience form of [`find_device_by_filter`](Scanner::find_device_by_filter)
    /// matching on the OS address string.
    pub async fn find_device_by_address(
        address: &str,
        timeout: Duration,
    ) -> Result<Option<BleDevice>> {
        let wanted = address.to_ascii_lowercase();
        Self::find_device_by_filter(
            move |device, _| device.address.to_ascii_lowercase() == wanted,
            timeout,
        )
        .await
    }

    pub(crate) async fn find_with(
        &self,
        predicate: impl Fn(&BleDevice, &AdvertisementData) -> bool + Send,
        timeout: Duration,
    ) -> Result<Option<BleDevice>> {
        // Subscribe before starting so the first observation cannot be lost.
        let mut stream = self.advertisement_data();
        self.start().await?;
        let found = tokio::time::timeout(timeout, async {
            while let Some((device, data)) = stream.next().await {
                if predicate(&device, &data) {
                    return Some(device);
                }
            }
            None
        })
        .await
        .unwrap_or(None);
        self.stop().await?;
        Ok(found)
    }
}

async fn dispatch(shared: Arc<Shared>, mut events: ScannerEventReceiver) {
    while let Some(RawAdvertisement { device, data }) = events.recv().await {
        if !data.matches_service_filter(&shared.filter) {
            trace!(
                "dropping advertisement from {} not matching service filter",
                device.address
            );
            continue;
        }

        // Newest full advertisement wins; only the device name is carried
        // forward when the OS re-resolves it.
        let device = match shared.seen_devices.entry(device.details.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let (known, advertisement) = entry.get_mut();
                if device.name.is_some() {
                    known.name = device.name.clone();
                }
                *advertisement = data.clone();
                known.clone()
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert((device.clone(), data.clone()));
                device
            }
        };

        let callbacks: Vec<Arc<RegisteredCallback>> =
            shared.callbacks.lock().unwrap().values().cloned().collect();
        for callback in callbacks {
            match &*callback {
                RegisteredCallback::Sync(f) => f(&device, &data),
                RegisteredCallback::Async(f) => {
                    tokio::spawn(f(device.clone(), data.clone()));
                }
            }
        }

        if let Err(unobserved) = shared.events_channel.send((device, data)) {
            trace!("no advertisement stream subscribers: {:?}", unobserved.0 .0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bleuuid::uuid_from_u16;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct MockScannerBackend {
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ScannerBackend for MockScannerBackend {
        async fn start(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        scanner: Scanner,
        sender: Arc<Mutex<Option<ScannerEventSender>>>,
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    fn harness(options: ScannerOptions) -> Harness {
        let sender = Arc::new(Mutex::new(None));
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let factory_sender = sender.clone();
        let factory_started = started.clone();
        let factory_stopped = stopped.clone();
        let scanner = Scanner::with_factory(
            options,
            Box::new(move |_, tx| {
                *factory_sender.lock().unwrap() = Some(tx);
                let backend: Box<dyn ScannerBackend> = Box::new(MockScannerBackend {
                    started: factory_started.clone(),
                    stopped: factory_stopped.clone(),
                });
                Box::pin(async move { Ok(backend) })
            }),
        )
        .unwrap();
        Harness {
            scanner,
            sender,
            started,
            stopped,
        }
    }

    fn advertisement(key: &str, name: Option<&str>, uuids: &[uuid::Uuid]) -> RawAdvertisement {
        RawAdvertisement {
            device: BleDevice {
                address: key.to_uppercase(),
                name: name.map(str::to_owned),
                details: key.to_owned(),
            },
            data: AdvertisementData {
                local_name: name.map(str::to_owned),
                service_uuids: uuids.to_vec(),
                rssi: Some(-50),
                ..Default::default()
            },
        }
    }

    impl Harness {
        fn emit(&self, raw: RawAdvertisement) {
            self.sender
                .lock()
                .unwrap()
                .as_ref()
                .expect("scanner not started")
                .send(raw)
                .unwrap();
        }

        async fn settle(&self) {
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn double_start_is_invalid_state() {
        let h = harness(ScannerOptions::default());
        h.scanner.start().await.unwrap();
        assert!(matches!(
            h.scanner.start().await,
            Err(Error::InvalidState(_))
        ));
        h.scanner.stop().await.unwrap();
        assert_eq!(h.started.load(Ordering::SeqCst), 1);
        assert_eq!(h.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let h = harness(ScannerOptions::default());
        h.scanner.stop().await.unwrap();
        assert_eq!(h.stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn passive_without_patterns_fails_construction() {
        let options = ScannerOptions {
            mode: ScanMode::Passive,
            ..Default::default()
        };
        assert!(matches!(
            Scanner::new(options),
            Err(Error::NoPassiveScan(_))
        ));
    }

    #[tokio::test]
    async fn seen_devices_cleared_on_start_and_newest_wins() {
        let h = harness(ScannerOptions::default());
        h.scanner.start().await.unwrap();
        assert!(h.scanner.seen_devices().is_empty());

        h.emit(advertisement("aa:aa", None, &[]));
        h.emit(advertisement("aa:aa", Some("gadget"), &[uuid_from_u16(0x180f)]));
        h.settle().await;

        let seen = h.scanner.seen_devices();
        assert_eq!(seen.len(), 1);
        let (device, data) = &seen[0];
        assert_eq!(device.name.as_deref(), Some("gadget"));
        assert_eq!(data.service_uuids, vec![uuid_from_u16(0x180f)]);

        h.scanner.stop().await.unwrap();
        h.scanner.start().await.unwrap();
        assert!(h.scanner.seen_devices().is_empty());
        h.scanner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn service_filter_is_reapplied_in_core() {
        let filter_uuid = uuid_from_u16(0x180d);
        let h = harness(ScannerOptions {
            service_uuids: vec![filter_uuid],
            ..Default::default()
        });
        h.scanner.start().await.unwrap();

        // leaked by the OS filter: no service UUIDs at all
        h.emit(advertisement("aa:01", Some("no-uuids"), &[]));
        // wrong service
        h.emit(advertisement("aa:02", Some("wrong"), &[uuid_from_u16(0x1801)]));
        // matching
        h.emit(advertisement("aa:03", Some("right"), &[filter_uuid]));
        h.settle().await;

        let seen = h.scanner.seen_devices();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.name.as_deref(), Some("right"));
        h.scanner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn callbacks_run_in_registration_order_until_unregistered() {
        let h = harness(ScannerOptions::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = {
            let order = order.clone();
            h.scanner
                .register_detection_callback(Box::new(move |_, _| {
                    order.lock().unwrap().push("first");
                }))
        };
        let order_clone = order.clone();
        h.scanner
            .register_detection_callback(Box::new(move |_, _| {
                order_clone.lock().unwrap().push("second");
            }));

        h.scanner.start().await.unwrap();
        h.emit(advertisement("aa:aa", None, &[]));
        h.settle().await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

        assert!(h.scanner.unregister_detection_callback(first));
        assert!(!h.scanner.unregister_detection_callback(first));
        h.emit(advertisement("aa:aa", None, &[]));
        h.settle().await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first", "second", "second"]
        );
        h.scanner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn advertisement_stream_sees_observations() {
        let h = harness(ScannerOptions::default());
        let mut stream = h.scanner.advertisement_data();
        h.scanner.start().await.unwrap();
        h.emit(advertisement("aa:aa", Some("streamed"), &[]));
        let (device, data) = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(device.name.as_deref(), Some("streamed"));
        assert_eq!(data.rssi, Some(-50));
        h.scanner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn find_with_matches_and_times_out() {
        let h = harness(ScannerOptions::default());
        let emit = h.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            loop {
                let maybe = emit.lock().unwrap().clone();
                if let Some(tx) = maybe {
                    let _ = tx.send(advertisement("aa:aa", Some("target"), &[]));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        let found = h
            .scanner
            .find_with(
                |device, _| device.name.as_deref() == Some("target"),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(found.unwrap().name.as_deref(), Some("target"));

        let missing = h
            .scanner
            .find_with(|_, _| false, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
