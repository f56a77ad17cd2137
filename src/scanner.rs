/*!
 # Device discovery

 Time-bounded scanning with per-scan deduplication. Every scan window starts
 with an empty result set; a device identifier is surfaced at most once per
 window no matter how many advertisements carry it.
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::transport::{Device, DeviceId, Transport};
use crate::{Error, Result};

/// Scan window used by the device list
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Longer window for hunting a single device
pub const EXTENDED_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Which discovered devices are surfaced
#[derive(Clone, Default)]
pub enum DeviceFilter {
    /// Every device
    #[default]
    All,
    /// Devices advertising a non-empty name
    Named,
    /// Caller supplied predicate
    Custom(Arc<dyn Fn(&Device) -> bool + Send + Sync>),
}

impl DeviceFilter {
    pub fn custom(predicate: impl Fn(&Device) -> bool + Send + Sync + 'static) -> Self {
        DeviceFilter::Custom(Arc::new(predicate))
    }

    pub fn matches(&self, device: &Device) -> bool {
        match self {
            DeviceFilter::All => true,
            DeviceFilter::Named => device.has_name(),
            DeviceFilter::Custom(predicate) => predicate(device),
        }
    }
}

impl fmt::Debug for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFilter::All => f.write_str("All"),
            DeviceFilter::Named => f.write_str("Named"),
            DeviceFilter::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// Why a scan window closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStopReason {
    /// The scan timer fired
    Timeout,
    /// `stop_scan` was called, or a new scan replaced this one
    Stopped,
    /// The transport ended discovery on its own
    StreamEnded,
    /// Discovery reported an error
    Failed,
}

/// Events delivered to the scan consumer
#[derive(Debug)]
pub enum ScanEvent {
    /// A device seen for the first time in this window
    Discovered(Device),
    /// Discovery failed, the scan is over
    Failed(Error),
    /// Final event of every window
    Stopped(ScanStopReason),
}

/// Drives discovery over a [`Transport`]
pub struct Scanner<T: Transport> {
    transport: Arc<T>,
    timeout: Duration,
    results: Arc<Mutex<HashMap<DeviceId, Device>>>,
    state: Arc<Mutex<ScanState>>,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl<T: Transport> Scanner<T> {
    pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            results: Arc::new(Mutex::new(HashMap::new())),
            state: Arc::new(Mutex::new(ScanState::Idle)),
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Devices surfaced in the current or most recent window
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.results.lock().values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Starts a scan window, restarting any active one. Devices matching
    /// `filter` are delivered on the returned channel; the channel closes
    /// after the final [`ScanEvent::Stopped`].
    #[instrument(skip(self))]
    pub async fn start_scan(
        &mut self,
        filter: DeviceFilter,
    ) -> Result<mpsc::UnboundedReceiver<ScanEvent>> {
        if self.scan_task_handle.is_some() {
            debug!("Scan already active, restarting");
            self.stop_scan().await?;
        }
        self.results.lock().clear();

        info!("Scanning for BLE devices ({:?} window)...", self.timeout);
        let stream = match self.transport.scan().await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                return Err(e);
            }
        };

        self.cancel_token = CancellationToken::new();
        *self.state.lock() = ScanState::Scanning;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = ScanTask {
            transport: self.transport.clone(),
            results: self.results.clone(),
            state: self.state.clone(),
            cancel_token: self.cancel_token.clone(),
            timeout: self.timeout,
            filter,
            tx,
        };
        self.scan_task_handle = Some(tokio::spawn(task.run(stream)));

        Ok(rx)
    }

    /// Stops the active scan. Does nothing when idle.
    #[instrument(skip(self))]
    pub async fn stop_scan(&mut self) -> Result<()> {
        let Some(handle) = self.scan_task_handle.take() else {
            trace!("No active scan to stop");
            return Ok(());
        };

        info!("Stopping Bluetooth scan");
        self.cancel_token.cancel();
        if let Err(e) = handle.await {
            error!("Scan task finished with an unexpected join error: {:?}", e);
        }
        *self.state.lock() = ScanState::Idle;
        Ok(())
    }
}

impl<T: Transport> Drop for Scanner<T> {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct ScanTask<T: Transport> {
    transport: Arc<T>,
    results: Arc<Mutex<HashMap<DeviceId, Device>>>,
    state: Arc<Mutex<ScanState>>,
    cancel_token: CancellationToken,
    timeout: Duration,
    filter: DeviceFilter,
    tx: mpsc::UnboundedSender<ScanEvent>,
}

impl<T: Transport> ScanTask<T> {
    async fn run(self, mut stream: BoxStream<'static, Result<Device>>) {
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let reason = loop {
            tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => break ScanStopReason::Stopped,
                _ = &mut deadline => {
                    info!("Scan window of {:?} elapsed", self.timeout);
                    break ScanStopReason::Timeout;
                }
                item = stream.next() => match item {
                    Some(Ok(device)) => self.offer(device),
                    Some(Err(e)) => {
                        error!("Scan error: {}", e);
                        let _ = self.tx.send(ScanEvent::Failed(e));
                        break ScanStopReason::Failed;
                    }
                    None => {
                        info!("Bluetooth scan stream has ended");
                        break ScanStopReason::StreamEnded;
                    }
                }
            }
        };

        drop(stream);
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop transport scan: {}", e);
        }
        *self.state.lock() = ScanState::Idle;

        let found = self.results.lock().len();
        info!("Scan finished ({:?}), {} device(s) found", reason, found);
        let _ = self.tx.send(ScanEvent::Stopped(reason));
    }

    fn offer(&self, device: Device) {
        trace!("Discovery event for {} ({:?})", device.id, device.name);
        if !self.filter.matches(&device) {
            return;
        }

        let previous = self.results.lock().insert(device.id.clone(), device.clone());
        if previous.is_some() {
            trace!("Refreshed snapshot of {}", device.id);
            return;
        }

        debug!("Found device: {} {}", device.id, device.display_name());
        let _ = self.tx.send(ScanEvent::Discovered(device));
    }
}
