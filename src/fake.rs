//! In-memory transport for exercising the controller without a radio.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::codec::bytes_to_text;
use crate::transport::{
    Device, DeviceId, DisconnectListener, DisconnectRegistry, Subscription, Transport,
};
use crate::{Error, Result};

/// One scripted discovery step
#[derive(Debug, Clone)]
pub(crate) enum ScanStep {
    Found(Duration, Device),
    Fail(Duration, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedWrite {
    pub device: DeviceId,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub payload: String,
}

#[derive(Default)]
struct FakeState {
    script: Vec<ScanStep>,
    end_stream_after_script: bool,
    scan_starts: usize,
    scan_stops: usize,
    known: HashSet<DeviceId>,
    connected: HashSet<DeviceId>,
    connect_delay: Duration,
    disconnect_delay: Duration,
    connect_error: Option<String>,
    discover_error: Option<String>,
    disconnects: usize,
    payloads: HashMap<(Uuid, Uuid), String>,
    read_error: Option<String>,
    write_error: Option<String>,
    write_delays: VecDeque<Duration>,
    writes: Vec<RecordedWrite>,
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    state: Mutex<FakeState>,
    registry: DisconnectRegistry,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peripherals that accept connections
    pub fn with_peripheral(self, id: &str) -> Self {
        self.state.lock().known.insert(id.into());
        self
    }

    pub fn with_script(self, script: Vec<ScanStep>, end_stream: bool) -> Self {
        {
            let mut state = self.state.lock();
            state.script = script;
            state.end_stream_after_script = end_stream;
        }
        self
    }

    pub fn with_payload(self, service: Uuid, characteristic: Uuid, bytes: &[u8]) -> Self {
        self.state
            .lock()
            .payloads
            .insert((service, characteristic), bytes_to_text(bytes));
        self
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state.lock().connect_delay = delay;
        self
    }

    pub fn with_disconnect_delay(self, delay: Duration) -> Self {
        self.state.lock().disconnect_delay = delay;
        self
    }

    pub fn fail_connect(&self, reason: Option<&str>) {
        self.state.lock().connect_error = reason.map(str::to_string);
    }

    pub fn fail_discover(&self, reason: Option<&str>) {
        self.state.lock().discover_error = reason.map(str::to_string);
    }

    pub fn fail_reads(&self, reason: Option<&str>) {
        self.state.lock().read_error = reason.map(str::to_string);
    }

    pub fn fail_writes(&self, reason: Option<&str>) {
        self.state.lock().write_error = reason.map(str::to_string);
    }

    /// Latency applied to the next writes, in call order
    pub fn queue_write_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        self.state.lock().write_delays.extend(delays);
    }

    /// Simulates the peripheral dropping the link
    pub fn drop_link(&self, id: &str) {
        let id = DeviceId::from(id);
        self.state.lock().connected.remove(&id);
        self.registry.notify(&id);
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state.lock().writes.clone()
    }

    pub fn scan_starts(&self) -> usize {
        self.state.lock().scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        self.state.lock().scan_stops
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn live_links(&self) -> usize {
        self.state.lock().connected.len()
    }

    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Handle = DeviceId;

    async fn scan(&self) -> Result<BoxStream<'static, Result<Device>>> {
        let (script, end_stream) = {
            let mut state = self.state.lock();
            state.scan_starts += 1;
            (state.script.clone(), state.end_stream_after_script)
        };

        let events = stream::iter(script).then(|step| async move {
            match step {
                ScanStep::Found(delay, device) => {
                    tokio::time::sleep(delay).await;
                    Ok(device)
                }
                ScanStep::Fail(delay, reason) => {
                    tokio::time::sleep(delay).await;
                    Err(Error::Scan(reason))
                }
            }
        });

        if end_stream {
            Ok(events.boxed())
        } else {
            Ok(events.chain(stream::pending()).boxed())
        }
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.lock().scan_stops += 1;
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<DeviceId> {
        let delay = self.state.lock().connect_delay;
        tokio::time::sleep(delay).await;

        let mut state = self.state.lock();
        if let Some(reason) = state.connect_error.clone() {
            return Err(Error::Connection(reason));
        }
        if !state.known.contains(id) {
            return Err(Error::Connection(format!("unknown peripheral {id}")));
        }
        state.connected.insert(id.clone());
        Ok(id.clone())
    }

    async fn discover_all(&self, _handle: &DeviceId) -> Result<()> {
        match self.state.lock().discover_error.clone() {
            Some(reason) => Err(Error::Connection(reason)),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, handle: &DeviceId) -> Result<()> {
        let delay = self.state.lock().disconnect_delay;
        tokio::time::sleep(delay).await;

        {
            let mut state = self.state.lock();
            state.disconnects += 1;
            state.connected.remove(handle);
        }
        self.registry.notify(handle);
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> Result<bool> {
        Ok(self.state.lock().connected.contains(id))
    }

    fn on_disconnect(&self, id: &DeviceId, listener: DisconnectListener) -> Subscription {
        self.registry.subscribe(id, listener)
    }

    async fn read_characteristic(
        &self,
        handle: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<String> {
        let state = self.state.lock();
        if !state.connected.contains(handle) {
            return Err(Error::Read(format!("{handle} is not connected")));
        }
        if let Some(reason) = state.read_error.clone() {
            return Err(Error::Read(reason));
        }
        state
            .payloads
            .get(&(service, characteristic))
            .cloned()
            .ok_or(Error::CharacteristicNotFound(characteristic))
    }

    async fn write_characteristic_without_response(
        &self,
        handle: &DeviceId,
        service: Uuid,
        characteristic: Uuid,
        payload: &str,
    ) -> Result<()> {
        let delay = self.state.lock().write_delays.pop_front().unwrap_or_default();
        tokio::time::sleep(delay).await;

        let mut state = self.state.lock();
        if !state.connected.contains(handle) {
            return Err(Error::Write(format!("{handle} is not connected")));
        }
        if let Some(reason) = state.write_error.clone() {
            return Err(Error::Write(reason));
        }
        state.writes.push(RecordedWrite {
            device: handle.clone(),
            service,
            characteristic,
            payload: payload.to_string(),
        });
        Ok(())
    }
}
