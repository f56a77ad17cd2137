/*!
 # Device session controller

 Orchestrates one device view: tracks the connection status, loads the
 identity attributes, turns color interactions into writes and keeps the
 debug counters. The UI consumes the read-only [`StatusView`], [`ColorView`]
 and [`DebugView`] projections.
*/

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, trace, warn};

use crate::attributes::AttributeAccessor;
use crate::codec::{decode_hex_color, RgbwCommand};
use crate::connection::ConnectionManager;
use crate::scanner::DEFAULT_SCAN_TIMEOUT;
use crate::transport::{Device, DeviceId, Subscription, Transport};
use crate::{Error, Result};

/// How color writes issued in quick succession are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteOrdering {
    /// Every write runs independently; a later write may land first
    #[default]
    Unordered,
    /// Writes run one at a time and queued writes superseded by a newer
    /// one are dropped, so the light converges to the latest color
    LatestWins,
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Scan window for device discovery
    pub scan_timeout: Duration,
    /// Ordering policy for color writes
    pub write_ordering: WriteOrdering,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            write_ordering: WriteOrdering::Unordered,
        }
    }
}

/// Success/error counters for color writes. Shared across views and only
/// reset by restarting the process.
#[derive(Debug, Default)]
pub struct DebugCounters {
    successes: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<(String, DateTime<Local>)>>,
}

impl DebugCounters {
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, error: &Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some((error.to_string(), Local::now()));
    }

    pub fn snapshot(&self) -> DebugView {
        let last_error = self.last_error.lock().clone();
        DebugView {
            successes: self.successes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_error: last_error.as_ref().map(|(message, _)| message.clone()),
            last_error_at: last_error.map(|(_, at)| at),
        }
    }
}

/// Color channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red,
    Green,
    Blue,
    White,
}

/// A color interaction from the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorChange {
    /// One channel moved
    Channel(Channel, u8),
    /// Picker output as `#RRGGBB`, white is kept
    Hex(String),
    /// Full replacement
    Rgbw(RgbwCommand),
}

impl ColorChange {
    /// Merges the change into the last known command
    pub fn apply(&self, current: RgbwCommand) -> RgbwCommand {
        match self {
            ColorChange::Channel(Channel::Red, value) => RgbwCommand { red: *value, ..current },
            ColorChange::Channel(Channel::Green, value) => RgbwCommand { green: *value, ..current },
            ColorChange::Channel(Channel::Blue, value) => RgbwCommand { blue: *value, ..current },
            ColorChange::Channel(Channel::White, value) => current.with_white(*value),
            ColorChange::Hex(hex) => current.with_rgb(decode_hex_color(hex)),
            ColorChange::Rgbw(command) => *command,
        }
    }
}

/// Identity and connection status of the viewed device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusView {
    pub id: DeviceId,
    pub name: String,
    pub connected: bool,
    /// A connect is pending
    pub connecting: bool,
    pub firmware_version: Option<String>,
    pub battery_level: Option<u8>,
    /// Message of the last failed connect
    pub error: Option<String>,
}

/// Color control state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorView {
    pub command: RgbwCommand,
    pub hex: String,
    /// Writes only reach the light while connected
    pub enabled: bool,
}

/// Debug counter readout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugView {
    pub successes: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Local>>,
}

#[derive(Debug, Default)]
struct ViewState {
    connected: bool,
    // Bumped by every disconnect event for the device.
    disconnects: u64,
    connecting: bool,
    firmware_version: Option<String>,
    battery_level: Option<u8>,
    error: Option<String>,
    color: RgbwCommand,
}

/// Controller for one device view
pub struct DeviceSession<T: Transport> {
    device: Device,
    manager: Arc<ConnectionManager<T>>,
    accessor: AttributeAccessor<T>,
    counters: Arc<DebugCounters>,
    config: SessionConfig,
    view: Arc<Mutex<ViewState>>,
    writes: Mutex<JoinSet<()>>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    write_generation: Arc<AtomicU64>,
    // Unregisters the disconnect listener when the view goes away.
    _disconnect: Subscription,
}

impl<T: Transport> DeviceSession<T> {
    /// Enters the view: subscribes to disconnects, queries the link state
    /// and loads firmware and battery if already connected.
    #[instrument(skip_all, fields(device = %device.id))]
    pub async fn open(
        device: Device,
        manager: Arc<ConnectionManager<T>>,
        counters: Arc<DebugCounters>,
        config: SessionConfig,
    ) -> Self {
        let view = Arc::new(Mutex::new(ViewState::default()));
        let subscription =
            manager.on_disconnect(&device.id, disconnect_listener(Arc::downgrade(&view)));

        let session = Self {
            accessor: AttributeAccessor::bound_to(manager.clone(), device.id.clone()),
            device,
            manager,
            counters,
            config,
            view,
            writes: Mutex::new(JoinSet::new()),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
            write_generation: Arc::new(AtomicU64::new(0)),
            _disconnect: subscription,
        };

        let seen = session.view.lock().disconnects;
        let live = session.manager.is_connected(&session.device.id).await;
        let connected = session.mark_connected(live, seen);
        debug!("Opened view, connected: {}", connected);
        if connected {
            session.refresh_info().await;
        }
        session
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // Sets the flag unless a disconnect event arrived after `seen` was taken.
    fn mark_connected(&self, connected: bool, seen: u64) -> bool {
        let mut view = self.view.lock();
        view.connected = connected && view.disconnects == seen;
        if connected && !view.connected {
            debug!("Disconnect event raced the link check, keeping disconnected");
        }
        view.connected
    }

    /// User "Connect" action. A connect rejected because another transition
    /// is running leaves the view untouched.
    #[instrument(skip(self), fields(device = %self.device.id))]
    pub async fn connect(&self) -> Result<()> {
        let (seen, previous) = {
            let mut view = self.view.lock();
            let previous = (view.connecting, view.error.take());
            view.connecting = true;
            (view.disconnects, previous)
        };

        match self.manager.connect(&self.device).await {
            Ok(()) => {
                self.view.lock().connecting = false;
                if self.mark_connected(true, seen) {
                    self.refresh_info().await;
                }
                Ok(())
            }
            Err(Error::OperationInProgress) => {
                debug!("Connect rejected, another transition is running");
                let mut view = self.view.lock();
                (view.connecting, view.error) = previous;
                Err(Error::OperationInProgress)
            }
            Err(e) => {
                warn!("Connect failed: {}", e);
                let mut view = self.view.lock();
                view.connected = false;
                view.connecting = false;
                view.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// User "Disconnect" action
    #[instrument(skip(self), fields(device = %self.device.id))]
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.manager.disconnect().await;
        if !matches!(result, Err(Error::OperationInProgress)) {
            self.view.lock().connected = false;
        }
        result
    }

    /// Re-reads firmware version and battery level
    pub async fn refresh_info(&self) {
        let firmware_version = self.accessor.read_firmware_version().await;
        let battery_level = self.accessor.read_battery_level().await;

        let mut view = self.view.lock();
        view.firmware_version = firmware_version;
        view.battery_level = battery_level;
    }

    /// Applies a color interaction and issues the write immediately. Each
    /// call produces its own write; nothing is debounced.
    pub fn change_color(&self, change: ColorChange) -> RgbwCommand {
        let command = {
            let mut view = self.view.lock();
            view.color = change.apply(view.color);
            view.color
        };
        trace!("Color change {:?} -> {:?}", change, command);

        let accessor = self.accessor.clone();
        let on_success = self.counters.clone();
        let on_error = self.counters.clone();

        let mut writes = self.writes.lock();
        while writes.try_join_next().is_some() {}

        match self.config.write_ordering {
            WriteOrdering::Unordered => {
                writes.spawn(async move {
                    accessor
                        .write_color(
                            command,
                            || on_success.record_success(),
                            |e| on_error.record_error(e),
                        )
                        .await;
                });
            }
            WriteOrdering::LatestWins => {
                let generation = self.write_generation.fetch_add(1, Ordering::SeqCst) + 1;
                let latest = self.write_generation.clone();
                let gate = self.write_gate.clone();
                writes.spawn(async move {
                    let _turn = gate.lock().await;
                    if latest.load(Ordering::SeqCst) != generation {
                        trace!("Dropping superseded color write {:?}", command);
                        return;
                    }
                    accessor
                        .write_color(
                            command,
                            || on_success.record_success(),
                            |e| on_error.record_error(e),
                        )
                        .await;
                });
            }
        }
        command
    }

    /// Waits for every color write issued so far
    pub async fn flush_writes(&self) {
        let mut pending = std::mem::take(&mut *self.writes.lock());
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                warn!("Color write task failed: {}", e);
            }
        }
    }

    pub fn status(&self) -> StatusView {
        let view = self.view.lock();
        StatusView {
            id: self.device.id.clone(),
            name: self.device.display_name().to_string(),
            connected: view.connected,
            connecting: view.connecting,
            firmware_version: view.firmware_version.clone(),
            battery_level: view.battery_level,
            error: view.error.clone(),
        }
    }

    pub fn color(&self) -> ColorView {
        let view = self.view.lock();
        ColorView {
            command: view.color,
            hex: view.color.hex(),
            enabled: view.connected,
        }
    }

    pub fn debug(&self) -> DebugView {
        self.counters.snapshot()
    }
}

impl<T: Transport> Drop for DeviceSession<T> {
    fn drop(&mut self) {
        // In-flight writes outlive the view.
        self.writes.lock().detach_all();
    }
}

fn disconnect_listener(view: Weak<Mutex<ViewState>>) -> crate::transport::DisconnectListener {
    Arc::new(move |id: &DeviceId| {
        if let Some(state) = view.upgrade() {
            {
                let mut view = state.lock();
                view.connected = false;
                view.disconnects += 1;
            }
            info!("Device {} disconnected", id);
        }
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::codec::{decode_color_command, text_to_bytes};
    use crate::fake::FakeTransport;
    use crate::services::{
        BATTERY_LEVEL_UUID, BATTERY_SERVICE_UUID, DEVICE_INFO_SERVICE_UUID, FIRMWARE_VERSION_UUID,
    };

    fn lamp() -> Device {
        Device::new("lamp").with_name("Lamp")
    }

    fn light() -> FakeTransport {
        FakeTransport::new()
            .with_peripheral("lamp")
            .with_payload(BATTERY_SERVICE_UUID, BATTERY_LEVEL_UUID, &[0x4B])
            .with_payload(DEVICE_INFO_SERVICE_UUID, FIRMWARE_VERSION_UUID, b"2.0.1")
    }

    async fn open(
        transport: FakeTransport,
        ordering: WriteOrdering,
    ) -> (Arc<FakeTransport>, DeviceSession<FakeTransport>) {
        let transport = Arc::new(transport);
        let manager = Arc::new(ConnectionManager::new(transport.clone()));
        let config = SessionConfig {
            write_ordering: ordering,
            ..SessionConfig::default()
        };
        let session = DeviceSession::open(lamp(), manager, Arc::default(), config).await;
        (transport, session)
    }

    fn written_commands(transport: &FakeTransport) -> Vec<RgbwCommand> {
        transport
            .writes()
            .iter()
            .map(|w| decode_color_command(&text_to_bytes(&w.payload).unwrap()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn entering_disconnected_view_reads_nothing() {
        let (_, session) = open(light(), WriteOrdering::Unordered).await;

        let status = session.status();
        assert!(!status.connected);
        assert_eq!(None, status.battery_level);
        assert_eq!("Lamp", status.name);
        assert!(!session.color().enabled);
    }

    #[tokio::test]
    async fn connect_loads_identity_attributes() {
        let (_, session) = open(light(), WriteOrdering::Unordered).await;

        session.connect().await.unwrap();

        let status = session.status();
        assert!(status.connected);
        assert!(!status.connecting);
        assert_eq!(Some(75), status.battery_level);
        assert_eq!(Some("2.0.1".to_string()), status.firmware_version);
        assert_eq!(None, status.error);
    }

    #[tokio::test]
    async fn reentering_a_connected_view_reads_immediately() {
        let transport = Arc::new(light());
        let manager = Arc::new(ConnectionManager::new(transport.clone()));
        manager.connect(&lamp()).await.unwrap();

        let session =
            DeviceSession::open(lamp(), manager, Arc::default(), SessionConfig::default()).await;

        assert!(session.status().connected);
        assert_eq!(Some(75), session.status().battery_level);
    }

    #[tokio::test]
    async fn connect_failure_records_message() {
        let (transport, session) = open(light(), WriteOrdering::Unordered).await;
        transport.fail_connect(Some("permission not granted"));

        assert_matches!(session.connect().await, Err(Error::Connection(_)));

        let status = session.status();
        assert!(!status.connected);
        assert!(!status.connecting);
        assert_eq!(
            Some("Connection failed: permission not granted".to_string()),
            status.error
        );
    }

    #[tokio::test]
    async fn remote_disconnect_clears_flag_without_reconnecting() {
        let (transport, session) = open(light(), WriteOrdering::Unordered).await;
        session.connect().await.unwrap();

        transport.drop_link("lamp");

        assert!(!session.status().connected);
        assert_eq!(0, transport.live_links());
    }

    #[tokio::test]
    async fn closing_the_view_unregisters_its_listener() {
        let transport = Arc::new(light());
        let manager = Arc::new(ConnectionManager::new(transport.clone()));
        let session =
            DeviceSession::open(lamp(), manager.clone(), Arc::default(), SessionConfig::default())
                .await;
        assert_eq!(1, transport.listener_count());
        session.connect().await.unwrap();
        assert_eq!(2, transport.listener_count());

        drop(session);
        // The manager's own session listener stays.
        assert_eq!(1, transport.listener_count());
        assert!(manager.is_connected(&"lamp".into()).await);
    }

    #[tokio::test]
    async fn color_changes_merge_into_last_command() {
        let (transport, session) = open(light(), WriteOrdering::Unordered).await;
        session.connect().await.unwrap();

        session.change_color(ColorChange::Hex("#FF0000".into()));
        session.flush_writes().await;
        session.change_color(ColorChange::Channel(Channel::White, 10));
        session.flush_writes().await;
        session.change_color(ColorChange::Channel(Channel::Blue, 0x20));
        session.flush_writes().await;

        assert_eq!(
            vec![
                RgbwCommand::new(255, 0, 0, 0),
                RgbwCommand::new(255, 0, 0, 10),
                RgbwCommand::new(255, 0, 0x20, 10),
            ],
            written_commands(&transport)
        );
        assert_eq!("#FF0020", session.color().hex);
    }

    #[tokio::test]
    async fn successful_writes_count_exactly() {
        let (_, session) = open(light(), WriteOrdering::Unordered).await;
        session.connect().await.unwrap();

        for value in 0..7u8 {
            session.change_color(ColorChange::Channel(Channel::Red, value));
        }
        session.flush_writes().await;

        let debug = session.debug();
        assert_eq!(7, debug.successes);
        assert_eq!(0, debug.errors);
        assert_eq!(None, debug.last_error);
    }

    #[tokio::test]
    async fn failed_write_counts_error_only() {
        let (transport, session) = open(light(), WriteOrdering::Unordered).await;
        session.connect().await.unwrap();
        transport.fail_writes(Some("gatt busy"));

        session.change_color(ColorChange::Channel(Channel::Green, 1));
        session.flush_writes().await;

        let debug = session.debug();
        assert_eq!(0, debug.successes);
        assert_eq!(1, debug.errors);
        assert_eq!(Some("Write failed: gatt busy".to_string()), debug.last_error);
        assert!(debug.last_error_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unordered_writes_may_land_out_of_order() {
        let (transport, session) = open(light(), WriteOrdering::Unordered).await;
        session.connect().await.unwrap();
        transport.queue_write_delays([Duration::from_millis(50), Duration::ZERO]);

        session.change_color(ColorChange::Channel(Channel::Red, 1));
        session.change_color(ColorChange::Channel(Channel::Red, 2));
        session.flush_writes().await;

        assert_eq!(
            vec![RgbwCommand::new(2, 0, 0, 0), RgbwCommand::new(1, 0, 0, 0)],
            written_commands(&transport)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn latest_wins_converges_to_newest_color() {
        let (transport, session) = open(light(), WriteOrdering::LatestWins).await;
        session.connect().await.unwrap();
        transport.queue_write_delays([Duration::from_millis(50), Duration::ZERO, Duration::ZERO]);

        session.change_color(ColorChange::Channel(Channel::Red, 1));
        tokio::task::yield_now().await;
        session.change_color(ColorChange::Channel(Channel::Red, 2));
        session.change_color(ColorChange::Channel(Channel::Red, 3));
        session.flush_writes().await;

        assert_eq!(
            vec![RgbwCommand::new(1, 0, 0, 0), RgbwCommand::new(3, 0, 0, 0)],
            written_commands(&transport)
        );
        assert_eq!(2, session.debug().successes);
    }

    #[tokio::test]
    async fn view_never_writes_through_another_devices_session() {
        let transport = Arc::new(light().with_peripheral("strip"));
        let manager = Arc::new(ConnectionManager::new(transport.clone()));
        let counters = Arc::new(DebugCounters::default());
        let lamp_view =
            DeviceSession::open(lamp(), manager.clone(), counters.clone(), SessionConfig::default())
                .await;
        lamp_view.connect().await.unwrap();
        drop(lamp_view);

        let strip = Device::new("strip").with_name("Strip");
        let strip_view =
            DeviceSession::open(strip, manager, counters, SessionConfig::default()).await;
        strip_view.change_color(ColorChange::Rgbw(RgbwCommand::new(9, 9, 9, 9)));
        strip_view.flush_writes().await;
        strip_view.refresh_info().await;

        let status = strip_view.status();
        assert!(!status.connected);
        assert_eq!(None, status.battery_level);
        assert!(transport.writes().is_empty());
        let debug = strip_view.debug();
        assert_eq!(0, debug.successes);
        assert_eq!(1, debug.errors);
        assert_eq!(Some("No device connected".to_string()), debug.last_error);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_connect_keeps_pending_state() {
        let (_, session) = open(
            light().with_connect_delay(Duration::from_millis(200)),
            WriteOrdering::Unordered,
        )
        .await;

        let (first, (second, pending)) = tokio::join!(session.connect(), async {
            let second = session.connect().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            (second, session.status())
        });

        assert!(first.is_ok());
        assert_matches!(second, Err(Error::OperationInProgress));
        assert!(pending.connecting);
        assert_eq!(None, pending.error);
        assert!(session.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_disconnect_keeps_connected_flag() {
        let transport = Arc::new(light().with_disconnect_delay(Duration::from_millis(200)));
        let manager = Arc::new(ConnectionManager::new(transport.clone()));
        let session =
            DeviceSession::open(lamp(), manager.clone(), Arc::default(), SessionConfig::default())
                .await;
        session.connect().await.unwrap();

        let (first, (second, during)) = tokio::join!(manager.disconnect(), async {
            let second = session.disconnect().await;
            (second, session.status())
        });

        assert!(first.is_ok());
        assert_matches!(second, Err(Error::OperationInProgress));
        assert!(during.connected);
        assert!(!session.status().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_event_during_connect_is_not_overwritten() {
        let (transport, session) = open(
            light().with_connect_delay(Duration::from_millis(200)),
            WriteOrdering::Unordered,
        )
        .await;

        let (result, ()) = tokio::join!(session.connect(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            transport.drop_link("lamp");
        });

        assert!(result.is_ok());
        let status = session.status();
        assert!(!status.connected);
        assert!(!status.connecting);
        assert_eq!(None, status.battery_level);
    }

    #[test]
    fn color_change_apply_touches_only_its_channel() {
        let base = RgbwCommand::new(1, 2, 3, 4);
        assert_eq!(
            RgbwCommand::new(9, 2, 3, 4),
            ColorChange::Channel(Channel::Red, 9).apply(base)
        );
        assert_eq!(
            RgbwCommand::new(1, 9, 3, 4),
            ColorChange::Channel(Channel::Green, 9).apply(base)
        );
        assert_eq!(RgbwCommand::new(0, 0, 0, 4), ColorChange::Hex("red".into()).apply(base));
    }
}
