/*!
 # Transport capability interface

 The BLE host stack is consumed through the [`Transport`] trait: scanning,
 connecting, service discovery, characteristic reads and no-response writes,
 and disconnect subscriptions. Characteristic payloads cross this boundary in
 their text form (see [`crate::codec::bytes_to_text`]).
*/

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::Result;

/// Stable per-session identifier of a peripheral
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Snapshot of a discovered peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Identifier, never changes for the same peripheral
    pub id: DeviceId,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Advertised service UUIDs
    pub services: BTreeSet<Uuid>,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            services: BTreeSet::new(),
            rssi: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.insert(service);
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    /// True if the peripheral advertised a non-empty name
    pub fn has_name(&self) -> bool {
        self.name.as_deref().is_some_and(|name| !name.is_empty())
    }

    /// Name for display, `"Unknown Device"` when none was advertised
    pub fn display_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => "Unknown Device",
        }
    }
}

/// Callback invoked when a peripheral disconnects
pub type DisconnectListener = Arc<dyn Fn(&DeviceId) + Send + Sync>;

/// Host BLE stack as seen by the controller
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Live connection handle
    type Handle: Clone + Send + Sync + 'static;

    /// Starts discovery. The stream yields every raw discovery event, an
    /// `Err` item means discovery failed.
    async fn scan(&self) -> Result<BoxStream<'static, Result<Device>>>;

    /// Stops discovery. Must be idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Opens the link to a peripheral
    async fn connect(&self, id: &DeviceId) -> Result<Self::Handle>;

    /// Resolves all services and characteristics of a connected peripheral
    async fn discover_all(&self, handle: &Self::Handle) -> Result<()>;

    /// Tears down the link
    async fn disconnect(&self, handle: &Self::Handle) -> Result<()>;

    /// Live link state as reported by the stack
    async fn is_connected(&self, id: &DeviceId) -> Result<bool>;

    /// Registers a listener for disconnects of `id`. The listener stays
    /// registered until the returned [`Subscription`] is dropped.
    fn on_disconnect(&self, id: &DeviceId, listener: DisconnectListener) -> Subscription;

    /// Reads a characteristic, returning its payload in text form
    async fn read_characteristic(
        &self,
        handle: &Self::Handle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<String>;

    /// Writes a text-form payload without waiting for acknowledgment
    async fn write_characteristic_without_response(
        &self,
        handle: &Self::Handle,
        service: Uuid,
        characteristic: Uuid,
        payload: &str,
    ) -> Result<()>;
}

#[derive(Default)]
struct Listeners {
    next_key: u64,
    entries: HashMap<u64, (DeviceId, DisconnectListener)>,
}

/// Disconnect listener table shared by transport implementations
#[derive(Default, Clone)]
pub struct DisconnectRegistry {
    inner: Arc<Mutex<Listeners>>,
}

impl DisconnectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, id: &DeviceId, listener: DisconnectListener) -> Subscription {
        let mut listeners = self.inner.lock();
        let key = listeners.next_key;
        listeners.next_key += 1;
        listeners.entries.insert(key, (id.clone(), listener));
        trace!("Registered disconnect listener {} for {}", key, id);

        Subscription {
            registry: Arc::downgrade(&self.inner),
            key,
        }
    }

    /// Invokes every listener registered for `id`, returning how many ran.
    /// Listeners run outside the table lock so they may drop subscriptions.
    pub fn notify(&self, id: &DeviceId) -> usize {
        let listeners: Vec<DisconnectListener> = self
            .inner
            .lock()
            .entries
            .values()
            .filter(|(device, _)| device == id)
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in &listeners {
            listener(id);
        }
        listeners.len()
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration handle for a disconnect listener. Dropping it unregisters
/// the listener.
#[must_use = "dropping a Subscription unregisters the listener"]
pub struct Subscription {
    registry: Weak<Mutex<Listeners>>,
    key: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().entries.remove(&self.key);
            trace!("Unregistered disconnect listener {}", self.key);
        }
    }
}
