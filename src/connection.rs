/*!
 # Connection management

 Owns at most one connection session. A session exists only after both the
 link and capability discovery succeeded, and it always carries the
 disconnect listener that clears it again.
*/

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::transport::{Device, DeviceId, DisconnectListener, Subscription, Transport};
use crate::{Error, Result};

/// Connection lifecycle as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Link or capability discovery in progress
    Connecting,
    Connected,
}

struct Session<H> {
    device: Device,
    handle: H,
    // Unregisters on drop.
    _listener: Subscription,
}

struct Slot<H> {
    state: ConnectionState,
    session: Option<Session<H>>,
}

/// Single-session connection manager over a [`Transport`]
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    slot: Arc<Mutex<Slot<T::Handle>>>,
    // Held for the whole of a connect or disconnect transition.
    transition: tokio::sync::Mutex<()>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            slot: Arc::new(Mutex::new(Slot {
                state: ConnectionState::Disconnected,
                session: None,
            })),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.lock().state
    }

    /// The device of the active session
    pub fn connected_device(&self) -> Option<Device> {
        self.slot
            .lock()
            .session
            .as_ref()
            .map(|session| session.device.clone())
    }

    pub(crate) fn session_handle(&self) -> Option<(DeviceId, T::Handle)> {
        self.slot
            .lock()
            .session
            .as_ref()
            .map(|session| (session.device.id.clone(), session.handle.clone()))
    }

    /// Connects to `device` and resolves its services.
    ///
    /// An existing session to another device is disconnected first. If the
    /// device is already connected this is a no-op. Fails with
    /// [`Error::OperationInProgress`] while another connect or disconnect is
    /// running.
    #[instrument(skip(self, device), fields(device = %device.id))]
    pub async fn connect(&self, device: &Device) -> Result<()> {
        let _transition = self.transition.try_lock().map_err(|_| {
            warn!("Rejecting connect, another transition is in flight");
            Error::OperationInProgress
        })?;

        let existing = self.session_handle();
        if let Some((id, _)) = existing {
            if id == device.id && self.transport.is_connected(&id).await.unwrap_or(false) {
                info!("Already connected to {}", id);
                return Ok(());
            }
            info!("Replacing session with {} by {}", id, device.id);
            if let Err(e) = self.teardown().await {
                warn!("Previous session did not close cleanly: {}", e);
            }
        }

        self.slot.lock().state = ConnectionState::Connecting;
        match self.establish(device).await {
            Ok(session) => {
                let mut slot = self.slot.lock();
                slot.session = Some(session);
                slot.state = ConnectionState::Connected;
                info!("Connected to {} ({})", device.display_name(), device.id);
                Ok(())
            }
            Err(e) => {
                self.slot.lock().state = ConnectionState::Disconnected;
                error!("Connection Error: {}", e);
                Err(e)
            }
        }
    }

    async fn establish(&self, device: &Device) -> Result<Session<T::Handle>> {
        info!("Connecting to device...");
        let handle = self
            .transport
            .connect(&device.id)
            .await
            .map_err(into_connection_error)?;

        debug!("Discovering services...");
        if let Err(e) = self.transport.discover_all(&handle).await {
            warn!("Service discovery failed, dropping the link: {}", e);
            if let Err(e) = self.transport.disconnect(&handle).await {
                warn!("Failed to drop partial connection: {}", e);
            }
            return Err(into_connection_error(e));
        }

        let listener = session_listener(Arc::downgrade(&self.slot));
        let subscription = self.transport.on_disconnect(&device.id, listener);
        Ok(Session {
            device: device.clone(),
            handle,
            _listener: subscription,
        })
    }

    /// Tears down the active session. Does nothing when not connected.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let _transition = self.transition.try_lock().map_err(|_| {
            warn!("Rejecting disconnect, another transition is in flight");
            Error::OperationInProgress
        })?;
        self.teardown().await
    }

    async fn teardown(&self) -> Result<()> {
        let session = {
            let mut slot = self.slot.lock();
            slot.state = ConnectionState::Disconnected;
            slot.session.take()
        };
        let Some(Session {
            device,
            handle,
            _listener,
        }) = session
        else {
            debug!("Not connected, nothing to disconnect");
            return Ok(());
        };
        drop(_listener);

        info!("Disconnecting from device {}", device.id);
        match self.transport.disconnect(&handle).await {
            Ok(()) => {
                info!("Successfully disconnected");
                Ok(())
            }
            Err(e) => {
                error!("Disconnect failed: {}", e);
                Err(into_connection_error(e))
            }
        }
    }

    /// Live link state for `id`. True only while this manager holds a
    /// session for it and the transport reports the link up.
    #[instrument(skip(self))]
    pub async fn is_connected(&self, id: &DeviceId) -> bool {
        let held = self
            .slot
            .lock()
            .session
            .as_ref()
            .is_some_and(|session| &session.device.id == id);
        if !held {
            return false;
        }

        match self.transport.is_connected(id).await {
            Ok(true) => true,
            Ok(false) => {
                warn!("Link to {} dropped without a disconnect event", id);
                drop(clear_session(&self.slot, id));
                false
            }
            Err(e) => {
                warn!("Could not query link state of {}: {}", id, e);
                false
            }
        }
    }

    /// Registers a listener for disconnects of `id`, local or remote. The
    /// listener is removed when the returned [`Subscription`] drops.
    pub fn on_disconnect(&self, id: &DeviceId, listener: DisconnectListener) -> Subscription {
        self.transport.on_disconnect(id, listener)
    }
}

fn session_listener<H: Send + 'static>(slot: Weak<Mutex<Slot<H>>>) -> DisconnectListener {
    Arc::new(move |id: &DeviceId| {
        let Some(slot) = slot.upgrade() else {
            return;
        };
        if clear_session(&slot, id).is_some() {
            info!("Device {} disconnected", id);
        }
    })
}

// The returned session must be dropped after the slot lock is released.
fn clear_session<H>(slot: &Mutex<Slot<H>>, id: &DeviceId) -> Option<Session<H>> {
    let mut slot = slot.lock();
    let matches = slot
        .session
        .as_ref()
        .is_some_and(|session| &session.device.id == id);
    if !matches {
        return None;
    }
    slot.state = ConnectionState::Disconnected;
    slot.session.take()
}

fn into_connection_error(error: Error) -> Error {
    match error {
        Error::Connection(_)
        | Error::PermissionDenied(_)
        | Error::AdapterUnavailable(_)
        | Error::NoBluetoothAdapters => error,
        other => Error::Connection(other.to_string()),
    }
}
