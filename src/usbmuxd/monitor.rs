//! Process-wide device monitor
//!
//! Keeps one listen-mode connection to the multiplexer alive, mirrors its
//! attach/detach stream into a `DeviceID <-> UDID` registry and fans events
//! out to subscribers. The registry is written only by the monitor task;
//! any thread may read it.
//!
//! The muxer connection is re-dialed forever: immediately on startup, then
//! after a one second pause on every loss. Each loss clears the registry
//! and emits [`MonitorEvent::Disconnected`], so subscribers always observe
//! a `Disconnected`/`Connected` pair with a fresh attach stream in between.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::MuxdevError;

use super::{des::MuxEvent, Connection, UsbmuxdAddr};

/// The frame tag the monitor's listen connection uses
const LISTEN_TAG: u32 = 1;

/// What subscribers receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// The muxer connection is up and the registry is live
    Connected,
    /// The muxer connection dropped; the registry has been cleared
    Disconnected,
    /// A USB device appeared
    DeviceAttached(String),
    /// A previously attached device went away
    DeviceDetached(String),
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<u32, String>,
    by_udid: HashMap<String, u32>,
}

#[derive(Default)]
struct MonitorShared {
    /// Single writer (the monitor task), many readers
    registry: RwLock<Registry>,
    /// Lock order: subscribers before registry, always
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MonitorEvent>>>,
}

/// Handle to the monitor actor
///
/// Cheap to clone; the background task stops when the last handle drops.
#[derive(Clone)]
pub struct DeviceMonitor {
    shared: Arc<MonitorShared>,
    addr: UsbmuxdAddr,
    _task: Arc<AbortOnDrop>,
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl DeviceMonitor {
    /// Spawns the monitor against the given muxer address
    ///
    /// # Arguments
    /// * `addr` - Where the muxer listens
    /// * `label` - Program name reported to the muxer
    pub fn start(addr: UsbmuxdAddr, label: impl Into<String>) -> Self {
        let shared = Arc::new(MonitorShared::default());
        let task = tokio::spawn(monitor_loop(addr.clone(), label.into(), Arc::clone(&shared)));
        Self {
            shared,
            addr,
            _task: Arc::new(AbortOnDrop(task)),
        }
    }

    /// Spawns the monitor against the platform-default muxer address
    pub fn start_default(label: impl Into<String>) -> Self {
        Self::start(UsbmuxdAddr::default(), label)
    }

    /// The muxer address this monitor watches
    pub fn addr(&self) -> &UsbmuxdAddr {
        &self.addr
    }

    /// Snapshot of the attached device UDIDs, sorted
    pub fn list_devices(&self) -> Vec<String> {
        let registry = self.shared.registry.read().expect("registry poisoned");
        let mut udids: Vec<String> = registry.by_udid.keys().cloned().collect();
        udids.sort();
        udids
    }

    /// Looks up the muxer's current id for a device
    ///
    /// Returns `None` when the device is not attached (or the muxer is
    /// down). Reads never contend with anything but the monitor's own
    /// registry updates.
    pub fn get_device_id(&self, udid: &str) -> Option<u32> {
        self.shared
            .registry
            .read()
            .expect("registry poisoned")
            .by_udid
            .get(udid)
            .copied()
    }

    /// Registers a sink for monitor events
    ///
    /// The returned snapshot is taken under the same lock that installs
    /// the sink: every event delivered to the receiver postdates it.
    pub fn subscribe(&self) -> (Vec<String>, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self.shared.subscribers.lock().expect("subscribers poisoned");
        let mut udids: Vec<String> = {
            let registry = self.shared.registry.read().expect("registry poisoned");
            registry.by_udid.keys().cloned().collect()
        };
        udids.sort();
        subscribers.push(tx);

        (udids, rx)
    }
}

impl std::fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("devices", &self.list_devices())
            .finish()
    }
}

fn publish(subscribers: &mut Vec<mpsc::UnboundedSender<MonitorEvent>>, event: MonitorEvent) {
    // Sinks whose receiver has been dropped are pruned on the way
    subscribers.retain(|tx| tx.send(event.clone()).is_ok());
}

async fn monitor_loop(addr: UsbmuxdAddr, label: String, shared: Arc<MonitorShared>) {
    let mut first_attempt = true;
    loop {
        if !first_attempt {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        first_attempt = false;

        if let Err(e) = run_connection(&addr, &label, &shared).await {
            debug!("Monitor connection ended: {e}");
        }

        // Entering Disconnected: no stale id may survive into the next
        // connection's attach stream
        let mut subscribers = shared.subscribers.lock().expect("subscribers poisoned");
        {
            let mut registry = shared.registry.write().expect("registry poisoned");
            registry.by_id.clear();
            registry.by_udid.clear();
        }
        publish(&mut subscribers, MonitorEvent::Disconnected);
    }
}

async fn run_connection(
    addr: &UsbmuxdAddr,
    label: &str,
    shared: &MonitorShared,
) -> Result<(), MuxdevError> {
    let mut conn = addr.connect(LISTEN_TAG, label).await?;
    // ReadBUID doubles as the protocol version handshake
    let buid = conn.get_buid().await?;
    debug!("Monitor connected to muxer with BUID {buid}");
    conn.listen().await?;

    {
        let mut subscribers = shared.subscribers.lock().expect("subscribers poisoned");
        publish(&mut subscribers, MonitorEvent::Connected);
    }

    loop {
        match conn.read_event().await? {
            MuxEvent::Attached(device) => {
                if device.connection_type != Connection::Usb {
                    debug!("Ignoring non-USB attach for {}", device.udid);
                    continue;
                }
                let mut subscribers = shared.subscribers.lock().expect("subscribers poisoned");
                {
                    let mut registry = shared.registry.write().expect("registry poisoned");
                    registry.by_id.insert(device.device_id, device.udid.clone());
                    registry.by_udid.insert(device.udid.clone(), device.device_id);
                }
                publish(&mut subscribers, MonitorEvent::DeviceAttached(device.udid));
            }
            MuxEvent::Detached { device_id } => {
                let mut subscribers = shared.subscribers.lock().expect("subscribers poisoned");
                let removed = {
                    let mut registry = shared.registry.write().expect("registry poisoned");
                    match registry.by_id.remove(&device_id) {
                        Some(udid) => {
                            registry.by_udid.remove(&udid);
                            Some(udid)
                        }
                        None => None,
                    }
                };
                match removed {
                    Some(udid) => publish(&mut subscribers, MonitorEvent::DeviceDetached(udid)),
                    None => warn!("Detach for unknown device id {device_id}"),
                }
            }
            MuxEvent::Ignored => {}
        }
    }
}
