//! Connection providers
//!
//! A provider knows how to open a stream to an arbitrary TCP port on one
//! particular device and where that device's pairing record lives. The
//! service clients are written against the trait so the same code dials
//! through the multiplexer, through the monitor's registry, or straight
//! over TCP for network-attached devices.

use std::net::{IpAddr, SocketAddr};

use futures::future::BoxFuture;
use tokio::net::TcpStream;

use crate::{
    pair_record::PairRecord,
    usbmuxd::{monitor::DeviceMonitor, UsbmuxdAddr},
    DeviceConnection, MuxdevError,
};

pub trait ConnectionProvider: Unpin + Send + Sync + std::fmt::Debug {
    /// Opens a stream to `port` on the device
    fn connect(&self, port: u16) -> BoxFuture<'_, Result<DeviceConnection, MuxdevError>>;

    /// The label this host reports to device daemons
    fn label(&self) -> &str;

    /// Fetches the device's pairing record
    fn get_pair_record(&self) -> BoxFuture<'_, Result<PairRecord, MuxdevError>>;
}

/// Dials a fixed muxer device id
///
/// The id is a snapshot from enumeration time; it goes stale when the
/// device re-attaches. Prefer [`MonitorProvider`] for long-running hosts.
#[derive(Debug)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

impl ConnectionProvider for UsbmuxdProvider {
    fn connect(&self, port: u16) -> BoxFuture<'_, Result<DeviceConnection, MuxdevError>> {
        Box::pin(async move {
            let usbmuxd = self.addr.connect(self.tag, &self.label).await?;
            usbmuxd
                .connect_to_device(self.device_id, port, &self.label)
                .await
        })
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    fn get_pair_record(&self) -> BoxFuture<'_, Result<PairRecord, MuxdevError>> {
        Box::pin(async move {
            let mut usbmuxd = self.addr.connect(self.tag, &self.label).await?;
            usbmuxd.get_pair_record(&self.udid).await
        })
    }
}

/// Dials through the monitor's live registry
///
/// The muxer device id is resolved at dial time, so the provider stays
/// valid across re-attaches; dials while the device is absent fail with
/// `DeviceNotFound` without touching the muxer.
#[derive(Debug)]
pub struct MonitorProvider {
    monitor: DeviceMonitor,
    udid: String,
    label: String,
}

impl MonitorProvider {
    pub fn new(monitor: &DeviceMonitor, udid: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            monitor: monitor.clone(),
            udid: udid.into(),
            label: label.into(),
        }
    }
}

impl ConnectionProvider for MonitorProvider {
    fn connect(&self, port: u16) -> BoxFuture<'_, Result<DeviceConnection, MuxdevError>> {
        Box::pin(async move {
            let usbmuxd = self.monitor.addr().connect(0, &self.label).await?;
            usbmuxd
                .connect_thru(&self.monitor, &self.udid, port, &self.label)
                .await
        })
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    fn get_pair_record(&self) -> BoxFuture<'_, Result<PairRecord, MuxdevError>> {
        Box::pin(async move {
            let mut usbmuxd = self.monitor.addr().connect(0, &self.label).await?;
            usbmuxd.get_pair_record(&self.udid).await
        })
    }
}

impl DeviceMonitor {
    /// A provider for one of this monitor's devices
    pub fn provider(&self, udid: impl Into<String>, label: impl Into<String>) -> MonitorProvider {
        MonitorProvider::new(self, udid, label)
    }
}

/// Dials a network-reachable device directly, no muxer involved
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub pair_record: PairRecord,
    pub label: String,
}

impl ConnectionProvider for TcpProvider {
    fn connect(&self, port: u16) -> BoxFuture<'_, Result<DeviceConnection, MuxdevError>> {
        Box::pin(async move {
            let socket_addr = SocketAddr::new(self.addr, port);
            let stream = TcpStream::connect(socket_addr).await?;
            Ok(DeviceConnection::new(Box::new(stream), self.label.clone()))
        })
    }

    fn label(&self) -> &str {
        self.label.as_str()
    }

    fn get_pair_record(&self) -> BoxFuture<'_, Result<PairRecord, MuxdevError>> {
        Box::pin(async move { Ok(self.pair_record.clone()) })
    }
}
