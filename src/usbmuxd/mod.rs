//! USB multiplexer daemon (usbmuxd) client
//!
//! Talks to the local multiplexer over its UNIX socket (or TCP for
//! simulators), enumerates attached devices, reads pairing records and
//! tunnels TCP streams to ports on a device. Long-lived monitoring with
//! attach/detach fan-out lives in [`monitor`].

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    str::FromStr,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{pair_record::PairRecord, DeviceConnection, MuxdevError, ReadWrite};

mod des;
pub mod monitor;
mod raw_packet;

use monitor::DeviceMonitor;
use raw_packet::RawPacket;

/// Version string every request advertises to the muxer
const CLIENT_VERSION_STRING: &str = "qt4i-usbmuxd";
/// The libusbmuxd protocol revision this client speaks
const LIB_USBMUX_VERSION: u64 = 3;

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connected via USB
    Usb,
    /// Connected via network with specific IP address
    Network(IpAddr),
    /// Unknown connection type with description
    Unknown(String),
}

/// A device the multiplexer knows about
#[derive(Debug, Clone)]
pub struct MuxDevice {
    /// How the device is connected
    pub connection_type: Connection,
    /// Unique device identifier (serial)
    pub udid: String,
    /// Muxer-assigned id, not stable across re-attach
    pub device_id: u32,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    /// Opens a raw transport to the muxer
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, MuxdevError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Opens a short-lived muxer session
    ///
    /// # Arguments
    /// * `tag` - Frame tag echoed by the muxer
    /// * `label` - Program name reported with every request
    pub async fn connect(
        &self,
        tag: u32,
        label: impl Into<String>,
    ) -> Result<UsbmuxdConnection, MuxdevError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket, tag, label))
    }

    /// Creates a UsbmuxdAddr from the `USBMUXD_SOCKET_ADDRESS` environment
    /// variable, falling back to the platform default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// A short-lived connection to the multiplexer
///
/// Carries out one task (a query, or a tunnel to a device port) and is
/// consumed. Tunneled sockets transfer to the caller wholesale; nothing of
/// the muxer session survives that handoff.
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
    label: String,
}

impl UsbmuxdConnection {
    /// Connects using the platform default address
    pub async fn default(label: impl Into<String>) -> Result<Self, MuxdevError> {
        let socket = UsbmuxdAddr::default().to_socket().await?;
        Ok(Self::new(socket, 0, label))
    }

    pub fn new(socket: Box<dyn ReadWrite>, tag: u32, label: impl Into<String>) -> Self {
        Self {
            socket,
            tag,
            label: label.into(),
        }
    }

    /// Lists all devices the muxer currently knows about
    pub async fn get_devices(&mut self) -> Result<Vec<MuxDevice>, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res: des::ListDevicesResponse = plist::from_value(&plist::Value::Dictionary(res))?;

        res.device_list.into_iter().map(TryInto::try_into).collect()
    }

    /// Gets a specific device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<MuxDevice, MuxdevError> {
        let devices = self.get_devices().await?;
        match devices.into_iter().find(|x| x.udid == udid) {
            Some(d) => Ok(d),
            None => Err(MuxdevError::DeviceNotFound),
        }
    }

    /// Reads the pairing record the muxer holds for a device
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairRecord, MuxdevError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairRecord::from_bytes(d),
            // The muxer answers `Result`/`Number` when it has no record
            Some(_) => Err(MuxdevError::UnexpectedResponse),
            None => Err(MuxdevError::NoPairingRecord),
        }
    }

    /// Reads the system BUID; doubles as the handshake that proves the
    /// muxer speaks protocol version 1
    pub async fn get_buid(&mut self) -> Result<String, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Switches the connection into listen mode; the muxer will stream
    /// attach/detach events from now on
    pub(crate) async fn listen(&mut self) -> Result<(), MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        Self::check_result(&res)
    }

    /// Reads the next listen-mode event
    pub(crate) async fn read_event(&mut self) -> Result<des::MuxEvent, MuxdevError> {
        let res = self.read_plist().await?;
        des::MuxEvent::parse(res)
    }

    /// Tunnels to a TCP port on the device, consuming this connection
    ///
    /// On success the muxer socket becomes the device stream and is handed
    /// to the caller.
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<DeviceConnection, MuxdevError> {
        debug!("Connecting to device {device_id} on port {port}");
        // The muxer wants the 16-bit port byte-swapped into its LE field.
        // This is the historical wire quirk, not htons.
        let port = port.swap_bytes();

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        Self::check_result(&res)?;
        Ok(DeviceConnection::new(self.socket, label))
    }

    /// Tunnels to a device found in the monitor's registry
    ///
    /// Fails with `DeviceNotFound` before any muxer traffic when the UDID
    /// is not currently attached.
    pub async fn connect_thru(
        self,
        monitor: &DeviceMonitor,
        udid: &str,
        port: u16,
        label: impl Into<String>,
    ) -> Result<DeviceConnection, MuxdevError> {
        let device_id = monitor
            .get_device_id(udid)
            .ok_or(MuxdevError::DeviceNotFound)?;
        self.connect_to_device(device_id, port, label).await
    }

    fn check_result(res: &plist::Dictionary) -> Result<(), MuxdevError> {
        match res.get("Number").and_then(|x| x.as_unsigned_integer()) {
            Some(0) => Ok(()),
            Some(1) => Err(MuxdevError::MuxBadCommand),
            Some(2) => Err(MuxdevError::MuxBadDevice),
            Some(3) => Err(MuxdevError::MuxConnectionRefused),
            Some(6) => Err(MuxdevError::MuxBadVersion),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Writes a request frame, merging in the constant client preamble
    async fn write_plist(&mut self, mut req: plist::Dictionary) -> Result<(), MuxdevError> {
        req.insert("ClientVersionString".into(), CLIENT_VERSION_STRING.into());
        req.insert("ProgName".into(), self.label.clone().into());
        req.insert("kLibUSBMuxVersion".into(), LIB_USBMUX_VERSION.into());

        let raw = RawPacket::new(req, self.tag).serialize();
        self.socket.write_all(&raw).await?;

        Ok(())
    }

    /// Reads one frame from the muxer
    ///
    /// `read_exact` buffers short reads internally, so partial frames on
    /// the wire are reassembled before parsing.
    async fn read_plist(&mut self) -> Result<plist::Dictionary, MuxdevError> {
        let mut size_buffer = [0; 4];
        if let Err(e) = self.socket.read_exact(&mut size_buffer).await {
            return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Err(MuxdevError::PeerDisconnected)
            } else {
                Err(e.into())
            };
        }

        let packet_size = u32::from_le_bytes(size_buffer);
        if (packet_size as usize) < raw_packet::HEADER_LEN {
            return Err(MuxdevError::UnexpectedResponse);
        }
        debug!("Reading {packet_size} byte frame from muxer");

        let mut frame = vec![0; packet_size as usize];
        frame[..4].copy_from_slice(&size_buffer);
        self.socket.read_exact(&mut frame[4..]).await?;

        let packet = RawPacket::parse(&frame)?;
        debug!(
            "Read from muxer: {}",
            crate::pretty_print_dictionary(&packet.plist)
        );

        Ok(packet.plist)
    }
}

impl MuxDevice {
    /// Creates a provider pinned to this device's current muxer id
    pub fn to_provider(
        &self,
        addr: UsbmuxdAddr,
        label: impl Into<String>,
    ) -> crate::provider::UsbmuxdProvider {
        crate::provider::UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn port_is_byte_swapped() {
        // 62078 = 0xF27E must leave the host as 0x7EF2
        assert_eq!(62078u16.swap_bytes(), 0x7EF2);
    }
}
