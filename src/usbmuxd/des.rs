//! Serde views of the multiplexer's responses and listen-mode events

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::warn;
use serde::Deserialize;

use crate::MuxdevError;

use super::{Connection, MuxDevice};

#[derive(Deserialize)]
pub(crate) struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct DeviceEntry {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DeviceProperties,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct DeviceProperties {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

/// A message received while the connection is in listen mode
#[derive(Clone, Debug)]
pub(crate) enum MuxEvent {
    Attached(MuxDevice),
    Detached { device_id: u32 },
    /// Paired notifications and anything this crate has no use for
    Ignored,
}

impl MuxEvent {
    pub fn parse(mut dict: plist::Dictionary) -> Result<Self, MuxdevError> {
        let message_type = match dict.get("MessageType").and_then(|x| x.as_string()) {
            Some(m) => m.to_owned(),
            None => return Err(MuxdevError::UnexpectedResponse),
        };

        match message_type.as_str() {
            "Attached" => {
                let entry: DeviceEntry =
                    plist::from_value(&plist::Value::Dictionary(std::mem::take(&mut dict)))?;
                Ok(Self::Attached(entry.try_into()?))
            }
            "Detached" => match dict.get("DeviceID").and_then(|x| x.as_unsigned_integer()) {
                Some(device_id) => Ok(Self::Detached {
                    device_id: device_id as u32,
                }),
                None => Err(MuxdevError::UnexpectedResponse),
            },
            _ => Ok(Self::Ignored),
        }
    }
}

impl TryFrom<DeviceEntry> for MuxDevice {
    type Error = MuxdevError;

    fn try_from(dev: DeviceEntry) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "USB" => Connection::Usb,
            "Network" => match dev.properties.network_address {
                Some(addr) => network_address(&Into::<Vec<u8>>::into(addr))?,
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(MuxdevError::UnexpectedResponse);
                }
            },
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        Ok(MuxDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
        })
    }
}

/// Decodes the BSD sockaddr blob the muxer stores for network devices
fn network_address(addr: &[u8]) -> Result<Connection, MuxdevError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(MuxdevError::UnexpectedResponse);
    }

    match addr[0] {
        // sockaddr_in
        0x02 => Ok(Connection::Network(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        )))),
        // sockaddr_in6, either tagged by family or by structure length
        0x1E | 0x1C => {
            if addr.len() < 24 {
                warn!("IPv6 sockaddr data too short (len {})", addr.len());
                return Err(MuxdevError::UnexpectedResponse);
            }
            if addr[0] == 0x1C && addr[1] != 0x1E {
                warn!("Expected IPv6 family (0x1E), got {:02X}", addr[1]);
                return Ok(Connection::Unknown(format!("Network {:02X}", addr[1])));
            }
            let mut segments = [0u16; 8];
            for (i, segment) in segments.iter_mut().enumerate() {
                *segment = u16::from_be_bytes([addr[8 + 2 * i], addr[9 + 2 * i]]);
            }
            Ok(Connection::Network(IpAddr::V6(Ipv6Addr::from(segments))))
        }
        other => {
            warn!("Unknown IP address protocol: {other:02X}");
            Ok(Connection::Unknown(format!("Network {other:02X}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attached_dict(device_id: u32, serial: &str, connection_type: &str) -> plist::Dictionary {
        let mut properties = plist::Dictionary::new();
        properties.insert("ConnectionType".into(), connection_type.into());
        properties.insert("SerialNumber".into(), serial.into());
        properties.insert("DeviceID".into(), device_id.into());

        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "Attached".into());
        dict.insert("DeviceID".into(), device_id.into());
        dict.insert("Properties".into(), plist::Value::Dictionary(properties));
        dict
    }

    #[test]
    fn parses_usb_attach() {
        let event = MuxEvent::parse(attached_dict(7, "00008120-0018DEADC0DEFACE", "USB")).unwrap();
        match event {
            MuxEvent::Attached(dev) => {
                assert_eq!(dev.device_id, 7);
                assert_eq!(dev.udid, "00008120-0018DEADC0DEFACE");
                assert_eq!(dev.connection_type, Connection::Usb);
            }
            other => panic!("expected attach, got {other:?}"),
        }
    }

    #[test]
    fn parses_detach() {
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "Detached".into());
        dict.insert("DeviceID".into(), 7.into());
        match MuxEvent::parse(dict).unwrap() {
            MuxEvent::Detached { device_id } => assert_eq!(device_id, 7),
            other => panic!("expected detach, got {other:?}"),
        }
    }

    #[test]
    fn ipv4_sockaddr() {
        let mut blob = vec![0x02, 0x00, 0x00, 0x00];
        blob.extend_from_slice(&[192, 168, 1, 20]);
        blob.extend_from_slice(&[0; 8]);
        match network_address(&blob).unwrap() {
            Connection::Network(IpAddr::V4(v4)) => {
                assert_eq!(v4, Ipv4Addr::new(192, 168, 1, 20))
            }
            other => panic!("expected v4, got {other:?}"),
        }
    }
}
