//! The multiplexer's frame format
//!
//! `{u32 total_length, u32 protocol_version, u32 message_type, u32 tag}`
//! little-endian, followed by an XML plist payload. `total_length` counts
//! itself.

use crate::MuxdevError;

/// Everything sent and received in this crate is version 1, plist framed
pub(crate) const XML_PLIST_VERSION: u32 = 1;
pub(crate) const PLIST_MESSAGE_TYPE: u32 = 8;

pub(crate) const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawPacket {
    pub protocol_version: u32,
    pub message_type: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

impl RawPacket {
    pub fn new(plist: plist::Dictionary, tag: u32) -> Self {
        Self {
            protocol_version: XML_PLIST_VERSION,
            message_type: PLIST_MESSAGE_TYPE,
            tag,
            plist,
        }
    }

    /// Serializes the full frame, length prefix included
    pub fn serialize(&self) -> Vec<u8> {
        let payload = crate::util::plist_to_xml_bytes(&self.plist);
        let size = (HEADER_LEN + payload.len()) as u32;

        let mut res = Vec::with_capacity(size as usize);
        res.extend_from_slice(&size.to_le_bytes());
        res.extend_from_slice(&self.protocol_version.to_le_bytes());
        res.extend_from_slice(&self.message_type.to_le_bytes());
        res.extend_from_slice(&self.tag.to_le_bytes());
        res.extend_from_slice(&payload);
        res
    }

    /// Parses a full frame, asserting the protocol version and message type
    pub fn parse(frame: &[u8]) -> Result<Self, MuxdevError> {
        if frame.len() < HEADER_LEN {
            return Err(MuxdevError::UnexpectedResponse);
        }
        let size = u32::from_le_bytes(frame[0..4].try_into().expect("sliced to 4"));
        if size as usize != frame.len() {
            return Err(MuxdevError::UnexpectedResponse);
        }
        let protocol_version = u32::from_le_bytes(frame[4..8].try_into().expect("sliced to 4"));
        if protocol_version != XML_PLIST_VERSION {
            return Err(MuxdevError::InvalidProtocolVersion(protocol_version));
        }
        let message_type = u32::from_le_bytes(frame[8..12].try_into().expect("sliced to 4"));
        if message_type != PLIST_MESSAGE_TYPE {
            return Err(MuxdevError::UnexpectedResponse);
        }
        let tag = u32::from_le_bytes(frame[12..16].try_into().expect("sliced to 4"));
        let plist = plist::from_bytes(&frame[HEADER_LEN..])?;

        Ok(Self {
            protocol_version,
            message_type,
            tag,
            plist,
        })
    }
}
