//! AFC packet framing
//!
//! Every packet starts with a 40-byte header of five u64 LE fields:
//! magic (`CFA6LPAA`), the entire packet length, the length of header plus
//! header payload, a sequence number and the operation code. File writes
//! put the bulk bytes after the header payload, so `this_len` and
//! `total_len` diverge there.

use log::debug;

use crate::{DeviceConnection, MuxdevError};

use super::opcode::AfcOpcode;

#[derive(Clone, Debug)]
pub struct AfcPacketHeader {
    pub magic: u64,
    /// Length of the entire packet, header included
    pub total_len: u64,
    /// Header length plus the header payload; bulk data follows up to
    /// `total_len`
    pub this_len: u64,
    pub sequence_number: u64,
    pub op: AfcOpcode,
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(Self::LEN as usize);

        res.extend_from_slice(&self.magic.to_le_bytes());
        res.extend_from_slice(&self.total_len.to_le_bytes());
        res.extend_from_slice(&self.this_len.to_le_bytes());
        res.extend_from_slice(&self.sequence_number.to_le_bytes());
        res.extend_from_slice(&(self.op as u64).to_le_bytes());

        res
    }

    pub async fn read(reader: &mut DeviceConnection) -> Result<Self, MuxdevError> {
        let header_bytes = reader.read_raw(Self::LEN as usize).await?;
        let mut chunks = header_bytes.chunks_exact(8);
        let mut next = || {
            u64::from_le_bytes(
                chunks
                    .next()
                    .expect("header is 40 bytes")
                    .try_into()
                    .expect("chunked by 8"),
            )
        };

        let magic = next();
        let total_len = next();
        let this_len = next();
        let sequence_number = next();
        let op = next();

        if magic != super::MAGIC {
            return Err(MuxdevError::InvalidAfcMagic);
        }
        if this_len < Self::LEN || total_len < this_len {
            return Err(MuxdevError::UnexpectedResponse);
        }
        let op = AfcOpcode::try_from(op).map_err(MuxdevError::UnknownAfcOpcode)?;

        Ok(Self {
            magic,
            total_len,
            this_len,
            sequence_number,
            op,
        })
    }
}

impl AfcPacket {
    pub fn serialize(&self) -> Vec<u8> {
        let mut res = Vec::new();

        res.extend_from_slice(&self.header.serialize());
        res.extend_from_slice(&self.header_payload);
        res.extend_from_slice(&self.payload);

        res
    }

    pub async fn read(reader: &mut DeviceConnection) -> Result<Self, MuxdevError> {
        let header = AfcPacketHeader::read(reader).await?;
        debug!("afc header: {header:?}");
        let header_payload = reader
            .read_raw((header.this_len - AfcPacketHeader::LEN) as usize)
            .await?;

        let payload = if header.this_len == header.total_len {
            Vec::new() // no bulk segment
        } else {
            reader
                .read_raw((header.total_len - header.this_len) as usize)
                .await?
        };

        Ok(Self {
            header,
            header_payload,
            payload,
        })
    }
}
