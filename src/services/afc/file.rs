//! Open file handles on the device

use std::io::SeekFrom;

use crate::MuxdevError;

use super::opcode::AfcOpcode;

/// The daemon caps a single read; larger requests are clamped
const MAX_READ: u64 = 4 * 1024 * 1024;
/// Write chunk size
const MAX_TRANSFER: u64 = 64 * 1024;

/// Handle for an open file on the device.
/// Call close before dropping
pub struct FileDescriptor<'a> {
    pub(crate) client: &'a mut super::AfcClient,
    pub(crate) fd: u64,
    pub(crate) path: String,
}

impl FileDescriptor<'_> {
    /// Reads up to `size` bytes from the current position
    ///
    /// `size` is clamped to 4 MiB per request; the reply may be shorter
    /// at end of file.
    pub async fn read(&mut self, size: u64) -> Result<Vec<u8>, MuxdevError> {
        let size = size.min(MAX_READ);
        let mut header_payload = self.fd.to_le_bytes().to_vec();
        header_payload.extend_from_slice(&size.to_le_bytes());

        let res = self
            .client
            .request(AfcOpcode::FileRead, header_payload, Vec::new())
            .await?;
        Ok(res.payload)
    }

    /// Reads the remainder of the file from the current position
    pub async fn read_all(&mut self) -> Result<Vec<u8>, MuxdevError> {
        let seek_pos = self.seek_tell().await? as usize;
        let size = self.client.get_file_info(&self.path).await?.size;
        let mut bytes_left = size.saturating_sub(seek_pos);
        let mut collected = Vec::with_capacity(bytes_left);

        while bytes_left > 0 {
            let chunk = self.read(bytes_left as u64).await?;
            if chunk.is_empty() {
                break; // file shrank under us
            }
            bytes_left = bytes_left.saturating_sub(chunk.len());
            collected.extend(chunk);
        }

        Ok(collected)
    }

    /// Writes data at the current position
    ///
    /// The bulk bytes ride in the same frame window as the file handle:
    /// `this_len` covers header plus handle, `total_len` the chunk too.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), MuxdevError> {
        for chunk in bytes.chunks(MAX_TRANSFER as usize) {
            let header_payload = self.fd.to_le_bytes().to_vec();
            self.client
                .request(AfcOpcode::FileWrite, header_payload, chunk.to_vec())
                .await?;
        }
        Ok(())
    }

    /// Returns the current cursor position
    pub async fn seek_tell(&mut self) -> Result<u64, MuxdevError> {
        let header_payload = self.fd.to_le_bytes().to_vec();
        let res = self
            .client
            .request(AfcOpcode::FileTell, header_payload, Vec::new())
            .await?;

        if res.header_payload.len() < 8 {
            return Err(MuxdevError::UnexpectedResponse);
        }
        Ok(u64::from_le_bytes(
            res.header_payload[..8].try_into().expect("sliced to 8"),
        ))
    }

    /// Moves the cursor
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<(), MuxdevError> {
        let (offset, whence) = match pos {
            SeekFrom::Start(off) => (off as i64, 0u64),
            SeekFrom::Current(off) => (off, 1),
            SeekFrom::End(off) => (off, 2),
        };

        let mut header_payload = self.fd.to_le_bytes().to_vec();
        header_payload.extend_from_slice(&whence.to_le_bytes());
        header_payload.extend_from_slice(&offset.to_le_bytes());

        self.client
            .request(AfcOpcode::FileSeek, header_payload, Vec::new())
            .await?;
        Ok(())
    }

    /// Closes the file on the device
    pub async fn close(self) -> Result<(), MuxdevError> {
        let header_payload = self.fd.to_le_bytes().to_vec();
        self.client
            .request(AfcOpcode::FileClose, header_payload, Vec::new())
            .await?;
        Ok(())
    }
}
