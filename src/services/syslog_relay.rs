//! Raw syslog stream
//!
//! The relay pushes `\n\0`-delimited log lines for as long as the
//! connection stays up. Lines are surfaced verbatim; parsing them is the
//! caller's business.

use bytes::BytesMut;

use crate::{DeviceConnection, DeviceService, MuxdevError};

const LINE_DELIMITER: &[u8] = b"\n\x00";

/// Client for the device's syslog relay
pub struct SyslogRelayClient {
    /// The underlying device connection with established service
    pub connection: DeviceConnection,
    /// Bytes read past the last delimiter, kept for the next line
    buffer: BytesMut,
}

impl DeviceService for SyslogRelayClient {
    fn service_name() -> &'static str {
        "com.apple.syslog_relay"
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MuxdevError> {
        Ok(Self::new(connection))
    }
}

impl SyslogRelayClient {
    /// Creates a new client from an existing device connection
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            buffer: BytesMut::with_capacity(1024),
        }
    }

    /// Get the next log line from the relay
    ///
    /// # Errors
    /// `PeerDisconnected` when the service sends an EOF and nothing is
    /// buffered; a partial trailing line is returned before that.
    pub async fn next(&mut self) -> Result<String, MuxdevError> {
        loop {
            if let Some(pos) = self
                .buffer
                .windows(LINE_DELIMITER.len())
                .position(|w| w == LINE_DELIMITER)
            {
                let mut line = self.buffer.split_to(pos + LINE_DELIMITER.len());
                line.truncate(line.len() - LINE_DELIMITER.len());
                return Ok(String::from_utf8_lossy(&line).to_string());
            }

            let chunk = self.connection.read_any(1024).await?;
            if chunk.is_empty() {
                if self.buffer.is_empty() {
                    return Err(MuxdevError::PeerDisconnected);
                }
                let line = self.buffer.split_to(self.buffer.len());
                return Ok(String::from_utf8_lossy(&line).to_string());
            }
            self.buffer.extend_from_slice(&chunk);
        }
    }
}
