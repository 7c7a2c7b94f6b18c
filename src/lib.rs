#![doc = include_str!("../README.md")]

pub mod pair_record;
pub mod provider;
mod tls;
pub mod tss;
pub mod usbmuxd;
mod util;

pub mod services;
pub use services::*;

use log::debug;
use rustls::{crypto::CryptoProvider, pki_types::ServerName};
use std::{
    io::{self, BufWriter},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::{
    pair_record::PairRecord, provider::ConnectionProvider, services::lockdown::LockdownClient,
};

pub use util::{pretty_print_dictionary, pretty_print_plist};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream and UnixStream implement this trait, as does the in-memory
/// duplex stream used by the test suites.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Interface for services reachable through lockdownd on an iOS device
///
/// Implementors name the service and wrap a ready stream; the provided
/// [`DeviceService::connect`] performs the full dial sequence: a transient
/// lockdown session, `StartService`, a fresh tunnel through the multiplexer
/// to the returned port, and an in-place TLS upgrade when the service
/// requires one.
pub trait DeviceService: Sized {
    /// Returns the service name as advertised by the device
    fn service_name() -> &'static str;

    /// Wraps an already-dialed stream for this service
    fn from_stream(
        connection: DeviceConnection,
    ) -> impl std::future::Future<Output = Result<Self, MuxdevError>> + Send;

    /// Establishes a connection to this service
    ///
    /// # Arguments
    /// * `provider` - The device provider that can supply connections
    fn connect(
        provider: &dyn ConnectionProvider,
    ) -> impl std::future::Future<Output = Result<Self, MuxdevError>> + Send {
        async {
            let mut lockdown = LockdownClient::connect(provider).await?;
            lockdown.start_session().await?;
            let (port, ssl) = lockdown.start_service(Self::service_name(), false).await?;
            // The device keeps the service listening after the lockdown
            // connection goes away.
            drop(lockdown);

            let mut connection = provider.connect(port).await?;
            if ssl {
                connection
                    .upgrade_to_tls(&provider.get_pair_record().await?)
                    .await?;
            }
            Self::from_stream(connection).await
        }
    }
}

/// The transport under a device connection: either the raw tunneled socket
/// or the same socket promoted to TLS with the pairing credentials.
///
/// Lockdown's `StopSession` demotes the TLS variant back to plain without
/// dropping the TCP connection, so the stream must be able to give its
/// inner socket back.
#[derive(Debug)]
pub enum DeviceStream {
    Plain(Box<dyn ReadWrite>),
    Tls(Box<tokio_rustls::client::TlsStream<Box<dyn ReadWrite>>>),
}

impl AsyncRead for DeviceStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DeviceStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            DeviceStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for DeviceStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            DeviceStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            DeviceStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DeviceStream::Plain(s) => Pin::new(s).poll_flush(cx),
            DeviceStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            DeviceStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            DeviceStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A dialed connection to a daemon on the device
///
/// Owns the socket, frames plist messages with a 4-byte big-endian length
/// prefix, and can promote itself to TLS in place (and back) using a
/// pairing record.
pub struct DeviceConnection {
    /// The underlying stream; `None` only mid-upgrade
    stream: Option<DeviceStream>,
    /// Label identifying this host to the device, sent with lockdown requests
    label: String,
}

impl DeviceConnection {
    /// Wraps an established socket
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            stream: Some(DeviceStream::Plain(socket)),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the connection is currently running over TLS
    pub fn is_encrypted(&self) -> bool {
        matches!(self.stream, Some(DeviceStream::Tls(_)))
    }

    /// Queries the daemon type on the other end of the connection
    pub async fn query_type(&mut self) -> Result<String, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "QueryType".into());
        self.send_plist(plist::Value::Dictionary(req)).await?;
        let res = self.read_plist().await?;
        match res.get("Type") {
            Some(t) => Ok(plist::from_value(t)?),
            None => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Sends a plist message, XML-encoded and length-prefixed
    pub(crate) async fn send_plist(&mut self, message: plist::Value) -> Result<(), MuxdevError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(MuxdevError::NoEstablishedConnection)?;
        debug!("Sending plist: {}", pretty_print_plist(&message));

        let buf = Vec::new();
        let mut writer = BufWriter::new(buf);
        message.to_writer_xml(&mut writer)?;
        let message = writer
            .into_inner()
            .map_err(|e| MuxdevError::InternalError(e.to_string()))?;
        let len = message.len() as u32;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&message).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads a length-prefixed plist message
    ///
    /// Device-reported `Error` strings are mapped to typed errors where
    /// known and surfaced verbatim otherwise.
    pub(crate) async fn read_plist(&mut self) -> Result<plist::Dictionary, MuxdevError> {
        let mut buf = [0u8; 4];
        self.read_exact_mapped(&mut buf).await?;
        let len = u32::from_be_bytes(buf);
        let mut buf = vec![0; len as usize];
        self.read_exact_mapped(&mut buf).await?;
        let res: plist::Dictionary = plist::from_bytes(&buf)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));

        if let Some(e) = res.get("Error") {
            let e: String = plist::from_value(e)?;
            return match MuxdevError::from_device_error_type(e.as_str(), &res) {
                Some(e) => Err(e),
                None => Err(MuxdevError::UnknownErrorType(e)),
            };
        }
        Ok(res)
    }

    /// Sends raw bytes down the stream
    pub(crate) async fn send_raw(&mut self, message: &[u8]) -> Result<(), MuxdevError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(MuxdevError::NoEstablishedConnection)?;
        stream.write_all(message).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` bytes
    pub(crate) async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, MuxdevError> {
        let mut buf = vec![0; len];
        self.read_exact_mapped(&mut buf).await?;
        Ok(buf)
    }

    /// Reads up to `max_size` bytes, returning whatever arrived first.
    /// An empty result means the peer closed the stream.
    pub(crate) async fn read_any(&mut self, max_size: usize) -> Result<Vec<u8>, MuxdevError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(MuxdevError::NoEstablishedConnection)?;
        let mut buf = vec![0; max_size];
        let len = stream.read(&mut buf).await?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn read_exact_mapped(&mut self, buf: &mut [u8]) -> Result<(), MuxdevError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or(MuxdevError::NoEstablishedConnection)?;
        match stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(MuxdevError::PeerDisconnected),
            Err(e) => Err(e.into()),
        }
    }

    /// Promotes the live socket to TLS using the pairing credentials
    ///
    /// The same TCP connection keeps carrying the session; nothing is
    /// redialed. The device presents a self-signed certificate, so peer
    /// verification is disabled and authenticity rests on the pairing.
    pub async fn upgrade_to_tls(&mut self, pair_record: &PairRecord) -> Result<(), MuxdevError> {
        if CryptoProvider::get_default().is_none() {
            if let Err(e) =
                CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
            {
                // Another caller may have won the install race; rustls then
                // reports an error even though a provider is in place.
                log::error!("Failed to set crypto provider: {e:?}");
            }
        }
        let config = tls::client_config(pair_record)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let socket = match self.stream.take() {
            Some(DeviceStream::Plain(socket)) => socket,
            Some(tls @ DeviceStream::Tls(_)) => {
                self.stream = Some(tls);
                return Err(MuxdevError::SessionAlreadyActive);
            }
            None => return Err(MuxdevError::NoEstablishedConnection),
        };
        let server_name = ServerName::try_from("Device").expect("static name is valid");
        let socket = connector.connect(server_name, socket).await?;

        self.stream = Some(DeviceStream::Tls(Box::new(socket)));
        Ok(())
    }

    /// Takes the stream out of the connection
    ///
    /// For components that run their own read loop (the web inspector
    /// splits the stream into halves) rather than the request/reply
    /// helpers here.
    pub fn into_stream(self) -> Result<DeviceStream, MuxdevError> {
        self.stream.ok_or(MuxdevError::NoEstablishedConnection)
    }

    /// Drops the TLS layer and resumes plain framing on the same socket
    ///
    /// The underlying TCP connection stays open and usable; lockdown relies
    /// on this after `StopSession`.
    pub fn downgrade_to_plain(&mut self) -> Result<(), MuxdevError> {
        match self.stream.take() {
            Some(DeviceStream::Tls(tls)) => {
                let (socket, _) = tls.into_inner();
                self.stream = Some(DeviceStream::Plain(socket));
                Ok(())
            }
            other => {
                self.stream = other;
                Err(MuxdevError::SessionInactive)
            }
        }
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("label", &self.label)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MuxdevError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("peer closed the connection")]
    PeerDisconnected,
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error),
    #[error("TLS error")]
    Tls(#[from] rustls::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("JSON serialization failed")]
    Json(#[from] serde_json::Error),
    #[error("http request failed")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("muxer spoke protocol version {0}, expected 1")]
    InvalidProtocolVersion(u32),
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("no pairing record for this device")]
    NoPairingRecord,
    #[error("no session is active")]
    NoSession,
    #[error("a session is already active")]
    SessionAlreadyActive,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("device does not recognize the host pairing")]
    InvalidHostID,
    #[error("device is locked")]
    DeviceLocked,
    #[error("device not found")]
    DeviceNotFound,
    #[error("not found")]
    NotFound,
    #[error("operation timed out")]
    Timeout,
    #[error("bad command")]
    MuxBadCommand,
    #[error("bad device")]
    MuxBadDevice,
    #[error("muxer refused the connection")]
    MuxConnectionRefused,
    #[error("muxer version mismatch")]
    MuxBadVersion,
    #[error("afc error: {0}")]
    Afc(#[from] afc::errors::AfcError),
    #[error("unknown afc opcode {0}")]
    UnknownAfcOpcode(u64),
    #[error("invalid afc magic")]
    InvalidAfcMagic,
    #[error("missing file attribute")]
    AfcMissingAttribute,
    #[error("crash report mover sent the wrong response")]
    CrashReportMoverBadResponse(Vec<u8>),
    #[error("bad build manifest")]
    BadBuildManifest,
    #[error("image not mounted")]
    ImageNotMounted,
    #[error("automation is not available on this device")]
    NoAutomation,
    #[error("automation request failed: {0}")]
    Automation(String),
    #[error("web inspector session entered the failed state")]
    SessionFailed,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),
}

impl MuxdevError {
    /// Converts a device-reported error string to a typed error
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Option<Self> {
        match e {
            "GetProhibited" => Some(Self::GetProhibited),
            "InvalidHostID" => Some(Self::InvalidHostID),
            "SessionInactive" => Some(Self::SessionInactive),
            "DeviceLocked" => Some(Self::DeviceLocked),
            "InternalError" => {
                let detailed_error = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();

                if detailed_error.contains("There is no matching entry in the device map for") {
                    Some(Self::ImageNotMounted)
                } else {
                    Some(Self::InternalError(detailed_error))
                }
            }
            _ => None,
        }
    }
}
