//! Lockdown session state machine
//!
//! lockdownd is the device's configuration daemon and service launcher: it
//! answers `GetValue` queries, authenticates the host via `StartSession`
//! (after which the live socket is promoted to TLS in place) and starts
//! on-device services with `StartService`, returning the port to tunnel to.

use log::{error, warn};
use plist::Value;

use crate::{pair_record::PairRecord, DeviceConnection, MuxdevError};

/// Client for the device's lockdown daemon
///
/// Carries the session state: an optional pairing record (fetched at
/// connect time, absence tolerated until `start_session`) and the id of
/// the active session, if any.
pub struct LockdownClient {
    /// The underlying device connection, plain or TLS
    pub connection: DeviceConnection,
    pair_record: Option<PairRecord>,
    session_id: Option<String>,
}

impl LockdownClient {
    /// The fixed TCP port lockdownd listens on
    pub const LOCKDOWND_PORT: u16 = 62078;

    /// Dials lockdownd through the provider and fetches the pairing record
    ///
    /// A missing pairing record is not an error here; `start_session` will
    /// refuse later with `NoPairingRecord`.
    pub async fn connect(
        provider: &dyn crate::provider::ConnectionProvider,
    ) -> Result<Self, MuxdevError> {
        let connection = provider.connect(Self::LOCKDOWND_PORT).await?;
        let pair_record = match provider.get_pair_record().await {
            Ok(p) => Some(p),
            Err(MuxdevError::NoPairingRecord) => None,
            Err(e) => {
                warn!("Could not fetch pairing record: {e}");
                None
            }
        };
        Ok(Self::new(connection, pair_record))
    }

    /// Wraps an existing connection to lockdownd
    pub fn new(connection: DeviceConnection, pair_record: Option<PairRecord>) -> Self {
        Self {
            connection,
            pair_record,
            session_id: None,
        }
    }

    /// The id of the active session, if one was started
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Retrieves a value from the device
    ///
    /// # Arguments
    /// * `key` - The value to retrieve (e.g. "ProductVersion"); `None`
    ///   returns the whole domain
    /// * `domain` - An optional domain to query
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), "GetValue".into());
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let mut res = self.connection.read_plist().await?;
        match res.remove("Value") {
            Some(v) => Ok(v),
            None => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Retrieves all values in the default domain
    pub async fn get_all_values(&mut self) -> Result<plist::Dictionary, MuxdevError> {
        match self.get_value(None, None).await? {
            Value::Dictionary(d) => Ok(d),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Authenticates with the pairing record and starts a session
    ///
    /// When the device asks for it (`EnableSessionSSL`), the live socket is
    /// upgraded to TLS in place; either way the `SessionID` is stored.
    pub async fn start_session(&mut self) -> Result<(), MuxdevError> {
        if self.session_id.is_some() {
            return Err(MuxdevError::SessionAlreadyActive);
        }
        let pair_record = self
            .pair_record
            .clone()
            .ok_or(MuxdevError::NoPairingRecord)?;

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), "StartSession".into());
        req.insert("HostID".into(), pair_record.host_id.clone().into());
        req.insert("SystemBUID".into(), pair_record.system_buid.clone().into());
        self.connection.send_plist(Value::Dictionary(req)).await?;

        let response = self.connection.read_plist().await?;
        let session_id = match response.get("SessionID").and_then(|x| x.as_string()) {
            Some(id) => id.to_owned(),
            None => {
                error!("StartSession reply carried no SessionID");
                return Err(MuxdevError::UnexpectedResponse);
            }
        };
        let ssl = match response.get("EnableSessionSSL") {
            Some(Value::Boolean(enable)) => *enable,
            _ => {
                error!("StartSession reply carried no EnableSessionSSL flag");
                return Err(MuxdevError::UnexpectedResponse);
            }
        };

        if ssl {
            self.connection.upgrade_to_tls(&pair_record).await?;
        }
        self.session_id = Some(session_id);
        Ok(())
    }

    /// Ends the active session
    ///
    /// The TLS layer (if one was negotiated) is dropped, but the underlying
    /// TCP socket stays open and keeps speaking length-prefixed plists.
    pub async fn stop_session(&mut self) -> Result<(), MuxdevError> {
        let session_id = match &self.session_id {
            Some(id) => id.clone(),
            None => return Err(MuxdevError::NoSession),
        };

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), "StopSession".into());
        req.insert("SessionID".into(), session_id.into());
        self.connection.send_plist(Value::Dictionary(req)).await?;
        self.connection.read_plist().await?;

        if self.connection.is_encrypted() {
            self.connection.downgrade_to_plain()?;
        }
        self.session_id = None;
        Ok(())
    }

    /// Asks lockdownd to start a service on the device
    ///
    /// Requires an active session. When `escrow` is set the pairing
    /// record's escrow bag is attached so the service can operate while
    /// the device is locked.
    ///
    /// # Returns
    /// The port the service listens on and whether the tunneled stream
    /// must be upgraded to TLS.
    pub async fn start_service(
        &mut self,
        identifier: &str,
        escrow: bool,
    ) -> Result<(u16, bool), MuxdevError> {
        if self.session_id.is_none() {
            return Err(MuxdevError::NoSession);
        }

        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.connection.label().into());
        req.insert("Request".into(), "StartService".into());
        req.insert("Service".into(), identifier.into());
        if escrow {
            match self.pair_record.as_ref().and_then(|p| p.escrow_bag.clone()) {
                Some(bag) => {
                    req.insert("EscrowBag".into(), Value::Data(bag));
                }
                None => warn!("Escrow requested, but the pairing record has no escrow bag"),
            }
        }
        self.connection.send_plist(Value::Dictionary(req)).await?;
        let response = self.connection.read_plist().await?;

        if let Some(service) = response.get("Service").and_then(|x| x.as_string()) {
            if service != identifier {
                error!("StartService reply names service {service}, requested {identifier}");
                return Err(MuxdevError::UnexpectedResponse);
            }
        }

        let ssl = match response.get("EnableServiceSSL") {
            Some(Value::Boolean(ssl)) => ssl.to_owned(),
            _ => false, // over USB, this option won't exist
        };

        match response.get("Port") {
            Some(Value::Integer(port)) => {
                if let Some(port) = port.as_unsigned() {
                    Ok((port as u16, ssl))
                } else {
                    error!("Port isn't an unsigned integer!");
                    Err(MuxdevError::UnexpectedResponse)
                }
            }
            _ => {
                error!("Response didn't contain an integer port");
                Err(MuxdevError::UnexpectedResponse)
            }
        }
    }
}

impl std::fmt::Debug for LockdownClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockdownClient")
            .field("connection", &self.connection)
            .field("session_id", &self.session_id)
            .finish()
    }
}
