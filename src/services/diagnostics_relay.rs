//! Diagnostics relay
//!
//! Single-shot power controls (restart, shutdown, sleep) and IORegistry
//! queries over `com.apple.mobile.diagnostics_relay`.

use crate::{DeviceConnection, DeviceService, MuxdevError};

/// Client for the diagnostics relay
pub struct DiagnosticsRelayClient {
    /// The underlying device connection with established service
    pub connection: DeviceConnection,
}

impl DeviceService for DiagnosticsRelayClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.diagnostics_relay"
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MuxdevError> {
        Ok(Self::new(connection))
    }
}

impl DiagnosticsRelayClient {
    /// Creates a new client from an existing device connection
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Reboots the device
    pub async fn restart(&mut self) -> Result<(), MuxdevError> {
        self.simple_request("Restart").await
    }

    /// Powers the device off
    pub async fn shutdown(&mut self) -> Result<(), MuxdevError> {
        self.simple_request("Shutdown").await
    }

    /// Puts the device to sleep
    pub async fn sleep(&mut self) -> Result<(), MuxdevError> {
        self.simple_request("Sleep").await
    }

    /// Requests data from the IO registry
    ///
    /// # Arguments
    /// * `current_plane` - The plane to request the tree as
    /// * `entry_name` - The entry to get
    /// * `entry_class` - The class to filter by
    ///
    /// # Returns
    /// The registry tree, when the device included one
    pub async fn ioregistry(
        &mut self,
        current_plane: Option<&str>,
        entry_name: Option<&str>,
        entry_class: Option<&str>,
    ) -> Result<Option<plist::Dictionary>, MuxdevError> {
        let mut req = plist::Dictionary::new();
        if let Some(plane) = current_plane {
            req.insert("CurrentPlane".into(), plane.into());
        }
        if let Some(name) = entry_name {
            req.insert("EntryName".into(), name.into());
        }
        if let Some(class) = entry_class {
            req.insert("EntryClass".into(), class.into());
        }
        req.insert("Request".into(), "IORegistry".into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;
        let mut res = self.connection.read_plist().await?;
        Self::check_status(&res)?;

        let res = res
            .remove("Diagnostics")
            .and_then(|x| x.into_dictionary())
            .and_then(|mut x| x.remove("IORegistry"))
            .and_then(|x| x.into_dictionary());

        Ok(res)
    }

    async fn simple_request(&mut self, request: &str) -> Result<(), MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Request".into(), request.into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;
        let res = self.connection.read_plist().await?;
        Self::check_status(&res)
    }

    fn check_status(res: &plist::Dictionary) -> Result<(), MuxdevError> {
        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Success") => Ok(()),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }
}
