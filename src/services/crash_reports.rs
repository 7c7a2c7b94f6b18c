//! Crash log retrieval
//!
//! `com.apple.crashreportcopymobile` exposes the crash report directory
//! over the AFC protocol. A companion one-shot service,
//! `com.apple.crashreportmover`, flushes pending logs out of system
//! storage into that directory first.

use log::{debug, warn};

use crate::{
    afc::{opcode::OpenMode, AfcClient},
    lockdown::LockdownClient,
    provider::ConnectionProvider,
    DeviceConnection, DeviceService, MuxdevError,
};

/// Client for copying crash logs off a device
pub struct CrashReportClient {
    /// AFC client rooted at the crash report directory
    pub afc: AfcClient,
}

impl DeviceService for CrashReportClient {
    fn service_name() -> &'static str {
        "com.apple.crashreportcopymobile"
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MuxdevError> {
        Ok(Self::new(connection))
    }
}

impl CrashReportClient {
    /// Creates a new client from an existing device connection
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            afc: AfcClient::new(connection),
        }
    }

    /// Lists crash report files under a directory (default `/`)
    pub async fn ls(&mut self, dir_path: Option<&str>) -> Result<Vec<String>, MuxdevError> {
        self.afc.list_dir(dir_path.unwrap_or("/")).await
    }

    /// Retrieves the contents of a crash log
    pub async fn pull(&mut self, log: &str) -> Result<Vec<u8>, MuxdevError> {
        let mut f = self
            .afc
            .open(&format!("/{log}"), OpenMode::ReadOnly)
            .await?;
        let contents = f.read_all().await?;
        f.close().await?;
        Ok(contents)
    }

    /// Pulls every regular file under `dir_path` (default `/`)
    ///
    /// # Returns
    /// `(path, contents)` pairs, sorted by path
    pub async fn pull_all(
        &mut self,
        dir_path: Option<&str>,
    ) -> Result<Vec<(String, Vec<u8>)>, MuxdevError> {
        let mut reports = Vec::new();
        for path in self.afc.walk(dir_path.unwrap_or("/")).await? {
            let mut f = self.afc.open(&path, OpenMode::ReadOnly).await?;
            let contents = f.read_all().await?;
            f.close().await?;
            reports.push((path, contents));
        }
        Ok(reports)
    }

    /// Removes a crash log from the device
    pub async fn remove(&mut self, log: &str) -> Result<(), MuxdevError> {
        self.afc.remove(&format!("/{log}")).await
    }

    /// Consumes this client and returns the inner AFC client
    pub fn into_afc(self) -> AfcClient {
        self.afc
    }
}

const EXPECTED_FLUSH: [u8; 4] = [0x70, 0x69, 0x6E, 0x67]; // 'ping'

/// Triggers a flush of crash logs from system storage
///
/// Connects to `com.apple.crashreportmover`, which moves crash logs into
/// the AFC-accessible directory and answers with a literal `ping`.
pub async fn flush_crash_reports(provider: &dyn ConnectionProvider) -> Result<(), MuxdevError> {
    let mut lockdown = LockdownClient::connect(provider).await?;
    lockdown.start_session().await?;

    let (port, ssl) = lockdown
        .start_service("com.apple.crashreportmover", false)
        .await?;
    drop(lockdown);

    let mut connection = provider.connect(port).await?;
    if ssl {
        connection
            .upgrade_to_tls(&provider.get_pair_record().await?)
            .await?;
    }

    let res = connection.read_raw(4).await?;
    debug!(
        "Flush reports response: {:?}",
        String::from_utf8_lossy(&res)
    );

    if res[..4] == EXPECTED_FLUSH {
        Ok(())
    } else {
        warn!("crashreportmover sent wrong bytes: {res:02X?}");
        Err(MuxdevError::CrashReportMoverBadResponse(res))
    }
}
