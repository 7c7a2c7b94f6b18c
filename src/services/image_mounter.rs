//! Developer disk image mounting
//!
//! Pre-iOS 17 images are uploaded with a detached signature and mounted as
//! `Developer`. iOS 17 and later require a personalized image: the host
//! fetches the device's personalization identifiers and nonce, has Apple's
//! signing server countersign the build manifest, and mounts the image as
//! `Personalized` together with its trust cache.

use log::{debug, error, warn};
use sha2::{Digest, Sha384};

use crate::{tss::TssRequest, DeviceConnection, DeviceService, MuxdevError};

/// Client for the mobile image mounter service
pub struct ImageMounterClient {
    /// The underlying device connection with established service
    pub connection: DeviceConnection,
}

impl DeviceService for ImageMounterClient {
    fn service_name() -> &'static str {
        "com.apple.mobile.mobile_image_mounter"
    }

    async fn from_stream(connection: DeviceConnection) -> Result<Self, MuxdevError> {
        Ok(Self::new(connection))
    }
}

impl ImageMounterClient {
    /// Creates a new image mounter client from an existing device connection
    pub fn new(connection: DeviceConnection) -> Self {
        Self { connection }
    }

    /// Retrieves a list of currently mounted images
    pub async fn copy_devices(&mut self) -> Result<Vec<plist::Value>, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "CopyDevices".into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;
        let mut res = self.connection.read_plist().await?;

        match res.remove("EntryList") {
            Some(plist::Value::Array(i)) => Ok(i),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Looks up an image by type and returns its signature
    ///
    /// # Errors
    /// `NotFound` if no such image is mounted
    pub async fn lookup_image(&mut self, image_type: &str) -> Result<Vec<u8>, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "LookupImage".into());
        req.insert("ImageType".into(), image_type.into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let mut res = self.connection.read_plist().await?;
        match res.remove("ImageSignature") {
            Some(plist::Value::Data(signature)) => Ok(signature),
            _ => Err(MuxdevError::NotFound),
        }
    }

    /// Uploads an image to the device
    ///
    /// `ReceiveBytes` is acknowledged with `ReceiveBytesAck`, after which
    /// the raw image bytes go down the same stream unframed; the daemon
    /// then reports `Complete`.
    pub async fn upload_image(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: Vec<u8>,
    ) -> Result<(), MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "ReceiveBytes".into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImageSize".into(), (image.len() as u64).into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature));
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let res = self.connection.read_plist().await?;
        match res.get("Status").and_then(|x| x.as_string()) {
            Some("ReceiveBytesAck") => {}
            other => {
                error!("Received bad response to ReceiveBytes: {other:?}");
                return Err(MuxdevError::UnexpectedResponse);
            }
        }

        self.connection.send_raw(image).await?;

        let res = self.connection.read_plist().await?;
        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") => Ok(()),
            other => {
                error!("Image upload failed: {other:?}");
                Err(MuxdevError::UnexpectedResponse)
            }
        }
    }

    /// Mounts a previously uploaded image
    pub async fn mount_image(
        &mut self,
        image_type: &str,
        signature: Vec<u8>,
        trust_cache: Option<Vec<u8>>,
        info_plist: Option<plist::Value>,
    ) -> Result<(), MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "MountImage".into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature));
        if let Some(trust_cache) = trust_cache {
            req.insert("ImageTrustCache".into(), plist::Value::Data(trust_cache));
        }
        if let Some(info) = info_plist {
            req.insert("ImageInfoPlist".into(), info);
        }
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let res = self.connection.read_plist().await?;
        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") | Some("Success") => Ok(()),
            other => {
                error!("Image mount failed: {other:?}");
                Err(MuxdevError::UnexpectedResponse)
            }
        }
    }

    /// Unmounts an image at a specified path.
    /// Use `/Developer` for pre-iOS 17 developer images.
    /// Use `/System/Developer` for personalized images.
    pub async fn unmount_image(&mut self, mount_path: &str) -> Result<(), MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "UnmountImage".into());
        req.insert("MountPath".into(), mount_path.into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let res = self.connection.read_plist().await?;
        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") => Ok(()),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Queries the personalization manifest the device already holds for
    /// an image.
    ///
    /// `signature` is the SHA-384 digest of the image. On failure the
    /// daemon closes the connection, so the caller must redial before the
    /// next command.
    pub async fn query_personalization_manifest(
        &mut self,
        image_type: &str,
        signature: Vec<u8>,
    ) -> Result<Vec<u8>, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "QueryPersonalizationManifest".into());
        req.insert("PersonalizedImageType".into(), image_type.into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature));
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let mut res = self.connection.read_plist().await?;
        match res.remove("ImageSignature") {
            Some(plist::Value::Data(manifest)) => Ok(manifest),
            _ => Err(MuxdevError::NotFound),
        }
    }

    pub async fn query_developer_mode_status(&mut self) -> Result<bool, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "QueryDeveloperModeStatus".into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let res = self.connection.read_plist().await?;
        match res.get("DeveloperModeStatus") {
            Some(plist::Value::Boolean(status)) => Ok(*status),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Fetches the personalization nonce the signing request must carry
    pub async fn query_nonce(
        &mut self,
        personalized_image_type: Option<&str>,
    ) -> Result<Vec<u8>, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "QueryNonce".into());
        if let Some(image_type) = personalized_image_type {
            req.insert("PersonalizedImageType".into(), image_type.into());
        }
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let mut res = self.connection.read_plist().await?;
        match res.remove("PersonalizationNonce") {
            Some(plist::Value::Data(nonce)) => Ok(nonce),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }

    /// Fetches the board/chip/ECID identifiers and the `Ap,*` keys that
    /// seed the signing request
    pub async fn query_personalization_identifiers(
        &mut self,
    ) -> Result<plist::Dictionary, MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "QueryPersonalizationIdentifiers".into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;

        let mut res = self.connection.read_plist().await?;
        match res.remove("PersonalizationIdentifiers") {
            Some(plist::Value::Dictionary(identifiers)) => Ok(identifiers),
            _ => Err(MuxdevError::UnexpectedResponse),
        }
    }

    pub async fn roll_personalization_nonce(&mut self) -> Result<(), MuxdevError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "RollPersonalizationNonce".into());
        self.connection
            .send_plist(plist::Value::Dictionary(req))
            .await?;
        Ok(())
    }

    /// Uploads and mounts a pre-iOS 17 developer disk image with its
    /// detached signature
    pub async fn mount_developer(
        &mut self,
        image: &[u8],
        signature: Vec<u8>,
    ) -> Result<(), MuxdevError> {
        self.upload_image("Developer", image, signature.clone())
            .await?;
        self.mount_image("Developer", signature, None, None).await
    }

    /// Uploads and mounts a personalized (iOS 17+) image
    ///
    /// A manifest cached on the device is reused; otherwise one is signed
    /// through TSS from the image's build manifest.
    pub async fn mount_personalized(
        &mut self,
        image: &[u8],
        trust_cache: Vec<u8>,
        build_manifest: &[u8],
        info_plist: Option<plist::Value>,
        unique_chip_id: u64,
    ) -> Result<(), MuxdevError> {
        let signature = Sha384::digest(image).to_vec();

        let manifest = match self
            .query_personalization_manifest("DeveloperDiskImage", signature)
            .await
        {
            Ok(manifest) => manifest,
            Err(MuxdevError::NotFound) => {
                let manifest_dict: plist::Dictionary = plist::from_bytes(build_manifest)?;
                self.get_manifest_from_tss(&manifest_dict, unique_chip_id)
                    .await?
            }
            Err(e) => return Err(e),
        };

        self.upload_image("Personalized", image, manifest.clone())
            .await?;

        self.mount_image("Personalized", manifest, Some(trust_cache), info_plist)
            .await
    }

    /// Builds and sends the TSS request for a personalized manifest
    pub async fn get_manifest_from_tss(
        &mut self,
        build_manifest: &plist::Dictionary,
        unique_chip_id: u64,
    ) -> Result<Vec<u8>, MuxdevError> {
        let mut request = TssRequest::new();

        let personalization_identifiers = self.query_personalization_identifiers().await?;
        for (key, val) in &personalization_identifiers {
            // Every vendor-specific identifier is folded into the request
            if key.starts_with("Ap,") {
                request.insert(key, val.clone());
            }
        }

        let board_id = match personalization_identifiers
            .get("BoardId")
            .and_then(|x| x.as_unsigned_integer())
        {
            Some(b) => b,
            None => {
                error!("Personalization identifiers carried no BoardId");
                return Err(MuxdevError::UnexpectedResponse);
            }
        };
        let chip_id = match personalization_identifiers
            .get("ChipID")
            .and_then(|x| x.as_unsigned_integer())
        {
            Some(c) => c,
            None => {
                error!("Personalization identifiers carried no ChipID");
                return Err(MuxdevError::UnexpectedResponse);
            }
        };

        request.insert("@ApImg4Ticket", true);
        request.insert("@BBTicket", true);
        request.insert("ApBoardID", board_id);
        request.insert("ApChipID", chip_id);
        request.insert("ApECID", unique_chip_id);
        request.insert(
            "ApNonce",
            plist::Value::Data(self.query_nonce(Some("DeveloperDiskImage")).await?),
        );
        request.insert("ApProductionMode", true);
        request.insert("ApSecurityDomain", 1);
        request.insert("ApSecurityMode", true);
        request.insert("SepNonce", plist::Value::Data(vec![0; 20]));
        request.insert("UID_MODE", false);

        let build_identity = find_build_identity(build_manifest, board_id, chip_id)?;
        let manifest = match build_identity.get("Manifest") {
            Some(plist::Value::Dictionary(m)) => m,
            _ => return Err(MuxdevError::BadBuildManifest),
        };

        let mut parameters = plist::Dictionary::new();
        parameters.insert("ApProductionMode".into(), true.into());
        parameters.insert("ApSecurityDomain".into(), 1.into());
        parameters.insert("ApSecurityMode".into(), true.into());
        parameters.insert("ApSupportsImg4".into(), true.into());

        for (key, manifest_item) in manifest {
            let manifest_item = match manifest_item {
                plist::Value::Dictionary(m) => m,
                _ => {
                    debug!("Manifest item wasn't a dictionary");
                    continue;
                }
            };
            match manifest_item
                .get("Info")
                .and_then(|x| x.as_dictionary())
                .and_then(|info| info.get("Trusted"))
            {
                Some(plist::Value::Boolean(true)) => {}
                _ => {
                    debug!("Skipping untrusted manifest entry {key}");
                    continue;
                }
            }

            let mut tss_entry = manifest_item.clone();
            tss_entry.remove("Info");

            if tss_entry.get("Digest").is_none() {
                tss_entry.insert("Digest".into(), plist::Value::Data(vec![]));
            }

            if let Some(plist::Value::Dictionary(l)) = manifest.get("LoadableTrustCache") {
                if let Some(plist::Value::Dictionary(i)) = l.get("Info") {
                    if let Some(plist::Value::Array(rules)) = i.get("RestoreRequestRules") {
                        crate::tss::apply_restore_request_rules(&mut tss_entry, &parameters, rules);
                    }
                }
            }

            request.insert(key, tss_entry);
        }

        let res = request.send().await?;
        let mut res = match res {
            plist::Value::Dictionary(r) => r,
            _ => {
                warn!("Apple returned a non-dictionary plist");
                return Err(MuxdevError::UnexpectedResponse);
            }
        };

        match res.remove("ApImg4Ticket") {
            Some(plist::Value::Data(d)) => Ok(d),
            _ => {
                warn!("TSS response didn't contain ApImg4Ticket data");
                Err(MuxdevError::UnexpectedResponse)
            }
        }
    }
}

/// Picks the build identity whose board and chip ids match the device
fn find_build_identity(
    build_manifest: &plist::Dictionary,
    board_id: u64,
    chip_id: u64,
) -> Result<plist::Dictionary, MuxdevError> {
    let identities = match build_manifest.get("BuildIdentities") {
        Some(plist::Value::Array(i)) => i,
        _ => return Err(MuxdevError::BadBuildManifest),
    };

    for id in identities {
        let id = match id {
            plist::Value::Dictionary(id) => id,
            _ => {
                debug!("Build identity wasn't a dictionary");
                continue;
            }
        };

        // Ids are hex strings like "0x8120" in the manifest
        let hex_field = |key: &str| {
            id.get(key)
                .and_then(|x| x.as_string())
                .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
        };

        if hex_field("ApBoardID") == Some(board_id) && hex_field("ApChipID") == Some(chip_id) {
            return Ok(id.to_owned());
        }
    }

    Err(MuxdevError::BadBuildManifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with_identity(board: &str, chip: &str) -> plist::Dictionary {
        let mut identity = plist::Dictionary::new();
        identity.insert("ApBoardID".into(), board.into());
        identity.insert("ApChipID".into(), chip.into());
        identity.insert("Manifest".into(), plist::Dictionary::new().into());

        let mut manifest = plist::Dictionary::new();
        manifest.insert(
            "BuildIdentities".into(),
            plist::Value::Array(vec![plist::Value::Dictionary(identity)]),
        );
        manifest
    }

    #[test]
    fn build_identity_matches_after_hex_strip() {
        let manifest = manifest_with_identity("0x1C", "0x8120");
        let identity = find_build_identity(&manifest, 0x1C, 0x8120).unwrap();
        assert!(identity.get("Manifest").is_some());
    }

    #[test]
    fn mismatched_identity_is_rejected() {
        let manifest = manifest_with_identity("0x1C", "0x8120");
        match find_build_identity(&manifest, 0x0E, 0x8120) {
            Err(MuxdevError::BadBuildManifest) => {}
            other => panic!("expected BadBuildManifest, got {other:?}"),
        }
    }
}
