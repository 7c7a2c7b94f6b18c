//! In-place TLS upgrade against a paired device
//!
//! The device terminates the handshake with a self-signed certificate that
//! predates modern web PKI expectations: chains are commonly signed with
//! SHA-1 or SHA-256 over RSA/ECDSA, outside the TLS 1.3 default set. Peer
//! verification is therefore disabled outright; the authenticity guarantee
//! comes from the pairing ceremony, not from the certificate chain.

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, SignatureScheme,
};
use std::sync::Arc;

use crate::{pair_record::PairRecord, MuxdevError};

/// Accepts whatever certificate the device presents
#[derive(Debug)]
pub(crate) struct PairedDeviceVerifier;

impl ServerCertVerifier for PairedDeviceVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        // The TLS 1.3 defaults plus the legacy rsa/ecdsa x sha1..sha512
        // combinations older device firmware still signs with
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Builds a client config that authenticates with the pair record's host
/// certificate and key
pub(crate) fn client_config(pair_record: &PairRecord) -> Result<ClientConfig, MuxdevError> {
    // The PEM label selects between PKCS#1 (RSA), SEC1 (EC) and PKCS#8
    let private_key = PrivateKeyDer::from_pem_slice(&pair_record.host_private_key)?;

    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PairedDeviceVerifier))
        .with_client_auth_cert(vec![pair_record.host_certificate.clone()], private_key)?;

    // Devices do not resume sessions; the upgrade happens at most once per
    // socket
    config.resumption = rustls::client::Resumption::disabled();

    Ok(config)
}
