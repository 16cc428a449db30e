//! TLS mode parsing shared by every driver, plus the rustls connector used
//! for PostgreSQL.
//!
//! MySQL and SQL Server drivers bring their own TLS stacks; they only read
//! the parsed [`SslMode`] to decide whether to encrypt and whether to trust
//! the server certificate.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};

/// Endpoint `ssl_mode` values, named after PostgreSQL's `sslmode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Plain TCP.
    Disable,
    /// Try TLS without verification, fall back to plain TCP.
    #[default]
    Prefer,
    /// TLS without certificate verification.
    Require,
    /// Verify the certificate chain.
    VerifyCa,
    /// Verify the certificate chain and host name.
    VerifyFull,
}

impl SslMode {
    /// Parse an SSL mode from a string. Empty means the default (`prefer`).
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "" | "prefer" => Ok(SslMode::Prefer),
            "disable" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Ok(SslMode::VerifyFull),
            other => Err(MigrateError::Config(format!(
                "Invalid ssl_mode '{}'. Valid values: disable, prefer, require, verify-ca, verify-full",
                other
            ))),
        }
    }

    /// Whether a TLS connector must be available.
    pub fn uses_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Whether the server certificate is accepted without verification.
    pub fn accepts_invalid_certs(&self) -> bool {
        matches!(self, SslMode::Prefer | SslMode::Require)
    }

    /// The matching tokio-postgres negotiation mode.
    pub fn postgres_mode(&self) -> tokio_postgres::config::SslMode {
        match self {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        }
    }
}

/// Builder for PostgreSQL rustls connectors.
pub struct TlsBuilder {
    ssl_mode: SslMode,
}

impl TlsBuilder {
    /// Create a new TLS builder with the given SSL mode.
    pub fn new(ssl_mode: SslMode) -> Self {
        Self { ssl_mode }
    }

    /// Create a TLS builder from an ssl_mode string.
    pub fn parse(ssl_mode: &str) -> Result<Self> {
        Ok(Self::new(SslMode::parse(ssl_mode)?))
    }

    /// Build a connector, or `None` when TLS is disabled.
    pub fn build(&self) -> Result<Option<MakeRustlsConnect>> {
        if !self.ssl_mode.uses_tls() {
            return Ok(None);
        }
        Ok(Some(MakeRustlsConnect::new(self.build_client_config()?)))
    }

    /// Build the underlying rustls ClientConfig.
    pub fn build_client_config(&self) -> Result<ClientConfig> {
        if self.ssl_mode.accepts_invalid_certs() {
            if self.ssl_mode == SslMode::Require {
                warn!(
                    "ssl_mode=require encrypts but does NOT verify the server certificate. \
                     Use ssl_mode=verify-full for production."
                );
            }
            return Ok(ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth());
        }

        match self.ssl_mode {
            SslMode::Disable => Err(MigrateError::Config(
                "Cannot build TLS config for ssl_mode=disable".into(),
            )),
            _ => {
                // rustls always checks the host name, so verify-ca behaves as verify-full
                debug!("TLS certificate verification enabled ({:?})", self.ssl_mode);
                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                Ok(ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth())
            }
        }
    }
}

/// Certificate verifier that accepts any certificate.
///
/// Only used for `prefer` and `require`, where encryption is wanted but
/// the server identity is not checked.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!(SslMode::parse("disable").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("").unwrap(), SslMode::Prefer);
        assert_eq!(SslMode::parse("PREFER").unwrap(), SslMode::Prefer);
        assert_eq!(SslMode::parse("verify_full").unwrap(), SslMode::VerifyFull);
        assert!(SslMode::parse("sometimes").is_err());
    }

    #[test]
    fn test_certificate_trust() {
        assert!(SslMode::Prefer.accepts_invalid_certs());
        assert!(SslMode::Require.accepts_invalid_certs());
        assert!(!SslMode::VerifyFull.accepts_invalid_certs());
        assert!(!SslMode::Disable.uses_tls());
    }

    #[test]
    fn test_tls_builder() {
        assert!(TlsBuilder::new(SslMode::Disable).build().unwrap().is_none());
        assert!(TlsBuilder::new(SslMode::Prefer).build().unwrap().is_some());
        assert!(TlsBuilder::new(SslMode::VerifyFull).build().unwrap().is_some());
    }
}
