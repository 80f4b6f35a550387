//! TLS options shared by the event channel and the HTTP client.
//!
//! `cert_verify = false` turns verification off entirely. Otherwise a
//! configured `cert_path` replaces the system roots with the given bundle.
//! With neither set both transports use their default native roots.

use crate::config::{ConfigError, PluginConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolved TLS settings.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    verify: bool,
    ca_bundle: Option<(PathBuf, Vec<CertificateDer<'static>>)>,
}

impl TlsOptions {
    /// Read and parse the CA bundle named by the config, if any.
    pub fn from_config(config: &PluginConfig) -> Result<Self, ConfigError> {
        let ca_bundle = match &config.cert_path {
            Some(path) => Some((path.clone(), load_bundle(path)?)),
            None => None,
        };
        Ok(Self {
            verify: config.cert_verify,
            ca_bundle,
        })
    }

    /// Whether the defaults of each transport can be used as-is.
    pub fn is_default(&self) -> bool {
        self.verify && self.ca_bundle.is_none()
    }

    /// rustls config for the event channel, or `None` for the default.
    pub fn client_config(&self) -> Result<Option<Arc<ClientConfig>>, ConfigError> {
        if self.is_default() {
            return Ok(None);
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let config = if !self.verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            if let Some((path, certs)) = &self.ca_bundle {
                for cert in certs {
                    roots
                        .add(cert.clone())
                        .map_err(|e| ConfigError::InvalidCertificate {
                            path: path.clone(),
                            reason: e.to_string(),
                        })?;
                }
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        Ok(Some(Arc::new(config)))
    }

    /// Apply the same settings to an HTTP client builder.
    pub fn apply(&self, builder: reqwest::ClientBuilder) -> Result<reqwest::ClientBuilder, ConfigError> {
        if !self.verify {
            return Ok(builder.danger_accept_invalid_certs(true));
        }
        let Some((_, certs)) = &self.ca_bundle else {
            return Ok(builder);
        };

        let mut builder = builder.tls_built_in_root_certs(false);
        for cert in certs {
            let cert = reqwest::Certificate::from_der(cert.as_ref())
                .map_err(ConfigError::HttpClient)?;
            builder = builder.add_root_certificate(cert);
        }
        Ok(builder)
    }
}

fn load_bundle(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let pem = std::fs::read(path).map_err(|source| ConfigError::CaBundle {
        path: path.to_path_buf(),
        source,
    })?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::InvalidCertificate {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(ConfigError::InvalidCertificate {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        });
    }
    Ok(certs)
}

/// Accepts any server certificate. Signatures are still checked so the
/// handshake itself stays well-formed.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
