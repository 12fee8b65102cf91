//! TLS client configuration.
//!
//! One `rustls::ClientConfig` is built per cluster and shared by every
//! blocking connection, every event loop and the tender. The server name
//! checked for each node is the node's advertised TLS name, falling back
//! to the configured name and finally to the address itself.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::ServerName;
use tracing::warn;

use crate::config::TlsConfig;
use crate::error::ClientError;

/// Builds the shared client config, or `None` when TLS is disabled.
pub fn client_config(config: &TlsConfig) -> Result<Option<Arc<rustls::ClientConfig>>, ClientError> {
    if !config.enabled {
        return Ok(None);
    }
    let built = if config.insecure {
        warn!("TLS certificate verification is disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    } else {
        let roots = load_root_certs(config.ca_cert.as_deref())
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(Some(Arc::new(built)))
}

/// Picks the name to verify a node's certificate against.
pub fn server_name(
    node_name: Option<&str>,
    configured: Option<&str>,
    addr: SocketAddr,
) -> Result<ServerName<'static>, ClientError> {
    match node_name.or(configured) {
        Some(name) => ServerName::try_from(name.to_string())
            .map_err(|e| ClientError::Tls(format!("invalid server name '{name}': {e}"))),
        None => Ok(ServerName::IpAddress(addr.ip().into())),
    }
}

/// Loads root certificates from a CA file or the system trust store.
fn load_root_certs(ca_cert: Option<&std::path::Path>) -> io::Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();

    if let Some(path) = ca_cert {
        let pem = std::fs::read(path).map_err(|e| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("failed to read CA cert '{}': {e}", path.display()),
            )
        })?;
        let certs = rustls::pki_types::CertificateDer::pem_slice_iter(&pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if certs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("no certificates found in '{}'", path.display()),
            ));
        }
        for cert in certs {
            roots.add(cert).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid CA certificate: {e}"),
                )
            })?;
        }
    } else {
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            warn!("failed to load a native certificate: {err}");
        }
        for cert in native.certs {
            // one bad system cert shouldn't disable TLS entirely
            if let Err(e) = roots.add(cert) {
                warn!("skipping invalid native CA certificate: {e}");
            }
        }
    }

    Ok(roots)
}

/// Accepts any server certificate. Used with `tls.insecure`.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
