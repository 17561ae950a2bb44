// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-side TLS setup for encrypted Livestatus sites.

use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use serde::{Deserialize, Serialize};

use crate::error::LivestatusError;

/// Environment variable pointing at the root of the monitoring site.
pub const OMD_ROOT_ENV: &str = "OMD_ROOT";

/// TLS options of a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Whether to check the peer certificate chain. Host names are never checked.
    pub verify: bool,
    /// CA bundle; defaults to [`site_local_ca_path`].
    pub ca_file_path: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            verify: true,
            ca_file_path: None,
        }
    }
}

pub(crate) fn omd_root() -> Result<PathBuf, LivestatusError> {
    std::env::var_os(OMD_ROOT_ENV)
        .filter(|root| !root.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            LivestatusError::Config("OMD_ROOT is not set. You are not running in OMD context.".into())
        })
}

/// Path to the site local CA bundle.
pub fn site_local_ca_path() -> Result<PathBuf, LivestatusError> {
    Ok(omd_root()?.join("var/ssl/ca-certificates.crt"))
}

/// Builds the rustls client configuration for `settings`.
///
/// Only TLS 1.2 and 1.3 are offered.
pub fn client_config(settings: &TlsSettings) -> Result<Arc<ClientConfig>, LivestatusError> {
    let provider = Arc::new(ring::default_provider());

    let verifier: Arc<dyn ServerCertVerifier> = if settings.verify {
        let ca_file_path = match &settings.ca_file_path {
            Some(path) => path.clone(),
            None => site_local_ca_path()?,
        };
        let roots = load_ca_file(&ca_file_path)?;
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| ca_error(&ca_file_path, e))?;
        Arc::new(IgnoreHostname { inner })
    } else {
        Arc::new(AcceptAnyCertificate {
            provider: provider.clone(),
        })
    };

    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| LivestatusError::Config(format!("Unable to set up TLS: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn ca_error(path: &Path, err: impl std::fmt::Display) -> LivestatusError {
    LivestatusError::Config(format!(
        "Failed to load CA file '{}': {err}",
        path.display()
    ))
}

/// Reads all PEM certificates from `path` into a root store.
fn load_ca_file(path: &Path) -> Result<RootCertStore, LivestatusError> {
    let file = std::fs::File::open(path).map_err(|e| ca_error(path, e))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| ca_error(path, e))?;
    if certs.is_empty() {
        return Err(ca_error(path, "no certificates found"));
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ca_error(path, "no usable certificates found"));
    }
    if ignored > 0 {
        tracing::warn!("Ignored {ignored} unparsable certificate(s) in {}", path.display());
    }
    Ok(roots)
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    matches!(
        err,
        CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
    )
}

/// Verifies the chain against the configured roots but accepts any host name.
#[derive(Debug)]
struct IgnoreHostname {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for IgnoreHostname {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(ref err)) if is_name_mismatch(err) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any certificate; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
