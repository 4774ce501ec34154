//! TLS configuration for both legs of the proxy.
//!
//! # Responsibilities
//! - Build rustls client configs from per-target TLS material
//! - Disable certificate verification when `secure = false`
//! - Load listener certificates from PEM files
//!
//! # Design Decisions
//! - The ring provider is passed explicitly, no process-wide default needed
//! - Configs without custom material are built once and shared
//! - PKCS#12 (`pfx`) bundles are rejected; rustls only reads PEM

use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SupportedProtocolVersion};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::schema::{ListenerTls, TlsMaterial};
use crate::error::ProxyError;

static VERIFIED: OnceCell<Arc<ClientConfig>> = OnceCell::new();
static UNVERIFIED: OnceCell<Arc<ClientConfig>> = OnceCell::new();

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Certificate verifier accepting any server certificate.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<rustls::SignatureScheme>,
}

impl ServerCertVerifier for NoVerifier {
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

fn tls_error(context: &str, err: impl std::fmt::Display) -> ProxyError {
    ProxyError::Tls(format!("{}: {}", context, err))
}

fn provider_for(material: &TlsMaterial) -> Result<CryptoProvider, ProxyError> {
    let mut provider = rustls::crypto::ring::default_provider();
    if let Some(ciphers) = material.ciphers.as_deref() {
        let wanted: Vec<String> = ciphers
            .split(':')
            .map(|name| name.trim().to_ascii_uppercase())
            .filter(|name| !name.is_empty())
            .collect();
        provider
            .cipher_suites
            .retain(|suite| wanted.contains(&format!("{:?}", suite.suite()).to_ascii_uppercase()));
        if provider.cipher_suites.is_empty() {
            return Err(ProxyError::Tls(format!("no supported cipher suite in `{}`", ciphers)));
        }
    }
    Ok(provider)
}

fn protocol_versions(material: &TlsMaterial) -> Result<&'static [&'static SupportedProtocolVersion], ProxyError> {
    match material.secure_protocol.as_deref() {
        None => Ok(rustls::DEFAULT_VERSIONS),
        Some("TLSv1_2_method") => Ok(TLS12_ONLY),
        Some("TLSv1_3_method") => Ok(TLS13_ONLY),
        Some("TLS_method") | Some("SSLv23_method") => Ok(rustls::ALL_VERSIONS),
        Some(other) => Err(ProxyError::Tls(format!("unsupported secure protocol `{}`", other))),
    }
}

fn parse_certs(pem: &str, context: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(context, e))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("{}: no certificates found", context)));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error("client key", e))?
        .ok_or_else(|| ProxyError::Tls("client key: no private key found".to_string()))
}

fn build_client_config(material: &TlsMaterial, verify: bool) -> Result<ClientConfig, ProxyError> {
    if material.pfx.is_some() {
        return Err(ProxyError::Tls(
            "pfx bundles are not supported, provide PEM `cert` and `key`".to_string(),
        ));
    }
    if material.passphrase.is_some() {
        tracing::debug!("Ignoring TLS passphrase, encrypted keys are not supported");
    }

    let provider = Arc::new(provider_for(material)?);
    let schemes = provider.signature_verification_algorithms.supported_schemes();
    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(protocol_versions(material)?)
        .map_err(|e| tls_error("protocol versions", e))?;

    let builder = if verify {
        let mut roots = RootCertStore::empty();
        match material.ca.as_deref() {
            Some(ca) => {
                let (added, _ignored) = roots.add_parsable_certificates(parse_certs(ca, "ca")?);
                if added == 0 {
                    return Err(ProxyError::Tls("ca: no usable certificates".to_string()));
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { schemes }))
    };

    let mut config = match (material.cert.as_deref(), material.key.as_deref()) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(parse_certs(cert, "client cert")?, parse_key(key)?)
            .map_err(|e| tls_error("client auth", e))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ProxyError::Tls(
                "client certificates need both `cert` and `key`".to_string(),
            ))
        }
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Client config for an outbound TLS connection.
pub fn client_config(material: &TlsMaterial, verify: bool) -> Result<Arc<ClientConfig>, ProxyError> {
    let is_default = material.ca.is_none()
        && material.cert.is_none()
        && material.key.is_none()
        && material.pfx.is_none()
        && material.ciphers.is_none()
        && material.secure_protocol.is_none();
    if !is_default {
        return build_client_config(material, verify).map(Arc::new);
    }
    let cell = if verify { &VERIFIED } else { &UNVERIFIED };
    cell.get_or_try_init(|| build_client_config(material, verify).map(Arc::new))
        .cloned()
}

/// Connector for an outbound TLS connection.
pub fn connector(material: &TlsMaterial, verify: bool) -> Result<TlsConnector, ProxyError> {
    client_config(material, verify).map(TlsConnector::from)
}

/// SNI name for `host` (or the configured `servername`).
pub fn server_name(material: &TlsMaterial, host: &str) -> Result<ServerName<'static>, ProxyError> {
    let name = material.servername.as_deref().unwrap_or(host);
    ServerName::try_from(name.to_string()).map_err(|e| tls_error("server name", e))
}

/// Load a TLS acceptor for the listener from PEM files.
///
/// With `http2` the acceptor offers `h2` before `http/1.1` via ALPN.
pub fn load_acceptor(tls: &ListenerTls, http2: bool) -> Result<TlsAcceptor, ProxyError> {
    let certs = read_pem(&tls.cert_path)?;
    let key = read_pem(&tls.key_path)?;
    let certs = parse_certs(&certs, "listener cert")?;
    let key = parse_key(&key)?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_error("listener protocol versions", e))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_error("listener certificate", e))?;
    config.alpn_protocols = if http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    tracing::info!(cert = %tls.cert_path.display(), http2, "Listener TLS configured");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_pem(path: &Path) -> Result<String, ProxyError> {
    std::fs::read_to_string(path).map_err(|e| tls_error(&format!("reading {}", path.display()), e))
}
