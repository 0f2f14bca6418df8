use crate::error::ProxyError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::sync::Arc;

/// PEM-encoded certificate chain and private key for an HTTPS listener.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
  pub cert_pem: Vec<u8>,
  pub key_pem: Vec<u8>,
}

impl TlsIdentity {
  pub fn server_config(&self) -> Result<ServerConfig, ProxyError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &self.cert_pem[..])
      .collect::<Result<_, _>>()
      .map_err(|e| ProxyError::TlsConfig(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
      return Err(ProxyError::TlsConfig("no certificates in PEM".to_string()));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &self.key_pem[..])
      .map_err(|e| ProxyError::TlsConfig(format!("bad private key PEM: {e}")))?
      .ok_or_else(|| ProxyError::TlsConfig("no private key in PEM".to_string()))?;

    ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(certs, key)
      .map_err(|e| ProxyError::TlsConfig(e.to_string()))
  }
}

/// Client config trusting the webpki root store, used for TLS toward origins
/// and upstream proxies.
pub fn client_config() -> Arc<ClientConfig> {
  let roots = rustls::RootCertStore {
    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
  };
  Arc::new(
    ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth(),
  )
}

/// Client config that accepts any certificate. Applied only toward an
/// upstream proxy when the policy sets `ignore_upstream_proxy_certificate`.
pub fn insecure_client_config() -> Arc<ClientConfig> {
  Arc::new(
    ClientConfig::builder()
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerification))
      .with_no_client_auth(),
  )
}

#[derive(Debug)]
struct NoVerification;

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
    rustls::crypto::ring::default_provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}
