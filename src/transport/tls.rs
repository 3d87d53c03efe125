//! TLS over TCP with rustls.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector as RustlsConnector;
use tracing::{debug, warn};

use crate::error::{AmqpError, Result};

use super::{Address, Transport, TransportConnector};

/// Build a client config trusting the webpki roots, or trusting anything
/// when `accept_invalid_certs` is set.
pub fn client_config(accept_invalid_certs: bool) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AmqpError::Tls(e.to_string()))?;

    let config = if accept_invalid_certs {
        warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// Run the TLS client handshake over an established stream.
pub async fn connect_tls<S>(stream: S, host: &str, config: Arc<ClientConfig>) -> Result<TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| AmqpError::Tls(format!("invalid server name {}: {}", host, e)))?;
    let stream = RustlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| AmqpError::Tls(e.to_string()))?;
    debug!(host, "TLS established");
    Ok(stream)
}

/// `amqps`: TCP then TLS.
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new(accept_invalid_certs: bool) -> Result<Self> {
        Ok(Self {
            config: client_config(accept_invalid_certs)?,
        })
    }

    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportConnector for TlsConnector {
    async fn connect(&self, address: &Address) -> Result<Transport> {
        let tcp = TcpStream::connect(address.authority())
            .await
            .map_err(|e| AmqpError::Transport(format!("connect {}: {}", address, e)))?;
        tcp.set_nodelay(true)?;
        let stream = connect_tls(tcp, &address.host, self.config.clone()).await?;
        Ok(Box::new(stream))
    }
}

/// Accepts every certificate. Only for test brokers with self-signed certs.
#[derive(Debug)]
struct SkipVerification;

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_configs_build() {
        assert!(client_config(false).is_ok());
        assert!(client_config(true).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_server_name() {
        let (client, _server) = tokio::io::duplex(64);
        let config = client_config(false).unwrap();
        let err = connect_tls(client, "not a host name", config).await.unwrap_err();
        assert!(matches!(err, AmqpError::Tls(_)));
    }
}
