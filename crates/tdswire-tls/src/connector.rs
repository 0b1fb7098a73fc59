//! TLS connector for the in-protocol handshake.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::{TlsConfig, TlsVersion};
use crate::error::TlsError;
use crate::fragment::{FragmentLimit, FragmentLimited, fragment_size_for};
use crate::prelogin::PreloginStream;

/// Encrypted stream produced by [`TlsConnector::handshake`].
pub type EncryptedStream<S> = FragmentLimited<TlsStream<PreloginStream<S>>>;

// =============================================================================
// Certificate verifier for TrustServerCertificate=true
// =============================================================================

/// Accepts any server certificate.
///
/// Handshake signatures are still checked so the peer must hold the key
/// for the certificate it presents.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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

// =============================================================================
// TLS Connector
// =============================================================================

/// Runs the TLS handshake inside PRELOGIN messages.
pub struct TlsConnector {
    config: TlsConfig,
    inner: TokioTlsConnector,
    packet_size: usize,
}

impl TlsConnector {
    /// Create a connector whose records fit in `packet_size`.
    pub fn new(config: TlsConfig, packet_size: usize) -> Result<Self, TlsError> {
        let client_config = Self::build_client_config(&config, packet_size)?;
        Ok(Self {
            config,
            inner: TokioTlsConnector::from(Arc::new(client_config)),
            packet_size,
        })
    }

    fn build_client_config(config: &TlsConfig, packet_size: usize) -> Result<ClientConfig, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions = Self::select_versions(config)?;
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| TlsError::Configuration(e.to_string()))?;

        let mut client_config = if config.trust_server_certificate {
            tracing::warn!(
                "TrustServerCertificate is enabled: server certificate validation is disabled \
                 and the connection is open to man-in-the-middle attacks"
            );
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                .with_no_client_auth()
        } else {
            builder
                .with_root_certificates(Self::build_root_store(config)?)
                .with_no_client_auth()
        };

        client_config.max_fragment_size = Some(fragment_size_for(packet_size));
        Ok(client_config)
    }

    fn build_root_store(config: &TlsConfig) -> Result<RootCertStore, TlsError> {
        let mut root_store = RootCertStore::empty();
        if config.root_certificates.is_empty() {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert in &config.root_certificates {
                root_store
                    .add(cert.clone())
                    .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
            }
        }
        Ok(root_store)
    }

    fn select_versions(
        config: &TlsConfig,
    ) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TlsError> {
        let versions: Vec<_> = [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|v| (config.min_protocol_version..=config.max_protocol_version).contains(v))
            .map(TlsVersion::to_rustls)
            .collect();
        if versions.is_empty() {
            return Err(TlsError::Configuration(format!(
                "no TLS version between {:?} and {:?}",
                config.min_protocol_version, config.max_protocol_version
            )));
        }
        Ok(versions)
    }

    /// Run the handshake over `stream`, framing it as PRELOGIN messages.
    ///
    /// The returned stream is the splice point: every later byte goes
    /// through TLS unframed. The [`FragmentLimit`] handle follows packet
    /// size changes.
    pub async fn handshake<S>(
        &self,
        stream: S,
        server_name: &str,
    ) -> Result<(EncryptedStream<S>, FragmentLimit), TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = self.config.server_name.as_deref().unwrap_or(server_name);
        let dns_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;

        tracing::debug!(server_name = %server_name, "performing TLS handshake");
        let framed = PreloginStream::new(stream, self.packet_size);
        let mut tls = self
            .inner
            .connect(dns_name, framed)
            .await
            .map_err(TlsError::HandshakeFailed)?;
        tls.get_mut().0.handshake_complete();
        tracing::debug!("TLS handshake completed");

        let limit = FragmentLimit::new(self.packet_size);
        Ok((FragmentLimited::new(tls, limit.clone()), limit))
    }

    /// Get the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .field("packet_size", &self.packet_size)
            .finish_non_exhaustive()
    }
}
