//! Dialing the chat service.
//!
//! [`establish_connection`] opens the TCP connection and, for TLS
//! endpoints, completes the rustls handshake. The result is turned into
//! a [`Session`] pair; login, capability negotiation and joins are then
//! sent through the session's writer.
//!
//! ## Reconnection
//!
//! Nothing here reconnects. A dropped connection surfaces as EOF or an
//! error from [`SessionReader::decode`](crate::session::SessionReader::decode)
//! and the caller decides what to do.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{
    self, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};

use crate::session::{Session, SessionReader, SessionWriter};

/// Chat service endpoint.
pub const DEFAULT_SERVER_ADDR: &str = "irc.chat.twitch.tv:6697";

/// Capabilities the relay depends on: per-message tags and the extended command set.
pub const DEFAULT_CAPS: &[&str] = &["twitch.tv/tags", "twitch.tv/commands"];

/// Every credential the chat service accepts starts with this.
pub const CREDENTIAL_PREFIX: &str = "oauth:";

/// Where and how to dial.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Server address (host:port).
    pub server_addr: String,
    /// Use TLS.
    pub tls: bool,
    /// Skip TLS certificate verification (for self-signed certs).
    pub tls_insecure: bool,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            server_addr: DEFAULT_SERVER_ADDR.to_string(),
            tls: true,
            tls_insecure: false,
        }
    }
}

impl ConnectConfig {
    pub fn new(server_addr: impl Into<String>) -> Self {
        let server_addr = server_addr.into();
        let tls = server_addr.ends_with(":6697") || server_addr.ends_with(":443");
        Self {
            server_addr,
            tls,
            tls_insecure: false,
        }
    }
}

/// A connection that has completed TCP (and optionally TLS) but has not
/// logged in yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl EstablishedConnection {
    pub fn into_session(self) -> (SessionReader, SessionWriter) {
        match self {
            EstablishedConnection::Plain(tcp) => Session::new(tcp),
            EstablishedConnection::Tls(tls) => Session::new(*tls),
        }
    }
}

/// Establish TCP (and optionally TLS) connection to the server.
pub async fn establish_connection(config: &ConnectConfig) -> Result<EstablishedConnection> {
    let mode = if config.tls { "TLS" } else { "plain" };

    tracing::debug!("Resolving {}...", config.server_addr);
    let tcp = TcpStream::connect(&config.server_addr)
        .await
        .map_err(|e| anyhow::anyhow!("TCP connect to {} failed: {e}", config.server_addr))?;
    tracing::debug!("TCP connected to {} ({mode})", config.server_addr);

    if !config.tls {
        return Ok(EstablishedConnection::Plain(tcp));
    }

    if config.tls_insecure {
        tracing::warn!(
            "TLS: skipping certificate chain verification for {}",
            config.server_addr
        );
    }
    let connector = TlsConnector::from(Arc::new(tls_config(config.tls_insecure)?));
    let server_name = config
        .server_addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&config.server_addr);
    let dns_name = ServerName::try_from(server_name.to_string())?;
    let tls_stream = connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| anyhow::anyhow!("TLS handshake with {} failed: {e}", config.server_addr))?;
    tracing::debug!("TLS handshake complete");
    Ok(EstablishedConnection::Tls(Box::new(tls_stream)))
}

/// Client config on the ring provider. `insecure` swaps webpki root
/// validation for [`NoChainVerifier`].
fn tls_config(insecure: bool) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let algorithms = provider.signature_verification_algorithms;
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;
    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoChainVerifier { algorithms }))
            .with_no_client_auth()
    } else {
        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

/// Accepts any certificate chain (self-signed local test servers) but still
/// checks that the peer signed the handshake with the key it presented.
#[derive(Debug)]
struct NoChainVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for NoChainVerifier {
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
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
