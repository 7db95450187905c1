//! Relay client: outbound TLS leg from this machine to the relay.
//!
//! One client per tunnel. Each session:
//!
//! 1. TLS-connects to `relayAddress`;
//! 2. writes the 32-byte identity frame (tunnel id, zero padded);
//! 3. connects to the tunnel's local reverse server;
//! 4. reports `Connected` and copies bytes both ways until either side closes.
//!
//! Sessions are retried forever with fibonacci backoff (no jitter). The delay
//! resets after a session that reached the bridging stage.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, ClientConfig, DigitallySignedStruct, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RelayConfig, StatusReporter, TunnelPatch, TunnelStatus, TUNNEL_ID_LEN};
use crate::config::RelaySettings;

/// Port used when `relayAddress` has none.
pub const DEFAULT_RELAY_PORT: u16 = 443;
/// Host used when `relayAddress` has none.
pub const DEFAULT_RELAY_HOST: &str = "localhost";

/// Width of the identity frame written at the start of every session.
pub const IDENTITY_FRAME_LEN: usize = TUNNEL_ID_LEN;

#[derive(Debug)]
pub enum RelayError {
    Tls(rustls::Error),
    InvalidHost(String),
    Connect(std::io::Error),
    Handshake(std::io::Error),
    Local(std::io::Error),
    Io(std::io::Error),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tls(e) => write!(f, "TLS configuration error: {e}"),
            Self::InvalidHost(h) => write!(f, "Invalid relay host: {h}"),
            Self::Connect(e) => write!(f, "Relay connect failed: {e}"),
            Self::Handshake(e) => write!(f, "Relay TLS handshake failed: {e}"),
            Self::Local(e) => write!(f, "Reverse server connect failed: {e}"),
            Self::Io(e) => write!(f, "Relay I/O error: {e}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tls(e) => Some(e),
            Self::InvalidHost(_) => None,
            Self::Connect(e) | Self::Handshake(e) | Self::Local(e) | Self::Io(e) => Some(e),
        }
    }
}

/// Fibonacci reconnect delays: `initial, initial, 2*initial, 3*initial, ...`
/// capped at `max`. Never gives up.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next: Duration,
}

impl FibonacciBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            next: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        let following = self.current.saturating_add(self.next).min(self.max);
        self.current = self.next;
        self.next = following;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.next = self.initial;
    }
}

/// Split `host:port`. Missing parts fall back to [`DEFAULT_RELAY_HOST`] and
/// [`DEFAULT_RELAY_PORT`]; IPv6 hosts must be bracketed to carry a port.
pub fn parse_relay_address(address: &str) -> (String, u16) {
    let address = address.trim();

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        match rest.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':')),
            None => (rest, None),
        }
    } else if address.matches(':').count() == 1 {
        match address.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (address, None),
        }
    } else {
        (address, None)
    };

    let host = if host.is_empty() {
        DEFAULT_RELAY_HOST.to_string()
    } else {
        host.to_string()
    };
    let port = port
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
        .unwrap_or(DEFAULT_RELAY_PORT);
    (host, port)
}

/// UTF-8 bytes of `id`, zero padded or truncated to [`IDENTITY_FRAME_LEN`].
pub fn identity_frame(id: &str) -> [u8; IDENTITY_FRAME_LEN] {
    let mut frame = [0u8; IDENTITY_FRAME_LEN];
    let bytes = id.as_bytes();
    let len = bytes.len().min(IDENTITY_FRAME_LEN);
    frame[..len].copy_from_slice(&bytes[..len]);
    frame
}

/// TLS client config trusting the webpki roots. With `insecure_skip_verify`
/// the relay certificate is not checked at all.
pub fn build_tls_config(insecure_skip_verify: bool) -> Result<Arc<ClientConfig>, RelayError> {
    let provider = Arc::new(ring::default_provider());

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(RelayError::Tls)?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if insecure_skip_verify {
        warn!("Relay certificate verification is DISABLED (relay.insecure_skip_verify)");
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertificateVerification(provider)));
    }

    Ok(Arc::new(config))
}

fn resolve_server_name(host: &str) -> Result<ServerName<'static>, RelayError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_owned()).map_err(|_| RelayError::InvalidHost(host.to_string()))
}

async fn connect_tls(
    connector: &TlsConnector,
    host: &str,
    port: u16,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, RelayError> {
    let server_name = resolve_server_name(host)?;
    let tcp = TcpStream::connect((host, port))
        .await
        .map_err(RelayError::Connect)?;
    let _ = tcp.set_nodelay(true);
    connector
        .connect(server_name, tcp)
        .await
        .map_err(RelayError::Handshake)
}

/// How a bridging session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum BridgeEnd {
    /// Exit token fired.
    Exit,
    /// Either side closed. Byte counts are relay-to-local and local-to-relay.
    Closed { inbound: u64, outbound: u64 },
}

/// Send the identity frame on `relay`, connect the reverse server, and copy
/// bytes both ways. Reports `Connected` once both legs are up.
pub async fn bridge<S>(
    mut relay: S,
    id: &str,
    reverse_port: u16,
    reporter: &StatusReporter,
    exit: &CancellationToken,
) -> Result<BridgeEnd, RelayError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    relay
        .write_all(&identity_frame(id))
        .await
        .map_err(RelayError::Io)?;
    relay.flush().await.map_err(RelayError::Io)?;

    let mut local = TcpStream::connect(("127.0.0.1", reverse_port))
        .await
        .map_err(RelayError::Local)?;
    let _ = local.set_nodelay(true);

    reporter
        .report(TunnelPatch::tunnel_status(TunnelStatus::Connected))
        .await;
    info!(tunnel = id, "Relay tunnel connected");

    tokio::select! {
        () = exit.cancelled() => Ok(BridgeEnd::Exit),
        copied = tokio::io::copy_bidirectional(&mut relay, &mut local) => {
            let (inbound, outbound) = copied.map_err(RelayError::Io)?;
            Ok(BridgeEnd::Closed { inbound, outbound })
        }
    }
}

/// Keep the relay leg of one tunnel up until `exit` fires.
pub async fn run(
    relay: RelayConfig,
    settings: RelaySettings,
    reverse_port: u16,
    reporter: StatusReporter,
    exit: CancellationToken,
) {
    let tunnel = reporter.id().to_string();
    let tunnel = tunnel.as_str();

    let tls = match build_tls_config(settings.insecure_skip_verify) {
        Ok(c) => c,
        Err(e) => {
            error!(tunnel, "Relay client disabled: {e}");
            return;
        }
    };
    let connector = TlsConnector::from(tls);
    let (host, port) = parse_relay_address(&relay.relay_address);
    let mut backoff = FibonacciBackoff::new(
        settings.reconnect_initial_delay(),
        settings.reconnect_max_delay(),
    );
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        debug!(tunnel, host = %host, port, attempts, "Connecting to relay");

        let connected = tokio::select! {
            () = exit.cancelled() => break,
            c = connect_tls(&connector, &host, port) => c,
        };

        match connected {
            Ok(stream) => {
                let ended = bridge(stream, tunnel, reverse_port, &reporter, &exit).await;
                reporter
                    .report(TunnelPatch::tunnel_status(TunnelStatus::Disconnected))
                    .await;
                match ended {
                    Ok(BridgeEnd::Exit) => break,
                    Ok(BridgeEnd::Closed { inbound, outbound }) => {
                        info!(tunnel, inbound, outbound, "Relay tunnel closed");
                        backoff.reset();
                        attempts = 0;
                    }
                    Err(e) => warn!(tunnel, "Relay session failed: {e}"),
                }
            }
            Err(e) => warn!(tunnel, attempts, "{e}"),
        }

        let delay = backoff.next_delay();
        debug!(tunnel, "Reconnecting to relay in {}ms", delay.as_millis());
        tokio::select! {
            () = exit.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    reporter
        .report(TunnelPatch::tunnel_status(TunnelStatus::Disconnected))
        .await;
    info!(tunnel, "Relay client stopped");
}

/// Accepts any server certificate. Installed only for `insecure_skip_verify`.
#[derive(Debug)]
struct NoCertificateVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoCertificateVerification {
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
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
