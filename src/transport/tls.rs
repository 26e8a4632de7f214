//! Mutual TLS 1.3 channels, framing, and the inbound listener.
//!
//! Frames are a 4-byte big-endian length followed by the payload, at most
//! [`MAX_FRAME_LEN`] bytes. Peers are identified by the SPIFFE ID in the URI
//! SAN of their leaf certificate; DNS names are not used, so server name
//! mismatches are tolerated once the chain itself verifies.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;

use super::{Channel, Connector, DialTarget, InboundHandler, TransportError, VerifiedPeer};
use crate::identity::{spiffe_id_of, WorkloadIdentity};
use crate::trust::TrustBundle;
use crate::types::SpiffeId;

/// Largest accepted frame payload (4 MiB).
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write one length-prefixed frame.
///
/// # Errors
///
/// [`TransportError::Protocol`] for oversized payloads, otherwise
/// [`TransportError::Connection`] on I/O failure.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    let len = u32::try_from(payload.len())
        .map_err(|_| TransportError::Protocol("frame length overflow".to_owned()))?;
    writer.write_all(&len.to_be_bytes()).await.map_err(io_err)?;
    writer.write_all(payload).await.map_err(io_err)?;
    writer.flush().await.map_err(io_err)
}

/// Read one length-prefixed frame.
///
/// # Errors
///
/// [`TransportError::Protocol`] when the announced length exceeds the limit,
/// otherwise [`TransportError::Connection`] on I/O failure or EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await.map_err(io_err)?;
    let len = usize::try_from(u32::from_be_bytes(header))
        .map_err(|_| TransportError::Protocol("frame length overflow".to_owned()))?;
    if len > MAX_FRAME_LEN {
        return Err(TransportError::Protocol(format!(
            "announced frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(io_err)?;
    Ok(payload)
}

fn io_err(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        return TransportError::Connection("peer closed the connection".to_owned());
    }
    TransportError::Connection(e.to_string())
}

fn tls_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Chain verification against the destination bundle without DNS name
/// matching. Identity is compared by SPIFFE ID after the handshake.
#[derive(Debug)]
struct SpiffeServerVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for SpiffeServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
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

/// Verify a client chain against `bundle` and return the leaf's SPIFFE ID.
pub(crate) fn verify_client_chain(
    chain: &[CertificateDer<'static>],
    bundle: &TrustBundle,
) -> Result<SpiffeId, TransportError> {
    let (leaf, intermediates) = chain
        .split_first()
        .ok_or_else(|| TransportError::UntrustedPeer("no certificate presented".to_owned()))?;
    let roots = Arc::new(bundle.root_store()?);
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider())
        .build()
        .map_err(tls_err)?;
    verifier
        .verify_client_cert(leaf, intermediates, UnixTime::now())
        .map_err(|e| TransportError::UntrustedPeer(e.to_string()))?;
    leaf_identity(leaf, bundle.trust_domain())
}

fn leaf_identity(leaf: &CertificateDer<'_>, trust_domain: &str) -> Result<SpiffeId, TransportError> {
    let id = spiffe_id_of(leaf).map_err(TransportError::UntrustedPeer)?;
    if id.trust_domain() != trust_domain {
        return Err(TransportError::UntrustedPeer(format!(
            "{id} is not in trust domain {trust_domain}"
        )));
    }
    Ok(id)
}

fn server_config(identity: &WorkloadIdentity, bundle: &TrustBundle) -> Result<Arc<ServerConfig>, TransportError> {
    let provider = provider();
    let roots = Arc::new(bundle.root_store()?);
    let verifier = WebPkiClientVerifier::builder_with_provider(roots, Arc::clone(&provider))
        .build()
        .map_err(tls_err)?;
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.cert_chain().to_vec(), identity.private_key().key_der())
        .map_err(tls_err)?;
    Ok(Arc::new(config))
}

fn client_config(target: &DialTarget) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = provider();
    let roots = Arc::new(target.bundle.root_store()?);
    let webpki = WebPkiServerVerifier::builder_with_provider(roots, Arc::clone(&provider))
        .build()
        .map_err(tls_err)?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(tls_err)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SpiffeServerVerifier { inner: webpki }))
        .with_client_auth_cert(
            target.identity.cert_chain().to_vec(),
            target.identity.private_key().key_der(),
        )
        .map_err(tls_err)?;
    Ok(Arc::new(config))
}

fn is_certificate_rejection(e: &io::Error) -> bool {
    e.get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .is_some_and(|tls| {
            matches!(
                tls,
                rustls::Error::InvalidCertificate(_) | rustls::Error::NoCertificatesPresented
            )
        })
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Network location of a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `host:port` to dial.
    pub address: String,
    /// TLS server name to send; defaults to the destination's trust domain.
    pub server_name: Option<String>,
}

impl Endpoint {
    /// Endpoint at `address` with the default server name.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            server_name: None,
        }
    }
}

// Client config built for one trust domain's bundle and the identity
// presented at the time.
#[derive(Debug)]
struct DomainConfig {
    sequence: u64,
    not_after: i64,
    config: Arc<ClientConfig>,
}

/// Dials destinations over mutual TLS 1.3.
#[derive(Debug, Default)]
pub struct MtlsConnector {
    endpoints: RwLock<HashMap<SpiffeId, Endpoint>>,
    configs: Mutex<HashMap<String, DomainConfig>>,
}

impl MtlsConnector {
    /// Connector with no known endpoints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register where `destination` listens.
    pub fn add_endpoint(&self, destination: SpiffeId, endpoint: Endpoint) {
        self.endpoints.write().insert(destination, endpoint);
    }

    /// Forget `destination`'s address.
    pub fn remove_endpoint(&self, destination: &SpiffeId) -> bool {
        self.endpoints.write().remove(destination).is_some()
    }

    /// Trust domains with a built client config.
    pub fn cached_configs(&self) -> usize {
        self.configs.lock().len()
    }

    fn config_for(&self, target: &DialTarget) -> Result<Arc<ClientConfig>, TransportError> {
        let domain = target.bundle.trust_domain();
        let sequence = target.bundle.sequence();
        let not_after = target.identity.not_after().timestamp();
        if let Some(cached) = self.configs.lock().get(domain) {
            if cached.sequence == sequence && cached.not_after == not_after {
                return Ok(Arc::clone(&cached.config));
            }
        }
        let config = client_config(target)?;
        // One entry per domain; a newer bundle or identity replaces the old one.
        self.configs.lock().insert(
            domain.to_owned(),
            DomainConfig {
                sequence,
                not_after,
                config: Arc::clone(&config),
            },
        );
        Ok(config)
    }
}

#[async_trait]
impl Connector for MtlsConnector {
    async fn connect(&self, target: DialTarget) -> Result<Box<dyn Channel>, TransportError> {
        let endpoint = self
            .endpoints
            .read()
            .get(&target.destination)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDestination(target.destination.clone()))?;
        let config = self.config_for(&target)?;
        let server_name = ServerName::try_from(
            endpoint
                .server_name
                .clone()
                .unwrap_or_else(|| target.destination.trust_domain().to_owned()),
        )
        .map_err(tls_err)?;

        let tcp = TcpStream::connect(&endpoint.address)
            .await
            .map_err(|e| TransportError::Connection(format!("{}: {e}", endpoint.address)))?;
        let stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| {
                if is_certificate_rejection(&e) {
                    TransportError::PeerVerification {
                        expected: target.destination.clone(),
                        presented: None,
                    }
                } else {
                    TransportError::Connection(e.to_string())
                }
            })?;

        let peer = {
            let leaf = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|chain| chain.first());
            leaf.and_then(|leaf| spiffe_id_of(leaf).ok())
        };
        let Some(peer) = peer else {
            return Err(TransportError::PeerVerification {
                expected: target.destination.clone(),
                presented: None,
            });
        };

        Ok(Box::new(TlsChannel {
            stream,
            peer,
            healthy: true,
        }))
    }

    fn refresh_material(&self, _identity: &WorkloadIdentity) {
        self.configs.lock().clear();
    }
}

struct TlsChannel {
    stream: tokio_rustls::client::TlsStream<TcpStream>,
    peer: SpiffeId,
    healthy: bool,
}

#[async_trait]
impl Channel for TlsChannel {
    fn peer_identity(&self) -> &SpiffeId {
        &self.peer
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let result = write_frame(&mut self.stream, frame).await;
        if matches!(result, Err(TransportError::Connection(_))) {
            self.healthy = false;
        }
        result
    }

    async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let result = read_frame(&mut self.stream).await;
        if result.is_err() {
            self.healthy = false;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Accepts mutual TLS connections and feeds each frame to an [`InboundHandler`].
///
/// Client certificates are required and must chain to the local trust
/// domain's bundle.
pub struct InboundServer {
    listener: TcpListener,
    config: RwLock<Arc<ServerConfig>>,
    trust_domain: RwLock<String>,
    handler: Arc<dyn InboundHandler>,
    cancel: CancellationToken,
}

impl InboundServer {
    /// Bind `addr` presenting `identity` and trusting `bundle`.
    ///
    /// # Errors
    ///
    /// TLS configuration or bind failure.
    pub async fn bind(
        addr: &str,
        identity: &WorkloadIdentity,
        bundle: &TrustBundle,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, TransportError> {
        let config = server_config(identity, bundle)?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Connection(format!("bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            config: RwLock::new(config),
            trust_domain: RwLock::new(bundle.trust_domain().to_owned()),
            handler,
            cancel: CancellationToken::new(),
        })
    }

    /// Address actually bound.
    ///
    /// # Errors
    ///
    /// The socket's address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    /// Use new identity or bundle material for future handshakes.
    ///
    /// # Errors
    ///
    /// TLS configuration failure; the previous material stays in use.
    pub fn update_material(&self, identity: &WorkloadIdentity, bundle: &TrustBundle) -> Result<(), TransportError> {
        let config = server_config(identity, bundle)?;
        *self.config.write() = config;
        *self.trust_domain.write() = bundle.trust_domain().to_owned();
        tracing::info!(spiffe_id = %identity.spiffe_id(), "inbound TLS material updated");
        Ok(())
    }

    /// Token that stops the accept loop and open connections.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections until cancelled.
    pub async fn serve(self: Arc<Self>) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "inbound listener started");
        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((tcp, remote)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.serve_connection(tcp, remote).await });
                }
                Err(e) => tracing::warn!(error = %e, "inbound accept failed"),
            }
        }
        tracing::info!("inbound listener stopped");
    }

    async fn serve_connection(&self, tcp: TcpStream, remote: SocketAddr) {
        let acceptor = TlsAcceptor::from(Arc::clone(&*self.config.read()));
        let mut stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(
                    security_event = "peer_verification_failed",
                    remote = %remote,
                    error = %e,
                    "inbound TLS handshake failed",
                );
                return;
            }
            Err(_) => {
                tracing::warn!(remote = %remote, "inbound TLS handshake timed out");
                return;
            }
        };

        let trust_domain = self.trust_domain.read().clone();
        let identity = stream
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|chain| chain.first())
            .ok_or_else(|| TransportError::UntrustedPeer("no client certificate".to_owned()))
            .and_then(|leaf| leaf_identity(leaf, &trust_domain));
        let peer = match identity {
            Ok(id) => VerifiedPeer::new(id),
            Err(e) => {
                tracing::warn!(
                    security_event = "peer_verification_failed",
                    remote = %remote,
                    error = %e,
                    "inbound peer has no usable identity",
                );
                return;
            }
        };
        tracing::debug!(remote = %remote, peer = %peer.spiffe_id(), "inbound connection established");

        loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break,
                frame = read_frame(&mut stream) => frame,
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(TransportError::Connection(_)) => break,
                Err(e) => {
                    tracing::warn!(peer = %peer.spiffe_id(), error = %e, "closing connection after bad frame");
                    break;
                }
            };
            let response = self.handler.handle_frame(&peer, frame).await;
            if let Err(e) = write_frame(&mut stream, &response).await {
                tracing::debug!(peer = %peer.spiffe_id(), error = %e, "failed to write response");
                break;
            }
        }
    }
}

impl std::fmt::Debug for InboundServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundServer")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish_non_exhaustive()
    }
}
