//! Proxy transport layer for HTTP and SOCKS protocols
//!
//! Handles establishing connections through upstream proxies: absolute-form
//! requests to HTTP proxies (with a bounded keep-alive cache), CONNECT
//! tunnels, SOCKS handshakes and TLS towards https destinations.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument, warn};

use crate::error::{Result, SupervisorError};
use crate::models::{ProxyEndpoint, ProxyProtocol};

/// Boxed error carried by relayed bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type used on both sides of the relay
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Trait for proxy connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> ProxyConnection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Outcome of a CONNECT handshake with an upstream proxy
pub enum TunnelReply {
    /// The proxy answered 2xx; bytes already buffered after its reply are
    /// replayed by the returned stream
    Established {
        status: StatusCode,
        stream: Box<dyn ProxyConnection>,
    },
    /// The proxy answered outside 2xx
    Rejected { status: StatusCode, reason: String },
}

/// Response from the destination plus the connection to hand back once the
/// body has been fully read
pub struct Upstream {
    pub response: Response<Incoming>,
    pub pooled: Option<PooledSender>,
}

/// Proxy transport handler
///
/// Manages connections through the upstream proxies of one balancer.
pub struct ProxyTransport {
    idle: Arc<IdleCache>,
    verified_tls: OnceLock<std::result::Result<TlsConnector, String>>,
    insecure_tls: OnceLock<std::result::Result<TlsConnector, String>>,
}

impl ProxyTransport {
    /// `max_idle` bounds the number of idle keep-alive connections kept across
    /// all endpoints; `0` disables reuse.
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Arc::new(IdleCache::new(max_idle)),
            verified_tls: OnceLock::new(),
            insecure_tls: OnceLock::new(),
        }
    }

    /// Number of idle keep-alive connections currently cached
    pub fn idle_count(&self) -> usize {
        self.idle.count.load(Ordering::SeqCst)
    }

    /// Drop cached connections to an endpoint
    pub fn forget(&self, endpoint_id: &str) {
        self.idle.purge(endpoint_id);
    }

    /// Send `req` (absolute-form URI) to its destination through `endpoint`
    #[instrument(skip(self, endpoint, req), fields(proxy = %endpoint, uri = %req.uri()))]
    pub async fn send(
        &self,
        endpoint: &ProxyEndpoint,
        mut req: Request<ProxyBody>,
        insecure_tls: bool,
    ) -> Result<Upstream> {
        let target = req.uri().clone();
        let (host, port) = Self::parse_target(&target)?;

        if !req.headers().contains_key(HOST) {
            if let Some(authority) = target.authority() {
                let value = HeaderValue::from_str(authority.as_str())
                    .map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?;
                req.headers_mut().insert(HOST, value);
            }
        }

        match target.scheme_str() {
            Some("http") if endpoint.protocol.is_http() => {
                self.send_via_http_proxy(endpoint, req).await
            }
            Some("http") => {
                let stream = Self::connect_socks(endpoint, &host, port).await?;
                let response = Self::send_origin_form(stream, req).await?;
                Ok(Upstream {
                    response,
                    pooled: None,
                })
            }
            Some("https") => {
                let stream = match self
                    .open_tunnel(endpoint, &host, port, HeaderMap::new())
                    .await?
                {
                    TunnelReply::Established { stream, .. } => stream,
                    TunnelReply::Rejected { status, reason } => {
                        return Err(SupervisorError::ConnectNotOk {
                            status: status.as_u16(),
                            reason,
                        })
                    }
                };
                let tls = self.tls_handshake(stream, &host, insecure_tls).await?;
                let response = Self::send_origin_form(tls, req).await?;
                Ok(Upstream {
                    response,
                    pooled: None,
                })
            }
            other => Err(SupervisorError::ProtocolNotSupported(
                other.unwrap_or("none").to_string(),
            )),
        }
    }

    /// Open a tunnel to `host:port` through `endpoint`
    #[instrument(skip(self, endpoint, headers), fields(proxy = %endpoint))]
    pub async fn open_tunnel(
        &self,
        endpoint: &ProxyEndpoint,
        host: &str,
        port: u16,
        headers: HeaderMap,
    ) -> Result<TunnelReply> {
        if endpoint.protocol.is_http() {
            return Self::connect_http(endpoint, host, port, headers).await;
        }

        let stream = Self::connect_socks(endpoint, host, port).await?;
        Ok(TunnelReply::Established {
            status: StatusCode::OK,
            stream: Box::new(stream),
        })
    }

    async fn send_via_http_proxy(
        &self,
        endpoint: &ProxyEndpoint,
        mut req: Request<ProxyBody>,
    ) -> Result<Upstream> {
        if let Some(auth) = endpoint.basic_auth() {
            let value = HeaderValue::from_str(&auth)
                .map_err(|e| SupervisorError::InvalidAddress(e.to_string()))?;
            req.headers_mut().insert(PROXY_AUTHORIZATION, value);
        }

        let mut sender = match self.idle.checkout(endpoint.id()).await {
            Some(sender) => {
                debug!("Reusing idle connection to {}", endpoint.id());
                sender
            }
            None => {
                let stream = Self::dial(endpoint).await?;
                let (sender, conn) = http1::handshake(TokioIo::new(stream))
                    .await
                    .map_err(|e| SupervisorError::Transport(format!("Handshake failed: {}", e)))?;

                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!("Connection ended: {}", e);
                    }
                });
                sender
            }
        };

        let response = sender
            .send_request(req)
            .await
            .map_err(|e| SupervisorError::Transport(format!("Request failed: {}", e)))?;

        Ok(Upstream {
            response,
            pooled: Some(PooledSender {
                key: endpoint.id().to_string(),
                sender,
                cache: self.idle.clone(),
            }),
        })
    }

    /// Send a request straight to the destination over an established stream
    async fn send_origin_form<S>(
        stream: S,
        mut req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        *req.uri_mut() = path
            .parse::<Uri>()
            .map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?;

        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| SupervisorError::Transport(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Connection ended: {}", e);
            }
        });

        sender
            .send_request(req)
            .await
            .map_err(|e| SupervisorError::Transport(format!("Request failed: {}", e)))
    }

    /// Issue CONNECT to an HTTP proxy
    async fn connect_http(
        endpoint: &ProxyEndpoint,
        host: &str,
        port: u16,
        headers: HeaderMap,
    ) -> Result<TunnelReply> {
        debug!("Connecting to HTTP proxy at {}", endpoint.authority());

        let stream = Self::dial(endpoint).await?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| SupervisorError::Transport(format!("Handshake failed: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("CONNECT connection ended: {}", e);
            }
        });

        let authority = format_authority(host, port);
        let mut req = Request::builder()
            .method(Method::CONNECT)
            .uri(authority.as_str())
            .body(empty_body())?;
        *req.headers_mut() = headers;

        let host_value = HeaderValue::from_str(&authority)
            .map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?;
        req.headers_mut().insert(HOST, host_value);

        if let Some(auth) = endpoint.basic_auth() {
            let value = HeaderValue::from_str(&auth)
                .map_err(|e| SupervisorError::InvalidAddress(e.to_string()))?;
            req.headers_mut().insert(PROXY_AUTHORIZATION, value);
        }

        let res = sender
            .send_request(req)
            .await
            .map_err(|e| SupervisorError::Transport(format!("CONNECT failed: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let reason = res
                .extensions()
                .get::<ReasonPhrase>()
                .map(|r| String::from_utf8_lossy(r.as_bytes()).into_owned())
                .or_else(|| status.canonical_reason().map(str::to_string))
                .unwrap_or_default();

            debug!("CONNECT rejected with {} {}", status.as_u16(), reason);
            return Ok(TunnelReply::Rejected { status, reason });
        }

        let upgraded = hyper::upgrade::on(res)
            .await
            .map_err(|e| SupervisorError::Transport(format!("CONNECT upgrade failed: {}", e)))?;

        debug!("HTTP CONNECT tunnel established");
        Ok(TunnelReply::Established {
            status,
            stream: Box::new(TokioIo::new(upgraded)),
        })
    }

    /// Connect to `host:port` through a SOCKS proxy
    async fn connect_socks(endpoint: &ProxyEndpoint, host: &str, port: u16) -> Result<TcpStream> {
        debug!(
            "Connecting to {} proxy at {}",
            endpoint.protocol,
            endpoint.authority()
        );

        let socket = Self::dial(endpoint).await?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let stream = match endpoint.protocol {
            ProxyProtocol::Socks4 => {
                // SOCKS4 carries an IPv4 address only, resolve locally
                let target = resolve_ipv4(host, port).await?;
                let connected = match &endpoint.username {
                    Some(user_id) => {
                        Socks4Stream::connect_with_userid_and_socket(socket, target, user_id).await
                    }
                    None => Socks4Stream::connect_with_socket(socket, target).await,
                };
                connected.map(Socks4Stream::into_inner)
            }
            ProxyProtocol::Socks4a => {
                let connected = match &endpoint.username {
                    Some(user_id) => {
                        Socks4Stream::connect_with_userid_and_socket(socket, (host, port), user_id)
                            .await
                    }
                    None => Socks4Stream::connect_with_socket(socket, (host, port)).await,
                };
                connected.map(Socks4Stream::into_inner)
            }
            ProxyProtocol::Socks5 | ProxyProtocol::Socks5h => {
                let connected = match (&endpoint.username, &endpoint.password) {
                    (Some(username), Some(password)) => {
                        Socks5Stream::connect_with_password_and_socket(
                            socket,
                            (host, port),
                            username,
                            password,
                        )
                        .await
                    }
                    _ => Socks5Stream::connect_with_socket(socket, (host, port)).await,
                };
                connected.map(Socks5Stream::into_inner)
            }
            ProxyProtocol::Http | ProxyProtocol::Https => {
                return Err(SupervisorError::ProtocolNotSupported(
                    endpoint.protocol.to_string(),
                ))
            }
        }
        .map_err(|e| {
            SupervisorError::Transport(format!("{} connect failed: {}", endpoint.protocol, e))
        })?;

        debug!("{} connection established", endpoint.protocol);
        Ok(stream)
    }

    /// Open a TCP connection to the endpoint itself
    async fn dial(endpoint: &ProxyEndpoint) -> Result<TcpStream> {
        let stream = TcpStream::connect(endpoint.authority())
            .await
            .map_err(|e| SupervisorError::Transport(format!("TCP connect failed: {}", e)))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn tls_handshake(
        &self,
        stream: Box<dyn ProxyConnection>,
        host: &str,
        insecure: bool,
    ) -> Result<tokio_rustls::client::TlsStream<Box<dyn ProxyConnection>>> {
        let cell = if insecure {
            &self.insecure_tls
        } else {
            &self.verified_tls
        };
        let connector = cell
            .get_or_init(|| build_tls_connector(insecure))
            .clone()
            .map_err(SupervisorError::Tls)?;

        let name = host.trim_start_matches('[').trim_end_matches(']');
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|e| SupervisorError::Tls(format!("invalid server name {}: {}", name, e)))?;

        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| SupervisorError::Tls(format!("handshake with {} failed: {}", name, e)))
    }

    /// Parse host and port from an absolute URI
    pub fn parse_target(uri: &Uri) -> Result<(String, u16)> {
        let host = uri
            .host()
            .ok_or_else(|| SupervisorError::InvalidRequest("Missing host in URI".to_string()))?
            .to_lowercase();

        let port = uri.port_u16().unwrap_or_else(|| match uri.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });

        Ok((host, port))
    }

    /// Parse host and port from authority (for CONNECT requests)
    pub fn parse_authority(authority: &str) -> Result<(String, u16)> {
        let invalid =
            || SupervisorError::InvalidRequest(format!("Invalid authority: {}", authority));

        let uri: Uri = format!("http://{}", authority)
            .parse()
            .map_err(|_| invalid())?;

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(invalid)?
            .to_lowercase();

        // Default to port 443 for CONNECT (typically HTTPS)
        Ok((host, uri.port_u16().unwrap_or(443)))
    }
}

/// `host:port`, bracketing bare IPv6 literals
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| SupervisorError::Transport(format!("DNS lookup for {} failed: {}", host, e)))?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| SupervisorError::Transport(format!("No IPv4 address for {}", host)))
}

/// A keep-alive connection borrowed from the idle cache
pub struct PooledSender {
    key: String,
    sender: SendRequest<ProxyBody>,
    cache: Arc<IdleCache>,
}

impl PooledSender {
    /// Return the connection for reuse; only call once its response body is fully read
    pub fn release(self) {
        self.cache.checkin(self.key, self.sender);
    }
}

/// Idle keep-alive connections keyed by endpoint identity, bounded in total
struct IdleCache {
    max_idle: usize,
    count: AtomicUsize,
    senders: DashMap<String, Vec<SendRequest<ProxyBody>>>,
}

impl IdleCache {
    fn new(max_idle: usize) -> Self {
        Self {
            max_idle,
            count: AtomicUsize::new(0),
            senders: DashMap::new(),
        }
    }

    async fn checkout(&self, key: &str) -> Option<SendRequest<ProxyBody>> {
        loop {
            let candidate = self.senders.get_mut(key)?.pop();
            let mut sender = candidate?;
            self.count.fetch_sub(1, Ordering::SeqCst);

            if sender.is_closed() {
                continue;
            }
            if sender.ready().await.is_ok() {
                return Some(sender);
            }
        }
    }

    fn checkin(&self, key: String, sender: SendRequest<ProxyBody>) {
        if sender.is_closed() {
            return;
        }

        // Over the bound the connection is simply dropped
        let reserved = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c < self.max_idle).then_some(c + 1)
            })
            .is_ok();
        if !reserved {
            return;
        }

        self.senders.entry(key).or_default().push(sender);
    }

    fn purge(&self, key: &str) {
        if let Some((_, senders)) = self.senders.remove(key) {
            self.count.fetch_sub(senders.len(), Ordering::SeqCst);
        }
    }
}

fn build_tls_connector(insecure: bool) -> std::result::Result<TlsConnector, String> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?;

    let config = if insecure {
        warn!("Certificate verification disabled for https targets");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        match rustls_native_certs::load_native_certs() {
            Ok(certs) => {
                let (added, ignored) = roots.add_parsable_certificates(certs);
                debug!(added, ignored, "Loaded native root certificates");
            }
            Err(e) => warn!("Could not load native root certificates: {}", e),
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Verifier that accepts any server certificate while still checking
/// handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target_defaults_ports() {
        let uri: Uri = "http://Example.com/path".parse().unwrap();
        assert_eq!(
            ProxyTransport::parse_target(&uri).unwrap(),
            ("example.com".to_string(), 80)
        );

        let uri: Uri = "https://example.com/".parse().unwrap();
        assert_eq!(ProxyTransport::parse_target(&uri).unwrap().1, 443);

        let uri: Uri = "/relative".parse().unwrap();
        assert!(ProxyTransport::parse_target(&uri).is_err());
    }

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            ProxyTransport::parse_authority("example.com:8443").unwrap(),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            ProxyTransport::parse_authority("example.com").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            ProxyTransport::parse_authority("[::1]:443").unwrap(),
            ("[::1]".to_string(), 443)
        );
        assert!(ProxyTransport::parse_authority("example.com:notaport").is_err());
    }

    #[test]
    fn test_format_authority() {
        assert_eq!(format_authority("example.com", 443), "example.com:443");
        assert_eq!(format_authority("::1", 443), "[::1]:443");
        assert_eq!(format_authority("[::1]", 443), "[::1]:443");
    }

    #[tokio::test]
    async fn test_send_rejects_unsupported_scheme() {
        let transport = ProxyTransport::new(4);
        let endpoint = ProxyEndpoint::parse("127.0.0.1:9").unwrap();
        let req = Request::builder()
            .uri("ftp://example.com/file")
            .body(empty_body())
            .unwrap();

        let result = transport.send(&endpoint, req, false).await;
        assert!(matches!(
            result,
            Err(SupervisorError::ProtocolNotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_open_tunnel_relays_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 407 Go Away\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let transport = ProxyTransport::new(4);
        let endpoint = ProxyEndpoint::parse(&addr.to_string()).unwrap();
        let reply = transport
            .open_tunnel(&endpoint, "example.com", 443, HeaderMap::new())
            .await
            .unwrap();

        match reply {
            TunnelReply::Rejected { status, reason } => {
                assert_eq!(status, StatusCode::PROXY_AUTHENTICATION_REQUIRED);
                assert_eq!(reason, "Go Away");
            }
            TunnelReply::Established { .. } => panic!("tunnel should be rejected"),
        }
    }

    #[tokio::test]
    async fn test_open_tunnel_refused_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = ProxyTransport::new(4);
        let endpoint = ProxyEndpoint::parse(&addr.to_string()).unwrap();
        let result = transport
            .open_tunnel(&endpoint, "example.com", 443, HeaderMap::new())
            .await;

        assert!(matches!(result, Err(SupervisorError::Transport(_))));
    }
}
