//! CONNECT tunnel implementation for HTTPS proxying
//!
//! Handles bidirectional data transfer between client and target server.

use std::sync::Arc;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SupervisorError};
use crate::models::ProxyEndpoint;
use crate::proxy::balancer::Balancer;
use crate::proxy::forward::{error_response, ForwardOptions};
use crate::proxy::strategy::SelectionContext;
use crate::proxy::transport::{
    format_authority, ProxyBody, ProxyConnection, ProxyTransport, TunnelReply,
};

const ESTABLISHED: &[u8] = b"Connection Established";

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// CONNECT middleware returned by [`Balancer::connect`]
#[derive(Clone)]
pub struct ConnectMiddleware {
    balancer: Balancer,
    options: Arc<ForwardOptions>,
}

/// An endpoint that accepted the CONNECT
struct OpenTunnel {
    endpoint: Arc<ProxyEndpoint>,
    host: String,
    stream: Box<dyn ProxyConnection>,
}

/// Why no tunnel was opened
enum Refusal {
    Failed(SupervisorError),
    Rejected { status: StatusCode, reason: String },
}

impl ConnectMiddleware {
    pub fn new(balancer: Balancer, options: ForwardOptions) -> Self {
        Self {
            balancer,
            options: Arc::new(options),
        }
    }

    /// Handle a CONNECT request received by a hyper server.
    ///
    /// The returned response upgrades the client connection; splicing runs
    /// on a spawned task once hyper hands over the socket.
    #[instrument(skip(self, req), fields(uri = %req.uri()))]
    pub async fn handle(&self, mut req: Request<Incoming>) -> Response<ProxyBody> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| req.uri().to_string());

        let headers = std::mem::take(req.headers_mut());
        let tunnel = match self.open(&authority, headers).await {
            Ok(tunnel) => tunnel,
            Err(Refusal::Failed(e)) => {
                self.options.complete(Some(&e));
                return error_response(e.status_code());
            }
            Err(Refusal::Rejected { status, reason }) => {
                let mut response = error_response(status);
                if let Ok(phrase) = ReasonPhrase::try_from(reason.as_bytes()) {
                    response.extensions_mut().insert(phrase);
                }
                self.options.complete(Some(&SupervisorError::ConnectNotOk {
                    status: status.as_u16(),
                    reason,
                }));
                return response;
            }
        };

        let on_upgrade = hyper::upgrade::on(&mut req);
        let options = self.options.clone();

        tokio::spawn(async move {
            let OpenTunnel { endpoint, host, stream } = tunnel;
            match on_upgrade.await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    match copy_bidirectional(client, stream).await {
                        Ok(_) => options.complete(None),
                        Err(e) => {
                            debug!("Tunnel through {} to {} ended: {}", endpoint, host, e);
                            options.complete(Some(&e));
                        }
                    }
                }
                Err(e) => {
                    debug!("CONNECT upgrade failed: {}", e);
                    options.complete(Some(&SupervisorError::Http(e.to_string())));
                }
            }
        });

        let mut response = error_response(StatusCode::OK);
        response
            .extensions_mut()
            .insert(ReasonPhrase::from_static(ESTABLISHED));
        response
    }

    /// Handle a CONNECT on a raw client socket whose request head has
    /// already been read; `head` holds any bytes the client sent after it.
    ///
    /// The status line is written by hand: `200 Connection Established` on
    /// success, the upstream's status line on rejection, `502 Bad Gateway`
    /// otherwise.
    #[instrument(skip(self, client, head))]
    pub async fn handle_socket<C>(&self, target: &str, mut client: C, head: Bytes) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let tunnel = match self.open(target, HeaderMap::new()).await {
            Ok(tunnel) => tunnel,
            Err(Refusal::Failed(e)) => {
                client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                let _ = client.shutdown().await;
                self.options.complete(Some(&e));
                return Err(e);
            }
            Err(Refusal::Rejected { status, reason }) => {
                let line = format!("HTTP/1.1 {} {}\r\n\r\n", status.as_u16(), reason);
                client.write_all(line.as_bytes()).await?;
                let _ = client.shutdown().await;
                let e = SupervisorError::ConnectNotOk {
                    status: status.as_u16(),
                    reason,
                };
                self.options.complete(Some(&e));
                return Err(e);
            }
        };

        let OpenTunnel { mut stream, .. } = tunnel;
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        if !head.is_empty() {
            stream.write_all(&head).await?;
        }

        let result = copy_bidirectional(client, stream).await;
        self.options.complete(result.as_ref().err());
        result.map(|_| ())
    }

    /// Select an endpoint and open a tunnel to `authority` through it,
    /// reporting the outcome to the balancer
    async fn open(
        &self,
        authority: &str,
        headers: HeaderMap,
    ) -> std::result::Result<OpenTunnel, Refusal> {
        let (host, port) = ProxyTransport::parse_authority(authority).map_err(Refusal::Failed)?;
        let target: Uri = format_authority(&host, port)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| {
                Refusal::Failed(SupervisorError::InvalidRequest(e.to_string()))
            })?;

        let endpoint = {
            let ctx = SelectionContext {
                target: &target,
                host: &host,
                method: &hyper::Method::CONNECT,
                headers: &headers,
            };
            match self.balancer.select(&ctx) {
                Ok(Some(endpoint)) => endpoint,
                Ok(None) => {
                    warn!("No proxy available for {}", host);
                    return Err(Refusal::Failed(SupervisorError::NoProxyAvailable));
                }
                Err(e) => {
                    error!("Selection failed: {}", e);
                    return Err(Refusal::Failed(e));
                }
            }
        };

        let headers = self.options.outbound_headers(&endpoint, headers);
        let opened = tokio::time::timeout(
            self.options.timeout,
            self.balancer
                .transport()
                .open_tunnel(&endpoint, &host, port, headers),
        )
        .await
        .unwrap_or(Err(SupervisorError::Timeout));

        match opened {
            Ok(TunnelReply::Established { status, stream }) => {
                info!("CONNECT tunnel established through {} to {}:{}", endpoint, host, port);
                self.balancer.report_response(&endpoint, &host, status);
                Ok(OpenTunnel {
                    endpoint,
                    host,
                    stream,
                })
            }
            Ok(TunnelReply::Rejected { status, reason }) => {
                warn!("CONNECT through {} rejected: {} {}", endpoint, status.as_u16(), reason);
                self.balancer.report_rejection(
                    &endpoint,
                    &host,
                    status,
                    &reason,
                    self.options.connect_rejects,
                );
                Err(Refusal::Rejected { status, reason })
            }
            Err(e) => {
                warn!("CONNECT through {} failed: {}", endpoint, e);
                if e.is_attempt_failure() {
                    self.balancer.report_error(&endpoint, &host, &e);
                }
                Err(Refusal::Failed(e))
            }
        }
    }
}

/// Copy data bidirectionally between two streams.
///
/// As soon as one side reaches EOF or fails, both writers are shut down and
/// both streams dropped, so one peer closing tears down the other. Returns
/// the bytes copied client to server and server to client.
pub async fn copy_bidirectional<C, S>(client: C, server: S) -> Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);
    let mut sent = 0u64;
    let mut received = 0u64;

    let first = {
        let upload = pipe(&mut client_read, &mut server_write, &mut sent);
        let download = pipe(&mut server_read, &mut client_write, &mut received);
        tokio::select! {
            result = upload => result,
            result = download => result,
        }
    };

    let _ = server_write.shutdown().await;
    let _ = client_write.shutdown().await;

    debug!(bytes_sent = sent, bytes_received = received, "Tunnel closed");
    first?;
    Ok((sent, received))
}

/// Copy `reader` into `writer` until EOF, counting bytes as they are written
async fn pipe<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
    writer.shutdown().await
}
