//! Proxy server implementation using hyper
//!
//! Accepts client connections and dispatches CONNECT requests to the tunnel
//! middleware and everything else to the request relay.

use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::error::{Result, SupervisorError};
use crate::proxy::balancer::Balancer;
use crate::proxy::forward::{ForwardOptions, ProxyMiddleware};
use crate::proxy::tunnel::ConnectMiddleware;

/// Proxy server
#[derive(Clone)]
pub struct ProxyServer {
    forward: ProxyMiddleware,
    connect: ConnectMiddleware,
}

impl ProxyServer {
    /// Create a new proxy server relaying through `balancer`
    pub fn new(balancer: &Balancer, options: ForwardOptions) -> Self {
        Self {
            forward: balancer.proxy(options.clone()),
            connect: balancer.connect(options),
        }
    }

    /// Bind `addr` and serve until `shutdown` flips to `true`
    pub async fn run(&self, addr: SocketAddr, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Serve connections accepted on `listener`
    #[instrument(skip(self, listener, shutdown))]
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                let result = server.handle_connection(stream, client_addr).await;
                                if let Err(e) = result {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(self, stream: TcpStream, client_addr: SocketAddr) -> Result<()> {
        debug!("Accepted connection from {}", client_addr);
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let server = self.clone();
            async move {
                let response = if req.method() == Method::CONNECT {
                    server.connect.handle(req).await
                } else {
                    server.forward.handle(req).await
                };
                Ok::<_, Infallible>(response)
            }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(|e| SupervisorError::Http(e.to_string()))?;

        Ok(())
    }
}
