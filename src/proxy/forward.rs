//! Plain request relay
//!
//! Forwards absolute-form requests through an endpoint chosen by the
//! balancer and streams the response back, feeding the outcome of each
//! attempt to the balancer's policy exactly once.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HOST};
use hyper::{HeaderMap, Request, Response, StatusCode, Uri, Version};
use tracing::{debug, error, instrument, warn};

use crate::error::{Result, SupervisorError};
use crate::models::ProxyEndpoint;
use crate::proxy::balancer::Balancer;
use crate::proxy::body::{BodyOutcome, ReportingBody};
use crate::proxy::strategy::SelectionContext;
use crate::proxy::transport::{empty_body, BoxError, ProxyBody, Upstream};

/// Default header carrying the real destination
pub const DEFAULT_TARGET_HEADER: &str = "proxy-target-url";

/// Default deadline for one upstream attempt, and for each gap between
/// frames of the response body
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Rewrites outbound headers for the chosen endpoint
pub type FormatHeaders = dyn Fn(&ProxyEndpoint, HeaderMap) -> HeaderMap + Send + Sync;

/// Invoked once per client request, with the error when it failed
pub type OnComplete = dyn Fn(Option<&SupervisorError>) + Send + Sync;

/// How a non-2xx CONNECT reply from an endpoint feeds the policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectRejectPolicy {
    /// Report the status like any response
    #[default]
    Status,
    /// Report the rejection as a failed attempt
    Error,
    /// Leave the backoff state untouched
    Ignore,
}

impl FromStr for ConnectRejectPolicy {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "status" => Ok(Self::Status),
            "error" => Ok(Self::Error),
            "ignore" => Ok(Self::Ignore),
            other => Err(SupervisorError::InvalidConfig(format!(
                "unknown connect reject policy: {}",
                other
            ))),
        }
    }
}

/// Options shared by the request and CONNECT middlewares
#[derive(Clone)]
pub struct ForwardOptions {
    pub timeout: Duration,
    pub target_header: HeaderName,
    pub format_headers: Option<Arc<FormatHeaders>>,
    pub on_complete: Option<Arc<OnComplete>>,
    /// Skip certificate verification towards https targets
    pub accept_invalid_certs: bool,
    pub connect_rejects: ConnectRejectPolicy,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            target_header: HeaderName::from_static(DEFAULT_TARGET_HEADER),
            format_headers: None,
            on_complete: None,
            accept_invalid_certs: false,
            connect_rejects: ConnectRejectPolicy::Status,
        }
    }
}

impl ForwardOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn target_header(mut self, name: HeaderName) -> Self {
        self.target_header = name;
        self
    }

    pub fn format_headers<F>(mut self, f: F) -> Self
    where
        F: Fn(&ProxyEndpoint, HeaderMap) -> HeaderMap + Send + Sync + 'static,
    {
        self.format_headers = Some(Arc::new(f));
        self
    }

    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&SupervisorError>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn connect_rejects(mut self, policy: ConnectRejectPolicy) -> Self {
        self.connect_rejects = policy;
        self
    }

    pub(crate) fn complete(&self, error: Option<&SupervisorError>) {
        if let Some(on_complete) = &self.on_complete {
            on_complete(error);
        }
    }

    /// Headers to send upstream: hop-by-hop and override headers removed,
    /// then passed through `format_headers`
    pub(crate) fn outbound_headers(
        &self,
        endpoint: &ProxyEndpoint,
        mut headers: HeaderMap,
    ) -> HeaderMap {
        strip_hop_by_hop(&mut headers);
        headers.remove(&self.target_header);

        match &self.format_headers {
            Some(format) => format(endpoint, headers),
            None => headers,
        }
    }
}

impl std::fmt::Debug for ForwardOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardOptions")
            .field("timeout", &self.timeout)
            .field("target_header", &self.target_header)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("connect_rejects", &self.connect_rejects)
            .finish_non_exhaustive()
    }
}

/// Request middleware returned by [`Balancer::proxy`]
#[derive(Clone)]
pub struct ProxyMiddleware {
    balancer: Balancer,
    options: Arc<ForwardOptions>,
}

impl ProxyMiddleware {
    pub fn new(balancer: Balancer, options: ForwardOptions) -> Self {
        Self {
            balancer,
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &ForwardOptions {
        &self.options
    }

    /// Relay one client request; never fails, errors become status responses
    #[instrument(skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let target = match self.resolve_target(&req) {
            Ok(target) => target,
            Err(e) => {
                debug!("Rejecting request: {}", e);
                return self.fail(e);
            }
        };
        let host = target.host().unwrap_or_default().to_lowercase();

        let ctx = SelectionContext {
            target: &target,
            host: &host,
            method: req.method(),
            headers: req.headers(),
        };
        let endpoint = match self.balancer.select(&ctx) {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => {
                warn!("No proxy available for {}", host);
                return self.fail(SupervisorError::NoProxyAvailable);
            }
            Err(e) => {
                error!("Selection failed: {}", e);
                return self.fail(e);
            }
        };

        debug!("Forwarding to {} through {}", target, endpoint);

        let outbound = self.outbound_request(req, &endpoint, target);
        let sent = tokio::time::timeout(
            self.options.timeout,
            self.balancer.transport().send(
                &endpoint,
                outbound,
                self.options.accept_invalid_certs,
            ),
        )
        .await
        .unwrap_or(Err(SupervisorError::Timeout));

        match sent {
            Ok(upstream) => self.relay(upstream, endpoint, host),
            Err(e) => {
                warn!("Request through {} failed: {}", endpoint, e);
                self.report_failure(&endpoint, &host, &e);
                self.fail(e)
            }
        }
    }

    /// Destination from the override header, else the request line
    fn resolve_target(&self, req: &Request<Incoming>) -> Result<Uri> {
        let target = match req.headers().get(&self.options.target_header) {
            Some(value) => value
                .to_str()
                .map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?
                .parse::<Uri>()
                .map_err(|e| SupervisorError::InvalidRequest(e.to_string()))?,
            None => req.uri().clone(),
        };

        match target.scheme_str() {
            Some("http") | Some("https") => {}
            other => {
                return Err(SupervisorError::ProtocolNotSupported(
                    other.unwrap_or("none").to_string(),
                ))
            }
        }

        if target.host().map_or(true, str::is_empty) {
            return Err(SupervisorError::InvalidRequest(format!(
                "missing host in {}",
                target
            )));
        }

        Ok(target)
    }

    fn outbound_request(
        &self,
        req: Request<Incoming>,
        endpoint: &ProxyEndpoint,
        target: Uri,
    ) -> Request<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        let mut headers = self
            .options
            .outbound_headers(endpoint, std::mem::take(&mut parts.headers));
        // Set again by the transport from the target authority
        headers.remove(HOST);

        parts.uri = target;
        parts.version = Version::HTTP_11;
        parts.headers = headers;
        parts.extensions = Default::default();

        let body = body.map_err(|e| Box::new(e) as BoxError).boxed_unsync();
        Request::from_parts(parts, body)
    }

    fn relay(
        &self,
        upstream: Upstream,
        endpoint: Arc<ProxyEndpoint>,
        host: String,
    ) -> Response<ProxyBody> {
        let Upstream { response, pooled } = upstream;
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let status = parts.status;
        debug!("Upstream answered {}", status);

        let balancer = self.balancer.clone();
        let options = self.options.clone();
        let body = ReportingBody::new(body, move |outcome| match outcome {
            BodyOutcome::Complete => {
                balancer.report_response(&endpoint, &host, status);
                if let Some(pooled) = pooled {
                    pooled.release();
                }
                options.complete(None);
            }
            BodyOutcome::Failed(e) => {
                warn!("Response body from {} failed: {}", endpoint, e);
                balancer.report_error(&endpoint, &host, &e);
                options.complete(Some(&e));
            }
            BodyOutcome::Aborted => {
                // The attempt never finished, so the policy hears nothing
                debug!("Client went away before the end of the response from {}", endpoint);
                options.complete(Some(&SupervisorError::ClientAborted));
            }
        })
        .idle_timeout(self.options.timeout);

        Response::from_parts(parts, body.boxed_unsync())
    }

    fn report_failure(&self, endpoint: &ProxyEndpoint, host: &str, error: &SupervisorError) {
        match error {
            SupervisorError::ConnectNotOk { status, reason } => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                self.balancer.report_rejection(
                    endpoint,
                    host,
                    status,
                    reason,
                    self.options.connect_rejects,
                );
            }
            e if e.is_attempt_failure() => self.balancer.report_error(endpoint, host, e),
            _ => {}
        }
    }

    fn fail(&self, error: SupervisorError) -> Response<ProxyBody> {
        self.options.complete(Some(&error));
        error_response(error.status_code())
    }
}

pub(crate) fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove hop-by-hop headers, including those named by `Connection`
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }

    let hop_by_hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();

    for name in hop_by_hop {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("proxy-authorization"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("content-length"));
    }

    #[test]
    fn test_strip_hop_by_hop_honours_connection_header() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close, x-session"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_outbound_headers_drop_target_header_and_format() {
        let options = ForwardOptions::default().format_headers(|endpoint, mut headers| {
            headers.insert(
                "x-via",
                HeaderValue::from_str(endpoint.id()).unwrap(),
            );
            headers
        });
        let endpoint = ProxyEndpoint::parse("10.0.0.1:8080").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            DEFAULT_TARGET_HEADER,
            HeaderValue::from_static("http://example.com/"),
        );
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic eA=="));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let outbound = options.outbound_headers(&endpoint, headers);

        assert!(!outbound.contains_key(DEFAULT_TARGET_HEADER));
        assert!(!outbound.contains_key("proxy-authorization"));
        assert_eq!(outbound["x-via"], "10.0.0.1:8080");
        assert_eq!(outbound["accept"], "*/*");
    }

    #[test]
    fn test_connect_reject_policy_parsing() {
        assert_eq!(
            "STATUS".parse::<ConnectRejectPolicy>().unwrap(),
            ConnectRejectPolicy::Status
        );
        assert_eq!(
            "error".parse::<ConnectRejectPolicy>().unwrap(),
            ConnectRejectPolicy::Error
        );
        assert_eq!(
            "ignore".parse::<ConnectRejectPolicy>().unwrap(),
            ConnectRejectPolicy::Ignore
        );
        assert!("sometimes".parse::<ConnectRejectPolicy>().is_err());
        assert_eq!(ConnectRejectPolicy::default(), ConnectRejectPolicy::Status);
    }

    #[test]
    fn test_default_options() {
        let options = ForwardOptions::default();
        assert_eq!(options.timeout, Duration::from_secs(30));
        assert_eq!(options.target_header.as_str(), "proxy-target-url");
        assert!(!options.accept_invalid_certs);
    }

    #[test]
    fn test_error_response_has_empty_body() {
        let response = error_response(StatusCode::BAD_GATEWAY);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(hyper::body::Body::is_end_stream(response.body()));
    }
}
