use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use url::Url;

use crate::error::{Result, SupervisorError};

/// Port conventionally used by SOCKS proxies
pub const SOCKS_PORT: u16 = 1080;

/// Upstream proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks4,
    Socks4a,
    Socks5,
    Socks5h,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks4a => "socks4a",
            ProxyProtocol::Socks5 => "socks5",
            ProxyProtocol::Socks5h => "socks5h",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks4" => Some(ProxyProtocol::Socks4),
            "socks4a" => Some(ProxyProtocol::Socks4a),
            "socks" | "socks5" => Some(ProxyProtocol::Socks5),
            "socks5h" => Some(ProxyProtocol::Socks5h),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        !self.is_http()
    }

    pub fn is_http(&self) -> bool {
        matches!(self, ProxyProtocol::Http | ProxyProtocol::Https)
    }

    /// Port assumed when an address omits one
    pub fn default_port(&self) -> u16 {
        match self {
            ProxyProtocol::Http => 80,
            ProxyProtocol::Https => 443,
            _ => SOCKS_PORT,
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One upstream forward proxy.
///
/// Identity is the normalized `host:port` pair returned by [`ProxyEndpoint::id`];
/// two endpoints with the same identity are the same proxy even when their
/// scheme or credentials differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    id: String,
    pub protocol: ProxyProtocol,
    pub hostname: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Free-form data attached by hooks; kept when the endpoint is re-added
    pub meta: HashMap<String, String>,
}

impl ProxyEndpoint {
    /// Parse an address: `host`, `host:port` or `scheme://[user[:pass]@]host[:port][/path]`.
    /// The scheme defaults to `http`.
    pub fn parse(address: &str) -> Result<Self> {
        Self::parse_with(address, false)
    }

    /// Like [`ProxyEndpoint::parse`], but a scheme-less address on the SOCKS port
    /// is taken to be a SOCKS5 proxy when `infer_socks` is set.
    pub fn parse_with(address: &str, infer_socks: bool) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(SupervisorError::InvalidAddress("empty address".to_string()));
        }

        let has_scheme = address.contains("://");
        let url = if has_scheme {
            Url::parse(address)?
        } else {
            Url::parse(&format!("http://{}", address))?
        };

        let mut protocol = ProxyProtocol::from_str(url.scheme())
            .ok_or_else(|| SupervisorError::ProtocolNotSupported(url.scheme().to_string()))?;

        let hostname = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SupervisorError::InvalidAddress(format!("missing host in {}", address)))?
            .to_lowercase();

        // `Url` drops the port when it equals the scheme's known default
        let port = match url.port() {
            Some(port) => port,
            None => protocol.default_port(),
        };

        if !has_scheme && infer_socks && port == SOCKS_PORT {
            protocol = ProxyProtocol::Socks5;
        }

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = url.password().map(str::to_string);

        Ok(Self {
            id: format!("{}:{}", hostname, port),
            protocol,
            hostname,
            port,
            username,
            password,
            meta: HashMap::new(),
        })
    }

    /// Take the scheme and credentials of a re-added address with the same
    /// identity, keeping everything hooks attached
    pub fn update_from(&mut self, other: ProxyEndpoint) {
        debug_assert_eq!(self.id, other.id);
        self.protocol = other.protocol;
        self.username = other.username;
        self.password = other.password;
    }

    /// Normalized `host:port` identity
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address to dial, `host:port`
    pub fn authority(&self) -> &str {
        &self.id
    }

    /// Whether the endpoint carries credentials
    pub fn has_credentials(&self) -> bool {
        self.username.is_some()
    }

    /// `Proxy-Authorization` header value for endpoints with credentials
    pub fn basic_auth(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        Some(format!("Basic {}", BASE64.encode(credentials.as_bytes())))
    }

    /// Get proxy URL with optional authentication
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("{}://{}:{}@{}", self.protocol, user, pass, self.id)
            }
            (Some(user), None) => format!("{}://{}@{}", self.protocol, user, self.id),
            _ => format!("{}://{}", self.protocol, self.id),
        }
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.id)
    }
}

impl std::str::FromStr for ProxyEndpoint {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
