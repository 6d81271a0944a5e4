use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hyper::header::HeaderName;
use hyper::Method;

use crate::error::{Result, SupervisorError};
use crate::proxy::balancer::DEFAULT_MAX_IDLE_SOCKETS;
use crate::proxy::forward::{ConnectRejectPolicy, ForwardOptions, DEFAULT_TARGET_HEADER};
use crate::proxy::monitor::MonitorConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Balancer and listener configuration
    pub proxy: ProxyServerConfig,
    /// Health monitor configuration, absent when no probe target is set
    pub monitor: Option<MonitorSettings>,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 9999)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// File with one proxy address per line
    pub list_path: Option<PathBuf>,
    /// Deadline for each upstream attempt in milliseconds
    pub timeout_ms: u64,
    /// Header carrying the destination URL
    pub target_header: String,
    /// Bound on idle keep-alive connections to upstream proxies
    pub max_idle_sockets: usize,
    /// Treat scheme-less `host:1080` addresses as SOCKS5
    pub infer_socks: bool,
    pub connect_rejects: ConnectRejectPolicy,
    /// Skip certificate verification for https targets
    pub insecure_tls: bool,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub target: String,
    pub method: String,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let monitor_target = get_env_or("MONITOR_TARGET", "");
        let monitor = if monitor_target.trim().is_empty() {
            None
        } else {
            Some(MonitorSettings {
                target: monitor_target.trim().to_string(),
                method: get_env_or("MONITOR_METHOD", "GET").to_uppercase(),
                interval_ms: parse_env("MONITOR_INTERVAL_MS", "300000")?,
                timeout_ms: parse_env("MONITOR_TIMEOUT_MS", "3000")?,
            })
        };

        let list_path = get_env_or("PROXY_LIST", "");

        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "9999").parse().map_err(|_| {
                    SupervisorError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                list_path: Some(list_path.trim())
                    .filter(|p| !p.is_empty())
                    .map(PathBuf::from),
                timeout_ms: parse_env("PROXY_TIMEOUT_MS", "30000")?,
                target_header: get_env_or("PROXY_TARGET_HEADER", DEFAULT_TARGET_HEADER)
                    .to_lowercase(),
                max_idle_sockets: parse_env(
                    "PROXY_MAX_IDLE_SOCKETS",
                    &DEFAULT_MAX_IDLE_SOCKETS.to_string(),
                )?,
                infer_socks: parse_env("PROXY_INFER_SOCKS", "false")?,
                connect_rejects: get_env_or("PROXY_PENALIZE_CONNECT_REJECTS", "status").parse()?,
                insecure_tls: parse_env("PROXY_INSECURE_TLS", "false")?,
            },
            monitor,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.proxy.host, self.proxy.port)
            .parse()
            .map_err(|_| {
                SupervisorError::InvalidConfig(format!(
                    "invalid listen address {}:{}",
                    self.proxy.host, self.proxy.port
                ))
            })
    }

    /// Options for the request and CONNECT middlewares
    pub fn forward_options(&self) -> Result<ForwardOptions> {
        let target_header = HeaderName::from_bytes(self.proxy.target_header.as_bytes())
            .map_err(|_| {
                SupervisorError::InvalidConfig(format!(
                    "PROXY_TARGET_HEADER is not a valid header name: {}",
                    self.proxy.target_header
                ))
            })?;

        Ok(ForwardOptions::default()
            .timeout(Duration::from_millis(self.proxy.timeout_ms))
            .target_header(target_header)
            .accept_invalid_certs(self.proxy.insecure_tls)
            .connect_rejects(self.proxy.connect_rejects))
    }

    /// Monitor configuration, when a probe target is set
    pub fn monitor_config(&self) -> Result<Option<MonitorConfig>> {
        let Some(settings) = &self.monitor else {
            return Ok(None);
        };

        let method = Method::from_bytes(settings.method.as_bytes()).map_err(|_| {
            SupervisorError::InvalidConfig(format!("invalid MONITOR_METHOD: {}", settings.method))
        })?;

        Ok(Some(
            MonitorConfig::new(settings.target.clone())
                .method(method)
                .interval(Duration::from_millis(settings.interval_ms))
                .timeout(Duration::from_millis(settings.timeout_ms)),
        ))
    }

    /// Read the proxy list named by `PROXY_LIST`
    pub fn load_proxy_list(&self) -> Result<Vec<String>> {
        let path = self
            .proxy
            .list_path
            .as_deref()
            .ok_or_else(|| SupervisorError::MissingEnvVar("PROXY_LIST".into()))?;
        read_proxy_list(path)
    }
}

/// One address per line; blank lines and `#` comments are skipped
pub fn read_proxy_list(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        SupervisorError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(parse_proxy_list(&contents))
}

pub fn parse_proxy_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = get_env_or(key, default);
    raw.trim().parse().map_err(|_| {
        SupervisorError::InvalidConfig(format!("{} has an invalid value: {}", key, raw))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "PROXY_PORT",
        "PROXY_HOST",
        "PROXY_LIST",
        "PROXY_TIMEOUT_MS",
        "PROXY_TARGET_HEADER",
        "PROXY_MAX_IDLE_SOCKETS",
        "PROXY_INFER_SOCKS",
        "PROXY_PENALIZE_CONNECT_REJECTS",
        "PROXY_INSECURE_TLS",
        "MONITOR_TARGET",
        "MONITOR_METHOD",
        "MONITOR_INTERVAL_MS",
        "MONITOR_TIMEOUT_MS",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy.port, 9999);
        assert_eq!(config.proxy.host, "0.0.0.0");
        assert!(config.proxy.list_path.is_none());
        assert_eq!(config.proxy.timeout_ms, 30_000);
        assert_eq!(config.proxy.target_header, "proxy-target-url");
        assert_eq!(config.proxy.max_idle_sockets, 1024);
        assert!(!config.proxy.infer_socks);
        assert_eq!(config.proxy.connect_rejects, ConnectRejectPolicy::Status);
        assert!(config.monitor.is_none());
        assert!(config.monitor_config().unwrap().is_none());
        assert_eq!(config.log.format, "pretty");

        assert!(matches!(
            config.load_proxy_list(),
            Err(SupervisorError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "8080");
        env::set_var("PROXY_HOST", "127.0.0.1");
        env::set_var("PROXY_TIMEOUT_MS", "1500");
        env::set_var("PROXY_TARGET_HEADER", "X-Target");
        env::set_var("PROXY_INFER_SOCKS", "true");
        env::set_var("PROXY_PENALIZE_CONNECT_REJECTS", "ignore");
        env::set_var("MONITOR_TARGET", "http://example.com/health");
        env::set_var("MONITOR_METHOD", "head");
        env::set_var("MONITOR_INTERVAL_MS", "60000");

        let config = Config::from_env().unwrap();

        assert_eq!(config.proxy_addr().unwrap().to_string(), "127.0.0.1:8080");
        assert!(config.proxy.infer_socks);

        let options = config.forward_options().unwrap();
        assert_eq!(options.timeout, Duration::from_millis(1500));
        assert_eq!(options.target_header.as_str(), "x-target");
        assert_eq!(options.connect_rejects, ConnectRejectPolicy::Ignore);

        let monitor = config.monitor_config().unwrap().unwrap();
        assert_eq!(monitor.target, "http://example.com/health");
        assert_eq!(monitor.method, Method::HEAD);
        assert_eq!(monitor.interval, Duration::from_secs(60));
        assert_eq!(monitor.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_TIMEOUT_MS", "soon");
        assert!(matches!(
            Config::from_env(),
            Err(SupervisorError::InvalidConfig(_))
        ));

        env::remove_var("PROXY_TIMEOUT_MS");
        env::set_var("PROXY_PENALIZE_CONNECT_REJECTS", "maybe");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_parse_proxy_list_skips_blanks_and_comments() {
        let list = "\n# upstream pool\n10.0.0.1:8080\n   \nsocks5://10.0.0.2:1080  \n#10.0.0.3\n";
        assert_eq!(
            parse_proxy_list(list),
            vec!["10.0.0.1:8080", "socks5://10.0.0.2:1080"]
        );
    }
}
