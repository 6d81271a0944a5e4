use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the proxy supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    // Selection errors
    #[error("No proxy available")]
    NoProxyAvailable,

    #[error("No selection hook provided")]
    NoNextProvided,

    // Upstream attempt errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Upstream attempt timed out")]
    Timeout,

    #[error("CONNECT rejected by upstream: {status} {reason}")]
    ConnectNotOk { status: u16, reason: String },

    #[error("Client closed the connection before the response completed")]
    ClientAborted,

    #[error("Protocol not supported: {0}")]
    ProtocolNotSupported(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // Address errors
    #[error("Invalid proxy address: {0}")]
    InvalidAddress(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

impl SupervisorError {
    /// Get the HTTP status code the client sees for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            SupervisorError::InvalidRequest(_)
            | SupervisorError::InvalidAddress(_)
            | SupervisorError::ProtocolNotSupported(_)
            | SupervisorError::ClientAborted => StatusCode::BAD_REQUEST,

            // Relayed from the upstream proxy
            SupervisorError::ConnectNotOk { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }

            // 502 Bad Gateway
            SupervisorError::NoProxyAvailable
            | SupervisorError::Transport(_)
            | SupervisorError::Timeout
            | SupervisorError::Tls(_)
            | SupervisorError::Io(_)
            | SupervisorError::Http(_) => StatusCode::BAD_GATEWAY,

            // 500 Internal Server Error
            SupervisorError::NoNextProvided
            | SupervisorError::InvalidConfig(_)
            | SupervisorError::MissingEnvVar(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error is a failed upstream attempt that must be fed to the failure policy
    pub fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            SupervisorError::Transport(_)
                | SupervisorError::Timeout
                | SupervisorError::Tls(_)
                | SupervisorError::Io(_)
                | SupervisorError::Http(_)
        )
    }
}

// Convert from hyper errors
impl From<hyper::Error> for SupervisorError {
    fn from(err: hyper::Error) -> Self {
        SupervisorError::Http(err.to_string())
    }
}

impl From<http::Error> for SupervisorError {
    fn from(err: http::Error) -> Self {
        SupervisorError::InvalidRequest(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for SupervisorError {
    fn from(err: url::ParseError) -> Self {
        SupervisorError::InvalidAddress(err.to_string())
    }
}
