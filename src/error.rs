use http::StatusCode;

/// Error type shared by the dialers, the request handlers and startup
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream rejected: {reason}")]
    UpstreamRejected {
        status: Option<StatusCode>,
        reason: String,
    },

    #[error("local transport cannot be tunneled: {0}")]
    LocalTransportUnsupported(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::UpstreamRejected {
            status: None,
            reason: reason.into(),
        }
    }

    /// Status the upstream answered with, when it answered at all
    pub fn upstream_status(&self) -> Option<StatusCode> {
        match self {
            Self::UpstreamRejected { status, .. } => *status,
            _ => None,
        }
    }
}
