use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors produced while talking to (or preparing to talk to) one upstream
/// provider. The dispatch pipeline decides retry/fallback from the variant.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("no usable credential: {0}")]
    CredentialMissing(String),

    #[error("token refresh failed with status {status} for provider {provider_uuid}")]
    RefreshFailed { status: u16, provider_uuid: String },

    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream response could not be parsed: {0}")]
    Protocol(String),

    #[error("unsupported: {0}")]
    NotSupported(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Retriable within the same provider (backoff loop in dispatch).
    pub fn is_retriable(&self) -> bool {
        match self {
            ProviderError::UpstreamStatus { status, .. } => {
                *status == 429 || (500..600).contains(status)
            }
            ProviderError::Network(_) => true,
            _ => false,
        }
    }

    /// HTTP 403: triggers a one-shot token refresh before retrying.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, ProviderError::UpstreamStatus { status: 403, .. })
    }
}

/// Errors surfaced to the inbound client, already mapped to an HTTP status.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing or invalid api key")]
    Unauthorized,

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("no provider available for {provider_type}")]
    NoProviderAvailable { provider_type: String },

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl GatewayError {
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Unauthorized => 401,
            GatewayError::BadRequest(_) => 400,
            GatewayError::NoProviderAvailable { .. } => 503,
            GatewayError::Provider(err) => match err {
                ProviderError::UpstreamStatus { status, .. } => *status,
                ProviderError::CredentialMissing(_) | ProviderError::RefreshFailed { .. } => 502,
                ProviderError::Network(_) => 502,
                ProviderError::Protocol(_) => 502,
                ProviderError::NotSupported(_) => 501,
                ProviderError::InvalidConfig(_) | ProviderError::Other(_) => 500,
            },
        }
    }
}
