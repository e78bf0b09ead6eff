use thiserror::Error;

/// Internal error taxonomy, surfaced verbatim as the `code` field of a backend
/// error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayErrorCode {
    RelayInternalError,
    GatewayTimeout,
    GatewayError,
    Aborted,
    NoRunId,
    UsageRequired,
}

impl RelayErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelayInternalError => "RELAY_INTERNAL_ERROR",
            Self::GatewayTimeout => "GATEWAY_TIMEOUT",
            Self::GatewayError => "GATEWAY_ERROR",
            Self::Aborted => "ABORTED",
            Self::NoRunId => "NO_RUN_ID",
            Self::UsageRequired => "USAGE_REQUIRED",
        }
    }
}

impl std::fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal typed error passed between the Gateway client, chat runner, and
/// processor. Carries enough context to classify retryability and to build a
/// terminal callback without re-deriving it at the boundary.
#[derive(Debug, Error, Clone)]
pub enum RelayError {
    #[error("gateway timed out waiting for a terminal event")]
    GatewayTimeout,

    #[error("gateway request failed: {message}")]
    GatewayRequest {
        message: String,
        retryable: bool,
        #[source]
        source: Option<GatewaySourceError>,
    },

    #[error("gateway closed: code={code} reason={reason}")]
    GatewayClosed { code: u16, reason: String },

    #[error("chat run was aborted")]
    Aborted,

    #[error("gateway accepted send but omitted runId")]
    NoRunId,

    #[error("usage snapshot could not be obtained")]
    UsageRequired,

    #[error("circuit open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Placeholder for a lower-level transport/backend error retained only for display;
/// `thiserror`'s `#[source]` requires `std::error::Error`, and we don't want to
/// carry a `Box<dyn Error>` across an `Arc`-shared, `Clone`-able error type.
#[derive(Debug, Clone)]
pub struct GatewaySourceError(pub String);

impl std::fmt::Display for GatewaySourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for GatewaySourceError {}

impl RelayError {
    /// Maps an internal error to the code surfaced to the backend.
    pub fn code(&self) -> RelayErrorCode {
        match self {
            Self::GatewayTimeout => RelayErrorCode::GatewayTimeout,
            Self::GatewayRequest { .. } | Self::GatewayClosed { .. } | Self::CircuitOpen { .. } => {
                RelayErrorCode::GatewayError
            }
            Self::Aborted => RelayErrorCode::Aborted,
            Self::NoRunId => RelayErrorCode::NoRunId,
            Self::UsageRequired => RelayErrorCode::UsageRequired,
            Self::Internal(_) => RelayErrorCode::RelayInternalError,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::GatewayRequest { retryable, .. } => *retryable,
            Self::GatewayTimeout | Self::GatewayClosed { .. } | Self::CircuitOpen { .. } => true,
            Self::Aborted | Self::NoRunId | Self::UsageRequired | Self::Internal(_) => false,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
