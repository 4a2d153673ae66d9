//! Error types for the broker crate.
//!
//! Every broker operation surfaces failures through [`BrokerError`]. Each
//! variant belongs to exactly one [`ErrorKind`] and maps to exactly one
//! OAuth 2.0 error code, so the HTTP layer never has to inspect messages.

use calbridge_store::StoreError;

/// Coarse classification of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is malformed or violates a precondition.
    Validation,
    /// A referenced client, session or subject does not exist.
    UnknownEntity,
    /// A code, token or PKCE proof was rejected.
    Grant,
    /// A bearer credential did not resolve to a subject.
    Unauthenticated,
    /// The upstream identity provider failed or is misconfigured.
    Upstream,
    /// The credential store failed.
    Storage,
}

/// Unified error type for the identity broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redirect_uris is required")]
    MissingRedirectUris,

    #[error("invalid redirect_uri {uri}: {reason}")]
    InvalidRedirectUri { uri: String, reason: String },

    #[error("{0} is required")]
    MissingParameter(&'static str),

    #[error("only 'code' response_type is supported, got '{0}'")]
    UnsupportedResponseType(String),

    #[error("only S256 code_challenge_method is supported, got '{0}'")]
    UnsupportedChallengeMethod(String),

    #[error("redirect_uri not registered for this client")]
    RedirectUriMismatch,

    #[error("only 'authorization_code' and 'refresh_token' grant types are supported, got '{0}'")]
    UnsupportedGrantType(String),

    #[error("unknown client_id")]
    UnknownClient(String),

    #[error("unknown or expired authorization session")]
    UnknownSession,

    #[error("unknown subject: {0}")]
    UnknownSubject(String),

    #[error("invalid authorization code")]
    InvalidCode,

    #[error("authorization code already used")]
    CodeAlreadyUsed,

    #[error("authorization code expired")]
    CodeExpired,

    /// The code was consumed but the exchange request did not match the
    /// authorization request.
    #[error("{0}")]
    InvalidGrant(&'static str),

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    ExpiredToken,

    #[error("client_id mismatch")]
    ClientMismatch,

    #[error("invalid credentials")]
    Unauthenticated,

    /// The upstream provider rejected a code or refresh token.
    #[error("upstream rejected the request: {reason}")]
    UpstreamRejected { reason: String },

    /// The upstream provider answered with something we could not use.
    #[error("upstream error: {reason}")]
    Upstream { reason: String },

    #[error("upstream configuration is invalid: {reason}")]
    InvalidConfig { reason: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingRedirectUris
            | Self::InvalidRedirectUri { .. }
            | Self::MissingParameter(_)
            | Self::UnsupportedResponseType(_)
            | Self::UnsupportedChallengeMethod(_)
            | Self::RedirectUriMismatch
            | Self::UnsupportedGrantType(_) => ErrorKind::Validation,
            Self::UnknownClient(_) | Self::UnknownSession | Self::UnknownSubject(_) => {
                ErrorKind::UnknownEntity
            }
            Self::InvalidCode
            | Self::CodeAlreadyUsed
            | Self::CodeExpired
            | Self::InvalidGrant(_)
            | Self::InvalidToken
            | Self::ExpiredToken
            | Self::ClientMismatch => ErrorKind::Grant,
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::UpstreamRejected { .. }
            | Self::Upstream { .. }
            | Self::InvalidConfig { .. }
            | Self::Network(_)
            | Self::UrlParse(_)
            | Self::Serialization(_) => ErrorKind::Upstream,
            Self::Store(_) => ErrorKind::Storage,
        }
    }

    /// The RFC 6749 / RFC 6750 `error` code for this failure.
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::UnsupportedResponseType(_) => "unsupported_response_type",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::Unauthenticated => "invalid_token",
            other => match other.kind() {
                ErrorKind::Validation | ErrorKind::UnknownEntity => "invalid_request",
                ErrorKind::Grant => "invalid_grant",
                ErrorKind::Unauthenticated => "invalid_token",
                ErrorKind::Upstream | ErrorKind::Storage => "server_error",
            },
        }
    }

    /// Text safe to return to the caller. Internal failures collapse to a
    /// generic message; the detail belongs in the log.
    pub fn public_description(&self) -> String {
        match self.kind() {
            ErrorKind::Upstream | ErrorKind::Storage => "internal server error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Whether this error is the server's fault rather than the caller's.
    pub fn is_internal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Upstream | ErrorKind::Storage)
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, BrokerError>;
