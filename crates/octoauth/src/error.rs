//! Authorization error types.
//!
//! Every protocol-visible failure is an [`AuthError`]: an RFC 6749 error code
//! plus a human readable description, an optional hint for the client
//! developer, and optional debug details that are only exposed when the
//! provider is configured to send debug messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// RFC 6749 (and extension) error codes understood by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    InvalidScope,
    UnauthorizedClient,
    AccessDenied,
    UnsupportedResponseType,
    UnsupportedResponseMode,
    UnsupportedGrantType,
    InvalidToken,
    TokenSignatureMismatch,
    TokenExpired,
    TokenInactive,
    NotFound,
    RequestNotSupported,
    RequestUriNotSupported,
    LoginRequired,
    ConsentRequired,
    ServerError,
}

impl ErrorCode {
    /// Returns the wire representation of the error code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::AccessDenied => "access_denied",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::UnsupportedResponseMode => "unsupported_response_mode",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidToken => "invalid_token",
            Self::TokenSignatureMismatch => "token_signature_mismatch",
            Self::TokenExpired => "token_expired",
            Self::TokenInactive => "token_inactive",
            Self::NotFound => "not_found",
            Self::RequestNotSupported => "request_not_supported",
            Self::RequestUriNotSupported => "request_uri_not_supported",
            Self::LoginRequired => "login_required",
            Self::ConsentRequired => "consent_required",
            Self::ServerError => "server_error",
        }
    }

    /// Parses a wire error code. Unknown codes yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let code = match s {
            "invalid_request" => Self::InvalidRequest,
            "invalid_client" => Self::InvalidClient,
            "invalid_grant" => Self::InvalidGrant,
            "invalid_scope" => Self::InvalidScope,
            "unauthorized_client" => Self::UnauthorizedClient,
            "access_denied" => Self::AccessDenied,
            "unsupported_response_type" => Self::UnsupportedResponseType,
            "unsupported_response_mode" => Self::UnsupportedResponseMode,
            "unsupported_grant_type" => Self::UnsupportedGrantType,
            "invalid_token" => Self::InvalidToken,
            "token_signature_mismatch" => Self::TokenSignatureMismatch,
            "token_expired" => Self::TokenExpired,
            "token_inactive" => Self::TokenInactive,
            "not_found" => Self::NotFound,
            "request_not_supported" => Self::RequestNotSupported,
            "request_uri_not_supported" => Self::RequestUriNotSupported,
            "login_required" => Self::LoginRequired,
            "consent_required" => Self::ConsentRequired,
            "server_error" => Self::ServerError,
            _ => return None,
        };
        Some(code)
    }

    /// Default human readable description for the code.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::InvalidRequest => {
                "The request is missing a required parameter, includes an invalid parameter value, includes a parameter more than once, or is otherwise malformed."
            }
            Self::InvalidClient => {
                "Client authentication failed (e.g., unknown client, no client authentication included, or unsupported authentication method)."
            }
            Self::InvalidGrant => {
                "The provided authorization grant (e.g., authorization code, resource owner credentials) or refresh token is invalid, expired, revoked, does not match the redirection URI used in the authorization request, or was issued to another client."
            }
            Self::InvalidScope => "The requested scope is invalid, unknown, or malformed.",
            Self::UnauthorizedClient => {
                "The client is not authorized to request a token using this method."
            }
            Self::AccessDenied => {
                "The resource owner or authorization server denied the request."
            }
            Self::UnsupportedResponseType => {
                "The authorization server does not support obtaining a token using this method."
            }
            Self::UnsupportedResponseMode => {
                "The authorization server does not support obtaining a response using this response mode."
            }
            Self::UnsupportedGrantType => {
                "The authorization grant type is not supported by the authorization server."
            }
            Self::InvalidToken => "The token is malformed.",
            Self::TokenSignatureMismatch => "Token signature mismatch.",
            Self::TokenExpired => "Token expired.",
            Self::TokenInactive => "Token is inactive because it is malformed, expired or otherwise invalid.",
            Self::NotFound => "Could not find the requested resource(s).",
            Self::RequestNotSupported => {
                "The OP does not support use of the request parameter."
            }
            Self::RequestUriNotSupported => {
                "The OP does not support use of the request_uri parameter."
            }
            Self::LoginRequired => "The Authorization Server requires End-User authentication.",
            Self::ConsentRequired => "The Authorization Server requires End-User consent.",
            Self::ServerError => {
                "The authorization server encountered an unexpected condition that prevented it from fulfilling the request."
            }
        }
    }

    /// HTTP status code used when the error is written to a response.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidClient | Self::TokenInactive | Self::TokenExpired => 401,
            Self::AccessDenied => 403,
            Self::NotFound => 404,
            Self::ServerError => 500,
            _ => 400,
        }
    }

    /// Returns the coarse category of the code.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidClient | Self::UnauthorizedClient => ErrorCategory::Client,
            Self::InvalidGrant | Self::AccessDenied | Self::LoginRequired | Self::ConsentRequired => {
                ErrorCategory::Grant
            }
            Self::InvalidToken
            | Self::TokenSignatureMismatch
            | Self::TokenExpired
            | Self::TokenInactive => ErrorCategory::TokenIntegrity,
            Self::ServerError => ErrorCategory::Server,
            _ => ErrorCategory::Request,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An RFC 6749 error with optional hint and debug details.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct AuthError {
    code: ErrorCode,
    description: String,
    hint: Option<String>,
    debug: Option<String>,
}

impl AuthError {
    /// Creates an error with the default description for `code`.
    #[must_use]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            description: code.description().to_string(),
            hint: None,
            debug: None,
        }
    }

    fn hinted(code: ErrorCode, hint: impl Into<String>) -> Self {
        Self::new(code).with_hint(hint)
    }

    /// Creates a new `invalid_request` error.
    #[must_use]
    pub fn invalid_request(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::InvalidRequest, hint)
    }

    /// Creates a new `invalid_client` error.
    #[must_use]
    pub fn invalid_client(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::InvalidClient, hint)
    }

    /// Creates a new `invalid_grant` error.
    #[must_use]
    pub fn invalid_grant(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::InvalidGrant, hint)
    }

    /// Creates a new `invalid_scope` error.
    #[must_use]
    pub fn invalid_scope(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::InvalidScope, hint)
    }

    /// Creates a new `unauthorized_client` error.
    #[must_use]
    pub fn unauthorized_client(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::UnauthorizedClient, hint)
    }

    /// Creates a new `access_denied` error.
    #[must_use]
    pub fn access_denied(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::AccessDenied, hint)
    }

    /// Creates a new `unsupported_response_type` error.
    #[must_use]
    pub fn unsupported_response_type(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::UnsupportedResponseType, hint)
    }

    /// Creates a new `unsupported_response_mode` error.
    #[must_use]
    pub fn unsupported_response_mode(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::UnsupportedResponseMode, hint)
    }

    /// Creates a new `unsupported_grant_type` error.
    #[must_use]
    pub fn unsupported_grant_type(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::UnsupportedGrantType, hint)
    }

    /// Creates a new `invalid_token` error.
    #[must_use]
    pub fn invalid_token(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::InvalidToken, hint)
    }

    /// Creates a new `token_signature_mismatch` error.
    #[must_use]
    pub fn token_signature_mismatch(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::TokenSignatureMismatch, hint)
    }

    /// Creates a new `token_expired` error.
    #[must_use]
    pub fn token_expired(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::TokenExpired, hint)
    }

    /// Creates a new `token_inactive` error.
    #[must_use]
    pub fn token_inactive(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::TokenInactive, hint)
    }

    /// Creates a new `not_found` error.
    #[must_use]
    pub fn not_found(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::NotFound, hint)
    }

    /// Creates a new `request_not_supported` error.
    #[must_use]
    pub fn request_not_supported(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::RequestNotSupported, hint)
    }

    /// Creates a new `request_uri_not_supported` error.
    #[must_use]
    pub fn request_uri_not_supported(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::RequestUriNotSupported, hint)
    }

    /// Creates a new `login_required` error.
    #[must_use]
    pub fn login_required(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::LoginRequired, hint)
    }

    /// Creates a new `consent_required` error.
    #[must_use]
    pub fn consent_required(hint: impl Into<String>) -> Self {
        Self::hinted(ErrorCode::ConsentRequired, hint)
    }

    /// Creates a `server_error` carrying `debug` as its debug message.
    #[must_use]
    pub fn server_error(debug: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError).with_debug(debug)
    }

    /// Creates a `server_error` for a failed storage operation.
    #[must_use]
    pub fn storage(debug: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServerError)
            .with_hint("A storage backend operation failed.")
            .with_debug(debug)
    }

    /// Replaces the hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Replaces the debug message.
    #[must_use]
    pub fn with_debug(mut self, debug: impl Into<String>) -> Self {
        self.debug = Some(debug.into());
        self
    }

    /// Replaces the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Returns the error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the OAuth 2.0 error code string.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        self.code.as_str()
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the hint, if any.
    #[must_use]
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Returns the debug message, if any.
    #[must_use]
    pub fn debug(&self) -> Option<&str> {
        self.debug.as_deref()
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// Returns the category of this error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Returns true if this error is caused by the client or its input.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.category() != ErrorCategory::Server
    }

    /// Builds the JSON error body. Debug details are only included when
    /// `send_debug` is set.
    #[must_use]
    pub fn to_body(&self, send_debug: bool) -> ErrorBody {
        ErrorBody {
            error: self.code.as_str().to_string(),
            error_description: self.description.clone(),
            error_hint: self.hint.clone(),
            error_debug: if send_debug { self.debug.clone() } else { None },
        }
    }
}

impl From<ErrorCode> for AuthError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

/// The JSON body written for an [`AuthError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_debug: Option<String>,
}

/// Categories of authorization errors for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed or unsupported request.
    Request,
    /// Client authentication or authorization errors.
    Client,
    /// Grant, consent and authentication errors.
    Grant,
    /// Token format, signature or lifetime errors.
    TokenIntegrity,
    /// Storage and internal errors.
    Server,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "request"),
            Self::Client => write!(f, "client"),
            Self::Grant => write!(f, "grant"),
            Self::TokenIntegrity => write!(f, "token_integrity"),
            Self::Server => write!(f, "server"),
        }
    }
}
