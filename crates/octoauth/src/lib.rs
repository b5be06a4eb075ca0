//! # octoauth
//!
//! OAuth 2.0 and OpenID Connect authorization server core.
//!
//! This crate provides:
//! - Authorization code (with PKCE), client credentials and refresh token grants
//! - OpenID Connect ID tokens for the authorization code flow
//! - Opaque HMAC and JWT access tokens
//! - Token introspection (RFC 7662) and cascading revocation (RFC 7009)
//! - Login and consent delegation to external pages
//!
//! ## Overview
//!
//! The crate has no HTTP layer. A transport decodes requests into parameter
//! maps, calls [`OAuth2Provider`] and [`ConsentStrategy`], and renders the
//! returned values. Storage is abstract; [`MemoryStore`] implements every
//! storage trait in process.
//!
//! ## Modules
//!
//! - [`config`] - Provider configuration
//! - [`oauth`] - Handler chain and provider façade
//! - [`token`] - Token strategies, JWT keys, introspection and revocation payloads
//! - [`flow`] - Login/consent state machine, codec and strategy
//! - [`storage`] - Storage traits and the in-memory store
//! - [`types`] - Clients, requests, responses and sessions
//! - [`scope`] - Scope and audience matching
//! - [`secret`] - Client secret hashing and random tokens

pub mod config;
pub mod error;
pub mod flow;
pub mod oauth;
pub mod scope;
pub mod secret;
pub mod storage;
pub mod token;
pub mod types;

pub use config::{AuthConfig, ConfigError};
pub use error::{AuthError, ErrorBody, ErrorCategory, ErrorCode};
pub use flow::{
    ConsentOutcome, ConsentResult, ConsentStrategy, Flow, FlowCodec, FlowError, FlowPurpose,
    HandledConsentRequest, HandledLoginRequest, RequestDeniedError,
};
pub use oauth::{AuthorizeError, OAuth2Provider, ProviderHandle, compose};
pub use storage::{ConsentStorage, MemoryStore, OAuth2Storage};
pub use token::{
    HmacStrategy, IntrospectionResponse, Jwks, JwtService, JwtStrategy, KeyProvider,
    SigningAlgorithm, SigningKeyPair, StaticKeyProvider, TokenKind, TokenStrategy, TokenTypeHint,
};
pub use types::{
    Arguments, AuthorizeRequest, AuthorizeResponse, Client, GrantType, Request, Session,
    TokenRequest, TokenResponse,
};

/// Type alias for authentication/authorization results.
pub type AuthResult<T> = Result<T, AuthError>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use octoauth::prelude::*;
/// ```
pub mod prelude {
    pub use crate::AuthResult;
    pub use crate::config::{AuthConfig, ConfigError};
    pub use crate::error::{AuthError, ErrorCategory, ErrorCode};
    pub use crate::flow::{
        ConsentOutcome, ConsentResult, ConsentStrategy, HandledConsentRequest,
        HandledLoginRequest, RequestDeniedError,
    };
    pub use crate::oauth::{AuthorizeError, OAuth2Provider, ProviderHandle, compose};
    pub use crate::storage::{ClientStorage, ConsentStorage, MemoryStore, OAuth2Storage};
    pub use crate::token::{
        IntrospectionResponse, KeyProvider, SigningKeyPair, StaticKeyProvider, TokenTypeHint,
    };
    pub use crate::types::{Client, GrantType, Session};
}
