//! Common types used across the protocol handlers, strategies and storage.
//!
//! ## Domain Types
//!
//! - [`Client`] - OAuth 2.0 client registration
//! - [`Request`], [`AuthorizeRequest`], [`TokenRequest`] - protocol requests
//! - [`Session`] - data carried from authorization to token issuance
//! - [`Arguments`] - space-delimited scopes, audiences and response types

pub mod arguments;
pub mod client;
pub mod request;
pub mod session;

pub use arguments::Arguments;
pub use client::{Client, ClientValidationError, GrantType, OidcClientMetadata, ResponseMode};
pub use request::{AuthorizeRequest, AuthorizeResponse, Request, TokenRequest, TokenResponse};
pub use session::{IdTokenSession, Session};
