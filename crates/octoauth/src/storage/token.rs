//! Signature-keyed token session storage.
//!
//! Every `create_*` takes the token signature derived by the token strategy
//! and the request the token was issued for. `get_*` returns inactive rows
//! too; callers decide what an inactive row means.

use async_trait::async_trait;
use uuid::Uuid;

use super::StoredSession;
use crate::AuthResult;
use crate::types::Request;

/// Authorization code sessions.
#[async_trait]
pub trait AuthorizeCodeStorage: Send + Sync {
    /// Stores the session of a new authorization code.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature is already taken or the storage
    /// operation fails.
    async fn create_authorize_code_session(
        &self,
        signature: &str,
        request: &Request,
    ) -> AuthResult<()>;

    /// Looks up a code session. Consumed codes are returned with
    /// `active == false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_authorize_code_session(&self, signature: &str)
        -> AuthResult<Option<StoredSession>>;

    /// Marks a code consumed. The row stays so replays can be detected.
    ///
    /// # Errors
    ///
    /// Returns `not_found` if there is no such code.
    async fn invalidate_authorize_code_session(&self, signature: &str) -> AuthResult<()>;
}

/// Access token sessions.
#[async_trait]
pub trait AccessTokenStorage: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the signature is already taken or the storage
    /// operation fails.
    async fn create_access_token_session(&self, signature: &str, request: &Request)
        -> AuthResult<()>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_access_token_session(&self, signature: &str)
        -> AuthResult<Option<StoredSession>>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_access_token_session(&self, signature: &str) -> AuthResult<()>;
}

/// Refresh token sessions.
#[async_trait]
pub trait RefreshTokenStorage: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the signature is already taken or the storage
    /// operation fails.
    async fn create_refresh_token_session(
        &self,
        signature: &str,
        request: &Request,
    ) -> AuthResult<()>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_refresh_token_session(&self, signature: &str)
        -> AuthResult<Option<StoredSession>>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_refresh_token_session(&self, signature: &str) -> AuthResult<()>;
}

/// Revocation of every token issued for one request.
///
/// Both operations mark matching rows inactive and succeed when nothing
/// matches.
#[async_trait]
pub trait TokenRevocationStorage: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn revoke_access_token(&self, request_id: Uuid) -> AuthResult<()>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn revoke_refresh_token(&self, request_id: Uuid) -> AuthResult<()>;
}

/// PKCE sessions, keyed by the authorization code signature.
#[async_trait]
pub trait PkceStorage: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn create_pkce_session(&self, signature: &str, request: &Request) -> AuthResult<()>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_pkce_session(&self, signature: &str) -> AuthResult<Option<Request>>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_pkce_session(&self, signature: &str) -> AuthResult<()>;
}

/// OpenID Connect sessions, keyed by the authorization code signature.
#[async_trait]
pub trait OpenIdConnectStorage: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn create_openid_connect_session(
        &self,
        signature: &str,
        request: &Request,
    ) -> AuthResult<()>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_openid_connect_session(&self, signature: &str) -> AuthResult<Option<Request>>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_openid_connect_session(&self, signature: &str) -> AuthResult<()>;
}
