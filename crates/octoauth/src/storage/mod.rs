//! Storage traits for authorization data.
//!
//! This module defines storage interfaces for:
//!
//! - OAuth client registrations
//! - Authorization code, access token and refresh token sessions, keyed by
//!   token signature
//! - PKCE and OpenID Connect side sessions, keyed by code signature
//! - Login/consent flows, remembered logins and remembered consent
//!
//! Storage never sees token values. Rows are flipped inactive rather than
//! deleted when a code is consumed or a token is revoked, so replays are
//! still detected.
//!
//! # Implementations
//!
//! - [`MemoryStore`] - in-process store for tests and single-node setups

pub mod client;
pub mod flow;
pub mod memory;
pub mod token;

use std::collections::BTreeMap;
use std::future::Future;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AuthError;
use crate::token::TokenKind;
use crate::types::{Arguments, Client, Request, Session};
use crate::AuthResult;

pub use client::ClientStorage;
pub use flow::{FlowStorage, LoginSessionStorage, RememberedConsentStorage};
pub use memory::MemoryStore;
pub use token::{
    AccessTokenStorage, AuthorizeCodeStorage, OpenIdConnectStorage, PkceStorage,
    RefreshTokenStorage, TokenRevocationStorage,
};

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A row with the same key already exists.
    #[error("duplicate key: {0}")]
    Conflict(String),

    /// The row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => {
                AuthError::not_found("The requested resource could not be found.").with_debug(what)
            }
            other => AuthError::storage(other.to_string()),
        }
    }
}

// =============================================================================
// Stored rows
// =============================================================================

/// A request as stored under a token signature.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub request: Request,
    /// `false` once the code was consumed or the token revoked.
    pub active: bool,
}

/// Flat storage row for a token session.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSessionData {
    pub signature: String,
    pub request_id: Uuid,
    pub requested_at: OffsetDateTime,
    pub client_id: String,
    pub scope: String,
    pub granted_scope: String,
    pub audience: String,
    pub granted_audience: String,
    /// `application/x-www-form-urlencoded` request form, without secrets.
    pub form_encoded: String,
    /// JSON encoded [`Session`].
    pub session_blob: String,
    pub subject: String,
    pub active: bool,
    /// Id of the login/consent flow that produced the request, if any.
    pub challenge_id: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

impl RequestSessionData {
    /// Flattens `request` into a row for a token of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the session cannot be
    /// encoded.
    pub fn from_request(
        signature: &str,
        kind: TokenKind,
        request: &Request,
    ) -> Result<Self, StorageError> {
        let sanitized = request.sanitized();
        let form_encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(sanitized.form.iter())
            .finish();
        let session_blob = serde_json::to_string(&request.session)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        Ok(Self {
            signature: signature.to_string(),
            request_id: request.id,
            requested_at: request.requested_at,
            client_id: request.client.client_id.clone(),
            scope: request.requested_scope.join(),
            granted_scope: request.granted_scope.join(),
            audience: request.requested_audience.join(),
            granted_audience: request.granted_audience.join(),
            form_encoded,
            session_blob,
            subject: request.session.subject.clone(),
            active: true,
            challenge_id: request.form.get("challenge_id").cloned(),
            expires_at: request.session.expires_at(kind),
        })
    }

    /// Rebuilds the request, attaching the registered `client`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the session blob is corrupt.
    pub fn to_request(&self, client: Client) -> Result<Request, StorageError> {
        let session: Session = serde_json::from_str(&self.session_blob)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let form: BTreeMap<String, String> =
            url::form_urlencoded::parse(self.form_encoded.as_bytes())
                .into_owned()
                .collect();

        let mut request = Request::new(client);
        request.id = self.request_id;
        request.requested_at = self.requested_at;
        request.requested_scope = Arguments::from_space_delimited(&self.scope);
        request.granted_scope = Arguments::from_space_delimited(&self.granted_scope);
        request.requested_audience = Arguments::from_space_delimited(&self.audience);
        request.granted_audience = Arguments::from_space_delimited(&self.granted_audience);
        request.form = form;
        request.session = session;
        Ok(request)
    }
}

// =============================================================================
// Transactions
// =============================================================================

tokio::task_local! {
    static CURRENT_TRANSACTION: Uuid;
}

/// Id of the transaction the calling task runs in, if any.
///
/// Backends use it to attribute writes to the open transaction; writes made
/// by other tasks are not part of it.
#[must_use]
pub fn current_transaction() -> Option<Uuid> {
    CURRENT_TRANSACTION.try_with(|id| *id).ok()
}

/// An open storage transaction.
#[async_trait]
pub trait Transaction: Send {
    /// Identifies the transaction while its work runs.
    fn id(&self) -> Uuid;

    /// Makes the transaction's writes permanent.
    async fn commit(self: Box<Self>) -> AuthResult<()>;

    /// Undoes the transaction's own writes.
    async fn rollback(self: Box<Self>) -> AuthResult<()>;
}

/// Capability of storages that can group writes atomically.
#[async_trait]
pub trait Transactional: Send + Sync {
    /// Opens a transaction.
    async fn begin(&self) -> AuthResult<Box<dyn Transaction>>;
}

/// Used when the storage has no transactional capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransaction;

#[async_trait]
impl Transaction for NoopTransaction {
    fn id(&self) -> Uuid {
        Uuid::nil()
    }

    async fn commit(self: Box<Self>) -> AuthResult<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AuthResult<()> {
        Ok(())
    }
}

#[async_trait]
impl Transactional for NoopTransaction {
    async fn begin(&self) -> AuthResult<Box<dyn Transaction>> {
        Ok(Box::new(NoopTransaction))
    }
}

/// Runs `work` inside a transaction: commits on success, rolls back on error.
///
/// Storage calls made by `work` see the transaction through
/// [`current_transaction`]. Tasks spawned by `work` do not.
///
/// # Errors
///
/// Returns the error of `work`, or the error of `begin` / `commit`.
pub async fn run_in_transaction<T, F>(tx: &dyn Transactional, work: F) -> AuthResult<T>
where
    F: Future<Output = AuthResult<T>> + Send,
{
    let transaction = tx.begin().await?;
    match CURRENT_TRANSACTION.scope(transaction.id(), work).await {
        Ok(value) => {
            transaction.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = transaction.rollback().await {
                tracing::warn!(error = %rollback_err, "Transaction rollback failed");
                return Err(err.with_debug(format!("rollback failed: {rollback_err}")));
            }
            Err(err)
        }
    }
}

// =============================================================================
// Aggregate traits
// =============================================================================

/// Everything the protocol handlers need.
pub trait OAuth2Storage:
    ClientStorage
    + AuthorizeCodeStorage
    + AccessTokenStorage
    + RefreshTokenStorage
    + TokenRevocationStorage
    + PkceStorage
    + OpenIdConnectStorage
{
    /// Returns the transactional capability, if the backend has one.
    fn transactional(&self) -> Option<std::sync::Arc<dyn Transactional>> {
        None
    }
}

/// Everything the consent strategy needs.
pub trait ConsentStorage: FlowStorage + LoginSessionStorage + RememberedConsentStorage {}

impl<T> ConsentStorage for T where T: FlowStorage + LoginSessionStorage + RememberedConsentStorage {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_row_round_trip_drops_secrets() {
        let mut request = Request::new(Client::new("app", "App"));
        request.requested_scope = Arguments::from_space_delimited("openid offline");
        request.grant_scope("openid");
        request.grant_audience("https://api.example.com");
        request.form.insert("state".into(), "xyz&1".into());
        request.form.insert("code_verifier".into(), "secret".into());
        request.session = Session::new("alice");
        let exp = request.requested_at + time::Duration::minutes(10);
        request.session.set_expires_at(TokenKind::AuthorizeCode, exp);

        let row = RequestSessionData::from_request("sig", TokenKind::AuthorizeCode, &request)
            .unwrap();
        assert_eq!(row.subject, "alice");
        assert_eq!(row.expires_at, Some(exp));
        assert!(row.active);
        assert!(!row.form_encoded.contains("code_verifier"));

        let restored = row.to_request(Client::new("app", "App")).unwrap();
        assert_eq!(restored.id, request.id);
        assert_eq!(restored.requested_at, request.requested_at);
        assert_eq!(restored.granted_scope, request.granted_scope);
        assert_eq!(restored.requested_scope, request.requested_scope);
        assert_eq!(restored.granted_audience, request.granted_audience);
        assert_eq!(restored.form.get("state").map(String::as_str), Some("xyz&1"));
        assert_eq!(restored.session, request.session);
    }

    #[test]
    fn test_storage_error_mapping() {
        let err: AuthError = StorageError::Backend("down".into()).into();
        assert_eq!(err.code(), ErrorCode::ServerError);
        let err: AuthError = StorageError::NotFound("x".into()).into();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_run_in_transaction_passes_result_through() {
        let ok = run_in_transaction(&NoopTransaction, async { Ok::<_, AuthError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = run_in_transaction(&NoopTransaction, async {
            Err::<(), _>(AuthError::invalid_grant("nope"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn test_current_transaction_is_scoped_to_work() {
        assert!(current_transaction().is_none());
        let seen = run_in_transaction(&NoopTransaction, async {
            let inner = current_transaction();
            let spawned = tokio::spawn(async { current_transaction() }).await.unwrap();
            Ok::<_, AuthError>((inner, spawned))
        })
        .await
        .unwrap();
        assert_eq!(seen, (Some(Uuid::nil()), None));
        assert!(current_transaction().is_none());
    }
}
