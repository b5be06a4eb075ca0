//! Login/consent flow storage.

use async_trait::async_trait;

use crate::AuthResult;
use crate::flow::{Flow, LoginSession, RememberedConsent};

/// Persisted flows. The stored flow is authoritative; encoded challenges
/// and verifiers only locate it.
#[async_trait]
pub trait FlowStorage: Send + Sync {
    /// Inserts or replaces a flow.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn save_flow(&self, flow: &Flow) -> AuthResult<()>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_flow(&self, id: &str) -> AuthResult<Option<Flow>>;

    /// Stores `next` only if the stored flow still equals `current`.
    ///
    /// Returns `false` when another request changed or removed the flow
    /// first. Redeeming a verifier goes through here so it succeeds once.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn replace_flow(&self, current: &Flow, next: &Flow) -> AuthResult<bool>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_flow(&self, id: &str) -> AuthResult<()>;
}

/// Remembered browser logins.
#[async_trait]
pub trait LoginSessionStorage: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn save_login_session(&self, session: &LoginSession) -> AuthResult<()>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn get_login_session(&self, id: &str) -> AuthResult<Option<LoginSession>>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete_login_session(&self, id: &str) -> AuthResult<()>;
}

/// Consent grants remembered per subject and client.
#[async_trait]
pub trait RememberedConsentStorage: Send + Sync {
    /// Inserts or replaces the grant for `consent.subject` and
    /// `consent.client_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn remember_consent(&self, consent: &RememberedConsent) -> AuthResult<()>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_remembered_consent(
        &self,
        subject: &str,
        client_id: &str,
    ) -> AuthResult<Option<RememberedConsent>>;

    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn revoke_remembered_consent(&self, subject: &str, client_id: &str) -> AuthResult<()>;
}
