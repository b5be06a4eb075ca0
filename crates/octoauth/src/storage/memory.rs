//! In-memory storage.
//!
//! Implements every storage trait on top of `DashMap`s. Token signatures
//! are unique per table. A transaction journals the rows its own task
//! writes and undoes only those on rollback; writes from other requests
//! made meanwhile survive. Only one transaction is open at a time.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    AccessTokenStorage, AuthorizeCodeStorage, ClientStorage, FlowStorage, LoginSessionStorage,
    OAuth2Storage, OpenIdConnectStorage, PkceStorage, RefreshTokenStorage,
    RememberedConsentStorage, RequestSessionData, StorageError, StoredSession,
    TokenRevocationStorage, Transaction, Transactional, current_transaction,
};
use crate::error::AuthError;
use crate::flow::{Flow, LoginSession, RememberedConsent};
use crate::secret::verify_client_secret;
use crate::token::{TokenKind, log_signature};
use crate::types::{Client, Request};
use crate::AuthResult;

type Table = DashMap<String, RequestSessionData>;

#[derive(Debug, Clone, Copy)]
enum TableId {
    Codes,
    AccessTokens,
    RefreshTokens,
    Pkce,
    Oidc,
}

/// One row write made inside a transaction.
struct Undo {
    table: TableId,
    signature: String,
    previous: Option<RequestSessionData>,
    written: Option<RequestSessionData>,
}

#[derive(Default)]
struct Inner {
    clients: DashMap<String, Client>,
    codes: Table,
    access_tokens: Table,
    refresh_tokens: Table,
    pkce: Table,
    oidc: Table,
    flows: DashMap<String, Flow>,
    login_sessions: DashMap<String, LoginSession>,
    consents: DashMap<(String, String), RememberedConsent>,
    journals: DashMap<Uuid, Vec<Undo>>,
    tx_lock: Arc<Mutex<()>>,
}

/// In-process store implementing [`OAuth2Storage`] and
/// [`ConsentStorage`](super::ConsentStorage).
///
/// Cloning is cheap and every clone shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client, replacing any client with the same id.
    #[must_use]
    pub fn with_client(self, client: Client) -> Self {
        self.inner.clients.insert(client.client_id.clone(), client);
        self
    }

    fn table(&self, id: TableId) -> &Table {
        match id {
            TableId::Codes => &self.inner.codes,
            TableId::AccessTokens => &self.inner.access_tokens,
            TableId::RefreshTokens => &self.inner.refresh_tokens,
            TableId::Pkce => &self.inner.pkce,
            TableId::Oidc => &self.inner.oidc,
        }
    }

    fn row(&self, table: TableId, signature: &str) -> Option<RequestSessionData> {
        self.table(table).get(signature).map(|r| r.value().clone())
    }

    /// Records a write of the calling task's transaction, if it has one.
    fn journal(
        &self,
        table: TableId,
        signature: &str,
        previous: Option<RequestSessionData>,
        written: Option<RequestSessionData>,
    ) {
        let Some(id) = current_transaction() else {
            return;
        };
        if let Some(mut journal) = self.inner.journals.get_mut(&id) {
            journal.push(Undo {
                table,
                signature: signature.to_string(),
                previous,
                written,
            });
        }
    }

    fn insert_unique(
        &self,
        table: TableId,
        signature: &str,
        kind: TokenKind,
        request: &Request,
    ) -> AuthResult<()> {
        let row = RequestSessionData::from_request(signature, kind, request)?;
        let inserted = match self.table(table).entry(signature.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(row.clone());
                true
            }
        };
        if !inserted {
            return Err(StorageError::Conflict(format!(
                "{kind} signature {} already exists",
                log_signature(signature)
            ))
            .into());
        }
        self.journal(table, signature, None, Some(row));
        Ok(())
    }

    fn remove(&self, table: TableId, signature: &str) {
        if let Some((_, previous)) = self.table(table).remove(signature) {
            self.journal(table, signature, Some(previous), None);
        }
    }

    fn deactivate(&self, table: TableId, signature: &str) -> bool {
        let Some(previous) = self.row(table, signature) else {
            return false;
        };
        let written = {
            let Some(mut row) = self.table(table).get_mut(signature) else {
                return false;
            };
            row.active = false;
            row.value().clone()
        };
        self.journal(table, signature, Some(previous), Some(written));
        true
    }

    fn load(&self, table: TableId, signature: &str) -> AuthResult<Option<StoredSession>> {
        let Some(row) = self.row(table, signature) else {
            return Ok(None);
        };
        let Some(client) = self
            .inner
            .clients
            .get(&row.client_id)
            .map(|c| c.value().clone())
        else {
            tracing::debug!(
                client_id = %row.client_id,
                "Stored session references an unknown client"
            );
            return Ok(None);
        };
        let request = row.to_request(client)?;
        Ok(Some(StoredSession {
            request,
            active: row.active,
        }))
    }

    fn deactivate_by_request_id(&self, table: TableId, request_id: Uuid) -> usize {
        let signatures: Vec<String> = self
            .table(table)
            .iter()
            .filter(|row| row.request_id == request_id && row.active)
            .map(|row| row.key().clone())
            .collect();
        signatures
            .iter()
            .filter(|signature| self.deactivate(table, signature))
            .count()
    }

    /// Undoes the journaled writes in reverse order. A row that another
    /// request changed after the transaction wrote it keeps that change.
    fn undo(&self, journal: Vec<Undo>) -> usize {
        let mut skipped = 0;
        for undo in journal.into_iter().rev() {
            let table = self.table(undo.table);
            if self.row(undo.table, &undo.signature) != undo.written {
                skipped += 1;
                continue;
            }
            match undo.previous {
                Some(previous) => {
                    table.insert(undo.signature, previous);
                }
                None => {
                    table.remove(&undo.signature);
                }
            }
        }
        skipped
    }
}

// =============================================================================
// Transactions
// =============================================================================

struct MemoryTransaction {
    store: MemoryStore,
    id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn commit(self: Box<Self>) -> AuthResult<()> {
        self.store.inner.journals.remove(&self.id);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> AuthResult<()> {
        let journal = self
            .store
            .inner
            .journals
            .remove(&self.id)
            .map(|(_, journal)| journal)
            .unwrap_or_default();
        let writes = journal.len();
        let skipped = self.store.undo(journal);
        tracing::debug!(
            transaction_id = %self.id,
            writes,
            skipped,
            "Rolled back in-memory transaction"
        );
        Ok(())
    }
}

#[async_trait]
impl Transactional for MemoryStore {
    async fn begin(&self) -> AuthResult<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.inner.tx_lock).lock_owned().await;
        let id = Uuid::new_v4();
        self.inner.journals.insert(id, Vec::new());
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            id,
            _guard: guard,
        }))
    }
}

impl OAuth2Storage for MemoryStore {
    fn transactional(&self) -> Option<Arc<dyn Transactional>> {
        Some(Arc::new(self.clone()))
    }
}

// =============================================================================
// Clients
// =============================================================================

#[async_trait]
impl ClientStorage for MemoryStore {
    async fn find_by_client_id(&self, client_id: &str) -> AuthResult<Option<Client>> {
        Ok(self
            .inner
            .clients
            .get(client_id)
            .map(|c| c.value().clone())
            .filter(|c| c.active))
    }

    async fn create_client(&self, client: &Client) -> AuthResult<()> {
        client
            .validate()
            .map_err(|e| AuthError::invalid_request(e.to_string()))?;
        match self.inner.clients.entry(client.client_id.clone()) {
            Entry::Occupied(_) => {
                Err(StorageError::Conflict(format!("client {}", client.client_id)).into())
            }
            Entry::Vacant(slot) => {
                slot.insert(client.clone());
                Ok(())
            }
        }
    }

    async fn verify_secret(&self, client_id: &str, secret: &str) -> AuthResult<bool> {
        let hash = match self.inner.clients.get(client_id) {
            Some(client) => client.client_secret.clone(),
            None => return Ok(false),
        };
        match hash {
            Some(hash) => verify_client_secret(secret, &hash)
                .map_err(|e| AuthError::server_error(format!("invalid secret hash: {e}"))),
            None => Ok(false),
        }
    }
}

// =============================================================================
// Token sessions
// =============================================================================

#[async_trait]
impl AuthorizeCodeStorage for MemoryStore {
    async fn create_authorize_code_session(
        &self,
        signature: &str,
        request: &Request,
    ) -> AuthResult<()> {
        self.insert_unique(TableId::Codes, signature, TokenKind::AuthorizeCode, request)
    }

    async fn get_authorize_code_session(
        &self,
        signature: &str,
    ) -> AuthResult<Option<StoredSession>> {
        self.load(TableId::Codes, signature)
    }

    async fn invalidate_authorize_code_session(&self, signature: &str) -> AuthResult<()> {
        if self.deactivate(TableId::Codes, signature) {
            Ok(())
        } else {
            Err(StorageError::NotFound(format!(
                "authorize code {}",
                log_signature(signature)
            ))
            .into())
        }
    }
}

#[async_trait]
impl AccessTokenStorage for MemoryStore {
    async fn create_access_token_session(
        &self,
        signature: &str,
        request: &Request,
    ) -> AuthResult<()> {
        self.insert_unique(
            TableId::AccessTokens,
            signature,
            TokenKind::AccessToken,
            request,
        )
    }

    async fn get_access_token_session(
        &self,
        signature: &str,
    ) -> AuthResult<Option<StoredSession>> {
        self.load(TableId::AccessTokens, signature)
    }

    async fn delete_access_token_session(&self, signature: &str) -> AuthResult<()> {
        self.remove(TableId::AccessTokens, signature);
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStorage for MemoryStore {
    async fn create_refresh_token_session(
        &self,
        signature: &str,
        request: &Request,
    ) -> AuthResult<()> {
        self.insert_unique(
            TableId::RefreshTokens,
            signature,
            TokenKind::RefreshToken,
            request,
        )
    }

    async fn get_refresh_token_session(
        &self,
        signature: &str,
    ) -> AuthResult<Option<StoredSession>> {
        self.load(TableId::RefreshTokens, signature)
    }

    async fn delete_refresh_token_session(&self, signature: &str) -> AuthResult<()> {
        self.remove(TableId::RefreshTokens, signature);
        Ok(())
    }
}

#[async_trait]
impl TokenRevocationStorage for MemoryStore {
    async fn revoke_access_token(&self, request_id: Uuid) -> AuthResult<()> {
        let count = self.deactivate_by_request_id(TableId::AccessTokens, request_id);
        tracing::debug!(request_id = %request_id, count, "Revoked access tokens");
        Ok(())
    }

    async fn revoke_refresh_token(&self, request_id: Uuid) -> AuthResult<()> {
        let count = self.deactivate_by_request_id(TableId::RefreshTokens, request_id);
        tracing::debug!(request_id = %request_id, count, "Revoked refresh tokens");
        Ok(())
    }
}

#[async_trait]
impl PkceStorage for MemoryStore {
    async fn create_pkce_session(&self, signature: &str, request: &Request) -> AuthResult<()> {
        self.insert_unique(TableId::Pkce, signature, TokenKind::AuthorizeCode, request)
    }

    async fn get_pkce_session(&self, signature: &str) -> AuthResult<Option<Request>> {
        Ok(self
            .load(TableId::Pkce, signature)?
            .map(|stored| stored.request))
    }

    async fn delete_pkce_session(&self, signature: &str) -> AuthResult<()> {
        self.remove(TableId::Pkce, signature);
        Ok(())
    }
}

#[async_trait]
impl OpenIdConnectStorage for MemoryStore {
    async fn create_openid_connect_session(
        &self,
        signature: &str,
        request: &Request,
    ) -> AuthResult<()> {
        self.insert_unique(TableId::Oidc, signature, TokenKind::AuthorizeCode, request)
    }

    async fn get_openid_connect_session(&self, signature: &str) -> AuthResult<Option<Request>> {
        Ok(self
            .load(TableId::Oidc, signature)?
            .map(|stored| stored.request))
    }

    async fn delete_openid_connect_session(&self, signature: &str) -> AuthResult<()> {
        self.remove(TableId::Oidc, signature);
        Ok(())
    }
}

// =============================================================================
// Flows
// =============================================================================

#[async_trait]
impl FlowStorage for MemoryStore {
    async fn save_flow(&self, flow: &Flow) -> AuthResult<()> {
        self.inner.flows.insert(flow.id.clone(), flow.clone());
        Ok(())
    }

    async fn get_flow(&self, id: &str) -> AuthResult<Option<Flow>> {
        Ok(self.inner.flows.get(id).map(|f| f.value().clone()))
    }

    async fn replace_flow(&self, current: &Flow, next: &Flow) -> AuthResult<bool> {
        match self.inner.flows.get_mut(&current.id) {
            Some(mut stored) if *stored == *current => {
                *stored = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_flow(&self, id: &str) -> AuthResult<()> {
        self.inner.flows.remove(id);
        Ok(())
    }
}

#[async_trait]
impl LoginSessionStorage for MemoryStore {
    async fn save_login_session(&self, session: &LoginSession) -> AuthResult<()> {
        self.inner
            .login_sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_login_session(&self, id: &str) -> AuthResult<Option<LoginSession>> {
        Ok(self.inner.login_sessions.get(id).map(|s| s.value().clone()))
    }

    async fn delete_login_session(&self, id: &str) -> AuthResult<()> {
        self.inner.login_sessions.remove(id);
        Ok(())
    }
}

#[async_trait]
impl RememberedConsentStorage for MemoryStore {
    async fn remember_consent(&self, consent: &RememberedConsent) -> AuthResult<()> {
        self.inner.consents.insert(
            (consent.subject.clone(), consent.client_id.clone()),
            consent.clone(),
        );
        Ok(())
    }

    async fn find_remembered_consent(
        &self,
        subject: &str,
        client_id: &str,
    ) -> AuthResult<Option<RememberedConsent>> {
        Ok(self
            .inner
            .consents
            .get(&(subject.to_string(), client_id.to_string()))
            .map(|c| c.value().clone()))
    }

    async fn revoke_remembered_consent(&self, subject: &str, client_id: &str) -> AuthResult<()> {
        self.inner
            .consents
            .remove(&(subject.to_string(), client_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::secret::hash_client_secret;
    use crate::storage::run_in_transaction;
    use crate::types::Session;
    use tokio_test::block_on;

    fn store() -> MemoryStore {
        MemoryStore::new().with_client(Client::new("app", "App"))
    }

    fn request() -> Request {
        let mut request = Request::new(Client::new("app", "App"));
        request.session = Session::new("alice");
        request
    }

    #[tokio::test]
    async fn test_code_session_lifecycle() {
        let store = store();
        let request = request();
        store
            .create_authorize_code_session("sig", &request)
            .await
            .unwrap();

        let stored = store.get_authorize_code_session("sig").await.unwrap().unwrap();
        assert!(stored.active);
        assert_eq!(stored.request.id, request.id);
        assert_eq!(stored.request.session.subject, "alice");

        store.invalidate_authorize_code_session("sig").await.unwrap();
        let stored = store.get_authorize_code_session("sig").await.unwrap().unwrap();
        assert!(!stored.active);

        let err = store
            .invalidate_authorize_code_session("missing")
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_clones_share_tables() {
        let store = store();
        let clone = store.clone();
        let request = request();
        block_on(async {
            clone.create_refresh_token_session("r", &request).await.unwrap();
            assert!(store.get_refresh_token_session("r").await.unwrap().is_some());
            store.delete_refresh_token_session("r").await.unwrap();
            assert!(clone.get_refresh_token_session("r").await.unwrap().is_none());
        });
    }

    #[tokio::test]
    async fn test_unique_signature() {
        let store = store();
        let request = request();
        store
            .create_access_token_session("sig", &request)
            .await
            .unwrap();
        let err = store
            .create_access_token_session("sig", &request)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerError);
        // tables are independent
        store
            .create_refresh_token_session("sig", &request)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_revoke_by_request_id() {
        let store = store();
        let request = request();
        let other = self::request();
        store.create_access_token_session("a1", &request).await.unwrap();
        store.create_access_token_session("a2", &request).await.unwrap();
        store.create_access_token_session("b1", &other).await.unwrap();
        store.create_refresh_token_session("r1", &request).await.unwrap();

        store.revoke_access_token(request.id).await.unwrap();
        for sig in ["a1", "a2"] {
            let stored = store.get_access_token_session(sig).await.unwrap().unwrap();
            assert!(!stored.active);
        }
        assert!(store.get_access_token_session("b1").await.unwrap().unwrap().active);
        assert!(store.get_refresh_token_session("r1").await.unwrap().unwrap().active);

        store.revoke_refresh_token(request.id).await.unwrap();
        assert!(!store.get_refresh_token_session("r1").await.unwrap().unwrap().active);

        // nothing to revoke is fine
        store.revoke_access_token(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let store = store();
        let request = request();
        store
            .create_authorize_code_session("code", &request)
            .await
            .unwrap();

        let err = run_in_transaction(&store, async {
            store.invalidate_authorize_code_session("code").await?;
            store.create_access_token_session("at", &request).await?;
            Err::<(), _>(AuthError::server_error("issuing failed"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerError);
        assert!(store.get_authorize_code_session("code").await.unwrap().unwrap().active);
        assert!(store.get_access_token_session("at").await.unwrap().is_none());

        run_in_transaction(&store, async {
            store.invalidate_authorize_code_session("code").await
        })
        .await
        .unwrap();
        assert!(!store.get_authorize_code_session("code").await.unwrap().unwrap().active);
        assert!(store.inner.journals.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_keeps_writes_of_other_requests() {
        let store = store();
        let family = request();
        let stranger = request();
        store.create_access_token_session("old", &family).await.unwrap();
        store.create_refresh_token_session("r1", &family).await.unwrap();

        let err = run_in_transaction(&store, async {
            store.create_access_token_session("tx", &stranger).await?;
            store.delete_refresh_token_session("r1").await?;

            // another request, running outside the transaction
            let other = store.clone();
            let family_id = family.id;
            let issued = stranger.clone();
            tokio::spawn(async move {
                other.revoke_access_token(family_id).await.unwrap();
                other.create_access_token_session("concurrent", &issued).await.unwrap();
            })
            .await
            .unwrap();

            Err::<(), _>(AuthError::server_error("issuing failed"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ServerError);

        // own writes undone
        assert!(store.get_access_token_session("tx").await.unwrap().is_none());
        assert!(store.get_refresh_token_session("r1").await.unwrap().unwrap().active);
        // other writes kept
        assert!(!store.get_access_token_session("old").await.unwrap().unwrap().active);
        assert!(store.get_access_token_session("concurrent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rollback_skips_rows_changed_by_other_requests() {
        let store = store();
        let request = request();

        let _ = run_in_transaction(&store, async {
            store.create_access_token_session("at", &request).await?;
            let other = store.clone();
            let request_id = request.id;
            tokio::spawn(async move { other.revoke_access_token(request_id).await.unwrap() })
                .await
                .unwrap();
            Err::<(), _>(AuthError::server_error("issuing failed"))
        })
        .await;

        // the revoked row is not removed by the rollback of its insert
        let stored = store.get_access_token_session("at").await.unwrap().unwrap();
        assert!(!stored.active);
    }

    #[tokio::test]
    async fn test_replace_flow_compares_and_swaps() {
        let store = store();
        let ar = crate::types::AuthorizeRequest::new(
            request(),
            crate::types::Arguments::from_space_delimited("code"),
            url::Url::parse("https://app.example.com/cb").unwrap(),
        );
        let flow = Flow::new(&ar, "https://auth.example.com/oauth2/auth");
        store.save_flow(&flow).await.unwrap();

        let mut first = flow.clone();
        first.subject = "alice".into();
        let mut second = flow.clone();
        second.subject = "mallory".into();

        assert!(store.replace_flow(&flow, &first).await.unwrap());
        assert!(!store.replace_flow(&flow, &second).await.unwrap());
        assert_eq!(store.get_flow(&flow.id).await.unwrap().unwrap().subject, "alice");

        store.delete_flow(&flow.id).await.unwrap();
        assert!(!store.replace_flow(&first, &second).await.unwrap());
    }

    #[tokio::test]
    async fn test_client_secret() {
        let hash = hash_client_secret("s3cret").unwrap();
        let store = MemoryStore::new().with_client(
            Client::new("conf", "Confidential").with_secret_hash(hash),
        );
        assert!(store.verify_secret("conf", "s3cret").await.unwrap());
        assert!(!store.verify_secret("conf", "nope").await.unwrap());
        assert!(!store.verify_secret("missing", "s3cret").await.unwrap());
        assert!(store.find_by_client_id("conf").await.unwrap().is_some());
        assert!(store.find_by_client_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_client_rejects_duplicates() {
        let store = MemoryStore::new();
        let client = Client::new("app", "App")
            .with_redirect_uris(["https://app.example.com/cb"]);
        store.create_client(&client).await.unwrap();
        assert!(store.create_client(&client).await.is_err());
    }

    #[tokio::test]
    async fn test_side_sessions() {
        let store = store();
        let request = request();
        store.create_pkce_session("code", &request).await.unwrap();
        store
            .create_openid_connect_session("code", &request)
            .await
            .unwrap();
        assert_eq!(
            store.get_pkce_session("code").await.unwrap().unwrap().id,
            request.id
        );
        store.delete_pkce_session("code").await.unwrap();
        assert!(store.get_pkce_session("code").await.unwrap().is_none());
        assert!(store.get_openid_connect_session("code").await.unwrap().is_some());
    }
}
