//! Client authentication for the token and revocation endpoints.
//!
//! # Authentication Methods
//!
//! - `none` - Public clients (client_id only)
//! - `client_secret_basic` - HTTP Basic Auth with client_id:client_secret
//! - `client_secret_post` - client_id and client_secret in request body
//!
//! When several are present, Basic Auth wins over body credentials, and
//! body credentials win over a bare client_id.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::AuthResult;
use crate::error::AuthError;
use crate::storage::ClientStorage;
use crate::types::Client;

/// Result of successful client authentication.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    pub client: Client,
    pub auth_method: TokenEndpointAuthMethod,
}

/// Token endpoint authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    /// No client authentication (public clients).
    None,

    /// Client secret via HTTP Basic Auth.
    ClientSecretBasic,

    /// Client secret in request body.
    ClientSecretPost,
}

impl TokenEndpointAuthMethod {
    /// Returns the string representation of the auth method.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
        }
    }
}

impl fmt::Display for TokenEndpointAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Authenticates the client of a request.
///
/// # Arguments
///
/// * `form` - The request parameters
/// * `basic_auth` - Optional HTTP Basic Auth credentials (client_id, client_secret)
/// * `client_storage` - Storage for looking up client registrations
///
/// # Errors
///
/// Returns `invalid_client` if:
/// - No client credentials are provided
/// - The client is not found or inactive
/// - The client secret is invalid
/// - A confidential client omits its secret
/// - A public client presents a secret
pub async fn authenticate_client<S>(
    form: &BTreeMap<String, String>,
    basic_auth: Option<(&str, &str)>,
    client_storage: &S,
) -> AuthResult<AuthenticatedClient>
where
    S: ClientStorage + ?Sized,
{
    if let Some((client_id, client_secret)) = basic_auth {
        if let Some(body_id) = form.get("client_id").filter(|id| !id.is_empty()) {
            if body_id != client_id {
                return Err(AuthError::invalid_client(
                    "The client_id in the body does not match the Basic Auth credentials.",
                ));
            }
        }
        return authenticate_with_secret(
            client_id,
            client_secret,
            TokenEndpointAuthMethod::ClientSecretBasic,
            client_storage,
        )
        .await;
    }

    let client_id = form.get("client_id").filter(|id| !id.is_empty());
    let client_secret = form.get("client_secret").filter(|s| !s.is_empty());

    match (client_id, client_secret) {
        (Some(client_id), Some(client_secret)) => {
            authenticate_with_secret(
                client_id,
                client_secret,
                TokenEndpointAuthMethod::ClientSecretPost,
                client_storage,
            )
            .await
        }
        (Some(client_id), None) => authenticate_public(client_id, client_storage).await,
        (None, _) => Err(AuthError::invalid_client("No client credentials provided")),
    }
}

async fn find_active<S>(client_id: &str, client_storage: &S) -> AuthResult<Client>
where
    S: ClientStorage + ?Sized,
{
    let client = client_storage
        .find_by_client_id(client_id)
        .await?
        .ok_or_else(|| AuthError::invalid_client("Unknown client"))?;

    if !client.active {
        return Err(AuthError::invalid_client("Client is inactive"));
    }
    Ok(client)
}

async fn authenticate_with_secret<S>(
    client_id: &str,
    client_secret: &str,
    method: TokenEndpointAuthMethod,
    client_storage: &S,
) -> AuthResult<AuthenticatedClient>
where
    S: ClientStorage + ?Sized,
{
    let client = find_active(client_id, client_storage).await?;

    if !client.confidential {
        return Err(AuthError::invalid_client(format!(
            "Public clients cannot use {method} authentication"
        )));
    }

    if !client_storage
        .verify_secret(client_id, client_secret)
        .await?
    {
        tracing::debug!(client_id = %client_id, method = %method, "Client secret mismatch");
        return Err(AuthError::invalid_client("Invalid client secret"));
    }

    Ok(AuthenticatedClient {
        client,
        auth_method: method,
    })
}

async fn authenticate_public<S>(
    client_id: &str,
    client_storage: &S,
) -> AuthResult<AuthenticatedClient>
where
    S: ClientStorage + ?Sized,
{
    let client = find_active(client_id, client_storage).await?;

    if client.confidential {
        return Err(AuthError::invalid_client(
            "Confidential clients must provide client credentials",
        ));
    }

    Ok(AuthenticatedClient {
        client,
        auth_method: TokenEndpointAuthMethod::None,
    })
}

/// Parses an HTTP Basic Auth header value.
///
/// Returns `Some((client_id, client_secret))` if valid, `None` otherwise.
#[must_use]
pub fn parse_basic_auth(header_value: &str) -> Option<(String, String)> {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    let encoded = header_value.trim().strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;

    // Split on first colon (password may contain colons)
    let (client_id, client_secret) = credentials.split_once(':')?;

    Some((client_id.to_string(), client_secret.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::secret::hash_client_secret;
    use crate::storage::MemoryStore;

    fn store() -> MemoryStore {
        MemoryStore::new()
            .with_client(Client::new("public-app", "Public"))
            .with_client(
                Client::new("backend", "Backend")
                    .with_secret_hash(hash_client_secret("s3cret").unwrap()),
            )
    }

    fn form(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_authenticate_public_client() {
        let result = authenticate_client(&form(&[("client_id", "public-app")]), None, &store())
            .await
            .unwrap();
        assert_eq!(result.client.client_id, "public-app");
        assert_eq!(result.auth_method, TokenEndpointAuthMethod::None);
    }

    #[tokio::test]
    async fn test_authenticate_basic_auth() {
        let result = authenticate_client(&form(&[]), Some(("backend", "s3cret")), &store())
            .await
            .unwrap();
        assert_eq!(result.auth_method, TokenEndpointAuthMethod::ClientSecretBasic);
    }

    #[tokio::test]
    async fn test_authenticate_secret_post() {
        let form = form(&[("client_id", "backend"), ("client_secret", "s3cret")]);
        let result = authenticate_client(&form, None, &store()).await.unwrap();
        assert_eq!(result.auth_method, TokenEndpointAuthMethod::ClientSecretPost);
    }

    #[tokio::test]
    async fn test_authentication_failures() {
        let store = store();
        let cases = [
            (form(&[("client_id", "unknown")]), None),
            (form(&[]), Some(("backend", "wrong"))),
            (form(&[("client_id", "backend")]), None),
            (form(&[]), Some(("public-app", "anything"))),
            (form(&[("client_id", "other")]), Some(("backend", "s3cret"))),
            (form(&[]), None),
        ];
        for (form, basic) in cases {
            let err = authenticate_client(&form, basic, &store).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidClient, "{form:?} {basic:?}");
        }
    }

    #[test]
    fn test_parse_basic_auth() {
        // "client_id:client_secret"
        assert_eq!(
            parse_basic_auth("Basic Y2xpZW50X2lkOmNsaWVudF9zZWNyZXQ="),
            Some(("client_id".to_string(), "client_secret".to_string()))
        );
        // "client:pass:word"
        assert_eq!(
            parse_basic_auth("Basic Y2xpZW50OnBhc3M6d29yZA=="),
            Some(("client".to_string(), "pass:word".to_string()))
        );
        assert_eq!(parse_basic_auth("Bearer abc"), None);
        assert_eq!(parse_basic_auth("Basic !!!"), None);
        // "nocolon"
        assert_eq!(parse_basic_auth("Basic bm9jb2xvbg=="), None);
    }

    #[test]
    fn test_auth_method_as_str() {
        assert_eq!(TokenEndpointAuthMethod::None.as_str(), "none");
        assert_eq!(
            TokenEndpointAuthMethod::ClientSecretBasic.to_string(),
            "client_secret_basic"
        );
    }
}
