//! Scope and audience matching strategies.
//!
//! Both are pure predicates deciding whether something a client asks for is
//! covered by what it has registered.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AuthError;
use crate::AuthResult;

/// Decides whether a requested scope is covered by a client's scopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeStrategy {
    /// The requested scope must be registered verbatim.
    Exact,
    /// A registered scope also covers its dot-separated children,
    /// e.g. `photos` covers `photos.read`.
    #[default]
    Hierarchic,
}

impl ScopeStrategy {
    /// Returns true if `needle` is allowed by `haystack`.
    #[must_use]
    pub fn matches(&self, haystack: &[String], needle: &str) -> bool {
        match self {
            Self::Exact => haystack.iter().any(|s| s == needle),
            Self::Hierarchic => haystack.iter().any(|s| hierarchic_match(s, needle)),
        }
    }

    /// Checks every requested scope.
    ///
    /// # Errors
    ///
    /// Returns `invalid_scope` naming the first scope that is not allowed.
    pub fn validate<'a>(
        &self,
        haystack: &[String],
        requested: impl IntoIterator<Item = &'a str>,
    ) -> AuthResult<()> {
        for scope in requested {
            if !self.matches(haystack, scope) {
                return Err(AuthError::invalid_scope(format!(
                    "The OAuth 2.0 Client is not allowed to request scope '{scope}'."
                )));
            }
        }
        Ok(())
    }
}

fn hierarchic_match(allowed: &str, requested: &str) -> bool {
    if allowed == requested {
        return true;
    }
    let allowed_parts: Vec<&str> = allowed.split('.').collect();
    let requested_parts: Vec<&str> = requested.split('.').collect();
    if requested_parts.len() < allowed_parts.len() {
        return false;
    }
    allowed_parts
        .iter()
        .zip(requested_parts.iter())
        .all(|(a, r)| a == r)
}

/// Decides whether requested audiences are covered by a client's audiences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudienceStrategy {
    /// The requested audience must be registered verbatim.
    Exact,
    /// Same scheme and host, and the requested path lies under a registered
    /// path segment.
    #[default]
    UrlPrefix,
}

impl AudienceStrategy {
    /// Checks every requested audience.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` if an audience cannot be parsed or has not
    /// been registered by the client.
    pub fn validate(&self, haystack: &[String], requested: &[String]) -> AuthResult<()> {
        for needle in requested {
            let found = match self {
                Self::Exact => haystack.iter().any(|h| h == needle),
                Self::UrlPrefix => url_prefix_match(haystack, needle)?,
            };
            if !found {
                return Err(AuthError::invalid_request(format!(
                    "Requested audience '{needle}' has not been whitelisted by the OAuth 2.0 Client."
                )));
            }
        }
        Ok(())
    }
}

fn url_prefix_match(haystack: &[String], needle: &str) -> AuthResult<bool> {
    let requested = Url::parse(needle).map_err(|_| {
        AuthError::invalid_request(format!("Unable to parse requested audience '{needle}'."))
    })?;

    for allowed in haystack {
        let allowed = Url::parse(allowed).map_err(|_| {
            AuthError::invalid_request(format!("Unable to parse whitelisted audience '{allowed}'."))
        })?;
        if requested.scheme() != allowed.scheme()
            || requested.host_str() != allowed.host_str()
            || requested.port_or_known_default() != allowed.port_or_known_default()
        {
            continue;
        }
        let allowed_path = allowed.path().trim_end_matches('/');
        let path = requested.path();
        if path == allowed.path()
            || path == allowed_path
            || path.starts_with(&format!("{allowed_path}/"))
        {
            return Ok(true);
        }
    }
    Ok(false)
}
