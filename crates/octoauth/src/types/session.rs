//! Per-request session data carried from authorization to token issuance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::token::TokenKind;

/// Session attached to a request and persisted with every token row.
///
/// `Clone` is a deep copy: the expiry map and claim maps are duplicated,
/// so a clone can be modified without affecting the original.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Subject (end-user id, or client id for client credentials).
    pub subject: String,

    /// Display username, reported by introspection.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// Explicit expiry per token kind.
    #[serde(default)]
    pub expires_at: BTreeMap<TokenKind, OffsetDateTime>,

    /// Extra claims placed into access tokens.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,

    /// OpenID Connect claims, present once the session has been granted by
    /// an OpenID Connect flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<IdTokenSession>,
}

impl Session {
    /// Creates a session for `subject`.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    /// Sets the username.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Attaches OpenID Connect claims.
    #[must_use]
    pub fn with_id_token(mut self, id_token: IdTokenSession) -> Self {
        self.id_token = Some(id_token);
        self
    }

    /// Records the expiry of a token kind (truncated to whole seconds).
    pub fn set_expires_at(&mut self, kind: TokenKind, at: OffsetDateTime) {
        let at = at.replace_nanosecond(0).unwrap_or(at);
        self.expires_at.insert(kind, at);
    }

    /// Returns the recorded expiry of a token kind.
    #[must_use]
    pub fn expires_at(&self, kind: TokenKind) -> Option<OffsetDateTime> {
        self.expires_at.get(&kind).copied()
    }
}

/// OpenID Connect part of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdTokenSession {
    /// Time the end-user authenticated.
    #[serde(default, with = "time::serde::timestamp::option")]
    pub auth_time: Option<OffsetDateTime>,

    /// Authentication context class reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,

    /// Authentication methods references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub amr: Vec<String>,

    /// Extra claims placed into the ID token.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clone_is_deep() {
        let mut original = Session::new("alice");
        original.set_expires_at(TokenKind::AccessToken, OffsetDateTime::now_utc());
        original.extra.insert("tenant".to_string(), json!("a"));

        let mut copy = original.clone();
        copy.expires_at.clear();
        copy.extra.insert("tenant".to_string(), json!("b"));

        assert!(original.expires_at(TokenKind::AccessToken).is_some());
        assert_eq!(original.extra["tenant"], "a");
    }

    #[test]
    fn test_expiry_is_truncated_to_seconds() {
        let mut session = Session::default();
        let at = OffsetDateTime::now_utc();
        session.set_expires_at(TokenKind::RefreshToken, at);
        assert_eq!(session.expires_at(TokenKind::RefreshToken).unwrap().nanosecond(), 0);
        assert!(session.expires_at(TokenKind::AuthorizeCode).is_none());
    }

    #[test]
    fn test_json_round_trip() {
        let mut session = Session::new("alice").with_id_token(IdTokenSession {
            auth_time: Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()),
            amr: vec!["pwd".to_string()],
            ..Default::default()
        });
        session.set_expires_at(
            TokenKind::AccessToken,
            OffsetDateTime::from_unix_timestamp(1_700_003_600).unwrap(),
        );

        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}
