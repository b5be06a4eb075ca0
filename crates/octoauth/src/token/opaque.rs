//! Opaque HMAC tokens.
//!
//! Token layout: `base64url(key) "." base64url(signature)` where `key` is
//! `entropy` random bytes followed by the 16 bytes of the request id and
//! `signature = HMAC-SHA512/256(secret[..64], key)`. The second segment is
//! the storage lookup signature.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha512_256;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::{GeneratedToken, TokenKind, TokenStrategy};
use crate::config::{AuthConfig, ConfigError, MIN_SECRET_BYTES};
use crate::error::AuthError;
use crate::types::Request;
use crate::AuthResult;

type HmacSha512_256 = Hmac<Sha512_256>;

/// Generates and validates opaque HMAC tokens.
pub struct HmacStrategy {
    config: Arc<AuthConfig>,
    secret: Vec<u8>,
    rotated_secrets: Vec<Vec<u8>>,
}

impl HmacStrategy {
    /// Creates a strategy from `config.tokens`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if any secret is shorter than 64
    /// bytes.
    pub fn new(config: Arc<AuthConfig>) -> Result<Self, ConfigError> {
        let secret = signing_key(config.tokens.secret.as_bytes())?;
        let rotated_secrets = config
            .tokens
            .rotated_secrets
            .iter()
            .map(|s| signing_key(s.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            config,
            secret,
            rotated_secrets,
        })
    }

    fn entropy(&self) -> usize {
        self.config.tokens.entropy.max(MIN_SECRET_BYTES)
    }

    fn sign(secret: &[u8], key: &[u8]) -> AuthResult<Vec<u8>> {
        let mut mac = HmacSha512_256::new_from_slice(secret)
            .map_err(|e| AuthError::server_error(format!("invalid HMAC key: {e}")))?;
        mac.update(key);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(secret: &[u8], key: &[u8], signature: &[u8]) -> bool {
        match HmacSha512_256::new_from_slice(secret) {
            Ok(mut mac) => {
                mac.update(key);
                mac.verify_slice(signature).is_ok()
            }
            Err(_) => false,
        }
    }

    fn expires_at(&self, kind: TokenKind, request: &Request) -> OffsetDateTime {
        request
            .session
            .expires_at(kind)
            .unwrap_or_else(|| request.requested_at + self.config.oauth.lifetime(kind))
    }
}

fn signing_key(secret: &[u8]) -> Result<Vec<u8>, ConfigError> {
    if secret.len() < MIN_SECRET_BYTES {
        return Err(ConfigError::InvalidValue(format!(
            "HMAC secret must be at least {MIN_SECRET_BYTES} bytes long"
        )));
    }
    Ok(secret[..MIN_SECRET_BYTES].to_vec())
}

impl TokenStrategy for HmacStrategy {
    fn signature(&self, _kind: TokenKind, token: &str) -> String {
        match token.split_once('.') {
            Some((_, signature)) => signature.to_string(),
            None => String::new(),
        }
    }

    fn generate(&self, _kind: TokenKind, request: &Request) -> AuthResult<GeneratedToken> {
        let mut key = vec![0u8; self.entropy()];
        rand::thread_rng().fill_bytes(&mut key);
        key.extend_from_slice(request.id.as_bytes());

        let signature = URL_SAFE_NO_PAD.encode(Self::sign(&self.secret, &key)?);
        let token = format!("{}.{}", URL_SAFE_NO_PAD.encode(&key), signature);

        Ok(GeneratedToken { token, signature })
    }

    fn validate(&self, kind: TokenKind, request: &Request, token: &str) -> AuthResult<()> {
        let expires_at = self.expires_at(kind, request);
        if expires_at < OffsetDateTime::now_utc() {
            let at = expires_at.format(&Rfc3339).unwrap_or_default();
            return Err(AuthError::token_expired(format!(
                "The {kind} expired at {at}."
            )));
        }

        let mut parts = token.split('.');
        let (key, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(key), Some(signature), None) if !key.is_empty() && !signature.is_empty() => {
                (key, signature)
            }
            _ => {
                return Err(AuthError::invalid_token(
                    "The token must consist of a key and a signature separated by a single dot.",
                ));
            }
        };

        let mismatch = || AuthError::token_signature_mismatch("The token signature is invalid.");
        let key = URL_SAFE_NO_PAD
            .decode(key)
            .map_err(|e| mismatch().with_debug(format!("token key is not base64url: {e}")))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| mismatch().with_debug(format!("token signature is not base64url: {e}")))?;

        let verified = std::iter::once(&self.secret)
            .chain(self.rotated_secrets.iter())
            .any(|secret| Self::verify(secret, &key, &signature));
        if verified { Ok(()) } else { Err(mismatch()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::types::Client;

    const SECRET: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";
    const OLD_SECRET: &str = "fedcba9876543210fedcba9876543210fedcba9876543210fedcba9876543210";

    fn config() -> AuthConfig {
        let mut config = AuthConfig::default();
        config.tokens.secret = SECRET.to_string();
        config
    }

    fn strategy() -> HmacStrategy {
        HmacStrategy::new(Arc::new(config())).unwrap()
    }

    fn request() -> Request {
        Request::new(Client::new("c", "C"))
    }

    fn mutate_at(segment: &str, idx: usize) -> String {
        let mut chars: Vec<char> = segment.chars().collect();
        chars[idx] = if chars[idx] == 'A' { 'B' } else { 'A' };
        chars.into_iter().collect()
    }

    #[test]
    fn test_round_trip_and_stable_signature() {
        let strategy = strategy();
        let request = request();
        for kind in [
            TokenKind::AuthorizeCode,
            TokenKind::AccessToken,
            TokenKind::RefreshToken,
        ] {
            let generated = strategy.generate(kind, &request).unwrap();
            assert!(strategy.validate(kind, &request, &generated.token).is_ok());
            assert_eq!(strategy.signature(kind, &generated.token), generated.signature);
            assert_eq!(strategy.signature(kind, &generated.token), generated.signature);
        }
    }

    #[test]
    fn test_key_embeds_request_id() {
        let strategy = strategy();
        let request = request();
        let generated = strategy.generate(TokenKind::AccessToken, &request).unwrap();
        let (key, _) = generated.token.split_once('.').unwrap();
        let key = URL_SAFE_NO_PAD.decode(key).unwrap();
        assert_eq!(key.len(), 64 + 16);
        assert_eq!(&key[64..], request.id.as_bytes());
    }

    #[test]
    fn test_tokens_are_unique() {
        let strategy = strategy();
        let request = request();
        let a = strategy.generate(TokenKind::AccessToken, &request).unwrap();
        let b = strategy.generate(TokenKind::AccessToken, &request).unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn test_mutation_is_signature_mismatch() {
        let strategy = strategy();
        let request = request();
        let token = strategy
            .generate(TokenKind::AccessToken, &request)
            .unwrap()
            .token;
        let (key, signature) = token.split_once('.').unwrap();

        for idx in [0, 10, 30] {
            let bad_key = format!("{}.{}", mutate_at(key, idx), signature);
            let err = strategy
                .validate(TokenKind::AccessToken, &request, &bad_key)
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::TokenSignatureMismatch);

            let bad_sig = format!("{}.{}", key, mutate_at(signature, idx));
            let err = strategy
                .validate(TokenKind::AccessToken, &request, &bad_sig)
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::TokenSignatureMismatch);
        }
    }

    #[test]
    fn test_expired_token() {
        let strategy = strategy();
        let mut request = request();
        let token = strategy
            .generate(TokenKind::AccessToken, &request)
            .unwrap()
            .token;
        request.session.set_expires_at(
            TokenKind::AccessToken,
            OffsetDateTime::now_utc() - time::Duration::hours(1),
        );
        let err = strategy
            .validate(TokenKind::AccessToken, &request, &token)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenExpired);
    }

    #[test]
    fn test_expiry_falls_back_to_lifetime() {
        let strategy = strategy();
        let mut request = request();
        let token = strategy
            .generate(TokenKind::AuthorizeCode, &request)
            .unwrap()
            .token;
        request.requested_at = OffsetDateTime::now_utc() - time::Duration::minutes(11);
        let err = strategy
            .validate(TokenKind::AuthorizeCode, &request, &token)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenExpired);
        // the access token lifetime is an hour, so the same request still
        // accepts access tokens
        let token = strategy
            .generate(TokenKind::AccessToken, &request)
            .unwrap()
            .token;
        assert!(strategy.validate(TokenKind::AccessToken, &request, &token).is_ok());
    }

    #[test]
    fn test_malformed_tokens() {
        let strategy = strategy();
        let request = request();
        for token in ["", "abc", "abc.", ".abc", "a.b.c"] {
            let err = strategy
                .validate(TokenKind::AccessToken, &request, token)
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidToken, "{token:?}");
        }
        assert_eq!(strategy.signature(TokenKind::AccessToken, "abc"), "");
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut config = config();
        config.tokens.secret = "too-short".to_string();
        assert!(HmacStrategy::new(Arc::new(config)).is_err());
    }

    #[test]
    fn test_rotated_secret_still_validates() {
        let mut old = config();
        old.tokens.secret = OLD_SECRET.to_string();
        let old = HmacStrategy::new(Arc::new(old)).unwrap();
        let request = request();
        let token = old.generate(TokenKind::RefreshToken, &request).unwrap().token;

        let mut rotated = config();
        rotated.tokens.rotated_secrets = vec![OLD_SECRET.to_string()];
        let rotated = HmacStrategy::new(Arc::new(rotated)).unwrap();
        assert!(rotated.validate(TokenKind::RefreshToken, &request, &token).is_ok());

        let err = strategy()
            .validate(TokenKind::RefreshToken, &request, &token)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TokenSignatureMismatch);
    }
}
