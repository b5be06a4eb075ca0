//! JWT access tokens and ID tokens.
//!
//! Supports RS256, RS384 and ES384. Keys come from a pluggable
//! [`KeyProvider`]; tokens carry the `kid` of the key that signed them so
//! previous keys keep verifying after a rotation.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use octoauth::token::{AccessTokenClaims, JwtService, SigningKeyPair, StaticKeyProvider};
//! use octoauth::{Client, Request, Session};
//!
//! let keys = StaticKeyProvider::new(SigningKeyPair::generate_ec().unwrap());
//! let jwt = JwtService::new(Arc::new(keys), "https://auth.example.com");
//!
//! let mut request = Request::new(Client::new("app", "App"));
//! request.session = Session::new("alice");
//! let now = time::OffsetDateTime::now_utc();
//! let claims = AccessTokenClaims::for_request(jwt.issuer(), &request, now, now + time::Duration::hours(1));
//!
//! let token = jwt.encode(&claims).unwrap();
//! assert_eq!(jwt.decode::<AccessTokenClaims>(&token).unwrap().claims.sub, "alice");
//! ```

use std::fmt;
use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation, decode, decode_header,
    encode,
};
use p384::SecretKey as EcSecretKey;
use p384::ecdsa::SigningKey as EcSigningKey;
use p384::pkcs8::{DecodePrivateKey as EcDecodePrivateKey, EncodePrivateKey as EcEncodePrivateKey};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use rsa::pkcs8::{DecodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha384};
use time::OffsetDateTime;
use uuid::Uuid;

use super::opaque::HmacStrategy;
use super::{GeneratedToken, TokenKind, TokenStrategy};
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::types::Request;
use crate::AuthResult;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised while signing or verifying JWTs.
#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Failed to encode token: {0}")]
    Encoding(String),

    #[error("Failed to decode token: {0}")]
    Decoding(String),

    #[error("Token expired")]
    Expired,

    #[error("Invalid signature")]
    InvalidSignature,

    /// `iss`, `nbf` or a required claim did not check out.
    #[error("Invalid claims: {0}")]
    InvalidClaims(String),

    /// The `kid` in the header names no verification key.
    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidIssuer
            | ErrorKind::ImmatureSignature
            | ErrorKind::MissingRequiredClaim(_) => Self::InvalidClaims(err.to_string()),
            ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidKeyFormat => Self::InvalidKey(err.to_string()),
            _ => Self::Decoding(err.to_string()),
        }
    }
}

impl From<JwtError> for AuthError {
    fn from(err: JwtError) -> Self {
        match err {
            JwtError::Expired => AuthError::token_expired("The token expired."),
            JwtError::InvalidSignature => {
                AuthError::token_signature_mismatch("The token signature is invalid.")
            }
            JwtError::Encoding(_) => AuthError::server_error(err.to_string()),
            other => AuthError::invalid_token("The token could not be verified.")
                .with_debug(other.to_string()),
        }
    }
}

// ============================================================================
// Signing Algorithm
// ============================================================================

/// Algorithms a signing key may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningAlgorithm {
    RS256,
    RS384,
    ES384,
}

impl SigningAlgorithm {
    fn jwt_algorithm(self) -> Algorithm {
        match self {
            Self::RS256 => Algorithm::RS256,
            Self::RS384 => Algorithm::RS384,
            Self::ES384 => Algorithm::ES384,
        }
    }

    /// Name used in JWT headers and JWKs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::ES384 => "ES384",
        }
    }

    /// OpenID Connect `at_hash`: base64url of the left half of the digest
    /// matching this algorithm.
    #[must_use]
    pub fn half_hash(&self, value: &str) -> String {
        let digest = match self {
            Self::RS256 => Sha256::digest(value.as_bytes()).to_vec(),
            Self::RS384 | Self::ES384 => Sha384::digest(value.as_bytes()).to_vec(),
        };
        URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Token Claims
// ============================================================================

const ACCESS_TOKEN_CLAIMS: &[&str] = &[
    "iss", "sub", "aud", "exp", "iat", "nbf", "jti", "scope", "client_id",
];

const ID_TOKEN_CLAIMS: &[&str] = &[
    "iss", "sub", "aud", "exp", "iat", "jti", "auth_time", "nonce", "at_hash", "acr", "amr",
];

/// Copies session claims, skipping the names the token sets itself.
fn extra_claims(source: &Map<String, Value>, registered: &[&str]) -> Map<String, Value> {
    source
        .iter()
        .filter(|(name, _)| !registered.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Claims of a JWT access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub nbf: i64,
    pub jti: String,
    /// Granted scopes, space separated.
    pub scope: String,
    pub client_id: String,
    /// `session.extra`.
    #[serde(flatten)]
    pub ext: Map<String, Value>,
}

impl AccessTokenClaims {
    /// Claims of an access token issued for `request`. Client credentials
    /// sessions have no subject; the client stands in for it.
    #[must_use]
    pub fn for_request(
        issuer: &str,
        request: &Request,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Self {
        let session = &request.session;
        let client_id = request.client.client_id.clone();
        Self {
            iss: issuer.to_string(),
            sub: if session.subject.is_empty() {
                client_id.clone()
            } else {
                session.subject.clone()
            },
            aud: request.granted_audience.as_slice().to_vec(),
            exp: expires_at.unix_timestamp(),
            iat: issued_at.unix_timestamp(),
            nbf: issued_at.unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
            scope: request.granted_scope.join(),
            client_id,
            ext: extra_claims(&session.extra, ACCESS_TOKEN_CLAIMS),
        }
    }
}

/// Claims of an OpenID Connect ID token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    /// The client the token was issued to.
    pub aud: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub jti: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amr: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdTokenClaims {
    /// Claims of an ID token for the OpenID Connect session of `request`.
    /// `nonce` comes from the stored authorize form; `at_hash` is left for
    /// the caller.
    #[must_use]
    pub fn for_request(
        issuer: &str,
        request: &Request,
        issued_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> Self {
        let id_session = request.session.id_token.clone().unwrap_or_default();
        Self {
            iss: issuer.to_string(),
            sub: request.session.subject.clone(),
            aud: vec![request.client.client_id.clone()],
            exp: expires_at.unix_timestamp(),
            iat: issued_at.unix_timestamp(),
            jti: Uuid::new_v4().to_string(),
            auth_time: id_session.auth_time.map(OffsetDateTime::unix_timestamp),
            nonce: request.form_value("nonce").map(str::to_string),
            at_hash: None,
            acr: id_session.acr,
            amr: (!id_session.amr.is_empty()).then_some(id_session.amr),
            extra: extra_claims(&id_session.extra, ID_TOKEN_CLAIMS),
        }
    }
}

// ============================================================================
// JWKS Types
// ============================================================================

/// JSON Web Key Set served to relying parties.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Public part of a signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// `RSA` or `EC`.
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub use_: String,
    pub alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

// ============================================================================
// Signing Key Pair
// ============================================================================

/// A key that signs access and ID tokens, named by `kid`.
pub struct SigningKeyPair {
    pub kid: String,
    pub algorithm: SigningAlgorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public: PublicKey,
}

enum PublicKey {
    Rsa { n: Vec<u8>, e: Vec<u8> },
    Ec { x: Vec<u8>, y: Vec<u8> },
}

impl SigningKeyPair {
    /// Generates an ES384 key with a random `kid`.
    ///
    /// # Errors
    /// Returns an error if the generated key cannot be encoded.
    pub fn generate_ec() -> Result<Self, JwtError> {
        let secret_key = EcSecretKey::random(&mut OsRng);
        let private_pem = secret_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| JwtError::InvalidKey(e.to_string()))?;
        let encoding_key = EncodingKey::from_ec_pem(private_pem.as_bytes())?;
        let (decoding_key, public) = ec_public_key(&secret_key)?;

        Ok(Self {
            kid: Uuid::new_v4().to_string(),
            algorithm: SigningAlgorithm::ES384,
            encoding_key,
            decoding_key,
            public,
        })
    }

    /// Loads a configured key. RSA keys take a PEM private key and its SPKI
    /// public key; ES384 keys take a PKCS#8 private key and derive the
    /// public half, so `public_pem` is ignored.
    ///
    /// # Errors
    /// Returns an error if the PEM data does not match `algorithm`.
    pub fn from_pem(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        private_pem: &str,
        public_pem: &str,
    ) -> Result<Self, JwtError> {
        let (encoding_key, decoding_key, public) = match algorithm {
            SigningAlgorithm::RS256 | SigningAlgorithm::RS384 => {
                let public_key = RsaPublicKey::from_public_key_pem(public_pem)
                    .map_err(|e| JwtError::InvalidKey(e.to_string()))?;
                (
                    EncodingKey::from_rsa_pem(private_pem.as_bytes())?,
                    DecodingKey::from_rsa_pem(public_pem.as_bytes())?,
                    PublicKey::Rsa {
                        n: public_key.n().to_bytes_be(),
                        e: public_key.e().to_bytes_be(),
                    },
                )
            }
            SigningAlgorithm::ES384 => {
                let secret_key = EcSecretKey::from_pkcs8_pem(private_pem)
                    .map_err(|e| JwtError::InvalidKey(e.to_string()))?;
                let (decoding_key, public) = ec_public_key(&secret_key)?;
                (
                    EncodingKey::from_ec_pem(private_pem.as_bytes())?,
                    decoding_key,
                    public,
                )
            }
        };

        Ok(Self {
            kid: kid.into(),
            algorithm,
            encoding_key,
            decoding_key,
            public,
        })
    }

    #[must_use]
    pub fn to_jwk(&self) -> Jwk {
        let mut jwk = Jwk {
            kty: String::new(),
            kid: self.kid.clone(),
            use_: "sig".to_string(),
            alg: self.algorithm.as_str().to_string(),
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
        };
        match &self.public {
            PublicKey::Rsa { n, e } => {
                jwk.kty = "RSA".to_string();
                jwk.n = Some(URL_SAFE_NO_PAD.encode(n));
                jwk.e = Some(URL_SAFE_NO_PAD.encode(e));
            }
            PublicKey::Ec { x, y } => {
                jwk.kty = "EC".to_string();
                jwk.crv = Some("P-384".to_string());
                jwk.x = Some(URL_SAFE_NO_PAD.encode(x));
                jwk.y = Some(URL_SAFE_NO_PAD.encode(y));
            }
        }
        jwk
    }
}

fn ec_public_key(secret_key: &EcSecretKey) -> Result<(DecodingKey, PublicKey), JwtError> {
    let point = EcSigningKey::from(secret_key)
        .verifying_key()
        .to_encoded_point(false);
    let (Some(x), Some(y)) = (point.x(), point.y()) else {
        return Err(JwtError::InvalidKey("EC point is not uncompressed".to_string()));
    };
    let decoding_key = DecodingKey::from_ec_components(
        &URL_SAFE_NO_PAD.encode(x.as_slice()),
        &URL_SAFE_NO_PAD.encode(y.as_slice()),
    )?;
    Ok((
        decoding_key,
        PublicKey::Ec {
            x: x.to_vec(),
            y: y.to_vec(),
        },
    ))
}

// ============================================================================
// Key Provider
// ============================================================================

/// Source of signing and verification keys.
pub trait KeyProvider: Send + Sync {
    /// Key that signs new tokens.
    fn signing_key(&self) -> Arc<SigningKeyPair>;

    /// Key with the given id, if tokens signed by it still verify.
    fn verification_key(&self, kid: &str) -> Option<Arc<SigningKeyPair>>;

    /// Public keys of every verification key.
    fn jwks(&self) -> Jwks;
}

/// A current key plus retired keys that still verify.
pub struct StaticKeyProvider {
    current: Arc<SigningKeyPair>,
    retired: Vec<Arc<SigningKeyPair>>,
}

impl StaticKeyProvider {
    #[must_use]
    pub fn new(current: impl Into<Arc<SigningKeyPair>>) -> Self {
        Self {
            current: current.into(),
            retired: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_previous_key(mut self, key: impl Into<Arc<SigningKeyPair>>) -> Self {
        self.retired.push(key.into());
        self
    }

    fn keys(&self) -> impl Iterator<Item = &Arc<SigningKeyPair>> {
        std::iter::once(&self.current).chain(&self.retired)
    }
}

impl KeyProvider for StaticKeyProvider {
    fn signing_key(&self) -> Arc<SigningKeyPair> {
        Arc::clone(&self.current)
    }

    fn verification_key(&self, kid: &str) -> Option<Arc<SigningKeyPair>> {
        self.keys().find(|k| k.kid == kid).cloned()
    }

    fn jwks(&self) -> Jwks {
        Jwks {
            keys: self.keys().map(|k| k.to_jwk()).collect(),
        }
    }
}

// ============================================================================
// JWT Service
// ============================================================================

/// Signs and verifies the provider's JWTs. Every token carries `iss` and the
/// `kid` of the key that signed it.
#[derive(Clone)]
pub struct JwtService {
    keys: Arc<dyn KeyProvider>,
    issuer: String,
}

impl JwtService {
    #[must_use]
    pub fn new(keys: Arc<dyn KeyProvider>, issuer: impl Into<String>) -> Self {
        Self {
            keys,
            issuer: issuer.into(),
        }
    }

    /// Signs `claims` with the current key.
    ///
    /// # Errors
    /// Returns `JwtError::Encoding` if signing fails.
    pub fn encode<T: Serialize>(&self, claims: &T) -> Result<String, JwtError> {
        let key = self.keys.signing_key();
        let mut header = Header::new(key.algorithm.jwt_algorithm());
        header.kid = Some(key.kid.clone());
        encode(&header, claims, &key.encoding_key).map_err(|e| JwtError::Encoding(e.to_string()))
    }

    /// Verifies signature, issuer and expiry without leeway. `aud` is not
    /// checked; audiences are matched against the stored grant instead.
    ///
    /// # Errors
    /// Returns an error if the key is unknown or validation fails.
    pub fn decode<T: DeserializeOwned>(&self, token: &str) -> Result<TokenData<T>, JwtError> {
        let header = decode_header(token)?;
        let key = match header.kid.as_deref() {
            Some(kid) => self
                .keys
                .verification_key(kid)
                .ok_or_else(|| JwtError::UnknownKey(kid.to_string()))?,
            None => self.keys.signing_key(),
        };

        let mut validation = Validation::new(key.algorithm.jwt_algorithm());
        validation.set_issuer(&[&self.issuer]);
        validation.validate_aud = false;
        validation.leeway = 0;
        Ok(decode(token, &key.decoding_key, &validation)?)
    }

    /// Algorithm of the current signing key.
    #[must_use]
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.keys.signing_key().algorithm
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn jwks(&self) -> Jwks {
        self.keys.jwks()
    }
}

// ============================================================================
// JWT Token Strategy
// ============================================================================

/// Issues JWT access tokens. Authorization codes and refresh tokens stay
/// opaque and are delegated to an [`HmacStrategy`].
pub struct JwtStrategy {
    jwt: JwtService,
    opaque: HmacStrategy,
    config: Arc<AuthConfig>,
}

impl JwtStrategy {
    #[must_use]
    pub fn new(jwt: JwtService, opaque: HmacStrategy, config: Arc<AuthConfig>) -> Self {
        Self {
            jwt,
            opaque,
            config,
        }
    }
}

impl TokenStrategy for JwtStrategy {
    /// The JWS signature segment of an access token.
    fn signature(&self, kind: TokenKind, token: &str) -> String {
        if kind != TokenKind::AccessToken {
            return self.opaque.signature(kind, token);
        }
        match token.split('.').collect::<Vec<_>>().as_slice() {
            [_, _, signature] => (*signature).to_string(),
            _ => String::new(),
        }
    }

    fn generate(&self, kind: TokenKind, request: &Request) -> AuthResult<GeneratedToken> {
        if kind != TokenKind::AccessToken {
            return self.opaque.generate(kind, request);
        }

        let now = OffsetDateTime::now_utc();
        let expires_at = request
            .session
            .expires_at(TokenKind::AccessToken)
            .unwrap_or_else(|| now + self.config.oauth.lifetime(TokenKind::AccessToken));
        let claims = AccessTokenClaims::for_request(self.jwt.issuer(), request, now, expires_at);

        let token = self.jwt.encode(&claims)?;
        let signature = self.signature(kind, &token);
        Ok(GeneratedToken { token, signature })
    }

    fn validate(&self, kind: TokenKind, request: &Request, token: &str) -> AuthResult<()> {
        if kind != TokenKind::AccessToken {
            return self.opaque.validate(kind, request, token);
        }
        self.jwt.decode::<AccessTokenClaims>(token)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
