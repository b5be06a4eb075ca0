//! Flow challenge and verifier encoding.
//!
//! `encode`: MessagePack, zlib (best compression), AES-256-GCM with the
//! purpose as associated data, base64url. The random nonce is prepended to
//! the ciphertext. Every decode failure is reported as [`FlowError::Invalid`].

use std::fmt;
use std::io::{Read, Write};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{Flow, FlowError};
use crate::error::AuthError;
use crate::AuthResult;

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Upper bound for a decompressed flow.
const MAX_FLOW_BYTES: u64 = 64 * 1024;

/// What an encoded flow may be used for. Bound as associated data, so a
/// login challenge does not decode as a consent verifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowPurpose {
    LoginChallenge,
    LoginVerifier,
    ConsentChallenge,
    ConsentVerifier,
}

impl FlowPurpose {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginChallenge => "login_challenge",
            Self::LoginVerifier => "login_verifier",
            Self::ConsentChallenge => "consent_challenge",
            Self::ConsentVerifier => "consent_verifier",
        }
    }
}

impl fmt::Display for FlowPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypts flows into opaque URL-safe strings.
#[derive(Clone)]
pub struct FlowCodec {
    cipher: Aes256Gcm,
}

impl FlowCodec {
    /// Derives the AES key from `secret` with SHA-256.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let key = Sha256::digest(secret);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Encodes `flow` for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns `server_error` if serialization or encryption fails.
    pub fn encode(&self, flow: &Flow, purpose: FlowPurpose) -> AuthResult<String> {
        let packed = rmp_serde::to_vec_named(flow)
            .map_err(|e| AuthError::server_error(format!("flow serialization failed: {e}")))?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder
            .write_all(&packed)
            .map_err(|e| AuthError::server_error(format!("flow compression failed: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| AuthError::server_error(format!("flow compression failed: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &compressed,
                    aad: purpose.as_str().as_bytes(),
                },
            )
            .map_err(|e| AuthError::server_error(format!("flow encryption failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    /// Decodes a flow encoded for `purpose`.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Invalid`] for any malformed, tampered or
    /// mis-purposed input.
    pub fn decode(&self, encoded: &str, purpose: FlowPurpose) -> Result<Flow, FlowError> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| FlowError::Invalid)?;
        if raw.len() <= NONCE_SIZE {
            return Err(FlowError::Invalid);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);

        let compressed = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: purpose.as_str().as_bytes(),
                },
            )
            .map_err(|_| FlowError::Invalid)?;

        let mut packed = Vec::new();
        ZlibDecoder::new(compressed.as_slice())
            .take(MAX_FLOW_BYTES + 1)
            .read_to_end(&mut packed)
            .map_err(|_| FlowError::Invalid)?;
        if packed.len() as u64 > MAX_FLOW_BYTES {
            return Err(FlowError::Invalid);
        }

        rmp_serde::from_slice(&packed).map_err(|_| FlowError::Invalid)
    }
}

impl fmt::Debug for FlowCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowCodec").finish_non_exhaustive()
    }
}
