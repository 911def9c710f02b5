//! Signing and verification of client-held tokens.
//!
//! Client tokens are HS256 JWTs signed with a per-cluster secret shared by
//! every worker. Any worker can therefore verify a token minted by another
//! one, which is what lets a client reconnect to a different worker and keep
//! its identity.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing (DoS prevention)
//! - Only HS256 is accepted; the header algorithm is never trusted
//! - Expiry is NOT checked here: token payloads carry `expire`, not the
//!   registered `exp` claim, and the worker checks it after decoding
//! - Error messages are generic; detail is logged at debug level

use crate::secret::{ExposeSecret, SecretString, REDACTED};
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Maximum accepted size of a signed token (8KB).
///
/// Checked before base64 decoding and signature verification.
pub const MAX_TOKEN_SIZE_BYTES: usize = 8192;

/// Minimum signing secret length for HMAC-SHA256 (32 bytes).
pub const MIN_SIGNING_SECRET_BYTES: usize = 32;

/// Errors raised while signing or verifying a token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    /// Token size exceeds maximum allowed.
    #[error("The token is invalid")]
    TokenTooLarge,

    /// Token is not a well-formed JWT or its claims do not decode.
    #[error("The token is invalid")]
    MalformedToken,

    /// Signature does not match the cluster secret.
    #[error("The token is invalid")]
    InvalidSignature,

    /// Secret shorter than [`MIN_SIGNING_SECRET_BYTES`].
    #[error("Signing secret must be at least {MIN_SIGNING_SECRET_BYTES} bytes")]
    WeakSecret,

    /// Claims could not be encoded.
    #[error("Token encoding failed: {0}")]
    Encoding(String),
}

/// HS256 signer/verifier for client tokens.
#[derive(Clone)]
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner")
            .field("algorithm", &"HS256")
            .field("secret", &REDACTED)
            .finish()
    }
}

impl TokenSigner {
    /// Create a signer from the shared cluster secret.
    ///
    /// # Errors
    ///
    /// Returns `SigningError::WeakSecret` if the secret is shorter than
    /// [`MIN_SIGNING_SECRET_BYTES`].
    pub fn new(secret: &SecretString) -> Result<Self, SigningError> {
        let bytes = secret.expose_secret().as_bytes();
        if bytes.len() < MIN_SIGNING_SECRET_BYTES {
            return Err(SigningError::WeakSecret);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(bytes),
            decoding_key: DecodingKey::from_secret(bytes),
            validation,
        })
    }

    /// Sign the given claims.
    ///
    /// # Errors
    ///
    /// Returns `SigningError::Encoding` if the claims cannot be serialized.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, SigningError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| SigningError::Encoding(e.to_string()))
    }

    /// Verify a signed token and decode its claims.
    ///
    /// # Errors
    ///
    /// - `TokenTooLarge` - token exceeds [`MAX_TOKEN_SIZE_BYTES`]
    /// - `InvalidSignature` - signature does not verify
    /// - `MalformedToken` - anything else (structure, base64, JSON, claim shape)
    pub fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T, SigningError> {
        if token.len() > MAX_TOKEN_SIZE_BYTES {
            tracing::debug!(
                target: "common.jwt",
                token_size = token.len(),
                max_size = MAX_TOKEN_SIZE_BYTES,
                "Token rejected: size exceeds maximum allowed"
            );
            return Err(SigningError::TokenTooLarge);
        }

        jsonwebtoken::decode::<T>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(target: "common.jwt", error = %e, "Token rejected");
                match e.kind() {
                    ErrorKind::InvalidSignature => SigningError::InvalidSignature,
                    _ => SigningError::MalformedToken,
                }
            })
    }
}

/// Current time as unix seconds.
#[must_use]
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
